//! ULID-backed identifiers
//!
//! ULIDs sort by creation time, which keeps audit records ordered and lets
//! retention pruning read a record's age from its id alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generate a fresh id
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Creation time encoded in the id
            #[must_use]
            pub fn created_at(&self) -> DateTime<Utc> {
                DateTime::<Utc>::from(self.0.datetime())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(s).map(Self)
            }
        }
    };
}

ulid_id!(
    /// Inconsistency id
    InconsistencyId
);
ulid_id!(
    /// Recovery attempt id
    AttemptId
);
ulid_id!(
    /// Transaction id
    TransactionId
);
ulid_id!(
    /// Escalation id
    EscalationId
);
