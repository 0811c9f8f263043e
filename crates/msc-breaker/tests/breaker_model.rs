//! Model-based property tests for the circuit breaker state machine

use msc_breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use proptest::prelude::*;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
enum Step {
    Succeed,
    Fail,
    Advance(u64),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Succeed),
        4 => Just(Step::Fail),
        2 => (1u64..40).prop_map(Step::Advance),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Model {
    Closed(u32),
    Open(u64),
}

const TIMEOUT: u64 = 30;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn breaker_follows_reference_model(
        threshold in 1u32..6,
        steps in prop::collection::vec(step(), 1..80),
    ) {
        let cb = CircuitBreaker::new(
            "metadata",
            BreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_recovery_timeout(Duration::from_secs(TIMEOUT)),
        );
        let origin = Instant::now();
        let mut clock = 0u64;
        let mut model = Model::Closed(0);

        for step in steps {
            let now = origin + Duration::from_secs(clock);
            let success = match step {
                Step::Advance(secs) => {
                    clock += secs;
                    continue;
                }
                Step::Succeed => true,
                Step::Fail => false,
            };

            let admitted = cb.try_acquire(now);
            let expect_admit = match model {
                Model::Closed(_) => true,
                Model::Open(since) => clock - since >= TIMEOUT,
            };
            prop_assert_eq!(admitted.is_ok(), expect_admit);

            if let Ok(permit) = admitted {
                prop_assert_eq!(permit.is_trial(), matches!(model, Model::Open(_)));
                if success {
                    permit.succeed();
                    model = Model::Closed(0);
                } else {
                    permit.fail(now);
                    model = match model {
                        Model::Closed(n) if n + 1 >= threshold => Model::Open(clock),
                        Model::Closed(n) => Model::Closed(n + 1),
                        Model::Open(_) => Model::Open(clock),
                    };
                }
            }

            match model {
                Model::Closed(n) => {
                    prop_assert_eq!(cb.state(), BreakerState::Closed);
                    prop_assert_eq!(cb.failure_count(), n);
                    prop_assert!(cb.failure_count() < threshold);
                }
                Model::Open(_) => prop_assert_eq!(cb.state(), BreakerState::Open),
            }
        }
    }

    #[test]
    fn open_state_rejects_until_timeout(threshold in 1u32..6, wait in 0u64..TIMEOUT) {
        let cb = CircuitBreaker::new(
            "identity",
            BreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_recovery_timeout(Duration::from_secs(TIMEOUT)),
        );
        let start = Instant::now();
        for _ in 0..threshold {
            cb.try_acquire(start).unwrap().fail(start);
        }
        prop_assert_eq!(cb.state(), BreakerState::Open);
        prop_assert!(cb.try_acquire(start + Duration::from_secs(wait)).is_err());
        prop_assert!(cb.try_acquire(start + Duration::from_secs(TIMEOUT)).is_ok());
    }
}
