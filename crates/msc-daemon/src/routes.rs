//! HTTP operational interface
//!
//! - `GET /consistency/status`: status document as JSON
//! - `POST /consistency/recover/{id}`: force out-of-cycle recovery; the
//!   request is accepted and recovery runs in the background

use msc_core::{ConsistencyError, ConsistencyService, InconsistencyId, RecoveryOutcome};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Every operational route
pub fn routes(
    service: Arc<ConsistencyService>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    status(Arc::clone(&service)).or(recover(service))
}

/// `GET /consistency/status`
pub fn status(
    service: Arc<ConsistencyService>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("consistency" / "status")
        .and(warp::get())
        .and(with_service(service))
        .map(|service: Arc<ConsistencyService>| warp::reply::json(&service.status()))
}

/// `POST /consistency/recover/{id}`
pub fn recover(
    service: Arc<ConsistencyService>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("consistency" / "recover" / String)
        .and(warp::post())
        .and(with_service(service))
        .map(trigger_recovery)
}

fn with_service(
    service: Arc<ConsistencyService>,
) -> impl Filter<Extract = (Arc<ConsistencyService>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&service))
}

fn trigger_recovery(raw: String, service: Arc<ConsistencyService>) -> warp::reply::WithStatus<warp::reply::Json> {
    let Ok(id) = raw.parse::<InconsistencyId>() else {
        return error_reply(&ConsistencyError::UnknownInconsistency(raw));
    };
    if let Err(err) = service.recoverable(id) {
        return error_reply(&err);
    }

    tokio::spawn(async move {
        match service.recover(id).await {
            Ok(reports) => {
                let recovered = reports
                    .iter()
                    .all(|report| report.outcome == RecoveryOutcome::Recovered);
                info!(inconsistency = %id, targets = reports.len(), recovered, "forced recovery finished");
            }
            Err(err) => warn!(inconsistency = %id, %err, "forced recovery failed"),
        }
    });

    warp::reply::with_status(
        warp::reply::json(&json!({ "inconsistency": id, "status": "accepted" })),
        StatusCode::ACCEPTED,
    )
}

fn error_reply(err: &ConsistencyError) -> warp::reply::WithStatus<warp::reply::Json> {
    let code = match err {
        ConsistencyError::UnknownInconsistency(_) => StatusCode::NOT_FOUND,
        ConsistencyError::StaleInconsistency(_) => StatusCode::CONFLICT,
        ConsistencyError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warp::reply::with_status(warp::reply::json(&json!({ "error": err.to_string() })), code)
}
