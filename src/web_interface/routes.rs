use bytes::Bytes;
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;
use warp::{http::StatusCode, reply, reply::Response, Filter, Rejection, Reply};

use super::types::*;
use crate::alerting::sns::{classify, SnsEnvelope, SnsOutcome};
use crate::alerting::types::AlertPayload;
use crate::alerting::IngestionPipeline;
use crate::deployment::DeploymentExecutor;
use crate::error_handling::types::{AlertError, DeployError, StorageError, TailError};
use crate::session_management::{TailRequest, TailSessionManager, TailSink};

pub const SNS_MESSAGE_TYPE_HEADER: &str = "x-amz-sns-message-type";

fn with<T: Clone + Send + Sync>(
    value: T,
) -> impl Filter<Extract = (T,), Error = Infallible> + Clone {
    warp::any().map(move || value.clone())
}

pub fn json_reply<T: Serialize>(body: &T, status: StatusCode) -> Response {
    reply::with_status(reply::json(body), status).into_response()
}

pub fn error_reply(message: impl Into<String>, status: StatusCode) -> Response {
    json_reply(
        &ApiError {
            message: message.into(),
        },
        status,
    )
}

/// Decodes a JSON body, or the 400 answer to send back.
pub fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response> {
    serde_json::from_slice(body)
        .map_err(|e| error_reply(format!("Invalid JSON body: {}", e), StatusCode::BAD_REQUEST))
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw)
        .map_err(|_| error_reply(format!("Invalid {} id", what), StatusCode::BAD_REQUEST))
}

pub fn storage_error_status(err: &StorageError) -> StatusCode {
    match err {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::Conflict(_) | StorageError::Immutable(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn alert_error_status(err: &AlertError) -> StatusCode {
    match err {
        AlertError::Validation(_) => StatusCode::BAD_REQUEST,
        AlertError::NotFound(_) => StatusCode::NOT_FOUND,
        AlertError::Storage(e) => storage_error_status(e),
    }
}

pub fn deploy_error_status(err: &DeployError) -> StatusCode {
    match err {
        DeployError::Validation(_) => StatusCode::BAD_REQUEST,
        DeployError::InProgress(_) => StatusCode::CONFLICT,
        DeployError::NotFound(_) => StatusCode::NOT_FOUND,
        DeployError::Storage(e) => storage_error_status(e),
        DeployError::External(_) => StatusCode::BAD_GATEWAY,
    }
}

pub fn tail_error_status(err: &TailError) -> StatusCode {
    match err {
        TailError::Validation(_) => StatusCode::BAD_REQUEST,
        TailError::AlreadyRunning(_) => StatusCode::CONFLICT,
        TailError::NotFound(_) => StatusCode::NOT_FOUND,
    }
}

fn storage_failure(err: StorageError) -> Response {
    error_reply(err.to_string(), storage_error_status(&err))
}

/// GET /health
pub fn health_route() -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| json_reply(&StatusMessage::new("ok"), StatusCode::OK))
}

/// POST /alert and POST /webhook/alert
pub fn ingest_alert_route(
    pipeline: Arc<IngestionPipeline>,
    max_body_bytes: u64,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("alert")
        .and(warp::path::end())
        .or(warp::path!("webhook" / "alert"))
        .unify()
        .and(warp::post())
        .and(warp::body::content_length_limit(max_body_bytes))
        .and(warp::body::bytes())
        .and(with(pipeline))
        .and_then(|body: Bytes, pipeline: Arc<IngestionPipeline>| async move {
            let payload: AlertPayload = match parse_body(&body) {
                Ok(payload) => payload,
                Err(res) => return Ok::<_, Rejection>(res),
            };
            Ok::<_, Rejection>(ingest(&pipeline, payload).await)
        })
}

async fn ingest(pipeline: &IngestionPipeline, payload: AlertPayload) -> Response {
    match pipeline.ingest(payload).await {
        Ok(record) => json_reply(&IngestResponse::from(&record), StatusCode::CREATED),
        Err(e) => {
            warn!("Alert rejected: {}", e);
            error_reply(e.to_string(), alert_error_status(&e))
        }
    }
}

/// POST /webhook/sns
pub fn sns_route(
    pipeline: Arc<IngestionPipeline>,
    max_body_bytes: u64,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("webhook" / "sns")
        .and(warp::post())
        .and(warp::header::optional::<String>(SNS_MESSAGE_TYPE_HEADER))
        .and(warp::body::content_length_limit(max_body_bytes))
        .and(warp::body::bytes())
        .and(with(pipeline))
        .and_then(
            |message_type: Option<String>, body: Bytes, pipeline: Arc<IngestionPipeline>| async move {
                let envelope: SnsEnvelope = match parse_body(&body) {
                    Ok(envelope) => envelope,
                    Err(res) => return Ok::<_, Rejection>(res),
                };
                let res = match classify(message_type.as_deref(), envelope) {
                    SnsOutcome::SubscriptionPending => {
                        info!("SNS subscription confirmation received");
                        json_reply(&StatusMessage::new("subscription pending"), StatusCode::OK)
                    }
                    SnsOutcome::Ignored => {
                        json_reply(&StatusMessage::new("ignored"), StatusCode::OK)
                    }
                    SnsOutcome::Alert(payload) => ingest(&pipeline, payload).await,
                };
                Ok::<_, Rejection>(res)
            },
        )
}

/// GET /alerts
pub fn list_alerts_route(
    pipeline: Arc<IngestionPipeline>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("alerts")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<AlertListQuery>())
        .and(with(pipeline))
        .and_then(|query: AlertListQuery, pipeline: Arc<IngestionPipeline>| async move {
            let res = match pipeline.store().list(&query.into_filter()).await {
                Ok(list) => json_reply(&list, StatusCode::OK),
                Err(e) => storage_failure(e),
            };
            Ok::<_, Rejection>(res)
        })
}

/// GET /alerts/:id
pub fn get_alert_route(
    pipeline: Arc<IngestionPipeline>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("alerts" / String)
        .and(warp::get())
        .and(with(pipeline))
        .and_then(|id_str: String, pipeline: Arc<IngestionPipeline>| async move {
            let id = match parse_id(&id_str, "alert") {
                Ok(id) => id,
                Err(res) => return Ok::<_, Rejection>(res),
            };
            let res = match pipeline.store().get(id).await {
                Ok(Some(record)) => json_reply(&record, StatusCode::OK),
                Ok(None) => error_reply("Alert not found", StatusCode::NOT_FOUND),
                Err(e) => storage_failure(e),
            };
            Ok::<_, Rejection>(res)
        })
}

/// POST /alerts/:id/ack
pub fn acknowledge_alert_route(
    pipeline: Arc<IngestionPipeline>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("alerts" / String / "ack")
        .and(warp::post())
        .and(warp::body::content_length_limit(16 * 1024))
        .and(warp::body::bytes())
        .and(with(pipeline))
        .and_then(
            |id_str: String, body: Bytes, pipeline: Arc<IngestionPipeline>| async move {
                let (id, ack) = match parse_id(&id_str, "alert")
                    .and_then(|id| parse_body::<AckBody>(&body).map(|ack| (id, ack)))
                {
                    Ok(parsed) => parsed,
                    Err(res) => return Ok::<_, Rejection>(res),
                };
                let res = match pipeline.store().acknowledge(id, ack.by.trim()).await {
                    Ok(record) => json_reply(&record, StatusCode::OK),
                    Err(e) => storage_failure(e),
                };
                Ok::<_, Rejection>(res)
            },
        )
}

/// GET /deployments
pub fn list_deployments_route(
    executor: Arc<DeploymentExecutor>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("deployments")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<LimitQuery>())
        .and(with(executor))
        .and_then(|query: LimitQuery, executor: Arc<DeploymentExecutor>| async move {
            let res = match executor.history(clamp_limit(query.limit)).await {
                Ok(list) => json_reply(&list, StatusCode::OK),
                Err(e) => error_reply(e.to_string(), deploy_error_status(&e)),
            };
            Ok::<_, Rejection>(res)
        })
}

/// GET /deployments/status
pub fn deployment_status_route(
    executor: Arc<DeploymentExecutor>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("deployments" / "status")
        .and(warp::get())
        .and(with(executor))
        .and_then(|executor: Arc<DeploymentExecutor>| async move {
            let res = match executor.status().await {
                Ok(report) => json_reply(&report, StatusCode::OK),
                Err(e) => error_reply(e.to_string(), deploy_error_status(&e)),
            };
            Ok::<_, Rejection>(res)
        })
}

/// GET /deployments/:id
pub fn get_deployment_route(
    executor: Arc<DeploymentExecutor>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("deployments" / String)
        .and(warp::get())
        .and(with(executor))
        .and_then(|id_str: String, executor: Arc<DeploymentExecutor>| async move {
            let id = match parse_id(&id_str, "deployment") {
                Ok(id) => id,
                Err(res) => return Ok::<_, Rejection>(res),
            };
            let res = match executor.get(id).await {
                Ok(record) => json_reply(&record, StatusCode::OK),
                Err(e) => error_reply(e.to_string(), deploy_error_status(&e)),
            };
            Ok::<_, Rejection>(res)
        })
}

/// POST /deployments
///
/// Answers once the deployment is queued; the run itself continues in the background.
pub fn trigger_deployment_route(
    executor: Arc<DeploymentExecutor>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("deployments")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(16 * 1024))
        .and(warp::body::bytes())
        .and(with(executor))
        .and_then(|body: Bytes, executor: Arc<DeploymentExecutor>| async move {
            let request = match parse_body::<DeployBody>(&body)
                .and_then(|b| b.into_request().map_err(|e| error_reply(e, StatusCode::BAD_REQUEST)))
            {
                Ok(request) => request,
                Err(res) => return Ok::<_, Rejection>(res),
            };
            let ticket = match executor.accept(request).await {
                Ok(ticket) => ticket,
                Err(e) => {
                    return Ok::<_, Rejection>(error_reply(e.to_string(), deploy_error_status(&e)))
                }
            };
            let res = json_reply(ticket.record(), StatusCode::ACCEPTED);
            tokio::spawn(async move {
                if let Err(e) = executor.execute(ticket).await {
                    error!("Deployment could not be completed: {}", e);
                }
            });
            Ok::<_, Rejection>(res)
        })
}

/// POST /tail
pub fn start_tail_route(
    tails: Arc<TailSessionManager>,
    sink: Arc<dyn TailSink>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("tail")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(16 * 1024))
        .and(warp::body::bytes())
        .and(with(tails))
        .and(with(sink))
        .and_then(
            |body: Bytes, tails: Arc<TailSessionManager>, sink: Arc<dyn TailSink>| async move {
                let request: TailRequest = match parse_body(&body) {
                    Ok(request) => request,
                    Err(res) => return Ok::<_, Rejection>(res),
                };
                let res = match tails.start(request.key(), request.duration(), sink) {
                    Ok(handle) => json_reply(&TailStarted::from(&handle), StatusCode::CREATED),
                    Err(e) => error_reply(e.to_string(), tail_error_status(&e)),
                };
                Ok::<_, Rejection>(res)
            },
        )
}

/// DELETE /tail?source=..&filter=..
pub fn stop_tail_route(
    tails: Arc<TailSessionManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("tail")
        .and(warp::path::end())
        .and(warp::delete())
        .and(warp::query::<TailKeyQuery>())
        .and(with(tails))
        .and_then(|query: TailKeyQuery, tails: Arc<TailSessionManager>| async move {
            let key = query.key();
            let res = match tails.stop(&key).await {
                Ok(status) => json_reply(&TailStopped { key, status }, StatusCode::OK),
                Err(e) => error_reply(e.to_string(), tail_error_status(&e)),
            };
            Ok::<_, Rejection>(res)
        })
}

/// GET /tail/sessions
pub fn list_tails_route(
    tails: Arc<TailSessionManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("tail" / "sessions")
        .and(warp::get())
        .and(with(tails))
        .map(|tails: Arc<TailSessionManager>| json_reply(&tails.list_active(), StatusCode::OK))
}

/// Turns unmatched requests and body-limit violations into JSON errors.
pub async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (message, status) = if err.is_not_found() {
        ("Not found", StatusCode::NOT_FOUND)
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        ("Request body too large", StatusCode::PAYLOAD_TOO_LARGE)
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        ("Invalid query string", StatusCode::BAD_REQUEST)
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        ("Method not allowed", StatusCode::METHOD_NOT_ALLOWED)
    } else {
        warn!("Unhandled rejection: {:?}", err);
        ("Bad request", StatusCode::BAD_REQUEST)
    };
    Ok(error_reply(message, status))
}
