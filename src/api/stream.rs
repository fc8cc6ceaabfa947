//! `GET /jobs/{id}/stream`, the SSE status push
//!
//! One long-lived task per subscriber: a comment on connect, a `status`
//! event with the current projection, one `status` event per observed
//! record change, comment heartbeats on the configured cadence, and a
//! close on terminal status or peer disconnect. Stream-internal failures
//! emit a single `error` event and close.

use std::convert::Infallible;
use std::time::Duration;

use axum::Extension;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use super::admission::authenticate;
use super::error::ApiError;
use super::models::JobProjection;
use super::services::{owned_job, project};
use super::state::{AppState, RequestId};

pub async fn stream_job(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(id): Path<String>,
    headers: axum::http::HeaderMap,
) -> Response {
    let setup = async {
        let user = authenticate(&state, &headers).await?;
        let record = owned_job(&state, &user.user_id, &id)?;
        let initial = project(&state, &record)?;
        Ok::<_, ApiError>((record.job_id, record.is_terminal(), initial))
    }
    .await;

    let (job_id, terminal, initial) = match setup {
        Ok(parts) => parts,
        Err(err) => return err.into_problem(&request_id),
    };

    let heartbeat = Duration::from_millis(state.config.jobs.sse_heartbeat_ms.max(1_000));
    let mut updates = state.docs.subscribe();

    let stream = async_stream::stream! {
        yield Ok::<Event, Infallible>(Event::default().comment("connected"));
        yield Ok(status_event(&initial));
        if terminal {
            return;
        }

        loop {
            match updates.recv().await {
                Ok(record) if record.job_id == job_id => {
                    let done = record.is_terminal();
                    match project(&state, &record) {
                        Ok(projection) => yield Ok(status_event(&projection)),
                        Err(e) => {
                            yield Ok(error_event(&e));
                            break;
                        }
                    }
                    if done {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    // Resync from the store rather than replaying the gap
                    debug!(%job_id, skipped, "Stream lagged, resyncing");
                    match state.docs.get_job(job_id) {
                        Ok(Some(record)) => {
                            let done = record.is_terminal();
                            match project(&state, &record) {
                                Ok(projection) => yield Ok(status_event(&projection)),
                                Err(e) => {
                                    yield Ok(error_event(&e));
                                    break;
                                }
                            }
                            if done {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            yield Ok(error_event(&ApiError::Internal(e.to_string())));
                            break;
                        }
                    }
                }
                Err(RecvError::Closed) => {
                    yield Ok(error_event(&ApiError::ServiceUnavailable(
                        "status stream closed".to_string(),
                    )));
                    break;
                }
            }
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(heartbeat).text("hb"))
        .into_response()
}

fn status_event(projection: &JobProjection) -> Event {
    let data = serde_json::to_string(projection).unwrap_or_else(|_| "{}".to_string());
    Event::default().event("status").data(data)
}

fn error_event(err: &ApiError) -> Event {
    let data = serde_json::json!({ "error": err.kind(), "detail": err.to_string() });
    Event::default().event("error").data(data.to_string())
}
