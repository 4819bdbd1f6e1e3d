//! Stream transport: one SSE response per session plus a POST endpoint for inbound messages.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;

use super::{ApiError, ApiResult, AppState};
use crate::error::HubError;
use crate::router::{OpenedSession, Router};

fn running_router(state: &AppState, id: &str) -> ApiResult<Arc<Router>> {
    state.manager.router(id).ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            format!("instance {id} not found or not running"),
        )
    })
}

pub(super) async fn open_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let router = running_router(&state, &id)?;
    let OpenedSession {
        id: session_id,
        mut outlet,
        guard,
    } = router.open_session().await?;
    let endpoint = format!("/api/mcp/{id}/messages?sessionId={session_id}");

    // The guard lives as long as the stream; a client disconnect drops both and closes the session.
    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok(Event::default().event("endpoint").data(endpoint));
        while let Some(frame) = outlet.recv().await {
            yield Ok(Event::default().event("message").data(frame.trim_end_matches('\n')));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
pub(super) struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

pub(super) async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> ApiResult<(StatusCode, &'static str)> {
    let router = running_router(&state, &id)?;
    let session_id = query
        .session_id
        .filter(|session_id| !session_id.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing sessionId parameter"))?;

    let report = router
        .post_to_session(&session_id, &body)
        .map_err(|error| match error {
            HubError::Stream(_) => HubError::not_found("session", &session_id),
            other => other,
        })?;

    if report.accepted == 0 {
        let message = match report.errors.first() {
            Some(first) => format!("invalid message: {first}"),
            None => "request body carried no message".to_string(),
        };
        return Err(ApiError::bad_request(message));
    }
    Ok((StatusCode::ACCEPTED, "Accepted"))
}
