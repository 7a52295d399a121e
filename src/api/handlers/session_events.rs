//! Server-sent session events.

use axum::{
    extract::{Extension, Query},
    response::sse::{Event, Sse},
};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::types::SessionEventsQuery;
use crate::{
    api::error::{ApiError, ApiResult, ErrorResponse},
    session::{SessionEvent, SessionService},
};

#[utoipa::path(
    get,
    path = "/session-events",
    params(SessionEventsQuery),
    responses(
        (status = 200, description = "Stream of connected, ping and session_revoked events", content_type = "text/event-stream", body = String),
        (status = 400, description = "Missing or invalid userId", body = ErrorResponse),
    ),
    tag = "session-events"
)]
#[instrument(skip_all)]
pub async fn session_events(
    service: Extension<Arc<SessionService>>,
    Query(query): Query<SessionEventsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, serde_json::Error>>>> {
    let user_id = parse_user_id(query.user_id.as_deref())?;
    let subscription = service.broadcaster().connect(user_id).await;
    debug!(%user_id, connection_id = subscription.id, "streaming session events");

    let stream = ReceiverStream::new(subscription.receiver).map(to_sse_event);
    Ok(Sse::new(stream))
}

fn parse_user_id(raw: Option<&str>) -> ApiResult<Uuid> {
    let raw = raw.map(str::trim).filter(|raw| !raw.is_empty());
    let Some(raw) = raw else {
        return Err(ApiError::bad_request("userId is required"));
    };
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request("invalid userId"))
}

fn to_sse_event(event: SessionEvent) -> Result<Event, serde_json::Error> {
    Ok(Event::default().event(event.name()).data(event.data()?))
}
