//! Streaming endpoints: SSE events and the MJPEG live feed

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::realtime_hub::RealtimeHub;
use crate::state::AppState;
use crate::stream_optimizer::{mjpeg_feed, MJPEG_BOUNDARY};
use crate::Error;

/// Unregisters the client when the SSE response is dropped
struct ClientGuard {
    hub: Arc<RealtimeHub>,
    id: Uuid,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                hub.unregister(&id).await;
            });
        }
    }
}

/// Server-Sent Events: one `data:` line per hub message
pub(super) async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (id, rx) = state.realtime.register().await;
    tracing::info!(connection_id = %id, "SSE client connected");

    let guard = ClientGuard {
        hub: state.realtime.clone(),
        id,
    };
    let events = stream::unfold(
        (rx, guard),
        |(mut rx, guard): (mpsc::UnboundedReceiver<String>, ClientGuard)| async move {
            let message = rx.recv().await?;
            Some((Ok(Event::default().data(message)), (rx, guard)))
        },
    );

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// MJPEG live feed for one camera
pub(super) async fn camera_feed(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, Error> {
    if state.cameras.get_existing(&id).await.is_none() {
        return Err(Error::NotFound(format!("Camera {} not found", id)));
    }
    tracing::debug!(camera_id = %id, "Live feed opened");

    let feed = mjpeg_feed(
        id,
        state.streams.clone(),
        state.cameras.clone(),
        state.optimizer.clone(),
    );

    Ok((
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(feed),
    )
        .into_response())
}
