//! MJPEG live feed over the shared stream

use super::{frame_wait, resize_to_width, StreamOptimizer};
use crate::camera_state::CameraStateStore;
use crate::frame_adjust::{self, Adjustments};
use crate::shared_stream::SharedStreamManager;
use futures::stream::{self, Stream};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Multipart boundary used in the feed's content type
pub const MJPEG_BOUNDARY: &str = "frame";

/// Back-off after a frame fails to encode
const ENCODE_RETRY: Duration = Duration::from_millis(100);

struct FeedState {
    camera_id: String,
    streams: Arc<SharedStreamManager>,
    cameras: Arc<CameraStateStore>,
    optimizer: Arc<StreamOptimizer>,
    last_sent: Option<Instant>,
    sent: u64,
}

/// Multipart JPEG chunks for one camera, capped at the optimizer's fps.
///
/// Ends when the camera is removed or its capture cannot produce frames.
pub fn mjpeg_feed(
    camera_id: String,
    streams: Arc<SharedStreamManager>,
    cameras: Arc<CameraStateStore>,
    optimizer: Arc<StreamOptimizer>,
) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> {
    let state = FeedState {
        camera_id,
        streams,
        cameras,
        optimizer,
        last_sent: None,
        sent: 0,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            let record = state.cameras.get_existing(&state.camera_id).await?;

            let settings = state.optimizer.settings().await;
            if let Some(wait) = state.last_sent.and_then(|last| frame_wait(&settings, last)) {
                tokio::time::sleep(wait).await;
            }

            let Some(frame) = state
                .streams
                .wait_for_frame(&state.camera_id, &record.source)
                .await
            else {
                tracing::warn!(camera_id = %state.camera_id, "Live feed ended, no frames");
                return None;
            };

            let adjustments = Adjustments::from(&record);
            let quality = settings.jpeg_quality;
            let max_width = settings.max_width;
            let encoded = tokio::task::spawn_blocking(move || {
                let adjusted = frame_adjust::apply(&frame, &adjustments);
                resize_to_width(&adjusted, max_width).to_jpeg(quality)
            })
            .await;

            let jpeg = match encoded {
                Ok(Ok(jpeg)) => jpeg,
                Ok(Err(e)) => {
                    tracing::warn!(camera_id = %state.camera_id, error = %e, "Failed to encode feed frame");
                    tokio::time::sleep(ENCODE_RETRY).await;
                    continue;
                }
                Err(e) => {
                    tracing::error!(camera_id = %state.camera_id, error = %e, "Feed encoder task failed");
                    return None;
                }
            };

            state.last_sent = Some(Instant::now());
            state.sent += 1;
            if state.sent % 300 == 0 {
                tracing::debug!(
                    camera_id = %state.camera_id,
                    frames = state.sent,
                    mode = if settings.is_tunnel_mode { "tunnel" } else { "local" },
                    "Live feed progress"
                );
            }

            let mut chunk = Vec::with_capacity(jpeg.len() + 64);
            chunk.extend_from_slice(
                format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", MJPEG_BOUNDARY).as_bytes(),
            );
            chunk.extend_from_slice(&jpeg);
            chunk.extend_from_slice(b"\r\n");
            return Some((Ok(chunk), state));
        }
    })
}
