use crate::camera::FrameReceiver;
use crate::service::{CycleThrottle, SessionController, SessionHandle};
use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

const BOUNDARY: &str = "frame";

struct StreamState {
    session: Arc<SessionController>,
    id: u64,
    frames: FrameReceiver,
    throttle: CycleThrottle,
}

/// `multipart/x-mixed-replace` JPEG stream for one session. Each part is
/// rendered in the session's current mode; the stream ends when the session
/// stops or is replaced.
pub fn mjpeg_response(session: Arc<SessionController>, handle: SessionHandle) -> Response {
    let interval = Duration::from_millis(session.config().recognition.interval_ms);
    let state = StreamState {
        session,
        id: handle.id,
        frames: handle.frames,
        throttle: CycleThrottle::new(interval),
    };

    let parts = stream::unfold(state, |mut state| async move {
        loop {
            if state.frames.changed().await.is_err() {
                tracing::debug!("Stream for session {} closed", state.id);
                return None;
            }
            let mode = state.session.mode_of(state.id)?;
            let latest = state.frames.borrow_and_update().clone();
            let Some(frame) = latest else {
                continue;
            };

            let session = state.session.clone();
            let mut throttle = state.throttle.clone();
            let rendered = tokio::task::spawn_blocking(move || {
                let jpeg = session.render_frame(&frame, mode, &mut throttle);
                (throttle, jpeg)
            })
            .await;

            match rendered {
                Ok((throttle, Ok(jpeg))) => {
                    state.throttle = throttle;
                    return Some((Ok::<Bytes, Infallible>(multipart_part(&jpeg)), state));
                }
                Ok((throttle, Err(e))) => {
                    state.throttle = throttle;
                    tracing::warn!("Failed to render frame: {}", e);
                }
                Err(e) => {
                    tracing::error!("Render task failed: {}", e);
                    return None;
                }
            }
        }
    });

    (
        [
            (header::CONTENT_TYPE, format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_is_framed_by_boundary() {
        let part = multipart_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n"));
        assert!(part.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }
}
