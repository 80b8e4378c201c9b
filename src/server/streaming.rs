//! SSE relay of an upstream chunk stream.
//!
//! Every upstream chunk becomes exactly one `data: {"text": ...}` frame, in
//! arrival order. The response status is only committed once the first
//! chunk (or a clean end of stream) has arrived, so any failure up to that
//! point can still be answered with a 500. A failure after that point is
//! reported in-band as a single final `data: {"error": ...}` frame.

use std::convert::Infallible;

use axum::http::{header, HeaderValue};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::Stream;
use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use crate::provider::{ChunkStream, Prompt, StreamingCompletionProvider, UpstreamChunk};
use crate::server::error::RelayError;
use crate::server::metrics::{Outcome, RelayMetrics};

#[derive(Debug, Serialize)]
struct TextFrame<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct ErrorFrame<'a> {
    error: &'a str,
}

/// An upstream stream whose first item has already been received.
pub struct PrimedStream {
    first: Option<UpstreamChunk>,
    rest: ChunkStream,
    deadline: Instant,
}

/// Call the provider and wait for its first chunk.
///
/// Errors here happen before any byte of the response is written.
pub async fn start_relay(
    provider: &dyn StreamingCompletionProvider,
    prompt: Prompt,
    deadline: Instant,
    timeout: std::time::Duration,
) -> Result<PrimedStream, RelayError> {
    let mut rest = timeout_at(deadline, provider.stream(prompt))
        .await
        .map_err(|_| RelayError::Timeout(timeout))??;

    let first = match timeout_at(deadline, rest.next()).await {
        Err(_) => return Err(RelayError::Timeout(timeout)),
        Ok(Some(Err(e))) => return Err(e.into()),
        Ok(Some(Ok(chunk))) => Some(chunk),
        Ok(None) => None,
    };

    Ok(PrimedStream {
        first,
        rest,
        deadline,
    })
}

/// Records how a relay ended, including when the client goes away.
///
/// Created as soon as a request has been validated and moved into the
/// response stream, so a drop at any later point (while waiting for the
/// upstream, before the body is first polled, mid-stream) counts as
/// cancelled.
pub struct RelayGuard {
    request_id: String,
    metrics: RelayMetrics,
    frames: usize,
    outcome: Option<Outcome>,
}

impl RelayGuard {
    pub fn new(request_id: String, metrics: RelayMetrics) -> Self {
        Self {
            request_id,
            metrics,
            frames: 0,
            outcome: None,
        }
    }

    fn frame(&mut self) {
        self.frames += 1;
        self.metrics.record_frame();
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn finish(&mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
        self.metrics.record_outcome(outcome);
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        match self.outcome {
            Some(outcome) => debug!(
                request_id = %self.request_id,
                frames = self.frames,
                outcome = outcome.as_str(),
                "Relay finished"
            ),
            None => {
                // Dropping the stream drops the upstream response with it.
                info!(
                    request_id = %self.request_id,
                    frames = self.frames,
                    "Client disconnected, upstream call abandoned"
                );
                self.metrics.record_outcome(Outcome::Cancelled);
            }
        }
    }
}

fn text_event(text: &str) -> Event {
    let data = serde_json::to_string(&TextFrame { text }).unwrap_or_default();
    Event::default().data(data)
}

fn error_event(message: &str) -> Event {
    let data = serde_json::to_string(&ErrorFrame { error: message }).unwrap_or_default();
    Event::default().data(data)
}

/// Convert a primed upstream stream into SSE events.
pub fn relay_events(
    primed: PrimedStream,
    mut guard: RelayGuard,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    async_stream::stream! {
        let PrimedStream { first, mut rest, deadline } = primed;

        match first {
            Some(chunk) => {
                guard.frame();
                yield Ok(text_event(&chunk.text));
            }
            None => {
                guard.finish(Outcome::Completed);
                return;
            }
        }

        loop {
            match timeout_at(deadline, rest.next()).await {
                Ok(Some(Ok(chunk))) => {
                    guard.frame();
                    yield Ok(text_event(&chunk.text));
                }
                Ok(None) => {
                    guard.finish(Outcome::Completed);
                    break;
                }
                Ok(Some(Err(e))) => {
                    error!(request_id = %guard.request_id, frames = guard.frames, "Upstream stream failed: {e}");
                    guard.metrics.record_upstream_error();
                    guard.finish(Outcome::Failed);
                    yield Ok(error_event("Upstream stream failed"));
                    break;
                }
                Err(_) => {
                    error!(request_id = %guard.request_id, frames = guard.frames, "Upstream stream timed out");
                    guard.metrics.record_upstream_error();
                    guard.finish(Outcome::Failed);
                    yield Ok(error_event("Upstream timed out"));
                    break;
                }
            }
        }
    }
}

/// Wrap relay events in a response carrying the fixed SSE headers.
pub fn sse_response<S>(events: S) -> Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    let mut response = Sse::new(events).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::provider::ProviderError;

    fn primed(items: Vec<Result<UpstreamChunk, ProviderError>>) -> PrimedStream {
        let mut items = items.into_iter();
        let first = items.next().map(|r| r.unwrap());
        PrimedStream {
            first,
            rest: Box::pin(tokio_stream::iter(items.collect::<Vec<_>>())),
            deadline: Instant::now() + Duration::from_secs(60),
        }
    }

    async fn body_of(primed: PrimedStream, metrics: RelayMetrics) -> String {
        let guard = RelayGuard::new("test".to_string(), metrics);
        let response = sse_response(relay_events(primed, guard));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[test]
    fn test_text_frame_escapes_json() {
        let data = serde_json::to_string(&TextFrame { text: "say \"hi\"\nnow" }).unwrap();
        assert_eq!(data, r#"{"text":"say \"hi\"\nnow"}"#);
    }

    #[tokio::test]
    async fn test_frames_in_order() {
        let metrics = RelayMetrics::new().unwrap();
        let body = body_of(
            primed(vec![
                Ok(UpstreamChunk::new("Hel")),
                Ok(UpstreamChunk::new("lo")),
                Ok(UpstreamChunk::new("!")),
            ]),
            metrics.clone(),
        )
        .await;

        assert_eq!(
            body,
            "data: {\"text\":\"Hel\"}\n\ndata: {\"text\":\"lo\"}\n\ndata: {\"text\":\"!\"}\n\n"
        );
        assert_eq!(metrics.frame_count(), 3);
        assert_eq!(metrics.outcome_count(Outcome::Completed), 1);
    }

    #[tokio::test]
    async fn test_error_after_frames_ends_with_error_frame() {
        let metrics = RelayMetrics::new().unwrap();
        let body = body_of(
            primed(vec![
                Ok(UpstreamChunk::new("partial")),
                Err(ProviderError::Stream("connection reset".to_string())),
                Ok(UpstreamChunk::new("unreachable")),
            ]),
            metrics.clone(),
        )
        .await;

        assert_eq!(
            body,
            "data: {\"text\":\"partial\"}\n\ndata: {\"error\":\"Upstream stream failed\"}\n\n"
        );
        assert_eq!(metrics.outcome_count(Outcome::Failed), 1);
    }

    #[tokio::test]
    async fn test_dropped_stream_counts_as_cancelled() {
        let metrics = RelayMetrics::new().unwrap();
        let events = relay_events(
            primed(vec![Ok(UpstreamChunk::new("a")), Ok(UpstreamChunk::new("b"))]),
            RelayGuard::new("test".to_string(), metrics.clone()),
        );
        let mut events = Box::pin(events);
        assert!(events.next().await.is_some());
        drop(events);

        assert_eq!(metrics.outcome_count(Outcome::Cancelled), 1);
        assert_eq!(metrics.outcome_count(Outcome::Completed), 0);
    }

    #[tokio::test]
    async fn test_body_dropped_before_first_poll_counts_as_cancelled() {
        let metrics = RelayMetrics::new().unwrap();
        let response = sse_response(relay_events(
            primed(vec![Ok(UpstreamChunk::new("a"))]),
            RelayGuard::new("test".to_string(), metrics.clone()),
        ));
        drop(response);

        assert_eq!(metrics.outcome_count(Outcome::Cancelled), 1);
        assert_eq!(metrics.frame_count(), 0);
    }

    #[test]
    fn test_finished_guard_is_not_cancelled() {
        let metrics = RelayMetrics::new().unwrap();
        let mut guard = RelayGuard::new("test".to_string(), metrics.clone());
        guard.finish(Outcome::Rejected);
        drop(guard);

        assert_eq!(metrics.outcome_count(Outcome::Rejected), 1);
        assert_eq!(metrics.outcome_count(Outcome::Cancelled), 0);
    }
}
