//! Relay counters exposed at `GET /metrics`.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// How a `/chat` request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Upstream stream ended normally.
    Completed,
    /// Rejected before any upstream call.
    BadRequest,
    /// Upstream failed before the first chunk; answered with 500.
    Rejected,
    /// Upstream failed after frames were sent.
    Failed,
    /// Client went away mid-stream.
    Cancelled,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::BadRequest => "bad_request",
            Outcome::Rejected => "rejected",
            Outcome::Failed => "failed",
            Outcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    requests: IntCounterVec,
    frames: IntCounter,
    upstream_errors: IntCounter,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("relay_requests_total", "Chat requests by outcome"),
            &["outcome"],
        )?;
        let frames = IntCounter::new("relay_frames_total", "SSE text frames written")?;
        let upstream_errors =
            IntCounter::new("relay_upstream_errors_total", "Upstream call or stream failures")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(frames.clone()))?;
        registry.register(Box::new(upstream_errors.clone()))?;

        Ok(Self {
            registry,
            requests,
            frames,
            upstream_errors,
        })
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        self.requests.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn record_frame(&self) {
        self.frames.inc();
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.inc();
    }

    pub fn outcome_count(&self, outcome: Outcome) -> u64 {
        self.requests.with_label_values(&[outcome.as_str()]).get()
    }

    pub fn frame_count(&self) -> u64 {
        self.frames.get()
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
