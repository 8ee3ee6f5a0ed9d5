//! Per-request usage and lifecycle events, fanned out to pluggable sinks.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::translator::TokenUsage;

mod log;
mod memory;
mod prometheus;

pub use log::LogRecorder;
pub use memory::MemoryRecorder;
pub use prometheus::{PrometheusRecorder, PrometheusRecorderConfig};

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recorder state lock is poisoned")]
    Poisoned,
    #[error("{0}")]
    Sink(String),
}

/// One lifecycle notification. `Display` renders the logfmt line the log
/// recorder writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsageEvent {
    StartRequest,
    SetModel(String),
    SetBackend(String),
    TokenUsage(TokenUsage),
    RequestCompletion { success: bool },
}

impl fmt::Display for UsageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartRequest => f.write_str("StartRequest"),
            Self::SetModel(model) => write!(f, "SetModel model={model}"),
            Self::SetBackend(backend) => write!(f, "SetBackend backend={backend}"),
            Self::TokenUsage(usage) => write!(
                f,
                "RecordTokenUsage inputTokens={} outputTokens={} totalTokens={}",
                usage.input_tokens, usage.output_tokens, usage.total_tokens
            ),
            Self::RequestCompletion { success } => {
                write!(f, "RecordRequestCompletion success={success}")
            }
        }
    }
}

/// Sink for usage events. Calls happen on the request path and must return
/// promptly.
pub trait UsageRecorder: Send + Sync {
    fn name(&self) -> &str {
        "recorder"
    }

    fn start_request(&self) -> Result<(), RecorderError>;

    fn set_model(&self, model: &str) -> Result<(), RecorderError>;

    fn set_backend(&self, backend: &str) -> Result<(), RecorderError>;

    fn record_token_usage(
        &self,
        input_tokens: u32,
        output_tokens: u32,
        total_tokens: u32,
    ) -> Result<(), RecorderError>;

    fn record_request_completion(&self, success: bool) -> Result<(), RecorderError>;
}

/// Builds a recorder for a single request, for sinks that keep per-request
/// state.
pub trait RecorderFactory: Send + Sync {
    fn new_recorder(&self) -> Arc<dyn UsageRecorder>;
}

/// Ordered set of recorders for one request.
#[derive(Clone, Default)]
pub struct Recorders {
    recorders: Vec<Arc<dyn UsageRecorder>>,
}

impl Recorders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, recorder: Arc<dyn UsageRecorder>) {
        self.recorders.push(recorder);
    }

    pub fn with(mut self, recorder: Arc<dyn UsageRecorder>) -> Self {
        self.push(recorder);
        self
    }

    pub fn len(&self) -> usize {
        self.recorders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }

    /// Delivers `event` to every recorder in registration order. Failures are
    /// logged and dropped.
    pub fn emit(&self, event: &UsageEvent) {
        for recorder in &self.recorders {
            let result = match event {
                UsageEvent::StartRequest => recorder.start_request(),
                UsageEvent::SetModel(model) => recorder.set_model(model),
                UsageEvent::SetBackend(backend) => recorder.set_backend(backend),
                UsageEvent::TokenUsage(usage) => recorder.record_token_usage(
                    usage.input_tokens,
                    usage.output_tokens,
                    usage.total_tokens,
                ),
                UsageEvent::RequestCompletion { success } => {
                    recorder.record_request_completion(*success)
                }
            };
            if let Err(err) = result {
                tracing::warn!(
                    recorder = recorder.name(),
                    event = %event,
                    error = %err,
                    "usage recorder failed"
                );
            }
        }
    }
}

impl fmt::Debug for Recorders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.recorders.iter().map(|recorder| recorder.name()))
            .finish()
    }
}
