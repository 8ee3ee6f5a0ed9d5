use std::sync::Mutex;

use super::{RecorderError, UsageEvent, UsageRecorder};
use crate::translator::TokenUsage;

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<UsageEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events rendered as log lines.
    pub fn lines(&self) -> Vec<String> {
        self.events().iter().map(ToString::to_string).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    fn push(&self, event: UsageEvent) -> Result<(), RecorderError> {
        self.events
            .lock()
            .map_err(|_| RecorderError::Poisoned)?
            .push(event);
        Ok(())
    }
}

impl UsageRecorder for MemoryRecorder {
    fn name(&self) -> &str {
        "memory"
    }

    fn start_request(&self) -> Result<(), RecorderError> {
        self.push(UsageEvent::StartRequest)
    }

    fn set_model(&self, model: &str) -> Result<(), RecorderError> {
        self.push(UsageEvent::SetModel(model.to_string()))
    }

    fn set_backend(&self, backend: &str) -> Result<(), RecorderError> {
        self.push(UsageEvent::SetBackend(backend.to_string()))
    }

    fn record_token_usage(
        &self,
        input_tokens: u32,
        output_tokens: u32,
        total_tokens: u32,
    ) -> Result<(), RecorderError> {
        self.push(UsageEvent::TokenUsage(TokenUsage::new(
            input_tokens,
            output_tokens,
            total_tokens,
        )))
    }

    fn record_request_completion(&self, success: bool) -> Result<(), RecorderError> {
        self.push(UsageEvent::RequestCompletion { success })
    }
}
