use super::{RecorderError, UsageRecorder};

/// Writes each event as an INFO line: the event name as the message and its
/// values as fields, e.g. `SetBackend backend=testupstream`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogRecorder;

impl LogRecorder {
    pub fn new() -> Self {
        Self
    }
}

impl UsageRecorder for LogRecorder {
    fn name(&self) -> &str {
        "log"
    }

    fn start_request(&self) -> Result<(), RecorderError> {
        tracing::info!("StartRequest");
        Ok(())
    }

    fn set_model(&self, model: &str) -> Result<(), RecorderError> {
        tracing::info!(model = %model, "SetModel");
        Ok(())
    }

    fn set_backend(&self, backend: &str) -> Result<(), RecorderError> {
        tracing::info!(backend = %backend, "SetBackend");
        Ok(())
    }

    fn record_token_usage(
        &self,
        input_tokens: u32,
        output_tokens: u32,
        total_tokens: u32,
    ) -> Result<(), RecorderError> {
        tracing::info!(
            inputTokens = input_tokens,
            outputTokens = output_tokens,
            totalTokens = total_tokens,
            "RecordTokenUsage"
        );
        Ok(())
    }

    fn record_request_completion(&self, success: bool) -> Result<(), RecorderError> {
        tracing::info!(success, "RecordRequestCompletion");
        Ok(())
    }
}
