//! Conversion between the client-facing OpenAI chat schema and each backend's
//! native schema, for unary and streamed responses.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{Backend, SchemaName, VersionedSchema};

pub mod anthropic;
pub mod chat;
pub mod gemini;
pub mod openai;
pub mod sse;

pub use chat::FinishReason;
pub use sse::{SseDecoder, SseFrame, SseLimits};

const MAX_ERROR_MESSAGE_BYTES: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("malformed backend response: {0}")]
    Malformed(String),
    #[error("backend reported an error mid-stream: {0}")]
    Upstream(String),
    #[error("no translation from {client} to {backend}")]
    UnsupportedPair {
        client: SchemaName,
        backend: SchemaName,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32, total_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    /// Builds usage from backend counters, deriving the total when the
    /// backend omits it.
    pub fn from_counts(input_tokens: u32, output_tokens: u32, total_tokens: Option<u32>) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: total_tokens
                .unwrap_or_else(|| input_tokens.saturating_add(output_tokens)),
        }
    }
}

pub(crate) fn json_u32(value: Option<&Value>) -> Option<u32> {
    value
        .and_then(Value::as_u64)
        .map(|count| u32::try_from(count).unwrap_or(u32::MAX))
}

/// A parsed client request in the OpenAI chat-completions schema.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    body: Map<String, Value>,
    model: String,
    stream: bool,
    include_usage: bool,
}

impl ChatRequest {
    pub fn parse(bytes: &[u8]) -> Result<Self, TranslateError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|err| TranslateError::InvalidRequest(format!("invalid JSON body: {err}")))?;
        let Value::Object(body) = value else {
            return Err(TranslateError::InvalidRequest(
                "request body must be a JSON object".to_string(),
            ));
        };
        Self::from_body(body)
    }

    pub fn from_body(body: Map<String, Value>) -> Result<Self, TranslateError> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .ok_or_else(|| TranslateError::InvalidRequest("missing field `model`".to_string()))?
            .to_string();
        if !body.get("messages").is_some_and(Value::is_array) {
            return Err(TranslateError::InvalidRequest(
                "missing field `messages`".to_string(),
            ));
        }
        let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let include_usage = body
            .get("stream_options")
            .and_then(|options| options.get("include_usage"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Self {
            body,
            model,
            stream,
            include_usage,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn stream(&self) -> bool {
        self.stream
    }

    pub fn include_usage(&self) -> bool {
        self.include_usage
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn messages(&self) -> &[Value] {
        self.body
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// The model name sent to `backend`, honoring its override.
    pub fn model_for(&self, backend: &Backend) -> String {
        backend
            .model_name_override
            .clone()
            .unwrap_or_else(|| self.model.clone())
    }

    pub(crate) fn max_tokens(&self) -> Option<u64> {
        self.body
            .get("max_completion_tokens")
            .or_else(|| self.body.get("max_tokens"))
            .and_then(Value::as_u64)
    }

    pub(crate) fn stop_sequences(&self) -> Vec<String> {
        match self.body.get("stop") {
            Some(Value::String(stop)) => vec![stop.clone()],
            Some(Value::Array(stops)) => stops
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Text of an OpenAI message `content`, which is either a string or a list of
/// typed parts.
pub(crate) fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Splits a `data:` URL into media type and base64 payload.
pub(crate) fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some((media_type, data))
}

#[derive(Clone, Debug)]
pub struct BackendRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub stream: bool,
}

/// One translator instance serves a single attempt against a single backend;
/// it owns that attempt's streaming state.
pub trait Translator: Send {
    fn request(
        &mut self,
        request: &ChatRequest,
        backend: &Backend,
    ) -> Result<BackendRequest, TranslateError>;

    /// Translates response bytes as they arrive. Unary responses are buffered
    /// until `end_of_stream`; streams emit client frames per complete backend
    /// frame.
    fn response_body(&mut self, chunk: &[u8], end_of_stream: bool)
    -> Result<Bytes, TranslateError>;

    /// Rewrites a backend error body into the client's error envelope.
    fn error_body(&self, status: StatusCode, body: &[u8]) -> Bytes;

    /// Token usage observed so far.
    fn usage(&self) -> TokenUsage;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TranslatorOptions {
    pub sse: SseLimits,
}

pub fn supports_pair(client: SchemaName, backend: SchemaName) -> bool {
    matches!(
        (client, backend),
        (SchemaName::OpenAI, SchemaName::OpenAI)
            | (SchemaName::OpenAI, SchemaName::Anthropic)
            | (SchemaName::OpenAI, SchemaName::GcpGemini)
    )
}

pub fn for_pair(
    client: &VersionedSchema,
    backend: &VersionedSchema,
    options: TranslatorOptions,
) -> Result<Box<dyn Translator>, TranslateError> {
    match (client.name, backend.name) {
        (SchemaName::OpenAI, SchemaName::OpenAI) => {
            Ok(Box::new(openai::OpenAiTranslator::new(backend, options)))
        }
        (SchemaName::OpenAI, SchemaName::Anthropic) => {
            Ok(Box::new(anthropic::AnthropicTranslator::new(backend, options)))
        }
        (SchemaName::OpenAI, SchemaName::GcpGemini) => {
            Ok(Box::new(gemini::GeminiTranslator::new(backend, options)))
        }
        (client, backend) => Err(TranslateError::UnsupportedPair { client, backend }),
    }
}

/// Appends `chunk` to `buf` and hands back the complete body once the
/// response has ended.
pub(crate) fn buffer_unary(buf: &mut Vec<u8>, chunk: &[u8], end_of_stream: bool) -> Option<Vec<u8>> {
    buf.extend_from_slice(chunk);
    if end_of_stream {
        Some(std::mem::take(buf))
    } else {
        None
    }
}

pub(crate) fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>, TranslateError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(_) => Err(TranslateError::Malformed(
            "expected a JSON object".to_string(),
        )),
        Err(err) => Err(TranslateError::Malformed(format!("invalid JSON: {err}"))),
    }
}

/// Best-effort message for a backend error body that does not parse.
pub(crate) fn raw_error_message(status: StatusCode, body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return format!("backend returned status {status}");
    }
    if text.len() <= MAX_ERROR_MESSAGE_BYTES {
        return text.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &text[..end])
}

pub(crate) fn error_kind_for_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        401 | 403 => "authentication_error",
        429 => "rate_limit_error",
        400..=499 => "invalid_request_error",
        _ => "api_error",
    }
}
