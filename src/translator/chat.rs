//! OpenAI chat-completions output: unary `chat.completion` objects and
//! `chat.completion.chunk` SSE frames.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use serde_json::{Map, Value};

use super::TokenUsage;

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    Unknown,
}

impl FinishReason {
    pub fn as_chat_str(self) -> Option<&'static str> {
        match self {
            Self::Stop => Some("stop"),
            Self::Length => Some("length"),
            Self::ToolCalls => Some("tool_calls"),
            Self::ContentFilter => Some("content_filter"),
            Self::Error => Some("error"),
            Self::Unknown => None,
        }
    }

    fn to_value(self) -> Value {
        self.as_chat_str()
            .map(|reason| Value::String(reason.to_string()))
            .unwrap_or(Value::Null)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

pub(crate) fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

pub(crate) fn usage_to_chat_usage(usage: TokenUsage) -> Value {
    serde_json::json!({
        "prompt_tokens": usage.input_tokens,
        "completion_tokens": usage.output_tokens,
        "total_tokens": usage.total_tokens,
    })
}

fn tool_calls_value(tool_calls: &[ToolCall]) -> Value {
    Value::Array(
        tool_calls
            .iter()
            .map(|call| {
                serde_json::json!({
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": call.arguments},
                })
            })
            .collect(),
    )
}

#[derive(Clone, Debug)]
pub(crate) struct ChatCompletion {
    pub id: String,
    pub model: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Option<TokenUsage>,
}

impl ChatCompletion {
    pub fn to_bytes(&self) -> Bytes {
        let mut message = Map::<String, Value>::new();
        message.insert("role".to_string(), Value::String("assistant".to_string()));
        if self.content.is_empty() && !self.tool_calls.is_empty() {
            message.insert("content".to_string(), Value::Null);
        } else {
            message.insert("content".to_string(), Value::String(self.content.clone()));
        }
        if !self.tool_calls.is_empty() {
            message.insert("tool_calls".to_string(), tool_calls_value(&self.tool_calls));
        }

        let mut out = Map::<String, Value>::new();
        out.insert("id".to_string(), Value::String(self.id.clone()));
        out.insert(
            "object".to_string(),
            Value::String("chat.completion".to_string()),
        );
        out.insert("created".to_string(), Value::from(now_unix_secs()));
        out.insert("model".to_string(), Value::String(self.model.clone()));
        out.insert(
            "choices".to_string(),
            serde_json::json!([{
                "index": 0,
                "message": Value::Object(message),
                "finish_reason": self.finish_reason.to_value(),
            }]),
        );
        if let Some(usage) = self.usage {
            out.insert("usage".to_string(), usage_to_chat_usage(usage));
        }
        Bytes::from(Value::Object(out).to_string())
    }
}

/// Writes `chat.completion.chunk` frames for one streamed response.
#[derive(Debug)]
pub(crate) struct ChunkWriter {
    id: String,
    model: String,
    created: u64,
    include_usage: bool,
    role_sent: bool,
}

impl ChunkWriter {
    pub fn new(model: impl Into<String>, include_usage: bool) -> Self {
        Self {
            id: "chatcmpl-aigw".to_string(),
            model: model.into(),
            created: now_unix_secs(),
            include_usage,
            role_sent: false,
        }
    }

    pub fn set_id(&mut self, id: &str) {
        if !id.is_empty() {
            self.id = id.to_string();
        }
    }

    pub fn set_model(&mut self, model: &str) {
        if !model.is_empty() {
            self.model = model.to_string();
        }
    }

    pub fn role(&mut self, out: &mut BytesMut) {
        if self.role_sent {
            return;
        }
        self.role_sent = true;
        self.write_chunk(
            out,
            serde_json::json!({"role": "assistant", "content": ""}),
            None,
        );
    }

    pub fn content(&mut self, out: &mut BytesMut, text: &str) {
        if text.is_empty() {
            return;
        }
        self.role(out);
        self.write_chunk(out, serde_json::json!({"content": text}), None);
    }

    pub fn tool_call_start(&mut self, out: &mut BytesMut, index: usize, id: &str, name: &str) {
        self.role(out);
        self.write_chunk(
            out,
            serde_json::json!({"tool_calls": [{
                "index": index,
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": ""},
            }]}),
            None,
        );
    }

    pub fn tool_call_arguments(&mut self, out: &mut BytesMut, index: usize, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        self.write_chunk(
            out,
            serde_json::json!({"tool_calls": [{
                "index": index,
                "function": {"arguments": fragment},
            }]}),
            None,
        );
    }

    /// Terminal frames: finish reason, optional usage summary, `[DONE]`.
    pub fn finish(&mut self, out: &mut BytesMut, reason: FinishReason, usage: TokenUsage) {
        self.role(out);
        self.write_chunk(out, Value::Object(Map::new()), Some(reason));
        if self.include_usage {
            let mut chunk = self.envelope();
            chunk.insert("choices".to_string(), Value::Array(Vec::new()));
            chunk.insert("usage".to_string(), usage_to_chat_usage(usage));
            write_data(out, &Value::Object(chunk));
        }
        out.extend_from_slice(DONE_FRAME);
    }

    fn envelope(&self) -> Map<String, Value> {
        let mut out = Map::<String, Value>::new();
        out.insert("id".to_string(), Value::String(self.id.clone()));
        out.insert(
            "object".to_string(),
            Value::String("chat.completion.chunk".to_string()),
        );
        out.insert("created".to_string(), Value::from(self.created));
        out.insert("model".to_string(), Value::String(self.model.clone()));
        out
    }

    fn write_chunk(&self, out: &mut BytesMut, delta: Value, finish_reason: Option<FinishReason>) {
        let mut choice = Map::<String, Value>::new();
        choice.insert("index".to_string(), Value::from(0));
        choice.insert("delta".to_string(), delta);
        choice.insert(
            "finish_reason".to_string(),
            finish_reason
                .map(FinishReason::to_value)
                .unwrap_or(Value::Null),
        );
        let mut chunk = self.envelope();
        chunk.insert(
            "choices".to_string(),
            Value::Array(vec![Value::Object(choice)]),
        );
        write_data(out, &Value::Object(chunk));
    }
}

pub(crate) fn write_data(out: &mut BytesMut, value: &Value) {
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(value.to_string().as_bytes());
    out.extend_from_slice(b"\n\n");
}
