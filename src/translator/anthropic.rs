//! Anthropic Messages API backends.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::chat::{ChatCompletion, ChunkWriter, FinishReason, ToolCall};
use super::{
    BackendRequest, ChatRequest, SseDecoder, SseFrame, TokenUsage, TranslateError, Translator,
    TranslatorOptions, buffer_unary, content_text, error_kind_for_status, json_u32,
    parse_data_url, parse_object, raw_error_message,
};
use crate::config::{Backend, VersionedSchema};

pub const DEFAULT_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

pub struct AnthropicTranslator {
    version: String,
    decoder: SseDecoder,
    stream: bool,
    model: String,
    writer: Option<ChunkWriter>,
    tool_blocks: HashMap<usize, usize>,
    finish: Option<FinishReason>,
    input_tokens: u32,
    output_tokens: u32,
    done: bool,
    unary: Vec<u8>,
}

impl AnthropicTranslator {
    pub fn new(schema: &VersionedSchema, options: TranslatorOptions) -> Self {
        Self {
            version: schema
                .version
                .clone()
                .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            decoder: SseDecoder::new(options.sse),
            stream: false,
            model: String::new(),
            writer: None,
            tool_blocks: HashMap::new(),
            finish: None,
            input_tokens: 0,
            output_tokens: 0,
            done: false,
            unary: Vec::new(),
        }
    }

    fn translate_unary(&mut self, body: &[u8]) -> Result<Bytes, TranslateError> {
        let obj = parse_object(body)?;
        if obj.get("type").and_then(Value::as_str) == Some("error") {
            return Err(TranslateError::Upstream(error_message(&obj)));
        }
        let Some(blocks) = obj.get("content").and_then(Value::as_array) else {
            return Err(TranslateError::Malformed(
                "message without `content`".to_string(),
            ));
        };

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        content.push_str(text);
                    }
                }
                Some("tool_use") => tool_calls.push(ToolCall {
                    id: string_field(block, "id"),
                    name: string_field(block, "name"),
                    arguments: block
                        .get("input")
                        .map(Value::to_string)
                        .unwrap_or_else(|| "{}".to_string()),
                }),
                _ => {}
            }
        }

        if let Some(usage) = obj.get("usage") {
            self.observe_usage(usage);
        }
        let usage = self.usage();
        let completion = ChatCompletion {
            id: obj
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            model: obj
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(self.model.as_str())
                .to_string(),
            content,
            tool_calls,
            finish_reason: stop_reason_to_finish_reason(
                obj.get("stop_reason").and_then(Value::as_str),
            ),
            usage: Some(usage),
        };
        Ok(completion.to_bytes())
    }

    fn observe_usage(&mut self, usage: &Value) {
        if let Some(input) = json_u32(usage.get("input_tokens")) {
            self.input_tokens = input
                .saturating_add(json_u32(usage.get("cache_read_input_tokens")).unwrap_or(0))
                .saturating_add(json_u32(usage.get("cache_creation_input_tokens")).unwrap_or(0));
        }
        if let Some(output) = json_u32(usage.get("output_tokens")) {
            self.output_tokens = output;
        }
    }

    fn translate_frame(&mut self, frame: SseFrame, out: &mut BytesMut) -> Result<(), TranslateError> {
        if self.done {
            return Ok(());
        }
        let event: StreamEvent = serde_json::from_str(&frame.data).map_err(|err| {
            TranslateError::Malformed(format!("invalid Anthropic stream event: {err}"))
        })?;
        let writer = self
            .writer
            .get_or_insert_with(|| ChunkWriter::new(self.model.clone(), false));

        match event.kind.as_str() {
            "message_start" => {
                let message = event.message.as_ref();
                if let Some(id) = message.and_then(|m| m.get("id")).and_then(Value::as_str) {
                    writer.set_id(id);
                }
                if let Some(model) = message.and_then(|m| m.get("model")).and_then(Value::as_str) {
                    writer.set_model(model);
                }
                writer.role(out);
                if let Some(usage) = message.and_then(|m| m.get("usage")) {
                    self.observe_usage(usage);
                }
            }
            "content_block_start" => {
                let (Some(index), Some(block)) = (event.index, event.content_block.as_ref()) else {
                    return Ok(());
                };
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        let tool_index = self.tool_blocks.len();
                        self.tool_blocks.insert(index, tool_index);
                        writer.tool_call_start(
                            out,
                            tool_index,
                            &string_field(block, "id"),
                            &string_field(block, "name"),
                        );
                    }
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            writer.content(out, text);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let (Some(index), Some(delta)) = (event.index, event.delta.as_ref()) else {
                    return Ok(());
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            writer.content(out, text);
                        }
                    }
                    Some("input_json_delta") => {
                        let Some(tool_index) = self.tool_blocks.get(&index).copied() else {
                            return Ok(());
                        };
                        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                            writer.tool_call_arguments(out, tool_index, partial);
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(stop_reason) = event
                    .delta
                    .as_ref()
                    .and_then(|delta| delta.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    self.finish = Some(stop_reason_to_finish_reason(Some(stop_reason)));
                }
                if let Some(usage) = event.usage.as_ref() {
                    self.observe_usage(usage);
                }
            }
            "message_stop" => {
                self.done = true;
                let finish = self.finish.unwrap_or(FinishReason::Stop);
                let usage = self.usage();
                if let Some(writer) = self.writer.as_mut() {
                    writer.finish(out, finish, usage);
                }
            }
            "error" => {
                let message = event
                    .error
                    .as_ref()
                    .and_then(|error| error.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(TranslateError::Upstream(message.to_string()));
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    content_block: Option<Value>,
    #[serde(default)]
    delta: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    usage: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn error_message(obj: &Map<String, Value>) -> String {
    obj.get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string()
}

fn stop_reason_to_finish_reason(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") | None => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Unknown,
    }
}

fn image_block(part: &Value) -> Option<Value> {
    let url = part
        .get("image_url")
        .and_then(|image| image.get("url").or(Some(image)))
        .and_then(Value::as_str)?;
    let source = match parse_data_url(url) {
        Some((media_type, data)) => serde_json::json!({
            "type": "base64",
            "media_type": media_type,
            "data": data,
        }),
        None => serde_json::json!({"type": "url", "url": url}),
    };
    Some(serde_json::json!({"type": "image", "source": source}))
}

fn user_blocks(content: Option<&Value>) -> Vec<Value> {
    match content {
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part.get("type").and_then(Value::as_str) {
                Some("text") => part
                    .get("text")
                    .and_then(Value::as_str)
                    .filter(|text| !text.is_empty())
                    .map(|text| serde_json::json!({"type": "text", "text": text})),
                Some("image_url") => image_block(part),
                _ => None,
            })
            .collect(),
        other => {
            let text = content_text(other);
            if text.is_empty() {
                Vec::new()
            } else {
                vec![serde_json::json!({"type": "text", "text": text})]
            }
        }
    }
}

fn assistant_blocks(message: &Value) -> Vec<Value> {
    let mut blocks = Vec::new();
    let text = content_text(message.get("content"));
    if !text.is_empty() {
        blocks.push(serde_json::json!({"type": "text", "text": text}));
    }
    for call in message
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let function = call.get("function");
        let arguments = function
            .and_then(|function| function.get("arguments"))
            .and_then(Value::as_str)
            .unwrap_or("{}");
        let input = serde_json::from_str::<Value>(arguments)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new()));
        blocks.push(serde_json::json!({
            "type": "tool_use",
            "id": string_field(call, "id"),
            "name": function.map(|function| string_field(function, "name")).unwrap_or_default(),
            "input": input,
        }));
    }
    blocks
}

/// Anthropic requires alternating roles; consecutive same-role turns merge.
fn push_turn(messages: &mut Vec<Value>, role: &str, blocks: Vec<Value>) {
    if blocks.is_empty() {
        return;
    }
    if let Some(last) = messages.last_mut() {
        if last.get("role").and_then(Value::as_str) == Some(role) {
            if let Some(Value::Array(existing)) = last.get_mut("content") {
                existing.extend(blocks);
                return;
            }
        }
    }
    messages.push(serde_json::json!({"role": role, "content": blocks}));
}

fn convert_tools(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter_map(|tool| tool.get("function"))
        .map(|function| {
            let mut out = Map::new();
            out.insert("name".to_string(), Value::String(string_field(function, "name")));
            if let Some(description) = function.get("description").and_then(Value::as_str) {
                out.insert(
                    "description".to_string(),
                    Value::String(description.to_string()),
                );
            }
            out.insert(
                "input_schema".to_string(),
                function
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            );
            Value::Object(out)
        })
        .collect()
}

fn convert_tool_choice(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => Some(serde_json::json!({"type": "auto"})),
            "required" => Some(serde_json::json!({"type": "any"})),
            "none" => Some(serde_json::json!({"type": "none"})),
            _ => None,
        },
        Value::Object(obj) => obj
            .get("function")
            .and_then(|function| function.get("name"))
            .and_then(Value::as_str)
            .map(|name| serde_json::json!({"type": "tool", "name": name})),
        _ => None,
    }
}

impl Translator for AnthropicTranslator {
    fn request(
        &mut self,
        request: &ChatRequest,
        backend: &Backend,
    ) -> Result<BackendRequest, TranslateError> {
        self.stream = request.stream();
        self.model = request.model_for(backend);
        self.writer = Some(ChunkWriter::new(self.model.clone(), request.include_usage()));

        let mut system = Vec::<String>::new();
        let mut messages = Vec::<Value>::new();
        for message in request.messages() {
            let role = message.get("role").and_then(Value::as_str).unwrap_or_default();
            match role {
                "system" | "developer" => {
                    let text = content_text(message.get("content"));
                    if !text.is_empty() {
                        system.push(text);
                    }
                }
                "user" => push_turn(&mut messages, "user", user_blocks(message.get("content"))),
                "assistant" => push_turn(&mut messages, "assistant", assistant_blocks(message)),
                "tool" => push_turn(
                    &mut messages,
                    "user",
                    vec![serde_json::json!({
                        "type": "tool_result",
                        "tool_use_id": string_field(message, "tool_call_id"),
                        "content": content_text(message.get("content")),
                    })],
                ),
                other => {
                    return Err(TranslateError::InvalidRequest(format!(
                        "unsupported message role `{other}`"
                    )));
                }
            }
        }
        if messages.is_empty() {
            return Err(TranslateError::InvalidRequest(
                "at least one non-system message is required".to_string(),
            ));
        }

        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(self.model.clone()));
        body.insert("messages".to_string(), Value::Array(messages));
        if !system.is_empty() {
            body.insert("system".to_string(), Value::String(system.join("\n\n")));
        }
        body.insert(
            "max_tokens".to_string(),
            Value::from(request.max_tokens().unwrap_or(DEFAULT_MAX_TOKENS)),
        );
        for key in ["temperature", "top_p"] {
            if let Some(value) = request.get(key).filter(|value| value.is_number()) {
                body.insert(key.to_string(), value.clone());
            }
        }
        let stops = request.stop_sequences();
        if !stops.is_empty() {
            body.insert("stop_sequences".to_string(), serde_json::json!(stops));
        }
        if let Some(tools) = request.get("tools").and_then(Value::as_array) {
            let tools = convert_tools(tools);
            if !tools.is_empty() {
                body.insert("tools".to_string(), Value::Array(tools));
            }
        }
        if let Some(choice) = request.get("tool_choice").and_then(convert_tool_choice) {
            body.insert("tool_choice".to_string(), choice);
        }
        if let Some(user) = request.get("user").and_then(Value::as_str) {
            body.insert("metadata".to_string(), serde_json::json!({"user_id": user}));
        }
        if self.stream {
            body.insert("stream".to_string(), Value::Bool(true));
        }

        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let version = HeaderValue::from_str(&self.version).map_err(|_| {
            TranslateError::InvalidRequest(format!("invalid anthropic version `{}`", self.version))
        })?;
        headers.insert("anthropic-version", version);

        let body = serde_json::to_vec(&Value::Object(body))
            .map_err(|err| TranslateError::InvalidRequest(err.to_string()))?;
        Ok(BackendRequest {
            path: "/v1/messages".to_string(),
            headers,
            body: Bytes::from(body),
            stream: self.stream,
        })
    }

    fn response_body(
        &mut self,
        chunk: &[u8],
        end_of_stream: bool,
    ) -> Result<Bytes, TranslateError> {
        if !self.stream {
            return match buffer_unary(&mut self.unary, chunk, end_of_stream) {
                Some(body) => self.translate_unary(&body),
                None => Ok(Bytes::new()),
            };
        }

        let mut out = BytesMut::new();
        for frame in self.decoder.push(chunk)? {
            self.translate_frame(frame, &mut out)?;
        }
        if end_of_stream {
            if let Some(frame) = self.decoder.finish()? {
                self.translate_frame(frame, &mut out)?;
            }
            if !self.done {
                return Err(TranslateError::Malformed(
                    "stream ended before message_stop".to_string(),
                ));
            }
        }
        Ok(out.freeze())
    }

    fn error_body(&self, status: StatusCode, body: &[u8]) -> Bytes {
        match parse_object(body) {
            Ok(obj) if obj.get("error").is_some_and(Value::is_object) => {
                let kind = obj
                    .get("error")
                    .and_then(|error| error.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or_else(|| error_kind_for_status(status));
                crate::error::openai_error_body(kind, None, error_message(&obj))
            }
            _ => crate::error::openai_error_body(
                error_kind_for_status(status),
                None,
                raw_error_message(status, body),
            ),
        }
    }

    fn usage(&self) -> TokenUsage {
        TokenUsage::from_counts(self.input_tokens, self.output_tokens, None)
    }
}
