//! Google Gemini `generateContent` backends.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::{Map, Value};

use super::chat::{ChatCompletion, ChunkWriter, FinishReason, ToolCall};
use super::{
    BackendRequest, ChatRequest, SseDecoder, SseFrame, TokenUsage, TranslateError, Translator,
    TranslatorOptions, buffer_unary, content_text, error_kind_for_status, json_u32,
    parse_data_url, parse_object, raw_error_message,
};
use crate::config::{Backend, VersionedSchema};

pub const DEFAULT_VERSION: &str = "v1beta";

pub struct GeminiTranslator {
    version: String,
    decoder: SseDecoder,
    stream: bool,
    model: String,
    writer: Option<ChunkWriter>,
    frames: usize,
    tool_calls: usize,
    finish: Option<FinishReason>,
    usage: TokenUsage,
    unary: Vec<u8>,
}

struct Candidate {
    text: String,
    tool_calls: Vec<(String, String)>,
    finish: Option<FinishReason>,
}

impl GeminiTranslator {
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
            frames: 0,
            tool_calls: 0,
            finish: None,
            usage: TokenUsage::default(),
            unary: Vec::new(),
        }
    }

    /// `usageMetadata` is cumulative; the latest report wins.
    fn observe_usage(&mut self, obj: &Map<String, Value>) {
        let Some(usage) = obj.get("usageMetadata") else {
            return;
        };
        self.usage = TokenUsage::from_counts(
            json_u32(usage.get("promptTokenCount")).unwrap_or(0),
            json_u32(usage.get("candidatesTokenCount"))
                .unwrap_or(0)
                .saturating_add(json_u32(usage.get("thoughtsTokenCount")).unwrap_or(0)),
            json_u32(usage.get("totalTokenCount")),
        );
    }

    fn parse_candidate(obj: &Map<String, Value>) -> Result<Candidate, TranslateError> {
        let candidate = match obj.get("candidates") {
            Some(Value::Array(candidates)) => candidates.first(),
            Some(_) => {
                return Err(TranslateError::Malformed(
                    "`candidates` is not an array".to_string(),
                ));
            }
            None if obj.contains_key("promptFeedback") || obj.contains_key("usageMetadata") => None,
            None => {
                return Err(TranslateError::Malformed(
                    "response without `candidates`".to_string(),
                ));
            }
        };

        let mut out = Candidate {
            text: String::new(),
            tool_calls: Vec::new(),
            finish: None,
        };
        let blocked = obj
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .is_some();
        if blocked {
            out.finish = Some(FinishReason::ContentFilter);
        }
        let Some(candidate) = candidate else {
            return Ok(out);
        };

        for part in candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if part.get("thought").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                out.text.push_str(text);
            }
            if let Some(call) = part.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let args = call
                    .get("args")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()))
                    .to_string();
                out.tool_calls.push((name, args));
            }
        }
        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            out.finish = Some(finish_reason(reason, !out.tool_calls.is_empty()));
        }
        Ok(out)
    }

    fn translate_unary(&mut self, body: &[u8]) -> Result<Bytes, TranslateError> {
        let obj = parse_object(body)?;
        if let Some(error) = obj.get("error") {
            return Err(TranslateError::Upstream(
                error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            ));
        }
        let candidate = Self::parse_candidate(&obj)?;
        self.observe_usage(&obj);

        let tool_calls = candidate
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(index, (name, arguments))| ToolCall {
                id: format!("call_{index}"),
                name,
                arguments,
            })
            .collect::<Vec<_>>();
        let completion = ChatCompletion {
            id: obj
                .get("responseId")
                .and_then(Value::as_str)
                .unwrap_or("chatcmpl-aigw")
                .to_string(),
            model: obj
                .get("modelVersion")
                .and_then(Value::as_str)
                .unwrap_or(self.model.as_str())
                .to_string(),
            content: candidate.text,
            finish_reason: candidate.finish.unwrap_or(if tool_calls.is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolCalls
            }),
            tool_calls,
            usage: Some(self.usage),
        };
        Ok(completion.to_bytes())
    }

    fn translate_frame(&mut self, frame: SseFrame, out: &mut BytesMut) -> Result<(), TranslateError> {
        let obj = parse_object(frame.data.as_bytes())?;
        if let Some(error) = obj.get("error") {
            return Err(TranslateError::Upstream(
                error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            ));
        }
        let candidate = Self::parse_candidate(&obj)?;
        self.observe_usage(&obj);
        self.frames += 1;

        let writer = self
            .writer
            .get_or_insert_with(|| ChunkWriter::new(self.model.clone(), false));
        if let Some(id) = obj.get("responseId").and_then(Value::as_str) {
            writer.set_id(id);
        }
        writer.role(out);
        writer.content(out, &candidate.text);
        for (name, arguments) in &candidate.tool_calls {
            let index = self.tool_calls;
            self.tool_calls += 1;
            writer.tool_call_start(out, index, &format!("call_{index}"), name);
            writer.tool_call_arguments(out, index, arguments);
        }
        if let Some(finish) = candidate.finish {
            self.finish = Some(finish);
        }
        Ok(())
    }
}

fn finish_reason(reason: &str, has_tool_calls: bool) -> FinishReason {
    match reason {
        "STOP" if has_tool_calls => FinishReason::ToolCalls,
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            FinishReason::ContentFilter
        }
        "MALFORMED_FUNCTION_CALL" => FinishReason::Error,
        _ => FinishReason::Unknown,
    }
}

fn user_parts(content: Option<&Value>) -> Vec<Value> {
    match content {
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part.get("type").and_then(Value::as_str) {
                Some("text") => part
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|text| serde_json::json!({"text": text})),
                Some("image_url") => {
                    let url = part
                        .get("image_url")
                        .and_then(|image| image.get("url").or(Some(image)))
                        .and_then(Value::as_str)?;
                    Some(match parse_data_url(url) {
                        Some((mime_type, data)) => {
                            serde_json::json!({"inlineData": {"mimeType": mime_type, "data": data}})
                        }
                        None => serde_json::json!({"fileData": {"fileUri": url}}),
                    })
                }
                _ => None,
            })
            .collect(),
        other => {
            let text = content_text(other);
            if text.is_empty() {
                Vec::new()
            } else {
                vec![serde_json::json!({"text": text})]
            }
        }
    }
}

fn push_content(contents: &mut Vec<Value>, role: &str, parts: Vec<Value>) {
    if parts.is_empty() {
        return;
    }
    if let Some(last) = contents.last_mut() {
        if last.get("role").and_then(Value::as_str) == Some(role) {
            if let Some(Value::Array(existing)) = last.get_mut("parts") {
                existing.extend(parts);
                return;
            }
        }
    }
    contents.push(serde_json::json!({"role": role, "parts": parts}));
}

fn function_declarations(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter_map(|tool| tool.get("function"))
        .map(|function| {
            let mut out = Map::new();
            out.insert(
                "name".to_string(),
                function.get("name").cloned().unwrap_or(Value::Null),
            );
            if let Some(description) = function.get("description") {
                out.insert("description".to_string(), description.clone());
            }
            if let Some(parameters) = function.get("parameters") {
                out.insert("parameters".to_string(), parameters.clone());
            }
            Value::Object(out)
        })
        .collect()
}

fn tool_config(choice: &Value) -> Option<Value> {
    let (mode, allowed) = match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => ("AUTO", None),
            "required" => ("ANY", None),
            "none" => ("NONE", None),
            _ => return None,
        },
        Value::Object(obj) => (
            "ANY",
            obj.get("function")
                .and_then(|function| function.get("name"))
                .cloned(),
        ),
        _ => return None,
    };
    let mut config = Map::new();
    config.insert("mode".to_string(), Value::String(mode.to_string()));
    if let Some(name) = allowed {
        config.insert("allowedFunctionNames".to_string(), Value::Array(vec![name]));
    }
    Some(serde_json::json!({"functionCallingConfig": Value::Object(config)}))
}

impl Translator for GeminiTranslator {
    fn request(
        &mut self,
        request: &ChatRequest,
        backend: &Backend,
    ) -> Result<BackendRequest, TranslateError> {
        self.stream = request.stream();
        self.model = request.model_for(backend);
        self.writer = Some(ChunkWriter::new(self.model.clone(), request.include_usage()));

        let mut tool_names = HashMap::<String, String>::new();
        let mut system = Vec::<String>::new();
        let mut contents = Vec::<Value>::new();
        for message in request.messages() {
            match message.get("role").and_then(Value::as_str).unwrap_or_default() {
                "system" | "developer" => {
                    let text = content_text(message.get("content"));
                    if !text.is_empty() {
                        system.push(text);
                    }
                }
                "user" => push_content(&mut contents, "user", user_parts(message.get("content"))),
                "assistant" => {
                    let mut parts = Vec::new();
                    let text = content_text(message.get("content"));
                    if !text.is_empty() {
                        parts.push(serde_json::json!({"text": text}));
                    }
                    for call in message
                        .get("tool_calls")
                        .and_then(Value::as_array)
                        .into_iter()
                        .flatten()
                    {
                        let function = call.get("function");
                        let name = function
                            .and_then(|function| function.get("name"))
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        if let Some(id) = call.get("id").and_then(Value::as_str) {
                            tool_names.insert(id.to_string(), name.to_string());
                        }
                        let args = function
                            .and_then(|function| function.get("arguments"))
                            .and_then(Value::as_str)
                            .and_then(|arguments| serde_json::from_str::<Value>(arguments).ok())
                            .unwrap_or_else(|| Value::Object(Map::new()));
                        parts.push(serde_json::json!({"functionCall": {"name": name, "args": args}}));
                    }
                    push_content(&mut contents, "model", parts);
                }
                "tool" => {
                    let id = message
                        .get("tool_call_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let name = tool_names.get(id).cloned().unwrap_or_else(|| id.to_string());
                    push_content(
                        &mut contents,
                        "user",
                        vec![serde_json::json!({"functionResponse": {
                            "name": name,
                            "response": {"content": content_text(message.get("content"))},
                        }})],
                    );
                }
                other => {
                    return Err(TranslateError::InvalidRequest(format!(
                        "unsupported message role `{other}`"
                    )));
                }
            }
        }
        if contents.is_empty() {
            return Err(TranslateError::InvalidRequest(
                "at least one non-system message is required".to_string(),
            ));
        }

        let mut body = Map::<String, Value>::new();
        body.insert("contents".to_string(), Value::Array(contents));
        if !system.is_empty() {
            body.insert(
                "systemInstruction".to_string(),
                serde_json::json!({"parts": [{"text": system.join("\n\n")}]}),
            );
        }
        let mut generation = Map::<String, Value>::new();
        if let Some(value) = request.get("temperature").filter(|value| value.is_number()) {
            generation.insert("temperature".to_string(), value.clone());
        }
        if let Some(value) = request.get("top_p").filter(|value| value.is_number()) {
            generation.insert("topP".to_string(), value.clone());
        }
        if let Some(max_tokens) = request.max_tokens() {
            generation.insert("maxOutputTokens".to_string(), Value::from(max_tokens));
        }
        let stops = request.stop_sequences();
        if !stops.is_empty() {
            generation.insert("stopSequences".to_string(), serde_json::json!(stops));
        }
        if !generation.is_empty() {
            body.insert("generationConfig".to_string(), Value::Object(generation));
        }
        if let Some(tools) = request.get("tools").and_then(Value::as_array) {
            let declarations = function_declarations(tools);
            if !declarations.is_empty() {
                body.insert(
                    "tools".to_string(),
                    serde_json::json!([{"functionDeclarations": declarations}]),
                );
            }
        }
        if let Some(config) = request.get("tool_choice").and_then(tool_config) {
            body.insert("toolConfig".to_string(), config);
        }

        let model = urlencoding::encode(&self.model);
        let path = if self.stream {
            format!("/{}/models/{model}:streamGenerateContent?alt=sse", self.version)
        } else {
            format!("/{}/models/{model}:generateContent", self.version)
        };
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let body = serde_json::to_vec(&Value::Object(body))
            .map_err(|err| TranslateError::InvalidRequest(err.to_string()))?;
        Ok(BackendRequest {
            path,
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
            if self.frames == 0 {
                return Err(TranslateError::Malformed("empty stream".to_string()));
            }
            let finish = self.finish.unwrap_or(if self.tool_calls > 0 {
                FinishReason::ToolCalls
            } else {
                FinishReason::Stop
            });
            let usage = self.usage;
            if let Some(writer) = self.writer.as_mut() {
                writer.finish(&mut out, finish, usage);
            }
        }
        Ok(out.freeze())
    }

    fn error_body(&self, status: StatusCode, body: &[u8]) -> Bytes {
        // Gemini errors arrive either as an object or a one-element array.
        let parsed = serde_json::from_slice::<Value>(body).ok().map(|value| match value {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            other => other,
        });
        let error = parsed.as_ref().and_then(|value| value.get("error"));
        match error.and_then(|error| error.get("message")).and_then(Value::as_str) {
            Some(message) => crate::error::openai_error_body(
                error_kind_for_status(status),
                error.and_then(|error| error.get("status")).and_then(Value::as_str),
                message,
            ),
            None => crate::error::openai_error_body(
                error_kind_for_status(status),
                None,
                raw_error_message(status, body),
            ),
        }
    }

    fn usage(&self) -> TokenUsage {
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchemaName;

    fn translate_request(body: &[u8]) -> (GeminiTranslator, BackendRequest, Value) {
        let mut translator = GeminiTranslator::new(
            &VersionedSchema::new(SchemaName::GcpGemini),
            TranslatorOptions::default(),
        );
        let request = ChatRequest::parse(body).expect("request");
        let out = translator
            .request(&request, &Backend::new("gemini", SchemaName::GcpGemini))
            .expect("translate");
        let sent = serde_json::from_slice(&out.body).expect("json");
        (translator, out, sent)
    }

    #[test]
    fn builds_generate_content_request() {
        let (_, out, sent) = translate_request(
            br#"{"model":"gemini-2.0-flash","messages":[
                {"role":"system","content":"be brief"},
                {"role":"user","content":"hi"},
                {"role":"assistant","content":"hello"},
                {"role":"user","content":[{"type":"text","text":"look"},{"type":"image_url","image_url":{"url":"data:image/png;base64,AAAA"}}]}
            ],"max_completion_tokens":64,"temperature":0.1,"stop":"END"}"#,
        );
        assert_eq!(out.path, "/v1beta/models/gemini-2.0-flash:generateContent");
        assert_eq!(sent["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(sent["contents"][1]["role"], "model");
        assert_eq!(sent["contents"][2]["parts"][1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(sent["generationConfig"]["maxOutputTokens"], 64);
        assert_eq!(sent["generationConfig"]["stopSequences"], serde_json::json!(["END"]));
    }

    #[test]
    fn model_name_is_a_single_path_segment() {
        let (_, out, _) = translate_request(
            br#"{"model":"../tunedModels/x?key=1#frag","messages":[{"role":"user","content":"hi"}]}"#,
        );
        assert_eq!(
            out.path,
            "/v1beta/models/..%2FtunedModels%2Fx%3Fkey%3D1%23frag:generateContent"
        );
    }

    #[test]
    fn function_responses_use_the_call_name() {
        let (_, _, sent) = translate_request(
            br#"{"model":"m","messages":[
                {"role":"user","content":"weather?"},
                {"role":"assistant","tool_calls":[{"id":"c1","type":"function","function":{"name":"get_weather","arguments":"{\"city\":\"Oslo\"}"}}]},
                {"role":"tool","tool_call_id":"c1","content":"cold"}
            ],"tools":[{"type":"function","function":{"name":"get_weather","parameters":{"type":"object"}}}],
            "tool_choice":{"type":"function","function":{"name":"get_weather"}}}"#,
        );
        assert_eq!(sent["contents"][1]["parts"][0]["functionCall"]["args"]["city"], "Oslo");
        assert_eq!(
            sent["contents"][2]["parts"][0]["functionResponse"]["name"],
            "get_weather"
        );
        assert_eq!(
            sent["tools"][0]["functionDeclarations"][0]["name"],
            "get_weather"
        );
        assert_eq!(
            sent["toolConfig"]["functionCallingConfig"]["allowedFunctionNames"],
            serde_json::json!(["get_weather"])
        );
    }

    #[test]
    fn unary_response_maps_candidates_and_usage() {
        let (mut translator, _, _) =
            translate_request(br#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#);
        let body = br#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hi "},{"text":"there"}]},"finishReason":"MAX_TOKENS"}],
            "usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2,"totalTokenCount":6}}"#;
        let out = translator.response_body(body, true).expect("response");
        let value: Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(value["choices"][0]["message"]["content"], "Hi there");
        assert_eq!(value["choices"][0]["finish_reason"], "length");
        assert_eq!(value["usage"]["prompt_tokens"], 4);
        assert_eq!(translator.usage(), TokenUsage::new(4, 2, 6));
    }

    #[test]
    fn stream_uses_latest_cumulative_usage() {
        let (mut translator, out, _) = translate_request(
            br#"{"model":"m","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
        );
        assert_eq!(out.path, "/v1beta/models/m:streamGenerateContent?alt=sse");
        let sse = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}],\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":1,\"totalTokenCount\":4}}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":2,\"totalTokenCount\":5}}\n\n",
        );
        let out = translator.response_body(sse.as_bytes(), true).expect("stream");
        let text = std::str::from_utf8(&out).expect("utf8");
        assert!(text.contains("\"content\":\"Hel\""));
        assert!(text.contains("\"content\":\"lo\""));
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.ends_with("data: [DONE]\n\n"));
        assert_eq!(translator.usage(), TokenUsage::new(3, 2, 5));
    }

    #[test]
    fn empty_stream_is_malformed() {
        let (mut translator, _, _) = translate_request(
            br#"{"model":"m","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
        );
        let err = translator.response_body(b"", true).expect_err("empty");
        assert!(matches!(err, TranslateError::Malformed(_)), "{err}");
    }

    #[test]
    fn error_body_accepts_array_envelope() {
        let (translator, _, _) =
            translate_request(br#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#);
        let out = translator.error_body(
            StatusCode::BAD_REQUEST,
            br#"[{"error":{"code":400,"message":"API key not valid","status":"INVALID_ARGUMENT"}}]"#,
        );
        let value: Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(value["error"]["message"], "API key not valid");
        assert_eq!(value["error"]["code"], "INVALID_ARGUMENT");
        assert_eq!(value["error"]["type"], "invalid_request_error");
    }
}
