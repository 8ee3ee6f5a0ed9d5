//! OpenAI backends: the request passes through with the model override and
//! a usage request for streams; responses pass through while usage is read.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::{Map, Value};

use super::chat::DONE_FRAME;
use super::{
    BackendRequest, ChatRequest, SseDecoder, SseFrame, TokenUsage, TranslateError, Translator,
    TranslatorOptions, buffer_unary, error_kind_for_status, json_u32, parse_object,
    raw_error_message,
};
use crate::config::{Backend, VersionedSchema};

const DEFAULT_VERSION: &str = "v1";

pub struct OpenAiTranslator {
    version: String,
    decoder: SseDecoder,
    stream: bool,
    client_wants_usage: bool,
    saw_done: bool,
    unary: Vec<u8>,
    usage: TokenUsage,
}

impl OpenAiTranslator {
    pub fn new(schema: &VersionedSchema, options: TranslatorOptions) -> Self {
        Self {
            version: schema
                .version
                .clone()
                .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            decoder: SseDecoder::new(options.sse),
            stream: false,
            client_wants_usage: false,
            saw_done: false,
            unary: Vec::new(),
            usage: TokenUsage::default(),
        }
    }

    fn observe_usage(&mut self, obj: &Map<String, Value>) {
        let Some(usage) = obj.get("usage").filter(|usage| usage.is_object()) else {
            return;
        };
        self.usage = TokenUsage::from_counts(
            json_u32(usage.get("prompt_tokens")).unwrap_or(0),
            json_u32(usage.get("completion_tokens")).unwrap_or(0),
            json_u32(usage.get("total_tokens")),
        );
    }

    fn translate_frame(&mut self, frame: SseFrame, out: &mut BytesMut) -> Result<(), TranslateError> {
        if frame.is_done() {
            self.saw_done = true;
            out.extend_from_slice(DONE_FRAME);
            return Ok(());
        }
        let obj = parse_object(frame.data.as_bytes())?;
        if let Some(error) = obj.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(TranslateError::Upstream(message.to_string()));
        }
        self.observe_usage(&obj);

        let usage_only = obj
            .get("choices")
            .and_then(Value::as_array)
            .is_some_and(Vec::is_empty)
            && obj.get("usage").is_some_and(Value::is_object);
        if usage_only && !self.client_wants_usage {
            return Ok(());
        }

        for line in frame.data.split('\n') {
            out.extend_from_slice(b"data: ");
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\n");
        }
        out.extend_from_slice(b"\n");
        Ok(())
    }
}

impl Translator for OpenAiTranslator {
    fn request(
        &mut self,
        request: &ChatRequest,
        backend: &Backend,
    ) -> Result<BackendRequest, TranslateError> {
        self.stream = request.stream();
        self.client_wants_usage = request.include_usage();

        let mut body = request.body().clone();
        body.insert("model".to_string(), Value::String(request.model_for(backend)));
        if self.stream {
            let options = body
                .entry("stream_options")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(options) = options {
                options.insert("include_usage".to_string(), Value::Bool(true));
            }
        }

        let body = serde_json::to_vec(&Value::Object(body))
            .map_err(|err| TranslateError::InvalidRequest(err.to_string()))?;
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(BackendRequest {
            path: format!("/{}/chat/completions", self.version),
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
            let Some(body) = buffer_unary(&mut self.unary, chunk, end_of_stream) else {
                return Ok(Bytes::new());
            };
            let obj = parse_object(&body)?;
            if !obj.contains_key("choices") {
                return Err(TranslateError::Malformed(
                    "chat completion without `choices`".to_string(),
                ));
            }
            self.observe_usage(&obj);
            return Ok(Bytes::from(body));
        }

        let mut out = BytesMut::new();
        for frame in self.decoder.push(chunk)? {
            self.translate_frame(frame, &mut out)?;
        }
        if end_of_stream {
            if let Some(frame) = self.decoder.finish()? {
                self.translate_frame(frame, &mut out)?;
            }
            if !self.saw_done {
                return Err(TranslateError::Malformed(
                    "stream ended before [DONE]".to_string(),
                ));
            }
        }
        Ok(out.freeze())
    }

    fn error_body(&self, status: StatusCode, body: &[u8]) -> Bytes {
        // Already in the client's shape when it parses as an OpenAI error.
        if let Ok(obj) = parse_object(body) {
            if obj.get("error").is_some_and(Value::is_object) {
                return Bytes::copy_from_slice(body);
            }
        }
        crate::error::openai_error_body(
            error_kind_for_status(status),
            None,
            raw_error_message(status, body),
        )
    }

    fn usage(&self) -> TokenUsage {
        self.usage
    }
}
