use aigw_extproc::translator::{self, TranslatorOptions};
use aigw_extproc::{Backend, ChatRequest, SchemaName, TokenUsage, Translator, VersionedSchema};
use serde_json::{Value, json};

const OPENAI_STREAM: &str = concat!(
    "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
    "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Héllo\"}}]}\n\n",
    "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" world\"}}]}\n\n",
    "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
    "data: [DONE]\n\n",
);

const ANTHROPIC_STREAM: &str = concat!(
    "event: message_start\n",
    "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-3-5-sonnet\",\"usage\":{\"input_tokens\":3,\"output_tokens\":1}}}\n\n",
    "event: content_block_start\n",
    "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
    "event: ping\n",
    "data: {\"type\":\"ping\"}\n\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Héllo\"}}\n\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" world\"}}\n\n",
    "event: content_block_stop\n",
    "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
    "event: message_delta\n",
    "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"max_tokens\"},\"usage\":{\"output_tokens\":2}}\n\n",
    "event: message_stop\n",
    "data: {\"type\":\"message_stop\"}\n\n",
);

const GEMINI_STREAM: &str = concat!(
    "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Héllo\"}]}}],\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":1,\"totalTokenCount\":4}}\r\n\r\n",
    "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\" world\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":2,\"totalTokenCount\":5}}\r\n\r\n",
);

/// What a client can observe from a translated stream.
#[derive(Debug, PartialEq)]
struct Observed {
    text: String,
    finish_reason: Option<String>,
    done: bool,
    usage: TokenUsage,
}

fn chat_request(stream: bool) -> ChatRequest {
    ChatRequest::parse(
        json!({
            "model": "test-model",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Say hello"}
            ],
            "stream": stream,
            "stream_options": {"include_usage": true},
        })
        .to_string()
        .as_bytes(),
    )
    .expect("chat request")
}

fn translator_for(schema: SchemaName, stream: bool) -> Box<dyn Translator> {
    let backend = Backend::new("backend", schema);
    let mut translator = translator::for_pair(
        &VersionedSchema::new(SchemaName::OpenAI),
        &backend.schema,
        TranslatorOptions::default(),
    )
    .expect("supported pair");
    let out = translator
        .request(&chat_request(stream), &backend)
        .expect("request translation");
    assert_eq!(out.stream, stream);
    translator
}

fn run(schema: SchemaName, raw: &str, chunk_size: usize) -> Observed {
    let mut translator = translator_for(schema, true);
    let mut out = Vec::new();
    for chunk in raw.as_bytes().chunks(chunk_size) {
        out.extend_from_slice(&translator.response_body(chunk, false).expect("chunk"));
    }
    out.extend_from_slice(&translator.response_body(&[], true).expect("end of stream"));

    let text = String::from_utf8(out).expect("utf8 output");
    let mut observed = Observed {
        text: String::new(),
        finish_reason: None,
        done: false,
        usage: translator.usage(),
    };
    for data in text
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
    {
        if data == "[DONE]" {
            observed.done = true;
            continue;
        }
        let chunk: Value = serde_json::from_str(data).expect("chunk json");
        if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str() {
            observed.text.push_str(content);
        }
        if let Some(reason) = chunk["choices"][0]["finish_reason"].as_str() {
            observed.finish_reason = Some(reason.to_string());
        }
    }
    observed
}

fn assert_chunking_does_not_matter(schema: SchemaName, raw: &str, expected: Observed) {
    let whole = run(schema, raw, raw.len());
    assert_eq!(whole, expected);
    for chunk_size in [1, 3, 17, 64] {
        assert_eq!(
            run(schema, raw, chunk_size),
            whole,
            "chunk size {chunk_size} for {schema}"
        );
    }
}

#[test]
fn openai_stream_is_independent_of_chunking() {
    assert_chunking_does_not_matter(
        SchemaName::OpenAI,
        OPENAI_STREAM,
        Observed {
            text: "Héllo world".to_string(),
            finish_reason: Some("stop".to_string()),
            done: true,
            usage: TokenUsage::new(3, 2, 5),
        },
    );
}

#[test]
fn anthropic_stream_is_independent_of_chunking() {
    assert_chunking_does_not_matter(
        SchemaName::Anthropic,
        ANTHROPIC_STREAM,
        Observed {
            text: "Héllo world".to_string(),
            finish_reason: Some("length".to_string()),
            done: true,
            usage: TokenUsage::new(3, 2, 5),
        },
    );
}

#[test]
fn gemini_stream_is_independent_of_chunking() {
    assert_chunking_does_not_matter(
        SchemaName::GcpGemini,
        GEMINI_STREAM,
        Observed {
            text: "Héllo world".to_string(),
            finish_reason: Some("stop".to_string()),
            done: true,
            usage: TokenUsage::new(3, 2, 5),
        },
    );
}

#[test]
fn openai_unary_response_passes_through_unchanged() {
    let body = r#"{"id":"chatcmpl-1","object":"chat.completion","created":1,"model":"gpt-4o-mini","choices":[{"index":0,"message":{"role":"assistant","content":"hi"},"finish_reason":"stop"}],"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#;
    let mut translator = translator_for(SchemaName::OpenAI, false);
    let (head, tail) = body.as_bytes().split_at(40);
    assert!(translator.response_body(head, false).expect("head").is_empty());
    let out = translator.response_body(tail, true).expect("tail");
    assert_eq!(&out[..], body.as_bytes());
    assert_eq!(translator.usage(), TokenUsage::new(1, 1, 2));
}

#[test]
fn unary_responses_become_chat_completions() {
    let cases = [
        (
            SchemaName::Anthropic,
            r#"{"id":"msg_1","type":"message","role":"assistant","model":"claude-3-5-sonnet","content":[{"type":"text","text":"Hello"}],"stop_reason":"end_turn","usage":{"input_tokens":4,"output_tokens":1}}"#,
            TokenUsage::new(4, 1, 5),
        ),
        (
            SchemaName::GcpGemini,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":1,"totalTokenCount":5}}"#,
            TokenUsage::new(4, 1, 5),
        ),
    ];
    for (schema, body, usage) in cases {
        let mut translator = translator_for(schema, false);
        let out = translator
            .response_body(body.as_bytes(), true)
            .expect("translated");
        let completion: Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(completion["object"], "chat.completion", "{schema}");
        assert_eq!(completion["choices"][0]["message"]["role"], "assistant");
        assert_eq!(completion["choices"][0]["message"]["content"], "Hello");
        assert_eq!(completion["choices"][0]["finish_reason"], "stop");
        assert_eq!(completion["usage"]["total_tokens"], 5);
        assert_eq!(translator.usage(), usage, "{schema}");
    }
}

#[test]
fn backend_errors_are_returned_in_openai_shape() {
    let cases = [
        (
            SchemaName::Anthropic,
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"max_tokens too large"}}"#,
            "max_tokens too large",
        ),
        (
            SchemaName::GcpGemini,
            r#"[{"error":{"code":400,"message":"bad temperature","status":"INVALID_ARGUMENT"}}]"#,
            "bad temperature",
        ),
    ];
    for (schema, body, message) in cases {
        let translator = translator_for(schema, false);
        let out = translator.error_body(http::StatusCode::BAD_REQUEST, body.as_bytes());
        let error: Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(error["error"]["message"], message, "{schema}");
        assert_eq!(error["error"]["type"], "invalid_request_error", "{schema}");
    }
}

fn tool_request() -> ChatRequest {
    ChatRequest::parse(
        json!({
            "model": "test-model",
            "messages": [
                {"role": "system", "content": "Use tools."},
                {"role": "user", "content": "Weather in Paris?"}
            ],
            "temperature": 0.5,
            "top_p": 0.9,
            "max_tokens": 128,
            "stop": ["END"],
            "user": "user-7",
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "Current weather",
                    "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
                }
            }],
        })
        .to_string()
        .as_bytes(),
    )
    .expect("chat request")
}

/// Builds the backend's reply calling the first declared tool with `args`.
fn echo_tool_call(schema: SchemaName, sent: &Value, args: &Value) -> Value {
    match schema {
        SchemaName::Anthropic => json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": sent["model"],
            "content": [{
                "type": "tool_use",
                "id": "toolu_1",
                "name": sent["tools"][0]["name"],
                "input": args,
            }],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5},
        }),
        SchemaName::GcpGemini => json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{"functionCall": {
                        "name": sent["tools"][0]["functionDeclarations"][0]["name"],
                        "args": args,
                    }}],
                },
                "finishReason": "STOP",
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5, "totalTokenCount": 15},
        }),
        SchemaName::OpenAI => json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": sent["model"],
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": sent["tools"][0]["function"]["name"],
                            "arguments": args.to_string(),
                        },
                    }],
                },
                "finish_reason": "tool_calls",
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
        }),
    }
}

#[test]
fn sampling_fields_reach_each_backend() {
    let request = tool_request();
    let backend = Backend::new("b", SchemaName::OpenAI);

    let mut openai = translator_for(SchemaName::OpenAI, false);
    let sent: Value =
        serde_json::from_slice(&openai.request(&request, &backend).expect("openai").body)
            .expect("json");
    for key in ["temperature", "top_p", "max_tokens", "stop", "user", "tools", "messages"] {
        assert_eq!(sent[key], request.body()[key], "openai {key}");
    }

    let backend = Backend::new("b", SchemaName::Anthropic);
    let mut anthropic = translator_for(SchemaName::Anthropic, false);
    let sent: Value =
        serde_json::from_slice(&anthropic.request(&request, &backend).expect("anthropic").body)
            .expect("json");
    assert_eq!(sent["system"], "Use tools.");
    assert_eq!(sent["temperature"], 0.5);
    assert_eq!(sent["top_p"], 0.9);
    assert_eq!(sent["max_tokens"], 128);
    assert_eq!(sent["stop_sequences"], json!(["END"]));
    assert_eq!(sent["metadata"]["user_id"], "user-7");
    assert_eq!(sent["tools"][0]["description"], "Current weather");
    assert_eq!(sent["tools"][0]["input_schema"]["properties"]["city"]["type"], "string");

    let backend = Backend::new("b", SchemaName::GcpGemini);
    let mut gemini = translator_for(SchemaName::GcpGemini, false);
    let sent: Value =
        serde_json::from_slice(&gemini.request(&request, &backend).expect("gemini").body)
            .expect("json");
    assert_eq!(sent["systemInstruction"]["parts"][0]["text"], "Use tools.");
    assert_eq!(sent["generationConfig"]["temperature"], 0.5);
    assert_eq!(sent["generationConfig"]["topP"], 0.9);
    assert_eq!(sent["generationConfig"]["maxOutputTokens"], 128);
    assert_eq!(sent["generationConfig"]["stopSequences"], json!(["END"]));
    assert_eq!(
        sent["tools"][0]["functionDeclarations"][0]["parameters"]["properties"]["city"]["type"],
        "string"
    );
}

#[test]
fn tool_calls_round_trip_through_every_backend() {
    let request = tool_request();
    let args = json!({"city": "Paris"});
    for schema in [SchemaName::OpenAI, SchemaName::Anthropic, SchemaName::GcpGemini] {
        let backend = Backend::new("b", schema).with_model_name_override("backend-model");
        let mut translator = translator::for_pair(
            &VersionedSchema::new(SchemaName::OpenAI),
            &backend.schema,
            TranslatorOptions::default(),
        )
        .expect("supported pair");
        let out = translator.request(&request, &backend).expect("request");
        let sent: Value = serde_json::from_slice(&out.body).expect("json");
        if schema != SchemaName::GcpGemini {
            assert_eq!(sent["model"], "backend-model", "{schema}");
        } else {
            assert!(out.path.contains("/models/backend-model:generateContent"), "{}", out.path);
        }

        let reply = echo_tool_call(schema, &sent, &args).to_string();
        let completion: Value = serde_json::from_slice(
            &translator
                .response_body(reply.as_bytes(), true)
                .expect("response"),
        )
        .expect("completion json");
        let call = &completion["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(call["type"], "function", "{schema}");
        assert_eq!(call["function"]["name"], "get_weather", "{schema}");
        let echoed: Value = serde_json::from_str(
            call["function"]["arguments"].as_str().expect("arguments string"),
        )
        .expect("arguments json");
        assert_eq!(echoed, args, "{schema}");
        assert_eq!(completion["choices"][0]["finish_reason"], "tool_calls", "{schema}");
        assert_eq!(translator.usage(), TokenUsage::new(10, 5, 15), "{schema}");
    }
}
