//! The streaming boundary with the host proxy: one exchange per HTTP
//! transaction, driven by host events and answered with mutation
//! instructions.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt as _};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Instrument as _;
use tracing::field::Empty;

use crate::config::{Backend, SnapshotStore};
use crate::context::{RequestContext, request_id_from_headers};
use crate::error::{GatewayError, openai_error_value};
use crate::failover::{AttemptOutcome, FailoverCoordinator, StatusClass, classify_status};
use crate::recorder::{RecorderFactory, Recorders, UsageRecorder};
use crate::router::{RouteError, RouteResolver, RuleRouter};
use crate::translator::{
    self, ChatRequest, SseLimits, TranslateError, Translator, TranslatorOptions,
    raw_error_message,
};
use crate::upstream::{ByteStream, Upstream, UpstreamRequest, UpstreamResponse};

pub const BACKEND_HEADER_KEY: &str = "x-ai-eg-backend";
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

const MAX_BACKEND_ERROR_BODY_BYTES: usize = 64 * 1024;
const RESPONSE_CHANNEL_CAPACITY: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessorOptions {
    pub max_request_body_bytes: usize,
    pub max_unary_response_bytes: usize,
    pub sse: SseLimits,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_request_body_bytes: 8 * 1024 * 1024,
            max_unary_response_bytes: 16 * 1024 * 1024,
            sse: SseLimits::default(),
        }
    }
}

/// Events the host sends for one HTTP transaction.
#[derive(Clone, Debug)]
pub enum ProcessingEvent {
    RequestHeaders {
        method: Method,
        path: String,
        headers: HeaderMap,
        end_of_stream: bool,
    },
    RequestBody {
        chunk: Bytes,
        end_of_stream: bool,
    },
    /// Ends the request body.
    RequestTrailers { trailers: HeaderMap },
    Cancelled,
}

/// Instructions returned to the host.
#[derive(Clone, Debug, PartialEq)]
pub enum ProcessingResponse {
    /// Headers to add or replace on the forwarded request.
    RequestHeaders { set_headers: HeaderMap },
    ResponseHeaders {
        status: StatusCode,
        headers: HeaderMap,
    },
    ResponseBody {
        chunk: Bytes,
        end_of_stream: bool,
    },
    ImmediateResponse {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
}

impl ProcessingResponse {
    fn immediate(err: &GatewayError) -> Self {
        Self::ImmediateResponse {
            status: err.status(),
            headers: content_type("application/json"),
            body: err.client_body(),
        }
    }
}

/// Why an exchange stopped before delivering a response.
#[derive(Debug)]
enum Halt {
    /// The host went away; nothing more can be sent.
    Cancelled,
    /// Answer the client with this error.
    Failed(GatewayError),
}

impl From<GatewayError> for Halt {
    fn from(err: GatewayError) -> Self {
        Self::Failed(err)
    }
}

impl From<RouteError> for Halt {
    fn from(err: RouteError) -> Self {
        Self::Failed(err.into())
    }
}

impl From<TranslateError> for Halt {
    fn from(err: TranslateError) -> Self {
        Self::Failed(err.into())
    }
}

struct RequestHead {
    method: Method,
    path: String,
    headers: HeaderMap,
    end_of_stream: bool,
}

pub struct ExternalProcessor {
    snapshots: Arc<SnapshotStore>,
    router: Arc<dyn RouteResolver>,
    upstream: Arc<dyn Upstream>,
    recorders: Recorders,
    factories: Vec<Arc<dyn RecorderFactory>>,
    options: ProcessorOptions,
}

impl ExternalProcessor {
    pub fn new(snapshots: Arc<SnapshotStore>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            snapshots,
            router: Arc::new(RuleRouter::new()),
            upstream,
            recorders: Recorders::new(),
            factories: Vec::new(),
            options: ProcessorOptions::default(),
        }
    }

    pub fn with_router(mut self, router: Arc<dyn RouteResolver>) -> Self {
        self.router = router;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn UsageRecorder>) -> Self {
        self.recorders.push(recorder);
        self
    }

    pub fn with_recorder_factory(mut self, factory: Arc<dyn RecorderFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn with_options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    /// Runs one exchange on its own task. See [`Self::process`] for how
    /// `events` must behave.
    pub fn spawn<S>(self: &Arc<Self>, events: S) -> mpsc::Receiver<ProcessingResponse>
    where
        S: Stream<Item = ProcessingEvent> + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            processor.process(events, tx).await;
        });
        rx
    }

    /// Runs one exchange to completion. Returns when a response has been
    /// delivered, an error was answered, or the host went away.
    ///
    /// `events` must stay open until the exchange is over. The end of the
    /// stream is read as the host abandoning the request, so an adapter fed
    /// from a finite source such as `stream::iter` has to chain
    /// `stream::pending()` after the last request event or every request is
    /// cancelled as soon as its body has been read.
    pub async fn process<S>(&self, mut events: S, responses: mpsc::Sender<ProcessingResponse>)
    where
        S: Stream<Item = ProcessingEvent> + Unpin + Send,
    {
        let head = match events.next().await {
            Some(ProcessingEvent::RequestHeaders {
                method,
                path,
                headers,
                end_of_stream,
            }) => RequestHead {
                method,
                path,
                headers,
                end_of_stream,
            },
            Some(ProcessingEvent::Cancelled) | None => return,
            Some(_) => {
                tracing::warn!("exchange did not start with request headers");
                let err = GatewayError::InvalidRequest {
                    reason: "exchange must start with request headers".to_string(),
                };
                let _ = responses.send(ProcessingResponse::immediate(&err)).await;
                return;
            }
        };

        let request_id = request_id_from_headers(&head.headers);
        let span = tracing::info_span!(
            "aigw.extproc",
            request_id = %request_id,
            rule = Empty,
            model = Empty,
            backend = Empty,
            success = Empty,
        );
        let mut recorders = self.recorders.clone();
        for factory in &self.factories {
            recorders.push(factory.new_recorder());
        }
        let mut ctx = RequestContext::new(request_id, self.snapshots.load(), recorders, span.clone());

        async {
            let result = self.run(&mut ctx, head, &mut events, &responses).await;
            self.finish(&mut ctx, result, &responses).await;
        }
        .instrument(span)
        .await;
    }

    async fn finish(
        &self,
        ctx: &mut RequestContext,
        result: Result<(), Halt>,
        responses: &mpsc::Sender<ProcessingResponse>,
    ) {
        match result {
            Ok(()) => {}
            Err(Halt::Cancelled) => {
                tracing::info!("exchange cancelled by host");
                ctx.complete(false);
            }
            Err(Halt::Failed(err)) => {
                let status = err.status();
                if status.is_server_error() {
                    tracing::warn!(status = status.as_u16(), error = %err, "request failed");
                } else {
                    tracing::info!(status = status.as_u16(), error = %err, "request rejected");
                }
                let _ = responses.send(ProcessingResponse::immediate(&err)).await;
                ctx.complete(false);
            }
        }
    }

    async fn run<S>(
        &self,
        ctx: &mut RequestContext,
        head: RequestHead,
        events: &mut S,
        responses: &mpsc::Sender<ProcessingResponse>,
    ) -> Result<(), Halt>
    where
        S: Stream<Item = ProcessingEvent> + Unpin + Send,
    {
        ctx.start();
        if !is_chat_completions(&head.method, &head.path) {
            return Err(Halt::Failed(GatewayError::UnsupportedEndpoint {
                method: head.method.to_string(),
                path: head.path,
            }));
        }

        let model_header = ctx.snapshot().model_name_header_key().clone();
        let mut routing_headers = head.headers;
        let header_model = routing_headers
            .get(&model_header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map(str::to_string);
        if let Some(model) = header_model {
            ctx.set_model(model);
            self.route(ctx, &routing_headers)?;
        }

        let body = if head.end_of_stream {
            Bytes::new()
        } else {
            self.read_body(events).await?
        };
        let request = ChatRequest::parse(&body)?;

        if ctx.model().is_none() {
            let model = request.model().to_string();
            let value = HeaderValue::from_str(&model).map_err(|_| GatewayError::InvalidRequest {
                reason: format!("model `{model}` cannot be carried in a header"),
            })?;
            routing_headers.insert(model_header.clone(), value);
            ctx.set_model(model);
            self.route(ctx, &routing_headers)?;
        }

        let Some(route) = ctx.route().cloned() else {
            return Err(Halt::Failed(GatewayError::InvalidRequest {
                reason: "request was not routed".to_string(),
            }));
        };
        let mut set_headers = HeaderMap::new();
        insert_header(
            &mut set_headers,
            ctx.snapshot().selected_route_header_key().clone(),
            &route.rule,
        );
        insert_header(&mut set_headers, model_header, ctx.model().unwrap_or_default());
        send(responses, ProcessingResponse::RequestHeaders { set_headers }).await?;

        self.dispatch(ctx, route.backends, &request, events, responses)
            .await
    }

    fn route(&self, ctx: &mut RequestContext, headers: &HeaderMap) -> Result<(), Halt> {
        let route = self.router.resolve(headers, ctx.snapshot())?;
        tracing::debug!(rule = %route.rule, backends = ?route.backend_names(), "route resolved");
        ctx.set_route(route);
        Ok(())
    }

    async fn read_body<S>(&self, events: &mut S) -> Result<Bytes, Halt>
    where
        S: Stream<Item = ProcessingEvent> + Unpin + Send,
    {
        let limit = self.options.max_request_body_bytes;
        let mut body = BytesMut::new();
        loop {
            match events.next().await {
                Some(ProcessingEvent::RequestBody {
                    chunk,
                    end_of_stream,
                }) => {
                    if body.len().saturating_add(chunk.len()) > limit {
                        return Err(Halt::Failed(GatewayError::PayloadTooLarge { limit }));
                    }
                    body.extend_from_slice(&chunk);
                    if end_of_stream {
                        return Ok(body.freeze());
                    }
                }
                Some(ProcessingEvent::RequestTrailers { .. }) => return Ok(body.freeze()),
                Some(ProcessingEvent::RequestHeaders { .. }) => {
                    return Err(Halt::Failed(GatewayError::InvalidRequest {
                        reason: "request headers received twice".to_string(),
                    }));
                }
                Some(ProcessingEvent::Cancelled) | None => return Err(Halt::Cancelled),
            }
        }
    }

    /// Tries each candidate in order until one delivers or failover stops.
    async fn dispatch<S>(
        &self,
        ctx: &mut RequestContext,
        backends: Vec<Backend>,
        request: &ChatRequest,
        events: &mut S,
        responses: &mpsc::Sender<ProcessingResponse>,
    ) -> Result<(), Halt>
    where
        S: Stream<Item = ProcessingEvent> + Unpin + Send,
    {
        let mut failover = FailoverCoordinator::new(backends);
        let mut next = failover.start();
        while let Some(backend) = next {
            ctx.set_backend(&backend);
            let mut set_headers = HeaderMap::new();
            insert_header(
                &mut set_headers,
                HeaderName::from_static(BACKEND_HEADER_KEY),
                &backend.name,
            );
            send(responses, ProcessingResponse::RequestHeaders { set_headers }).await?;
            tracing::debug!(backend = %backend.name, attempt = failover.attempted().len(), "attempting backend");

            let outcome = tokio::select! {
                biased;
                _ = wait_for_cancel(events, responses) => return Err(Halt::Cancelled),
                outcome = self.attempt(ctx, &backend, request, responses) => outcome?,
            };

            match outcome {
                AttemptOutcome::Delivered => {
                    failover.succeed();
                    ctx.complete(true);
                    return Ok(());
                }
                AttemptOutcome::Retryable(reason) => {
                    tracing::warn!(backend = %backend.name, error = %reason, "backend attempt failed");
                    next = failover.fail_retryable(reason, ctx.response_started());
                }
                AttemptOutcome::Rejected { status, body } => {
                    failover.fail_fatal(format!("backend {} returned {status}", backend.name));
                    return Err(Halt::Failed(GatewayError::Rejected { status, body }));
                }
                AttemptOutcome::Broken(reason) => {
                    tracing::warn!(backend = %backend.name, error = %reason, "backend stream failed after response started");
                    failover.fail_fatal(reason.clone());
                    send(
                        responses,
                        ProcessingResponse::ResponseBody {
                            chunk: stream_error_frame(&reason),
                            end_of_stream: true,
                        },
                    )
                    .await?;
                    ctx.complete(false);
                    return Ok(());
                }
            }
        }
        Err(Halt::Failed(failover.exhausted_error()))
    }

    async fn attempt(
        &self,
        ctx: &mut RequestContext,
        backend: &Backend,
        request: &ChatRequest,
        responses: &mpsc::Sender<ProcessingResponse>,
    ) -> Result<AttemptOutcome, Halt> {
        let mut translator = translator::for_pair(
            ctx.snapshot().schema(),
            &backend.schema,
            TranslatorOptions {
                sse: self.options.sse,
            },
        )?;
        let translated = translator.request(request, backend)?;
        let stream = translated.stream;

        let response = match self
            .upstream
            .send(UpstreamRequest {
                backend: backend.clone(),
                path: translated.path,
                headers: translated.headers,
                body: translated.body,
                stream,
            })
            .await
        {
            Ok(response) => response,
            Err(err) => return Ok(AttemptOutcome::Retryable(err.to_string())),
        };

        let UpstreamResponse {
            status, mut body, ..
        } = response;
        match classify_status(status) {
            StatusClass::Success => {}
            StatusClass::Retryable => {
                let error = read_error_body(&mut body).await;
                return Ok(AttemptOutcome::Retryable(format!(
                    "backend {} returned {status}: {}",
                    backend.name,
                    raw_error_message(status, &error)
                )));
            }
            StatusClass::Rejected => {
                let error = read_error_body(&mut body).await;
                return Ok(AttemptOutcome::Rejected {
                    status,
                    body: translator.error_body(status, &error),
                });
            }
        }

        self.forward(ctx, translator.as_mut(), status, body, stream, responses)
            .await
    }

    /// Streams the translated response to the host. Response headers go out
    /// with the first non-empty chunk.
    async fn forward(
        &self,
        ctx: &mut RequestContext,
        translator: &mut dyn Translator,
        status: StatusCode,
        mut body: ByteStream,
        stream: bool,
        responses: &mpsc::Sender<ProcessingResponse>,
    ) -> Result<AttemptOutcome, Halt> {
        let limit = self.options.max_unary_response_bytes;
        let mut received = 0usize;
        loop {
            let (chunk, end_of_stream) = match body.next().await {
                Some(Ok(chunk)) => (chunk, false),
                Some(Err(err)) => return Ok(attempt_failure(ctx, err.to_string())),
                None => (Bytes::new(), true),
            };
            if !stream {
                received = received.saturating_add(chunk.len());
                if received > limit {
                    return Ok(attempt_failure(
                        ctx,
                        format!("backend response exceeds {limit} bytes"),
                    ));
                }
            }

            let translated = translator.response_body(&chunk, end_of_stream);
            ctx.set_usage(translator.usage());
            let out = match translated {
                Ok(out) => out,
                Err(err) => return Ok(attempt_failure(ctx, err.to_string())),
            };

            if !ctx.response_started() {
                if out.is_empty() {
                    if end_of_stream {
                        return Ok(attempt_failure(
                            ctx,
                            "backend returned an empty response".to_string(),
                        ));
                    }
                    continue;
                }
                let headers = if stream {
                    content_type("text/event-stream")
                } else {
                    content_type("application/json")
                };
                send(
                    responses,
                    ProcessingResponse::ResponseHeaders { status, headers },
                )
                .await?;
                ctx.mark_response_started();
            }

            if !out.is_empty() || end_of_stream {
                send(
                    responses,
                    ProcessingResponse::ResponseBody {
                        chunk: out,
                        end_of_stream,
                    },
                )
                .await?;
            }
            if end_of_stream {
                return Ok(AttemptOutcome::Delivered);
            }
        }
    }
}

fn is_chat_completions(method: &Method, path: &str) -> bool {
    let path = path.split_once('?').map(|(path, _)| path).unwrap_or(path);
    method == Method::POST && path == CHAT_COMPLETIONS_PATH
}

fn content_type(value: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static(value));
    headers
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::warn!(header = %name, "value cannot be sent as a header, skipped"),
    }
}

fn attempt_failure(ctx: &RequestContext, reason: String) -> AttemptOutcome {
    if ctx.response_started() {
        AttemptOutcome::Broken(reason)
    } else {
        AttemptOutcome::Retryable(reason)
    }
}

fn stream_error_frame(reason: &str) -> Bytes {
    let value = openai_error_value("api_error", Some("upstream_stream_error"), reason);
    Bytes::from(format!("data: {value}\n\n"))
}

async fn send(
    responses: &mpsc::Sender<ProcessingResponse>,
    response: ProcessingResponse,
) -> Result<(), Halt> {
    responses.send(response).await.map_err(|_| Halt::Cancelled)
}

/// Resolves when the host abandons the exchange: its event stream ends or
/// says so, or the response receiver is dropped.
async fn wait_for_cancel<S>(events: &mut S, responses: &mpsc::Sender<ProcessingResponse>)
where
    S: Stream<Item = ProcessingEvent> + Unpin + Send,
{
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(ProcessingEvent::Cancelled) | None => return,
                Some(_) => tracing::debug!("ignoring host event while a backend call is in flight"),
            },
            _ = responses.closed() => return,
        }
    }
}

async fn read_error_body(body: &mut ByteStream) -> Bytes {
    let mut out = BytesMut::new();
    while let Some(next) = body.next().await {
        let Ok(chunk) = next else {
            break;
        };
        let remaining = MAX_BACKEND_ERROR_BODY_BYTES.saturating_sub(out.len());
        if remaining == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_chat_completions_post_is_handled() {
        assert!(is_chat_completions(&Method::POST, "/v1/chat/completions"));
        assert!(is_chat_completions(
            &Method::POST,
            "/v1/chat/completions?api-version=1"
        ));
        assert!(!is_chat_completions(&Method::GET, "/v1/chat/completions"));
        assert!(!is_chat_completions(&Method::POST, "/v1/embeddings"));
    }

    #[test]
    fn stream_error_frame_is_an_openai_error() {
        let frame = stream_error_frame("connection reset");
        let text = std::str::from_utf8(&frame).expect("utf8");
        let json = text
            .strip_prefix("data: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .expect("sse frame");
        let value: serde_json::Value = serde_json::from_str(json).expect("json");
        assert_eq!(value["error"]["message"], "connection reset");
        assert_eq!(value["error"]["type"], "api_error");
        assert_eq!(value["error"]["code"], "upstream_stream_error");
    }

    #[test]
    fn options_default_when_fields_are_missing() {
        let options: ProcessorOptions =
            serde_json::from_str(r#"{"max_request_body_bytes": 1024}"#).expect("options");
        assert_eq!(options.max_request_body_bytes, 1024);
        assert_eq!(options.max_unary_response_bytes, 16 * 1024 * 1024);
        assert_eq!(options.sse, SseLimits::default());
    }
}
