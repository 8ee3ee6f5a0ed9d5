//! Per-exchange state shared by the adapter's phases.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use tracing::Span;

use crate::config::{Backend, ConfigSnapshot};
use crate::recorder::{Recorders, UsageEvent};
use crate::router::Route;
use crate::translator::TokenUsage;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("aigw-{ts_ms}-{seq}")
}

/// The caller's `x-request-id`, or a fresh one.
pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id)
}

/// Owns the snapshot, the usage recorders and the lifecycle flags of one
/// exchange. Completion is recorded exactly once; dropping an unfinished
/// context records a failed completion.
pub struct RequestContext {
    request_id: String,
    snapshot: Arc<ConfigSnapshot>,
    recorders: Recorders,
    span: Span,
    model: Option<String>,
    route: Option<Route>,
    usage: TokenUsage,
    response_started: bool,
    completed: bool,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        snapshot: Arc<ConfigSnapshot>,
        recorders: Recorders,
        span: Span,
    ) -> Self {
        Self {
            request_id,
            snapshot,
            recorders,
            span,
            model: None,
            route: None,
            usage: TokenUsage::default(),
            response_started: false,
            completed: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn snapshot(&self) -> &Arc<ConfigSnapshot> {
        &self.snapshot
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn response_started(&self) -> bool {
        self.response_started
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn start(&self) {
        self.recorders.emit(&UsageEvent::StartRequest);
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        let model = model.into();
        self.span.record("model", tracing::field::display(&model));
        self.recorders.emit(&UsageEvent::SetModel(model.clone()));
        self.model = Some(model);
    }

    pub fn set_route(&mut self, route: Route) {
        self.span.record("rule", tracing::field::display(&route.rule));
        self.route = Some(route);
    }

    /// Announces a new attempt. A backend with a model override reports the
    /// effective model first. Usage counted by an earlier attempt is dropped.
    pub fn set_backend(&mut self, backend: &Backend) {
        self.usage = TokenUsage::default();
        if let Some(model) = backend.model_name_override.as_deref() {
            self.recorders.emit(&UsageEvent::SetModel(model.to_string()));
        }
        self.span.record("backend", tracing::field::display(&backend.name));
        self.recorders
            .emit(&UsageEvent::SetBackend(backend.name.clone()));
    }

    pub fn set_usage(&mut self, usage: TokenUsage) {
        self.usage = usage;
    }

    pub fn mark_response_started(&mut self) {
        self.response_started = true;
    }

    /// Records final usage and the completion. Returns `false` when the
    /// exchange was already completed.
    pub fn complete(&mut self, success: bool) -> bool {
        if self.completed {
            return false;
        }
        self.completed = true;
        self.span.record("success", success);
        self.recorders.emit(&UsageEvent::TokenUsage(self.usage));
        self.recorders
            .emit(&UsageEvent::RequestCompletion { success });
        true
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if !self.completed {
            tracing::debug!(request_id = %self.request_id, "exchange dropped before completion");
            self.complete(false);
        }
    }
}
