//! Data-plane core of an AI gateway external processor: header-based routing
//! to backend candidates, OpenAI-to-backend schema translation, bounded
//! failover and per-request usage recording.

pub mod config;
pub mod context;
mod error;
pub mod failover;
pub mod processor;
pub mod recorder;
pub mod router;
pub mod telemetry;
pub mod translator;
pub mod upstream;

#[doc(hidden)]
pub mod test_support;

pub use config::{
    Backend, ConfigDocument, ConfigError, ConfigFormat, ConfigSnapshot, ConfigWatcher,
    HeaderMatch, RouteRule, SchemaName, SnapshotStore, VersionedSchema,
};
pub use context::RequestContext;
pub use error::{GatewayError, Result};
pub use failover::{AttemptState, FailoverCoordinator};
pub use processor::{
    BACKEND_HEADER_KEY, ExternalProcessor, ProcessingEvent, ProcessingResponse, ProcessorOptions,
};
pub use recorder::{
    LogRecorder, MemoryRecorder, PrometheusRecorder, RecorderError, RecorderFactory, Recorders,
    UsageEvent, UsageRecorder,
};
pub use router::{Route, RouteError, RouteResolver, RuleRouter};
pub use translator::{ChatRequest, TokenUsage, TranslateError, Translator};
#[cfg(feature = "http-upstream")]
pub use upstream::HttpUpstream;
pub use upstream::{Upstream, UpstreamError, UpstreamRequest, UpstreamResponse};
