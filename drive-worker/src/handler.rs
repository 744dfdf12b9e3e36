use crate::message::MessageBody;
use async_trait::async_trait;
use conduit::connections::ConnectionContext;
use conduit::{NormalizedRecord, WorkerResult};
use parking_lot::Mutex;

/// Which messages a handler accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Exact `method` match.
    Method(String),
    /// `action` match, optionally narrowed to one provider. The provider is
    /// compared against both `provider` and `integration_id`.
    Action { action: String, provider: Option<String> },
    /// Inbound topic match for bodies that name neither a method nor an
    /// action, optionally narrowed to one provider like [`Route::Action`].
    Topic { topic: String, provider: Option<String> },
}

impl Route {
    pub fn method(name: &str) -> Self {
        Self::Method(name.to_string())
    }

    pub fn action(action: &str, provider: Option<&str>) -> Self {
        Self::Action {
            action: action.to_string(),
            provider: provider.map(str::to_string),
        }
    }

    pub fn topic(topic: &str, provider: Option<&str>) -> Self {
        Self::Topic {
            topic: topic.to_string(),
            provider: provider.map(str::to_string),
        }
    }

    /// Whether a body delivered on `topic` takes this route.
    pub fn matches(&self, topic: &str, body: &MessageBody) -> bool {
        let for_provider = |provider: &Option<String>| {
            provider
                .as_deref()
                .map_or(true, |p| body.provider() == Some(p) || body.integration_id() == Some(p))
        };
        match self {
            Route::Method(name) => body.method() == Some(name.as_str()),
            Route::Action { action, provider } => body.action() == Some(action.as_str()) && for_provider(provider),
            Route::Topic { topic: ours, provider } => {
                body.method().is_none() && body.action().is_none() && ours == topic && for_provider(provider)
            }
        }
    }

    /// True when some message could match both routes.
    pub fn overlaps(&self, other: &Route) -> bool {
        match (self, other) {
            (Route::Method(a), Route::Method(b)) => a == b,
            (
                Route::Action { action: a, provider: pa },
                Route::Action { action: b, provider: pb },
            ) => a == b && (pa.is_none() || pb.is_none() || pa == pb),
            (
                Route::Topic { topic: a, provider: pa },
                Route::Topic { topic: b, provider: pb },
            ) => a == b && (pa.is_none() || pb.is_none() || pa == pb),
            _ => false,
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Method(name) => write!(f, "method={}", name),
            Route::Action { action, provider: Some(p) } => write!(f, "action={} provider={}", action, p),
            Route::Action { action, provider: None } => write!(f, "action={}", action),
            Route::Topic { topic, provider: Some(p) } => write!(f, "topic={} provider={}", topic, p),
            Route::Topic { topic, provider: None } => write!(f, "topic={}", topic),
        }
    }
}

/// Receives records as a handler produces them.
///
/// Implementations decide delivery; the worker's sink suppresses duplicates
/// and publishes to the data topic.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn emit(&self, record: NormalizedRecord) -> WorkerResult<()>;
}

/// Sink that keeps records in memory.
#[derive(Default)]
pub struct CollectingSink {
    records: Mutex<Vec<NormalizedRecord>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<NormalizedRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl RecordSink for CollectingSink {
    async fn emit(&self, record: NormalizedRecord) -> WorkerResult<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// A unit of provider-specific work selected by routing.
///
/// Handlers are stateless with respect to messages: everything an invocation
/// needs arrives in the body and the resolved context. An invocation may be
/// retried from the start, so re-emitting records already emitted is
/// expected and harmless.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Routes this handler claims. Must not overlap another registered
    /// handler's routes.
    fn routes(&self) -> Vec<Route>;

    async fn handle(
        &self,
        body: &MessageBody,
        ctx: &ConnectionContext,
        sink: &dyn RecordSink,
    ) -> WorkerResult<()>;
}
