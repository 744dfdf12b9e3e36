//! Orchestration loop.
//!
//! ```text
//!  poll ──► parse ──► integration filter ──► connection key busy? ──► slot (semaphore)
//!                                                  │ yes                    │
//!                                            skip / nack                    ▼
//!                                                           spawn invocation (JoinSet)
//!                                                                            │
//!   dispatch ──► retry { timeout { resolve context ─► handler ─► sink } } ◄──┘
//!                                                                  │
//!                                          claim key ─► publish ingestion.data
//!
//!   outcome:  ok            ─► commit
//!             retriable     ─► error record (retriable), leave for redelivery
//!             terminal      ─► error record (terminal), commit
//!             cancelled     ─► leave for redelivery
//! ```
//!
//! At most one invocation runs per connection key. A message keyed by an
//! external identity also takes its resolved connection id for the length of
//! each attempt, so it never overlaps an id-addressed message for the same
//! connection. Commit happens only after
//! every record of the message was published or suppressed as a duplicate,
//! or after a terminal failure reached the error channel.

use crate::handler::{Handler, RecordSink};
use crate::message::MessageBody;
use crate::registry::HandlerRegistry;
use crate::resolver::IdentityResolver;
use crate::retry::{run_with_retry, RetryPolicy};
use async_trait::async_trait;
use chrono::Utc;
use conduit::bus::{InboundMessage, InboundQueue, OutboundQueue};
use conduit::config::{BusyKeyPolicy, WorkerConfig};
use conduit::connections::{ConnectionContext, ConnectionDirectory};
use conduit::idempotency::IdempotencyCache;
use conduit::metrics::WorkerMetrics;
use conduit::nats::HEADER_IDEMPOTENCY_KEY;
use conduit::{ErrorRecord, NormalizedRecord, WorkerError, WorkerResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed poll before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// How long cancelled invocations get to unwind once the grace period is over.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Key used when a message names no connection at all.
const UNKNOWN_KEY: &str = "unknown";

/// Collaborators the loop drives.
#[derive(Clone)]
pub struct WorkerDeps {
    pub inbound: Arc<dyn InboundQueue>,
    pub outbound: Arc<dyn OutboundQueue>,
    pub directory: Arc<dyn ConnectionDirectory>,
    pub registry: Arc<HandlerRegistry>,
    pub resolver: Arc<IdentityResolver>,
    pub idempotency: Arc<IdempotencyCache>,
    pub metrics: Arc<WorkerMetrics>,
}

/// Liveness and occupancy, shared with the health API.
#[derive(Default)]
pub struct WorkerState {
    running: AtomicBool,
    polling: AtomicBool,
    active: Mutex<HashSet<String>>,
    released: Notify,
}

impl WorkerState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True once the loop has completed a poll and is still running.
    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active.lock().contains(key)
    }

    /// Mark `key` busy. False if another invocation already holds it.
    fn try_activate(&self, key: &str) -> bool {
        self.active.lock().insert(key.to_string())
    }

    fn deactivate(&self, key: &str) {
        self.active.lock().remove(key);
        self.released.notify_waiters();
    }

    /// Wait until `key` is free, then claim it. Only taken by invocations
    /// whose admission key was not a connection id; holders of connection
    /// keys never wait, so waits cannot form a cycle.
    async fn hold(self: &Arc<Self>, key: &str) -> ActiveKey {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.try_activate(key) {
                return ActiveKey {
                    state: Arc::clone(self),
                    key: key.to_string(),
                };
            }
            debug!(connection_id = %key, "Resolved connection busy, waiting");
            released.await;
        }
    }
}

/// Releases a connection key when the invocation ends, however it ends.
struct ActiveKey {
    state: Arc<WorkerState>,
    key: String,
}

impl Drop for ActiveKey {
    fn drop(&mut self) {
        self.state.deactivate(&self.key);
    }
}

/// Un-claims an idempotency key unless the publish it guards completed.
struct ClaimGuard<'a> {
    cache: &'a IdempotencyCache,
    key: &'a str,
    published: bool,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.cache.release(self.key);
        }
    }
}

pub struct Worker {
    config: WorkerConfig,
    retry: RetryPolicy,
    prune_interval: Duration,
    deps: WorkerDeps,
    state: Arc<WorkerState>,
    permits: Arc<Semaphore>,
}

impl Worker {
    pub fn new(config: WorkerConfig, retry: RetryPolicy, deps: WorkerDeps) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_connections.max(1)));
        Self {
            config,
            retry,
            prune_interval: Duration::from_secs(300),
            deps,
            state: Arc::new(WorkerState::default()),
            permits,
        }
    }

    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    pub fn state(&self) -> Arc<WorkerState> {
        Arc::clone(&self.state)
    }

    /// Poll and process until `shutdown` fires, then drain in-flight
    /// invocations for up to the configured grace period.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let abort = CancellationToken::new();
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut last_prune = Instant::now();

        self.state.running.store(true, Ordering::SeqCst);
        info!(
            handlers = ?self.deps.registry.names(),
            max_concurrent_connections = self.config.max_concurrent_connections,
            integration_id = ?self.config.integration_id,
            "Worker started"
        );

        'poll: loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }
            if last_prune.elapsed() >= self.prune_interval {
                self.prune();
                last_prune = Instant::now();
            }

            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'poll,
                polled = self.deps.inbound.poll(self.config.poll_batch_size, self.config.poll_timeout()) => polled,
            };

            match polled {
                Ok(messages) => {
                    self.state.polling.store(true, Ordering::SeqCst);
                    for message in messages {
                        if !self.admit(message, &mut tasks, &shutdown, &abort).await {
                            break 'poll;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Poll failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break 'poll,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        self.state.polling.store(false, Ordering::SeqCst);
        self.state.running.store(false, Ordering::SeqCst);
        self.drain(&mut tasks, &abort).await;
        info!("Worker stopped");
    }

    async fn drain(&self, tasks: &mut JoinSet<()>, abort: &CancellationToken) {
        if tasks.is_empty() {
            return;
        }
        let grace = self.config.shutdown_grace();
        info!(in_flight = tasks.len(), grace_seconds = grace.as_secs(), "Draining in-flight invocations");

        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;
        if finished.is_ok() {
            return;
        }

        warn!(remaining = tasks.len(), "Grace period elapsed, cancelling invocations");
        abort.cancel();
        let unwound = tokio::time::timeout(CANCEL_DRAIN_TIMEOUT, async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;
        if unwound.is_err() {
            tasks.abort_all();
        }
    }

    fn prune(&self) {
        let idempotency = self.deps.idempotency.prune_expired();
        let resolver = self.deps.resolver.prune_expired();
        if idempotency + resolver > 0 {
            debug!(idempotency = idempotency, resolver = resolver, "Pruned expired cache entries");
        }
    }

    /// Admit one polled message. Returns false when shutdown interrupted the
    /// wait for a slot.
    async fn admit(
        self: &Arc<Self>,
        message: InboundMessage,
        tasks: &mut JoinSet<()>,
        shutdown: &CancellationToken,
        abort: &CancellationToken,
    ) -> bool {
        let body = match MessageBody::parse(&message.body) {
            Ok(body) => body,
            Err(e) => {
                self.settle(&message, None, None, Err(e)).await;
                return true;
            }
        };

        if let (Some(ours), Some(theirs)) = (self.config.integration_id.as_deref(), body.integration_id()) {
            if ours != theirs {
                debug!(delivery_id = %message.delivery_id, integration_id = %theirs, "Message for another integration");
                self.deps.metrics.record_filtered();
                self.commit(&message).await;
                return true;
            }
        }

        let key = partition_key(&message, &body);
        if !self.state.try_activate(&key) {
            self.deps.metrics.record_skipped_busy();
            debug!(
                delivery_id = %message.delivery_id,
                connection_key = %key,
                policy = ?self.config.busy_key_policy,
                "Connection busy, skipping delivery"
            );
            match self.config.busy_key_policy {
                BusyKeyPolicy::Skip => self.abandon(&message).await,
                BusyKeyPolicy::Nack => self.nack(&message).await,
            }
            return true;
        }
        let active = ActiveKey {
            state: Arc::clone(&self.state),
            key,
        };

        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            drop(active);
            self.abandon(&message).await;
            return false;
        };

        let worker = Arc::clone(self);
        let abort = abort.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let _active = active;
            worker.process(message, body, abort).await;
        });
        true
    }

    async fn process(&self, message: InboundMessage, body: MessageBody, abort: CancellationToken) {
        let Some(handler) = self.deps.registry.dispatch(&message.topic, &body) else {
            warn!(
                delivery_id = %message.delivery_id,
                topic = %message.topic,
                method = ?body.method(),
                action = ?body.action(),
                "No handler for message, dropping"
            );
            self.deps.metrics.record_unrouted();
            self.commit(&message).await;
            return;
        };

        let key = partition_key(&message, &body);
        let invocation = Invocation::new(self, body.message_id());
        let outcome = tokio::select! {
            outcome = self.invoke(handler.as_ref(), &body, &key, &invocation) => outcome,
            _ = abort.cancelled() => Err(WorkerError::Cancelled),
        };

        if matches!(outcome, Err(WorkerError::Authentication { .. })) && body.connection_id().is_none() {
            if let Some(identity) = body.external_identity() {
                self.deps.resolver.invalidate(identity);
            }
        }

        let resolved = invocation.resolved();
        debug!(
            handler = handler.name(),
            published = invocation.published.load(Ordering::Relaxed),
            suppressed = invocation.suppressed.load(Ordering::Relaxed),
            "Invocation finished"
        );
        self.settle(&message, Some(&body), resolved, outcome).await;
    }

    async fn invoke(
        &self,
        handler: &dyn Handler,
        body: &MessageBody,
        key: &str,
        invocation: &Invocation<'_>,
    ) -> WorkerResult<()> {
        let timeout = self.config.processing_timeout();
        run_with_retry(&self.retry, &self.deps.metrics, move |attempt| async move {
            debug!(handler = handler.name(), attempt = attempt, "Invoking handler");
            let call = async {
                let ctx = self.resolve_context(body).await?;
                let _connection = if ctx.connection_id != key {
                    Some(self.state.hold(&ctx.connection_id).await)
                } else {
                    None
                };
                invocation.set_resolved(&ctx);
                handler.handle(body, &ctx, invocation).await
            };
            match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(WorkerError::Timeout(timeout)),
            }
        })
        .await
    }

    /// Direct lookup when the message names its connection, otherwise the
    /// resolver cache keyed by the external identity.
    async fn resolve_context(&self, body: &MessageBody) -> WorkerResult<ConnectionContext> {
        let mut ctx = if let Some(connection_id) = body.connection_id() {
            self.deps.directory.fetch_connection_config(connection_id).await?
        } else if let Some(identity) = body.external_identity() {
            let resolution = self.deps.resolver.resolve(identity).await?;
            let provider = body
                .provider()
                .or(body.integration_id())
                .or(self.config.integration_id.as_deref())
                .unwrap_or(UNKNOWN_KEY);
            ConnectionContext::from_resolution(resolution, provider)
        } else {
            return Err(WorkerError::validation_field(
                "message carries neither a connection id nor an external identity",
                "integration_connection_id",
            ));
        };

        if ctx.integration_id.is_none() {
            ctx.integration_id = body
                .integration_id()
                .map(str::to_string)
                .or_else(|| self.config.integration_id.clone());
        }
        Ok(ctx)
    }

    /// Decide commit vs. redelivery and report failures.
    async fn settle(
        &self,
        message: &InboundMessage,
        body: Option<&MessageBody>,
        resolved: Option<Resolved>,
        outcome: WorkerResult<()>,
    ) {
        let connection_id = resolved
            .as_ref()
            .map(|r| r.connection_id.clone())
            .or_else(|| body.and_then(|b| b.connection_id()).map(str::to_string));

        match outcome {
            Ok(()) => {
                self.deps.metrics.record_processed();
                self.commit(message).await;
                info!(
                    delivery_id = %message.delivery_id,
                    connection_id = connection_id.as_deref().unwrap_or(UNKNOWN_KEY),
                    "Message committed"
                );
            }
            Err(WorkerError::Cancelled) => {
                info!(delivery_id = %message.delivery_id, "Invocation cancelled, leaving message for redelivery");
                self.abandon(message).await;
            }
            Err(e) => {
                self.deps.metrics.record_failed();
                let routed = self.publish_error(&e, message, body, resolved.as_ref(), connection_id.clone()).await;
                if e.is_retriable() {
                    warn!(
                        delivery_id = %message.delivery_id,
                        connection_id = connection_id.as_deref().unwrap_or(UNKNOWN_KEY),
                        error = %e,
                        "Retries exhausted, leaving message for redelivery"
                    );
                    self.abandon(message).await;
                } else if routed {
                    error!(
                        delivery_id = %message.delivery_id,
                        connection_id = connection_id.as_deref().unwrap_or(UNKNOWN_KEY),
                        kind = e.kind(),
                        error = %e,
                        "Terminal failure routed to error channel"
                    );
                    self.commit(message).await;
                } else {
                    error!(
                        delivery_id = %message.delivery_id,
                        error = %e,
                        "Terminal failure could not be routed, leaving message for redelivery"
                    );
                    self.abandon(message).await;
                }
            }
        }
    }

    async fn publish_error(
        &self,
        e: &WorkerError,
        message: &InboundMessage,
        body: Option<&MessageBody>,
        resolved: Option<&Resolved>,
        connection_id: Option<String>,
    ) -> bool {
        let original = match body {
            Some(body) => body.raw().clone(),
            None => Value::String(String::from_utf8_lossy(&message.body).into_owned()),
        };
        let customer_id = resolved
            .map(|r| r.customer_id.clone())
            .or_else(|| body.and_then(|b| b.customer_id()).map(str::to_string));
        let integration_id = body
            .and_then(|b| b.integration_id())
            .map(str::to_string)
            .or_else(|| self.config.integration_id.clone());

        let record = ErrorRecord::from_error(e, body.and_then(|b| b.message_id()).map(str::to_string), original)
            .with_connection(customer_id, integration_id, connection_id.clone());
        let value = match serde_json::to_vec(&record) {
            Ok(value) => value,
            Err(err) => {
                error!(error = %err, "Failed to serialize error record");
                return false;
            }
        };

        let key = connection_id.as_deref().unwrap_or(UNKNOWN_KEY);
        match self.deps.outbound.send(&self.config.topics.errors, key, value, &[]).await {
            Ok(()) => {
                self.deps.metrics.record_error_produced();
                true
            }
            Err(err) => {
                error!(error = %err, delivery_id = %message.delivery_id, "Failed to publish error record");
                false
            }
        }
    }

    async fn commit(&self, message: &InboundMessage) {
        if let Err(e) = self.deps.inbound.commit(message).await {
            error!(delivery_id = %message.delivery_id, error = %e, "Failed to commit message");
        }
    }

    async fn abandon(&self, message: &InboundMessage) {
        if let Err(e) = self.deps.inbound.abandon(message).await {
            warn!(delivery_id = %message.delivery_id, error = %e, "Failed to release message");
        }
    }

    async fn nack(&self, message: &InboundMessage) {
        if let Err(e) = self.deps.inbound.nack(message, self.config.busy_nack_delay()).await {
            warn!(delivery_id = %message.delivery_id, error = %e, "Failed to nack message");
        }
    }
}

/// Connection key that serializes work: the body's connection id, then the
/// bus partition key, then the external identity.
pub fn partition_key(message: &InboundMessage, body: &MessageBody) -> String {
    body.connection_id()
        .map(str::to_string)
        .or_else(|| message.partition_key.clone().filter(|k| !k.is_empty()))
        .or_else(|| body.external_identity().map(|e| e.trim().to_ascii_lowercase()))
        .unwrap_or_else(|| UNKNOWN_KEY.to_string())
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Invocation task panicked");
        }
    }
}

#[derive(Debug, Clone)]
struct Resolved {
    connection_id: String,
    customer_id: String,
}

/// Per-message record sink: suppresses duplicates, then publishes.
struct Invocation<'a> {
    worker: &'a Worker,
    message_id: Option<String>,
    resolved: Mutex<Option<Resolved>>,
    published: AtomicUsize,
    suppressed: AtomicUsize,
}

impl<'a> Invocation<'a> {
    fn new(worker: &'a Worker, message_id: Option<&str>) -> Self {
        Self {
            worker,
            message_id: message_id.map(str::to_string),
            resolved: Mutex::new(None),
            published: AtomicUsize::new(0),
            suppressed: AtomicUsize::new(0),
        }
    }

    fn set_resolved(&self, ctx: &ConnectionContext) {
        *self.resolved.lock() = Some(Resolved {
            connection_id: ctx.connection_id.clone(),
            customer_id: ctx.customer_id.clone(),
        });
    }

    fn resolved(&self) -> Option<Resolved> {
        self.resolved.lock().clone()
    }
}

#[async_trait]
impl RecordSink for Invocation<'_> {
    async fn emit(&self, record: NormalizedRecord) -> WorkerResult<()> {
        let deps = &self.worker.deps;
        let key = record.idempotency_key.clone();

        if !deps.idempotency.claim(&key) {
            deps.metrics.record_duplicate();
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(idempotency_key = %key, "Duplicate record suppressed");
            return Ok(());
        }
        let mut claim = ClaimGuard {
            cache: &deps.idempotency,
            key: &key,
            published: false,
        };

        let value = serde_json::to_vec(&record)
            .map_err(|e| WorkerError::Malformed(format!("record not serializable: {}", e)))?;
        let headers = vec![
            ("source".to_string(), record.provider.clone()),
            ("produced_at".to_string(), Utc::now().to_rfc3339()),
            (HEADER_IDEMPOTENCY_KEY.to_string(), key.clone()),
        ];
        deps.outbound
            .send(
                &self.worker.config.topics.data,
                &record.integration_connection_id,
                value,
                &headers,
            )
            .await?;
        claim.published = true;

        deps.metrics.record_produced();
        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            idempotency_key = %key,
            message_id = ?self.message_id,
            resource_type = %record.resource_type,
            "Record published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> MessageBody {
        MessageBody::from_value(value).unwrap()
    }

    #[test]
    fn test_partition_key_prefers_connection_id() {
        let message = InboundMessage::new("d-1", "integration.trigger", vec![]).with_partition_key("from-subject");
        assert_eq!(
            partition_key(&message, &body(json!({"integration_connection_id": "conn-1"}))),
            "conn-1"
        );
        assert_eq!(partition_key(&message, &body(json!({}))), "from-subject");
    }

    #[test]
    fn test_partition_key_falls_back_to_identity() {
        let message = InboundMessage::new("d-1", "webhook.raw", vec![]);
        let webhook = body(json!({
            "integration_connection_id": "pending",
            "payload": {"email": "User@Example.com"}
        }));
        assert_eq!(partition_key(&message, &webhook), "user@example.com");
        assert_eq!(partition_key(&message, &body(json!({}))), UNKNOWN_KEY);
    }

    #[test]
    fn test_active_key_released_on_drop() {
        let state = Arc::new(WorkerState::default());
        assert!(state.try_activate("conn-1"));
        assert!(!state.try_activate("conn-1"));
        {
            let _guard = ActiveKey {
                state: Arc::clone(&state),
                key: "conn-1".to_string(),
            };
            assert!(state.is_active("conn-1"));
        }
        assert!(!state.is_active("conn-1"));
        assert_eq!(state.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_hold_waits_for_release() {
        let state = Arc::new(WorkerState::default());
        assert!(state.try_activate("conn-2"));
        let admitted = ActiveKey {
            state: Arc::clone(&state),
            key: "conn-2".to_string(),
        };

        let waiter = tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                let _held = state.hold("conn-2").await;
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(admitted);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!state.is_active("conn-2"));
    }

    #[test]
    fn test_claim_guard_releases_unpublished_key() {
        let cache = IdempotencyCache::new(&Default::default());
        assert!(cache.claim("k"));
        drop(ClaimGuard {
            cache: &cache,
            key: "k",
            published: false,
        });
        assert!(!cache.contains("k"));

        assert!(cache.claim("k"));
        drop(ClaimGuard {
            cache: &cache,
            key: "k",
            published: true,
        });
        assert!(cache.contains("k"));
    }
}
