use anyhow::{Context, Result};
use conduit::blob::LocalBlobStore;
use conduit::bus::{InboundQueue, OutboundQueue};
use conduit::config::{DirectoryBackend, WorkerSettings};
use conduit::connections::{ConnectionDirectory, ConnectionStore, ControlPlaneDirectory};
use conduit::idempotency::IdempotencyCache;
use conduit::metrics::WorkerMetrics;
use conduit::nats::NatsClient;
use conduit::resilience::{AdaptiveRateLimiter, ApiGuard, BreakerRegistry};
use conduit::telemetry::init_tracing;
use conduit::RecordBuilder;
use drive_worker::api::{create_router, ApiState};
use drive_worker::config::AppConfig;
use drive_worker::handlers::drive::{register_drive_handlers, DriveClient, PROVIDER};
use drive_worker::registry::HandlerRegistry;
use drive_worker::resolver::IdentityResolver;
use drive_worker::retry::RetryPolicy;
use drive_worker::worker::{Worker, WorkerDeps};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn open_directory(settings: &WorkerSettings) -> Result<Arc<dyn ConnectionDirectory>> {
    let directory = &settings.directory;
    match directory.backend {
        DirectoryBackend::Sqlite => {
            let key = directory
                .encryption_key
                .as_deref()
                .context("CONNECTIONS_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;
            let store = ConnectionStore::open(&directory.db_path, key)
                .with_context(|| format!("Failed to open connection store {}", directory.db_path.display()))?;
            info!(db_path = %directory.db_path.display(), "Connection store opened");
            Ok(Arc::new(store))
        }
        DirectoryBackend::ControlPlane => {
            let config = directory
                .control_plane
                .clone()
                .context("CONTROL_PLANE_URL is required for the control_plane directory")?;
            info!(base_url = %config.base_url, "Using control plane directory");
            Ok(Arc::new(ControlPlaneDirectory::new(config)?))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    let settings = &config.worker;
    init_tracing(&settings.logging)?;

    info!(
        integration_id = ?settings.worker.integration_id,
        max_concurrent_connections = settings.worker.max_concurrent_connections,
        nats_url = %settings.nats.url,
        "Drive worker starting..."
    );

    let directory = open_directory(settings)?;

    let nats = NatsClient::connect(settings.nats.clone()).await?;
    let inbound: Arc<dyn InboundQueue> = Arc::new(nats.inbound().await?);
    let outbound: Arc<dyn OutboundQueue> = Arc::new(nats.outbound());

    // One breaker and one limiter for the Drive API, shared by every invocation
    let breakers = Arc::new(BreakerRegistry::new(settings.breaker.clone()));
    let guard = ApiGuard::new(
        breakers.get_or_create(PROVIDER),
        Arc::new(AdaptiveRateLimiter::new(settings.rate_limit.clone())),
    );
    let client = Arc::new(DriveClient::new(&config.drive, guard)?);

    let mut builder = RecordBuilder::new(PROVIDER);
    if let Some(root) = &settings.blob.local_root {
        builder = builder.with_blob_store(Arc::new(LocalBlobStore::new(root)), settings.blob.payload_threshold_bytes);
        info!(root = %root.display(), "Large payload offload enabled");
    }

    let mut registry = HandlerRegistry::new();
    register_drive_handlers(&mut registry, client, builder, &config.drive)?;

    let resolver = Arc::new(IdentityResolver::new(
        Arc::clone(&directory),
        settings.resolver.max_size,
        settings.resolver.ttl(),
    ));
    let idempotency = Arc::new(IdempotencyCache::new(&settings.idempotency));
    let metrics = Arc::new(WorkerMetrics::new());

    let deps = WorkerDeps {
        inbound,
        outbound,
        directory,
        registry: Arc::new(registry),
        resolver: Arc::clone(&resolver),
        idempotency: Arc::clone(&idempotency),
        metrics: Arc::clone(&metrics),
    };
    let worker = Arc::new(
        Worker::new(settings.worker.clone(), RetryPolicy::from(&settings.retry), deps)
            .with_prune_interval(Duration::from_secs(settings.idempotency.prune_interval_seconds)),
    );

    // Health API
    let api_state = ApiState {
        state: worker.state(),
        metrics,
        idempotency,
        breakers,
        resolver,
    };
    let router = create_router(api_state);
    let addr = format!("{}:{}", settings.health.bind, settings.health.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind health API on {}", addr))?;
    info!(addr = %addr, "Health API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "Health API server error");
        }
    });

    let shutdown = CancellationToken::new();
    let worker_handle = tokio::spawn(Arc::clone(&worker).run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    if let Err(e) = worker_handle.await {
        error!(error = %e, "Worker task failed");
    }
    server_handle.abort();
    info!("Drive worker stopped");

    Ok(())
}
