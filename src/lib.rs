// Error taxonomy and retriable/terminal classification
pub mod error;

// Normalized records, error records, idempotency keys
pub mod record;

// Circuit breaker, exponential backoff, adaptive rate limiter
pub mod resilience;

// Bounded TTL + LRU cache
pub mod cache;

// Duplicate suppression for outbound records
pub mod idempotency;

// Inbound/outbound queue seams and the in-memory bus
pub mod bus;

// NATS JetStream bus implementation
pub mod nats;

// Connection contexts, SQLite store, control-plane client
pub mod connections;

// Large-payload offload
pub mod blob;

// Configuration loading (TOML + env)
pub mod config;

// Worker counters
pub mod metrics;

// Tracing subscriber setup
pub mod telemetry;

pub use error::{ErrorClass, WorkerError, WorkerResult};
pub use record::{idempotency_key, ErrorRecord, NormalizedRecord, RecordBuilder};
