//! Drive Worker - Google Drive provider connector.
//!
//! Consumes sync triggers and push notifications from the bus, calls the
//! Drive API for each connection and publishes normalized records for
//! ingestion.
//!
//! # Architecture
//!
//! ```text
//!   integration.trigger / webhook.raw
//!                 ↓
//! ┌─────────────────────────────────────────┐
//! │       Worker (orchestration loop)        │
//! │  - One invocation per connection         │
//! │  - Retry, timeout, error routing         │
//! └─────────────────────────────────────────┘
//!                 ↓
//! ┌─────────────────────────────────────────┐
//! │       Handler (chosen by registry)       │
//! │  - Drive API via breaker + pacing        │
//! │  - Transform to normalized records       │
//! └─────────────────────────────────────────┘
//!                 ↓
//!       ingestion.data / integration.errors
//! ```
//!
//! # Core Types
//!
//! - [`handler::Handler`] - Trait every provider handler implements
//! - [`registry::HandlerRegistry`] - Routes a message to its handler
//! - [`resolver::IdentityResolver`] - Email to connection lookup with caching
//! - [`worker::Worker`] - The poll/process/commit loop

pub mod api;
pub mod config;
pub mod handler;
pub mod handlers;
pub mod message;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod worker;

pub use handler::{Handler, RecordSink, Route};
pub use message::MessageBody;
