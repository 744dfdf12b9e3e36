//! Handler registry.
//!
//! Routes are checked for overlap when a handler is registered, so a
//! misconfigured worker fails at startup instead of routing ambiguously.
//! Dispatch walks handlers in registration order and returns the first match.
//! Topic routes only match bodies without a method or action, so they never
//! shadow an explicitly addressed handler.

use crate::handler::Handler;
use crate::message::MessageBody;
use anyhow::{bail, Result};
use std::sync::Arc;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) -> Result<()> {
        let routes = handler.routes();
        if routes.is_empty() {
            bail!("Handler '{}' declares no routes", handler.name());
        }
        for existing in &self.handlers {
            for theirs in existing.routes() {
                if let Some(ours) = routes.iter().find(|r| r.overlaps(&theirs)) {
                    bail!(
                        "Handler '{}' route '{}' overlaps '{}' route '{}'",
                        handler.name(),
                        ours,
                        existing.name(),
                        theirs
                    );
                }
            }
        }
        self.handlers.push(handler);
        Ok(())
    }

    pub fn with(mut self, handler: Arc<dyn Handler>) -> Result<Self> {
        self.register(handler)?;
        Ok(self)
    }

    /// Handler for a body delivered on `topic`.
    pub fn dispatch(&self, topic: &str, body: &MessageBody) -> Option<Arc<dyn Handler>> {
        self.handlers
            .iter()
            .find(|h| h.routes().iter().any(|r| r.matches(topic, body)))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
