//! Handlers for broker traffic that is not a job notification.
//!
//! Resolution is a linear scan: the first registered handler that claims a
//! delivery gets it, later handlers are never asked.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::broker::Delivery;

#[async_trait]
pub trait ExternalHandler: Send + Sync {
    /// Name for logging.
    fn name(&self) -> &str;

    fn claims(&self, delivery: &Delivery) -> bool;

    async fn handle(&self, payload: &[u8]) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn ExternalHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: Arc<dyn ExternalHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn register(&mut self, handler: Arc<dyn ExternalHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// First handler claiming `delivery`, in registration order.
    pub fn resolve(&self, delivery: &Delivery) -> Option<&Arc<dyn ExternalHandler>> {
        self.handlers.iter().find(|h| h.claims(delivery))
    }

    /// Hand `delivery` to its handler.
    ///
    /// Returns `Ok(false)` when no handler claims it.
    pub async fn dispatch(&self, delivery: &Delivery) -> anyhow::Result<bool> {
        let Some(handler) = self.resolve(delivery) else {
            return Ok(false);
        };
        debug!(handler = handler.name(), tag = %delivery.tag(), "dispatching to external handler");
        handler.handle(delivery.payload()).await?;
        Ok(true)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.handlers.iter().map(|h| h.name().to_string()).collect();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}
