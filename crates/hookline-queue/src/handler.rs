//! Per-source webhook handlers and the registry that resolves them.
//!
//! The dispatcher only knows that a handler turns a payload into a JSON
//! result or fails with a message. What the handler does with the payload
//! (field mapping, downstream calls) is its own business.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookline_core::{EntryId, Fingerprint, PendingEntry};
use serde_json::Value;
use thiserror::Error;

use crate::error::{QueueError, Result};

/// Failure reported by a handler.
///
/// The message is stored on the pending entry after sanitization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a handler error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// Returns the failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<QueueError> for HandlerError {
    fn from(err: QueueError) -> Self {
        Self::new(err.to_string())
    }
}

/// Information about the entry being handled.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerContext {
    /// Pending entry identifier.
    pub entry_id: EntryId,
    /// Content fingerprint.
    pub fingerprint: Fingerprint,
    /// Route name the webhook arrived on.
    pub source: String,
    /// Failed attempts before this one.
    pub attempts: u32,
    /// Time the webhook was accepted.
    pub created_at: DateTime<Utc>,
}

impl From<&PendingEntry> for HandlerContext {
    fn from(entry: &PendingEntry) -> Self {
        Self {
            entry_id: entry.id,
            fingerprint: entry.fingerprint.clone(),
            source: entry.source.clone(),
            attempts: entry.attempts,
            created_at: entry.created_at,
        }
    }
}

/// Processes the payload of one source.
///
/// Implementations must tolerate being invoked more than once for the same
/// fingerprint: a crash mid-call leaves the entry pending with its previous
/// attempt count.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    /// Handles a payload, returning the value recorded in history.
    async fn handle(
        &self,
        payload: &Value,
        ctx: &HandlerContext,
    ) -> std::result::Result<Value, HandlerError>;
}

/// Mapping from source name to handler, populated at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn WebhookHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Configuration` if the name is empty or already
    /// registered.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(QueueError::configuration("handler name must not be empty"));
        }
        if self.handlers.contains_key(&name) {
            return Err(QueueError::configuration(format!("handler {name} registered twice")));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Registers a handler, returning the registry for chaining.
    ///
    /// # Errors
    ///
    /// See [`HandlerRegistry::register`].
    pub fn with(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<Self> {
        self.register(name, handler)?;
        Ok(self)
    }

    /// Resolves the handler for `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn WebhookHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Returns the registered source names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Returns the number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry").field("handlers", &self.names()).finish()
    }
}
