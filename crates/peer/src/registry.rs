//! Typed handler registry for inbound commands and requests.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use protocol::messages::{FailureCode, FailureReason};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::channel::RpcChannel;

/// What a handler sees besides its payload.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Remote address of the channel, if it has one.
    pub peer: Option<SocketAddr>,
    /// The channel the call arrived on. Handlers may send commands back over it.
    pub channel: RpcChannel,
}

/// Boxed future produced by an erased handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, FailureReason>> + Send>>;

pub(crate) type Handler = Arc<dyn Fn(CallContext, Value) -> HandlerFuture + Send + Sync>;

/// Maps tags to handlers.
///
/// Built once, then shared (behind an `Arc`) by every channel of a server or
/// client.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Handler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `tag`, replacing any previous one.
    ///
    /// The payload is deserialized into `T`; the handler's `R` becomes the
    /// response payload when the envelope was a request.
    pub fn register<T, R, F, Fut>(&mut self, tag: impl Into<String>, handler: F) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let tag = tag.into();
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |ctx, payload| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let request: T = serde_json::from_value(payload)
                    .map_err(|e| FailureReason::new(FailureCode::InvalidPayload, e.to_string()))?;
                let reply = handler(ctx, request)
                    .await
                    .map_err(|e| FailureReason::new(FailureCode::HandlerFailed, format!("{e:#}")))?;
                serde_json::to_value(reply)
                    .map_err(|e| FailureReason::new(FailureCode::HandlerFailed, e.to_string()))
            })
        });

        if self.handlers.insert(tag.clone(), erased).is_some() {
            tracing::warn!(tag = %tag, "Replacing existing handler");
        }
        self
    }

    /// Returns true if a handler is registered for `tag`.
    pub fn contains(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn get(&self, tag: &str) -> Option<Handler> {
        self.handlers.get(tag).cloned()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}
