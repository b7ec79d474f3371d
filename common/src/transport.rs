//! Node-to-node messaging.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::{debug, warn};

use crate::cluster::NodeId;
use crate::error::{DeliveryError, NodeError, TransportError};
use crate::message::{NodeMessage, NodeReply};
use crate::utils::panic_message;

/// Receives messages addressed to one node.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: NodeMessage) -> Result<NodeReply, NodeError>;
}

/// Delivers a message to a node and waits for its reply.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, node: NodeId, message: NodeMessage) -> Result<NodeReply, DeliveryError>;
}

/// In-process transport. Every message is handled on its own tokio task, so
/// a node serves many requests concurrently.
#[derive(Default)]
pub struct LocalTransport {
    handlers: DashMap<NodeId, Arc<dyn MessageHandler>>,
    unreachable: DashSet<NodeId>,
    fail_next: DashMap<NodeId, AtomicU32>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: NodeId, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(node, handler);
    }

    pub fn deregister(&self, node: NodeId) {
        self.handlers.remove(&node);
    }

    /// Makes every send to `node` fail with [`TransportError::Unreachable`]
    /// until cleared.
    pub fn set_unreachable(&self, node: NodeId, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(node);
        } else {
            self.unreachable.remove(&node);
        }
    }

    /// Makes the next `count` sends to `node` fail.
    pub fn fail_next(&self, node: NodeId, count: u32) {
        self.fail_next
            .entry(node)
            .or_insert_with(|| AtomicU32::new(0))
            .fetch_add(count, Ordering::SeqCst);
    }

    /// Drops every registered handler.
    pub fn clear(&self) {
        self.handlers.clear();
    }

    fn injected_failure(&self, node: NodeId) -> bool {
        let Some(remaining) = self.fail_next.get(&node) else {
            return false;
        };
        remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, node: NodeId, message: NodeMessage) -> Result<NodeReply, DeliveryError> {
        if self.unreachable.contains(&node) || self.injected_failure(node) {
            debug!("dropping {} message for unreachable {}", message.kind(), node);
            return Err(TransportError::Unreachable(node).into());
        }
        let handler = match self.handlers.get(&node) {
            Some(handler) => handler.value().clone(),
            None => return Err(TransportError::Unreachable(node).into()),
        };

        let task = tokio::spawn(async move { handler.handle(message).await });
        match task.await {
            Ok(reply) => reply.map_err(DeliveryError::from),
            Err(err) => {
                let reason = if err.is_panic() {
                    panic_message(err.into_panic().as_ref())
                } else {
                    "handler task was cancelled".to_string()
                };
                warn!("{} dropped a message: {}", node, reason);
                Err(TransportError::Dropped { node, reason }.into())
            }
        }
    }
}
