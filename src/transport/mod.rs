//! Message Transport
//!
//! Delivers envelopes between named nodes. Supports one-way sends and
//! request/reply correlated by `msg_id`. Transports never retry and never
//! time out a pending request; callers that need reliability supply it.
//!
//! Two implementations are provided:
//! - [`StdioTransport`]: newline-delimited JSON over a byte stream (stdin/stdout)
//! - [`MemoryNetwork`]: in-process network used for tests and simulation

pub mod memory;
pub mod stdio;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::concurrency_error;
use crate::error::Result;
use crate::node::{Handler, Message, MsgId, NodeId, Payload};
pub use memory::{MemoryClient, MemoryNetwork, MemoryTransport, NetworkStats};
pub use stdio::StdioTransport;

/// Single-shot handler fired with the reply to an `rpc`
pub type ReplyCallback = Box<dyn FnOnce(Message) + Send + 'static>;

/// Trait for sending messages to other nodes in the cluster
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity this transport sends as
    fn node_id(&self) -> &NodeId;

    /// Fire-and-forget send
    async fn send(&self, dest: &NodeId, payload: Payload) -> Result<()>;

    /// Send a request and register `callback` for its correlated reply.
    ///
    /// The callback fires at most once, and never if no reply arrives.
    async fn rpc(&self, dest: &NodeId, payload: Payload, callback: ReplyCallback)
        -> Result<MsgId>;

    /// Reply to an inbound request
    async fn reply(&self, request: &Message, payload: Payload) -> Result<()>;

    /// Drop the callback registered for `msg_id`, if it has not fired yet.
    /// A reply arriving afterwards is routed like any other inbound message.
    fn forget(&self, msg_id: MsgId) -> Result<bool>;
}

/// Allocates message ids and holds the callbacks of outstanding requests
#[derive(Default)]
pub struct Correlator {
    next_msg_id: AtomicU64,
    callbacks: Mutex<HashMap<MsgId, ReplyCallback>>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("next_msg_id", &self.next_msg_id.load(Ordering::Relaxed))
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids start at 1
    pub fn next_msg_id(&self) -> MsgId {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, msg_id: MsgId, callback: ReplyCallback) -> Result<()> {
        self.callbacks
            .lock()
            .map_err(|e| concurrency_error!("Correlator lock fail {}", e))?
            .insert(msg_id, callback);
        Ok(())
    }

    /// Remove and return the callback waiting on `msg_id`
    pub fn take(&self, msg_id: MsgId) -> Result<Option<ReplyCallback>> {
        self.callbacks
            .lock()
            .map_err(|e| concurrency_error!("Correlator lock fail {}", e))
            .map(|mut callbacks| callbacks.remove(&msg_id))
    }

    pub fn outstanding(&self) -> usize {
        self.callbacks
            .lock()
            .map(|callbacks| callbacks.len())
            .unwrap_or(0)
    }
}

/// Route one inbound envelope.
///
/// Replies to our own requests fire their registered callback inline. Anything
/// else is handled on its own task; a failed request that expects a reply gets
/// an `error` body back.
pub fn route_inbound<T, H>(
    transport: &Arc<T>,
    correlator: &Correlator,
    handler: &Arc<H>,
    msg: Message,
) where
    T: Transport + ?Sized,
    H: Handler + ?Sized,
{
    if let Some(in_reply_to) = msg.in_reply_to() {
        match correlator.take(in_reply_to) {
            Ok(Some(callback)) => {
                callback(msg);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!("[{}] Dropping reply {}: {}", transport.node_id(), in_reply_to, e);
                return;
            }
        }
    }

    let transport = Arc::clone(transport);
    let handler = Arc::clone(handler);
    tokio::spawn(async move {
        let Err(e) = handler.handle(&msg).await else {
            return;
        };
        warn!(
            "[{}] Failed handling {} from {}: {}",
            transport.node_id(),
            msg.kind().unwrap_or("<untyped>"),
            msg.src,
            e
        );
        if msg.msg_id().is_none() || msg.in_reply_to().is_some() {
            debug!("[{}] Not replying to uncorrelated message", transport.node_id());
            return;
        }
        if let Err(e) = transport.reply(&msg, Payload::error(&e)).await {
            error!("[{}] Failed sending error reply: {}", transport.node_id(), e);
        }
    });
}
