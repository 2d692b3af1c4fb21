//! In-process network
//!
//! Routes envelopes between nodes living in one tokio runtime. Delivery is
//! unreliable on purpose: nodes can be isolated, individual links blocked,
//! and a random fraction of all traffic dropped. Dropped messages vanish
//! silently, exactly as a lost datagram would.
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

use super::{route_inbound, Correlator, ReplyCallback, Transport};
use crate::concurrency_error;
use crate::error::{FloodcastError, Result};
use crate::node::{Handler, Message, MsgId, NodeId, Payload};
use crate::protocol_error;

/// Delivery counters for the whole network
#[derive(Debug, Default)]
pub struct NetworkStats {
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
}

#[derive(Debug, Default)]
struct NetworkInner {
    mailboxes: DashMap<NodeId, mpsc::UnboundedSender<Message>>,
    isolated: Mutex<HashSet<NodeId>>,
    blocked_links: Mutex<HashSet<(NodeId, NodeId)>>,
    // Probability of losing any single message, stored as f64 bits
    loss_rate: AtomicU64,
    stats: NetworkStats,
}

impl NetworkInner {
    fn is_reachable(&self, src: &NodeId, dest: &NodeId) -> Result<bool> {
        let isolated = self
            .isolated
            .lock()
            .map_err(|e| concurrency_error!("Network lock fail {}", e))?;
        if isolated.contains(src) || isolated.contains(dest) {
            return Ok(false);
        }
        drop(isolated);

        let blocked = self
            .blocked_links
            .lock()
            .map_err(|e| concurrency_error!("Network lock fail {}", e))?;
        Ok(!blocked.contains(&(src.clone(), dest.clone())))
    }

    fn deliver(&self, msg: Message) -> Result<()> {
        let mailbox = self
            .mailboxes
            .get(&msg.dest)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FloodcastError::Transport(format!("unknown node {}", msg.dest)))?;

        let loss_rate = f64::from_bits(self.loss_rate.load(Ordering::Relaxed));
        let lost = loss_rate > 0.0 && rand::thread_rng().gen_bool(loss_rate.min(1.0));
        if lost || !self.is_reachable(&msg.src, &msg.dest)? {
            trace!("Dropping {:?} from {} to {}", msg.kind(), msg.src, msg.dest);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        mailbox
            .send(msg)
            .map_err(|e| FloodcastError::Transport(format!("mailbox closed for {}", e.0.dest)))?;
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A simulated cluster network
#[derive(Clone, Debug, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node and start routing its inbound traffic to the handler `build` returns
    pub fn add_node<H, F>(&self, node_id: impl Into<NodeId>, build: F) -> Arc<H>
    where
        H: Handler,
        F: FnOnce(Arc<MemoryTransport>) -> Arc<H>,
    {
        let (transport, mut inbox) = self.attach(node_id.into());
        let handler = build(Arc::clone(&transport));

        let routed = Arc::clone(&handler);
        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                route_inbound(&transport, &transport.correlator, &routed, msg);
            }
            debug!("[{}] Mailbox closed", transport.node_id());
        });
        handler
    }

    /// Attach a client that only issues requests and awaits their replies
    pub fn add_client(&self, client_id: impl Into<NodeId>) -> MemoryClient {
        let client = self.add_node(client_id, |transport| {
            Arc::new(ClientInbox {
                transport: Arc::clone(&transport),
            })
        });
        MemoryClient {
            transport: Arc::clone(&client.transport),
        }
    }

    fn attach(&self, node_id: NodeId) -> (Arc<MemoryTransport>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.mailboxes.insert(node_id.clone(), tx);
        let transport = Arc::new(MemoryTransport {
            node_id,
            correlator: Correlator::new(),
            network: Arc::clone(&self.inner),
        });
        (transport, rx)
    }

    /// Drop all traffic to and from `node_id`
    pub fn isolate(&self, node_id: &NodeId) -> Result<()> {
        self.inner
            .isolated
            .lock()
            .map_err(|e| concurrency_error!("Network lock fail {}", e))?
            .insert(node_id.clone());
        Ok(())
    }

    pub fn heal(&self, node_id: &NodeId) -> Result<()> {
        self.inner
            .isolated
            .lock()
            .map_err(|e| concurrency_error!("Network lock fail {}", e))?
            .remove(node_id);
        Ok(())
    }

    /// Drop traffic on the directed link `src -> dest`
    pub fn block_link(&self, src: &NodeId, dest: &NodeId) -> Result<()> {
        self.inner
            .blocked_links
            .lock()
            .map_err(|e| concurrency_error!("Network lock fail {}", e))?
            .insert((src.clone(), dest.clone()));
        Ok(())
    }

    pub fn unblock_link(&self, src: &NodeId, dest: &NodeId) -> Result<()> {
        self.inner
            .blocked_links
            .lock()
            .map_err(|e| concurrency_error!("Network lock fail {}", e))?
            .remove(&(src.clone(), dest.clone()));
        Ok(())
    }

    /// Lose each message independently with probability `rate` (0.0 disables loss)
    pub fn set_loss_rate(&self, rate: f64) {
        self.inner
            .loss_rate
            .store(rate.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.inner.stats.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.stats.dropped.load(Ordering::Relaxed)
    }
}

/// One node's endpoint on a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    node_id: NodeId,
    correlator: Correlator,
    network: Arc<NetworkInner>,
}

impl MemoryTransport {
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn send(&self, dest: &NodeId, payload: Payload) -> Result<()> {
        let msg = Message::new(self.node_id.clone(), dest.clone(), &payload, None, None)?;
        self.network.deliver(msg)
    }

    async fn rpc(
        &self,
        dest: &NodeId,
        payload: Payload,
        callback: ReplyCallback,
    ) -> Result<MsgId> {
        let msg_id = self.correlator.next_msg_id();
        let msg = Message::new(
            self.node_id.clone(),
            dest.clone(),
            &payload,
            Some(msg_id),
            None,
        )?;
        self.correlator.register(msg_id, callback)?;
        if let Err(e) = self.network.deliver(msg) {
            if let Err(forget_err) = self.forget(msg_id) {
                error!(
                    "[{}] Failed releasing callback {}: {}",
                    self.node_id, msg_id, forget_err
                );
            }
            return Err(e);
        }
        Ok(msg_id)
    }

    async fn reply(&self, request: &Message, payload: Payload) -> Result<()> {
        let in_reply_to = request.msg_id().ok_or_else(|| {
            protocol_error!(
                "cannot reply to {} from {} without msg_id",
                request.kind().unwrap_or("<untyped>"),
                request.src
            )
        })?;
        let msg = Message::new(
            self.node_id.clone(),
            request.src.clone(),
            &payload,
            None,
            Some(in_reply_to),
        )?;
        self.network.deliver(msg)
    }

    fn forget(&self, msg_id: MsgId) -> Result<bool> {
        self.correlator
            .take(msg_id)
            .map(|callback| callback.is_some())
    }
}

/// Clients only care about replies; anything else addressed to them is ignored
struct ClientInbox {
    transport: Arc<MemoryTransport>,
}

#[async_trait]
impl Handler for ClientInbox {
    async fn handle(&self, msg: &Message) -> Result<()> {
        debug!(
            "[{}] Ignoring unsolicited {} from {}",
            self.transport.node_id(),
            msg.kind().unwrap_or("<untyped>"),
            msg.src
        );
        Ok(())
    }
}

/// Request/reply client on a [`MemoryNetwork`]
#[derive(Clone, Debug)]
pub struct MemoryClient {
    transport: Arc<MemoryTransport>,
}

impl MemoryClient {
    pub fn node_id(&self) -> &NodeId {
        self.transport.node_id()
    }

    /// Send a request and wait for its reply. Waits forever if the request or
    /// the reply is lost; callers should wrap this in a timeout.
    pub async fn request(&self, dest: &NodeId, payload: Payload) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.transport
            .rpc(
                dest,
                payload,
                Box::new(move |reply| {
                    let _ = tx.send(reply);
                }),
            )
            .await?;
        rx.await
            .map_err(|_| FloodcastError::Transport("reply callback dropped".to_string()))
    }

    pub async fn send(&self, dest: &NodeId, payload: Payload) -> Result<()> {
        self.transport.send(dest, payload).await
    }
}
