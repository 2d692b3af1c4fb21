use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{DedupStore, Disseminator};
use crate::error::Result;
use crate::node::cluster::TopologyTable;
use crate::node::{BroadcastValue, Handler, Message, NodeId, Payload};
use crate::protocol_error;
use crate::settings;
use crate::transport::Transport;

/// A broadcast participant: records every value once and floods new ones to its neighbors.
pub struct BroadcastNode {
    node_id: NodeId,
    store: Arc<DedupStore>,
    topology: Arc<TopologyTable>,
    disseminator: Disseminator,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for BroadcastNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastNode")
            .field("node_id", &self.node_id)
            .field("values", &self.store.len().unwrap_or(0))
            .field("disseminator", &self.disseminator)
            .finish()
    }
}

impl BroadcastNode {
    pub fn new(transport: Arc<dyn Transport>, settings: &settings::Settings) -> Self {
        let node_id = transport.node_id().clone();
        Self {
            store: Arc::new(DedupStore::new()),
            topology: Arc::new(TopologyTable::new(node_id.clone())),
            disseminator: Disseminator::new(Arc::clone(&transport), settings.retry_interval),
            node_id,
            transport,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    pub fn topology(&self) -> &TopologyTable {
        &self.topology
    }

    pub fn disseminator(&self) -> &Disseminator {
        &self.disseminator
    }

    /// Record `value` and acknowledge right away; flooding runs on its own task
    async fn handle_broadcast(&self, msg: &Message, value: BroadcastValue) -> Result<()> {
        let is_new = self.store.test_and_insert(value)?;
        debug!(
            "[{}] broadcast {} from {} {} (new: {})",
            self.node_id,
            value,
            if msg.src.is_client() { "client" } else { "peer" },
            msg.src,
            is_new
        );

        let replied = if msg.msg_id().is_some() {
            self.transport.reply(msg, Payload::BroadcastOk).await
        } else {
            Ok(())
        };

        if is_new {
            let neighbors = self.topology.snapshot()?;
            self.disseminator.start(value, neighbors);
        }
        replied
    }

    async fn handle_read(&self, msg: &Message) -> Result<()> {
        let mut messages: Vec<BroadcastValue> = self.store.snapshot()?.into_iter().collect();
        messages.sort_unstable();
        self.transport
            .reply(msg, Payload::ReadOk { messages })
            .await
    }
}

#[async_trait]
impl Handler for BroadcastNode {
    async fn handle(&self, msg: &Message) -> Result<()> {
        match msg.payload()? {
            Payload::Broadcast { message } => self.handle_broadcast(msg, message).await,
            Payload::Read => self.handle_read(msg).await,
            Payload::Topology { topology } => {
                self.topology.replace(&topology)?;
                self.transport.reply(msg, Payload::TopologyOk).await
            }
            // Acks to our own requests are consumed by their reply callbacks;
            // one that reaches the handler arrived after its callback was spent.
            Payload::BroadcastOk => Ok(()),
            Payload::Init { node_id, .. } => Err(protocol_error!(
                "node {} is already initialized, refusing init as {}",
                self.node_id,
                node_id
            )),
            other @ (Payload::InitOk
            | Payload::ReadOk { .. }
            | Payload::TopologyOk
            | Payload::Error { .. }) => {
                debug!(
                    "[{}] Ignoring uncorrelated {} from {}",
                    self.node_id,
                    other.kind(),
                    msg.src
                );
                Ok(())
            }
        }
    }

    async fn shutdown(&self) {
        self.disseminator.shutdown();
    }
}
