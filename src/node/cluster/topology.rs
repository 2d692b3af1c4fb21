use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::concurrency_error;
use crate::error::Result;
use crate::node::NodeId;

/// This node's current neighbor set.
///
/// The set is replaced wholesale whenever a new cluster topology arrives and
/// readers only ever get a copy, so a dissemination task holding a snapshot
/// never observes a later replacement.
#[derive(Debug)]
pub struct TopologyTable {
    node_id: NodeId,
    neighbors: Mutex<HashSet<NodeId>>,
}

impl TopologyTable {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            neighbors: Mutex::new(HashSet::new()),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Install this node's entry from a cluster-wide topology; other entries are ignored
    pub fn replace(&self, topology: &HashMap<NodeId, Vec<NodeId>>) -> Result<()> {
        let neighbors: HashSet<NodeId> = match topology.get(&self.node_id) {
            Some(entry) => entry.iter().cloned().collect(),
            None => {
                warn!(
                    "[{}] Topology has no entry for this node, clearing neighbors",
                    self.node_id
                );
                HashSet::new()
            }
        };
        info!(
            "[{}] Installing topology with {} neighbors: {:?}",
            self.node_id,
            neighbors.len(),
            neighbors
        );

        let mut current = self
            .neighbors
            .lock()
            .map_err(|e| concurrency_error!("Topology lock fail {}", e))?;
        *current = neighbors;
        Ok(())
    }

    pub fn snapshot(&self) -> Result<HashSet<NodeId>> {
        self.neighbors
            .lock()
            .map_err(|e| concurrency_error!("Topology lock fail {}", e))
            .map(|neighbors| neighbors.clone())
    }
}
