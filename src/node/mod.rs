use async_trait::async_trait;

pub mod broadcast;
pub mod cluster;
pub mod messages;
pub mod node_id;

use crate::error::Result;
pub use broadcast::BroadcastNode;
pub use messages::{BroadcastValue, Message, MsgId, Payload};
pub use node_id::NodeId;

/// Request handling for a node: receives every inbound envelope that is not
/// a reply to one of this node's own outstanding requests.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, msg: &Message) -> Result<()>;

    /// Stop background work once no more input will arrive
    async fn shutdown(&self) {}
}
