//! Reliable Flood Broadcast
//!
//! A node accepts values from clients and peers, records each distinct value
//! exactly once, acknowledges immediately, and floods every newly accepted
//! value to its neighbors until each one acknowledges it. Dissemination is
//! at-least-once per neighbor; receivers deduplicate, so repeated deliveries
//! are harmless.
pub mod broadcast_node;
pub mod dedup;
pub mod engine;

pub use broadcast_node::BroadcastNode;
pub use dedup::DedupStore;
pub use engine::{
    Acknowledgment, DisseminationStats, DisseminationTask, Disseminator,
    FrozenDisseminationStats, PendingPeer,
};
