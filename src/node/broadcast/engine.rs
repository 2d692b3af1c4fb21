//! Dissemination Engine
//!
//! One task per newly accepted value. Each task floods its value to every
//! neighbor in the topology snapshot it was started with, once per retry
//! interval, until every neighbor has acknowledged with `broadcast_ok`.
//! There is no retry cap and no backoff: send failures, lost requests, and
//! lost acks all look the same and are all covered by the next round.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::concurrency_error;
use crate::error::Result;
use crate::node::{BroadcastValue, Message, MsgId, NodeId, Payload};
use crate::transport::{ReplyCallback, Transport};

/// Delivery bookkeeping for one not-yet-acknowledged neighbor
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingPeer {
    pub attempts: u32,
    pub last_sent: Option<Instant>,
}

/// Outcome of applying a reply to a task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acknowledgment {
    /// The neighbor was pending and is now done
    Accepted {
        attempts: u32,
        latency: Option<Duration>,
    },
    /// The neighbor had already acknowledged (duplicate or late reply)
    Duplicate,
    /// Not an acknowledgment; the neighbor stays pending
    Rejected(String),
}

/// Per-value dissemination state
#[derive(Debug)]
pub struct DisseminationTask {
    value: BroadcastValue,
    pending: Mutex<HashMap<NodeId, PendingPeer>>,
    started_at: Instant,
}

impl DisseminationTask {
    pub fn new(value: BroadcastValue, neighbors: HashSet<NodeId>) -> Self {
        Self {
            value,
            pending: Mutex::new(
                neighbors
                    .into_iter()
                    .map(|peer| (peer, PendingPeer::default()))
                    .collect(),
            ),
            started_at: Instant::now(),
        }
    }

    pub fn value(&self) -> BroadcastValue {
        self.value
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Neighbors still waiting to acknowledge, sorted
    pub fn pending(&self) -> Result<Vec<NodeId>> {
        let pending = self
            .pending
            .lock()
            .map_err(|e| concurrency_error!("Pending set lock fail {}", e))?;
        let mut peers: Vec<NodeId> = pending.keys().cloned().collect();
        peers.sort();
        Ok(peers)
    }

    pub fn pending_peer(&self, peer: &NodeId) -> Result<Option<PendingPeer>> {
        self.pending
            .lock()
            .map_err(|e| concurrency_error!("Pending set lock fail {}", e))
            .map(|pending| pending.get(peer).cloned())
    }

    pub fn is_complete(&self) -> Result<bool> {
        self.pending
            .lock()
            .map_err(|e| concurrency_error!("Pending set lock fail {}", e))
            .map(|pending| pending.is_empty())
    }

    /// Stamp an attempt on every pending neighbor and return them as this round's targets
    pub fn begin_round(&self) -> Result<Vec<NodeId>> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|e| concurrency_error!("Pending set lock fail {}", e))?;
        let now = Instant::now();
        let mut targets = Vec::with_capacity(pending.len());
        for (peer, state) in pending.iter_mut() {
            state.attempts += 1;
            state.last_sent = Some(now);
            targets.push(peer.clone());
        }
        targets.sort();
        Ok(targets)
    }

    /// Apply a reply from `peer`. Only a well-formed `broadcast_ok` counts.
    pub fn acknowledge(&self, peer: &NodeId, reply: &Message) -> Result<Acknowledgment> {
        match reply.payload() {
            Ok(Payload::BroadcastOk) => {}
            Ok(other) => {
                return Ok(Acknowledgment::Rejected(format!(
                    "expected broadcast_ok, got {}",
                    other.kind()
                )))
            }
            Err(e) => return Ok(Acknowledgment::Rejected(e.to_string())),
        }

        let mut pending = self
            .pending
            .lock()
            .map_err(|e| concurrency_error!("Pending set lock fail {}", e))?;
        Ok(match pending.remove(peer) {
            Some(state) => Acknowledgment::Accepted {
                attempts: state.attempts,
                latency: state.last_sent.map(|sent| sent.elapsed()),
            },
            None => Acknowledgment::Duplicate,
        })
    }
}

/// Callbacks registered by the most recent round of one task.
///
/// A round supersedes the one before it, so starting a round releases the
/// previous round's callbacks; dropping the guard releases the rest. This
/// bounds a task's registered callbacks to one per pending neighbor, including
/// when the task is aborted.
struct InFlight {
    transport: Arc<dyn Transport>,
    msg_ids: Vec<MsgId>,
}

impl InFlight {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            msg_ids: Vec::new(),
        }
    }

    fn track(&mut self, msg_id: MsgId) {
        self.msg_ids.push(msg_id);
    }

    fn release(&mut self) {
        for msg_id in self.msg_ids.drain(..) {
            if let Err(e) = self.transport.forget(msg_id) {
                error!(
                    "[{}] Failed releasing callback {}: {}",
                    self.transport.node_id(),
                    msg_id,
                    e
                );
            }
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.release();
    }
}

/// Counters across all dissemination tasks
#[derive(Debug, Default)]
pub struct DisseminationStats {
    pub tasks_started: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub rounds: AtomicU64,
    pub sends: AtomicU64,
    pub send_failures: AtomicU64,
    pub acks: AtomicU64,
    pub rejected_replies: AtomicU64,
}

/// Point-in-time copy of [`DisseminationStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrozenDisseminationStats {
    pub tasks_started: u64,
    pub tasks_completed: u64,
    pub rounds: u64,
    pub sends: u64,
    pub send_failures: u64,
    pub acks: u64,
    pub rejected_replies: u64,
}

impl DisseminationStats {
    pub fn freeze(&self) -> FrozenDisseminationStats {
        FrozenDisseminationStats {
            tasks_started: self.tasks_started.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
            sends: self.sends.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            rejected_replies: self.rejected_replies.load(Ordering::Relaxed),
        }
    }
}

/// Registry and launcher of per-value dissemination tasks
#[derive(Clone)]
pub struct Disseminator {
    transport: Arc<dyn Transport>,
    retry_interval: Duration,
    tasks: Arc<DashMap<BroadcastValue, JoinHandle<()>>>,
    stats: Arc<DisseminationStats>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Disseminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disseminator")
            .field("node_id", self.transport.node_id())
            .field("retry_interval", &self.retry_interval)
            .field("active_tasks", &self.tasks.len())
            .finish()
    }
}

impl Disseminator {
    pub fn new(transport: Arc<dyn Transport>, retry_interval: Duration) -> Self {
        Self {
            transport,
            retry_interval,
            tasks: Arc::new(DashMap::new()),
            stats: Arc::new(DisseminationStats::default()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        self.transport.node_id()
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Start flooding `value` to `neighbors`.
    ///
    /// Returns false without starting anything if a task for `value` is
    /// already registered or the engine has been shut down.
    pub fn start(&self, value: BroadcastValue, neighbors: HashSet<NodeId>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            warn!(
                "[{}] Dissemination shut down, not starting {}",
                self.node_id(),
                value
            );
            return false;
        }
        match self.tasks.entry(value) {
            Entry::Occupied(_) => {
                warn!(
                    "[{}] Dissemination of {} already running, not starting another",
                    self.node_id(),
                    value
                );
                false
            }
            Entry::Vacant(slot) => {
                debug!(
                    "[{}] Starting dissemination of {} to {} neighbors",
                    self.node_id(),
                    value,
                    neighbors.len()
                );
                self.stats.tasks_started.fetch_add(1, Ordering::Relaxed);
                let task = Arc::new(DisseminationTask::new(value, neighbors));
                let handle = tokio::spawn(Self::run(
                    task,
                    Arc::clone(&self.transport),
                    self.retry_interval,
                    Arc::clone(&self.tasks),
                    Arc::clone(&self.stats),
                    Arc::clone(&self.closed),
                ));
                slot.insert(handle);
                true
            }
        }
    }

    async fn run(
        task: Arc<DisseminationTask>,
        transport: Arc<dyn Transport>,
        retry_interval: Duration,
        tasks: Arc<DashMap<BroadcastValue, JoinHandle<()>>>,
        stats: Arc<DisseminationStats>,
        closed: Arc<AtomicBool>,
    ) {
        let node_id = transport.node_id().clone();
        let value = task.value();
        let mut in_flight = InFlight::new(Arc::clone(&transport));

        loop {
            if closed.load(Ordering::SeqCst) {
                debug!("[{}] Dissemination of {} stopped by shutdown", node_id, value);
                break;
            }
            let targets = match task.begin_round() {
                Ok(targets) => targets,
                Err(e) => {
                    error!("[{}] Abandoning dissemination of {}: {}", node_id, value, e);
                    break;
                }
            };
            in_flight.release();
            if targets.is_empty() {
                stats.tasks_completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    "[{}] Value {} acknowledged by all neighbors after {:?}",
                    node_id,
                    value,
                    task.elapsed()
                );
                break;
            }

            stats.rounds.fetch_add(1, Ordering::Relaxed);
            debug!("[{}] Sending {} to {:?}", node_id, value, targets);
            for peer in targets {
                let callback = Self::reply_callback(&node_id, &task, &peer, &stats);
                stats.sends.fetch_add(1, Ordering::Relaxed);
                match transport
                    .rpc(&peer, Payload::Broadcast { message: value }, callback)
                    .await
                {
                    Ok(msg_id) => in_flight.track(msg_id),
                    Err(e) => {
                        stats.send_failures.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "[{}] Send of {} to {} failed, retrying next round: {}",
                            node_id, value, peer, e
                        );
                    }
                }
            }

            tokio::time::sleep(retry_interval).await;
        }

        drop(in_flight);
        tasks.remove(&value);
    }

    fn reply_callback(
        node_id: &NodeId,
        task: &Arc<DisseminationTask>,
        peer: &NodeId,
        stats: &Arc<DisseminationStats>,
    ) -> ReplyCallback {
        let node_id = node_id.clone();
        let task = Arc::clone(task);
        let peer = peer.clone();
        let stats = Arc::clone(stats);
        Box::new(move |reply: Message| match task.acknowledge(&peer, &reply) {
            Ok(Acknowledgment::Accepted { attempts, latency }) => {
                stats.acks.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "[{}] {} acknowledged {} after {} attempts ({:?})",
                    node_id,
                    peer,
                    task.value(),
                    attempts,
                    latency
                );
            }
            Ok(Acknowledgment::Duplicate) => {
                debug!(
                    "[{}] Duplicate ack of {} from {}",
                    node_id,
                    task.value(),
                    peer
                );
            }
            Ok(Acknowledgment::Rejected(reason)) => {
                stats.rejected_replies.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "[{}] Reply from {} for {} is not an ack: {}",
                    node_id,
                    peer,
                    task.value(),
                    reason
                );
            }
            Err(e) => error!("[{}] Failed applying reply from {}: {}", node_id, peer, e),
        })
    }

    pub fn is_active(&self, value: BroadcastValue) -> bool {
        self.tasks.contains_key(&value)
    }

    /// Values with a running task, sorted
    pub fn active(&self) -> Vec<BroadcastValue> {
        let mut values: Vec<BroadcastValue> = self.tasks.iter().map(|entry| *entry.key()).collect();
        values.sort_unstable();
        values
    }

    /// Abort the task for `value`. Returns whether one was running.
    pub fn cancel(&self, value: BroadcastValue) -> bool {
        match self.tasks.remove(&value) {
            Some((_, handle)) => {
                handle.abort();
                info!("[{}] Cancelled dissemination of {}", self.node_id(), value);
                true
            }
            None => false,
        }
    }

    /// Abort every running task and refuse new ones
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let values = self.active();
        for value in &values {
            if let Some((_, handle)) = self.tasks.remove(value) {
                handle.abort();
            }
        }
        info!(
            "[{}] Dissemination shut down, {} tasks aborted",
            self.node_id(),
            values.len()
        );
    }

    pub fn stats(&self) -> FrozenDisseminationStats {
        self.stats.freeze()
    }
}
