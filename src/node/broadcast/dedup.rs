use std::collections::HashSet;
use std::sync::Mutex;

use crate::concurrency_error;
use crate::error::Result;
use crate::node::BroadcastValue;

/// Every broadcast value this node has accepted. Append-only.
#[derive(Debug, Default)]
pub struct DedupStore {
    values: Mutex<HashSet<BroadcastValue>>,
}

impl DedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value`, returning true iff it was not already present.
    ///
    /// The membership check and the insert happen under one lock acquisition,
    /// so of two concurrent first arrivals exactly one sees `true`.
    pub fn test_and_insert(&self, value: BroadcastValue) -> Result<bool> {
        self.values
            .lock()
            .map_err(|e| concurrency_error!("Dedup store lock fail {}", e))
            .map(|mut values| values.insert(value))
    }

    pub fn contains(&self, value: BroadcastValue) -> Result<bool> {
        self.values
            .lock()
            .map_err(|e| concurrency_error!("Dedup store lock fail {}", e))
            .map(|values| values.contains(&value))
    }

    pub fn snapshot(&self) -> Result<HashSet<BroadcastValue>> {
        self.values
            .lock()
            .map_err(|e| concurrency_error!("Dedup store lock fail {}", e))
            .map(|values| values.clone())
    }

    pub fn len(&self) -> Result<usize> {
        self.values
            .lock()
            .map_err(|e| concurrency_error!("Dedup store lock fail {}", e))
            .map(|values| values.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }
}
