use serde::{Deserialize, Serialize};

pub mod embedding;
pub mod harvest;

/// Control messages accepted on the ZMQ socket.
#[derive(Deserialize, Debug)]
pub enum ZmqMessage {
    /// Run a full cycle over every configured source.
    HarvestCycle,
    /// Run a cycle restricted to the named source selectors.
    HarvestSources(Vec<String>),
}

/// Per-adapter accounting for one cycle.
#[derive(Debug, Serialize)]
pub struct AdapterReport {
    pub source_id: String,
    pub items_fetched: usize,
    pub items_rejected: usize,
    pub pages_skipped: u32,
    pub failure: Option<String>,
}

/// Everything one harvest cycle did, for the summary log.
#[derive(Debug, Serialize)]
pub struct CycleReport {
    pub adapters: Vec<AdapterReport>,
    pub merged: usize,
    pub created: usize,
    pub conflicts: usize,
    pub deactivated: usize,
    pub embedded: usize,
    pub pending: usize,
    pub duration_secs: u64,
}
