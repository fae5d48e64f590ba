use serde::{Deserialize, Serialize};

/// Shape of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    /// Exactly `number_of_workers` worker nodes
    Fixed,
    /// Between `min` and `max` worker nodes, grown on demand
    Dynamic,
}

/// Execution context backing a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    Thread,
}

/// How a worker terminates once asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KillBehavior {
    /// Finish in-flight tasks before exiting
    #[default]
    Soft,
    /// Exit immediately, abandoning in-flight tasks
    Hard,
}

/// Worker node selection policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerChoiceStrategyKind {
    #[default]
    RoundRobin,
    LeastUsed,
    LeastBusy,
}

/// Per-task measurement a selection policy may consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Measurement {
    #[default]
    RunTime,
    WaitTime,
}

/// Aggregate, read-only view over a pool and its worker nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfo {
    pub version: String,
    pub pool_type: PoolType,
    pub worker_type: WorkerType,
    pub started: bool,
    /// Every one of the `min_size` static worker nodes answered its handshake.
    /// With a zero `min_size`, one ready node of any kind is enough.
    pub ready: bool,
    pub strategy: WorkerChoiceStrategyKind,
    pub min_size: usize,
    pub max_size: usize,
    pub worker_nodes: usize,
    pub idle_worker_nodes: usize,
    pub busy_worker_nodes: usize,
    pub executed_tasks: usize,
    pub executing_tasks: usize,
    pub queued_tasks: usize,
    pub max_queued_tasks: usize,
    pub stolen_tasks: usize,
    pub failed_tasks: usize,
    pub back_pressure: bool,
}
