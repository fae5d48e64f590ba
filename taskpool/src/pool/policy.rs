//! Sizing rules of the two pool shapes.

use std::fmt;

use taskpool_api::errors::ConfigError;
use taskpool_api::types::PoolType;

/// Sizing and saturation rules injected into the pool core.
///
/// `nodes` counts every worker node still registered, exiting ones included,
/// so a pool holds at most its maximum size of threads unless all of them are
/// exiting. `live_nodes` leaves exiting nodes out.
pub(crate) trait PoolPolicy: Send + Sync + fmt::Debug {
    fn pool_type(&self) -> PoolType;

    fn min_size(&self) -> usize;

    fn max_size(&self) -> usize;

    /// Whether the pool reached its maximum size.
    fn full(&self, nodes: usize) -> bool;

    /// Whether a submission should create a new dynamic worker node first.
    fn shall_create_dynamic_worker(&self, nodes: usize, live_nodes: usize, internal_busy: bool) -> bool;

    /// Whether the pool as a whole is busy.
    fn busy(&self, nodes: usize, internal_busy: bool) -> bool;

    /// Whether the pool as a whole is back pressured.
    fn back_pressure(&self, nodes: usize, every_node_back_pressured: bool) -> bool;

    /// Whether the pool dropped to zero worker nodes and may grow back.
    fn empty(&self, nodes: usize) -> bool;
}

/// Exactly `size` worker nodes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FixedPolicy {
    size: usize,
}

impl FixedPolicy {
    pub fn new(size: usize) -> Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(Self { size })
    }
}

impl PoolPolicy for FixedPolicy {
    fn pool_type(&self) -> PoolType {
        PoolType::Fixed
    }

    fn min_size(&self) -> usize {
        self.size
    }

    fn max_size(&self) -> usize {
        self.size
    }

    fn full(&self, _nodes: usize) -> bool {
        false
    }

    fn shall_create_dynamic_worker(&self, _nodes: usize, _live_nodes: usize, _internal_busy: bool) -> bool {
        false
    }

    fn busy(&self, _nodes: usize, internal_busy: bool) -> bool {
        internal_busy
    }

    fn back_pressure(&self, nodes: usize, every_node_back_pressured: bool) -> bool {
        nodes > 0 && every_node_back_pressured
    }

    fn empty(&self, _nodes: usize) -> bool {
        false
    }
}

/// Between `min` and `max` worker nodes. Nodes above `min` are dynamic and
/// are removed once idle for longer than their `max_inactive_time`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DynamicPolicy {
    min: usize,
    max: usize,
}

impl DynamicPolicy {
    pub fn new(min: usize, max: usize) -> Result<Self, ConfigError> {
        if max == 0 {
            return Err(ConfigError::ZeroMaximumWorkers);
        }
        if min >= max {
            return Err(ConfigError::InvalidDynamicRange { min, max });
        }
        Ok(Self { min, max })
    }
}

impl PoolPolicy for DynamicPolicy {
    fn pool_type(&self) -> PoolType {
        PoolType::Dynamic
    }

    fn min_size(&self) -> usize {
        self.min
    }

    fn max_size(&self) -> usize {
        self.max
    }

    fn full(&self, nodes: usize) -> bool {
        nodes >= self.max
    }

    /// A pool whose nodes are all exiting grows even at its maximum size:
    /// none of them can take the task.
    fn shall_create_dynamic_worker(&self, nodes: usize, live_nodes: usize, internal_busy: bool) -> bool {
        live_nodes == 0 || (!self.full(nodes) && internal_busy)
    }

    fn busy(&self, nodes: usize, internal_busy: bool) -> bool {
        self.full(nodes) && internal_busy
    }

    fn back_pressure(&self, nodes: usize, every_node_back_pressured: bool) -> bool {
        self.full(nodes) && every_node_back_pressured
    }

    fn empty(&self, nodes: usize) -> bool {
        self.min == 0 && nodes == 0
    }
}
