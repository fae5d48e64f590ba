//! Worker node selection strategies.
//!
//! A strategy only sees [`WorkerNodeView`]s of the candidate nodes, already
//! filtered by readiness and task function eligibility, and returns the key
//! of the node that receives the next task.

use std::collections::HashMap;
use std::fmt;

use taskpool_api::types::{Measurement, WorkerChoiceStrategyKind};

use crate::config::WorkerChoiceStrategyOptions;

/// What a strategy knows about a candidate worker node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerNodeView {
    pub key: usize,
    pub ready: bool,
    pub executing: usize,
    pub queued: usize,
    /// Average task run time in milliseconds, when recorded
    pub run_time: Option<f64>,
    /// Average task wait time in milliseconds, when recorded
    pub wait_time: Option<f64>,
}

impl WorkerNodeView {
    fn load(&self) -> usize {
        self.executing + self.queued
    }
}

pub trait WorkerChoiceStrategy: Send + fmt::Debug {
    /// Picks one of `candidates`, or `None` when there is none.
    fn choose(&mut self, candidates: &[WorkerNodeView]) -> Option<usize>;

    /// Called after the node `key` left the pool; keys above it shift down by one.
    fn remove(&mut self, _key: usize) {}

    /// Measurement the strategy ranks nodes by, if any.
    fn measurement(&self) -> Option<Measurement> {
        None
    }
}

/// Cycles through the candidates in key order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: usize,
}

impl WorkerChoiceStrategy for RoundRobin {
    fn choose(&mut self, candidates: &[WorkerNodeView]) -> Option<usize> {
        let chosen = candidates
            .iter()
            .map(|view| view.key)
            .filter(|key| *key >= self.next)
            .min()
            .or_else(|| candidates.iter().map(|view| view.key).min())?;
        self.next = chosen + 1;
        Some(chosen)
    }

    fn remove(&mut self, key: usize) {
        if self.next > key {
            self.next -= 1;
        }
    }
}

/// Picks the node with the fewest executing and queued tasks.
#[derive(Debug, Default)]
pub struct LeastUsed;

impl WorkerChoiceStrategy for LeastUsed {
    fn choose(&mut self, candidates: &[WorkerNodeView]) -> Option<usize> {
        candidates
            .iter()
            .min_by_key(|view| (view.load(), view.key))
            .map(|view| view.key)
    }
}

/// Picks the node with the lowest average run (or wait) time.
/// Nodes without samples rank first.
#[derive(Debug)]
pub struct LeastBusy {
    measurement: Measurement,
}

impl LeastBusy {
    pub fn new(measurement: Measurement) -> Self {
        Self { measurement }
    }

    fn score(&self, view: &WorkerNodeView) -> f64 {
        match self.measurement {
            Measurement::RunTime => view.run_time,
            Measurement::WaitTime => view.wait_time,
        }
        .unwrap_or(0.0)
    }
}

impl WorkerChoiceStrategy for LeastBusy {
    fn choose(&mut self, candidates: &[WorkerNodeView]) -> Option<usize> {
        candidates
            .iter()
            .min_by(|a, b| {
                self.score(a)
                    .total_cmp(&self.score(b))
                    .then(a.load().cmp(&b.load()))
                    .then(a.key.cmp(&b.key))
            })
            .map(|view| view.key)
    }

    fn measurement(&self) -> Option<Measurement> {
        Some(self.measurement)
    }
}

/// Strategies in use by a pool, created on first use.
#[derive(Debug)]
pub(crate) struct StrategyContext {
    default: WorkerChoiceStrategyKind,
    options: WorkerChoiceStrategyOptions,
    strategies: HashMap<WorkerChoiceStrategyKind, Box<dyn WorkerChoiceStrategy>>,
}

impl StrategyContext {
    pub fn new(default: WorkerChoiceStrategyKind, options: WorkerChoiceStrategyOptions) -> Self {
        Self {
            default,
            options,
            strategies: HashMap::new(),
        }
    }

    pub fn default_kind(&self) -> WorkerChoiceStrategyKind {
        self.default
    }

    pub fn history_size(&self) -> usize {
        self.options.history_size
    }

    pub fn choose(
        &mut self,
        kind: Option<WorkerChoiceStrategyKind>,
        candidates: &[WorkerNodeView],
    ) -> Option<usize> {
        let kind = kind.unwrap_or(self.default);
        let measurement = self.options.measurement.unwrap_or_default();
        self.strategies
            .entry(kind)
            .or_insert_with(|| build(kind, measurement))
            .choose(candidates)
    }

    pub fn remove(&mut self, key: usize) {
        for strategy in self.strategies.values_mut() {
            strategy.remove(key);
        }
    }

    /// Whether nodes must record measurement windows when `kinds` are in use.
    pub fn needs_measurements(&self, kinds: impl IntoIterator<Item = WorkerChoiceStrategyKind>) -> bool {
        let measurement = self.options.measurement.unwrap_or_default();
        self.options.measurement.is_some()
            || std::iter::once(self.default)
                .chain(kinds)
                .any(|kind| build(kind, measurement).measurement().is_some())
    }
}

fn build(kind: WorkerChoiceStrategyKind, measurement: Measurement) -> Box<dyn WorkerChoiceStrategy> {
    match kind {
        WorkerChoiceStrategyKind::RoundRobin => Box::new(RoundRobin::default()),
        WorkerChoiceStrategyKind::LeastUsed => Box::new(LeastUsed),
        WorkerChoiceStrategyKind::LeastBusy => Box::new(LeastBusy::new(measurement)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(key: usize, executing: usize, queued: usize, run_time: Option<f64>) -> WorkerNodeView {
        WorkerNodeView {
            key,
            ready: true,
            executing,
            queued,
            run_time,
            wait_time: None,
        }
    }

    #[test]
    fn test_round_robin_cycles_and_skips_missing_keys() {
        let mut strategy = RoundRobin::default();
        let candidates = [view(0, 0, 0, None), view(2, 0, 0, None), view(3, 0, 0, None)];
        let picks: Vec<usize> = (0..5).filter_map(|_| strategy.choose(&candidates)).collect();
        assert_eq!(picks, vec![0, 2, 3, 0, 2]);
        assert_eq!(strategy.choose(&[]), None);
    }

    #[test]
    fn test_round_robin_follows_key_shift() {
        let mut strategy = RoundRobin::default();
        let candidates = [view(0, 0, 0, None), view(1, 0, 0, None), view(2, 0, 0, None)];
        assert_eq!(strategy.choose(&candidates), Some(0));
        assert_eq!(strategy.choose(&candidates), Some(1));
        strategy.remove(0);
        let shifted = [view(0, 0, 0, None), view(1, 0, 0, None)];
        assert_eq!(strategy.choose(&shifted), Some(1));
    }

    #[test]
    fn test_least_used() {
        let mut strategy = LeastUsed;
        let candidates = [view(0, 2, 1, None), view(1, 1, 0, None), view(2, 0, 1, None)];
        assert_eq!(strategy.choose(&candidates), Some(1));
    }

    #[test]
    fn test_least_busy_prefers_unmeasured_then_fastest() {
        let mut strategy = LeastBusy::new(Measurement::RunTime);
        let candidates = [view(0, 0, 0, Some(12.0)), view(1, 0, 0, Some(3.5)), view(2, 3, 0, None)];
        assert_eq!(strategy.choose(&candidates), Some(2));
        let measured = [view(0, 0, 0, Some(12.0)), view(1, 0, 0, Some(3.5))];
        assert_eq!(strategy.choose(&measured), Some(1));
    }

    #[test]
    fn test_context_measurement_needs() {
        let context = StrategyContext::new(
            WorkerChoiceStrategyKind::RoundRobin,
            WorkerChoiceStrategyOptions::default(),
        );
        assert!(!context.needs_measurements([WorkerChoiceStrategyKind::LeastUsed]));
        assert!(context.needs_measurements([WorkerChoiceStrategyKind::LeastBusy]));

        let context = StrategyContext::new(
            WorkerChoiceStrategyKind::RoundRobin,
            WorkerChoiceStrategyOptions {
                measurement: Some(Measurement::WaitTime),
                ..Default::default()
            },
        );
        assert!(context.needs_measurements([]));
    }
}
