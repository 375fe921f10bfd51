//! Fractional accounting for named resource classes with atomic,
//! all-or-nothing multi-class allocation and exclusive holds. Grounded on
//! `parallel_executor.py`'s `ResourcePool`; one lock guards the whole table
//! for the duration of an allocate/release, per the locking discipline in
//! the design's concurrency model.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::task::{ResourceRequirement, TaskId};

const DEFAULT_AVAILABLE: f64 = 1.0;
const EPSILON: f64 = 1e-9;

struct ClassState {
    available: f64,
    exclusive_holder: Option<TaskId>,
}

impl Default for ClassState {
    fn default() -> Self {
        Self { available: DEFAULT_AVAILABLE, exclusive_holder: None }
    }
}

#[derive(Default)]
struct PoolState {
    classes: HashMap<String, ClassState>,
    allocations: HashMap<TaskId, HashMap<String, f64>>,
}

/// Per-class fractional budget shared across the Parallel Executor's
/// in-flight cohort.
#[derive(Default)]
pub struct ResourcePool {
    state: Mutex<PoolState>,
}

/// Snapshot of one resource class's utilisation, for [`ResourcePool::metrics`].
#[derive(Debug, Clone)]
pub struct ClassUtilization {
    pub class: String,
    pub available: f64,
    pub held: f64,
    pub exclusive_holder: Option<TaskId>,
}

impl ResourcePool {
    /// An empty pool; every class defaults to `1.0` available the first time
    /// it is referenced.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to allocate every requirement in `requirements` to `task`.
    /// Either all requirements are granted and `true` is returned, or none
    /// are and the pool is left unchanged (`false`).
    pub fn try_allocate(&self, task: &TaskId, requirements: &[ResourceRequirement]) -> bool {
        if requirements.is_empty() {
            return true;
        }

        let mut state = self.state.lock().unwrap();

        for req in requirements {
            let class = state.classes.entry(req.class.clone()).or_default();
            if class.exclusive_holder.is_some() {
                return false;
            }
            if req.exclusive && class.available + EPSILON < DEFAULT_AVAILABLE {
                return false;
            }
            if !req.exclusive && class.available + EPSILON < req.amount {
                return false;
            }
        }

        let entry = state.allocations.entry(task.clone()).or_default();
        for req in requirements {
            let class = state.classes.get_mut(&req.class).unwrap();
            class.available -= req.amount;
            if req.exclusive {
                class.exclusive_holder = Some(task.clone());
            }
            *entry.entry(req.class.clone()).or_insert(0.0) += req.amount;
        }

        true
    }

    /// Returns every amount held by `task` and clears any exclusive lock it held.
    pub fn release(&self, task: &TaskId) {
        let mut state = self.state.lock().unwrap();
        let Some(held) = state.allocations.remove(task) else { return };

        for (class_name, amount) in held {
            if let Some(class) = state.classes.get_mut(&class_name) {
                class.available = (class.available + amount).min(DEFAULT_AVAILABLE);
                if class.exclusive_holder.as_ref() == Some(task) {
                    class.exclusive_holder = None;
                }
            }
        }
    }

    /// Utilisation for every resource class the pool has seen referenced.
    pub fn metrics(&self) -> Vec<ClassUtilization> {
        let state = self.state.lock().unwrap();
        state
            .classes
            .iter()
            .map(|(class, c)| ClassUtilization {
                class: class.clone(),
                available: c.available,
                held: DEFAULT_AVAILABLE - c.available,
                exclusive_holder: c.exclusive_holder.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_allocation_is_atomic_across_classes() {
        let pool = ResourcePool::new();
        let reqs = vec![
            ResourceRequirement::shared("cpu", 0.6),
            ResourceRequirement::shared("memory", 1.5),
        ];

        assert!(!pool.try_allocate(&"t1".to_string(), &reqs));
        // memory request exceeded the budget; cpu must be untouched.
        let cpu = pool.metrics().into_iter().find(|m| m.class == "cpu");
        assert!(cpu.is_none() || cpu.unwrap().available == 1.0);
    }

    #[test]
    fn exclusive_conflicts_with_shared_and_exclusive() {
        let pool = ResourcePool::new();
        assert!(pool.try_allocate(&"t1".to_string(), &[ResourceRequirement::exclusive("gpu", 1.0)]));
        assert!(!pool.try_allocate(&"t2".to_string(), &[ResourceRequirement::shared("gpu", 0.1)]));
        assert!(!pool.try_allocate(&"t2".to_string(), &[ResourceRequirement::exclusive("gpu", 1.0)]));

        pool.release(&"t1".to_string());
        assert!(pool.try_allocate(&"t2".to_string(), &[ResourceRequirement::exclusive("gpu", 1.0)]));
    }

    #[test]
    fn release_restores_budget_exactly() {
        let pool = ResourcePool::new();
        let reqs = vec![ResourceRequirement::shared("cpu", 0.4)];
        assert!(pool.try_allocate(&"t1".to_string(), &reqs));
        pool.release(&"t1".to_string());

        let reqs = vec![ResourceRequirement::shared("cpu", 1.0)];
        assert!(pool.try_allocate(&"t2".to_string(), &reqs));
    }
}
