//! Admission and eviction of models under a fixed capacity budget
//!
//! Roles compete for residency on a shared compute resource (typically GPU
//! memory). The scheduler does not move any bytes itself; it keeps the
//! logical books so that the sum of loaded costs never exceeds the budget,
//! and tells the caller which roles it evicted to make room.
//!
//! ```text
//! request(role)
//!   ├─ already loaded ─────────────────────────► Ready
//!   ├─ fits in free capacity ──► load ─────────► Ready
//!   ├─ cost > budget ──────────────────────────► ResourceExhausted (no change)
//!   └─ evict lowest priority first until it fits ─► load ─► Ready { evicted }
//! ```
//!
//! One mutex guards the whole decision. It is only held for the bookkeeping,
//! never across generation or tool calls.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use super::role::{Role, RoleDescriptor};
use crate::metrics::{
    MODEL_EVICTIONS, MODEL_LOADS, SCHEDULER_BUDGET, SCHEDULER_EXHAUSTED, SCHEDULER_USAGE,
};

/// Slack for float rounding when comparing summed costs to the budget
const CAPACITY_EPSILON: f64 = 1e-9;

fn fits(usage: f64, cost: f64, max_budget: f64) -> bool {
    usage + cost <= max_budget + CAPACITY_EPSILON
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    /// The role cannot fit even with everything else evicted
    #[error("Not enough capacity for {role}: needs {cost}, budget is {max_budget}")]
    ResourceExhausted {
        role: Role,
        cost: f64,
        max_budget: f64,
    },
    /// The role was not configured at startup
    #[error("Role {0} is not configured")]
    UnknownRole(Role),
    /// Budget or cost is not a positive finite number
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}

/// A role evicted to make room
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Eviction {
    pub role: Role,
    pub model: String,
}

/// Successful admission
#[derive(Debug, Clone, PartialEq)]
pub struct Ready {
    pub role: Role,
    /// Model identifier to address the backend with
    pub model: String,
    /// False when the role was already resident
    pub newly_loaded: bool,
    /// Roles unloaded by this request, in eviction order
    pub evicted: Vec<Eviction>,
}

/// Point-in-time view of one descriptor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DescriptorStatus {
    pub role: Role,
    pub model: String,
    pub cost: f64,
    pub priority: i32,
    pub loaded: bool,
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub max_budget: f64,
    pub current_usage: f64,
    pub roles: Vec<DescriptorStatus>,
}

#[derive(Debug)]
struct SchedulerState {
    max_budget: f64,
    current_usage: f64,
    descriptors: BTreeMap<Role, RoleDescriptor>,
}

impl SchedulerState {
    /// Recompute usage from the loaded descriptors
    fn refresh_usage(&mut self) {
        self.current_usage = self
            .descriptors
            .values()
            .filter(|d| d.loaded)
            .map(|d| d.cost)
            .sum();
        SCHEDULER_USAGE.set(self.current_usage);
    }
}

/// Capacity-bounded model scheduler, shared by all sessions
#[derive(Debug)]
pub struct ModelScheduler {
    state: Mutex<SchedulerState>,
}

impl ModelScheduler {
    /// Create a scheduler with every role unloaded
    pub fn new(
        max_budget: f64,
        descriptors: impl IntoIterator<Item = (Role, RoleDescriptor)>,
    ) -> Result<Self, SchedulerError> {
        if !(max_budget.is_finite() && max_budget > 0.0) {
            return Err(SchedulerError::InvalidConfig(format!(
                "max_budget must be positive, got {}",
                max_budget
            )));
        }

        let mut map = BTreeMap::new();
        for (role, mut descriptor) in descriptors {
            if !(descriptor.cost.is_finite() && descriptor.cost > 0.0) {
                return Err(SchedulerError::InvalidConfig(format!(
                    "cost of {} must be positive, got {}",
                    role, descriptor.cost
                )));
            }
            descriptor.loaded = false;
            map.insert(role, descriptor);
        }

        SCHEDULER_BUDGET.set(max_budget);
        SCHEDULER_USAGE.set(0.0);

        Ok(Self {
            state: Mutex::new(SchedulerState {
                max_budget,
                current_usage: 0.0,
                descriptors: map,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        // every mutation leaves the books consistent, so a poisoned lock is safe to reuse
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `role` resident, evicting lower-priority roles if needed.
    ///
    /// A failed request leaves the state untouched.
    pub fn request(&self, role: Role) -> Result<Ready, SchedulerError> {
        let mut state = self.lock();

        let (cost, model, loaded) = match state.descriptors.get(&role) {
            Some(d) => (d.cost, d.model.clone(), d.loaded),
            None => return Err(SchedulerError::UnknownRole(role)),
        };

        if loaded {
            return Ok(Ready {
                role,
                model,
                newly_loaded: false,
                evicted: Vec::new(),
            });
        }

        if cost > state.max_budget {
            SCHEDULER_EXHAUSTED.with_label_values(&[role.as_str()]).inc();
            warn!(role = %role, cost, max_budget = state.max_budget, "Model can never fit");
            return Err(SchedulerError::ResourceExhausted {
                role,
                cost,
                max_budget: state.max_budget,
            });
        }

        let mut evicted = Vec::new();

        if !fits(state.current_usage, cost, state.max_budget) {
            let mut candidates: Vec<(Role, i32)> = state
                .descriptors
                .iter()
                .filter(|(_, d)| d.loaded)
                .map(|(r, d)| (*r, d.priority))
                .collect();
            // lowest priority first, ties by role order
            candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));

            // usage is recomputed from the survivors so an empty set sums to exactly zero
            let mut plan = Vec::new();
            for (victim, _) in candidates {
                plan.push(victim);
                let remaining: f64 = state
                    .descriptors
                    .iter()
                    .filter(|(r, d)| d.loaded && !plan.contains(*r))
                    .map(|(_, d)| d.cost)
                    .sum();
                if fits(remaining, cost, state.max_budget) {
                    break;
                }
            }

            for victim in plan {
                if let Some(d) = state.descriptors.get_mut(&victim) {
                    d.loaded = false;
                    MODEL_EVICTIONS.with_label_values(&[victim.as_str()]).inc();
                    info!(role = %victim, model = %d.model, cost = d.cost, "Model evicted");
                    evicted.push(Eviction {
                        role: victim,
                        model: d.model.clone(),
                    });
                }
            }
        }

        if let Some(d) = state.descriptors.get_mut(&role) {
            d.loaded = true;
        }
        state.refresh_usage();
        MODEL_LOADS.with_label_values(&[role.as_str()]).inc();
        info!(
            role = %role,
            model = %model,
            cost,
            usage = state.current_usage,
            max_budget = state.max_budget,
            evicted = evicted.len(),
            "Model ready"
        );

        Ok(Ready {
            role,
            model,
            newly_loaded: true,
            evicted,
        })
    }

    /// Mark `role` unloaded. Returns whether it was loaded.
    pub fn release(&self, role: Role) -> bool {
        let mut state = self.lock();
        let was_loaded = match state.descriptors.get_mut(&role) {
            Some(d) if d.loaded => {
                d.loaded = false;
                true
            }
            _ => false,
        };
        if was_loaded {
            state.refresh_usage();
            info!(role = %role, usage = state.current_usage, "Model released");
        }
        was_loaded
    }

    pub fn is_loaded(&self, role: Role) -> bool {
        self.lock()
            .descriptors
            .get(&role)
            .map(|d| d.loaded)
            .unwrap_or(false)
    }

    pub fn model_for(&self, role: Role) -> Option<String> {
        self.lock().descriptors.get(&role).map(|d| d.model.clone())
    }

    pub fn usage(&self) -> f64 {
        self.lock().current_usage
    }

    pub fn max_budget(&self) -> f64 {
        self.lock().max_budget
    }

    pub fn roles(&self) -> Vec<Role> {
        self.lock().descriptors.keys().copied().collect()
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.lock();
        SchedulerStatus {
            max_budget: state.max_budget,
            current_usage: state.current_usage,
            roles: state
                .descriptors
                .iter()
                .map(|(role, d)| DescriptorStatus {
                    role: *role,
                    model: d.model.clone(),
                    cost: d.cost,
                    priority: d.priority,
                    loaded: d.loaded,
                })
                .collect(),
        }
    }
}
