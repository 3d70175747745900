//! Resource-constrained model scheduler
//!
//! Several model roles share one expensive resource (usually GPU memory)
//! that cannot hold all of them at once. The scheduler admits roles under a
//! fixed budget and evicts the lowest-priority residents to make room.
//!
//! # Example Usage
//!
//! ```ignore
//! use neurosurf::scheduler::{default_catalogue, ModelScheduler, Role};
//!
//! let scheduler = ModelScheduler::new(24.0, default_catalogue())?;
//! let ready = scheduler.request(Role::Executive)?;
//! for evicted in &ready.evicted {
//!     println!("unloaded {}", evicted.model);
//! }
//! ```

pub mod manager;
pub mod role;

pub use manager::{
    DescriptorStatus, Eviction, ModelScheduler, Ready, SchedulerError, SchedulerStatus,
};
pub use role::{default_catalogue, Role, RoleDescriptor};
