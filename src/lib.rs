//! distrun: a distributed task-based parallel runtime.
//!
//! Tasks declare data accesses over a cluster-wide virtual address
//! space; the dependency system orders them, the locality scheduler
//! picks the node holding most of their bytes, and a workflow of linked
//! steps (fetch, link, execute, notify, release) moves data and
//! satisfiability between nodes. One bound worker thread runs per
//! admitted CPU; polling services drain the cluster messenger in
//! between.
//!
//! # Module structure
//!
//! - [`config`]: every `cluster.*` knob, resolved from the environment
//! - [`ids`]: node-partitioned id services and the write-id cache
//! - [`node`]: the cluster node registry
//! - [`memory`]: regions, places, the reserved address space, directory
//!   and object pool
//! - [`msg`]: wire messages, the messenger trait and the loopback
//!   transport
//! - [`deps`]: per-task data accesses and the dependency DAG
//! - [`task`]: the task type, its lifecycle and the task-function table
//! - [`workflow`]: the per-task cluster step DAG
//! - [`transfer`]: in-flight transfers and the pending queue
//! - [`polling`]: the message-draining services
//! - [`cpu`]: CPU admission, binding, idle/wake coordination
//! - [`scheduler`]: ready-queue dispatch and the locality policy
//! - [`runtime`]: the service owner and lifecycle entry points

pub mod config;
pub mod cpu;
pub mod deps;
pub mod ids;
pub mod memory;
pub mod msg;
pub mod node;
mod offload;
pub mod polling;
pub mod report;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod transfer;
mod utils;
pub mod workflow;

pub use config::{ClusterConfig, DistributionPolicy};
pub use cpu::{ComputePlace, current_task};
pub use deps::AccessMode;
pub use ids::WriteId;
pub use memory::MemoryRegion;
pub use runtime::{Runtime, WaitHandle};
pub use task::{DelayedRelease, Task, TaskBuilder};

#[cfg(test)]
mod tests;
