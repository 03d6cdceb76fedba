pub mod access;
pub mod registry;

pub use access::{AccessFlags, AccessMode, DataAccess};
pub use registry::{DependencyObserver, DependencyRegistry};
