pub mod cache;
pub mod config;
pub mod converge;
pub mod destroy;
pub mod error;
pub mod infra;
pub mod kubernetes;
pub mod logging;
pub mod meta;
pub mod nodeuser;
pub mod phases;
pub mod resources;
pub mod retry;
pub mod shutdown;
pub mod ssh;
pub mod state;
pub mod tmplock;

#[cfg(test)]
pub(crate) mod testing;

// Re-export for main.rs
pub use crate::destroy::{ClusterDestroyer, DestroyOutcome};
pub use crate::error::{DestroyError, ErrorKind};
