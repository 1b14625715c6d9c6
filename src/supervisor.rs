//! Supervisor types and implementation

mod error;
mod handle;
mod record;
mod runtime;

pub use error::ClusterError;
pub use handle::SupervisorHandle;
