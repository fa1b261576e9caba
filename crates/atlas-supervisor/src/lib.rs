//! Supervisor for locally registered Python web applications.
//!
//! Applications are started detached in their own session, their port is
//! allocated from a configured range, and their stdout/stderr go to files that
//! can be followed with [`log_tail`]. All state lives in the registry
//! (`atlas-db`), so a restarted supervisor picks up where it left off.

pub mod config;
pub mod environments;
pub mod error;
pub mod launch;
pub mod log_tail;
pub mod port_alloc;
pub mod process_tree;
pub mod reconcile;
pub mod supervisor;
pub mod tunnel;

pub use config::SupervisorConfig;
pub use error::SupervisorError;
pub use supervisor::Supervisor;
