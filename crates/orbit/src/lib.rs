//! Orbit: task and workspace lifecycle for worktree-isolated agent runs.

pub mod cancel;
pub mod confirm;
pub mod engine;
pub mod lifecycle;
// logging is only used by the binary and not glob-reexported.
pub mod logging;
pub mod persistence;
pub mod process;
pub mod recovery;
pub mod service;
pub mod state_machine;
pub mod store;
pub mod transition_log;
pub mod types;

#[cfg(test)]
mod testutil;

pub use cancel::*;
pub use confirm::*;
pub use engine::*;
pub use lifecycle::*;
pub use persistence::*;
pub use process::*;
pub use recovery::*;
pub use service::*;
pub use state_machine::*;
pub use store::*;
pub use transition_log::*;
pub use types::*;
