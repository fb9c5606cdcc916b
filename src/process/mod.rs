//! External process supervision
//!
//! Launches injector/client binaries, watches their output for a readiness
//! marker and stops them on request.

mod managed;
pub mod matcher;
pub mod output;
mod spec;

pub use managed::{ExitInfo, ManagedProcess, Termination};
pub use matcher::{ReadinessMatcher, ReadyEvent};
pub use spec::ProcessSpec;
