//! Local command bridge for Benjamin.
//!
//! The agent loop may run a narrow set of read-only commands (listing, diffing, status,
//! test runners). Everything else is rejected before a process is spawned.

mod error;
mod shell;
mod traits;

pub use error::{Result, ToolError};
pub use shell::{SandboxedShell, ShellPolicy};
pub use traits::CommandRunner;
