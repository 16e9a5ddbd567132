//! Sandboxed command execution and per-task workspaces.
//!
//! [`CommandRunner`] executes allowlisted reviewer tooling with timeouts and
//! output caps; [`TaskWorkspace`] mirrors a container onto disk and syncs
//! tool-driven edits back.

pub mod command;
pub mod workspace;

pub use command::{command_line, CommandRecord, CommandRunner, RunnerSink, DEFAULT_ALLOWED_COMMANDS};
pub use workspace::{cleanup_workspaces, SyncReport, TaskWorkspace};
