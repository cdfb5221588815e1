//! Code execution subsystem: turns untrusted submissions into verdicts.
//!
//! Leaves first: [`workspace`] materializes files, [`sandbox`] runs a fixed
//! command under resource limits, [`parsers`] read test-runner output,
//! [`executor`] glues those together per language, and [`coordinator`]
//! dispatches by language name.

pub mod coordinator;
pub mod executor;
pub mod parsers;
pub mod sandbox;
pub mod workspace;

pub use coordinator::Coordinator;
pub use executor::ExecutionEngine;
pub use sandbox::{Sandbox, SandboxOutput, SandboxRequest};
pub use workspace::{FileSet, Workspace, WorkspaceManager};
