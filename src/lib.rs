//! pactown turns a single Markdown README with `markpact:`-tagged fenced
//! code blocks into a running, supervised service sandbox.
//!
//! The pipeline: parse the document into [`blocks::Block`]s, resolve a
//! [`targets::TargetConfig`], materialize a [`sandbox::Sandbox`] with its
//! manifest triple, install dependencies through the content-addressed
//! [`cache::DependencyCache`], then spawn and health-check the service via
//! the [`supervisor::ProcessSupervisor`]. [`runner::ServiceRunner`] drives
//! the whole thing; everything before the sandbox step is pure.

pub mod blocks;
pub mod cache;
pub mod config;
pub mod errors;
pub mod manifest;
pub mod policy;
pub mod runner;
pub mod runtime;
pub mod sandbox;
pub mod supervisor;
pub mod targets;

pub use config::{CacheConfig, ServiceConfig, SupervisorConfig};
pub use errors::{PactownError, Result};
pub use runner::{RunOutcome, ServiceRunner, ValidationResult};
pub use sandbox::{Sandbox, SandboxManager};
pub use supervisor::{ProcessHandle, ProcessState, ProcessSupervisor};
