//! # roadtest-core
//!
//! Core library for mobile test-run orchestration.
//!
//! roadtest provisions a disposable app project, triggers a platform
//! build/run, waits for the test suite executing on a device (local or
//! cloud-hosted) to report completion over a local event server, aggregates
//! pass/fail, and tears everything down on every exit path.
//!
//! ## Modules
//!
//! - [`context`] - Immutable per-run configuration and fail-fast validation
//! - [`settings`] - Persisted user defaults in `~/.roadtest/config.json`
//! - [`protocol`] - Wire model of the device harness event stream
//! - [`server`] - Local test event server the device dials back to
//! - [`watchdog`] - One-shot timer bounding the wait for device attachment
//! - [`project`] - Disposable scaffolded-project handle
//! - [`tooling`] - Build/run tool invocation
//! - [`remote`] - Device cloud upload and session management
//! - [`orchestrator`] - The run pipeline with guaranteed teardown
//!
//! ## Example
//!
//! ```no_run
//! use roadtest_core::context::{ExecMode, ExecutionContext, Platform};
//! use roadtest_core::orchestrator::Orchestrator;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let context = ExecutionContext::new(
//!     Platform::Android,
//!     ExecMode::RunLocal,
//!     std::env::temp_dir(),
//! );
//!
//! let outcome = Orchestrator::new(context).run().await?;
//! println!("passed: {}", outcome.passed);
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod orchestrator;
pub mod project;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod settings;
pub mod tooling;
pub mod watchdog;
