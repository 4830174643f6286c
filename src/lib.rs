//! xcfleet: distributed XCTest runner.
//!
//! This crate spreads the tests of one `.xctestrun` build across a fleet of
//! macOS hosts, each driving one or more simulators, devices or the Mac
//! itself, and retries tests whose results were lost or failed.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Ledger**: the shared queue of tests with their retry state
//! - **Orchestrator**: deploys the build and supervises every node
//! - **Targets**: run batches with `xcodebuild` (simulator, device, Mac)
//! - **Result decoding**: reads outcomes from `.xcresult` bundles
//! - **Transport**: shell and file transfer over SSH or locally
//! - **Report**: console progress, JUnit XML and a text summary
//!
//! # Example
//!
//! ```no_run
//! use xcfleet::config::load_config;
//! use xcfleet::orchestrator::Orchestrator;
//! use xcfleet::report::ConsoleReporter;
//! use xcfleet::transport::ssh::SshTransport;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("xcfleet.toml"))?;
//!     let orchestrator = Orchestrator::new(config, SshTransport::new(), ConsoleReporter::new(false));
//!     // ... load the plan, enumerate tests, then orchestrator.run(...) ...
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod ledger;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod shutdown;
pub mod target;
pub mod transport;
pub mod xcresult;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use ledger::{Ledger, TestCase, TestState};
pub use orchestrator::{Orchestrator, RunResult};
pub use report::Reporter;
pub use transport::{Session, Transport};
