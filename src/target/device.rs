//! Externally provisioned targets: physical devices and Macs.
//!
//! These are assumed ready and cannot be reset from here.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{BatchRunner, Target, TargetKind, TargetResult};
use crate::transport::{Session, TransportResult};

/// A physical device or a Mac.
pub struct Device<S> {
    runner: BatchRunner<S>,
}

impl<S: Session> Device<S> {
    pub fn new(runner: BatchRunner<S>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl<S: Session> Target for Device<S> {
    fn kind(&self) -> TargetKind {
        self.runner.kind()
    }

    fn udid(&self) -> &str {
        self.runner.udid()
    }

    async fn ready(&self) -> bool {
        true
    }

    async fn run(&self, tests: &[String]) -> TargetResult<Vec<String>> {
        self.runner.run_batch(tests).await
    }

    async fn reset(&self) -> TargetResult<()> {
        Ok(())
    }

    async fn delete_app(&self, _bundle_id: &str) {}

    async fn fetch_results(&self, local_dir: &Path) -> TransportResult<PathBuf> {
        self.runner.fetch_results(local_dir).await
    }
}
