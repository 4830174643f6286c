//! Local session implementation.
//!
//! Runs commands as child processes of the coordinator. Used for everything
//! that happens on the coordinator host: packaging the build, reading the
//! test plan, unpacking and querying result bundles, running hooks.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;

use super::{Command, ExecResult, Session, TransportError, TransportResult};

/// A [`Session`] bound to the local machine.
///
/// "Upload" and "download" are recursive copies, which keeps code that
/// shuttles files between hosts agnostic of where it runs.
#[derive(Debug, Clone)]
pub struct LocalSession {
    id: String,
}

impl LocalSession {
    /// Creates a new local session.
    pub fn new() -> Self {
        Self {
            id: "local".to_string(),
        }
    }

    async fn copy(&self, from: &Path, to: &Path) -> TransportResult<ExecResult> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.exec(
            &Command::new("cp")
                .arg("-R")
                .arg(from.to_string_lossy())
                .arg(to.to_string_lossy()),
        )
        .await
    }
}

impl Default for LocalSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Session for LocalSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(&self, cmd: &Command) -> TransportResult<ExecResult> {
        let start = Instant::now();

        let mut child = tokio::process::Command::new("/bin/sh");
        child.arg("-c").arg(cmd.to_script()).kill_on_drop(true);

        let output = match cmd.timeout_duration() {
            Some(timeout) => tokio::time::timeout(timeout, child.output())
                .await
                .map_err(|_| {
                    TransportError::Timeout(format!(
                        "command timed out after {}s",
                        timeout.as_secs()
                    ))
                })?,
            None => child.output().await,
        }
        .map_err(|e| TransportError::ExecFailed(e.to_string()))?;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        })
    }

    async fn upload(&self, local: &Path, remote: &Path) -> TransportResult<()> {
        let result = self.copy(local, remote).await?;
        if !result.success() {
            return Err(TransportError::UploadFailed(result.stderr));
        }
        Ok(())
    }

    async fn download(&self, remote: &Path, local: &Path) -> TransportResult<()> {
        let result = self.copy(remote, local).await?;
        if !result.success() {
            return Err(TransportError::DownloadFailed(result.stderr));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_captures_output_and_status() {
        let session = LocalSession::new();
        let result = session
            .exec(&Command::shell("echo out; echo err >&2; exit 65").env("UNUSED", "x"))
            .await
            .unwrap();

        assert_eq!(result.exit_code, 65);
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_exec_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let session = LocalSession::new();
        let result = session
            .exec(
                &Command::shell("echo \"$NAME\" > name.txt")
                    .env("NAME", "fleet")
                    .working_dir(dir.path().to_string_lossy()),
            )
            .await
            .unwrap();

        assert!(result.success());
        let written = std::fs::read_to_string(dir.path().join("name.txt")).unwrap();
        assert_eq!(written.trim(), "fleet");
    }

    #[tokio::test]
    async fn test_exec_timeout() {
        let session = LocalSession::new();
        let err = session
            .exec(&Command::new("sleep").arg("5").timeout(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_upload_and_download_copy_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, "payload").unwrap();
        let session = LocalSession::new();

        let uploaded = dir.path().join("remote/b.txt");
        session.upload(&source, &uploaded).await.unwrap();
        let downloaded = dir.path().join("back/c.txt");
        session.download(&uploaded, &downloaded).await.unwrap();

        assert_eq!(std::fs::read_to_string(downloaded).unwrap(), "payload");
    }
}
