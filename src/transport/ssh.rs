//! SSH transport implementation.
//!
//! Runs commands on remote Macs through the system `ssh` and `scp`
//! binaries. Each [`SshSession`] is a logical connection; the actual SSH
//! processes are transient, one per command or transfer.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Authentication | Key based only (`BatchMode=yes`) |
//! | File transfer | Via `scp` |
//! | Architecture prefix | `arch -<arch> /bin/sh -c ...` when configured |
//!
//! # Prerequisites
//!
//! - `ssh` and `scp` available on the coordinator
//! - Xcode and the declared simulators/devices available on every node
//!
//! # Security Considerations
//!
//! Host key checking is disabled unless a node sets
//! `strict_host_key_checking = true`.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use super::{
    Command, ExecResult, Session, Transport, TransportError, TransportResult, shell_quote,
};
use crate::config::NodeConfig;

/// Seconds allowed for the TCP/SSH handshake.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// `ssh` exits with this status when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Transport that opens [`SshSession`]s using the system `ssh` client.
#[derive(Debug, Clone, Default)]
pub struct SshTransport;

impl SshTransport {
    /// Creates a new SSH transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for SshTransport {
    type Session = SshSession;

    async fn connect(&self, node: &NodeConfig) -> TransportResult<SshSession> {
        let session = SshSession::from_config(node);

        debug!("[{}] opening connection to {}", node.name, session.ssh_dest());
        let probe = session.exec(&Command::new("true")).await?;
        if probe.exit_code == SSH_CONNECTION_FAILURE {
            let stderr = probe.stderr.trim().to_string();
            return Err(if stderr.contains("Permission denied") {
                TransportError::Authentication(format!("{}: {}", session.ssh_dest(), stderr))
            } else {
                TransportError::Connection(format!("{}: {}", session.ssh_dest(), stderr))
            });
        }

        Ok(session)
    }
}

/// A session that executes commands on a remote host via SSH.
///
/// Commands are executed as:
/// ```sh
/// ssh [options] user@host "export KEY='value'; cd '/path'; command"
/// ```
pub struct SshSession {
    id: String,
    host: String,
    user: String,
    port: u16,
    ssh_opts: Vec<String>,
    arch: Option<String>,
}

impl SshSession {
    /// Builds a session from a node's configuration without connecting.
    pub fn from_config(node: &NodeConfig) -> Self {
        let mut ssh_opts = vec![
            "BatchMode=yes".to_string(),
            format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS),
            "ServerAliveInterval=30".to_string(),
        ];

        if !node.strict_host_key_checking {
            ssh_opts.push("StrictHostKeyChecking=no".to_string());
            ssh_opts.push("UserKnownHostsFile=/dev/null".to_string());
        }

        if let Some(key_path) = &node.private_key {
            let key = shellexpand::tilde(&key_path.to_string_lossy()).into_owned();
            ssh_opts.push(format!("IdentityFile={}", key));
        }

        Self {
            id: node.name.clone(),
            host: node.host.clone(),
            user: node.username.clone(),
            port: node.port,
            ssh_opts,
            arch: node.arch.clone(),
        }
    }

    /// Build the SSH destination string.
    fn ssh_dest(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// `-o` options shared by `ssh` and `scp`.
    fn option_args(&self) -> Vec<String> {
        self.ssh_opts
            .iter()
            .flat_map(|opt| ["-o".to_string(), opt.clone()])
            .collect()
    }

    /// Wraps the rendered script with the architecture prefix, if any.
    fn remote_script(&self, cmd: &Command) -> String {
        let script = cmd.to_script();
        match &self.arch {
            Some(arch) => format!("arch -{} /bin/sh -c {}", arch, shell_quote(&script)),
            None => script,
        }
    }

    fn ssh_command(&self, cmd: &Command) -> tokio::process::Command {
        let mut ssh = tokio::process::Command::new("ssh");
        ssh.args(self.option_args())
            .arg("-p")
            .arg(self.port.to_string())
            .arg(self.ssh_dest())
            .arg(self.remote_script(cmd))
            .kill_on_drop(true);
        ssh
    }

    fn scp_command(&self) -> tokio::process::Command {
        let mut scp = tokio::process::Command::new("scp");
        scp.arg("-r")
            .args(self.option_args())
            .arg("-P")
            .arg(self.port.to_string())
            .kill_on_drop(true);
        scp
    }

    fn remote_path(&self, path: &Path) -> String {
        format!("{}:{}", self.ssh_dest(), path.display())
    }
}

#[async_trait]
impl Session for SshSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(&self, cmd: &Command) -> TransportResult<ExecResult> {
        let start = Instant::now();
        let mut ssh = self.ssh_command(cmd);

        let output = match cmd.timeout_duration() {
            Some(timeout) => tokio::time::timeout(timeout, ssh.output())
                .await
                .map_err(|_| {
                    TransportError::Timeout(format!(
                        "{}: command timed out after {}s",
                        self.host,
                        timeout.as_secs()
                    ))
                })?,
            None => ssh.output().await,
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
        let output = self
            .scp_command()
            .arg(local)
            .arg(self.remote_path(remote))
            .output()
            .await
            .map_err(|e| TransportError::UploadFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(TransportError::UploadFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        Ok(())
    }

    async fn download(&self, remote: &Path, local: &Path) -> TransportResult<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransportError::DownloadFailed(e.to_string()))?;
        }

        let output = self
            .scp_command()
            .arg(self.remote_path(remote))
            .arg(local)
            .output()
            .await
            .map_err(|e| TransportError::DownloadFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(TransportError::DownloadFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        Ok(())
    }
}
