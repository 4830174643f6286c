//! Remote shell and file transfer abstractions.
//!
//! Everything xcfleet does on a host, whether a remote Mac or the coordinator
//! itself, goes through a [`Session`]: run a shell command, upload a file,
//! download a file. Sessions are created by a [`Transport`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Transport                             │
//! │  (opens sessions to hosts)                                  │
//! │                                                              │
//! │  connect(NodeConfig) ──────► Session                        │
//! └────────────────────────────────┼────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Session                              │
//! │  (one host, owned by exactly one task)                      │
//! │                                                              │
//! │  exec(Command) ───► ExecResult                              │
//! │  upload(local, remote)                                      │
//! │  download(remote, local)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Transports
//!
//! | Transport | Module | Description |
//! |-----------|--------|-------------|
//! | SSH | [`ssh`] | System `ssh`/`scp` against a remote host |
//! | Local | [`local`] | Child processes on the coordinator host |
//!
//! # Error Handling
//!
//! All operations return [`TransportResult<T>`]. A command that runs and
//! exits non-zero is *not* an error; inspect [`ExecResult::exit_code`].

pub mod local;
pub mod ssh;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::NodeConfig;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur while talking to a host.
///
/// - **Setup**: `Connection`, `Authentication` - the node cannot take part
/// - **Per operation**: `ExecFailed`, `UploadFailed`, `DownloadFailed`, `Timeout`
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The host could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The host rejected our credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A command could not be started or its transport broke.
    ///
    /// Note: A command that runs but returns non-zero exit code is NOT an error.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// Failed to upload a file to the host.
    #[error("Failed to upload file: {0}")]
    UploadFailed(String),

    /// Failed to download a file from the host.
    #[error("Failed to download file: {0}")]
    DownloadFailed(String),

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error during local file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-specific error not covered by other variants.
    #[error("Transport error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A command to execute in a session.
///
/// Commands are built using a fluent builder API and rendered to a single
/// shell line for execution.
///
/// # Example
///
/// ```
/// use xcfleet::transport::Command;
///
/// let cmd = Command::new("xcrun")
///     .args(["simctl", "boot", "SIM-1"])
///     .env("DEVELOPER_DIR", "/Applications/Xcode.app/Contents/Developer")
///     .timeout(60);
///
/// assert_eq!(cmd.program, "xcrun");
/// assert_eq!(cmd.to_shell_string(), "xcrun simctl boot SIM-1");
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory for command execution.
    pub working_dir: Option<String>,

    /// Environment variables exported before the command runs.
    pub env: Vec<(String, String)>,

    /// Maximum execution time in seconds.
    pub timeout_secs: Option<u64>,
}

impl Command {
    /// Creates a new command with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout_secs: None,
        }
    }

    /// Wraps a shell snippet (pipes, redirections, `;`) as `/bin/sh -c`.
    ///
    /// # Example
    ///
    /// ```
    /// use xcfleet::transport::Command;
    /// let cmd = Command::shell("ls -1 /tmp | grep xcresult");
    /// assert_eq!(cmd.to_shell_string(), "/bin/sh -c 'ls -1 /tmp | grep xcresult'");
    /// ```
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("/bin/sh").arg("-c").arg(script)
    }

    /// Adds a single argument to the command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory for command execution.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the execution timeout in seconds.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Converts the program and arguments to a shell-executable string.
    ///
    /// ```
    /// use xcfleet::transport::Command;
    /// let cmd = Command::new("echo").arg("hello world");
    /// assert_eq!(cmd.to_shell_string(), "echo 'hello world'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| shell_quote(part))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Renders the full script: exports, directory change, then the command.
    ///
    /// ```
    /// use xcfleet::transport::Command;
    /// let cmd = Command::new("make").working_dir("/srv/app").env("CI", "1");
    /// assert_eq!(cmd.to_script(), "export CI=1; cd /srv/app; make");
    /// ```
    pub fn to_script(&self) -> String {
        let mut script = String::new();
        for (key, value) in &self.env {
            script.push_str(&format!("export {}={}; ", key, shell_quote(value)));
        }
        if let Some(dir) = &self.working_dir {
            script.push_str(&format!("cd {}; ", shell_quote(dir)));
        }
        script.push_str(&self.to_shell_string());
        script
    }

    pub(crate) fn timeout_duration(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Quotes a single word for POSIX shells, leaving safe words untouched.
pub fn shell_quote(word: &str) -> String {
    shell_words::quote(word).into_owned()
}

/// Result of executing a command in a session.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code of the command. `-1` if the process was killed by a signal.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Wall-clock time the command took to execute.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A shell and file-transfer channel to one host.
///
/// A session is owned by exactly one task for its lifetime: the node
/// supervisor keeps one for deployment and each execution target opens
/// its own.
#[async_trait]
pub trait Session: Send + Sync {
    /// Returns a label for the host this session talks to.
    fn id(&self) -> &str;

    /// Executes a command and waits for it to finish.
    async fn exec(&self, cmd: &Command) -> TransportResult<ExecResult>;

    /// Copies a local file or directory to the host.
    async fn upload(&self, local: &Path, remote: &Path) -> TransportResult<()>;

    /// Copies a file or directory from the host to the local filesystem.
    ///
    /// Parent directories of `local` are created as needed.
    async fn download(&self, remote: &Path, local: &Path) -> TransportResult<()>;
}

#[async_trait]
impl<S: Session + ?Sized> Session for Arc<S> {
    fn id(&self) -> &str {
        (**self).id()
    }

    async fn exec(&self, cmd: &Command) -> TransportResult<ExecResult> {
        (**self).exec(cmd).await
    }

    async fn upload(&self, local: &Path, remote: &Path) -> TransportResult<()> {
        (**self).upload(local, remote).await
    }

    async fn download(&self, remote: &Path, local: &Path) -> TransportResult<()> {
        (**self).download(remote, local).await
    }
}

/// Factory opening [`Session`]s to configured nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The concrete session type created by this transport.
    type Session: Session + 'static;

    /// Opens and verifies a session to the given node.
    ///
    /// # Errors
    ///
    /// - `TransportError::Connection` - host unreachable
    /// - `TransportError::Authentication` - credentials rejected
    async fn connect(&self, node: &NodeConfig) -> TransportResult<Self::Session>;
}
