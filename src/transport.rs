// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote host access.
//!
//! Everything oxideploy does to a managed host goes through the [`Transport`]
//! trait: check that a path exists, read a file, replace a file, and run a
//! shell command. Two implementations ship with the crate.
//!
//! - [`SshTransport`] shells out to the system `ssh` binary.
//! - [`LocalTransport`] maps remote paths into a local directory, which is
//!   handy for dry runs and for testing.
//!
//! The [`Retrying`] decorator can wrap either of them to retry transient
//! failures.
//!
//! # Timeouts
//!
//! Remote shells can hang indefinitely. Every child process spawned by a
//! transport runs under a timer, and the child is killed once the timer
//! expires. Expiry is reported as [`TransportError::Timeout`].

pub mod local;
pub mod retry;
pub mod ssh;

pub use local::LocalTransport;
pub use retry::{RetryPolicy, Retrying};
pub use ssh::{SshOptions, SshTransport};

use std::{
    io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};
use tokio::{
    io::AsyncWriteExt,
    process::Command,
    runtime::{Builder, Runtime},
};
use tracing::{debug, instrument};

/// Access to a managed host.
pub trait Transport {
    /// Check if path exists on managed host.
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Read full contents of file on managed host.
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Replace contents of file on managed host.
    ///
    /// Implementations must never leave a partially written file at `path`.
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Run shell command on managed host.
    ///
    /// A command that runs but exits unsuccessfully is __not__ an error. The
    /// exit code is reported through [`ExecOutput`] for the caller to judge.
    fn execute(&self, command: &str) -> Result<ExecOutput>;
}

impl<T> Transport for Box<T>
where
    T: Transport + ?Sized,
{
    fn exists(&self, path: &Path) -> Result<bool> {
        (**self).exists(path)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        (**self).read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        (**self).write(path, contents)
    }

    fn execute(&self, command: &str) -> Result<ExecOutput> {
        (**self).execute(command)
    }
}

/// Result of running a shell command on the managed host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code of command, or -1 if command was killed by a signal.
    pub code: i32,

    /// Combined standard output and standard error.
    pub output: String,
}

impl ExecOutput {
    /// Check if command exited successfully.
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub(crate) fn from_process(output: &Output) -> Self {
        Self {
            code: output.status.code().unwrap_or(-1),
            output: combine_output(output),
        }
    }
}

/// Quote string for safe use as a single POSIX shell word.
pub fn shell_quote(word: impl AsRef<str>) -> String {
    format!("'{}'", word.as_ref().replace('\'', "'\\''"))
}

/// Quote path for safe use as a single POSIX shell word.
pub fn quote_path(path: &Path) -> String {
    shell_quote(path.to_string_lossy())
}

/// Child process runner with a per-operation timeout.
///
/// Owns a current-thread tokio runtime that is only used to race child
/// processes against a timer. Callers stay fully synchronous.
#[derive(Debug)]
pub(crate) struct ProcessRunner {
    runtime: Runtime,
    limit: Duration,
}

impl ProcessRunner {
    pub(crate) fn new(limit: Duration) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| TransportError::Runtime { source })?;

        Ok(Self { runtime, limit })
    }

    pub(crate) fn limit(&self) -> Duration {
        self.limit
    }

    #[instrument(skip(self, args, input), level = "debug")]
    pub(crate) fn run(
        &self,
        operation: &str,
        program: &str,
        args: &[String],
        input: Option<&[u8]>,
    ) -> Result<Output> {
        debug!("spawn {program} {args:?}");
        let future = spawn_and_wait(program, args, input);
        match self
            .runtime
            .block_on(async { tokio::time::timeout(self.limit, future).await })
        {
            Ok(result) => result.map_err(|source| TransportError::Spawn {
                program: program.to_owned(),
                source,
            }),
            Err(_) => Err(TransportError::Timeout {
                operation: operation.to_owned(),
                limit: self.limit,
            }),
        }
    }
}

async fn spawn_and_wait(
    program: &str,
    args: &[String],
    input: Option<&[u8]>,
) -> io::Result<Output> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    // INVARIANT: Feed stdin while draining output, or large inputs deadlock.
    let stdin = child.stdin.take();
    let feed = async move {
        if let (Some(bytes), Some(mut stdin)) = (input, stdin) {
            stdin.write_all(bytes).await?;
            stdin.shutdown().await?;
        }
        Ok::<_, io::Error>(())
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());

    // Child may exit before reading all of its input; its status tells why.
    match fed {
        Err(error) if error.kind() != io::ErrorKind::BrokenPipe => Err(error),
        _ => output,
    }
}

fn combine_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(output.stdout.as_slice());
    let stderr = String::from_utf8_lossy(output.stderr.as_slice());
    let mut message = String::new();
    message.push_str(&stdout);
    if !stderr.is_empty() {
        if !message.is_empty() && !message.ends_with('\n') {
            message.push('\n');
        }
        message.push_str(&stderr);
    }

    // INVARIANT: Chomp trailing newlines.
    message.trim_end_matches(['\r', '\n']).to_owned()
}

/// Transport error types.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Async runtime for process supervision cannot be built.
    #[error("failed to build process runtime")]
    Runtime {
        #[source]
        source: io::Error,
    },

    /// Child process cannot be spawned or awaited.
    #[error("failed to run {program:?}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Operation did not finish in time.
    #[error("{operation} timed out after {}s", limit.as_secs_f32())]
    Timeout { operation: String, limit: Duration },

    /// Managed host cannot be reached.
    #[error("connection to {destination} failed: {message}")]
    Connection {
        destination: String,
        message: String,
    },

    /// Remote file operation failed on managed host.
    #[error("remote operation on {:?} failed with status {code}: {message}", path.display())]
    Remote {
        path: PathBuf,
        code: i32,
        message: String,
    },

    /// Path would leave root directory of local transport.
    #[error("path {:?} leaves root {:?}", path.display(), root.display())]
    OutsideRoot { path: PathBuf, root: PathBuf },

    /// Local file operation failed.
    #[error("failed to access {:?}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// Check if failure might go away by trying again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connection { .. })
    }
}

/// Friendly result alias :3
pub type Result<T, E = TransportError> = std::result::Result<T, E>;
