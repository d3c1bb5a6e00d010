// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Transport over the system `ssh` binary.
//!
//! Each transport operation is a single `ssh` invocation. The client runs in
//! batch mode, so authentication must be non-interactive, i.e., through an
//! agent or an identity file. An `ssh` exit status of 255 means the client
//! itself failed, which is reported as [`TransportError::Connection`]. Any
//! other status belongs to the remote command.
//!
//! # Atomic Replacement
//!
//! File writes stream the new contents into a sibling temporary file, then
//! move it over the target with `mv -f`. A write that gets interrupted leaves
//! the target untouched.

use crate::transport::{
    quote_path, ExecOutput, ProcessRunner, Result, Transport, TransportError,
};

use std::{
    path::{Path, PathBuf},
    process::Output,
    time::Duration,
};
use tracing::{debug, instrument};

const SSH_FAILURE: i32 = 255;
const TMP_SUFFIX: &str = ".oxideploy-tmp";

/// Connection settings for [`SshTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    /// Host name or address of managed host.
    pub host: String,

    /// Login user, or `None` to let ssh decide.
    pub user: Option<String>,

    /// Port of ssh daemon, or `None` for default.
    pub port: Option<u16>,

    /// Private key to authenticate with.
    pub identity_file: Option<PathBuf>,

    /// Time limit for each operation.
    pub timeout: Duration,
}

impl SshOptions {
    /// Construct connection settings with defaults for given host.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
            timeout: Duration::from_secs(60),
        }
    }

    /// Destination argument in `user@host` form.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    fn client_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-o".into(), "BatchMode=yes".into()];
        if let Some(port) = self.port {
            args.push("-p".into());
            args.push(port.to_string());
        }
        if let Some(identity_file) = &self.identity_file {
            args.push("-i".into());
            args.push(identity_file.to_string_lossy().into_owned());
        }
        args.push(self.destination());

        args
    }
}

/// Transport that runs every operation through `ssh`.
#[derive(Debug)]
pub struct SshTransport {
    destination: String,
    client_args: Vec<String>,
    runner: ProcessRunner,
}

impl SshTransport {
    /// Construct new ssh transport.
    ///
    /// No connection is made until the first operation.
    ///
    /// # Errors
    ///
    /// - Return [`TransportError::Runtime`] if process supervision cannot be
    ///   set up.
    pub fn new(options: SshOptions) -> Result<Self> {
        Ok(Self {
            destination: options.destination(),
            client_args: options.client_args(),
            runner: ProcessRunner::new(options.timeout)?,
        })
    }

    /// Destination of managed host in `user@host` form.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    fn ssh(&self, operation: &str, command: &str, input: Option<&[u8]>) -> Result<Output> {
        let mut args = self.client_args.clone();
        args.push(command.to_owned());
        let output = self.runner.run(operation, "ssh", &args, input)?;
        check_connection(&self.destination, output)
    }
}

impl Transport for SshTransport {
    #[instrument(skip(self), level = "debug")]
    fn exists(&self, path: &Path) -> Result<bool> {
        let output = self.ssh("exists", &exists_command(path), None)?;
        exists_status(path, &output)
    }

    #[instrument(skip(self), level = "debug")]
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let output = self.ssh("read", &read_command(path), None)?;
        if !output.status.success() {
            return Err(remote_error(path, output.status.code(), &output));
        }

        Ok(output.stdout)
    }

    #[instrument(skip(self, contents), level = "debug")]
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let command = write_command(path);
        debug!(
            "upload {} bytes to {} (limit {:?})",
            contents.len(),
            path.display(),
            self.runner.limit()
        );
        let output = self.ssh("write", &command, Some(contents))?;
        if !output.status.success() {
            return Err(remote_error(path, output.status.code(), &output));
        }

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn execute(&self, command: &str) -> Result<ExecOutput> {
        let output = self.ssh("execute", command, None)?;
        Ok(ExecOutput::from_process(&output))
    }
}

fn exists_command(path: &Path) -> String {
    format!("test -e {}", quote_path(path))
}

fn read_command(path: &Path) -> String {
    format!("cat {}", quote_path(path))
}

fn write_command(path: &Path) -> String {
    let target = quote_path(path);
    let tmp = quote_path(&tmp_path(path));
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(quote_path)
        .unwrap_or_else(|| "'.'".into());

    // INVARIANT: Target is only ever touched by the final rename.
    format!("mkdir -p {parent} && cat > {tmp} && mv -f {tmp} {target}")
}

fn check_connection(destination: &str, output: Output) -> Result<Output> {
    if output.status.code() == Some(SSH_FAILURE) {
        return Err(TransportError::Connection {
            destination: destination.to_owned(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(output)
}

fn exists_status(path: &Path, output: &Output) -> Result<bool> {
    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        code => Err(remote_error(path, code, output)),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    PathBuf::from(tmp)
}

fn remote_error(path: &Path, code: Option<i32>, output: &Output) -> TransportError {
    TransportError::Remote {
        path: path.to_path_buf(),
        code: code.unwrap_or(-1),
        message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    }
}
