// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Transport onto the local file system.
//!
//! Remote paths are mapped underneath a root directory, e.g., with root
//! `/tmp/stage` the remote path `/home/alice/etc/blog.conf` lands at
//! `/tmp/stage/home/alice/etc/blog.conf`. Commands run through `sh -c` with
//! the root as their working directory.

use crate::transport::{ExecOutput, ProcessRunner, Result, Transport, TransportError};

use std::{
    fs::read,
    io::Write,
    path::{Component, Path, PathBuf},
    time::Duration,
};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

/// Transport that treats a local directory as the managed host.
#[derive(Debug)]
pub struct LocalTransport {
    root: PathBuf,
    runner: ProcessRunner,
}

impl LocalTransport {
    /// Construct new local transport rooted at target directory.
    ///
    /// # Errors
    ///
    /// - Return [`TransportError::Runtime`] if process supervision cannot be
    ///   set up.
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            runner: ProcessRunner::new(timeout)?,
        })
    }

    /// Root directory standing in for the managed host.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map remote path to its location underneath the root.
    ///
    /// # Errors
    ///
    /// - Return [`TransportError::OutsideRoot`] if path has a `..` component.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let mut relative = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::ParentDir => {
                    return Err(TransportError::OutsideRoot {
                        path: path.to_path_buf(),
                        root: self.root.clone(),
                    })
                }
                Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            }
        }

        Ok(self.root.join(relative))
    }
}

impl Transport for LocalTransport {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.resolve(path)?.exists())
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let local = self.resolve(path)?;
        read(&local).map_err(|source| TransportError::Io {
            path: local,
            source,
        })
    }

    #[instrument(skip(self, contents), level = "debug")]
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let local = self.resolve(path)?;
        let parent = local
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let io_error = |source: std::io::Error| TransportError::Io {
            path: local.clone(),
            source,
        };

        mkdirp::mkdirp(&parent).map_err(io_error)?;

        // INVARIANT: Stage in same directory so the final rename stays atomic.
        let mut staged = NamedTempFile::new_in(&parent).map_err(io_error)?;
        staged.write_all(contents).map_err(io_error)?;
        staged.as_file().sync_all().map_err(io_error)?;
        staged.persist(&local).map_err(|err| io_error(err.error))?;
        debug!("wrote {} bytes to {}", contents.len(), local.display());

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn execute(&self, command: &str) -> Result<ExecOutput> {
        let args = vec![
            "-c".to_owned(),
            format!("cd {} && {command}", crate::transport::quote_path(&self.root)),
        ];
        let output = self.runner.run("execute", "sh", &args, None)?;

        Ok(ExecOutput::from_process(&output))
    }
}
