// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Requirements watch.
//!
//! Decide whether packages of a project need to be reinstalled after its code
//! was updated on the managed host, by comparing the requirements file before
//! and after the update.
//!
//! # Unpinned Requirements
//!
//! A requirement without a version constraint can resolve to a newer release
//! even when the file itself did not change. Such requirements force a
//! reinstall every time. A line counts as unpinned when it is either:
//!
//! - An editable requirement (`-e`) without an `@` revision.
//! - A plain requirement with none of `>`, `=`, or `<` in it.

use crate::transport::{Result, Transport};

use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Decide whether requirements need to be reinstalled.
///
/// Returns false if nothing was known before the update, because there is
/// nothing to compare against.
pub fn requirements_changed(old: &str, new: &str) -> bool {
    if old.trim().is_empty() {
        return false;
    }

    if old != new {
        return true;
    }

    new.lines().any(is_unpinned)
}

fn is_unpinned(line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return false;
    }

    if let Some(editable) = line.strip_prefix("-e") {
        return !editable.contains('@');
    }

    !line.contains(['>', '=', '<'])
}

/// Snapshot of a requirements file on the managed host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementsWatch {
    path: PathBuf,
    before: String,
}

impl RequirementsWatch {
    /// Capture current requirements, treating a missing file as empty.
    ///
    /// # Errors
    ///
    /// - Return [`TransportError`] if managed host cannot be read.
    ///
    /// [`TransportError`]: crate::transport::TransportError
    #[instrument(skip(transport), level = "debug")]
    pub fn capture<T>(transport: &T, path: impl Into<PathBuf> + std::fmt::Debug) -> Result<Self>
    where
        T: Transport + ?Sized,
    {
        let path = path.into();
        let before = read_or_empty(transport, &path)?;
        debug!("captured {} requirement lines", before.lines().count());

        Ok(Self { path, before })
    }

    /// Path of watched requirements file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Requirements as captured.
    pub fn before(&self) -> &str {
        &self.before
    }

    /// Re-read requirements and decide whether to reinstall.
    ///
    /// # Errors
    ///
    /// - Return [`TransportError`] if managed host cannot be read.
    ///
    /// [`TransportError`]: crate::transport::TransportError
    pub fn finish<T>(self, transport: &T) -> Result<bool>
    where
        T: Transport + ?Sized,
    {
        let after = read_or_empty(transport, &self.path)?;
        let changed = requirements_changed(&self.before, &after);
        info!(
            "requirements at {} {}",
            self.path.display(),
            if changed { "need install" } else { "unchanged" }
        );

        Ok(changed)
    }
}

fn read_or_empty<T>(transport: &T, path: &Path) -> Result<String>
where
    T: Transport + ?Sized,
{
    if !transport.exists(path)? {
        return Ok(String::new());
    }

    Ok(String::from_utf8_lossy(&transport.read(path)?).into_owned())
}
