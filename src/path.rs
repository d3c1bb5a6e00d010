// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine where the deployment definition lives when the user does not
//! name it explicitly.

use crate::config::DEFINITION_FILE;

use std::path::{Path, PathBuf};

/// Determine default path to deployment definition.
///
/// Prefers `deploy.toml` in the current directory. Falls back to XDG Base
/// Directory path `$XDG_CONFIG_HOME/oxideploy/deploy.toml` when the former
/// does not exist. Does not check if the fallback actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if user configuration directory cannot be
///   determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_definition_path() -> Result<PathBuf> {
    let local = Path::new(DEFINITION_FILE);
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    dirs::config_dir()
        .map(|path| path.join("oxideploy").join(DEFINITION_FILE))
        .ok_or(NoWayHome)
}

/// Directory that relative template paths of a definition are resolved
/// against.
pub fn definition_base_dir(definition: &Path) -> PathBuf {
    match definition.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
