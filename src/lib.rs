// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Keep configuration files on a managed host in sync with local templates.
//!
//! Templates are rendered with an [environment context], compared against
//! what is currently deployed, and uploaded only when they differ. A reload
//! command attached to a template runs only after its upload.
//!
//! [environment context]: context::EnvContext

pub mod config;
pub mod context;
pub mod path;
pub mod requirements;
pub mod secret;
pub mod sync;
pub mod task;
pub mod template;
pub mod transport;
