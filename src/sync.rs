// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration sync engine.
//!
//! Keeps configuration files on a managed host in line with their local
//! templates. Syncing a [`TemplateDescriptor`] goes through the following
//! steps:
//!
//! 1. Read local template body.
//! 2. Resolve any secret placeholders that are still unknown.
//! 3. Render body, remote path, and reload command.
//! 4. Read current remote content, treating a missing file as empty.
//! 5. Compare both sides after [`normalize`].
//! 6. Upload rendered body only if the two sides differ.
//! 7. Run reload command only if an upload happened.
//!
//! # Reload Guarantee
//!
//! A reload command runs at most once per sync, and only after its upload
//! succeeded. A failed reload is reported through [`ReloadStatus::Failed`]
//! but never undoes the upload, because the new configuration is already in
//! place. The operator has to step in manually.
//!
//! # Batches
//!
//! [`SyncEngine::sync_batch`] processes descriptors one after another. No
//! transaction spans a batch, so a failure never rolls back earlier
//! descriptors. Whether a failure stops the rest of the batch is decided by
//! [`BatchPolicy`].

use crate::{
    config::TemplateDescriptor,
    context::EnvContext,
    secret::SecretResolver,
    template::{normalize, RenderError},
    transport::{Transport, TransportError},
};

use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::{
    fs::read_to_string,
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Sync engine over a transport.
#[derive(Debug)]
pub struct SyncEngine<T>
where
    T: Transport,
{
    transport: T,
}

impl<T> SyncEngine<T>
where
    T: Transport,
{
    /// Construct new sync engine.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Access underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Render template descriptor without touching the managed host.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Template`] if local template cannot be read.
    /// - Return [`SyncError::Render`] if any placeholder stays unresolved.
    #[instrument(skip_all, fields(template = %descriptor.name), level = "debug")]
    pub fn render<R>(
        &self,
        descriptor: &TemplateDescriptor,
        context: &mut EnvContext,
        resolver: &mut R,
    ) -> Result<Rendered>
    where
        R: SecretResolver + ?Sized,
    {
        let body = read_to_string(&descriptor.local_path).map_err(|source| {
            SyncError::Template {
                name: descriptor.name.clone(),
                path: descriptor.local_path.clone(),
                source,
            }
        })?;

        let render_error = |source| SyncError::Render {
            name: descriptor.name.clone(),
            source,
        };

        for part in [Some(&body), Some(&descriptor.remote_path), descriptor.reload_command.as_ref()]
            .into_iter()
            .flatten()
        {
            context.resolve_secrets(part, resolver).map_err(render_error)?;
        }

        let content = context.render(&body).map_err(render_error)?;
        let remote_path = PathBuf::from(
            context
                .render(&descriptor.remote_path)
                .map_err(render_error)?,
        );
        let reload_command = descriptor
            .reload_command
            .as_deref()
            .map(|command| context.render(command))
            .transpose()
            .map_err(render_error)?;

        Ok(Rendered {
            name: descriptor.name.clone(),
            content,
            remote_path,
            reload_command,
        })
    }

    /// Determine whether syncing would upload, without writing anything.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Template`] if local template cannot be read.
    /// - Return [`SyncError::Render`] if any placeholder stays unresolved.
    /// - Return [`SyncError::Transport`] if remote content cannot be read.
    pub fn plan<R>(
        &self,
        descriptor: &TemplateDescriptor,
        context: &mut EnvContext,
        resolver: &mut R,
    ) -> Result<Plan>
    where
        R: SecretResolver + ?Sized,
    {
        let rendered = self.render(descriptor, context, resolver)?;
        let current = self.fetch_current(&rendered)?;
        let needs_upload = normalize(&current) != normalize(&rendered.content);

        Ok(Plan {
            rendered,
            current,
            needs_upload,
        })
    }

    /// Sync template descriptor onto managed host.
    ///
    /// Uploads only if rendered content differs from deployed content, and
    /// reloads only if an upload happened.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Template`] if local template cannot be read.
    /// - Return [`SyncError::Render`] if any placeholder stays unresolved.
    /// - Return [`SyncError::Transport`] if remote content cannot be read or
    ///   written.
    #[instrument(skip_all, fields(template = %descriptor.name), level = "debug")]
    pub fn sync<R>(
        &self,
        descriptor: &TemplateDescriptor,
        context: &mut EnvContext,
        resolver: &mut R,
    ) -> Result<SyncOutcome>
    where
        R: SecretResolver + ?Sized,
    {
        let plan = self.plan(descriptor, context, resolver)?;
        let Plan {
            rendered,
            needs_upload,
            ..
        } = plan;

        if !needs_upload {
            debug!("{} is up to date", rendered.remote_path.display());
            return Ok(SyncOutcome {
                name: rendered.name,
                remote_path: rendered.remote_path,
                uploaded: false,
                reload: ReloadStatus::NotRun,
            });
        }

        self.transport
            .write(&rendered.remote_path, rendered.content.as_bytes())
            .map_err(|source| SyncError::Transport {
                name: rendered.name.clone(),
                source,
            })?;
        info!("uploaded {}", rendered.remote_path.display());

        let reload = match &rendered.reload_command {
            Some(command) => self.reload(command),
            None => ReloadStatus::NotRun,
        };

        Ok(SyncOutcome {
            name: rendered.name,
            remote_path: rendered.remote_path,
            uploaded: true,
            reload,
        })
    }

    /// Sync several template descriptors in order.
    ///
    /// Never fails as a whole. The outcome of every descriptor is recorded in
    /// the returned [`BatchReport`].
    pub fn sync_batch<'a, R>(
        &self,
        descriptors: impl IntoIterator<Item = &'a TemplateDescriptor>,
        context: &mut EnvContext,
        resolver: &mut R,
        policy: BatchPolicy,
    ) -> BatchReport
    where
        R: SecretResolver + ?Sized,
    {
        self.sync_batch_observed(descriptors, context, resolver, policy, |_| {})
    }

    /// Sync several template descriptors in order, announcing each one.
    ///
    /// Calls `observe` with the name of each descriptor right before it gets
    /// synced.
    pub fn sync_batch_observed<'a, R, O>(
        &self,
        descriptors: impl IntoIterator<Item = &'a TemplateDescriptor>,
        context: &mut EnvContext,
        resolver: &mut R,
        policy: BatchPolicy,
        mut observe: O,
    ) -> BatchReport
    where
        R: SecretResolver + ?Sized,
        O: FnMut(&str),
    {
        let mut report = BatchReport::default();
        let mut aborted = false;

        for descriptor in descriptors {
            if aborted {
                report.push(&descriptor.name, BatchEntry::Skipped);
                continue;
            }

            observe(&descriptor.name);
            match self.sync(descriptor, context, resolver) {
                Ok(outcome) => report.push(&descriptor.name, BatchEntry::Synced(outcome)),
                Err(error) => {
                    warn!("{error}");
                    if policy.on(&error) == OnError::Abort {
                        warn!("abort batch sync after {:?}", descriptor.name);
                        aborted = true;
                    }
                    report.push(&descriptor.name, BatchEntry::Failed(error));
                }
            }
        }

        report
    }

    fn fetch_current(&self, rendered: &Rendered) -> Result<String> {
        let transport_error = |source| SyncError::Transport {
            name: rendered.name.clone(),
            source,
        };

        // INVARIANT: Absent remote file counts as empty content.
        if !self
            .transport
            .exists(&rendered.remote_path)
            .map_err(transport_error)?
        {
            return Ok(String::new());
        }

        let bytes = self
            .transport
            .read(&rendered.remote_path)
            .map_err(transport_error)?;

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn reload(&self, command: &str) -> ReloadStatus {
        info!("reload: {command}");
        match self.transport.execute(command) {
            Ok(output) if output.success() => ReloadStatus::Succeeded,
            Ok(output) => {
                let error = ReloadError::Failed {
                    command: command.to_owned(),
                    code: output.code,
                    output: output.output,
                };
                warn!("{error}; configuration stays uploaded");
                ReloadStatus::Failed(error)
            }
            Err(source) => {
                let error = ReloadError::Transport {
                    command: command.to_owned(),
                    source,
                };
                warn!("{error}; configuration stays uploaded");
                ReloadStatus::Failed(error)
            }
        }
    }
}

/// Template descriptor rendered with an environment context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// Name of descriptor.
    pub name: String,

    /// Rendered template body.
    pub content: String,

    /// Rendered destination on managed host.
    pub remote_path: PathBuf,

    /// Rendered reload command.
    pub reload_command: Option<String>,
}

/// Preview of a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Rendered descriptor.
    pub rendered: Rendered,

    /// Content currently deployed, empty if missing.
    pub current: String,

    /// Whether syncing would upload.
    pub needs_upload: bool,
}

impl Plan {
    /// Unified diff from deployed content to rendered content.
    pub fn diff(&self) -> String {
        let path = self.rendered.remote_path.display().to_string();
        TextDiff::from_lines(self.current.as_str(), self.rendered.content.as_str())
            .unified_diff()
            .context_radius(3)
            .header(&format!("remote:{path}"), &format!("rendered:{path}"))
            .to_string()
    }
}

/// Result of syncing one template descriptor.
#[derive(Debug)]
pub struct SyncOutcome {
    /// Name of descriptor.
    pub name: String,

    /// Rendered destination on managed host.
    pub remote_path: PathBuf,

    /// Whether new content was uploaded.
    pub uploaded: bool,

    /// What happened with the reload command.
    pub reload: ReloadStatus,
}

impl SyncOutcome {
    /// Check if reload command ran successfully.
    pub fn reloaded(&self) -> bool {
        matches!(self.reload, ReloadStatus::Succeeded)
    }
}

/// Status of reload command after a sync.
#[derive(Debug)]
pub enum ReloadStatus {
    /// Nothing was uploaded, or no reload command is configured.
    NotRun,

    /// Reload command ran successfully.
    Succeeded,

    /// Reload command failed. Upload stays in place.
    Failed(ReloadError),
}

/// What to do with the rest of a batch after a failure.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Keep syncing remaining descriptors.
    #[default]
    Continue,

    /// Skip remaining descriptors.
    Abort,
}

/// Failure handling of batch syncs.
///
/// Render failures (including unreadable local templates) and transport
/// failures are handled separately. Reload failures never stop a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchPolicy {
    /// Handling of render failures. Default: continue.
    pub on_render_error: OnError,

    /// Handling of transport failures. Default: abort.
    pub on_transport_error: OnError,
}

impl BatchPolicy {
    /// Policy that keeps going after any failure.
    pub fn keep_going() -> Self {
        Self {
            on_render_error: OnError::Continue,
            on_transport_error: OnError::Continue,
        }
    }

    /// Policy that stops at the first failure.
    pub fn fail_fast() -> Self {
        Self {
            on_render_error: OnError::Abort,
            on_transport_error: OnError::Abort,
        }
    }

    fn on(&self, error: &SyncError) -> OnError {
        match error {
            SyncError::Template { .. } | SyncError::Render { .. } => self.on_render_error,
            SyncError::Transport { .. } => self.on_transport_error,
        }
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            on_render_error: OnError::Continue,
            on_transport_error: OnError::Abort,
        }
    }
}

/// Outcome of one descriptor in a batch.
#[derive(Debug)]
pub enum BatchEntry {
    /// Descriptor was synced.
    Synced(SyncOutcome),

    /// Descriptor failed to sync.
    Failed(SyncError),

    /// Descriptor was not attempted, because the batch was aborted.
    Skipped,
}

/// Outcomes of a batch sync in descriptor order.
#[derive(Debug, Default)]
pub struct BatchReport {
    entries: Vec<(String, BatchEntry)>,
}

impl BatchReport {
    fn push(&mut self, name: &str, entry: BatchEntry) {
        self.entries.push((name.to_owned(), entry));
    }

    /// Iterate over descriptor names and their outcomes.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &BatchEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    /// Lookup outcome of descriptor by name.
    pub fn entry(&self, name: &str) -> Option<&BatchEntry> {
        self.entries()
            .find(|(entry_name, _)| *entry_name == name)
            .map(|(_, entry)| entry)
    }

    /// Names of descriptors whose content was uploaded.
    pub fn uploaded(&self) -> Vec<&str> {
        self.entries()
            .filter(|(_, entry)| matches!(entry, BatchEntry::Synced(outcome) if outcome.uploaded))
            .map(|(name, _)| name)
            .collect()
    }

    /// Descriptors that failed to sync.
    pub fn failures(&self) -> Vec<(&str, &SyncError)> {
        self.entries()
            .filter_map(|(name, entry)| match entry {
                BatchEntry::Failed(error) => Some((name, error)),
                _ => None,
            })
            .collect()
    }

    /// Descriptors whose reload command failed after upload.
    pub fn reload_failures(&self) -> Vec<(&str, &ReloadError)> {
        self.entries()
            .filter_map(|(name, entry)| match entry {
                BatchEntry::Synced(SyncOutcome {
                    reload: ReloadStatus::Failed(error),
                    ..
                }) => Some((name, error)),
                _ => None,
            })
            .collect()
    }

    /// Names of descriptors skipped after an abort.
    pub fn skipped(&self) -> Vec<&str> {
        self.entries()
            .filter(|(_, entry)| matches!(entry, BatchEntry::Skipped))
            .map(|(name, _)| name)
            .collect()
    }

    /// Check if every descriptor synced without failure.
    ///
    /// Reload failures do not count against success.
    pub fn is_success(&self) -> bool {
        self.entries()
            .all(|(_, entry)| matches!(entry, BatchEntry::Synced(_)))
    }
}

/// Reload command failure types.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    /// Reload command exited unsuccessfully.
    #[error("reload command {command:?} exited with status {code}: {output}")]
    Failed {
        command: String,
        code: i32,
        output: String,
    },

    /// Reload command could not be run.
    #[error("reload command {command:?} could not be run")]
    Transport {
        command: String,
        #[source]
        source: TransportError,
    },
}

/// Sync failure types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Local template body cannot be read.
    #[error("failed to read template {name:?} at {:?}", path.display())]
    Template {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Template cannot be rendered.
    #[error("failed to render template {name:?}: {source}")]
    Render {
        name: String,
        #[source]
        source: RenderError,
    },

    /// Managed host cannot be read or written.
    #[error("failed to sync template {name:?}: {source}")]
    Transport {
        name: String,
        #[source]
        source: TransportError,
    },
}

impl SyncError {
    /// Name of descriptor that failed.
    pub fn name(&self) -> &str {
        match self {
            Self::Template { name, .. } | Self::Render { name, .. } | Self::Transport { name, .. } => {
                name
            }
        }
    }

    /// Local path of failing template, if failure was local.
    pub fn template_path(&self) -> Option<&Path> {
        match self {
            Self::Template { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = SyncError> = std::result::Result<T, E>;
