// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Environment context.
//!
//! The __environment context__ maps placeholder names to the values used for
//! rendering templates. It is built exactly once at the start of each
//! invocation by [`ContextBuilder`], and handed to every operation by
//! parameter.
//!
//! # Value Sources
//!
//! Values are layered in the following order, later layers overriding
//! earlier ones:
//!
//! 1. Values derived from `[settings]`, e.g., `proj_path`.
//! 2. Entries of `[vars]`.
//! 3. Entries of `[remote_vars]`, read from files on the managed host.
//!
//! # Secrets
//!
//! Keys listed in `settings.secrets` that have no value yet are resolved on
//! first use, and cached for the rest of the invocation. This is the only way
//! a context changes after construction, and it never overwrites a value.

use crate::{
    config::DeployDefinition,
    secret::SecretResolver,
    template::{self, RenderError},
    transport::{Transport, TransportError},
};

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};
use tracing::{debug, info, instrument};

/// Resolved placeholder values for one invocation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvContext {
    values: BTreeMap<String, String>,
    secrets: BTreeSet<String>,
}

impl EnvContext {
    /// Construct context from plain values.
    pub fn new(values: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            secrets: BTreeSet::new(),
        }
    }

    /// Declare keys that are resolved lazily as secrets.
    pub fn with_secrets(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.secrets.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Lookup value of key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Check if key has a value.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Check if key is declared as secret.
    pub fn is_secret(&self, key: &str) -> bool {
        self.secrets.contains(key)
    }

    /// Iterate over all keys that currently have a value.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Render template body with context values.
    ///
    /// # Errors
    ///
    /// - Return [`RenderError::Unresolved`] if a placeholder has no value.
    pub fn render(&self, body: &str) -> template::Result<String> {
        template::render(body, |key| self.get(key).map(ToOwned::to_owned))
    }

    /// Resolve secrets referenced by template body that are still unknown.
    ///
    /// Each missing secret is asked of the resolver once, then cached.
    ///
    /// # Errors
    ///
    /// - Return [`RenderError::Secret`] if resolver fails.
    #[instrument(skip(self, body, resolver), level = "debug")]
    pub fn resolve_secrets<R>(&mut self, body: &str, resolver: &mut R) -> template::Result<()>
    where
        R: SecretResolver + ?Sized,
    {
        for key in template::placeholders(body) {
            if !self.is_secret(&key) || self.contains(&key) {
                continue;
            }

            let value = resolver.resolve(&key).map_err(|err| RenderError::Secret {
                key: key.clone(),
                message: err.to_string(),
            })?;
            debug!("cache secret {key:?}");
            self.values.insert(key, value);
        }

        Ok(())
    }
}

/// Build environment context from a deployment definition.
#[derive(Debug, Clone)]
pub struct ContextBuilder<'def> {
    definition: &'def DeployDefinition,
}

impl<'def> ContextBuilder<'def> {
    /// Construct new context builder.
    pub fn new(definition: &'def DeployDefinition) -> Self {
        Self { definition }
    }

    /// Values derived from deployment settings alone.
    pub fn derived(&self) -> BTreeMap<String, String> {
        let settings = &self.definition.settings;
        let home = settings
            .home
            .clone()
            .unwrap_or_else(|| format!("/home/{}", settings.user));
        let proj_path = settings
            .proj_path
            .clone()
            .unwrap_or_else(|| format!("{home}/webapps/{}", settings.project));
        let venv_home = settings
            .venv_home
            .clone()
            .unwrap_or_else(|| format!("{home}/.virtualenvs"));
        let venv_path = format!("{venv_home}/{}", settings.project);

        let mut values = BTreeMap::from([
            ("host".to_owned(), settings.host.clone()),
            ("user".to_owned(), settings.user.clone()),
            ("proj_name".to_owned(), settings.project.clone()),
            ("home".to_owned(), home),
            ("venv_home".to_owned(), venv_home),
            ("venv_path".to_owned(), venv_path),
        ]);
        if let Some(requirements) = &settings.requirements {
            values.insert(
                "reqs_path".to_owned(),
                format!("{proj_path}/{requirements}"),
            );
        }
        values.insert("proj_path".to_owned(), proj_path);

        values
    }

    /// Build context without consulting the managed host.
    ///
    /// # Errors
    ///
    /// - Return [`ContextError::RemoteVarsRequired`] if the definition lists
    ///   remote variables.
    pub fn build_offline(&self) -> Result<EnvContext> {
        if let Some(key) = self.definition.remote_vars.keys().next() {
            return Err(ContextError::RemoteVarsRequired { key: key.clone() });
        }

        Ok(self.layered())
    }

    /// Build context, reading remote variables through transport.
    ///
    /// # Errors
    ///
    /// - Return [`ContextError::Render`] if a remote variable path cannot be
    ///   rendered.
    /// - Return [`ContextError::MissingRemoteValue`] if a remote variable file
    ///   does not exist.
    /// - Return [`ContextError::Transport`] if the managed host cannot be
    ///   read.
    #[instrument(skip(self, transport), level = "debug")]
    pub fn build<T>(&self, transport: &T) -> Result<EnvContext>
    where
        T: Transport + ?Sized,
    {
        let mut context = self.layered();

        for (key, path) in &self.definition.remote_vars {
            let path = PathBuf::from(context.render(path).map_err(|source| {
                ContextError::Render {
                    key: key.clone(),
                    source,
                }
            })?);

            if !transport.exists(&path)? {
                return Err(ContextError::MissingRemoteValue {
                    key: key.clone(),
                    path,
                });
            }

            let value = String::from_utf8_lossy(&transport.read(&path)?)
                .trim()
                .to_owned();
            info!("resolved {key:?} from {}", path.display());
            context.values.insert(key.clone(), value);
        }

        Ok(context)
    }

    fn layered(&self) -> EnvContext {
        let mut values = self.derived();
        for (key, value) in &self.definition.vars {
            if values.insert(key.clone(), value.clone()).is_some() {
                debug!("variable {key:?} overrides derived value");
            }
        }

        EnvContext {
            values,
            secrets: self.definition.settings.secrets.iter().cloned().collect(),
        }
    }
}

/// Environment context error types.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Remote variable path has unresolved placeholders.
    #[error("failed to render path of remote variable {key:?}")]
    Render {
        key: String,
        #[source]
        source: RenderError,
    },

    /// Remote variable file does not exist on managed host.
    #[error("remote variable {key:?} expects {:?} to exist on managed host", path.display())]
    MissingRemoteValue { key: String, path: PathBuf },

    /// Remote variables need a transport to be resolved.
    #[error("remote variable {key:?} requires access to managed host")]
    RemoteVarsRequired { key: String },

    /// Managed host cannot be read.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Friendly result alias :3
pub type Result<T, E = ContextError> = std::result::Result<T, E>;
