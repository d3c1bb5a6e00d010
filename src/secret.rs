// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Secret resolution.
//!
//! Some placeholder values should never be written into a deployment
//! definition, e.g., database passwords. Such keys are declared as
//! __secrets__, and are only resolved when a template actually references
//! them. Resolution happens at most once per key for a given invocation,
//! since the resolved value is cached in the environment context.

use indicatif::ProgressBar;
use inquire::Password;
use std::env::{self, VarError};
use tracing::{debug, info, instrument};

/// Prefix of environment variables consulted by [`EnvResolver`].
pub const ENV_PREFIX: &str = "OXIDEPLOY_";

/// Resolve value of secret placeholder.
pub trait SecretResolver {
    /// Resolve secret value for target key.
    fn resolve(&mut self, key: &str) -> Result<String>;
}

impl<S> SecretResolver for Box<S>
where
    S: SecretResolver + ?Sized,
{
    fn resolve(&mut self, key: &str) -> Result<String> {
        (**self).resolve(key)
    }
}

/// Resolve secrets by prompting the operator.
///
/// Input is masked and not echoed. When a progress bar is attached, the bar
/// is suspended while the prompt is on screen.
#[derive(Debug, Default, Clone)]
pub struct PromptResolver {
    bar: Option<ProgressBar>,
}

impl PromptResolver {
    /// Construct new prompt resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend progress bar while prompting.
    pub fn with_progress_bar(mut self, bar: ProgressBar) -> Self {
        self.bar = Some(bar);
        self
    }
}

impl SecretResolver for PromptResolver {
    #[instrument(skip(self), level = "debug")]
    fn resolve(&mut self, key: &str) -> Result<String> {
        info!("secret {key:?} required");
        let message = format!("Enter value for {key}:");
        let prompt = || {
            Password::new(message.as_str())
                .without_confirmation()
                .prompt()
        };
        let answer = match &self.bar {
            Some(bar) => bar.suspend(prompt),
            None => prompt(),
        };

        answer.map_err(|err| SecretError::Prompt {
            key: key.to_owned(),
            message: err.to_string(),
        })
    }
}

/// Resolve secrets from environment variables.
///
/// Key `db_pass` is read from `OXIDEPLOY_DB_PASS`.
#[derive(Debug, Default, Clone)]
pub struct EnvResolver;

impl EnvResolver {
    /// Construct new environment resolver.
    pub fn new() -> Self {
        Self
    }

    /// Name of environment variable holding target key.
    pub fn variable(key: &str) -> String {
        format!("{ENV_PREFIX}{}", key.to_uppercase())
    }
}

impl SecretResolver for EnvResolver {
    fn resolve(&mut self, key: &str) -> Result<String> {
        let variable = Self::variable(key);
        env::var(&variable).map_err(|source| SecretError::Env {
            key: key.to_owned(),
            variable,
            source,
        })
    }
}

/// Try environment variables first, then prompt the operator.
#[derive(Debug, Default, Clone)]
pub struct ChainResolver {
    env: EnvResolver,
    prompt: PromptResolver,
}

impl ChainResolver {
    /// Construct new chained resolver.
    pub fn new(prompt: PromptResolver) -> Self {
        Self {
            env: EnvResolver::new(),
            prompt,
        }
    }
}

impl SecretResolver for ChainResolver {
    fn resolve(&mut self, key: &str) -> Result<String> {
        match self.env.resolve(key) {
            Ok(value) => Ok(value),
            Err(err) => {
                debug!("{err}; falling back to prompt");
                self.prompt.resolve(key)
            }
        }
    }
}

/// Secret resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// Environment variable holding secret is unset or invalid.
    #[error("secret {key:?} not available through ${variable}")]
    Env {
        key: String,
        variable: String,
        #[source]
        source: VarError,
    },

    /// Operator prompt failed or was cancelled.
    #[error("prompt for secret {key:?} failed: {message}")]
    Prompt { key: String, message: String },
}

/// Friendly result alias :3
pub type Result<T, E = SecretError> = std::result::Result<T, E>;
