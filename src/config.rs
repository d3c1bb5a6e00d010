// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the __deployment definition__ file that oxideploy
//! uses to describe one deployment target. File I/O is left to the caller to
//! figure out.
//!
//! # General Layout
//!
//! A deployment definition is composed of the following parts:
//!
//! - `[settings]`: how to reach the managed host, and where the project lives
//!   on it.
//! - `[vars]`: extra placeholder values for templates.
//! - `[remote_vars]`: placeholder values read from files on the managed host
//!   at the start of each invocation.
//! - `[deploy]`: optional shell commands used by the deployment tasks.
//! - `[[template]]`: registry of template descriptors to keep in sync.
//!
//! ```toml
//! [settings]
//! host = "web42.example.net"
//! user = "alice"
//! project = "blog"
//! secrets = ["db_pass"]
//!
//! [vars]
//! workers = "4"
//!
//! [remote_vars]
//! gunicorn_port = "%(proj_path)s/app.port"
//!
//! [[template]]
//! name = "supervisor"
//! local_path = "deploy/supervisor.conf.template"
//! remote_path = "/home/%(user)s/etc/supervisor/conf.d/%(proj_name)s.conf"
//! reload_command = "supervisorctl update gunicorn_%(proj_name)s"
//! ```

use crate::{sync::BatchPolicy, transport::RetryPolicy};

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Default name of deployment definition file.
pub const DEFINITION_FILE: &str = "deploy.toml";

/// Deployment definition layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct DeployDefinition {
    /// Settings for the deployment target.
    pub settings: DeploySettings,

    /// Extra placeholder values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,

    /// Placeholder values read from files on the managed host.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remote_vars: BTreeMap<String, String>,

    /// Commands used by deployment tasks.
    #[serde(default)]
    pub deploy: DeployCommands,

    /// Template descriptor registry.
    #[serde(default, rename = "template")]
    pub templates: Vec<TemplateDescriptor>,
}

impl DeployDefinition {
    /// Construct skeleton definition for new deployment target.
    pub fn skeleton(
        host: impl Into<String>,
        user: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        let mut definition = Self::default();
        definition.settings.host = host.into();
        definition.settings.user = user.into();
        definition.settings.project = project.into();
        definition.deploy.restart_command =
            Some("supervisorctl restart gunicorn_%(proj_name)s".into());
        definition.deploy.post_remove_command = Some("supervisorctl update".into());
        definition.templates = vec![
            TemplateDescriptor {
                name: "supervisor".into(),
                local_path: PathBuf::from("deploy/supervisor.conf.template"),
                remote_path: "/home/%(user)s/etc/supervisor/conf.d/%(proj_name)s.conf".into(),
                reload_command: Some("supervisorctl update gunicorn_%(proj_name)s".into()),
            },
            TemplateDescriptor {
                name: "gunicorn".into(),
                local_path: PathBuf::from("deploy/gunicorn.conf.py.template"),
                remote_path: "%(proj_path)s/gunicorn.conf.py".into(),
                reload_command: None,
            },
        ];

        definition
    }

    /// Resolve relative template paths against a base directory.
    ///
    /// The base directory is normally the directory that holds the
    /// definition file itself.
    pub fn with_base_dir(mut self, base: impl AsRef<Path>) -> Self {
        for template in &mut self.templates {
            if template.local_path.is_relative() {
                template.local_path = base.as_ref().join(&template.local_path);
            }
        }

        self
    }

    /// Lookup template descriptor by name.
    pub fn template(&self, name: &str) -> Option<&TemplateDescriptor> {
        self.templates.iter().find(|template| template.name == name)
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("settings.host", &self.settings.host),
            ("settings.user", &self.settings.user),
            ("settings.project", &self.settings.project),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField { field });
            }
        }

        let mut names = HashSet::new();
        for template in &self.templates {
            if !names.insert(template.name.as_str()) {
                return Err(ConfigError::DuplicateTemplate {
                    name: template.name.clone(),
                });
            }
        }

        Ok(())
    }
}

impl FromStr for DeployDefinition {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut definition: DeployDefinition = toml::from_str(data)?;

        // INVARIANT: Perform shell expansion on local paths.
        if let Some(identity_file) = &definition.settings.identity_file {
            definition.settings.identity_file = Some(expand_path(identity_file)?);
        }
        for template in &mut definition.templates {
            template.local_path = expand_path(&template.local_path)?;
        }

        definition.validate()?;

        Ok(definition)
    }
}

impl Display for DeployDefinition {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Deployment target settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct DeploySettings {
    /// Host name or address of managed host.
    pub host: String,

    /// Login user on managed host.
    pub user: String,

    /// Unique project identifier.
    pub project: String,

    /// Port of ssh daemon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Private key for ssh authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,

    /// Home directory of user on managed host. Default: `/home/<user>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,

    /// Project directory on managed host. Default: `<home>/webapps/<project>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proj_path: Option<String>,

    /// Virtualenv directory on managed host. Default: `<home>/.virtualenvs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venv_home: Option<String>,

    /// Requirements file relative to the project directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,

    /// Time limit in seconds for each remote operation.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Placeholder keys resolved lazily through a secret resolver.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,

    /// Retry settings for transient transport failures.
    #[serde(default)]
    pub retry: RetrySettings,

    /// Failure handling of batch syncs.
    #[serde(default)]
    pub batch: BatchPolicy,
}

impl DeploySettings {
    /// Time limit for each remote operation.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: String::new(),
            project: String::new(),
            port: None,
            identity_file: None,
            home: None,
            proj_path: None,
            venv_home: None,
            requirements: None,
            timeout_secs: default_timeout_secs(),
            secrets: Vec::new(),
            retry: RetrySettings::default(),
            batch: BatchPolicy::default(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    60
}

/// Retry settings for transient transport failures.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per operation, capped at three.
    pub max_attempts: u32,

    /// Delay before first retry in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound on delay between retries in milliseconds.
    pub max_delay_ms: u64,
}

impl RetrySettings {
    /// Convert into transport retry policy.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 5000,
        }
    }
}

/// Shell commands used by deployment tasks.
///
/// Every command is a template rendered with the environment context.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct DeployCommands {
    /// Bring project files up to date on managed host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_command: Option<String>,

    /// Install project requirements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_command: Option<String>,

    /// Restart application after deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_command: Option<String>,

    /// Run after remote targets have been removed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_remove_command: Option<String>,
}

/// Template descriptor.
///
/// Pairs a local template with its destination on the managed host.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct TemplateDescriptor {
    /// Unique name of descriptor.
    pub name: String,

    /// Path to local template body.
    pub local_path: PathBuf,

    /// Destination on managed host. Rendered before use.
    pub remote_path: String,

    /// Command to run after upload. Rendered before use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reload_command: Option<String>,
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())?.into_owned(),
    ))
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Required field is empty.
    #[error("field {field:?} must not be empty")]
    MissingField { field: &'static str },

    /// Two template descriptors share a name.
    #[error("template {name:?} defined more than once")]
    DuplicateTemplate { name: String },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::OnError;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("KEYS", "/home/blah/.ssh")])]
    fn deserialize_deploy_definition() -> anyhow::Result<()> {
        let result: DeployDefinition = r#"
            [settings]
            host = "web42.example.net"
            user = "alice"
            project = "blog"
            identity_file = "$KEYS/id_ed25519"
            requirements = "requirements/project.txt"
            secrets = ["db_pass"]

            [settings.batch]
            on_render_error = "abort"

            [vars]
            workers = "4"

            [remote_vars]
            gunicorn_port = "%(proj_path)s/app.port"

            [deploy]
            restart_command = "supervisorctl restart gunicorn_%(proj_name)s"

            [[template]]
            name = "supervisor"
            local_path = "deploy/supervisor.conf.template"
            remote_path = "/home/%(user)s/etc/supervisor/conf.d/%(proj_name)s.conf"
            reload_command = "supervisorctl update gunicorn_%(proj_name)s"

            [[template]]
            name = "gunicorn"
            local_path = "deploy/gunicorn.conf.py.template"
            remote_path = "%(proj_path)s/gunicorn.conf.py"
        "#
        .parse()?;

        let expect = DeployDefinition {
            settings: DeploySettings {
                host: "web42.example.net".into(),
                user: "alice".into(),
                project: "blog".into(),
                identity_file: Some(PathBuf::from("/home/blah/.ssh/id_ed25519")),
                requirements: Some("requirements/project.txt".into()),
                secrets: vec!["db_pass".into()],
                batch: BatchPolicy {
                    on_render_error: OnError::Abort,
                    on_transport_error: OnError::Abort,
                },
                ..DeploySettings::default()
            },
            vars: BTreeMap::from([("workers".into(), "4".into())]),
            remote_vars: BTreeMap::from([(
                "gunicorn_port".into(),
                "%(proj_path)s/app.port".into(),
            )]),
            deploy: DeployCommands {
                restart_command: Some("supervisorctl restart gunicorn_%(proj_name)s".into()),
                ..DeployCommands::default()
            },
            templates: vec![
                TemplateDescriptor {
                    name: "supervisor".into(),
                    local_path: PathBuf::from("deploy/supervisor.conf.template"),
                    remote_path: "/home/%(user)s/etc/supervisor/conf.d/%(proj_name)s.conf"
                        .into(),
                    reload_command: Some("supervisorctl update gunicorn_%(proj_name)s".into()),
                },
                TemplateDescriptor {
                    name: "gunicorn".into(),
                    local_path: PathBuf::from("deploy/gunicorn.conf.py.template"),
                    remote_path: "%(proj_path)s/gunicorn.conf.py".into(),
                    reload_command: None,
                },
            ],
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn skeleton_survives_serialization() -> anyhow::Result<()> {
        let skeleton = DeployDefinition::skeleton("web42.example.net", "alice", "blog");
        let result: DeployDefinition = skeleton.to_string().parse()?;
        assert_eq!(result, skeleton);

        Ok(())
    }

    #[test]
    fn reject_duplicate_template_names() {
        let result = r#"
            [settings]
            host = "h"
            user = "u"
            project = "p"

            [[template]]
            name = "gunicorn"
            local_path = "a"
            remote_path = "b"

            [[template]]
            name = "gunicorn"
            local_path = "c"
            remote_path = "d"
        "#
        .parse::<DeployDefinition>();
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateTemplate { name }) if name == "gunicorn"
        ));
    }

    #[test]
    fn reject_empty_project() {
        let result = r#"
            [settings]
            host = "h"
            user = "u"
            project = ""
        "#
        .parse::<DeployDefinition>();
        assert!(matches!(
            result,
            Err(ConfigError::MissingField { field: "settings.project" })
        ));
    }

    #[test]
    fn relative_template_paths_resolve_against_base() {
        let definition = DeployDefinition::skeleton("h", "u", "p").with_base_dir("/srv/blog");
        let template = definition.template("gunicorn").map(|t| t.local_path.clone());
        assert_eq!(
            template,
            Some(PathBuf::from("/srv/blog/deploy/gunicorn.conf.py.template"))
        );
    }
}
