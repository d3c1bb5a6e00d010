// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use oxideploy::{
    config::DeployDefinition,
    context::ContextBuilder,
    path::{default_definition_path, definition_base_dir},
    secret::{ChainResolver, PromptResolver},
    task::{Session, TaskRegistry},
    transport::{LocalTransport, Retrying, SshOptions, SshTransport, Transport},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
    process::exit,
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "oxideploy [options] <oxideploy-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to deployment definition.
    #[arg(short, long, global = true, value_name = "path")]
    pub definition: Option<PathBuf>,

    /// Treat local directory as the managed host instead of using ssh.
    #[arg(short, long, global = true, value_name = "root")]
    pub local: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let definition = match self.definition {
            Some(path) => path,
            None => default_definition_path()?,
        };

        match self.command {
            Command::Init(opts) => run_init(opts, &definition),
            Command::Tasks => run_tasks(),
            Command::Run(opts) => run_run(opts, &definition, self.local.as_deref()),
            Command::Exec(opts) => run_exec(opts, &definition, self.local.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Write skeleton deployment definition.
    #[command(override_usage = "oxideploy init [options]")]
    Init(InitOptions),

    /// List available tasks.
    #[command(override_usage = "oxideploy tasks")]
    Tasks,

    /// Run tasks in order against managed host.
    #[command(override_usage = "oxideploy run [options] <task>...")]
    Run(RunOptions),

    /// Run shell command on managed host.
    #[command(override_usage = "oxideploy exec [options] <command>")]
    Exec(ExecOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    /// Host name or address of managed host.
    #[arg(long, value_name = "host")]
    pub host: Option<String>,

    /// Login user on managed host.
    #[arg(short, long, value_name = "user")]
    pub user: Option<String>,

    /// Name of project to deploy.
    #[arg(short, long, value_name = "project")]
    pub project: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RunOptions {
    /// Names of tasks to run.
    #[arg(required = true, value_name = "task")]
    pub tasks: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ExecOptions {
    /// Shell command to run, words are joined by spaces.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        num_args = 1..,
        value_name = "command"
    )]
    pub command: Vec<String>,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn run_init(opts: InitOptions, path: &Path) -> Result<()> {
    if path.exists() {
        bail!("deployment definition {:?} already exists", path.display());
    }

    let definition = DeployDefinition::skeleton(
        opts.host.unwrap_or_else(|| "<put managed host here>".into()),
        opts.user.unwrap_or_else(|| "<put login user here>".into()),
        opts.project.unwrap_or_else(|| "<put project name here>".into()),
    );

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        mkdirp::mkdirp(parent)
            .with_context(|| format!("failed to create {:?}", parent.display()))?;
    }
    write(path, definition.to_string())
        .with_context(|| format!("failed to write {:?}", path.display()))?;
    info!("wrote deployment definition to {}", path.display());

    Ok(())
}

fn run_tasks() -> Result<()> {
    let registry = TaskRegistry::<Box<dyn Transport>>::standard();
    for task in registry.iter() {
        println!("{:<14}{}", task.name(), task.description());
    }

    Ok(())
}

fn run_run(opts: RunOptions, path: &Path, local: Option<&Path>) -> Result<()> {
    let definition = load_definition(path)?;
    let transport = open_transport(&definition, local)?;
    let context = ContextBuilder::new(&definition).build(&transport)?;

    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
    bar.enable_steady_tick(Duration::from_millis(100));
    let resolver = ChainResolver::new(PromptResolver::new().with_progress_bar(bar.clone()));

    let mut session = Session::new(definition, context, transport, Box::new(resolver))
        .with_progress_bar(bar.clone());
    let result = TaskRegistry::standard().run(opts.tasks.as_slice(), &mut session);
    bar.finish_and_clear();

    Ok(result?)
}

fn run_exec(opts: ExecOptions, path: &Path, local: Option<&Path>) -> Result<()> {
    let definition = load_definition(path)?;
    let transport = open_transport(&definition, local)?;

    let command = opts.command.join(" ");
    let output = transport.execute(&command)?;
    if !output.output.is_empty() {
        println!("{}", output.output);
    }
    if !output.success() {
        bail!("command {command:?} exited with status {}", output.code);
    }

    Ok(())
}

fn load_definition(path: &Path) -> Result<DeployDefinition> {
    let data = read_to_string(path)
        .with_context(|| format!("failed to read deployment definition {:?}", path.display()))?;
    let definition = data
        .parse::<DeployDefinition>()
        .with_context(|| format!("invalid deployment definition {:?}", path.display()))?;

    Ok(definition.with_base_dir(definition_base_dir(path)))
}

fn open_transport(definition: &DeployDefinition, local: Option<&Path>) -> Result<Box<dyn Transport>> {
    let settings = &definition.settings;
    if let Some(root) = local {
        info!("using {} as managed host", root.display());
        return Ok(Box::new(LocalTransport::new(root, settings.timeout())?));
    }

    let mut options = SshOptions::new(&settings.host);
    options.user = Some(settings.user.clone());
    options.port = settings.port;
    options.identity_file = settings.identity_file.clone();
    options.timeout = settings.timeout();

    let transport = SshTransport::new(options)?;
    info!("using {} as managed host", transport.destination());

    Ok(Box::new(Retrying::new(transport, settings.retry.to_policy())))
}
