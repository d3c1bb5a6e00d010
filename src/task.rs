// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Deployment tasks.
//!
//! A __task__ is one named deployment step, e.g., syncing every template or
//! reinstalling requirements. Tasks are registered explicitly in a
//! [`TaskRegistry`] that maps each name to its handler, and every handler
//! receives the [`Session`] of the current invocation by parameter.
//!
//! # Standard Tasks
//!
//! - `sync`: sync every template descriptor under the configured batch
//!   policy.
//! - `plan`: show what `sync` would upload without changing anything.
//! - `remove`: delete every deployed template from the managed host.
//! - `requirements`: update project, and reinstall requirements if needed.
//! - `deploy`: run `requirements`, then `sync`, then restart the project.

use crate::{
    config::DeployDefinition,
    context::EnvContext,
    requirements::RequirementsWatch,
    secret::SecretResolver,
    sync::{SyncEngine, SyncError},
    template::RenderError,
    transport::{quote_path, Transport, TransportError},
};

use indicatif::ProgressBar;
use std::{
    io::{self, stdout, Write},
    path::PathBuf,
};
use tracing::{info, instrument, warn};

/// State shared by all tasks of one invocation.
pub struct Session<T>
where
    T: Transport,
{
    definition: DeployDefinition,
    context: EnvContext,
    engine: SyncEngine<T>,
    resolver: Box<dyn SecretResolver>,
    output: Box<dyn Write>,
    bar: Option<ProgressBar>,
}

impl<T> Session<T>
where
    T: Transport,
{
    /// Construct new session writing reports to stdout.
    pub fn new(
        definition: DeployDefinition,
        context: EnvContext,
        transport: T,
        resolver: Box<dyn SecretResolver>,
    ) -> Self {
        Self {
            definition,
            context,
            engine: SyncEngine::new(transport),
            resolver,
            output: Box::new(stdout()),
            bar: None,
        }
    }

    /// Write task reports somewhere other than stdout.
    pub fn with_output(mut self, output: Box<dyn Write>) -> Self {
        self.output = output;
        self
    }

    /// Show batch progress through a progress bar.
    pub fn with_progress_bar(mut self, bar: ProgressBar) -> Self {
        self.bar = Some(bar);
        self
    }

    /// Deployment definition of this invocation.
    pub fn definition(&self) -> &DeployDefinition {
        &self.definition
    }

    /// Environment context of this invocation.
    pub fn context(&self) -> &EnvContext {
        &self.context
    }

    /// Transport to managed host.
    pub fn transport(&self) -> &T {
        self.engine.transport()
    }

    fn render(&mut self, body: &str) -> Result<String> {
        self.context
            .resolve_secrets(body, self.resolver.as_mut())?;
        Ok(self.context.render(body)?)
    }

    fn run_command(&mut self, command: &str) -> Result<String> {
        let command = self.render(command)?;
        self.execute(command)
    }

    // INVARIANT: Command must already be rendered, it is run as is.
    fn execute(&self, command: String) -> Result<String> {
        info!("run: {command}");
        let output = self.engine.transport().execute(&command)?;
        if !output.success() {
            return Err(TaskError::Command {
                command,
                code: output.code,
                output: output.output,
            });
        }

        Ok(output.output)
    }
}

/// Handler of a task.
pub type TaskFn<T> = fn(&mut Session<T>) -> Result<()>;

/// Registered task.
pub struct Task<T>
where
    T: Transport,
{
    name: &'static str,
    description: &'static str,
    handler: TaskFn<T>,
}

impl<T> Task<T>
where
    T: Transport,
{
    /// Name of task.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// One line description of task.
    pub fn description(&self) -> &'static str {
        self.description
    }
}

/// Table of tasks by name, in registration order.
pub struct TaskRegistry<T>
where
    T: Transport,
{
    tasks: Vec<Task<T>>,
}

impl<T> TaskRegistry<T>
where
    T: Transport,
{
    /// Construct empty registry.
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Construct registry with the standard deployment tasks.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("sync", "Sync all templates onto managed host", sync);
        registry.register("plan", "Show pending template changes", plan);
        registry.register("remove", "Remove deployed templates from managed host", remove);
        registry.register(
            "requirements",
            "Update project and reinstall changed requirements",
            requirements,
        );
        registry.register("deploy", "Update requirements, sync templates, and restart", deploy);
        registry
    }

    /// Register task, replacing any task with the same name.
    pub fn register(&mut self, name: &'static str, description: &'static str, handler: TaskFn<T>) {
        let task = Task {
            name,
            description,
            handler,
        };
        match self.tasks.iter_mut().find(|task| task.name == name) {
            Some(existing) => *existing = task,
            None => self.tasks.push(task),
        }
    }

    /// Lookup task by name.
    pub fn get(&self, name: &str) -> Option<&Task<T>> {
        self.tasks.iter().find(|task| task.name == name)
    }

    /// Iterate over registered tasks.
    pub fn iter(&self) -> impl Iterator<Item = &Task<T>> {
        self.tasks.iter()
    }

    /// Run tasks in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// - Return [`TaskError::Unknown`] before running anything if any name
    ///   is not registered.
    /// - Return first error of any task that fails.
    pub fn run<S>(&self, names: &[S], session: &mut Session<T>) -> Result<()>
    where
        S: AsRef<str>,
    {
        let tasks = names
            .iter()
            .map(|name| {
                self.get(name.as_ref()).ok_or_else(|| TaskError::Unknown {
                    name: name.as_ref().to_owned(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        for task in tasks {
            info!("task {}", task.name);
            (task.handler)(session)?;
        }

        Ok(())
    }
}

impl<T> Default for TaskRegistry<T>
where
    T: Transport,
{
    fn default() -> Self {
        Self::new()
    }
}

#[instrument(skip_all, level = "debug")]
fn sync<T>(session: &mut Session<T>) -> Result<()>
where
    T: Transport,
{
    let policy = session.definition.settings.batch;
    let bar = session.bar.clone();
    let report = session.engine.sync_batch_observed(
        &session.definition.templates,
        &mut session.context,
        session.resolver.as_mut(),
        policy,
        |name| {
            if let Some(bar) = &bar {
                bar.set_message(format!("sync {name}"));
            }
        },
    );

    for (name, error) in report.reload_failures() {
        warn!("{name}: {error}");
    }
    info!("{} template(s) uploaded", report.uploaded().len());

    if !report.is_success() {
        let mut failed: Vec<String> = report
            .failures()
            .into_iter()
            .map(|(name, _)| name.to_owned())
            .collect();
        failed.extend(report.skipped().into_iter().map(ToOwned::to_owned));
        return Err(TaskError::Batch { failed });
    }

    Ok(())
}

#[instrument(skip_all, level = "debug")]
fn plan<T>(session: &mut Session<T>) -> Result<()>
where
    T: Transport,
{
    for descriptor in &session.definition.templates {
        let plan = session.engine.plan(
            descriptor,
            &mut session.context,
            session.resolver.as_mut(),
        )?;

        if plan.needs_upload {
            writeln!(session.output, "{}", plan.diff())?;
        } else {
            writeln!(session.output, "{}: up to date", descriptor.name)?;
        }
    }

    Ok(())
}

#[instrument(skip_all, level = "debug")]
fn remove<T>(session: &mut Session<T>) -> Result<()>
where
    T: Transport,
{
    let remote_paths = session
        .definition
        .templates
        .clone()
        .iter()
        .map(|descriptor| session.render(&descriptor.remote_path).map(PathBuf::from))
        .collect::<Result<Vec<_>>>()?;

    for path in remote_paths {
        if !session.transport().exists(&path)? {
            continue;
        }

        session.execute(format!("rm -f -- {}", quote_path(&path)))?;
        info!("removed {}", path.display());
    }

    if let Some(command) = session.definition.deploy.post_remove_command.clone() {
        session.run_command(&command)?;
    }

    Ok(())
}

#[instrument(skip_all, level = "debug")]
fn requirements<T>(session: &mut Session<T>) -> Result<()>
where
    T: Transport,
{
    let commands = session.definition.deploy.clone();
    let Some(reqs_path) = session.context.get("reqs_path").map(PathBuf::from) else {
        info!("no requirements file configured");
        if let Some(command) = &commands.update_command {
            session.run_command(command)?;
        }
        return Ok(());
    };

    let watch = RequirementsWatch::capture(session.transport(), reqs_path)?;
    if let Some(command) = &commands.update_command {
        session.run_command(command)?;
    }

    if watch.finish(session.transport())? {
        match &commands.install_command {
            Some(command) => {
                session.run_command(command)?;
            }
            None => warn!("requirements changed, but no install command is configured"),
        }
    }

    Ok(())
}

#[instrument(skip_all, level = "debug")]
fn deploy<T>(session: &mut Session<T>) -> Result<()>
where
    T: Transport,
{
    requirements(session)?;
    sync(session)?;
    if let Some(command) = session.definition.deploy.restart_command.clone() {
        session.run_command(&command)?;
    }

    Ok(())
}

/// Task error types.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Task name is not registered.
    #[error("unknown task {name:?}")]
    Unknown { name: String },

    /// Command or path cannot be rendered.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Managed host cannot be reached.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Template descriptor cannot be synced.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Batch sync did not complete for some descriptors.
    #[error("batch sync failed for {}", failed.join(", "))]
    Batch { failed: Vec<String> },

    /// Command on managed host exited unsuccessfully.
    #[error("command {command:?} exited with status {code}: {output}")]
    Command {
        command: String,
        code: i32,
        output: String,
    },

    /// Task report cannot be written.
    #[error("failed to write task report")]
    Output(#[from] io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = TaskError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::ContextBuilder, secret::EnvResolver, transport::LocalTransport};
    use indoc::{formatdoc, indoc};
    use pretty_assertions::assert_eq;
    use std::{
        cell::RefCell,
        fs::{create_dir_all, read_to_string, write},
        path::Path,
        rc::Rc,
        time::Duration,
    };
    use tempfile::{tempdir, TempDir};

    /// Clonable in-memory report sink.
    #[derive(Clone, Default)]
    struct Sink(Rc<RefCell<Vec<u8>>>);

    impl Sink {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Local template directory plus a managed host rooted in a temporary
    /// directory. Project paths are relative, so shell commands run by the
    /// local transport see the same files as its `read` and `write`.
    struct Fixture {
        local: TempDir,
        remote: TempDir,
        sink: Sink,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let local = tempdir()?;
            create_dir_all(local.path().join("deploy"))?;
            write(
                local.path().join("deploy/workers.conf.template"),
                "workers = %(workers)s\n",
            )?;

            Ok(Self {
                local,
                remote: tempdir()?,
                sink: Sink::default(),
            })
        }

        fn session(&self, deploy: &str) -> anyhow::Result<Session<LocalTransport>> {
            let data = formatdoc! {r#"
                [settings]
                host = "web42.example.net"
                user = "alice"
                project = "blog"
                proj_path = "webapps/blog"
                requirements = "requirements.txt"

                [vars]
                workers = "4"

                [deploy]
                {deploy}

                [[template]]
                name = "workers"
                local_path = "deploy/workers.conf.template"
                remote_path = "%(proj_path)s/workers.conf"
            "#, deploy = deploy};
            let definition = data
                .parse::<DeployDefinition>()?
                .with_base_dir(self.local.path());
            let context = ContextBuilder::new(&definition).build_offline()?;
            let transport = LocalTransport::new(self.remote.path(), Duration::from_secs(5))?;

            Ok(
                Session::new(definition, context, transport, Box::new(EnvResolver::new()))
                    .with_output(Box::new(self.sink.clone())),
            )
        }

        fn remote_file(&self, path: &str) -> PathBuf {
            self.remote.path().join(path)
        }
    }

    #[test]
    fn standard_registry_lists_tasks_in_order() {
        let registry = TaskRegistry::<LocalTransport>::standard();
        let names: Vec<_> = registry.iter().map(Task::name).collect();
        assert_eq!(names, vec!["sync", "plan", "remove", "requirements", "deploy"]);
        assert!(registry.get("deploy").is_some());
        assert!(registry.get("bootstrap").is_none());
    }

    #[test]
    fn unknown_task_runs_nothing() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let mut session = fixture.session("")?;
        let registry = TaskRegistry::standard();

        let result = registry.run(&["sync", "bootstrap"], &mut session);
        assert!(matches!(result, Err(TaskError::Unknown { name }) if name == "bootstrap"));
        assert!(!fixture.remote_file("webapps/blog/workers.conf").exists());

        Ok(())
    }

    #[test]
    fn plan_then_sync() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let mut session = fixture.session("")?;
        let registry = TaskRegistry::standard();

        registry.run(&["plan"], &mut session)?;
        assert!(fixture.sink.contents().contains("+workers = 4"));

        registry.run(&["sync", "plan"], &mut session)?;
        assert_eq!(
            read_to_string(fixture.remote_file("webapps/blog/workers.conf"))?,
            "workers = 4\n"
        );
        assert!(fixture.sink.contents().ends_with("workers: up to date\n"));

        Ok(())
    }

    #[test]
    fn remove_deletes_deployed_templates() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let mut session = fixture.session(r#"post_remove_command = "touch removed.marker""#)?;
        let registry = TaskRegistry::standard();

        registry.run(&["sync", "remove"], &mut session)?;
        assert!(!fixture.remote_file("webapps/blog/workers.conf").exists());
        assert!(fixture.remote_file("removed.marker").exists());

        Ok(())
    }

    #[test]
    fn remove_uses_path_exactly_as_deployed() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let mut session = fixture.session("")?;
        session
            .definition
            .vars
            .insert("dir".into(), "logs%(literal)s".into());
        session.definition.templates[0].remote_path = "%(dir)s/workers.conf".into();
        session.context = ContextBuilder::new(session.definition()).build_offline()?;
        assert_eq!(session.context().get("dir"), Some("logs%(literal)s"));
        let registry = TaskRegistry::standard();

        registry.run(&["sync"], &mut session)?;
        assert!(fixture.remote_file("logs%(literal)s/workers.conf").exists());

        registry.run(&["remove"], &mut session)?;
        assert!(!fixture.remote_file("logs%(literal)s/workers.conf").exists());

        Ok(())
    }

    #[test]
    fn failing_command_stops_deploy() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let mut session = fixture.session(r#"update_command = "exit 3""#)?;
        let registry = TaskRegistry::standard();

        let result = registry.run(&["deploy"], &mut session);
        assert!(matches!(result, Err(TaskError::Command { code: 3, .. })));
        assert!(!fixture.remote_file("webapps/blog/workers.conf").exists());

        Ok(())
    }

    #[test]
    fn requirements_install_runs_only_on_change() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let mut session = fixture.session(indoc! {r#"
            update_command = "echo 'Django==5.0' > %(reqs_path)s"
            install_command = "touch installed.marker"
        "#})?;
        let reqs = Path::new("webapps/blog/requirements.txt");
        let registry = TaskRegistry::standard();

        session.transport().write(reqs, b"Django==5.0\n")?;
        registry.run(&["requirements"], &mut session)?;
        assert!(!fixture.remote_file("installed.marker").exists());

        session.transport().write(reqs, b"Django==4.2\n")?;
        registry.run(&["requirements"], &mut session)?;
        assert!(fixture.remote_file("installed.marker").exists());
        assert_eq!(read_to_string(fixture.remote_file("webapps/blog/requirements.txt"))?, "Django==5.0\n");

        Ok(())
    }
}
