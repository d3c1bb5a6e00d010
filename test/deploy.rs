// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::DeployFixture;

use anyhow::Result;
use indoc::indoc;
use oxideploy::{
    secret::{ChainResolver, EnvResolver},
    sync::{BatchEntry, OnError, SyncEngine},
    task::{Session, TaskRegistry},
};
use pretty_assertions::assert_eq;
use sealed_test::prelude::*;

const DEFINITION: &str = indoc! {r#"
    [settings]
    host = "web42.example.net"
    user = "alice"
    project = "blog"
    secrets = ["db_pass"]

    [vars]
    workers = "4"

    [remote_vars]
    gunicorn_port = "%(proj_path)s/app.port"

    [[template]]
    name = "gunicorn"
    local_path = "deploy/gunicorn.conf.template"
    remote_path = "%(proj_path)s/gunicorn.conf"

    [[template]]
    name = "settings"
    local_path = "deploy/settings.ini.template"
    remote_path = "%(proj_path)s/settings.ini"
"#};

const GUNICORN: &str = indoc! {"
    bind = \"127.0.0.1:%(gunicorn_port)s\"
    workers = %(workers)s
    access_log_format = '%({x-forwarded-for}i)s %l %u \"%r\" %s 100%'
"};

const SETTINGS: &str = indoc! {"
    [database]
    user = %(user)s
    password = %(db_pass)s
"};

fn fixture() -> Result<DeployFixture> {
    DeployFixture::new()?
        .with_template("deploy/gunicorn.conf.template", GUNICORN)?
        .with_template("deploy/settings.ini.template", SETTINGS)?
        .with_remote_file("/home/alice/webapps/blog/app.port", "20145\n")
}

#[sealed_test(env = [("OXIDEPLOY_DB_PASS", "hunter2")])]
fn batch_sync_renders_remote_vars_and_secrets() -> Result<()> {
    let fixture = fixture()?;
    let definition = fixture.definition(DEFINITION)?;
    let mut context = fixture.context(&definition)?;
    let engine = SyncEngine::new(fixture.transport()?);
    let mut resolver = EnvResolver::new();

    let report = engine.sync_batch(
        &definition.templates,
        &mut context,
        &mut resolver,
        definition.settings.batch,
    );
    assert!(report.is_success());
    assert_eq!(report.uploaded(), vec!["gunicorn", "settings"]);
    assert_eq!(
        fixture.remote_file("/home/alice/webapps/blog/gunicorn.conf"),
        Some(
            indoc! {"
                bind = \"127.0.0.1:20145\"
                workers = 4
                access_log_format = '%({x-forwarded-for}i)s %l %u \"%r\" %s 100%'
            "}
            .into()
        )
    );
    assert_eq!(
        fixture.remote_file("/home/alice/webapps/blog/settings.ini"),
        Some("[database]\nuser = alice\npassword = hunter2\n".into())
    );
    assert_eq!(context.get("db_pass"), Some("hunter2"));

    let report = engine.sync_batch(
        &definition.templates,
        &mut context,
        &mut resolver,
        definition.settings.batch,
    );
    assert!(report.uploaded().is_empty());

    Ok(())
}

#[sealed_test]
fn missing_secret_only_fails_its_descriptor() -> Result<()> {
    let fixture = fixture()?;
    let definition = fixture.definition(DEFINITION)?;
    let mut context = fixture.context(&definition)?;
    let engine = SyncEngine::new(fixture.transport()?);

    let report = engine.sync_batch(
        &definition.templates,
        &mut context,
        &mut EnvResolver::new(),
        definition.settings.batch,
    );
    assert_eq!(report.uploaded(), vec!["gunicorn"]);
    assert!(matches!(report.entry("settings"), Some(BatchEntry::Failed(_))));
    assert_eq!(fixture.remote_file("/home/alice/webapps/blog/settings.ini"), None);

    Ok(())
}

#[sealed_test]
fn abort_policy_from_definition_skips_rest() -> Result<()> {
    let fixture = fixture()?.with_template("deploy/broken.template", "%(nope)s\n")?;
    let data = DEFINITION.replace(
        "[vars]",
        indoc! {r#"
            [settings.batch]
            on_render_error = "abort"

            [vars]
        "#},
    );
    let data = data.replace(
        "deploy/gunicorn.conf.template",
        "deploy/broken.template",
    );
    let definition = fixture.definition(&data)?;
    assert_eq!(definition.settings.batch.on_render_error, OnError::Abort);

    let mut context = fixture.context(&definition)?;
    let engine = SyncEngine::new(fixture.transport()?);
    let report = engine.sync_batch(
        &definition.templates,
        &mut context,
        &mut EnvResolver::new(),
        definition.settings.batch,
    );
    assert_eq!(report.failures().len(), 1);
    assert_eq!(report.skipped(), vec!["settings"]);

    Ok(())
}

#[sealed_test(env = [("OXIDEPLOY_DB_PASS", "hunter2")])]
fn deploy_task_syncs_and_restarts() -> Result<()> {
    let fixture = fixture()?;
    let data = format!(
        "{DEFINITION}{}",
        indoc! {r#"

            [deploy]
            restart_command = "touch restarted.marker"
        "#}
    );
    let definition = fixture.definition(&data)?;
    let context = fixture.context(&definition)?;
    let mut session = Session::new(
        definition,
        context,
        fixture.transport()?,
        Box::new(ChainResolver::default()),
    );

    TaskRegistry::standard().run(&["deploy"], &mut session)?;
    assert!(fixture.remote_file("restarted.marker").is_some());
    assert!(fixture
        .remote_file("/home/alice/webapps/blog/gunicorn.conf")
        .is_some());

    Ok(())
}
