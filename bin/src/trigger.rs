/*
 * Copyright 2024 Oxide Computer Company
 */

use anyhow::{Context, Result};
use jenkrun_browser::{Locator, Page};
use slog::{info, Logger};

use crate::config::Config;
use crate::params::JobParams;

const SERVICE_SELECT: &str =
    r#"div[description="Please select a service"] select[name="value"]"#;

fn task_input() -> Locator {
    Locator::css(r#"input[name="value"]"#)
}

fn script_textarea() -> Locator {
    Locator::css(r#"textarea[name="value"]"#)
}

/**
 * Sign in to the Jenkins web UI.
 */
pub async fn login(log: &Logger, page: &mut Page, cfg: &Config) -> Result<()> {
    let j = &cfg.jenkins;
    let wait = cfg.element_ready;

    info!(log, "logging into Jenkins"; "url" => &j.url);
    page.navigate(&j.login_url(), wait).await?;

    let user = Locator::label("Username");
    page.wait_ready(&user, wait).await?;
    page.fill(&user, &j.username).await?;
    page.fill(&Locator::label("Password"), &j.password).await?;
    page.click_and_wait(&Locator::button("Sign in"), wait)
        .await
        .context("signing in")?;

    Ok(())
}

/**
 * Queue a build of the job for these parameters, through the job's "Build
 * with Parameters" form.  The script is submitted verbatim.
 */
pub async fn trigger(
    log: &Logger,
    page: &mut Page,
    cfg: &Config,
    params: &JobParams,
    script: &str,
) -> Result<()> {
    let wait = cfg.element_ready;

    info!(log, "navigating to Jenkins job"; "pod" => &params.pod);
    page.navigate(&format!("{}/", cfg.jenkins.job_url(&params.pod)), wait)
        .await?;

    info!(log, "initiating build with parameters");
    page.click_and_wait(&Locator::link("Build with Parameters"), wait)
        .await
        .context("opening the parameters form")?;

    info!(log, "filling in build parameters";
        "task" => &params.task_name,
        "service" => &params.service);

    let task = task_input();
    page.wait_ready(&task, wait).await?;
    page.fill(&task, &params.task_name).await?;

    page.select_option(&Locator::css(SERVICE_SELECT), &params.service)
        .await?;

    /*
     * The script field is revealed and enabled by the form's own scripts a
     * moment after the page loads.
     */
    let ta = script_textarea();
    page.wait_ready(&ta, wait).await?;
    page.fill(&ta, script).await?;

    info!(log, "starting the build");
    page.click_and_wait(&Locator::button("Build"), wait)
        .await
        .context("submitting the build")?;

    Ok(())
}
