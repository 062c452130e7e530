/*
 * Copyright 2024 Oxide Computer Company
 */

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use jenkrun_browser::{Locator, Page};
use jenkrun_common::DurationExt;
use serde_json::Value;
use slog::{info, Logger};

use crate::config::Config;
use crate::console::TERMINAL_MARKERS;

fn console_output() -> Locator {
    Locator::css("pre.console-output")
}

/**
 * An expression that is true once the console output shows that the build
 * has reached a final state.
 */
fn finished_js() -> String {
    let markers = serde_json::to_string(TERMINAL_MARKERS)
        .unwrap_or_else(|_| "[]".to_string());
    console_output().with_js(&format!(
        "return {markers}.some((m) => e.innerText.includes(m));"
    ))
}

/**
 * An expression that is true once either the approval link is on the page or
 * the build has finished.
 */
fn approval_or_finished_js(approve: &Locator) -> String {
    format!("({}) || ({}) === true", approve.exists_js(), finished_js())
}

/**
 * What remains of the overall deadline, so that the approval wait and the
 * completion wait share one budget.
 */
fn remaining(deadline: Option<Duration>, start: Instant) -> Option<Duration> {
    deadline.map(|d| d.saturating_sub(start.elapsed()))
}

/**
 * Watch the console page of a build until it finishes, approving the
 * pipeline along the way if it asks.  Returns the whole console text.
 */
pub async fn wait_for_completion(
    log: &Logger,
    page: &mut Page,
    cfg: &Config,
    pod: &str,
    build: u64,
) -> Result<String> {
    let start = Instant::now();
    let deadline = cfg.completion;

    info!(log, "navigating to console output"; "build" => build);
    page.navigate(&cfg.jenkins.console_url(pod, build), cfg.element_ready)
        .await?;
    page.scroll_to_bottom().await?;

    if let Some(text) = cfg.approval.as_deref() {
        /*
         * A build can finish, or be aborted, before it ever reaches the
         * input step, in which case there will never be a link to click.
         */
        info!(log, "waiting for the approval link"; "text" => text);
        let approve = Locator::link(text);
        page.wait_for(
            "the approval link or the end of the build",
            &approval_or_finished_js(&approve),
            remaining(deadline, start),
        )
        .await
        .context("waiting for the approval link")?;

        if page.evaluate(&finished_js()).await? == Value::Bool(true) {
            info!(log, "build finished without asking for approval");
        } else {
            info!(log, "clicking the approval link");
            page.click(&approve).await?;
        }
    }

    match deadline {
        Some(d) => info!(log, "waiting for the build to finish";
            "timeout" => d.render()),
        None => info!(log, "waiting for the build to finish"),
    }
    page.wait_for(
        "the build to finish",
        &finished_js(),
        remaining(deadline, start),
    )
    .await?;

    let text = page.text_content(&console_output()).await?;
    info!(log, "build finished after {}", start.elapsed().render();
        "console_bytes" => text.len());

    Ok(text)
}
