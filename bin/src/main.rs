/*
 * Copyright 2024 Oxide Computer Company
 */

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::prelude::*;
use getopts::Options;
use jenkrun_browser::{Browser, BrowserError, Page};
use jenkrun_common::*;
use slog::{error, info, warn, Logger};

mod config;
mod console;
mod download;
mod jenkins;
mod params;
mod poll;
mod report;
mod trigger;

use config::Config;
use console::Outcome;
use params::JobParams;
use report::Report;

struct Args {
    script: PathBuf,
    config: Option<PathBuf>,
    completion_secs: Option<u64>,
    download: bool,
    report: Option<PathBuf>,
}

fn parse_args(opts: &Options, args: &[String]) -> Result<Option<Args>> {
    let p = opts.parse(args)?;

    if p.opt_present("help") {
        return Ok(None);
    }

    let script = match p.free.as_slice() {
        [script] => PathBuf::from(script),
        [] => bail!("specify the script to run"),
        _ => bail!("specify only one script"),
    };

    let completion_secs = p
        .opt_str("t")
        .map(|s| {
            s.parse::<u64>()
                .map_err(|_| anyhow!("-t requires a number of seconds"))
        })
        .transpose()?;

    Ok(Some(Args {
        script,
        config: p.opt_str("f").map(PathBuf::from),
        completion_secs,
        download: p.opt_present("download"),
        report: p.opt_str("report").map(PathBuf::from),
    }))
}

fn write_report(path: &Path, report: &Report) -> Result<()> {
    let mut buf = serde_json::to_vec_pretty(report)?;
    buf.push(b'\n');
    std::fs::write(path, buf).with_context(|| anyhow!("writing {:?}", path))
}

/**
 * Everything from signing in to reporting the result, on a page we have
 * already opened.  Downloaded files are written to "dir".
 */
#[allow(clippy::too_many_arguments)]
async fn run_job(
    log: &Logger,
    out: &Logger,
    page: &mut Page,
    config: &Config,
    params: &JobParams,
    script: &str,
    a: &Args,
    dir: &Path,
) -> Result<()> {
    let client = reqwest::Client::new();

    trigger::login(log, page, config).await?;
    trigger::trigger(log, page, config, params, script).await?;

    let build =
        jenkins::last_build_number(log, &client, &config.jenkins, &params.pod)
            .await?;

    let console_text =
        poll::wait_for_completion(log, page, config, &params.pod, build)
            .await?;

    if let Some(outcome) = Outcome::from_console(&console_text) {
        outcome.log(log);
    }

    let block = console::report_block(out, &console_text);

    if a.download {
        match &block {
            Some(b) if b.is_debug() => {
                download::download_result(
                    log,
                    page,
                    &client,
                    config,
                    params,
                    build,
                    Local::now().date_naive(),
                    dir,
                )
                .await;
            }
            _ => {
                warn!(log, "no debug output from the job; not downloading");
            }
        }
    }

    if let Some(path) = a.report.as_deref() {
        let report = block
            .as_ref()
            .map(Report::from_block)
            .unwrap_or_else(Report::missing);
        write_report(path, &report)?;
        info!(log, "report written to {:?}", path);
    }

    Ok(())
}

async fn run(log: &Logger, out: &Logger, a: &Args) -> Result<()> {
    let mut config = config::load(a.config.as_deref())?;
    if let Some(secs) = a.completion_secs {
        config.completion = secs_to_timeout(Some(secs));
    }
    info!(log, "configuration loaded";
        "jenkins" => &config.jenkins.url,
        "models" => config.models.len());

    /*
     * Everything we need from the script must be there before we go near
     * Jenkins.
     */
    let (params, script) =
        params::extract_file(log, &a.script, &config.models)?;
    info!(log, "job parameters";
        "task" => &params.task_name,
        "model" => &params.primary_model,
        "models_used" => params.models.len());

    let dir = std::env::current_dir()?;
    let browser = Browser::launch(log, &config.browser).await?;
    let mut page = browser.new_page().await?;

    let res = run_job(
        log, out, &mut page, &config, &params, &script, a, &dir,
    )
    .await;

    if let Err(e) = page.close().await {
        warn!(log, "closing page: {e}");
    }
    browser.close().await?;

    res?;
    info!(log, "completed");
    Ok(())
}

/**
 * Deadlines get their own wording, so that an operator can tell a build that
 * is still running from one that failed.
 */
fn failure_message(e: &anyhow::Error) -> String {
    match e.downcast_ref::<BrowserError>() {
        Some(be) if be.is_timeout() => format!("deadline exceeded: {e:#}"),
        _ => format!("{e:#}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut opts = Options::new();

    opts.optopt("f", "", "configuration file", "CONFIG");
    opts.optopt(
        "t",
        "",
        "seconds to wait for the build to finish (0 waits forever)",
        "SECS",
    );
    opts.optflag(
        "",
        "download",
        "download the result file if the job succeeds",
    );
    opts.optopt("", "report", "write a JSON summary of the outcome", "FILE");
    opts.optflag("h", "help", "print this message");

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let brief = "usage: jenkrun [OPTIONS] SCRIPT";

    let a = match parse_args(&opts, &args) {
        Ok(Some(a)) => a,
        Ok(None) => {
            println!("{}", opts.usage(brief));
            return Ok(());
        }
        Err(e) => {
            eprintln!("ERROR: usage: {}", e);
            eprintln!("       {}", opts.usage(brief));
            std::process::exit(1);
        }
    };

    let log = make_log("jenkrun");
    let out = make_outcome_log(std::io::stderr());

    info!(log, "starting";
        "script" => a.script.display().to_string(),
        "download" => a.download);

    if let Err(e) = run(&log, &out, &a).await {
        error!(log, "{}", failure_message(&e));
        std::process::exit(1);
    }

    Ok(())
}
