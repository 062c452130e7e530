/*
 * Copyright 2024 Oxide Computer Company
 */

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use futures::StreamExt;
use jenkrun_browser::{Locator, Page};
use slog::{info, warn, Logger};
use tokio::io::AsyncWriteExt;

use crate::config::{Config, Jenkins};
use crate::params::JobParams;

pub fn result_file_name(task_name: &str) -> String {
    format!("{task_name}_result.csv")
}

async fn copy_body(
    res: reqwest::Response,
    f: &mut tokio::fs::File,
) -> Result<u64> {
    let mut total = 0u64;
    let mut body = res.bytes_stream();
    while let Some(ch) = body.next().await.transpose()? {
        f.write_all(&ch).await?;
        total += ch.len() as u64;
    }
    f.flush().await?;

    Ok(total)
}

async fn fetch(
    log: &Logger,
    client: &reqwest::Client,
    jenkins: &Jenkins,
    url: &str,
    dst: &Path,
) -> Result<Option<u64>> {
    let res = client
        .get(url)
        .basic_auth(&jenkins.username, Some(&jenkins.password))
        .send()
        .await?;

    if !res.status().is_success() {
        warn!(log, "could not download {url}";
            "status" => res.status().as_u16());
        return Ok(None);
    }

    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(dst)
        .await
        .with_context(|| anyhow!("creating {:?}", dst))?;

    match copy_body(res, &mut f).await {
        Ok(sz) => Ok(Some(sz)),
        Err(e) => {
            /*
             * Leave no truncated file behind.
             */
            drop(f);
            tokio::fs::remove_file(dst).await.ok();
            Err(e)
        }
    }
}

/**
 * Fetch a file from Jenkins into the named local file.  Returns the number
 * of bytes written, or None if the file could not be had for any reason; the
 * reason is logged as a warning.
 */
pub async fn save_url(
    log: &Logger,
    client: &reqwest::Client,
    jenkins: &Jenkins,
    url: &str,
    dst: &Path,
) -> Option<u64> {
    match fetch(log, client, jenkins, url, dst).await {
        Ok(sz) => sz,
        Err(e) => {
            warn!(log, "could not download {url}: {e:#}");
            None
        }
    }
}

/**
 * Look for the result file the job leaves in its workspace and, if it is
 * there, save it into the given directory.  The job has already finished by
 * now, so nothing that goes wrong here is more than a warning.
 */
#[allow(clippy::too_many_arguments)]
pub async fn download_result(
    log: &Logger,
    page: &mut Page,
    client: &reqwest::Client,
    cfg: &Config,
    params: &JobParams,
    build: u64,
    day: NaiveDate,
    dir: &Path,
) -> Option<PathBuf> {
    info!(log, "attempting to download result file");

    let listing = cfg.jenkins.workspace_url(&params.pod, build, day);
    if let Err(e) = page.navigate(&listing, cfg.element_ready).await {
        warn!(log, "could not open workspace listing: {e}";
            "url" => &listing);
        return None;
    }

    let name = result_file_name(&params.task_name);
    let link = Locator::css(format!("a[href=\"{name}\"]"));
    let url = match page.link_target(&link).await {
        Ok(Some(url)) => url,
        Ok(None) => {
            warn!(log, "file {name:?} not found at {listing}");
            return None;
        }
        Err(e) => {
            warn!(log, "looking for {name:?} at {listing}: {e}");
            return None;
        }
    };

    let dst = dir.join(&name);
    let sz = save_url(log, client, &cfg.jenkins, &url, &dst).await?;
    info!(log, "file {name:?} downloaded successfully to {:?}", dst;
        "bytes" => sz);
    Some(dst)
}
