/*
 * Copyright 2024 Oxide Computer Company
 */

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use slog::{error, info, Logger};

use crate::config::Jenkins;

#[derive(Deserialize, Debug)]
struct JobInfo {
    #[serde(rename = "lastBuild")]
    last_build: Option<BuildRef>,
}

#[derive(Deserialize, Debug)]
struct BuildRef {
    number: Option<u64>,
}

/**
 * Pull the number of the most recent build out of a job's JSON description.
 */
pub fn parse_last_build(body: &str) -> Result<u64> {
    let job: JobInfo = serde_json::from_str(body)?;

    job.last_build
        .and_then(|b| b.number)
        .ok_or_else(|| anyhow!("could not fetch the last build number"))
}

/**
 * Ask Jenkins for the number of the most recently started build of a job.
 * A build that has only just been queued may not be visible yet; this is a
 * single point-in-time read.
 */
pub async fn last_build_number(
    log: &Logger,
    client: &reqwest::Client,
    jenkins: &Jenkins,
    pod: &str,
) -> Result<u64> {
    info!(log, "fetching last build number"; "pod" => pod);

    let res = client
        .get(jenkins.api_url(pod))
        .basic_auth(&jenkins.username, Some(&jenkins.password))
        .send()
        .await?;

    let status = res.status();
    if !status.is_success() {
        error!(log, "failed to connect to Jenkins API";
            "status" => status.as_u16());
        bail!("Jenkins API returned status code {}", status.as_u16());
    }

    let number = parse_last_build(&res.text().await?)?;
    info!(log, "last build number: {number}");
    Ok(number)
}
