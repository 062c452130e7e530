/*
 * Copyright 2024 Oxide Computer Company
 */

use std::process::Stdio;
use std::time::{Duration, Instant};

use jenkrun_common::sleep_ms;
use serde::Deserialize;
use slog::{debug, info, o, warn, Logger};
use tokio::process::{Child, Command};

use crate::{BrowserError, Page, Result};

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Path or name of the Chromium (or Chrome) executable.
    pub chrome: String,
    /// TCP port on which the browser exposes its devtools endpoint.
    pub port: u16,
    pub headless: bool,
    /// How long to wait for the devtools endpoint to come up.
    pub startup_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        BrowserConfig {
            chrome: "chromium".to_string(),
            port: 9222,
            headless: true,
            startup_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(rename = "Browser")]
    browser: String,
}

#[derive(Debug, Deserialize)]
struct TabInfo {
    id: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    websocket_url: Option<String>,
}

impl BrowserConfig {
    fn args(&self, profile: &std::path::Path) -> Vec<String> {
        let mut args = Vec::new();
        if self.headless {
            args.push("--headless=new".to_string());
        }
        args.push(format!("--remote-debugging-port={}", self.port));
        args.push(format!("--user-data-dir={}", profile.display()));
        args.push("--no-first-run".to_string());
        args.push("--no-default-browser-check".to_string());
        args.push("--disable-gpu".to_string());
        args.push("about:blank".to_string());
        args
    }
}

/**
 * A browser process that we started, along with the throwaway profile
 * directory it runs in.  The process is killed and reaped if this is dropped
 * without calling close(), before the profile directory is removed.
 */
pub struct Browser {
    log: Logger,
    child: Child,
    base_url: String,
    client: reqwest::Client,
    profile: tempfile::TempDir,
}

impl Browser {
    pub async fn launch(log: &Logger, cfg: &BrowserConfig) -> Result<Browser> {
        let log = log.new(o!("component" => "browser"));
        let profile = tempfile::Builder::new().prefix("jenkrun-").tempdir()?;

        info!(log, "launching browser";
            "chrome" => &cfg.chrome,
            "port" => cfg.port,
            "headless" => cfg.headless);

        let child = Command::new(&cfg.chrome)
            .args(cfg.args(profile.path()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BrowserError::Launch(format!("{}: {e}", cfg.chrome)))?;

        /*
         * From here on, an early return drops the Browser, which reaps the
         * process before removing its profile.
         */
        let mut b = Browser {
            log,
            child,
            base_url: format!("http://127.0.0.1:{}", cfg.port),
            client: reqwest::Client::new(),
            profile,
        };

        /*
         * The devtools endpoint takes a moment to appear after the process
         * starts.  Poll for it, watching for the process exiting early
         * (e.g., because the port is taken).
         */
        let start = Instant::now();
        let url = format!("{}/json/version", b.base_url);
        let version = loop {
            if let Some(st) = b.child.try_wait()? {
                return Err(BrowserError::Launch(format!(
                    "{} exited during startup: {st}",
                    cfg.chrome
                )));
            }

            match b.client.get(&url).send().await {
                Ok(res) if res.status().is_success() => {
                    break res.json::<VersionInfo>().await?;
                }
                Ok(res) => {
                    debug!(b.log, "devtools not ready";
                        "status" => %res.status());
                }
                Err(e) => {
                    debug!(b.log, "devtools not ready: {e}");
                }
            }

            if start.elapsed() >= cfg.startup_timeout {
                return Err(BrowserError::Timeout {
                    what: "browser devtools endpoint".to_string(),
                    after: cfg.startup_timeout,
                });
            }

            sleep_ms(100).await;
        };

        info!(b.log, "browser ready"; "version" => version.browser);

        Ok(b)
    }

    /**
     * Open a new tab and connect to it.
     */
    pub async fn new_page(&self) -> Result<Page> {
        /*
         * Recent Chromium releases insist on PUT for this endpoint.
         */
        let tab: TabInfo = self
            .client
            .put(format!("{}/json/new?about:blank", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let url = tab.websocket_url.ok_or_else(|| {
            BrowserError::Launch(format!("tab {} has no debugger URL", tab.id))
        })?;

        debug!(self.log, "opened tab"; "id" => &tab.id);
        Page::connect(&self.log, &url).await
    }

    pub async fn close(mut self) -> Result<()> {
        info!(self.log, "closing browser");
        if let Err(e) = self.child.kill().await {
            warn!(self.log, "killing browser process: {e}");
        }
        Ok(())
    }
}

/*
 * How long to wait for a killed browser to exit before we give up and let the
 * profile directory removal race it.
 */
const REAP_TIMEOUT_MS: u64 = 5_000;

impl Drop for Browser {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        if let Err(e) = self.child.start_kill() {
            warn!(self.log, "killing browser process: {e}");
        }

        /*
         * Fields are dropped after this returns, so the profile directory
         * outlives the process as long as we see it exit here.
         */
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(REAP_TIMEOUT_MS) {
            match self.child.try_wait() {
                Ok(Some(_)) | Err(_) => return,
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
            }
        }
        warn!(self.log, "browser process did not exit";
            "profile" => %self.profile.path().display());
    }
}
