/*
 * Copyright 2024 Oxide Computer Company
 */

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use jenkrun_browser::BrowserConfig;
use jenkrun_common::{read_toml, secs_to_timeout};
use serde::Deserialize;

use crate::params::{Deployment, ModelMap};

const DEFAULT_WORKSPACE_PATH: &str = "execution/node/3/ws/sakani_scripts";
const DEFAULT_APPROVAL_TEXT: &str = "APPROVE ???";
const DEFAULT_ELEMENT_READY_SECS: u64 = 30;

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub jenkins: ConfigFileJenkins,
    #[serde(default)]
    pub browser: ConfigFileBrowser,
    #[serde(default)]
    pub timeouts: ConfigFileTimeouts,
    #[serde(default)]
    pub approval: ConfigFileApproval,
    #[serde(default)]
    pub model: BTreeMap<String, ConfigFileModel>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileJenkins {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub workspace_path: Option<String>,
}

impl fmt::Debug for ConfigFileJenkins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigFileJenkins")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "..."))
            .field("workspace_path", &self.workspace_path)
            .finish()
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileBrowser {
    pub chrome: Option<String>,
    pub port: Option<u16>,
    pub headless: Option<bool>,
    pub startup_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileTimeouts {
    /// How long to wait for a form element to become usable.  Zero waits
    /// forever.
    pub element_ready_secs: Option<u64>,
    /// How long to wait for the build to finish.  Zero, or no value, waits
    /// forever.
    pub completion_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileApproval {
    pub enabled: Option<bool>,
    pub text: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileModel {
    pub pod: String,
    pub service: String,
}

/**
 * The Jenkins instance and the identity we use with it, both for the web UI
 * login and for HTTP basic authentication against the JSON API.
 */
#[derive(Clone)]
pub struct Jenkins {
    pub url: String,
    pub username: String,
    pub password: String,
    pub workspace_path: String,
}

impl fmt::Debug for Jenkins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jenkins")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("workspace_path", &self.workspace_path)
            .finish_non_exhaustive()
    }
}

impl Jenkins {
    pub fn login_url(&self) -> String {
        format!("{}/login", self.url)
    }

    pub fn job_url(&self, pod: &str) -> String {
        format!("{}/job/{}", self.url, pod)
    }

    pub fn api_url(&self, pod: &str) -> String {
        format!("{}/api/json", self.job_url(pod))
    }

    pub fn console_url(&self, pod: &str, build: u64) -> String {
        format!("{}/{}/console", self.job_url(pod), build)
    }

    /**
     * The directory listing in the build workspace where a job run on the
     * given day leaves its result files.
     */
    pub fn workspace_url(
        &self,
        pod: &str,
        build: u64,
        day: NaiveDate,
    ) -> String {
        format!(
            "{}/{}/{}/{}/",
            self.job_url(pod),
            build,
            self.workspace_path,
            day.format("%Y%m%d"),
        )
    }
}

#[derive(Debug)]
pub struct Config {
    pub jenkins: Jenkins,
    pub browser: BrowserConfig,
    pub element_ready: Option<Duration>,
    pub completion: Option<Duration>,
    /// The text of the link to click to approve the pipeline, if the
    /// pipeline asks for approval.
    pub approval: Option<String>,
    pub models: ModelMap,
}

fn env(n: &str) -> Option<String> {
    std::env::var(n).ok()
}

impl ConfigFile {
    /**
     * Fill in defaults, apply overrides from the environment, and check
     * that we have everything we need.
     */
    pub fn resolve<F>(self, env: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let j = self.jenkins;

        let Some(url) = env("JENKRUN_URL").or(j.url) else {
            bail!("Jenkins URL must be set in [jenkins] or JENKRUN_URL");
        };
        let Some(username) = env("JENKRUN_USERNAME").or(j.username) else {
            bail!(
                "Jenkins username must be set in [jenkins] or JENKRUN_USERNAME"
            );
        };
        let Some(password) = env("JENKRUN_PASSWORD").or(j.password) else {
            bail!(
                "Jenkins password must be set in [jenkins] or JENKRUN_PASSWORD"
            );
        };

        let jenkins = Jenkins {
            url: url.trim_end_matches('/').to_string(),
            username,
            password,
            workspace_path: j
                .workspace_path
                .as_deref()
                .unwrap_or(DEFAULT_WORKSPACE_PATH)
                .trim_matches('/')
                .to_string(),
        };

        let defaults = BrowserConfig::default();
        let b = self.browser;
        let browser = BrowserConfig {
            chrome: b.chrome.unwrap_or(defaults.chrome),
            port: b.port.unwrap_or(defaults.port),
            headless: b.headless.unwrap_or(defaults.headless),
            startup_timeout: b
                .startup_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.startup_timeout),
        };

        let approval = if self.approval.enabled.unwrap_or(true) {
            Some(
                self.approval
                    .text
                    .unwrap_or_else(|| DEFAULT_APPROVAL_TEXT.to_string()),
            )
        } else {
            None
        };

        let models = if self.model.is_empty() {
            ModelMap::builtin()
        } else {
            self.model
                .into_iter()
                .map(|(name, m)| {
                    (name, Deployment { pod: m.pod, service: m.service })
                })
                .collect()
        };

        Ok(Config {
            jenkins,
            browser,
            element_ready: secs_to_timeout(Some(
                self.timeouts
                    .element_ready_secs
                    .unwrap_or(DEFAULT_ELEMENT_READY_SECS),
            )),
            completion: secs_to_timeout(self.timeouts.completion_secs),
            approval,
            models,
        })
    }
}

fn default_path() -> Result<PathBuf> {
    let mut path = dirs_next::config_dir()
        .ok_or_else(|| anyhow!("could not find config directory"))?;
    path.push("jenkrun");
    path.push("config.toml");
    Ok(path)
}

/**
 * Load configuration from the named file or, if no file was named, from the
 * default location.  A missing default file is not an error: everything can
 * come from the environment.
 */
pub fn load(path: Option<&Path>) -> Result<Config> {
    let c: ConfigFile = if let Some(path) = path {
        read_toml(path).with_context(|| anyhow!("reading file {:?}", path))?
    } else {
        let path = default_path()?;
        if path.exists() {
            read_toml(&path)
                .with_context(|| anyhow!("reading file {:?}", path))?
        } else {
            ConfigFile::default()
        }
    };

    c.resolve(env)
}
