/*
 * Copyright 2024 Oxide Computer Company
 */

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use slog::{info, Logger};

/**
 * Where jobs touching a particular model must be sent: the Jenkins job
 * ("pod") that runs them, and the service name to select in its form.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub pod: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMap(BTreeMap<String, Deployment>);

const BUILTIN_MODELS: &[(&str, &str, &str)] = &[
    ("Booking", "prod-run-script-with-string", "sakani-beneficiaries-graphql"),
    (
        "Beneficiary",
        "prod-run-script-with-string",
        "sakani-beneficiaries-graphql",
    ),
    (
        "TrackingPriceQuotation",
        "prod-run-script-with-string",
        "sakani-beneficiaries-graphql",
    ),
    (
        "AzmStoreClient",
        "prod-run-script-with-string",
        "sakani-main-intermediary",
    ),
    ("CompanyUser", "prod-run-script-with-string", "sakani-partners-service"),
    ("Company", "prod-run-script-with-string", "sakani-partners-service"),
    (
        "ProjectsData",
        "prod-run-script-with-string",
        "sakani-external-integrations-service",
    ),
];

impl ModelMap {
    /**
     * The table used when the configuration file does not list any models.
     */
    pub fn builtin() -> ModelMap {
        BUILTIN_MODELS
            .iter()
            .map(|(model, pod, service)| {
                (
                    model.to_string(),
                    Deployment {
                        pod: pod.to_string(),
                        service: service.to_string(),
                    },
                )
            })
            .collect()
    }

    pub fn get(&self, model: &str) -> Option<&Deployment> {
        self.0.get(model)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(String, Deployment)> for ModelMap {
    fn from_iter<I: IntoIterator<Item = (String, Deployment)>>(
        iter: I,
    ) -> Self {
        ModelMap(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobParams {
    pub task_name: String,
    pub service: String,
    pub pod: String,
    pub primary_model: String,
    /// Every model used in the script, in order of appearance.
    pub models: Vec<String>,
}

fn task_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"task_name\s*=\s*['"](\w+)['"]"#).unwrap())
}

fn model_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+)\.where").unwrap())
}

/**
 * Work out the job parameters for a script.  The first model the script
 * queries decides where the job goes, no matter how many others follow it.
 */
pub fn extract(
    log: &Logger,
    content: &str,
    models: &ModelMap,
) -> Result<JobParams> {
    let used = model_re()
        .captures_iter(content)
        .map(|c| c[1].to_string())
        .collect::<Vec<_>>();

    let Some(primary) = used.first() else {
        bail!("no model names found in the script");
    };

    let Some(dep) = models.get(primary) else {
        bail!("model {primary:?} not found in the model map");
    };

    let task_name = task_name_re().captures(content).map(|c| c[1].to_string());

    info!(log, "script parameters";
        "task" => task_name.as_deref().unwrap_or("not found"));
    info!(log, "models used: {}", used.join(", "));
    info!(log, "primary model: {primary}");
    info!(log, "pod: {}", dep.pod);
    info!(log, "service name: {}", dep.service);

    let Some(task_name) = task_name else {
        bail!("could not extract the task name from the script");
    };

    Ok(JobParams {
        task_name,
        service: dep.service.to_string(),
        pod: dep.pod.to_string(),
        primary_model: primary.to_string(),
        models: used,
    })
}

/**
 * Read the script from disk and extract its parameters.  Returns the script
 * text as well, as it is submitted verbatim with the job.
 */
pub fn extract_file(
    log: &Logger,
    path: &Path,
    models: &ModelMap,
) -> Result<(JobParams, String)> {
    info!(log, "extracting information from script {:?}", path);

    let content = std::fs::read_to_string(path)
        .with_context(|| anyhow!("reading script {:?}", path))?;
    let params = extract(log, &content, models)?;

    Ok((params, content))
}

#[cfg(test)]
mod test {
    use super::*;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn single_quotes_and_mapped_model() {
        let script = "task_name = 'sync_companies'\n\
            Company.where(active: true).each { |c| pp c }\n";

        let p = extract(&log(), script, &ModelMap::builtin()).unwrap();
        assert_eq!(
            (p.task_name.as_str(), p.service.as_str(), p.pod.as_str()),
            (
                "sync_companies",
                "sakani-partners-service",
                "prod-run-script-with-string"
            )
        );
        assert_eq!(p.primary_model, "Company");
    }

    #[test]
    fn double_quotes_and_spacing() {
        let script = "task_name=\"SS_3515\"\nBooking.where(id: 1)\n";

        let p = extract(&log(), script, &ModelMap::builtin()).unwrap();
        assert_eq!(p.task_name, "SS_3515");
        assert_eq!(p.service, "sakani-beneficiaries-graphql");
    }

    #[test]
    fn first_model_wins() {
        let script = "task_name = 'x'\n\
            AzmStoreClient.where(a: 1)\n\
            CompanyUser.where(b: 2)\n\
            CompanyUser.where(c: 3)\n";

        let p = extract(&log(), script, &ModelMap::builtin()).unwrap();
        assert_eq!(p.primary_model, "AzmStoreClient");
        assert_eq!(p.service, "sakani-main-intermediary");
        assert_eq!(
            p.models,
            vec!["AzmStoreClient", "CompanyUser", "CompanyUser"]
        );
    }

    #[test]
    fn model_in_a_comment_counts() {
        /*
         * A real script that only mentions its model in a comment, so that
         * the job is routed correctly despite using find_by:
         */
        let script = "task_name = 'SS_3515'\n\
            csv_file = task_name + '_result.csv'\n\
            \n\
            # CompanyUser.where\n\
            \n\
            user = CompanyUser.find_by(identity_number: 1)\n";

        let p = extract(&log(), script, &ModelMap::builtin()).unwrap();
        assert_eq!(p.task_name, "SS_3515");
        assert_eq!(p.primary_model, "CompanyUser");
        assert_eq!(p.service, "sakani-partners-service");
    }

    #[test]
    fn unmapped_model_is_fatal() {
        let script = "task_name = 'x'\nWidget.where(a: 1)\nCompany.where(b: 2)\n";

        let e = extract(&log(), script, &ModelMap::builtin()).unwrap_err();
        assert_eq!(e.to_string(), "model \"Widget\" not found in the model map");
    }

    #[test]
    fn missing_model_is_fatal() {
        let e = extract(&log(), "task_name = 'x'\n", &ModelMap::builtin())
            .unwrap_err();
        assert_eq!(e.to_string(), "no model names found in the script");
    }

    #[test]
    fn missing_task_name_is_fatal() {
        let data = &[
            "Company.where(a: 1)\n",
            "task_name = sync\nCompany.where(a: 1)\n",
            "task_name = 'has-dash'\nCompany.where(a: 1)\n",
        ];

        for script in data {
            let e = extract(&log(), script, &ModelMap::builtin()).unwrap_err();
            assert_eq!(
                e.to_string(),
                "could not extract the task name from the script"
            );
        }
    }

    #[test]
    fn custom_map() {
        let models: ModelMap = [(
            "Widget".to_string(),
            Deployment { pod: "p".to_string(), service: "s".to_string() },
        )]
        .into_iter()
        .collect();

        let p =
            extract(&log(), "task_name='t'\nWidget.where()\n", &models).unwrap();
        assert_eq!((p.pod.as_str(), p.service.as_str()), ("p", "s"));

        assert!(extract(&log(), "task_name='t'\nCompany.where()\n", &models)
            .is_err());
    }

    #[test]
    fn builtin_table() {
        let m = ModelMap::builtin();
        assert_eq!(m.len(), 7);
        assert_eq!(
            m.get("ProjectsData").map(|d| d.service.as_str()),
            Some("sakani-external-integrations-service")
        );
        assert!(m.get("Nonexistent").is_none());
    }

    #[test]
    fn extract_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut f,
            b"task_name = \"from_file\"\nBeneficiary.where(x: 1)\n",
        )
        .unwrap();

        let (p, content) =
            extract_file(&log(), f.path(), &ModelMap::builtin()).unwrap();
        assert_eq!(p.task_name, "from_file");
        assert!(content.starts_with("task_name"));
    }
}
