use crate::commands::Outcome;
use crate::history::HistoryStore;
use crate::output;
use crate::paths;
use crate::rolling::{DeployOptions, DeployReport};
use crate::runtime::Runtime;
use anyhow::{Context, Result};
use fleetwright_config::Config;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Default)]
pub struct DeployArgs {
    pub version: Option<String>,
    pub skip_pull: bool,
    pub hosts: Option<Vec<String>>,
    pub roles: Option<Vec<String>>,
}

#[derive(Serialize)]
struct DeploySummary<'a> {
    service: &'a str,
    version: &'a str,
    image: &'a str,
    hosts: &'a [String],
    failures: Vec<(String, String)>,
}

fn summarize(config: &Config, report: &DeployReport) -> DeploySummary<'_> {
    DeploySummary {
        service: &config.service,
        version: &report.record.version,
        image: &report.record.image,
        hosts: &report.record.hosts,
        failures: report
            .failures
            .iter()
            .map(|(host, err)| (host.clone(), err.to_string()))
            .collect(),
    }
}

fn report_outcome(config: &Config, report: DeployReport) -> Result<Outcome> {
    if output::is_json() {
        output::emit_json(&summarize(config, &report))?;
    } else {
        for outcome in &report.host_outcomes {
            output::line(format!(
                "{}: deployed {} ({:?})",
                outcome.host, report.record.image, outcome.stage
            ));
        }
        for (host, err) in &report.failures {
            output::error_line(format!("{host}: {err}"));
        }
        if report.succeeded() {
            output::line(format!(
                "deployed {} to {} host(s)",
                report.record.image,
                report.record.hosts.len()
            ));
        }
    }
    Ok(Outcome::from_succeeded(report.succeeded()))
}

pub async fn deploy(config: &Config, repo_root: &Path, args: DeployArgs) -> Result<Outcome> {
    let runtime = Runtime::build(config);
    let deployer = runtime.rolling_deployer(config);
    let mut history = HistoryStore::load(
        paths::history_path(repo_root, &config.service),
        config.deploy.retain_history,
    )?;

    let opts = DeployOptions {
        version: args.version,
        skip_pull: args.skip_pull,
        hosts: args.hosts,
        roles: args.roles,
        previous_version: None,
    };

    let report = deployer
        .deploy(config, opts, &mut history)
        .await
        .context("deploy failed")?;
    report_outcome(config, report)
}

pub async fn redeploy(config: &Config, repo_root: &Path) -> Result<Outcome> {
    let runtime = Runtime::build(config);
    let deployer = runtime.rolling_deployer(config);
    let mut history = HistoryStore::load(
        paths::history_path(repo_root, &config.service),
        config.deploy.retain_history,
    )?;

    let report = deployer.redeploy(config, &mut history).await?;
    report_outcome(config, report)
}

pub async fn rollback(config: &Config, repo_root: &Path, version: String) -> Result<Outcome> {
    let runtime = Runtime::build(config);
    let deployer = runtime.rolling_deployer(config);
    let mut history = HistoryStore::load(
        paths::history_path(repo_root, &config.service),
        config.deploy.retain_history,
    )?;

    let report = deployer.rollback(config, version, &mut history).await?;
    report_outcome(config, report)
}
