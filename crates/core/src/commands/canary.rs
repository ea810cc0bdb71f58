use crate::canary::{CanaryDeployOptions, CanaryReport};
use crate::canary_state::CanaryState;
use crate::commands::Outcome;
use crate::history::HistoryStore;
use crate::output;
use crate::paths;
use crate::runtime::Runtime;
use anyhow::{Context, Result};
use fleetwright_config::Config;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct CanaryReportSummary<'a> {
    state: &'a CanaryState,
    failures: Vec<(String, String)>,
}

fn report_outcome(report: CanaryReport) -> Result<Outcome> {
    let succeeded = report.succeeded();
    if output::is_json() {
        let failures = report
            .failures
            .iter()
            .map(|(host, err)| (host.clone(), err.to_string()))
            .collect();
        output::emit_json(&CanaryReportSummary {
            state: &report.state,
            failures,
        })?;
    } else {
        for (host, err) in &report.failures {
            output::error_line(format!("{host}: {err}"));
        }
        output::line(format!(
            "canary status for {}: {:?} (weight {})",
            report.state.service, report.state.status, report.state.current_weight
        ));
    }
    Ok(Outcome::from_succeeded(succeeded))
}

pub async fn deploy(
    config: &Config,
    repo_root: &Path,
    version: String,
    weight: Option<u8>,
) -> Result<Outcome> {
    let runtime = Runtime::build(config);
    let deployer = runtime.canary_deployer(repo_root);
    let mut history = HistoryStore::load(
        paths::history_path(repo_root, &config.service),
        config.deploy.retain_history,
    )?;

    let report = deployer
        .deploy(config, CanaryDeployOptions { version, weight }, &mut history)
        .await
        .context("canary deploy failed")?;
    report_outcome(report)
}

pub async fn promote(config: &Config, repo_root: &Path) -> Result<Outcome> {
    let runtime = Runtime::build(config);
    let deployer = runtime.canary_deployer(repo_root);
    let mut history = HistoryStore::load(
        paths::history_path(repo_root, &config.service),
        config.deploy.retain_history,
    )?;

    let report = deployer.promote(config, &mut history).await?;
    report_outcome(report)
}

pub async fn rollback(config: &Config, repo_root: &Path) -> Result<Outcome> {
    let runtime = Runtime::build(config);
    let deployer = runtime.canary_deployer(repo_root);
    let mut history = HistoryStore::load(
        paths::history_path(repo_root, &config.service),
        config.deploy.retain_history,
    )?;

    let report = deployer.rollback(config, &mut history).await?;
    report_outcome(report)
}

pub async fn status(config: &Config, repo_root: &Path) -> Result<Outcome> {
    let runtime = Runtime::build(config);
    let deployer = runtime.canary_deployer(repo_root);
    let state = deployer.status(&config.service)?;

    if output::is_json() {
        output::emit_json(&state)?;
    } else if state.status == crate::canary_state::CanaryStatus::None {
        output::line(format!("no canary deployment for {}", config.service));
    } else {
        if state.status.is_transient() {
            output::subtle_line(format!(
                "warning: state was left in a transient status ({:?}) by an interrupted run",
                state.status
            ));
        }
        output::line(format!(
            "{}: {:?}, stable={} canary={}, weight={}",
            state.service,
            state.status,
            state.stable_version,
            state.canary_version,
            state.current_weight
        ));
    }
    Ok(Outcome::Success)
}

pub async fn weight(config: &Config, repo_root: &Path, weight: u8) -> Result<Outcome> {
    let runtime = Runtime::build(config);
    let deployer = runtime.canary_deployer(repo_root);
    let state = deployer.set_weight(config, weight).await?;

    if output::is_json() {
        output::emit_json(&state)?;
    } else {
        output::line(format!(
            "canary weight for {} set to {}",
            state.service, state.current_weight
        ));
    }
    Ok(Outcome::Success)
}
