use crate::commands::Outcome;
use crate::history::{self, HistoryStore};
use crate::output;
use crate::paths;
use anyhow::Result;
use fleetwright_config::Config;
use std::path::Path;

pub fn list(
    config: &Config,
    repo_root: &Path,
    all_services: bool,
    limit: Option<usize>,
) -> Result<Outcome> {
    let mut records = if all_services {
        history::list_all(&paths::state_dir(repo_root))?
    } else {
        let store = HistoryStore::load(
            paths::history_path(repo_root, &config.service),
            config.deploy.retain_history,
        )?;
        store.list()
    };
    if let Some(limit) = limit {
        records.truncate(limit);
    }

    if output::is_json() {
        output::emit_json(&records)?;
    } else if records.is_empty() {
        output::line("no deployment history recorded");
    } else {
        for record in &records {
            output::line(format!(
                "#{} {} {} -> {} [{:?}]",
                record.id, record.service, record.version, record.image, record.status
            ));
        }
    }
    Ok(Outcome::Success)
}

pub fn show(repo_root: &Path, id: u64) -> Result<Outcome> {
    let record = history::find_by_id(&paths::state_dir(repo_root), id)?;
    match record {
        Some(record) if output::is_json() => {
            output::emit_json(&record)?;
            Ok(Outcome::Success)
        }
        Some(record) => {
            output::line(format!(
                "#{} {} {} -> {} [{:?}], hosts: {}",
                record.id,
                record.service,
                record.version,
                record.image,
                record.status,
                record.hosts.join(", ")
            ));
            Ok(Outcome::Success)
        }
        None => {
            output::error_line(format!("no deployment record with id {id}"));
            anyhow::bail!("deployment record {id} not found")
        }
    }
}
