use crate::atomic::write_atomic;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: u64,
    pub service: String,
    pub image: String,
    pub version: String,
    #[serde(default)]
    pub destination: String,
    pub hosts: Vec<String>,
    pub status: DeploymentStatus,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub previous_version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DeploymentRecord {
    pub fn start(
        id: u64,
        service: impl Into<String>,
        image: impl Into<String>,
        version: impl Into<String>,
        destination: impl Into<String>,
        hosts: Vec<String>,
    ) -> Self {
        Self {
            id,
            service: service.into(),
            image: image.into(),
            version: version.into(),
            destination: destination.into(),
            hosts,
            status: DeploymentStatus::InProgress,
            started_at: now_unix(),
            completed_at: None,
            duration_secs: None,
            previous_version: String::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn finish(&mut self, status: DeploymentStatus) {
        let completed_at = now_unix();
        self.completed_at = Some(completed_at);
        self.duration_secs = Some(completed_at.saturating_sub(self.started_at));
        self.status = status;
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct HistoryFile {
    records: Vec<DeploymentRecord>,
}

/// Local, per-repository, append-bounded ledger of deployments for one
/// service. Kept as a single JSON file per service under `.fleetwright/`,
/// written atomically on every append.
pub struct HistoryStore {
    path: PathBuf,
    retain: i64,
    records: Vec<DeploymentRecord>,
}

impl HistoryStore {
    pub fn load(path: impl Into<PathBuf>, retain_history: i64) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read history file: {}", path.display()))?;
            let file: HistoryFile = serde_json::from_str(&content)
                .context("failed to parse history file JSON")?;
            file.records
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            retain: retain_history,
            records,
        })
    }

    pub fn next_id(&self) -> u64 {
        self.records.iter().map(|r| r.id).max().unwrap_or(0) + 1
    }

    /// Append a record, then truncate to `retain_history` most-recent
    /// entries. `retain_history <= 0` means unbounded.
    pub fn append(&mut self, record: DeploymentRecord) -> Result<()> {
        self.records.push(record);
        self.records.sort_by_key(|r| r.started_at);

        if self.retain > 0 {
            let retain = self.retain as usize;
            if self.records.len() > retain {
                let drop_count = self.records.len() - retain;
                self.records.drain(0..drop_count);
            }
        }

        self.save()
    }

    /// Records newest first, matching the CLI's `history list` ordering.
    pub fn list(&self) -> Vec<DeploymentRecord> {
        let mut records = self.records.clone();
        records.reverse();
        records
    }

    pub fn get(&self, id: u64) -> Option<&DeploymentRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn last_successful(&self) -> Option<&DeploymentRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.status == DeploymentStatus::Success)
    }

    fn save(&self) -> Result<()> {
        let file = HistoryFile {
            records: self.records.clone(),
        };
        let contents = serde_json::to_string_pretty(&file)?;
        write_atomic(&self.path, &contents)
    }
}

/// Every deployment record across every service's ledger in `state_dir`,
/// newest first. Used by `history list` when no single service is named.
pub fn list_all(state_dir: &Path) -> Result<Vec<DeploymentRecord>> {
    let mut records = Vec::new();
    if !state_dir.exists() {
        return Ok(records);
    }
    let entries = std::fs::read_dir(state_dir)
        .with_context(|| format!("failed to read state directory: {}", state_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let is_history_file = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("history-") && n.ends_with(".json"));
        if !is_history_file {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read history file: {}", path.display()))?;
        let file: HistoryFile =
            serde_json::from_str(&content).context("failed to parse history file JSON")?;
        records.extend(file.records);
    }
    records.sort_by_key(|r| std::cmp::Reverse(r.started_at));
    Ok(records)
}

/// Finds a record by id across every service's ledger in `state_dir`. `id`
/// is only guaranteed unique within a service, so the first match wins.
pub fn find_by_id(state_dir: &Path, id: u64) -> Result<Option<DeploymentRecord>> {
    Ok(list_all(state_dir)?.into_iter().find(|r| r.id == id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "fleetwright-history-tests-{}-{}",
            std::process::id(),
            name
        ))
    }

    #[test]
    fn append_assigns_monotonic_ids_within_service() {
        let path = temp_path("ids.json");
        let _ = std::fs::remove_file(&path);
        let mut store = HistoryStore::load(&path, 20).unwrap();

        let id1 = store.next_id();
        store
            .append(DeploymentRecord::start(
                id1,
                "web",
                "ex.io/web:v1",
                "v1",
                "",
                vec!["h1".to_string()],
            ))
            .unwrap();

        let id2 = store.next_id();
        assert!(id2 > id1);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn append_bounds_to_retain_history() {
        let path = temp_path("bounded.json");
        let _ = std::fs::remove_file(&path);
        let mut store = HistoryStore::load(&path, 2).unwrap();

        for i in 0..5u64 {
            let id = store.next_id();
            let mut record = DeploymentRecord::start(
                id,
                "web",
                "ex.io/web:v1",
                format!("v{i}"),
                "",
                vec!["h1".to_string()],
            );
            record.finish(DeploymentStatus::Success);
            store.append(record).unwrap();
        }

        assert_eq!(store.list().len(), 2);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn list_orders_newest_first() {
        let path = temp_path("ordering.json");
        let _ = std::fs::remove_file(&path);
        let mut store = HistoryStore::load(&path, 0).unwrap();

        for i in 0..3u64 {
            let id = store.next_id();
            let mut record =
                DeploymentRecord::start(id, "web", "ex.io/web:v1", format!("v{i}"), "", vec![]);
            record.finish(DeploymentStatus::Success);
            store.append(record).unwrap();
        }

        let versions: Vec<String> = store.list().into_iter().map(|r| r.version).collect();
        assert_eq!(versions, vec!["v2", "v1", "v0"]);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn last_successful_skips_failed_records() {
        let path = temp_path("last-success.json");
        let _ = std::fs::remove_file(&path);
        let mut store = HistoryStore::load(&path, 0).unwrap();

        let mut ok = DeploymentRecord::start(store.next_id(), "web", "ex.io/web:v1", "v1", "", vec![]);
        ok.finish(DeploymentStatus::Success);
        store.append(ok).unwrap();

        let mut failed =
            DeploymentRecord::start(store.next_id(), "web", "ex.io/web:v2", "v2", "", vec![]);
        failed.finish(DeploymentStatus::Failed);
        store.append(failed).unwrap();

        let last = store.last_successful().expect("expected a successful record");
        assert_eq!(last.version, "v1");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn list_all_combines_every_service_ledger_in_the_directory() {
        let dir = std::env::temp_dir().join(format!(
            "fleetwright-history-tests-{}-scan",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let mut web = HistoryStore::load(dir.join("history-web.json"), 0).unwrap();
        let mut web_record =
            DeploymentRecord::start(web.next_id(), "web", "ex.io/web:v1", "v1", "", vec![]);
        web_record.started_at = 100;
        web_record.finish(DeploymentStatus::Success);
        web.append(web_record).unwrap();

        let mut api = HistoryStore::load(dir.join("history-api.json"), 0).unwrap();
        let mut api_record =
            DeploymentRecord::start(api.next_id(), "api", "ex.io/api:v1", "v1", "", vec![]);
        api_record.started_at = 200;
        api_record.finish(DeploymentStatus::Success);
        api.append(api_record).unwrap();

        let all = list_all(&dir).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|r| r.service == "web"));
        assert!(all.iter().any(|r| r.service == "api"));
        assert_eq!(all[0].service, "api", "list_all must be newest-first");

        let found = find_by_id(&dir, api.next_id() - 1).unwrap();
        assert!(found.is_some());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
