use crate::atomic::write_atomic;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CanaryStatus {
    #[default]
    None,
    Deploying,
    Running,
    Promoting,
    RollingBack,
}

impl CanaryStatus {
    /// `deploying`/`promoting`/`rolling-back` are transient and not expected
    /// to survive a crash consistently; reload surfaces them to the
    /// operator rather than resuming automatically.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            CanaryStatus::Deploying | CanaryStatus::Promoting | CanaryStatus::RollingBack
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryState {
    pub service: String,
    pub status: CanaryStatus,
    pub stable_version: String,
    pub canary_version: String,
    pub current_weight: u8,
    pub target_weight: u8,
    pub started_at: u64,
    pub last_updated: u64,
    pub hosts: Vec<String>,
    pub canary_container_name: String,
    pub stable_container_name: String,
}

impl CanaryState {
    pub fn none(service: impl Into<String>) -> Self {
        let now = now_unix();
        Self {
            service: service.into(),
            status: CanaryStatus::None,
            stable_version: String::new(),
            canary_version: String::new(),
            current_weight: 0,
            target_weight: 0,
            started_at: now,
            last_updated: now,
            hosts: Vec::new(),
            canary_container_name: String::new(),
            stable_container_name: String::new(),
        }
    }

    pub fn stable_weight(&self) -> u8 {
        100 - self.current_weight
    }

    fn touch(&mut self) {
        self.last_updated = now_unix();
    }

    pub fn set_weight(&mut self, weight: u8) {
        self.current_weight = weight;
        self.touch();
    }

    pub fn transition(&mut self, status: CanaryStatus) {
        self.status = status;
        self.touch();
    }

    pub fn load(path: impl AsRef<Path>, service: &str) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::none(service));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read canary state file: {}", path.display()))?;
        let state: CanaryState =
            serde_json::from_str(&content).context("failed to parse canary state JSON")?;

        if state.service != service {
            return Ok(Self::none(service));
        }

        Ok(state)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        write_atomic(path.as_ref(), &contents)
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn state_path_for(dir: &Path, service: &str) -> PathBuf {
    crate::paths::canary_state_path(dir, service)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "fleetwright-canary-tests-{}-{}",
            std::process::id(),
            name
        ))
    }

    #[test]
    fn missing_file_loads_as_none_status() {
        let path = temp_dir("missing.json");
        let _ = std::fs::remove_file(&path);
        let state = CanaryState::load(&path, "web").unwrap();
        assert_eq!(state.status, CanaryStatus::None);
    }

    #[test]
    fn load_rejects_mismatched_service() {
        let path = temp_dir("mismatch.json");
        let mut state = CanaryState::none("api");
        state.transition(CanaryStatus::Running);
        state.save(&path).unwrap();

        let reloaded = CanaryState::load(&path, "web").unwrap();
        assert_eq!(reloaded.status, CanaryStatus::None);
        assert_eq!(reloaded.service, "web");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn stable_weight_is_complement_of_current_weight() {
        let mut state = CanaryState::none("web");
        state.set_weight(20);
        assert_eq!(state.stable_weight(), 80);
    }

    #[test]
    fn transient_statuses_are_flagged_for_recovery() {
        assert!(CanaryStatus::Deploying.is_transient());
        assert!(CanaryStatus::Promoting.is_transient());
        assert!(CanaryStatus::RollingBack.is_transient());
        assert!(!CanaryStatus::Running.is_transient());
        assert!(!CanaryStatus::None.is_transient());
    }
}
