use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod local;
pub mod ssh;

/// Opaque to everything but the driver: the core tracks containers by name
/// and the `running`/`healthy` status this type reports. Naming discipline
/// (primary = `<service>`, canary = `<service>-canary`, scaled instance =
/// `<service>-<role>-<index>`) lives in the caller, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    Creating,
    Running,
    Stopped,
    Paused,
    Restarting,
    Removing,
    Dead,
    Exited,
    Unknown,
}

impl ContainerStatus {
    pub fn is_running(self) -> bool {
        matches!(self, ContainerStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub protocol: String,
}

/// Everything `ContainerDriver::run` needs to materialize one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub name: String,
    pub image: String,
    pub ports: Vec<u16>,
    pub network: Option<String>,
    pub restart_policy: String,
    pub env: HashMap<String, String>,
    pub volumes: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Readiness path used to derive the container-level healthcheck, unless
    /// `disable_healthcheck` is set. Probed against `app_port` on loopback.
    pub readiness_path: Option<String>,
    pub app_port: u16,
    pub disable_healthcheck: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LogsConfig {
    pub tail: Option<usize>,
    pub since: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    pub command: Vec<String>,
    pub stdin: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StdStreams {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub name_prefix: Option<String>,
    pub label: Option<(String, String)>,
}

/// The sole boundary between the deployers and a host's container runtime.
/// One production implementation shells these operations over SSH (the
/// load-bearing path, since hosts are remote Linux servers); a local
/// bollard-backed implementation serves single-host/local-deploy mode.
#[async_trait::async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn pull(&self, host: &str, image: &str) -> Result<()>;
    async fn run(&self, host: &str, config: &RunConfig) -> Result<String>;
    async fn stop(&self, host: &str, name: &str, timeout_secs: u64) -> Result<()>;
    async fn remove(&self, host: &str, name: &str, force: bool) -> Result<()>;
    async fn rename(&self, host: &str, from: &str, to: &str) -> Result<()>;
    async fn is_running(&self, host: &str, name: &str) -> Result<bool>;
    async fn exists(&self, host: &str, name: &str) -> Result<bool>;
    async fn wait_healthy(&self, host: &str, name: &str, timeout_secs: u64) -> Result<bool>;
    async fn logs(&self, host: &str, name: &str, config: &LogsConfig) -> Result<StdStreams>;
    async fn exec(&self, host: &str, name: &str, config: &ExecConfig) -> Result<ExecOutput>;
    async fn stats(&self, host: &str, name: &str) -> Result<String>;
    async fn list(&self, host: &str, filters: &ListFilters) -> Result<Vec<ContainerInfo>>;
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("container '{name}' not found on {host}")]
    NotFound { host: String, name: String },
    #[error("image preflight failed for '{image}' on {host}: {detail}")]
    ImageUnavailable {
        host: String,
        image: String,
        detail: String,
    },
    #[error("timed out waiting for '{name}' to become healthy on {host}")]
    HealthTimeout { host: String, name: String },
    #[error("transport error on {host}: {source}")]
    Transport {
        host: String,
        #[source]
        source: anyhow::Error,
    },
}
