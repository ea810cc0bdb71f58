use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod admin;
pub mod ssh_controller;

pub use ssh_controller::SshProxyController;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    RoundRobin,
    WeightedRoundRobin,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::RoundRobin
    }
}

/// One load-balanced backend in a route. Absent weight reads as 1, per the
/// proxy's own default — `weight: None` and `weight: Some(1)` are
/// observationally equivalent everywhere this crate reads weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    pub dial: String,
    #[serde(default)]
    pub weight: Option<u32>,
}

impl Upstream {
    pub fn effective_weight(&self) -> u32 {
        self.weight.unwrap_or(1)
    }
}

/// A single route as seen (or desired) on the proxy: one routing hostname
/// mapped to a weighted upstream set plus health settings.
///
/// This is the controller's internal working shape, not the admin API's wire
/// shape — `ssh_controller` converts to/from the documented
/// `{match, handle, terminal}` route object at the admin API boundary.
#[derive(Debug, Clone)]
pub struct RouteView {
    pub host_match: Vec<String>,
    pub upstreams: Vec<Upstream>,
    pub policy: SelectionPolicy,
    pub health_path: Option<String>,
    pub health_interval_secs: u64,
    pub health_timeout_secs: u64,
    pub https: bool,
}

/// Input to `RegisterService`: the desired shape of one service's route.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub name: String,
    pub routing_hosts: Vec<String>,
    pub upstreams: Vec<Upstream>,
    pub health_path: Option<String>,
    pub health_interval_secs: u64,
    pub health_timeout_secs: u64,
    pub https: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("admin API transport failure on {host}: {source}")]
    Transport {
        host: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("admin API returned an unexpected shape: {detail}")]
    ShapeMismatch { detail: String },
    #[error("no route matches routing host '{routing_host}'")]
    RouteNotFound { routing_host: String },
}

/// Manages a reverse proxy's live configuration over its loopback admin API,
/// plus the lifecycle of the proxy container itself.
#[async_trait::async_trait]
pub trait ProxyController: Send + Sync {
    async fn register_service(&self, host: &str, service: &ServiceRegistration) -> Result<()>;
    async fn deregister_service(&self, host: &str, routing_host: &str) -> Result<()>;
    async fn add_upstream(&self, host: &str, routing_host: &str, dial: &str) -> Result<()>;
    async fn remove_upstream(&self, host: &str, routing_host: &str, dial: &str) -> Result<()>;
    async fn add_weighted_upstream(
        &self,
        host: &str,
        routing_host: &str,
        dial: &str,
        weight: u32,
    ) -> Result<()>;
    async fn set_upstream_weight(
        &self,
        host: &str,
        routing_host: &str,
        dial: &str,
        weight: u32,
    ) -> Result<()>;
    async fn get_upstream_weights(
        &self,
        host: &str,
        routing_host: &str,
    ) -> Result<Vec<Upstream>>;
    async fn drain_upstream(&self, host: &str, dial: &str, timeout_secs: u64) -> Result<()>;

    async fn boot(&self, host: &str) -> Result<()>;
    async fn stop(&self, host: &str) -> Result<()>;
    async fn reboot(&self, host: &str) -> Result<()>;
    async fn remove(&self, host: &str) -> Result<()>;
    async fn status(&self, host: &str) -> Result<bool>;
    async fn logs(&self, host: &str) -> Result<String>;
}
