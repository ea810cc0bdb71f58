use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A deployment target, identified by the hostname or address the SSH
/// transport dials. Hosts are plain strings — the only identity the core
/// cares about, matching the container naming discipline in the data model.
pub type Host = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service: String,
    pub image: String,
    #[serde(default)]
    pub destination: Option<String>,
    pub servers: HashMap<String, Vec<Host>>,
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub env: EnvConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    pub port: u16,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub healthcheck: ProxyHealthcheckConfig,
    /// Loopback port the proxy's admin API listens on, reached over SSH.
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    /// Name of the proxy's own container, managed via `ProxyController::boot`/`stop`.
    #[serde(default = "default_proxy_container_name")]
    pub container_name: String,
    /// Image reference used to boot the proxy container itself.
    #[serde(default = "default_proxy_image")]
    pub image: String,
}

fn default_admin_port() -> u16 {
    2019
}
fn default_proxy_container_name() -> String {
    "fleetwright-proxy".to_string()
}
fn default_proxy_image() -> String {
    "caddy:2".to_string()
}

/// Credentials and connection parameters the SSH transport uses to reach
/// every configured host; authentication material itself (key contents)
/// never passes through `Config` — only the path to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            identity_file: None,
            port: None,
        }
    }
}

fn default_ssh_user() -> String {
    "deploy".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyHealthcheckConfig {
    #[serde(default)]
    pub readiness_path: Option<String>,
    #[serde(default)]
    pub liveness_path: Option<String>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub disable_liveness: bool,
}

impl Default for ProxyHealthcheckConfig {
    fn default() -> Self {
        Self {
            readiness_path: None,
            liveness_path: None,
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            disable_liveness: false,
        }
    }
}

fn default_interval_secs() -> u64 {
    5
}
fn default_timeout_secs() -> u64 {
    5
}
fn default_retries() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default)]
    pub readiness_delay_secs: u64,
    #[serde(default)]
    pub deploy_timeout_secs: Option<u64>,
    #[serde(default = "default_retain_history")]
    pub retain_history: i64,
    #[serde(default = "default_retain_containers")]
    pub retain_containers: i64,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub canary: CanaryConfig,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            readiness_delay_secs: 0,
            deploy_timeout_secs: None,
            retain_history: default_retain_history(),
            retain_containers: default_retain_containers(),
            max_parallel: None,
            canary: CanaryConfig::default(),
        }
    }
}

fn default_stop_timeout_secs() -> u64 {
    10
}
fn default_drain_timeout_secs() -> u64 {
    30
}
fn default_retain_history() -> i64 {
    20
}
fn default_retain_containers() -> i64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfig {
    #[serde(default = "default_initial_weight")]
    pub initial_weight: u8,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            initial_weight: default_initial_weight(),
        }
    }
}

fn default_initial_weight() -> u8 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnvConfig {
    #[serde(default)]
    pub secret: Vec<String>,
    #[serde(default)]
    pub clear: HashMap<String, String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let mut config: Config = match toml::from_str(&content) {
            Ok(v) => v,
            Err(err) => anyhow::bail!("Failed to parse TOML configuration: {}", err),
        };

        if let Ok(env_name) = std::env::var("AZUD_ENV") {
            if !env_name.is_empty() {
                let base = path.as_ref();
                let parent = base.parent().unwrap_or_else(|| Path::new("."));
                let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("deploy");
                let overlay_path = parent.join(format!("{}.{}.toml", stem, env_name));
                if overlay_path.exists() {
                    let overlay_content = std::fs::read_to_string(&overlay_path)
                        .with_context(|| format!("Failed to read overlay config file: {:?}", overlay_path))?;
                    let overlay: OverlayConfig = toml::from_str(&overlay_content)
                        .with_context(|| "Failed to parse overlay TOML configuration")?;
                    config.apply_overlay(overlay);
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.is_empty() {
            anyhow::bail!("service name cannot be empty");
        }
        if self.image.is_empty() {
            anyhow::bail!("image cannot be empty");
        }
        if self.servers.is_empty() || self.servers.values().all(|hosts| hosts.is_empty()) {
            anyhow::bail!("at least one server is required under [servers]");
        }
        if self.proxy.host.is_empty() {
            anyhow::bail!("proxy.host cannot be empty");
        }
        if self.port == 0 {
            anyhow::bail!("port must be > 0");
        }
        if self.deploy.canary.initial_weight > 100 {
            anyhow::bail!(
                "deploy.canary.initial_weight must be between 0 and 100, got {}",
                self.deploy.canary.initial_weight
            );
        }
        if let Some(hc) = &self.proxy.healthcheck.readiness_path {
            if !hc.starts_with('/') {
                anyhow::bail!("proxy.healthcheck.readiness_path must start with '/'");
            }
        }
        if let Some(hc) = &self.proxy.healthcheck.liveness_path {
            if !hc.starts_with('/') {
                anyhow::bail!("proxy.healthcheck.liveness_path must start with '/'");
            }
        }
        Ok(())
    }

    /// All configured hosts across every role, in role-then-list order, deduplicated.
    pub fn all_hosts(&self) -> Vec<Host> {
        let mut seen = std::collections::HashSet::new();
        let mut hosts = Vec::new();
        let mut roles: Vec<&String> = self.servers.keys().collect();
        roles.sort();
        for role in roles {
            for host in &self.servers[role] {
                if seen.insert(host.clone()) {
                    hosts.push(host.clone());
                }
            }
        }
        hosts
    }

    fn apply_overlay(&mut self, overlay: OverlayConfig) {
        if let Some(image) = overlay.image {
            self.image = image;
        }
        if let Some(destination) = overlay.destination {
            self.destination = Some(destination);
        }
        if let Some(servers) = overlay.servers {
            for (role, hosts) in servers {
                self.servers.insert(role, hosts);
            }
        }
        if let Some(proxy) = overlay.proxy {
            self.proxy = proxy;
        }
        if let Some(deploy) = overlay.deploy {
            self.deploy = deploy;
        }
        if let Some(env) = overlay.env {
            self.env = env;
        }
        if let Some(ssh) = overlay.ssh {
            self.ssh = ssh;
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OverlayConfig {
    image: Option<String>,
    destination: Option<String>,
    servers: Option<HashMap<String, Vec<Host>>>,
    proxy: Option<ProxyConfig>,
    deploy: Option<DeployConfig>,
    env: Option<EnvConfig>,
    ssh: Option<SshConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_path(filename: &str) -> std::path::PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        std::env::temp_dir().join(format!("fleetwright-config-tests-{now}-{filename}"))
    }

    fn base_config() -> Config {
        Config {
            service: "web".to_string(),
            image: "ex.io/web".to_string(),
            destination: None,
            servers: HashMap::from([("web".to_string(), vec!["h1".to_string()])]),
            proxy: ProxyConfig {
                host: "app.ex".to_string(),
                hosts: Vec::new(),
                tls: false,
                healthcheck: ProxyHealthcheckConfig::default(),
                admin_port: default_admin_port(),
                container_name: default_proxy_container_name(),
                image: default_proxy_image(),
            },
            deploy: DeployConfig::default(),
            env: EnvConfig::default(),
            ssh: SshConfig::default(),
            port: 3000,
            volumes: Vec::new(),
            labels: HashMap::new(),
        }
    }

    #[test]
    fn validate_rejects_empty_service() {
        let mut cfg = base_config();
        cfg.service.clear();
        let err = cfg.validate().expect_err("expected validation error");
        assert!(err.to_string().contains("service name cannot be empty"));
    }

    #[test]
    fn validate_rejects_empty_servers() {
        let mut cfg = base_config();
        cfg.servers.clear();
        let err = cfg.validate().expect_err("expected validation error");
        assert!(err.to_string().contains("at least one server"));
    }

    #[test]
    fn validate_rejects_out_of_range_canary_weight() {
        let mut cfg = base_config();
        cfg.deploy.canary.initial_weight = 150;
        let err = cfg.validate().expect_err("expected validation error");
        assert!(err.to_string().contains("initial_weight"));
    }

    #[test]
    fn validate_rejects_readiness_path_without_leading_slash() {
        let mut cfg = base_config();
        cfg.proxy.healthcheck.readiness_path = Some("health".to_string());
        let err = cfg.validate().expect_err("expected validation error");
        assert!(err.to_string().contains("readiness_path"));
    }

    #[test]
    fn all_hosts_deduplicates_across_roles() {
        let mut cfg = base_config();
        cfg.servers
            .insert("worker".to_string(), vec!["h1".to_string(), "h2".to_string()]);
        let hosts = cfg.all_hosts();
        assert_eq!(hosts.iter().filter(|h| h.as_str() == "h1").count(), 1);
        assert!(hosts.contains(&"h2".to_string()));
    }

    #[test]
    fn load_applies_environment_overlay() {
        let base_path = unique_path("deploy.toml");
        let overlay_path_suffix = base_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap()
            .to_string();
        let overlay_path = base_path
            .parent()
            .unwrap()
            .join(format!("{}.staging.toml", overlay_path_suffix));

        std::fs::write(
            &base_path,
            r#"
service = "web"
image = "ex.io/web"
port = 3000

[servers]
web = ["h1"]

[proxy]
host = "app.ex"
"#,
        )
        .unwrap();
        std::fs::write(&overlay_path, "image = \"ex.io/web\"\ndestination = \"staging\"\n").unwrap();

        std::env::set_var("AZUD_ENV", "staging");
        let loaded = Config::load(&base_path).expect("config should load with overlay");
        std::env::remove_var("AZUD_ENV");

        assert_eq!(loaded.destination.as_deref(), Some("staging"));

        std::fs::remove_file(&base_path).unwrap();
        std::fs::remove_file(&overlay_path).unwrap();
    }
}
