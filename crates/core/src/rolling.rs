use crate::history::{DeploymentRecord, DeploymentStatus, HistoryStore};
use anyhow::{Context, Result};
use fleetwright_config::Config;
use fleetwright_container::{ContainerDriver, RunConfig};
use fleetwright_proxy::{ProxyController, ServiceRegistration, Upstream};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub version: Option<String>,
    pub skip_pull: bool,
    pub hosts: Option<Vec<String>>,
    pub roles: Option<Vec<String>>,
    pub previous_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostStage {
    Idle,
    Pulling,
    Creating,
    HealthWaiting,
    ProxyUpdating,
    Draining,
    Removing,
    Renamed,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HostOutcome {
    pub host: String,
    pub stage: HostStage,
    pub finalized_non_canonical: bool,
}

pub struct DeployReport {
    pub record: DeploymentRecord,
    pub host_outcomes: Vec<HostOutcome>,
    pub failures: HashMap<String, anyhow::Error>,
}

impl DeployReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Replaces a service on each target host one container at a time,
/// maintaining availability: the new container is health-checked and
/// registered with the proxy before the old one is drained and removed.
pub struct RollingDeployer<C: ContainerDriver + 'static, P: ProxyController + 'static> {
    containers: Arc<C>,
    proxy: Arc<P>,
    secrets_precondition: Option<Arc<dyn fleetwright_ssh::SshTransport>>,
    ssh_user: String,
}

impl<C: ContainerDriver + 'static, P: ProxyController + 'static> RollingDeployer<C, P> {
    pub fn new(containers: Arc<C>, proxy: Arc<P>) -> Self {
        Self {
            containers,
            proxy,
            secrets_precondition: None,
            ssh_user: "deploy".to_string(),
        }
    }

    /// Enables the `env.secret` precondition check: before any side effect,
    /// verify the remote secrets file exists on every target host.
    pub fn with_secrets_precondition(
        mut self,
        transport: Arc<dyn fleetwright_ssh::SshTransport>,
        ssh_user: impl Into<String>,
    ) -> Self {
        self.secrets_precondition = Some(transport);
        self.ssh_user = ssh_user.into();
        self
    }

    fn remote_secrets_path(&self, config: &Config) -> String {
        format!("/etc/fleetwright/{}.env", config.service)
    }

    async fn check_secrets_present(&self, config: &Config, hosts: &[String]) -> Result<()> {
        if config.env.secret.is_empty() {
            return Ok(());
        }
        let Some(transport) = &self.secrets_precondition else {
            return Ok(());
        };
        let path = self.remote_secrets_path(config);
        for host in hosts {
            let target = fleetwright_ssh::SshTarget::new(host.clone(), self.ssh_user.clone());
            let script = format!("test -r {}", fleetwright_ssh::shell_quote(&path));
            let result = transport
                .execute(&target, &script)
                .await
                .with_context(|| format!("failed to verify secrets file on {host}"))?;
            if !result.success() {
                anyhow::bail!(
                    "required secrets file '{}' is missing or unreadable on {}",
                    path,
                    host
                );
            }
        }
        Ok(())
    }

    fn target_hosts(&self, config: &Config, opts: &DeployOptions) -> Vec<String> {
        if let Some(hosts) = &opts.hosts {
            return hosts.clone();
        }
        if let Some(roles) = &opts.roles {
            let wanted: HashSet<&str> = roles.iter().map(|r| r.as_str()).collect();
            let mut hosts = Vec::new();
            let mut seen = HashSet::new();
            let mut role_names: Vec<&String> = config.servers.keys().collect();
            role_names.sort();
            for role in role_names {
                if wanted.contains(role.as_str()) {
                    for host in &config.servers[role] {
                        if seen.insert(host.clone()) {
                            hosts.push(host.clone());
                        }
                    }
                }
            }
            return hosts;
        }
        config.all_hosts()
    }

    fn image_ref(&self, config: &Config, version: &str) -> String {
        match &config.destination {
            Some(dest) if !dest.is_empty() => format!("{}:{}-{}", config.image, version, dest),
            _ => format!("{}:{}", config.image, version),
        }
    }

    pub async fn deploy(
        &self,
        config: &Config,
        opts: DeployOptions,
        history: &mut HistoryStore,
    ) -> Result<DeployReport> {
        let hosts = self.target_hosts(config, &opts);
        if hosts.is_empty() {
            anyhow::bail!("deploy requires a non-empty host set");
        }
        self.check_secrets_present(config, &hosts).await?;

        let version = opts.version.clone().unwrap_or_else(|| "latest".to_string());
        let image = self.image_ref(config, &version);

        let mut record = DeploymentRecord::start(
            history.next_id(),
            config.service.clone(),
            image.clone(),
            version.clone(),
            config.destination.clone().unwrap_or_default(),
            hosts.clone(),
        );
        if let Some(previous) = &opts.previous_version {
            record.previous_version = previous.clone();
        }

        let semaphore = config
            .deploy
            .max_parallel
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let mut tasks = Vec::new();
        for host in hosts.clone() {
            let containers = Arc::clone(&self.containers);
            let proxy = Arc::clone(&self.proxy);
            let config = config.clone();
            let image = image.clone();
            let skip_pull = opts.skip_pull;
            let semaphore = semaphore.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = match &semaphore {
                    Some(sem) => Some(Arc::clone(sem).acquire_owned().await),
                    None => None,
                };
                let outcome =
                    deploy_one_host(&*containers, &*proxy, &config, &host, &image, skip_pull).await;
                (host, outcome)
            }));
        }

        let mut host_outcomes = Vec::new();
        let mut failures = HashMap::new();
        for task in tasks {
            let (host, outcome) = task.await.context("deploy task panicked")?;
            match outcome {
                Ok(host_outcome) => host_outcomes.push(host_outcome),
                Err(err) => {
                    warn!(host, %err, "rolling deploy failed on host");
                    failures.insert(host, err);
                }
            }
        }

        record.finish(if failures.is_empty() {
            DeploymentStatus::Success
        } else {
            DeploymentStatus::Failed
        });
        history.append(record.clone())?;

        Ok(DeployReport {
            record,
            host_outcomes,
            failures,
        })
    }

    pub async fn redeploy(
        &self,
        config: &Config,
        history: &mut HistoryStore,
    ) -> Result<DeployReport> {
        let previous = history
            .last_successful()
            .map(|r| r.version.clone())
            .context("no previous successful deployment to redeploy")?;
        self.deploy(
            config,
            DeployOptions {
                version: Some(previous),
                skip_pull: true,
                ..Default::default()
            },
            history,
        )
        .await
    }

    pub async fn rollback(
        &self,
        config: &Config,
        version: String,
        history: &mut HistoryStore,
    ) -> Result<DeployReport> {
        let previous = history
            .last_successful()
            .map(|r| r.version.clone())
            .unwrap_or_default();
        self.deploy(
            config,
            DeployOptions {
                version: Some(version),
                skip_pull: false,
                previous_version: Some(previous),
                ..Default::default()
            },
            history,
        )
        .await
    }

    pub async fn start(&self, config: &Config, hosts: Option<Vec<String>>) -> Result<()> {
        let targets = hosts.unwrap_or_else(|| config.all_hosts());
        for host in targets {
            self.containers.run(&host, &self.existing_run_config(config)).await.ok();
        }
        Ok(())
    }

    pub async fn stop(&self, config: &Config, hosts: Option<Vec<String>>) -> Result<()> {
        let targets = hosts.unwrap_or_else(|| config.all_hosts());
        for host in targets {
            self.containers
                .stop(&host, &config.service, config.deploy.stop_timeout_secs)
                .await?;
        }
        Ok(())
    }

    pub async fn restart(&self, config: &Config, hosts: Option<Vec<String>>) -> Result<()> {
        self.stop(config, hosts.clone()).await?;
        self.start(config, hosts).await
    }

    fn existing_run_config(&self, config: &Config) -> RunConfig {
        RunConfig {
            name: config.service.clone(),
            image: config.image.clone(),
            ports: vec![config.port],
            network: Some("azud".to_string()),
            restart_policy: "always".to_string(),
            env: config.env.clear.clone(),
            volumes: config.volumes.clone(),
            labels: config.labels.clone(),
            readiness_path: config.proxy.healthcheck.readiness_path.clone(),
            app_port: config.port,
            disable_healthcheck: config.proxy.healthcheck.disable_liveness,
        }
    }
}

async fn deploy_one_host<C: ContainerDriver, P: ProxyController>(
    containers: &C,
    proxy: &P,
    config: &Config,
    host: &str,
    image: &str,
    skip_pull: bool,
) -> Result<HostOutcome> {
    let primary_name = config.service.clone();

    // Step 1: pull.
    if !skip_pull {
        containers
            .pull(host, image)
            .await
            .with_context(|| format!("image pull failed on {host}"))?;
    }

    // Step 2: compute new container name.
    let existing = containers
        .exists(host, &primary_name)
        .await
        .with_context(|| format!("failed to check for existing container on {host}"))?;
    let new_name = if existing {
        format!("{primary_name}-new-{}", short_id())
    } else {
        primary_name.clone()
    };

    // Step 3: create container.
    let run_config = RunConfig {
        name: new_name.clone(),
        image: image.to_string(),
        ports: vec![config.port],
        network: Some("azud".to_string()),
        restart_policy: "always".to_string(),
        env: config.env.clear.clone(),
        volumes: config.volumes.clone(),
        labels: [
            ("azud.managed".to_string(), "true".to_string()),
            ("azud.service".to_string(), config.service.clone()),
        ]
        .into_iter()
        .chain(config.labels.clone())
        .collect(),
        readiness_path: config.proxy.healthcheck.readiness_path.clone(),
        app_port: config.port,
        disable_healthcheck: config.proxy.healthcheck.disable_liveness,
    };

    let create_result = containers.run(host, &run_config).await;
    if let Err(err) = create_result {
        return Err(err.context(format!("failed to create container on {host}")));
    }

    // Step 4: wait for healthy.
    let deploy_timeout = config.deploy.deploy_timeout_secs.unwrap_or(60);
    if config.deploy.readiness_delay_secs > 0 {
        tokio::time::sleep(tokio::time::Duration::from_secs(
            config.deploy.readiness_delay_secs,
        ))
        .await;
    }
    let healthy = containers
        .wait_healthy(host, &new_name, deploy_timeout)
        .await
        .with_context(|| format!("health check errored on {host}"))?;
    if !healthy {
        let _ = containers.stop(host, &new_name, config.deploy.stop_timeout_secs).await;
        let _ = containers.remove(host, &new_name, true).await;
        anyhow::bail!("new container '{new_name}' failed to become healthy on {host}");
    }

    // Step 5: register with proxy.
    let registration = ServiceRegistration {
        name: config.service.clone(),
        routing_hosts: {
            let mut hosts = vec![config.proxy.host.clone()];
            hosts.extend(config.proxy.hosts.clone());
            hosts
        },
        upstreams: vec![Upstream {
            dial: format!("{new_name}:{}", config.port),
            weight: None,
        }],
        health_path: config.proxy.healthcheck.readiness_path.clone(),
        health_interval_secs: config.proxy.healthcheck.interval_secs,
        health_timeout_secs: config.proxy.healthcheck.timeout_secs,
        https: config.proxy.tls,
    };
    proxy
        .register_service(host, &registration)
        .await
        .with_context(|| format!("failed to register service with proxy on {host}"))?;

    // Step 6 & 7: drain and remove the old container, if one existed under
    // the canonical name (distinct from the transient name we just created).
    if existing && new_name != primary_name {
        let old_dial = format!("{primary_name}:{}", config.port);
        proxy
            .drain_upstream(host, &old_dial, config.deploy.drain_timeout_secs)
            .await
            .with_context(|| format!("drain failed on {host}"))?;
        containers
            .stop(host, &primary_name, config.deploy.stop_timeout_secs)
            .await
            .with_context(|| format!("failed to stop old container on {host}"))?;
        containers
            .remove(host, &primary_name, true)
            .await
            .with_context(|| format!("failed to remove old container on {host}"))?;
    }

    // Step 8: rename new -> primary.
    let mut finalized_non_canonical = false;
    if new_name != primary_name {
        if let Err(err) = containers.rename(host, &new_name, &primary_name).await {
            warn!(host, %err, "rename to canonical name failed, route stays on transient name");
            finalized_non_canonical = true;
        }
    }

    Ok(HostOutcome {
        host: host.to_string(),
        stage: HostStage::Renamed,
        finalized_non_canonical,
    })
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwright_container::ssh::SshContainerDriver;
    use fleetwright_proxy::SshProxyController;
    use fleetwright_proxy::admin::AdminClient;
    use fleetwright_ssh::{testing::FakeTransport, ExecResult};
    use std::collections::HashMap as Map;

    fn base_config() -> Config {
        Config {
            service: "web".to_string(),
            image: "ex.io/web".to_string(),
            destination: None,
            servers: Map::from([("web".to_string(), vec!["h1".to_string()])]),
            proxy: fleetwright_config::ProxyConfig {
                host: "app.ex".to_string(),
                hosts: Vec::new(),
                tls: false,
                healthcheck: fleetwright_config::ProxyHealthcheckConfig::default(),
                admin_port: 2019,
                container_name: "fleetwright-proxy".to_string(),
                image: "caddy:2".to_string(),
            },
            deploy: fleetwright_config::DeployConfig::default(),
            env: fleetwright_config::EnvConfig::default(),
            ssh: fleetwright_config::SshConfig::default(),
            port: 3000,
            volumes: Vec::new(),
            labels: Map::new(),
        }
    }

    fn ok_transport() -> Arc<FakeTransport> {
        Arc::new(FakeTransport::new(vec![Ok(ExecResult {
            stdout: "200[]".to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        })]))
    }

    #[test]
    fn target_hosts_defaults_to_all_configured_hosts() {
        let containers = Arc::new(SshContainerDriver::new(ok_transport(), "deploy", None));
        let admin = AdminClient::new(ok_transport(), "deploy", None, 2019);
        let proxy = Arc::new(SshProxyController::new(
            admin,
            containers.clone(),
            "fleetwright-proxy",
            "caddy:2",
        ));
        let deployer = RollingDeployer::new(containers, proxy);
        let config = base_config();
        let hosts = deployer.target_hosts(&config, &DeployOptions::default());
        assert_eq!(hosts, vec!["h1".to_string()]);
    }

    #[test]
    fn image_ref_appends_destination_suffix_when_present() {
        let containers = Arc::new(SshContainerDriver::new(ok_transport(), "deploy", None));
        let admin = AdminClient::new(ok_transport(), "deploy", None, 2019);
        let proxy = Arc::new(SshProxyController::new(
            admin,
            containers.clone(),
            "fleetwright-proxy",
            "caddy:2",
        ));
        let deployer = RollingDeployer::new(containers, proxy);
        let mut config = base_config();
        config.destination = Some("staging".to_string());
        assert_eq!(deployer.image_ref(&config, "v1"), "ex.io/web:v1-staging");
    }
}
