use crate::canary_state::{state_path_for, CanaryState, CanaryStatus};
use crate::history::{DeploymentRecord, DeploymentStatus, HistoryStore};
use anyhow::{Context, Result};
use fleetwright_config::Config;
use fleetwright_container::{ContainerDriver, RunConfig};
use fleetwright_proxy::{ProxyController, Upstream};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct CanaryDeployOptions {
    pub version: String,
    pub weight: Option<u8>,
}

pub struct CanaryReport {
    pub state: CanaryState,
    pub failures: HashMap<String, anyhow::Error>,
}

impl CanaryReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs a new version alongside the stable one, splitting traffic by weight
/// until the operator promotes or rolls back. State is persisted after every
/// mutation since operator commands arrive in separate process lifetimes.
pub struct CanaryDeployer<C: ContainerDriver + 'static, P: ProxyController + 'static> {
    containers: Arc<C>,
    proxy: Arc<P>,
    state_path: PathBuf,
}

impl<C: ContainerDriver + 'static, P: ProxyController + 'static> CanaryDeployer<C, P> {
    pub fn new(containers: Arc<C>, proxy: Arc<P>, repo_root: impl Into<PathBuf>) -> Self {
        Self {
            containers,
            proxy,
            state_path: PathBuf::new().join(repo_root.into()),
        }
    }

    fn path_for(&self, service: &str) -> PathBuf {
        state_path_for(&self.state_path, service)
    }

    pub fn status(&self, service: &str) -> Result<CanaryState> {
        CanaryState::load(self.path_for(service), service)
    }

    fn canary_name(service: &str) -> String {
        format!("{service}-canary")
    }

    pub async fn deploy(
        &self,
        config: &Config,
        opts: CanaryDeployOptions,
        history: &mut HistoryStore,
    ) -> Result<CanaryReport> {
        let path = self.path_for(&config.service);
        let existing = CanaryState::load(&path, &config.service)?;
        if existing.status != CanaryStatus::None {
            anyhow::bail!("canary already in progress");
        }

        let weight = opts.weight.unwrap_or(config.deploy.canary.initial_weight);
        if weight > 100 {
            anyhow::bail!("canary weight must be between 0 and 100, got {weight}");
        }

        let hosts = config.all_hosts();
        let canary_name = Self::canary_name(&config.service);
        let image = format!("{}:{}", config.image, opts.version);

        let mut state = CanaryState::none(&config.service);
        state.stable_version = history
            .last_successful()
            .map(|r| r.version.clone())
            .unwrap_or_default();
        state.canary_version = opts.version.clone();
        state.hosts = hosts.clone();
        state.canary_container_name = canary_name.clone();
        state.stable_container_name = config.service.clone();
        state.transition(CanaryStatus::Deploying);
        state.save(&path)?;

        let mut failures = HashMap::new();
        let mut deployed_hosts = Vec::new();

        for host in &hosts {
            if let Err(err) = self
                .deploy_one_host(config, host, &canary_name, &image)
                .await
            {
                warn!(host, %err, "canary deploy failed on host, cleaning up partial container");
                let _ = self.containers.stop(host, &canary_name, 5).await;
                let _ = self.containers.remove(host, &canary_name, true).await;
                failures.insert(host.clone(), err);
            } else {
                deployed_hosts.push(host.clone());
            }
        }

        if !failures.is_empty() {
            for host in &deployed_hosts {
                let _ = self.containers.stop(host, &canary_name, 5).await;
                let _ = self.containers.remove(host, &canary_name, true).await;
            }
            let reset = CanaryState::none(&config.service);
            reset.save(&path)?;
            return Ok(CanaryReport {
                state: reset,
                failures,
            });
        }

        for host in &hosts {
            self.proxy
                .set_upstream_weight(
                    host,
                    &config.proxy.host,
                    &format!("{}:{}", config.service, config.port),
                    (100 - weight) as u32,
                )
                .await
                .with_context(|| format!("failed to set stable weight on {host}"))?;
            self.proxy
                .add_weighted_upstream(
                    host,
                    &config.proxy.host,
                    &format!("{canary_name}:{}", config.port),
                    weight as u32,
                )
                .await
                .with_context(|| format!("failed to add canary upstream on {host}"))?;
        }

        state.current_weight = weight;
        state.target_weight = weight;
        state.transition(CanaryStatus::Running);
        state.save(&path)?;

        let mut record = DeploymentRecord::start(
            history.next_id(),
            config.service.clone(),
            image,
            opts.version,
            config.destination.clone().unwrap_or_default(),
            hosts,
        );
        record.metadata.insert("type".to_string(), "canary_deployed".to_string());
        record.metadata.insert("weight".to_string(), weight.to_string());
        record.finish(DeploymentStatus::Success);
        history.append(record)?;

        Ok(CanaryReport {
            state,
            failures: HashMap::new(),
        })
    }

    async fn deploy_one_host(
        &self,
        config: &Config,
        host: &str,
        canary_name: &str,
        image: &str,
    ) -> Result<()> {
        self.containers.pull(host, image).await?;

        let run_config = RunConfig {
            name: canary_name.to_string(),
            image: image.to_string(),
            ports: vec![config.port],
            network: Some("azud".to_string()),
            restart_policy: "always".to_string(),
            env: config.env.clear.clone(),
            volumes: config.volumes.clone(),
            labels: [
                ("azud.managed".to_string(), "true".to_string()),
                ("azud.service".to_string(), config.service.clone()),
                ("azud.canary".to_string(), "true".to_string()),
            ]
            .into(),
            readiness_path: config.proxy.healthcheck.readiness_path.clone(),
            app_port: config.port,
            disable_healthcheck: config.proxy.healthcheck.disable_liveness,
        };
        self.containers.run(host, &run_config).await?;

        let deploy_timeout = config.deploy.deploy_timeout_secs.unwrap_or(60);
        let healthy = self
            .containers
            .wait_healthy(host, canary_name, deploy_timeout)
            .await?;
        if !healthy {
            anyhow::bail!("canary container failed health check on {host}");
        }
        Ok(())
    }

    pub fn set_weight_precondition(weight: u8) -> Result<()> {
        if weight > 100 {
            anyhow::bail!("canary weight must be between 0 and 100, got {weight}");
        }
        Ok(())
    }

    pub async fn set_weight(&self, config: &Config, weight: u8) -> Result<CanaryState> {
        Self::set_weight_precondition(weight)?;

        let path = self.path_for(&config.service);
        let mut state = CanaryState::load(&path, &config.service)?;
        if state.status != CanaryStatus::Running {
            anyhow::bail!("no canary deployment is running");
        }

        for host in &state.hosts {
            self.proxy
                .set_upstream_weight(
                    host,
                    &config.proxy.host,
                    &format!("{}:{}", config.service, config.port),
                    (100 - weight) as u32,
                )
                .await?;
            self.proxy
                .set_upstream_weight(
                    host,
                    &config.proxy.host,
                    &format!("{}:{}", state.canary_container_name, config.port),
                    weight as u32,
                )
                .await?;
        }

        state.set_weight(weight);
        state.target_weight = weight;
        state.save(&path)?;
        Ok(state)
    }

    pub async fn promote(
        &self,
        config: &Config,
        history: &mut HistoryStore,
    ) -> Result<CanaryReport> {
        let path = self.path_for(&config.service);
        let mut state = CanaryState::load(&path, &config.service)?;
        if state.status == CanaryStatus::None {
            anyhow::bail!("no canary deployment to promote");
        }
        state.transition(CanaryStatus::Promoting);
        state.save(&path)?;

        let mut failures = HashMap::new();
        for host in &state.hosts {
            if let Err(err) = self.promote_one_host(config, host, &state).await {
                failures.insert(host.clone(), err);
            }
        }

        if !failures.is_empty() {
            return Ok(CanaryReport { state, failures });
        }

        let mut record = DeploymentRecord::start(
            history.next_id(),
            config.service.clone(),
            format!("{}:{}", config.image, state.canary_version),
            state.canary_version.clone(),
            config.destination.clone().unwrap_or_default(),
            state.hosts.clone(),
        );
        record.metadata.insert("type".to_string(), "canary_promoted".to_string());
        record.finish(DeploymentStatus::Success);
        history.append(record)?;

        let reset = CanaryState::none(&config.service);
        reset.save(&path)?;
        Ok(CanaryReport {
            state: reset,
            failures: HashMap::new(),
        })
    }

    async fn promote_one_host(&self, config: &Config, host: &str, state: &CanaryState) -> Result<()> {
        let stable_dial = format!("{}:{}", state.stable_container_name, config.port);
        let canary_dial = format!("{}:{}", state.canary_container_name, config.port);

        self.proxy
            .set_upstream_weight(host, &config.proxy.host, &canary_dial, 100)
            .await?;
        self.proxy
            .remove_upstream(host, &config.proxy.host, &stable_dial)
            .await?;
        self.proxy
            .drain_upstream(host, &stable_dial, config.deploy.drain_timeout_secs)
            .await?;

        self.containers
            .stop(host, &state.stable_container_name, config.deploy.stop_timeout_secs)
            .await?;
        self.containers
            .remove(host, &state.stable_container_name, true)
            .await?;
        self.containers
            .rename(host, &state.canary_container_name, &config.service)
            .await?;

        self.proxy
            .register_service(
                host,
                &fleetwright_proxy::ServiceRegistration {
                    name: config.service.clone(),
                    routing_hosts: vec![config.proxy.host.clone()],
                    upstreams: vec![Upstream {
                        dial: format!("{}:{}", config.service, config.port),
                        weight: None,
                    }],
                    health_path: config.proxy.healthcheck.readiness_path.clone(),
                    health_interval_secs: config.proxy.healthcheck.interval_secs,
                    health_timeout_secs: config.proxy.healthcheck.timeout_secs,
                    https: config.proxy.tls,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn rollback(
        &self,
        config: &Config,
        history: &mut HistoryStore,
    ) -> Result<CanaryReport> {
        let path = self.path_for(&config.service);
        let mut state = CanaryState::load(&path, &config.service)?;
        if state.status == CanaryStatus::None {
            anyhow::bail!("no canary deployment to roll back");
        }
        state.transition(CanaryStatus::RollingBack);
        state.save(&path)?;

        let mut failures = HashMap::new();
        for host in &state.hosts {
            let result: Result<()> = async {
                let canary_dial = format!("{}:{}", state.canary_container_name, config.port);
                self.proxy
                    .set_upstream_weight(
                        host,
                        &config.proxy.host,
                        &format!("{}:{}", config.service, config.port),
                        100,
                    )
                    .await?;
                self.proxy
                    .remove_upstream(host, &config.proxy.host, &canary_dial)
                    .await?;
                self.proxy
                    .drain_upstream(host, &canary_dial, config.deploy.drain_timeout_secs)
                    .await?;
                self.containers
                    .stop(host, &state.canary_container_name, config.deploy.stop_timeout_secs)
                    .await?;
                self.containers
                    .remove(host, &state.canary_container_name, true)
                    .await?;
                Ok(())
            }
            .await;
            if let Err(err) = result {
                failures.insert(host.clone(), err);
            }
        }

        if !failures.is_empty() {
            return Ok(CanaryReport { state, failures });
        }

        let mut record = DeploymentRecord::start(
            history.next_id(),
            config.service.clone(),
            format!("{}:{}", config.image, state.stable_version),
            state.stable_version.clone(),
            config.destination.clone().unwrap_or_default(),
            state.hosts.clone(),
        );
        record.previous_version = state.stable_version.clone();
        record.metadata.insert("type".to_string(), "canary_rollback".to_string());
        record.metadata.insert("rolled_back".to_string(), "true".to_string());
        record.finish(DeploymentStatus::Success);
        history.append(record)?;

        let reset = CanaryState::none(&config.service);
        reset.save(&path)?;
        Ok(CanaryReport {
            state: reset,
            failures: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_weight_precondition_rejects_out_of_range() {
        let err = CanaryDeployer::<
            fleetwright_container::ssh::SshContainerDriver<fleetwright_ssh::testing::FakeTransport>,
            fleetwright_proxy::SshProxyController<
                fleetwright_ssh::testing::FakeTransport,
                fleetwright_container::ssh::SshContainerDriver<fleetwright_ssh::testing::FakeTransport>,
            >,
        >::set_weight_precondition(101)
        .expect_err("expected precondition error");
        assert!(err.to_string().contains("between 0 and 100"));
    }

    #[test]
    fn set_weight_precondition_accepts_boundary_values() {
        assert!(CanaryDeployer::<
            fleetwright_container::ssh::SshContainerDriver<fleetwright_ssh::testing::FakeTransport>,
            fleetwright_proxy::SshProxyController<
                fleetwright_ssh::testing::FakeTransport,
                fleetwright_container::ssh::SshContainerDriver<fleetwright_ssh::testing::FakeTransport>,
            >,
        >::set_weight_precondition(100)
        .is_ok());
    }
}
