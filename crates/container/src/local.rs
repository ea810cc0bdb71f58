use crate::{
    ContainerDriver, ContainerInfo, ContainerStatus, ExecConfig, ExecOutput, ListFilters,
    LogsConfig, PortMapping, RunConfig, StdStreams,
};
use anyhow::{Context, Result};
use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, HostConfig, PortBinding};
use bollard::Docker;
use std::collections::HashMap;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Single-host driver talking to the local Docker daemon directly, used in
/// local-deploy mode where there is no remote host to SSH into.
pub struct LocalBollardDriver {
    docker: Docker,
}

impl LocalBollardDriver {
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_socket_defaults().context("failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    fn convert_status(state: &str) -> ContainerStatus {
        match state {
            "created" => ContainerStatus::Creating,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }

    fn convert_container(summary: ContainerSummary) -> ContainerInfo {
        let ports = summary
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|port| PortMapping {
                container_port: port.private_port,
                host_port: port.public_port,
                protocol: port
                    .typ
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "tcp".to_string()),
            })
            .collect();

        ContainerInfo {
            id: summary.id.unwrap_or_default(),
            name: summary
                .names
                .unwrap_or_default()
                .first()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: summary.image.unwrap_or_default(),
            status: Self::convert_status(&summary.state.unwrap_or_default()),
            ports,
        }
    }
}

#[async_trait::async_trait]
impl ContainerDriver for LocalBollardDriver {
    async fn pull(&self, _host: &str, image: &str) -> Result<()> {
        info!(image, "pulling image via local daemon");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(msg) = stream.next().await {
            msg.with_context(|| format!("failed to pull image {image}"))?;
        }
        Ok(())
    }

    async fn run(&self, _host: &str, config: &RunConfig) -> Result<String> {
        let _ = self
            .docker
            .remove_container(
                &config.name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        let mut port_bindings = HashMap::new();
        for port in &config.ports {
            port_bindings.insert(
                format!("{port}/tcp"),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: config.network.clone(),
            binds: Some(config.volumes.clone()),
            restart_policy: Some({
                use bollard::models::RestartPolicyNameEnum;
                let name = match config.restart_policy.as_str() {
                    "always" => RestartPolicyNameEnum::ALWAYS,
                    "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
                    "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
                    _ => RestartPolicyNameEnum::NO,
                };
                bollard::models::RestartPolicy {
                    name: Some(name),
                    maximum_retry_count: None,
                }
            }),
            ..Default::default()
        };

        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let labels: HashMap<String, String> = config.labels.clone();

        let bollard_config = BollardConfig {
            image: Some(config.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(
                config
                    .ports
                    .iter()
                    .map(|port| (format!("{port}/tcp"), HashMap::new()))
                    .collect(),
            ),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), bollard_config)
            .await
            .context("failed to create container")?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .context("failed to start container")?;

        info!(name = %config.name, id = %created.id, "started container via local daemon");
        Ok(created.id)
    }

    async fn stop(&self, _host: &str, name: &str, timeout_secs: u64) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };
        self.docker
            .stop_container(name, Some(options))
            .await
            .with_context(|| format!("failed to stop container {name}"))
    }

    async fn remove(&self, _host: &str, name: &str, force: bool) -> Result<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("failed to remove container {name}"))
    }

    async fn rename(&self, _host: &str, from: &str, to: &str) -> Result<()> {
        self.docker
            .rename_container(from, bollard::container::RenameContainerOptions { name: to })
            .await
            .with_context(|| format!("failed to rename container {from} to {to}"))
    }

    async fn is_running(&self, host: &str, name: &str) -> Result<bool> {
        match self.get_container(host, name).await {
            Ok(info) => Ok(info.status.is_running()),
            Err(_) => Ok(false),
        }
    }

    async fn exists(&self, host: &str, name: &str) -> Result<bool> {
        Ok(self.get_container(host, name).await.is_ok())
    }

    async fn wait_healthy(&self, host: &str, name: &str, timeout_secs: u64) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(timeout_secs);
        loop {
            if let Ok(info) = self.get_container(host, name).await {
                if info.status.is_running() {
                    return Ok(true);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
        }
    }

    async fn logs(&self, _host: &str, name: &str, config: &LogsConfig) -> Result<StdStreams> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: config
                .tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            since: config
                .since
                .as_ref()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0),
            ..Default::default()
        };

        let mut stream = self.docker.logs(name, Some(options));
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(output) => stdout.push_str(&output.to_string()),
                Err(err) => {
                    warn!(%err, "error reading logs");
                    stderr.push_str(&err.to_string());
                    break;
                }
            }
        }
        Ok(StdStreams { stdout, stderr })
    }

    async fn exec(&self, _host: &str, name: &str, config: &ExecConfig) -> Result<ExecOutput> {
        let exec_options = CreateExecOptions {
            cmd: Some(config.command.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(name, exec_options)
            .await
            .context("failed to create exec")?;
        let started = self.docker.start_exec(&exec.id, None).await?;

        let mut stdout = String::new();
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(chunk) => stdout.push_str(&chunk.to_string()),
                    Err(err) => {
                        warn!(%err, "error reading exec output");
                        break;
                    }
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("failed to inspect exec result")?;

        Ok(ExecOutput {
            stdout,
            stderr: String::new(),
            exit_code: inspect.exit_code.map(|c| c as i32),
        })
    }

    async fn stats(&self, host: &str, name: &str) -> Result<String> {
        debug!(host, name, "stats not supported by local bollard driver");
        Ok(String::new())
    }

    async fn list(&self, _host: &str, filters: &ListFilters) -> Result<Vec<ContainerInfo>> {
        let mut filter_map: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(prefix) = &filters.name_prefix {
            filter_map.insert("name".to_string(), vec![prefix.clone()]);
        }
        if let Some((key, value)) = &filters.label {
            filter_map.insert("label".to_string(), vec![format!("{key}={value}")]);
        }
        let options = ListContainersOptions::<String> {
            all: true,
            filters: filter_map,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("failed to list containers")?;
        Ok(containers.into_iter().map(Self::convert_container).collect())
    }
}

impl LocalBollardDriver {
    async fn get_container(&self, host: &str, name: &str) -> Result<ContainerInfo> {
        let containers = self.list(host, &ListFilters::default()).await?;
        containers
            .into_iter()
            .find(|c| c.name == name)
            .with_context(|| format!("container not found: {name}"))
    }
}
