use crate::{
    ContainerInfo, ContainerStatus, ExecConfig, ExecOutput, ListFilters, LogsConfig, PortMapping,
    RunConfig, StdStreams,
};
use anyhow::{Context, Result};
use fleetwright_ssh::{shell_quote, SshTarget, SshTransport};
use std::sync::Arc;
use tracing::{debug, info};

/// Drives the Docker CLI on a remote host over an SSH transport. Every
/// operation is a single `docker ...` invocation wrapped in `sh -c`, the
/// same script-per-call idiom the rest of this stack's remote execution
/// helpers use.
pub struct SshContainerDriver<T: SshTransport> {
    transport: Arc<T>,
    user: String,
    identity_file: Option<String>,
    port: Option<u16>,
}

impl<T: SshTransport> SshContainerDriver<T> {
    pub fn new(transport: Arc<T>, user: impl Into<String>, identity_file: Option<String>) -> Self {
        Self {
            transport,
            user: user.into(),
            identity_file,
            port: None,
        }
    }

    /// Overrides the SSH port used to reach every host, for deployments
    /// whose hosts listen on a non-default port.
    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    fn target(&self, host: &str) -> SshTarget {
        let mut target = SshTarget::new(host, &self.user);
        if let Some(identity) = &self.identity_file {
            target = target.with_identity(identity.clone());
        }
        target.port = self.port;
        target
    }

    async fn run_script(&self, host: &str, script: &str) -> Result<fleetwright_ssh::ExecResult> {
        debug!(host, script, "running container driver script");
        self.transport
            .execute(&self.target(host), script)
            .await
            .with_context(|| format!("ssh transport failure on {host}"))
    }
}

#[async_trait::async_trait]
impl<T: SshTransport> crate::ContainerDriver for SshContainerDriver<T> {
    async fn pull(&self, host: &str, image: &str) -> Result<()> {
        let script = format!(
            "docker image inspect {img} >/dev/null 2>&1 || docker pull {img}",
            img = shell_quote(image)
        );
        let result = self.run_script(host, &script).await?;
        if !result.success() {
            anyhow::bail!(
                "image preflight failed for '{}' on {}: {}",
                image,
                host,
                result.summarize_failure()
            );
        }
        Ok(())
    }

    async fn run(&self, host: &str, config: &RunConfig) -> Result<String> {
        let mut parts = vec![
            "docker".to_string(),
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            shell_quote(&config.name),
            "--restart".to_string(),
            config.restart_policy.clone(),
        ];

        if let Some(network) = &config.network {
            parts.push("--network".to_string());
            parts.push(shell_quote(network));
        }

        for port in &config.ports {
            parts.push("-p".to_string());
            parts.push(format!("{port}:{port}"));
        }

        for (key, value) in &config.env {
            parts.push("-e".to_string());
            parts.push(shell_quote(&format!("{key}={value}")));
        }

        for volume in &config.volumes {
            parts.push("-v".to_string());
            parts.push(shell_quote(volume));
        }

        for (key, value) in &config.labels {
            parts.push("-l".to_string());
            parts.push(shell_quote(&format!("{key}={value}")));
        }

        if !config.disable_healthcheck {
            if let Some(path) = &config.readiness_path {
                let probe = format!(
                    "curl -fsS http://127.0.0.1:{}{} || exit 1",
                    config.app_port, path
                );
                parts.push("--health-cmd".to_string());
                parts.push(shell_quote(&probe));
                parts.push("--health-interval=5s".to_string());
                parts.push("--health-timeout=5s".to_string());
                parts.push("--health-retries=5".to_string());
            }
        }

        parts.push(shell_quote(&config.image));

        let script = parts.join(" ");
        let result = self.run_script(host, &script).await?;
        if !result.success() {
            anyhow::bail!(
                "failed to run container '{}' on {}: {}",
                config.name,
                host,
                result.summarize_failure()
            );
        }
        let id = result.stdout.trim().to_string();
        info!(host, name = %config.name, %id, "started container");
        Ok(id)
    }

    async fn stop(&self, host: &str, name: &str, timeout_secs: u64) -> Result<()> {
        let script = format!("docker stop -t {} {}", timeout_secs, shell_quote(name));
        let result = self.run_script(host, &script).await?;
        if !result.success() {
            anyhow::bail!(
                "failed to stop container '{}' on {}: {}",
                name,
                host,
                result.summarize_failure()
            );
        }
        Ok(())
    }

    async fn remove(&self, host: &str, name: &str, force: bool) -> Result<()> {
        let force_flag = if force { "-f" } else { "" };
        let script = format!("docker rm {} {}", force_flag, shell_quote(name));
        let result = self.run_script(host, &script).await?;
        if !result.success() {
            anyhow::bail!(
                "failed to remove container '{}' on {}: {}",
                name,
                host,
                result.summarize_failure()
            );
        }
        Ok(())
    }

    async fn rename(&self, host: &str, from: &str, to: &str) -> Result<()> {
        let script = format!("docker rename {} {}", shell_quote(from), shell_quote(to));
        let result = self.run_script(host, &script).await?;
        if !result.success() {
            anyhow::bail!(
                "failed to rename '{}' to '{}' on {}: {}",
                from,
                to,
                host,
                result.summarize_failure()
            );
        }
        Ok(())
    }

    async fn is_running(&self, host: &str, name: &str) -> Result<bool> {
        let script = format!(
            "docker inspect -f '{{{{.State.Running}}}}' {} 2>/dev/null || echo false",
            shell_quote(name)
        );
        let result = self.run_script(host, &script).await?;
        Ok(result.stdout.trim() == "true")
    }

    async fn exists(&self, host: &str, name: &str) -> Result<bool> {
        let script = format!(
            "docker inspect -f '{{{{.Id}}}}' {} >/dev/null 2>&1 && echo yes || echo no",
            shell_quote(name)
        );
        let result = self.run_script(host, &script).await?;
        Ok(result.stdout.trim() == "yes")
    }

    async fn wait_healthy(&self, host: &str, name: &str, timeout_secs: u64) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(timeout_secs);
        loop {
            let script = format!(
                "docker inspect -f '{{{{.State.Health.Status}}}}' {} 2>/dev/null || docker inspect -f '{{{{.State.Status}}}}' {} 2>/dev/null || true",
                shell_quote(name),
                shell_quote(name)
            );
            let result = self.run_script(host, &script).await?;
            let status = result.stdout.trim();
            if status == "healthy" || status == "running" {
                return Ok(true);
            }
            if status == "unhealthy" {
                return Ok(false);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
        }
    }

    async fn logs(&self, host: &str, name: &str, config: &LogsConfig) -> Result<StdStreams> {
        let mut flags = String::new();
        if let Some(tail) = config.tail {
            flags.push_str(&format!(" --tail {tail}"));
        }
        if let Some(since) = &config.since {
            flags.push_str(&format!(" --since {}", shell_quote(since)));
        }
        let script = format!("docker logs{flags} {}", shell_quote(name));
        let result = self.run_script(host, &script).await?;
        Ok(StdStreams {
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }

    async fn exec(&self, host: &str, name: &str, config: &ExecConfig) -> Result<ExecOutput> {
        let command_str = config
            .command
            .iter()
            .map(|s| shell_quote(s))
            .collect::<Vec<_>>()
            .join(" ");
        let script = format!("docker exec {} {}", shell_quote(name), command_str);
        let result = if let Some(stdin) = &config.stdin {
            self.transport
                .execute_with_stdin(&self.target(host), &script, stdin)
                .await?
        } else {
            self.run_script(host, &script).await?
        };
        Ok(ExecOutput {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
        })
    }

    async fn stats(&self, host: &str, name: &str) -> Result<String> {
        let script = format!(
            "docker stats --no-stream --format '{{{{json .}}}}' {}",
            shell_quote(name)
        );
        let result = self.run_script(host, &script).await?;
        Ok(result.stdout.trim().to_string())
    }

    async fn list(&self, host: &str, filters: &ListFilters) -> Result<Vec<ContainerInfo>> {
        let mut filter_flags = String::new();
        if let Some(prefix) = &filters.name_prefix {
            filter_flags.push_str(&format!(" --filter name={}", shell_quote(prefix)));
        }
        if let Some((key, value)) = &filters.label {
            filter_flags.push_str(&format!(
                " --filter label={}",
                shell_quote(&format!("{key}={value}"))
            ));
        }
        let script = format!(
            "docker ps -a{filter_flags} --format '{{{{.ID}}}}|{{{{.Names}}}}|{{{{.Image}}}}|{{{{.State}}}}'"
        );
        let result = self.run_script(host, &script).await?;
        let containers = result
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_ps_line)
            .collect();
        Ok(containers)
    }
}

fn parse_ps_line(line: &str) -> ContainerInfo {
    let parts: Vec<&str> = line.split('|').collect();
    let id = parts.first().copied().unwrap_or_default().to_string();
    let name = parts.get(1).copied().unwrap_or_default().to_string();
    let image = parts.get(2).copied().unwrap_or_default().to_string();
    let state = parts.get(3).copied().unwrap_or_default().to_ascii_lowercase();

    let status = match state.as_str() {
        "created" => ContainerStatus::Creating,
        "running" => ContainerStatus::Running,
        "paused" => ContainerStatus::Paused,
        "restarting" => ContainerStatus::Restarting,
        "removing" => ContainerStatus::Removing,
        "exited" => ContainerStatus::Exited,
        "dead" => ContainerStatus::Dead,
        _ => ContainerStatus::Unknown,
    };

    ContainerInfo {
        id,
        name,
        image,
        status,
        ports: Vec::<PortMapping>::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContainerDriver;
    use fleetwright_ssh::{testing::FakeTransport, ExecResult};

    fn driver(transport: FakeTransport) -> SshContainerDriver<FakeTransport> {
        SshContainerDriver::new(Arc::new(transport), "deploy", None)
    }

    #[tokio::test]
    async fn pull_fails_loudly_with_summarized_stderr() {
        let transport = FakeTransport::new(vec![Ok(ExecResult {
            stdout: String::new(),
            stderr: "manifest unknown".to_string(),
            exit_code: Some(1),
        })]);
        let driver = driver(transport);
        let err = driver
            .pull("h1", "ex.io/missing:latest")
            .await
            .expect_err("expected pull failure");
        assert!(err.to_string().contains("manifest unknown"));
    }

    #[tokio::test]
    async fn list_parses_ps_output_into_container_infos() {
        let transport = FakeTransport::always_ok("abc123|web|ex.io/web:1|running\n");
        let driver = driver(transport);
        let containers = driver
            .list("h1", &ListFilters::default())
            .await
            .expect("list should succeed");
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "web");
        assert!(containers[0].status.is_running());
    }

    #[tokio::test]
    async fn is_running_reports_false_on_non_true_output() {
        let transport = FakeTransport::always_ok("false\n");
        let driver = driver(transport);
        let running = driver.is_running("h1", "web").await.unwrap();
        assert!(!running);
    }
}
