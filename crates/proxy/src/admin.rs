use anyhow::{Context, Result};
use fleetwright_ssh::retry::retry_with_backoff;
use fleetwright_ssh::{shell_quote, SshTarget, SshTransport};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const READ_RETRY_ATTEMPTS: usize = 3;
const READ_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(250);

/// Talks to the proxy's HTTP admin API, which only listens on loopback on
/// each host. The admin port is unreachable from the CLI's machine, so every
/// call is a `curl` invocation shelled over the SSH transport rather than a
/// direct HTTP client.
pub struct AdminClient<T: SshTransport> {
    transport: Arc<T>,
    user: String,
    identity_file: Option<String>,
    admin_port: u16,
    ssh_port: Option<u16>,
}

impl<T: SshTransport> AdminClient<T> {
    pub fn new(
        transport: Arc<T>,
        user: impl Into<String>,
        identity_file: Option<String>,
        admin_port: u16,
    ) -> Self {
        Self {
            transport,
            user: user.into(),
            identity_file,
            admin_port,
            ssh_port: None,
        }
    }

    /// Overrides the SSH port used to reach every host (distinct from the
    /// proxy's own loopback `admin_port`).
    pub fn with_ssh_port(mut self, port: Option<u16>) -> Self {
        self.ssh_port = port;
        self
    }

    fn target(&self, host: &str) -> SshTarget {
        let mut target = SshTarget::new(host, &self.user);
        target.port = self.ssh_port;
        if let Some(identity) = &self.identity_file {
            target = target.with_identity(identity.clone());
        }
        target
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.admin_port, path)
    }

    async fn curl(&self, host: &str, method: &str, path: &str, body: Option<&str>) -> Result<(u16, String)> {
        let url = self.url(path);
        let mut script = format!(
            "curl -sS -o /tmp/fleetwright-admin-body -w '%{{http_code}}' -X {method} {url}",
            method = method,
            url = shell_quote(&url),
        );
        if let Some(body) = body {
            script.push_str(&format!(
                " -H 'Content-Type: application/json' -d {}",
                shell_quote(body)
            ));
        }
        script.push_str(" && cat /tmp/fleetwright-admin-body");

        debug!(host, method, path, "admin api call");
        let result = self
            .transport
            .execute(&self.target(host), &script)
            .await
            .with_context(|| format!("ssh transport failure reaching admin api on {host}"))?;

        if !result.success() {
            anyhow::bail!(
                "admin api call failed on {}: {}",
                host,
                result.summarize_failure()
            );
        }

        let stdout = result.stdout;
        let code_digits: String = stdout.chars().take_while(|c| c.is_ascii_digit()).collect();
        let status: u16 = code_digits.parse().unwrap_or(0);
        let body = stdout[code_digits.len()..].to_string();
        Ok((status, body))
    }

    /// `GET` is idempotent, so a transport-level failure (not a bad status
    /// from the admin API) is worth a few retries before giving up.
    pub async fn get(&self, host: &str, path: &str) -> Result<Value> {
        retry_with_backoff(
            READ_RETRY_ATTEMPTS,
            READ_RETRY_INITIAL_DELAY,
            "admin api GET",
            |_attempt| async move {
                let (status, body) = self.curl(host, "GET", path, None).await?;
                if !(200..300).contains(&status) {
                    anyhow::bail!("admin api GET {} returned {}: {}", path, status, body);
                }
                if body.trim().is_empty() {
                    return Ok(Value::Null);
                }
                serde_json::from_str(&body)
                    .with_context(|| format!("failed to parse admin api response from {path}"))
            },
        )
        .await
    }

    pub async fn post(&self, host: &str, path: &str, body: &Value) -> Result<()> {
        let payload = serde_json::to_string(body).context("failed to serialize request body")?;
        let (status, resp) = self.curl(host, "POST", path, Some(&payload)).await?;
        if !(200..300).contains(&status) {
            anyhow::bail!("admin api POST {} returned {}: {}", path, status, resp);
        }
        Ok(())
    }

    pub async fn patch(&self, host: &str, path: &str, body: &Value) -> Result<()> {
        let payload = serde_json::to_string(body).context("failed to serialize request body")?;
        let (status, resp) = self.curl(host, "PATCH", path, Some(&payload)).await?;
        if !(200..300).contains(&status) {
            anyhow::bail!("admin api PATCH {} returned {}: {}", path, status, resp);
        }
        Ok(())
    }

    pub async fn delete(&self, host: &str, path: &str) -> Result<()> {
        let (status, resp) = self.curl(host, "DELETE", path, None).await?;
        if !(200..300).contains(&status) {
            anyhow::bail!("admin api DELETE {} returned {}: {}", path, status, resp);
        }
        Ok(())
    }
}
