use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Output;
use tokio::process::Command;

pub mod retry;

/// The result of running one command on a remote (or local) host.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn from_output(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        }
    }

    /// A short human-readable summary, favoring stderr over stdout, truncated
    /// so a failing rollout's error chain stays readable.
    pub fn summarize_failure(&self) -> String {
        let code = self
            .exit_code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        let stderr = limit_output(self.stderr.trim());
        let stdout = limit_output(self.stdout.trim());
        match (stderr.is_empty(), stdout.is_empty()) {
            (true, true) => format!("exit={code}"),
            (false, true) => format!("exit={code} stderr={stderr}"),
            (true, false) => format!("exit={code} stdout={stdout}"),
            (false, false) => format!("exit={code} stderr={stderr} stdout={stdout}"),
        }
    }
}

fn limit_output(value: &str) -> String {
    const MAX: usize = 300;
    if value.chars().count() <= MAX {
        return value.to_string();
    }
    let truncated: String = value.chars().take(MAX).collect();
    format!("{truncated}...")
}

/// Shell-quote a single argument for inclusion in a remote `sh -lc` script.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}

/// A host the transport dials. Bare address/hostname plus the SSH user and
/// key material needed to reach it — everything `SshTransport` needs per call.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub identity_file: Option<String>,
    pub port: Option<u16>,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            identity_file: None,
            port: None,
        }
    }

    pub fn with_identity(mut self, identity_file: impl Into<String>) -> Self {
        self.identity_file = Some(identity_file.into());
        self
    }
}

/// Remote command execution, abstracted so `fleetwright-container` and
/// `fleetwright-proxy` can run their shell scripts against either a real SSH
/// session or an in-memory fake in tests.
#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn execute(&self, target: &SshTarget, script: &str) -> Result<ExecResult>;

    async fn execute_with_stdin(
        &self,
        target: &SshTarget,
        script: &str,
        stdin: &str,
    ) -> Result<ExecResult>;

    /// Run the same script against every target concurrently, pairing each
    /// result with the host it ran on. Per-host failures are carried in the
    /// `Result` rather than aborting the whole fan-out.
    async fn execute_parallel(
        &self,
        targets: &[SshTarget],
        script: &str,
    ) -> Vec<(String, Result<ExecResult>)>;
}

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub batch_mode: bool,
    pub connect_timeout_secs: Option<u64>,
    pub strict_host_key_checking: String,
    pub user_known_hosts_file: Option<String>,
    pub log_level: String,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            batch_mode: true,
            connect_timeout_secs: Some(10),
            strict_host_key_checking: "accept-new".to_string(),
            user_known_hosts_file: None,
            log_level: "ERROR".to_string(),
        }
    }
}

/// Production transport shelling out to the system `ssh` binary, one process
/// per command. There is no persistent multiplexed connection: each call
/// pays a fresh handshake, the same tradeoff the rest of the fleet-management
/// tooling this crate descends from makes in exchange for not managing
/// control-socket lifecycles.
pub struct OpensshTransport {
    options: SshOptions,
}

impl OpensshTransport {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    fn build_command(&self, target: &SshTarget) -> Result<Command> {
        let mut cmd = Command::new("ssh");

        if self.options.batch_mode {
            cmd.args(["-o", "BatchMode=yes"]);
        }
        if let Some(timeout) = self.options.connect_timeout_secs {
            cmd.args(["-o", &format!("ConnectTimeout={timeout}")]);
        }
        cmd.args([
            "-o",
            &format!(
                "StrictHostKeyChecking={}",
                self.options.strict_host_key_checking
            ),
        ]);
        if let Some(path) = &self.options.user_known_hosts_file {
            cmd.args(["-o", &format!("UserKnownHostsFile={path}")]);
        }
        cmd.args(["-o", &format!("LogLevel={}", self.options.log_level)]);

        if let Some(key) = &target.identity_file {
            if let Some(identity_path) = resolve_identity_path(key)? {
                cmd.args(["-i", &identity_path.to_string_lossy()]);
            }
        }

        if let Some(port) = target.port {
            cmd.args(["-p", &port.to_string()]);
        }

        cmd.arg(format!("{}@{}", target.user, target.host));
        Ok(cmd)
    }
}

#[async_trait]
impl SshTransport for OpensshTransport {
    async fn execute(&self, target: &SshTarget, script: &str) -> Result<ExecResult> {
        let mut cmd = self.build_command(target)?;
        cmd.arg("sh").arg("-c").arg(script);
        tracing::debug!(host = %target.host, "executing remote command");
        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to execute ssh command on {}", target.host))?;
        Ok(ExecResult::from_output(output))
    }

    async fn execute_with_stdin(
        &self,
        target: &SshTarget,
        script: &str,
        stdin: &str,
    ) -> Result<ExecResult> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        let mut cmd = self.build_command(target)?;
        cmd.arg("sh").arg("-c").arg(script);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn ssh command on {}", target.host))?;
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin.as_bytes())
                .await
                .context("failed to write to remote command stdin")?;
        }
        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("failed waiting for ssh command on {}", target.host))?;
        Ok(ExecResult::from_output(output))
    }

    async fn execute_parallel(
        &self,
        targets: &[SshTarget],
        script: &str,
    ) -> Vec<(String, Result<ExecResult>)> {
        let futures = targets.iter().map(|target| async move {
            let result = self.execute(target, script).await;
            (target.host.clone(), result)
        });
        futures::future::join_all(futures).await
    }
}

/// Resolve a `~`- or `/`-rooted SSH key path to an existing file on disk,
/// preferring the private key when a `.pub` path is given.
pub fn resolve_identity_path(ssh_key: &str) -> Result<Option<PathBuf>> {
    if ssh_key.is_empty() {
        return Ok(None);
    }

    if !(ssh_key.starts_with('~') || ssh_key.starts_with('/')) {
        return Ok(None);
    }

    let path = if let Some(rest) = ssh_key.strip_prefix('~') {
        let home = dirs::home_dir().context("could not resolve home directory")?;
        home.join(rest.trim_start_matches('/'))
    } else {
        PathBuf::from(ssh_key)
    };

    if path.extension().is_some_and(|ext| ext == "pub") {
        let mut private = path.clone();
        private.set_extension("");
        if private.exists() {
            return Ok(Some(private));
        }
    }

    if path.exists() {
        return Ok(Some(path));
    }

    Ok(None)
}

/// In-memory `SshTransport` fakes, exported for use by downstream crates'
/// own test suites (`fleetwright-container`, `fleetwright-proxy`,
/// `fleetwright-core`).
pub mod testing {
    use super::{ExecResult, SshTarget, SshTransport};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed queue of responses per call, regardless of host or
    /// script, recording every call it received for assertions.
    pub struct FakeTransport {
        responses: Mutex<VecDeque<Result<ExecResult>>>,
        pub calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeTransport {
        pub fn new(responses: Vec<Result<ExecResult>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn always_ok(stdout: impl Into<String>) -> Self {
            Self::new(vec![Ok(ExecResult {
                stdout: stdout.into(),
                stderr: String::new(),
                exit_code: Some(0),
            })])
        }

        fn next_response(&self) -> Result<ExecResult> {
            let mut responses = self.responses.lock().expect("lock poisoned");
            if responses.len() > 1 {
                responses.pop_front().expect("non-empty")
            } else if let Some(last) = responses.front() {
                clone_result(last)
            } else {
                Ok(ExecResult::default())
            }
        }
    }

    fn clone_result(result: &Result<ExecResult>) -> Result<ExecResult> {
        match result {
            Ok(exec) => Ok(exec.clone()),
            Err(err) => Err(anyhow::anyhow!(err.to_string())),
        }
    }

    #[async_trait]
    impl SshTransport for FakeTransport {
        async fn execute(&self, target: &SshTarget, script: &str) -> Result<ExecResult> {
            self.calls
                .lock()
                .expect("lock poisoned")
                .push((target.host.clone(), script.to_string()));
            self.next_response()
        }

        async fn execute_with_stdin(
            &self,
            target: &SshTarget,
            script: &str,
            _stdin: &str,
        ) -> Result<ExecResult> {
            self.execute(target, script).await
        }

        async fn execute_parallel(
            &self,
            targets: &[SshTarget],
            script: &str,
        ) -> Vec<(String, Result<ExecResult>)> {
            let mut out = Vec::with_capacity(targets.len());
            for target in targets {
                out.push((target.host.clone(), self.execute(target, script).await));
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn exec_result_success_requires_zero_exit() {
        let ok = ExecResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
        };
        let err = ExecResult {
            stdout: String::new(),
            stderr: "boom".to_string(),
            exit_code: Some(1),
        };
        assert!(ok.success());
        assert!(!err.success());
    }

    #[test]
    fn summarize_failure_includes_stderr_when_present() {
        let result = ExecResult {
            stdout: String::new(),
            stderr: "boom".to_string(),
            exit_code: Some(7),
        };
        let summary = result.summarize_failure();
        assert!(summary.contains("exit=7"));
        assert!(summary.contains("stderr=boom"));
    }

    #[test]
    fn resolve_identity_path_ignores_relative_keys() {
        let resolved = resolve_identity_path("my-key").unwrap();
        assert!(resolved.is_none());
    }
}
