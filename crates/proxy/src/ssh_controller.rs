use crate::admin::AdminClient;
use crate::{ProxyController, RouteView, SelectionPolicy, ServiceRegistration, Upstream};
use anyhow::{Context, Result};
use fleetwright_container::{ContainerDriver, ExecConfig, ListFilters, LogsConfig, RunConfig};
use fleetwright_ssh::SshTransport;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const ROUTES_PATH: &str = "/config/apps/http/servers/srv0/routes";
const WHOLE_CONFIG_PATH: &str = "/config/";
const LOAD_PATH: &str = "/load";
const UPSTREAMS_PATH: &str = "/reverse_proxy/upstreams";

const DEFAULT_PASSIVE_FAIL_DURATION: &str = "30s";
const DEFAULT_PASSIVE_MAX_FAILS: u32 = 3;

/// The admin API's on-the-wire route object: `{match, handle, terminal}`,
/// distinct from `RouteView`'s flattened in-memory shape. All JSON sent to
/// or read from `ROUTES_PATH`/`WHOLE_CONFIG_PATH` goes through this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireRoute {
    #[serde(rename = "match")]
    matches: Vec<WireMatch>,
    handle: Vec<WireHandle>,
    #[serde(default = "default_terminal")]
    terminal: bool,
}

fn default_terminal() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMatch {
    host: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireHandle {
    handler: String,
    upstreams: Vec<Upstream>,
    load_balancing: WireLoadBalancing,
    health_checks: WireHealthChecks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireLoadBalancing {
    selection_policy: WireSelectionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireSelectionPolicy {
    policy: SelectionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireHealthChecks {
    active: WireActiveHealth,
    passive: WirePassiveHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireActiveHealth {
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    interval: String,
    timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WirePassiveHealth {
    fail_duration: String,
    max_fails: u32,
}

impl From<&RouteView> for WireRoute {
    fn from(route: &RouteView) -> Self {
        WireRoute {
            matches: vec![WireMatch {
                host: route.host_match.clone(),
            }],
            handle: vec![WireHandle {
                handler: "reverse_proxy".to_string(),
                upstreams: route.upstreams.clone(),
                load_balancing: WireLoadBalancing {
                    selection_policy: WireSelectionPolicy {
                        policy: route.policy.clone(),
                    },
                },
                health_checks: WireHealthChecks {
                    active: WireActiveHealth {
                        path: route.health_path.clone(),
                        interval: format_duration_secs(route.health_interval_secs),
                        timeout: format_duration_secs(route.health_timeout_secs),
                    },
                    passive: WirePassiveHealth {
                        fail_duration: DEFAULT_PASSIVE_FAIL_DURATION.to_string(),
                        max_fails: DEFAULT_PASSIVE_MAX_FAILS,
                    },
                },
            }],
            terminal: true,
        }
    }
}

impl TryFrom<WireRoute> for RouteView {
    type Error = anyhow::Error;

    fn try_from(wire: WireRoute) -> Result<Self> {
        let host_match = wire.matches.into_iter().flat_map(|m| m.host).collect();
        let handle = wire
            .handle
            .into_iter()
            .next()
            .context("route response had no handle entries")?;
        Ok(RouteView {
            host_match,
            upstreams: handle.upstreams,
            policy: handle.load_balancing.selection_policy.policy,
            health_path: handle.health_checks.active.path,
            health_interval_secs: parse_duration_secs(&handle.health_checks.active.interval),
            health_timeout_secs: parse_duration_secs(&handle.health_checks.active.timeout),
            https: false,
        })
    }
}

fn format_duration_secs(secs: u64) -> String {
    format!("{secs}s")
}

fn parse_duration_secs(value: &str) -> u64 {
    value
        .trim()
        .trim_end_matches('s')
        .parse()
        .unwrap_or_default()
}

/// Drives the proxy's admin API over SSH and the proxy container itself via
/// a `ContainerDriver`, implementing the per-route-patch-with-whole-config-
/// fallback update discipline and the drain poll loop.
pub struct SshProxyController<T: SshTransport, C: ContainerDriver> {
    admin: AdminClient<T>,
    containers: Arc<C>,
    container_name: String,
    image: String,
    app_port_label: String,
}

impl<T: SshTransport, C: ContainerDriver> SshProxyController<T, C> {
    pub fn new(
        admin: AdminClient<T>,
        containers: Arc<C>,
        container_name: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            admin,
            containers,
            container_name: container_name.into(),
            image: image.into(),
            app_port_label: "fleetwright-proxy".to_string(),
        }
    }

    fn route_matches(route: &Value, routing_host: &str) -> bool {
        route
            .get("match")
            .and_then(|v| v.as_array())
            .map(|matches| {
                matches.iter().any(|m| {
                    m.get("host")
                        .and_then(|v| v.as_array())
                        .map(|hosts| hosts.iter().any(|h| h.as_str() == Some(routing_host)))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    async fn find_route_index(&self, host: &str, routing_host: &str) -> Result<Option<usize>> {
        let routes = self.admin.get(host, ROUTES_PATH).await?;
        let routes = routes.as_array().cloned().unwrap_or_default();
        Ok(routes
            .iter()
            .position(|route| Self::route_matches(route, routing_host)))
    }

    async fn upsert_route(&self, host: &str, routing_host: &str, route: &RouteView) -> Result<()> {
        let route_json =
            serde_json::to_value(WireRoute::from(route)).context("failed to serialize route")?;

        let tiered = async {
            match self.find_route_index(host, routing_host).await {
                Ok(Some(index)) => {
                    self.admin
                        .patch(host, &format!("{ROUTES_PATH}/{index}"), &route_json)
                        .await
                }
                Ok(None) => self.admin.post(host, ROUTES_PATH, &route_json).await,
                Err(err) => Err(err),
            }
        }
        .await;

        if tiered.is_ok() {
            return Ok(());
        }
        warn!(host, routing_host, "route-specific update failed, falling back to whole-config reload");
        self.whole_config_fallback(host, routing_host, Some(route.clone()))
            .await
    }

    async fn whole_config_fallback(
        &self,
        host: &str,
        routing_host: &str,
        replacement: Option<RouteView>,
    ) -> Result<()> {
        let mut config = self
            .admin
            .get(host, WHOLE_CONFIG_PATH)
            .await
            .unwrap_or_else(|_| json!({ "apps": { "http": { "servers": { "srv0": { "routes": [] } } } } }));

        let routes = config
            .pointer_mut("/apps/http/servers/srv0/routes")
            .and_then(|v| v.as_array_mut());

        match routes {
            Some(routes) => {
                let existing = routes
                    .iter()
                    .position(|route| Self::route_matches(route, routing_host));
                match (existing, replacement) {
                    (Some(index), Some(route)) => {
                        routes[index] = serde_json::to_value(WireRoute::from(&route))?;
                    }
                    (Some(index), None) => {
                        routes.remove(index);
                    }
                    (None, Some(route)) => {
                        routes.push(serde_json::to_value(WireRoute::from(&route))?);
                    }
                    (None, None) => {}
                }
            }
            None => {
                anyhow::bail!("whole-config fallback found no routes array to merge into");
            }
        }

        self.admin.post(host, LOAD_PATH, &config).await
    }

    async fn mutate_upstreams(
        &self,
        host: &str,
        routing_host: &str,
        mutate: impl FnOnce(&mut Vec<Upstream>),
    ) -> Result<()> {
        let index = self.find_route_index(host, routing_host).await?;
        let mut route = match index {
            Some(i) => {
                let raw = self.admin.get(host, &format!("{ROUTES_PATH}/{i}")).await?;
                let wire: WireRoute = serde_json::from_value(raw)
                    .context("route response did not match expected shape")?;
                RouteView::try_from(wire)?
            }
            None => anyhow::bail!(
                "no route matches routing host '{}' on {}",
                routing_host,
                host
            ),
        };

        mutate(&mut route.upstreams);
        if route.upstreams.len() > 1 && route.policy == SelectionPolicy::RoundRobin {
            route.policy = SelectionPolicy::WeightedRoundRobin;
        }

        self.upsert_route(host, routing_host, &route).await
    }
}

#[async_trait::async_trait]
impl<T: SshTransport, C: ContainerDriver> ProxyController for SshProxyController<T, C> {
    async fn register_service(&self, host: &str, service: &ServiceRegistration) -> Result<()> {
        let policy = if service.upstreams.iter().any(|u| u.weight.is_some()) {
            SelectionPolicy::WeightedRoundRobin
        } else {
            SelectionPolicy::RoundRobin
        };

        let route = RouteView {
            host_match: service.routing_hosts.clone(),
            upstreams: service.upstreams.clone(),
            policy,
            health_path: service.health_path.clone(),
            health_interval_secs: service.health_interval_secs,
            health_timeout_secs: service.health_timeout_secs,
            https: service.https,
        };

        let primary_host = service
            .routing_hosts
            .first()
            .context("service registration requires at least one routing host")?;
        self.upsert_route(host, primary_host, &route).await
    }

    async fn deregister_service(&self, host: &str, routing_host: &str) -> Result<()> {
        match self.find_route_index(host, routing_host).await {
            Ok(Some(index)) => self.admin.delete(host, &format!("{ROUTES_PATH}/{index}")).await,
            Ok(None) => Ok(()),
            Err(_) => self.whole_config_fallback(host, routing_host, None).await,
        }
    }

    async fn add_upstream(&self, host: &str, routing_host: &str, dial: &str) -> Result<()> {
        let dial = dial.to_string();
        self.mutate_upstreams(host, routing_host, |upstreams| {
            if !upstreams.iter().any(|u| u.dial == dial) {
                upstreams.push(Upstream { dial, weight: None });
            }
        })
        .await
    }

    async fn remove_upstream(&self, host: &str, routing_host: &str, dial: &str) -> Result<()> {
        let dial = dial.to_string();
        self.mutate_upstreams(host, routing_host, |upstreams| {
            upstreams.retain(|u| u.dial != dial);
        })
        .await
    }

    async fn add_weighted_upstream(
        &self,
        host: &str,
        routing_host: &str,
        dial: &str,
        weight: u32,
    ) -> Result<()> {
        let dial = dial.to_string();
        self.mutate_upstreams(host, routing_host, |upstreams| {
            upstreams.retain(|u| u.dial != dial);
            upstreams.push(Upstream {
                dial,
                weight: Some(weight),
            });
        })
        .await
    }

    async fn set_upstream_weight(
        &self,
        host: &str,
        routing_host: &str,
        dial: &str,
        weight: u32,
    ) -> Result<()> {
        let dial = dial.to_string();
        self.mutate_upstreams(host, routing_host, |upstreams| {
            for upstream in upstreams.iter_mut() {
                if upstream.dial == dial {
                    upstream.weight = Some(weight);
                }
            }
        })
        .await
    }

    async fn get_upstream_weights(&self, host: &str, routing_host: &str) -> Result<Vec<Upstream>> {
        let index = self.find_route_index(host, routing_host).await?;
        match index {
            Some(i) => {
                let raw = self.admin.get(host, &format!("{ROUTES_PATH}/{i}")).await?;
                let wire: WireRoute = serde_json::from_value(raw)
                    .context("route response did not match expected shape")?;
                let route = RouteView::try_from(wire)?;
                Ok(route.upstreams)
            }
            None => anyhow::bail!("no route matches routing host '{}' on {}", routing_host, host),
        }
    }

    async fn drain_upstream(&self, host: &str, dial: &str, timeout_secs: u64) -> Result<()> {
        if timeout_secs == 0 {
            return Ok(());
        }

        let timeout = Duration::from_secs(timeout_secs);
        let start = Instant::now();
        let deadline = start + timeout;
        let grace_deadline = start + timeout.min(Duration::from_secs(5));
        let poll_interval = Duration::from_secs(2);
        let mut ever_found_active = false;

        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(host, dial, "drain deadline reached while upstream still active");
                return Ok(());
            }

            match self.active_request_count(host, dial).await {
                Ok(count) if count > 0 => {
                    ever_found_active = true;
                    sleep(poll_interval).await;
                }
                Ok(_) if ever_found_active => {
                    debug!(host, dial, "drain complete");
                    return Ok(());
                }
                Ok(_) if now < grace_deadline => {
                    sleep(poll_interval).await;
                }
                Ok(_) => {
                    return Ok(());
                }
                Err(err) => {
                    debug!(host, dial, %err, "admin api failed during drain poll, waiting out remaining timeout");
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    sleep(remaining).await;
                    return Ok(());
                }
            }
        }
    }

    async fn boot(&self, host: &str) -> Result<()> {
        let config = RunConfig {
            name: self.container_name.clone(),
            image: self.image.clone(),
            ports: vec![80, 443],
            network: Some("azud".to_string()),
            restart_policy: "always".to_string(),
            env: Default::default(),
            volumes: Vec::new(),
            labels: [("azud.managed".to_string(), "true".to_string())].into(),
            readiness_path: None,
            app_port: 0,
            disable_healthcheck: true,
        };
        self.containers.pull(host, &self.image).await?;
        self.containers.run(host, &config).await?;
        info!(host, name = %self.container_name, "proxy container booted");
        Ok(())
    }

    async fn stop(&self, host: &str) -> Result<()> {
        self.containers.stop(host, &self.container_name, 10).await
    }

    async fn reboot(&self, host: &str) -> Result<()> {
        let _ = self.stop(host).await;
        self.boot(host).await
    }

    async fn remove(&self, host: &str) -> Result<()> {
        let _ = self.stop(host).await;
        self.containers.remove(host, &self.container_name, true).await
    }

    async fn status(&self, host: &str) -> Result<bool> {
        self.containers.is_running(host, &self.container_name).await
    }

    async fn logs(&self, host: &str) -> Result<String> {
        let streams = self
            .containers
            .logs(host, &self.container_name, &LogsConfig::default())
            .await?;
        Ok(format!("{}{}", streams.stdout, streams.stderr))
    }
}

impl<T: SshTransport, C: ContainerDriver> SshProxyController<T, C> {
    async fn active_request_count(&self, host: &str, dial: &str) -> Result<u64> {
        let upstreams = self.admin.get(host, UPSTREAMS_PATH).await?;
        let upstreams = upstreams
            .as_array()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("upstreams response was not an array"))?;

        let entry = upstreams
            .iter()
            .find(|u| u.get("address").and_then(|d| d.as_str()) == Some(dial));

        Ok(entry
            .and_then(|u| u.get("num_requests"))
            .and_then(|n| n.as_u64())
            .unwrap_or(0))
    }

    /// Exercises the proxy's admin API via an ad-hoc container exec, used by
    /// the `ssh`/`cexec`-style diagnostics surface. Kept narrow: this does
    /// not participate in the update protocol.
    #[allow(dead_code)]
    async fn exec_in_proxy(&self, host: &str, command: Vec<String>) -> Result<String> {
        let output = self
            .containers
            .exec(
                host,
                &self.container_name,
                &ExecConfig {
                    command,
                    stdin: None,
                },
            )
            .await?;
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwright_container::ssh::SshContainerDriver;
    use fleetwright_ssh::{testing::FakeTransport, ExecResult};

    fn admin_client_with(responses: Vec<Result<ExecResult>>) -> AdminClient<FakeTransport> {
        AdminClient::new(Arc::new(FakeTransport::new(responses)), "deploy", None, 2019)
    }

    fn ok_response(status: u16, body: &str) -> Result<ExecResult> {
        Ok(ExecResult {
            stdout: format!("{status}{body}"),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    fn controller_with_routes(
        route_lookup_body: &str,
    ) -> SshProxyController<FakeTransport, SshContainerDriver<FakeTransport>> {
        let admin = admin_client_with(vec![ok_response(200, route_lookup_body)]);
        let containers = Arc::new(SshContainerDriver::new(
            Arc::new(FakeTransport::always_ok("")),
            "deploy",
            None,
        ));
        SshProxyController::new(admin, containers, "fleetwright-proxy", "caddy:2")
    }

    #[tokio::test]
    async fn find_route_index_matches_exact_host() {
        let controller = controller_with_routes(
            r#"[{"match":[{"host":["app.ex"]}],"handle":[{"handler":"reverse_proxy","upstreams":[{"dial":"web:3000","weight":null}],"load_balancing":{"selection_policy":{"policy":"round_robin"}},"health_checks":{"active":{"path":null,"interval":"5s","timeout":"5s"},"passive":{"fail_duration":"30s","max_fails":3}}}],"terminal":true}]"#,
        );
        let index = controller
            .find_route_index("h1", "app.ex")
            .await
            .expect("lookup should succeed");
        assert_eq!(index, Some(0));
    }

    #[tokio::test]
    async fn find_route_index_returns_none_when_absent() {
        let controller = controller_with_routes("[]");
        let index = controller
            .find_route_index("h1", "app.ex")
            .await
            .expect("lookup should succeed");
        assert_eq!(index, None);
    }

    #[tokio::test]
    async fn drain_returns_immediately_for_zero_timeout() {
        let controller = controller_with_routes("[]");
        controller
            .drain_upstream("h1", "web-canary:3000", 0)
            .await
            .expect("zero timeout drain should return immediately");
    }
}
