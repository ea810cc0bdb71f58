use crate::canary::CanaryDeployer;
use crate::rolling::RollingDeployer;
use fleetwright_config::Config;
use fleetwright_container::ssh::SshContainerDriver;
use fleetwright_proxy::admin::AdminClient;
use fleetwright_proxy::SshProxyController;
use fleetwright_ssh::{OpensshTransport, SshOptions, SshTransport};
use std::path::Path;
use std::sync::Arc;

pub type Transport = OpensshTransport;
pub type Containers = SshContainerDriver<Transport>;
pub type Proxy = SshProxyController<Transport, Containers>;

/// The concrete SSH-backed stack every command builds from a loaded `Config`:
/// one transport shared by the container driver and the proxy admin client.
pub struct Runtime {
    transport: Arc<Transport>,
    pub containers: Arc<Containers>,
    pub proxy: Arc<Proxy>,
}

impl Runtime {
    pub fn build(config: &Config) -> Self {
        let transport = Arc::new(OpensshTransport::new(SshOptions::default()));

        let containers = Arc::new(
            SshContainerDriver::new(
                Arc::clone(&transport),
                config.ssh.user.clone(),
                config.ssh.identity_file.clone(),
            )
            .with_port(config.ssh.port),
        );

        let admin = AdminClient::new(
            Arc::clone(&transport),
            config.ssh.user.clone(),
            config.ssh.identity_file.clone(),
            config.proxy.admin_port,
        )
        .with_ssh_port(config.ssh.port);

        let proxy = Arc::new(SshProxyController::new(
            admin,
            Arc::clone(&containers),
            config.proxy.container_name.clone(),
            config.proxy.image.clone(),
        ));

        Self {
            transport,
            containers,
            proxy,
        }
    }

    pub fn rolling_deployer(&self, config: &Config) -> RollingDeployer<Containers, Proxy> {
        RollingDeployer::new(Arc::clone(&self.containers), Arc::clone(&self.proxy))
            .with_secrets_precondition(
                Arc::clone(&self.transport) as Arc<dyn SshTransport>,
                config.ssh.user.clone(),
            )
    }

    pub fn canary_deployer(&self, repo_root: &Path) -> CanaryDeployer<Containers, Proxy> {
        CanaryDeployer::new(
            Arc::clone(&self.containers),
            Arc::clone(&self.proxy),
            repo_root.to_path_buf(),
        )
    }
}
