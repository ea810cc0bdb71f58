use crate::commands::Outcome;
use crate::output;
use crate::runtime::Runtime;
use anyhow::Result;
use fleetwright_config::Config;

pub async fn start(config: &Config, hosts: Option<Vec<String>>) -> Result<Outcome> {
    let runtime = Runtime::build(config);
    runtime.rolling_deployer(config).start(config, hosts).await?;
    output::line(format!("started {}", config.service));
    Ok(Outcome::Success)
}

pub async fn stop(config: &Config, hosts: Option<Vec<String>>) -> Result<Outcome> {
    let runtime = Runtime::build(config);
    runtime.rolling_deployer(config).stop(config, hosts).await?;
    output::line(format!("stopped {}", config.service));
    Ok(Outcome::Success)
}

pub async fn restart(config: &Config, hosts: Option<Vec<String>>) -> Result<Outcome> {
    let runtime = Runtime::build(config);
    runtime
        .rolling_deployer(config)
        .restart(config, hosts)
        .await?;
    output::line(format!("restarted {}", config.service));
    Ok(Outcome::Success)
}
