use anyhow::{Result, anyhow, bail};
use ebroker_core::{Backend, NodeProvider};
use ebroker_cyclecloud::{CycleCloud, CycleCloudConfig};
use tracing::debug;

use crate::config::Config;

pub fn create_provider_handle(backend: Backend, config: &Config) -> Result<Box<dyn NodeProvider>> {
    match backend {
        Backend::CycleCloud => {
            let section = config
                .cyclecloud
                .as_ref()
                .ok_or_else(|| anyhow!("[cyclecloud] is required for the cyclecloud backend, set it in your ebroker config"))?;
            let call_timeout = config.call_timeout()?;
            let client = CycleCloud::new(CycleCloudConfig {
                server: section.server.clone(),
                cluster: section.cluster.clone(),
                user: section.user.clone(),
                password: section.password.clone(),
                call_timeout,
            })?;
            debug!(server = %section.server, cluster = %section.cluster, region = ?section.region, "using cyclecloud backend");
            Ok(Box::new(client))
        }
        other => bail!("Unimplemented provider: {}", other),
    }
}
