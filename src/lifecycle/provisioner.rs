//! Seam between lifecycle transitions and whatever actually runs a Core.

use async_trait::async_trait;
use tracing::info;

use super::Core;

/// Provisioning backend failure.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ProvisionError(pub String);

/// Performs the side effects of deploying and stopping a Core.
///
/// Called while the Core is in its intermediate state (`Deploying` or
/// `Stopping`); an error leaves it there.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Bring the Core's network functions up.
    async fn deploy(&self, core: &Core) -> Result<(), ProvisionError>;

    /// Tear the Core's network functions down.
    async fn stop(&self, core: &Core) -> Result<(), ProvisionError>;
}

/// Records transitions without touching any infrastructure.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProvisioner;

#[async_trait]
impl Provisioner for LoggingProvisioner {
    async fn deploy(&self, core: &Core) -> Result<(), ProvisionError> {
        info!(
            core = %core.id,
            network_functions = core.network_functions.len(),
            "Deploy requested (no provisioning backend configured)"
        );
        Ok(())
    }

    async fn stop(&self, core: &Core) -> Result<(), ProvisionError> {
        info!(core = %core.id, "Stop requested (no provisioning backend configured)");
        Ok(())
    }
}
