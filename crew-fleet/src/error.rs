//! Errors that leave the crew lifecycle manager.

/// Only crew creation failures propagate out of `LifecycleManager`; every
/// other failure is absorbed at its own boundary.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("failed to create crew for tenant {tenant_id}: {source:#}")]
    Creation {
        tenant_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl LifecycleError {
    pub fn tenant_id(&self) -> &str {
        match self {
            LifecycleError::Creation { tenant_id, .. } => tenant_id,
        }
    }
}
