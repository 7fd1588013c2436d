//! Pool manager errors.

use std::time::Duration;

use clusterpool_reconcile::StoreError;
use thiserror::Error;

use crate::types::{ClusterState, InstanceId};

/// Errors from provisioning, persistence and ID parsing.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Backend refused or failed to create an instance.
    #[error("provisioning failed: {0:#}")]
    Provision(anyhow::Error),

    /// Instance did not report READY in time.
    #[error("instance {id} not ready after {elapsed:?}")]
    ProvisionTimeout { id: InstanceId, elapsed: Duration },

    /// Backend reported a state that cannot lead to READY.
    #[error("instance {id} reported {state} while provisioning")]
    ProvisionAborted { id: InstanceId, state: ClusterState },

    /// Reading or writing instance objects failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Instance is not in the roster.
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),

    /// Malformed instance ID.
    #[error("invalid instance id: {0}")]
    InvalidId(String),
}

impl PoolError {
    /// Returns true for failures that came from the backend.
    pub fn is_provision_error(&self) -> bool {
        matches!(
            self,
            PoolError::Provision(_)
                | PoolError::ProvisionTimeout { .. }
                | PoolError::ProvisionAborted { .. }
        )
    }
}
