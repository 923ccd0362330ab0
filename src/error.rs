//! Top-level error for orchestration calls

use thiserror::Error;

use crate::cluster::WorkloadError;
use crate::fabric::{FabricError, PolicyError};
use crate::provision::ProvisionError;
use crate::topology::{AllocationError, ModelError, StoreError};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Fabric(#[from] FabricError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Workload(#[from] WorkloadError),

    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    #[error("No router reachable from switch '{0}'")]
    NoRoute(String),

    #[error("'{0}' and '{1}' are already linked")]
    AlreadyLinked(String, String),

    #[error("'{0}' and '{1}' are not linked")]
    NotLinked(String, String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Errors raised before anything was written
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Policy(_)
                | OrchestratorError::NodeNotFound(_)
                | OrchestratorError::NoRoute(_)
                | OrchestratorError::AlreadyLinked(_, _)
                | OrchestratorError::NotLinked(_, _)
                | OrchestratorError::Unsupported(_)
                | OrchestratorError::Model(_)
        )
    }
}
