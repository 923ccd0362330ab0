//! Readiness polling for device workloads

use tracing::{debug, warn};

use super::ProvisionError;
use crate::cluster::{PodStatus, WorkloadApi, WorkloadError};
use crate::poll::{Backoff, Sleeper};

/// Poll until the pod is running with every container ready.
///
/// A terminal phase, or the pod disappearing after it was first seen, ends
/// the wait immediately. Not-found before the first sighting and transport
/// errors are retried.
pub async fn wait_ready(
    workloads: &dyn WorkloadApi,
    sleeper: &dyn Sleeper,
    namespace: &str,
    name: &str,
    backoff: &Backoff,
) -> Result<PodStatus, ProvisionError> {
    let mut seen = false;
    for attempt in 0..backoff.max_attempts {
        match workloads.pod_status(namespace, name).await {
            Ok(status) if status.is_ready() => {
                debug!("{} ready after {} polls", name, attempt + 1);
                return Ok(status);
            }
            Ok(status) if status.is_terminal() => {
                return Err(ProvisionError::TerminalPhase {
                    name: name.to_string(),
                    phase: status.phase,
                });
            }
            Ok(status) => {
                seen = true;
                debug!("{} is {:?}, waiting", name, status.phase);
            }
            Err(WorkloadError::NotFound(_)) if seen => {
                return Err(ProvisionError::Vanished(name.to_string()));
            }
            Err(WorkloadError::NotFound(_)) => debug!("{} not visible yet", name),
            Err(WorkloadError::Transport(e)) => warn!("Polling {} failed: {}", name, e),
            Err(e) => return Err(ProvisionError::Workload(e)),
        }

        if attempt + 1 < backoff.max_attempts {
            sleeper.sleep(backoff.delay(attempt)).await;
        }
    }

    Err(ProvisionError::Timeout {
        name: name.to_string(),
        attempts: backoff.max_attempts,
    })
}

/// Poll until the pod is gone, so a workload of the same name can be created
pub async fn wait_gone(
    workloads: &dyn WorkloadApi,
    sleeper: &dyn Sleeper,
    namespace: &str,
    name: &str,
    backoff: &Backoff,
) -> Result<(), ProvisionError> {
    for attempt in 0..backoff.max_attempts {
        match workloads.pod_status(namespace, name).await {
            Err(WorkloadError::NotFound(_)) => return Ok(()),
            Err(WorkloadError::Transport(e)) => warn!("Polling {} failed: {}", name, e),
            Err(e) => return Err(ProvisionError::Workload(e)),
            Ok(_) => debug!("{} still terminating", name),
        }
        if attempt + 1 < backoff.max_attempts {
            sleeper.sleep(backoff.delay(attempt)).await;
        }
    }
    Err(ProvisionError::Timeout {
        name: name.to_string(),
        attempts: backoff.max_attempts,
    })
}
