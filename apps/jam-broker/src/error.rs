use thiserror::Error;

use crate::orchestrator::OrchestratorError;
use crate::store::StoreError;

/// Failures surfaced by [`crate::lifecycle::SessionBroker`] operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Provision(#[from] OrchestratorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sessions were purged while session {session_id} was being created")]
    PurgedDuringProvision { session_id: String },
}
