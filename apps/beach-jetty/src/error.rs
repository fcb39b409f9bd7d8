//! Relay error types.

use thiserror::Error;

use crate::control_plane::StoreError;

#[derive(Error, Debug)]
pub enum RelayError {
    /// A registration arrived with no unmatched transport connection waiting.
    #[error("No pending connection found")]
    NoPendingConnection,

    /// Writing to a peer transport failed. The session stays registered until
    /// disconnect detection or the reaper removes it.
    #[error("delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("control plane unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

pub type RelayResult<T> = Result<T, RelayError>;
