//! Error taxonomy for broker operations.

/// A per-request failure.
///
/// "Key not available" is deliberately absent: it is a normal poll
/// outcome, see [`crate::PollOutcome::NotAvailable`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The signature did not verify against the registered key.
    #[error("authentication failed")]
    Unauthenticated,

    /// No machine is registered under the given id.
    #[error("machine not found")]
    NotFound,

    /// The request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A collaborator failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }
}

/// A machine registry lookup failed for reasons other than "not found".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("machine registry unavailable: {0}")]
pub struct RegistryError(pub String);

impl From<RegistryError> for BrokerError {
    fn from(err: RegistryError) -> Self {
        Self::Internal(err.to_string())
    }
}
