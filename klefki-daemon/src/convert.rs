//! Conversion functions between core types and proto types.
//!
//! We use free functions instead of From impls due to Rust's orphan rules
//! (can't implement From<CoreType> for ProtoType when both are external).

use klefki_core::{format_challenge_time, BrokerError, PendingSession};
use klefki_proto::Machine;
use tonic::Status;

/// Operator view of one pending session.
///
/// `last_asked` is empty when the machine has not polled yet, and
/// `public_key` is empty when the machine has left the registry.
pub fn pending_to_proto(session: PendingSession) -> Machine {
    Machine {
        id: session.machine_id.0,
        public_key: session.public_key.unwrap_or_default(),
        last_asked: session
            .last_asked
            .map(format_challenge_time)
            .unwrap_or_default(),
        key_ready: session.key_ready,
    }
}

/// Map a broker error onto its gRPC status.
///
/// Internal details never reach the caller; log them before converting.
pub fn broker_error_to_status(err: &BrokerError) -> Status {
    match err {
        BrokerError::Unauthenticated => Status::unauthenticated("authentication failed"),
        BrokerError::NotFound => Status::not_found("machine not found"),
        BrokerError::InvalidRequest(msg) => Status::invalid_argument(msg.clone()),
        BrokerError::Internal(_) => Status::internal("internal error"),
    }
}
