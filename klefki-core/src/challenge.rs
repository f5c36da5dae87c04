//! Authentication challenges and the challenge clock.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::BrokerError;
use crate::identity::MachineId;

/// Unix seconds of `0001-01-01T00:00:00Z`, the zero time clients send when
/// they never fetched the broker clock.
const ZERO_TIME_UNIX: i64 = -62_135_596_800;

/// A machine's proof of key possession, built per request and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub machine_id: MachineId,
    /// Client-chosen nonce; the signature covers exactly its UTF-8 bytes.
    pub nonce: String,
    pub signature: Vec<u8>,
    /// Broker time the client anchored to, as returned by `GetTime`.
    /// Not covered by the signature.
    pub signed_at: String,
}

/// Format a time the way `GetTime` hands it out: RFC 3339, nanosecond
/// precision, `Z` suffix.
pub fn format_challenge_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a client's signed-at field.
///
/// # Errors
///
/// `InvalidRequest` when the field is empty, not RFC 3339, or the zero time.
pub fn parse_signed_at(raw: &str) -> Result<DateTime<Utc>, BrokerError> {
    if raw.trim().is_empty() {
        return Err(BrokerError::invalid("signed_at is required"));
    }

    let parsed = DateTime::parse_from_rfc3339(raw.trim())
        .map_err(|e| BrokerError::invalid(format!("signed_at is not RFC 3339: {e}")))?
        .with_timezone(&Utc);

    if parsed.timestamp() == ZERO_TIME_UNIX && parsed.timestamp_subsec_nanos() == 0 {
        return Err(BrokerError::invalid("signed_at is the zero time"));
    }

    Ok(parsed)
}
