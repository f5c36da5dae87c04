//! Challenge verification.
//!
//! A machine proves possession of its registered key by signing the exact
//! bytes of a nonce. Nothing else is covered by the signature: the
//! signed-at timestamp travels alongside it unsigned, which is why
//! [`check_freshness`] and [`ReplayCache`] exist as opt-in hardening.

use std::time::Duration;

use crate::identity::{PrivateKey, PublicKey, Signature};

use super::error::AuthnError;

/// A pluggable signature primitive.
///
/// Implementations must be deterministic and non-malleable. Any failure,
/// including key or signature bytes of the wrong shape, is reported as
/// `false` so callers cannot distinguish "wrong key" from "bad signature".
pub trait SignatureVerifier: Send + Sync {
    /// Returns `true` iff `signature` is valid over `message` under `public_key`.
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519 with strict verification (rejects small-order keys and
/// non-canonical signatures).
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(public_key) = PublicKey::from_bytes(public_key) else {
            return false;
        };
        let Ok(signature) = Signature::from_bytes(signature) else {
            return false;
        };
        public_key.verify(message, &signature)
    }
}

impl<V: SignatureVerifier + ?Sized> SignatureVerifier for std::sync::Arc<V> {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        (**self).verify(public_key, message, signature)
    }
}

/// Trait for replay detection.
///
/// # Thread Safety
///
/// Uses `&self` to allow concurrent access. Implementations should
/// use interior mutability (e.g., `Mutex`, `DashMap`).
///
/// # Atomicity
///
/// `check_and_insert` **MUST be atomic**: no other thread may observe a
/// state where the nonce has been checked but not yet recorded. Otherwise
/// two concurrent polls presenting the same nonce could both pass.
pub trait ReplayCache: Send + Sync {
    /// Check if the nonce is new for this machine and record it atomically.
    ///
    /// Returns `true` if the nonce was new and has been recorded.
    /// Returns `false` if this is a replay.
    fn check_and_insert(&self, machine_id: &str, nonce: &str) -> bool;
}

/// Verify that `signature` was produced over `nonce` by the key matching
/// `public_key`.
///
/// # Errors
///
/// Returns `AuthnError::InvalidSignature` on any failure.
pub fn verify_nonce(
    verifier: &impl SignatureVerifier,
    public_key: &[u8],
    nonce: &str,
    signature: &[u8],
) -> Result<(), AuthnError> {
    if verifier.verify(public_key, nonce.as_bytes(), signature) {
        Ok(())
    } else {
        Err(AuthnError::InvalidSignature)
    }
}

/// Sign a nonce the way a machine client does before polling.
#[must_use]
pub fn sign_nonce(private_key: &PrivateKey, nonce: &str) -> Signature {
    private_key.sign(nonce.as_bytes())
}

/// Check a signed-at timestamp (Unix seconds) against the server clock.
///
/// # Errors
///
/// Returns `TimestampExpired` if `signed_at` is older than `max_skew`, or
/// `TimestampInFuture` if it is further ahead than `max_skew`.
pub fn check_freshness(
    signed_at_unix: i64,
    now_unix: i64,
    max_skew: Duration,
) -> Result<(), AuthnError> {
    let max_skew = i64::try_from(max_skew.as_secs()).unwrap_or(i64::MAX);

    // Saturating arithmetic handles extreme client-supplied values
    if now_unix.saturating_sub(signed_at_unix) > max_skew {
        return Err(AuthnError::TimestampExpired);
    }
    if signed_at_unix.saturating_sub(now_unix) > max_skew {
        return Err(AuthnError::TimestampInFuture);
    }
    Ok(())
}
