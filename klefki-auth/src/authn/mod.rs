//! Machine challenge verification.

mod error;
mod replay_cache;
mod verify;

pub use error::AuthnError;
pub use replay_cache::BoundedReplayCache;
pub use verify::{
    check_freshness, sign_nonce, verify_nonce, Ed25519Verifier, ReplayCache, SignatureVerifier,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PrivateKey;
    use std::time::Duration;

    #[test]
    fn test_verify_signed_nonce() {
        let private_key = PrivateKey::generate();
        let public_key = private_key.public_key().to_bytes();

        let signature = sign_nonce(&private_key, "abc");

        assert!(verify_nonce(&Ed25519Verifier, &public_key, "abc", &signature.to_bytes()).is_ok());
    }

    #[test]
    fn test_verify_rejects_other_nonce() {
        let private_key = PrivateKey::generate();
        let public_key = private_key.public_key().to_bytes();

        let signature = sign_nonce(&private_key, "abc");

        assert_eq!(
            verify_nonce(&Ed25519Verifier, &public_key, "def", &signature.to_bytes()),
            Err(AuthnError::InvalidSignature)
        );
    }

    #[test]
    fn test_verify_rejects_other_key() {
        let machine_key = PrivateKey::generate();
        let impostor = PrivateKey::generate();

        let signature = sign_nonce(&impostor, "abc");

        assert_eq!(
            verify_nonce(
                &Ed25519Verifier,
                &machine_key.public_key().to_bytes(),
                "abc",
                &signature.to_bytes()
            ),
            Err(AuthnError::InvalidSignature)
        );
    }

    #[test]
    fn test_malformed_inputs_verify_false() {
        let private_key = PrivateKey::generate();
        let public_key = private_key.public_key().to_bytes();
        let signature = sign_nonce(&private_key, "abc").to_bytes();

        assert!(!Ed25519Verifier.verify(&public_key[..16], b"abc", &signature));
        assert!(!Ed25519Verifier.verify(&public_key, b"abc", &signature[..63]));
        assert!(!Ed25519Verifier.verify(&[], b"abc", &[]));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let private_key = PrivateKey::generate();
        let public_key = private_key.public_key().to_bytes();
        let mut signature = sign_nonce(&private_key, "abc").to_bytes();
        signature[10] ^= 0x01;

        assert!(verify_nonce(&Ed25519Verifier, &public_key, "abc", &signature).is_err());
    }

    #[test]
    fn test_freshness_window() {
        let now = 1_700_000_000i64;
        let skew = Duration::from_secs(30);

        assert!(check_freshness(now, now, skew).is_ok());
        assert!(check_freshness(now - 30, now, skew).is_ok());
        assert!(check_freshness(now + 30, now, skew).is_ok());
        assert_eq!(
            check_freshness(now - 31, now, skew),
            Err(AuthnError::TimestampExpired)
        );
        assert_eq!(
            check_freshness(now + 31, now, skew),
            Err(AuthnError::TimestampInFuture)
        );
    }

    #[test]
    fn test_freshness_extreme_values() {
        let skew = Duration::from_secs(30);

        assert_eq!(
            check_freshness(i64::MIN, i64::MAX, skew),
            Err(AuthnError::TimestampExpired)
        );
        assert_eq!(
            check_freshness(i64::MAX, i64::MIN, skew),
            Err(AuthnError::TimestampInFuture)
        );
    }
}
