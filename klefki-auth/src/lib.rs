//! Pure authentication library for Klefki.
//!
//! This crate is intentionally IO-free:
//! - No filesystem operations
//! - No network calls
//! - No database interactions
//! - No logging
//!
//! Dependencies are injected via traits:
//! - [`authn::SignatureVerifier`] - Pluggable signature scheme for machine challenges
//! - [`authn::ReplayCache`] - Optional nonce tracking for replay rejection
//!
//! # Example
//!
//! ```
//! use klefki_auth::authn::{sign_nonce, verify_nonce, Ed25519Verifier};
//! use klefki_auth::identity::PrivateKey;
//!
//! // Machine signs the challenge nonce with its registered key
//! let key = PrivateKey::generate();
//! let signature = sign_nonce(&key, "3f1c6a2e-nonce");
//!
//! // Broker verifies against the public key from the registry
//! let public_key = key.public_key().to_bytes();
//! assert!(verify_nonce(&Ed25519Verifier, &public_key, "3f1c6a2e-nonce", &signature.to_bytes()).is_ok());
//! ```

pub mod authn;
pub mod identity;
pub mod seal;

pub use authn::{
    check_freshness, sign_nonce, verify_nonce, AuthnError, Ed25519Verifier, BoundedReplayCache,
    ReplayCache, SignatureVerifier,
};
pub use identity::{Fingerprint, KeyError, PrivateKey, PublicKey, SecretBytes, Signature};
pub use seal::{open, seal, SealError};
