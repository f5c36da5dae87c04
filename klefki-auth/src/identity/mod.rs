//! Machine key material.
//!
//! A machine holds a [`PrivateKey`]; the registry stores its [`PublicKey`]
//! under the key's [`Fingerprint`]. Polls carry a [`Signature`] over the
//! challenge nonce.
//!
//! ```
//! use klefki_auth::identity::{Fingerprint, PrivateKey};
//!
//! let key = PrivateKey::generate();
//! let machine_id = Fingerprint::from_public_key(&key.public_key());
//! assert!(machine_id.as_str().starts_with("SHA256:"));
//!
//! let signature = key.sign(b"nonce");
//! assert!(key.public_key().verify(b"nonce", &signature));
//! ```

mod keys;

pub use keys::{Fingerprint, KeyError, PrivateKey, PublicKey, SecretBytes, Signature};
