//! Ed25519 machine keys and their registry fingerprints.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::Signer;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// PEM label used by key files from the first klefkictl releases.
const LEGACY_PEM_LABEL: &str = "ED25519 PRIVATE KEY";

const FINGERPRINT_PREFIX: &str = "SHA256:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum KeyError {
    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("not an Ed25519 key")]
    InvalidFormat,

    #[error("fingerprint must be SHA256: followed by an unpadded base64 digest")]
    InvalidFingerprint,
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], KeyError> {
    bytes.try_into().map_err(|_| KeyError::InvalidLength {
        expected: N,
        actual: bytes.len(),
    })
}

/// Heap bytes wiped when dropped: exported key files and opened payloads.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the contents. Copies made from this are not wiped.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes([{} bytes])", self.0.len())
    }
}

/// A machine's signing key. Lives on the machine, never on the broker.
///
/// Deliberately has no `Debug`; the inner key zeroizes itself on drop.
pub struct PrivateKey(ed25519_dalek::SigningKey);

impl PrivateKey {
    #[must_use]
    pub fn generate() -> Self {
        Self(ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng))
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message))
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    /// Encode as a PKCS#8 `PRIVATE KEY` PEM document, the key file handed
    /// to a machine at registration.
    ///
    /// # Errors
    ///
    /// `InvalidFormat` if the encoder fails.
    pub fn to_pkcs8_pem(&self) -> Result<SecretBytes, KeyError> {
        let pem = self
            .0
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|_| KeyError::InvalidFormat)?;
        Ok(SecretBytes::new(pem.as_bytes().to_vec()))
    }

    /// Decode a PKCS#8 PEM key file. The legacy `ED25519 PRIVATE KEY`
    /// label is accepted as well.
    ///
    /// # Errors
    ///
    /// `InvalidFormat` unless the document holds an Ed25519 private key.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, KeyError> {
        let normalized = Zeroizing::new(pem.trim().replace(LEGACY_PEM_LABEL, "PRIVATE KEY"));
        ed25519_dalek::SigningKey::from_pkcs8_pem(&normalized)
            .map(Self)
            .map_err(|_| KeyError::InvalidFormat)
    }

    /// Montgomery-form secret for opening sealed payloads.
    pub(crate) fn to_x25519_secret(&self) -> x25519_dalek::StaticSecret {
        let scalar = Zeroizing::new(self.0.to_scalar_bytes());
        x25519_dalek::StaticSecret::from(*scalar)
    }
}

/// A machine's registered verification key (32 bytes on the wire).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl PublicKey {
    /// # Errors
    ///
    /// `InvalidLength` unless exactly 32 bytes; `InvalidFormat` if they do
    /// not decode to a curve point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        ed25519_dalek::VerifyingKey::from_bytes(&fixed::<32>(bytes)?)
            .map(Self)
            .map_err(|_| KeyError::InvalidFormat)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Strict verification: small-order keys and non-canonical signatures
    /// never pass.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify_strict(message, &signature.0).is_ok()
    }

    /// Montgomery-form recipient key for sealing payloads.
    pub(crate) fn to_x25519(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.0.to_montgomery().to_bytes())
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublicKey")
            .field(&Fingerprint::from_public_key(self).as_str())
            .finish()
    }
}

/// Signature over a challenge nonce (64 bytes on the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// # Errors
    ///
    /// `InvalidLength` unless exactly 64 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        Ok(Self(ed25519_dalek::Signature::from_bytes(&fixed::<64>(bytes)?)))
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

/// `SHA256:` plus the unpadded standard base64 of the key's SHA-256 digest.
///
/// The same string `ssh-keygen -l` prints, and the machine's id everywhere
/// in klefki. Equality is constant-time.
#[derive(Clone, Eq, Hash)]
#[allow(clippy::derived_hash_with_manual_eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[must_use]
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = Sha256::digest(public_key.to_bytes());
        Self(format!("{FINGERPRINT_PREFIX}{}", STANDARD_NO_PAD.encode(digest)))
    }

    /// Validate operator input.
    ///
    /// # Errors
    ///
    /// `InvalidFingerprint` unless `s` is the prefix plus a 32-byte digest.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let digest = s
            .strip_prefix(FINGERPRINT_PREFIX)
            .and_then(|encoded| STANDARD_NO_PAD.decode(encoded).ok())
            .ok_or(KeyError::InvalidFingerprint)?;

        match digest.len() {
            32 => Ok(Self(s.to_owned())),
            _ => Err(KeyError::InvalidFingerprint),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Fingerprint").field(&self.0).finish()
    }
}
