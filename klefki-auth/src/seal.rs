//! Sealing passphrases to a machine's registered key.
//!
//! The operator seals with the machine's Ed25519 public key; only the
//! holder of the matching private key can open the envelope. The broker
//! stores and forwards envelopes as opaque bytes.
//!
//! Envelope layout:
//!
//! | Field         | Size | Description                              |
//! |---------------|------|------------------------------------------|
//! | version       | 1    | `0x01`                                   |
//! | ephemeral_pub | 32   | sender's ephemeral X25519 public key     |
//! | nonce         | 24   | XChaCha20-Poly1305 nonce                 |
//! | ciphertext    | var  | encrypted passphrase + 16-byte tag       |
//!
//! The AEAD key is `SHA-256(domain || shared || ephemeral_pub || recipient_pub)`
//! where `shared` is X25519 between the ephemeral key and the Montgomery
//! form of the recipient's Ed25519 key. The version byte and ephemeral key
//! are authenticated as associated data.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroizing;

use crate::identity::{PrivateKey, PublicKey, SecretBytes};

const SEAL_VERSION: u8 = 0x01;
const KDF_DOMAIN: &[u8] = b"klefki-seal-v1";
const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + EPHEMERAL_LEN;

/// Errors from sealing or opening an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SealError {
    /// The envelope is too short or has an unknown version.
    #[error("malformed envelope")]
    Malformed,

    /// The envelope was not sealed to this key, or was tampered with.
    #[error("envelope could not be opened")]
    Decryption,

    /// Encryption failed.
    #[error("envelope could not be sealed")]
    Encryption,
}

/// Seal `plaintext` so that only `recipient`'s private key can open it.
///
/// # Errors
///
/// Returns `SealError::Encryption` if the cipher rejects the input.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
    let recipient = recipient.to_x25519();

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = X25519PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient);

    let key = derive_key(shared.as_bytes(), &ephemeral_pub, &recipient);

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut envelope = Vec::with_capacity(HEADER_LEN + NONCE_LEN + plaintext.len() + TAG_LEN);
    envelope.push(SEAL_VERSION);
    envelope.extend_from_slice(ephemeral_pub.as_bytes());

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_slice())
        .map_err(|_| SealError::Encryption)?;
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &envelope[..HEADER_LEN],
            },
        )
        .map_err(|_| SealError::Encryption)?;

    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Open an envelope with the machine's private key.
///
/// # Errors
///
/// Returns `SealError::Malformed` for truncated or unknown envelopes and
/// `SealError::Decryption` when authentication fails.
pub fn open(private_key: &PrivateKey, envelope: &[u8]) -> Result<SecretBytes, SealError> {
    if envelope.len() < HEADER_LEN + NONCE_LEN + TAG_LEN || envelope[0] != SEAL_VERSION {
        return Err(SealError::Malformed);
    }

    let (header, rest) = envelope.split_at(HEADER_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let mut ephemeral_bytes = [0u8; EPHEMERAL_LEN];
    ephemeral_bytes.copy_from_slice(&header[1..]);
    let ephemeral_pub = X25519PublicKey::from(ephemeral_bytes);

    let secret = private_key.to_x25519_secret();
    let shared = secret.diffie_hellman(&ephemeral_pub);
    // Low-order ephemeral points yield an all-zero secret
    if !shared.was_contributory() {
        return Err(SealError::Decryption);
    }

    let recipient = X25519PublicKey::from(&secret);
    let key = derive_key(shared.as_bytes(), &ephemeral_pub, &recipient);

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_slice())
        .map_err(|_| SealError::Decryption)?;
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: header,
            },
        )
        .map_err(|_| SealError::Decryption)?;

    Ok(SecretBytes::new(plaintext))
}

fn derive_key(
    shared: &[u8; 32],
    ephemeral_pub: &X25519PublicKey,
    recipient: &X25519PublicKey,
) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(KDF_DOMAIN);
    hasher.update(shared);
    hasher.update(ephemeral_pub.as_bytes());
    hasher.update(recipient.as_bytes());
    Zeroizing::new(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_opens_sealed_passphrase() {
        let machine = PrivateKey::generate();

        let envelope = seal(&machine.public_key(), b"correct horse battery staple").unwrap();
        let opened = open(&machine, &envelope).unwrap();

        assert_eq!(opened.as_bytes(), b"correct horse battery staple");
    }

    #[test]
    fn test_envelope_layout() {
        let machine = PrivateKey::generate();
        let envelope = seal(&machine.public_key(), b"pw").unwrap();

        assert_eq!(envelope[0], SEAL_VERSION);
        assert_eq!(envelope.len(), HEADER_LEN + NONCE_LEN + 2 + TAG_LEN);
    }

    #[test]
    fn test_sealing_is_randomized() {
        let machine = PrivateKey::generate();

        let a = seal(&machine.public_key(), b"pw").unwrap();
        let b = seal(&machine.public_key(), b"pw").unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_other_machine_cannot_open() {
        let machine = PrivateKey::generate();
        let other = PrivateKey::generate();

        let envelope = seal(&machine.public_key(), b"secret").unwrap();

        assert_eq!(open(&other, &envelope).unwrap_err(), SealError::Decryption);
    }

    #[test]
    fn test_tampered_envelope_rejected() {
        let machine = PrivateKey::generate();
        let mut envelope = seal(&machine.public_key(), b"secret").unwrap();

        let last = envelope.len() - 1;
        envelope[last] ^= 0xff;
        assert_eq!(open(&machine, &envelope).unwrap_err(), SealError::Decryption);
    }

    #[test]
    fn test_swapped_ephemeral_key_rejected() {
        let machine = PrivateKey::generate();
        let mut envelope = seal(&machine.public_key(), b"secret").unwrap();
        let donor = seal(&machine.public_key(), b"secret").unwrap();

        envelope[1..HEADER_LEN].copy_from_slice(&donor[1..HEADER_LEN]);
        assert_eq!(open(&machine, &envelope).unwrap_err(), SealError::Decryption);
    }

    #[test]
    fn test_malformed_envelopes() {
        let machine = PrivateKey::generate();

        assert_eq!(open(&machine, &[]).unwrap_err(), SealError::Malformed);
        assert_eq!(
            open(&machine, &[SEAL_VERSION; HEADER_LEN + NONCE_LEN]).unwrap_err(),
            SealError::Malformed
        );

        let mut envelope = seal(&machine.public_key(), b"secret").unwrap();
        envelope[0] = 0x02;
        assert_eq!(open(&machine, &envelope).unwrap_err(), SealError::Malformed);
    }

    #[test]
    fn test_pem_restored_key_opens() {
        let machine = PrivateKey::generate();
        let pem = machine.to_pkcs8_pem().unwrap();
        let restored =
            PrivateKey::from_pkcs8_pem(std::str::from_utf8(pem.as_bytes()).unwrap()).unwrap();

        let envelope = seal(&machine.public_key(), b"via pem").unwrap();
        assert_eq!(open(&restored, &envelope).unwrap().as_bytes(), b"via pem");
    }
}
