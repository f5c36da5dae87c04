/// Why a poll's proof of key possession was refused.
///
/// Callers should not echo the variant to the machine; the broker collapses
/// all of them into one unauthenticated reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AuthnError {
    /// Bad signature, or a key or signature that does not even decode.
    #[error("invalid signature")]
    InvalidSignature,

    #[error("signed_at is older than the allowed skew")]
    TimestampExpired,

    #[error("signed_at is ahead of the allowed skew")]
    TimestampInFuture,

    #[error("nonce already used by this machine")]
    ReplayDetected,
}
