//! Session protocol engine.
//!
//! Implements the broker operations over a [`SessionTable`], resolving
//! machines through a [`MachineRegistry`] and authenticating polls with a
//! [`SignatureVerifier`]. All authentication happens before the table lock
//! is taken, so a failed poll can never touch session state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use klefki_auth::authn::{
    check_freshness, verify_nonce, Ed25519Verifier, ReplayCache, SignatureVerifier,
};

use crate::challenge::{format_challenge_time, parse_signed_at, AuthChallenge};
use crate::error::BrokerError;
use crate::identity::{MachineId, MachineIdentity, MachineRegistry};
use crate::session::{EncryptedKey, PollOutcome, SessionState, SessionTable};

/// One outstanding hand-off as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSession {
    pub machine_id: MachineId,
    /// `None` if the machine has not polled since the session opened.
    pub last_asked: Option<DateTime<Utc>>,
    /// Recipient key for sealing a submission. `None` if the machine was
    /// removed from the registry while its session was pending.
    pub public_key: Option<Vec<u8>>,
    pub key_ready: bool,
}

/// The broker's protocol state machine.
pub struct SessionEngine<R> {
    registry: R,
    verifier: Arc<dyn SignatureVerifier>,
    sessions: SessionTable,
    max_clock_skew: Option<Duration>,
    replay_cache: Option<Arc<dyn ReplayCache>>,
}

impl<R: MachineRegistry> SessionEngine<R> {
    /// Engine with Ed25519 verification and no optional hardening.
    pub fn new(registry: R) -> Self {
        Self {
            registry,
            verifier: Arc::new(Ed25519Verifier),
            sessions: SessionTable::new(),
            max_clock_skew: None,
            replay_cache: None,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Reject polls whose signed-at time is further than `skew` from the
    /// broker clock.
    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = Some(skew);
        self
    }

    /// Reject polls that reuse a nonce already presented by the machine.
    pub fn with_replay_cache(mut self, cache: Arc<dyn ReplayCache>) -> Self {
        self.replay_cache = Some(cache);
        self
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Current broker time for clients to anchor their signed-at field.
    pub fn challenge_time(&self) -> String {
        format_challenge_time(Utc::now())
    }

    /// A machine asks whether its key has arrived.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` if `signed_at` is missing, malformed or zero
    /// - `NotFound` if the machine is not registered
    /// - `Unauthenticated` if the signature (or an enabled freshness or
    ///   replay check) fails
    /// - `Internal` if the registry fails
    pub fn poll(&self, challenge: &AuthChallenge) -> Result<PollOutcome, BrokerError> {
        self.poll_at(challenge, Utc::now())
    }

    pub fn poll_at(
        &self,
        challenge: &AuthChallenge,
        now: DateTime<Utc>,
    ) -> Result<PollOutcome, BrokerError> {
        let signed_at = parse_signed_at(&challenge.signed_at)?;
        let machine = self.resolve(&challenge.machine_id)?;

        verify_nonce(
            &self.verifier,
            &machine.public_key,
            &challenge.nonce,
            &challenge.signature,
        )
        .map_err(|_| BrokerError::Unauthenticated)?;

        if let Some(skew) = self.max_clock_skew {
            check_freshness(signed_at.timestamp(), now.timestamp(), skew)
                .map_err(|_| BrokerError::Unauthenticated)?;
        }

        // Only signed requests reach the cache, so forged polls cannot
        // burn a legitimate machine's nonces.
        if let Some(cache) = &self.replay_cache {
            if !cache.check_and_insert(machine.id.as_str(), &challenge.nonce) {
                return Err(BrokerError::Unauthenticated);
            }
        }

        Ok(self.sessions.poll(&machine.id, now))
    }

    /// An operator hands over ciphertext for a machine. Last write wins.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the machine is not registered
    /// - `InvalidRequest` if the ciphertext is empty
    /// - `Internal` if the registry fails
    pub fn submit_key(&self, machine_id: &MachineId, key: EncryptedKey) -> Result<(), BrokerError> {
        let machine = self.resolve(machine_id)?;

        if key.is_empty() {
            return Err(BrokerError::invalid("encrypted key is empty"));
        }

        self.sessions.store_key(&machine.id, key, Utc::now());
        Ok(())
    }

    /// Every outstanding session, sorted by machine id.
    ///
    /// The table is copied under its lock; public keys are resolved after
    /// the lock is released.
    ///
    /// # Errors
    ///
    /// `Internal` if the registry fails.
    pub fn list_pending(&self) -> Result<Vec<PendingSession>, BrokerError> {
        self.sessions
            .snapshot()
            .into_iter()
            .map(|session| -> Result<PendingSession, BrokerError> {
                let identity = self.registry.lookup(&session.machine_id)?;
                Ok(PendingSession {
                    machine_id: session.machine_id,
                    last_asked: session.last_asked,
                    public_key: identity.map(|m| m.public_key),
                    key_ready: session.state == SessionState::KeyReady,
                })
            })
            .collect()
    }

    /// Drop sessions with no activity within `max_age`. Returns the ids removed.
    pub fn purge_expired(&self, max_age: Duration) -> Vec<MachineId> {
        self.purge_expired_at(max_age, Utc::now())
    }

    pub fn purge_expired_at(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<MachineId> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return Vec::new();
        };
        self.sessions.purge_older_than(cutoff)
    }

    pub fn pending_count(&self) -> usize {
        self.sessions.len()
    }

    fn resolve(&self, machine_id: &MachineId) -> Result<MachineIdentity, BrokerError> {
        self.registry
            .lookup(machine_id)?
            .ok_or(BrokerError::NotFound)
    }
}
