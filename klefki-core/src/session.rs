//! Session table: the broker's only shared mutable state.
//!
//! One entry per machine with a hand-off in flight. Every method takes the
//! table lock exactly once and does its whole check-and-mutate sequence
//! under it, with no await point or IO inside. A poll that consumes a key
//! removes the entry in the same critical section that read it, which is
//! what makes delivery exactly-once.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::identity::MachineId;

/// Operator-supplied ciphertext addressed to a machine's public key.
///
/// Opaque to the broker: there is no way to decrypt it from here.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedKey(Vec<u8>);

impl EncryptedKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for EncryptedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptedKey([{} bytes])", self.0.len())
    }
}

/// Result of a machine's authenticated poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The pending key was handed over and the session consumed.
    Delivered(EncryptedKey),
    /// Nothing submitted yet; poll again later.
    NotAvailable,
}

/// Conceptual hand-off state of a machine with an entry in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingKey,
    KeyReady,
}

#[derive(Debug)]
struct Session {
    created_at: DateTime<Utc>,
    /// `None` until the machine polls (sessions opened by a submission).
    last_asked: Option<DateTime<Utc>>,
    submitted_at: Option<DateTime<Utc>>,
    encrypted_key: Option<EncryptedKey>,
}

impl Session {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            last_asked: None,
            submitted_at: None,
            encrypted_key: None,
        }
    }

    fn last_activity(&self) -> DateTime<Utc> {
        [self.last_asked, self.submitted_at]
            .into_iter()
            .flatten()
            .fold(self.created_at, std::cmp::max)
    }
}

/// Point-in-time copy of one entry, safe to hold after the lock is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub machine_id: MachineId,
    pub created_at: DateTime<Utc>,
    pub last_asked: Option<DateTime<Utc>>,
    pub state: SessionState,
}

/// Mutex-guarded map from machine id to session.
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<MachineId, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic inside a critical section cannot leave an entry half-updated:
    // every mutation is a single field write or a single remove.
    fn lock(&self) -> MutexGuard<'_, HashMap<MachineId, Session>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an authenticated poll and hand over the key if one is ready.
    ///
    /// Get-or-create, heartbeat and consumption happen under one lock.
    pub fn poll(&self, machine_id: &MachineId, now: DateTime<Utc>) -> PollOutcome {
        let mut sessions = self.lock();

        let session = sessions
            .entry(machine_id.clone())
            .or_insert_with(|| Session::new(now));
        session.last_asked = Some(now);

        match session.encrypted_key.take() {
            Some(key) => {
                sessions.remove(machine_id);
                PollOutcome::Delivered(key)
            }
            None => PollOutcome::NotAvailable,
        }
    }

    /// Set or overwrite the pending key. Leaves `last_asked` untouched.
    pub fn store_key(&self, machine_id: &MachineId, key: EncryptedKey, now: DateTime<Utc>) {
        let mut sessions = self.lock();

        let session = sessions
            .entry(machine_id.clone())
            .or_insert_with(|| Session::new(now));
        session.encrypted_key = Some(key);
        session.submitted_at = Some(now);
    }

    /// Consistent copy of every entry, sorted by machine id.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut entries: Vec<SessionSnapshot> = {
            let sessions = self.lock();
            sessions
                .iter()
                .map(|(id, session)| SessionSnapshot {
                    machine_id: id.clone(),
                    created_at: session.created_at,
                    last_asked: session.last_asked,
                    state: if session.encrypted_key.is_some() {
                        SessionState::KeyReady
                    } else {
                        SessionState::AwaitingKey
                    },
                })
                .collect()
        };
        entries.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        entries
    }

    /// Drop every session whose last activity is strictly before `cutoff`.
    ///
    /// Returns the ids removed.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Vec<MachineId> {
        let mut sessions = self.lock();

        let mut purged = Vec::new();
        sessions.retain(|id, session| {
            let keep = session.last_activity() >= cutoff;
            if !keep {
                purged.push(id.clone());
            }
            keep
        });
        purged
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
