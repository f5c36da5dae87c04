//! # Klefki Core
//!
//! Session hand-off protocol for the Klefki key broker: a booting machine
//! proves possession of its registered key, an operator supplies an
//! encrypted passphrase, and the machine collects it exactly once.
//!
//! ## Design Principles
//!
//! This crate is intentionally **IO-free**:
//! - No filesystem operations
//! - No network calls
//! - No database interactions
//! - No logging
//!
//! The machine registry is injected through [`MachineRegistry`]; the
//! gRPC transport, SQLite registry and logging live in `klefki-daemon` and
//! `klefki-registry`.
//!
//! Sessions are held in memory only. A broker restart discards every
//! pending hand-off and operators must resubmit.
//!
//! ## Modules
//!
//! - [`identity`] - Machine identities and the registry trait
//! - [`challenge`] - Authentication challenges and challenge time
//! - [`session`] - The guarded session table
//! - [`engine`] - The protocol state machine

pub mod challenge;
pub mod engine;
pub mod error;
pub mod identity;
pub mod session;

pub use challenge::{format_challenge_time, parse_signed_at, AuthChallenge};
pub use engine::{PendingSession, SessionEngine};
pub use error::{BrokerError, RegistryError};
pub use identity::{InMemoryRegistry, MachineId, MachineIdentity, MachineRegistry};
pub use session::{EncryptedKey, PollOutcome, SessionSnapshot, SessionState, SessionTable};
