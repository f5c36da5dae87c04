//! Durable machine registry for Klefki.
//!
//! Machines are stored in SQLite, keyed by the fingerprint of their
//! Ed25519 public key. [`MachineStore`] implements
//! [`klefki_core::MachineRegistry`] from an in-memory snapshot so the
//! broker's lookup never waits on the database.

mod store;

pub use store::{MachineRecord, MachineStore, StoreError};
