//! Klefki Daemon - the key broker service
//!
//! Serves the Klefki gRPC API over an in-memory session table backed by
//! the SQLite machine registry. Sessions do not survive a restart.

pub mod config;
pub mod convert;
pub mod maintenance;
pub mod server;
pub mod services;

pub use config::ServeArgs;
pub use server::{build_engine, run, BrokerEngine};
pub use services::{KlefkiBroker, PollRateLimiter};
