//! Database module for peerwatch.
//!
//! Provides SQLite storage for latest entity state, history, events and the
//! command audit log, with embedded migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;
