//! Snapshot parser module.
//!
//! Turns raw device CLI output into typed snapshot records. Output that does
//! not have the expected shape is rejected as a whole, never half-applied.

mod bgp;
mod interface;

pub use bgp::*;
pub use interface::*;

use crate::db::{BgpStatus, InterfaceCounters, InterfaceStatus};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Parse error types. `raw` carries the output that could not be understood.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("unexpected output for '{command}': {reason}")]
pub struct ParseError {
    pub command: String,
    pub reason: String,
    pub raw: String,
}

impl ParseError {
    pub fn new(command: &str, reason: impl Into<String>, raw: &str) -> Self {
        Self {
            command: command.to_string(),
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }
}

/// One peer row as observed in a poll. Prefix counts are `None` when the
/// device did not report them this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct BgpPeerRecord {
    pub peer_address: String,
    pub peer_asn: u32,
    pub description: Option<String>,
    pub status: BgpStatus,
    pub uptime_seconds: u64,
    pub prefixes_received: Option<u64>,
    pub prefixes_sent: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BgpSnapshot {
    pub taken_at: DateTime<Utc>,
    pub peers: Vec<BgpPeerRecord>,
}

/// One interface as observed in a poll. `stats` is `None` when the counters
/// could not be read this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceRecord {
    pub name: String,
    pub description: Option<String>,
    pub status: InterfaceStatus,
    pub stats: Option<InterfaceCounters>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceSnapshot {
    pub taken_at: DateTime<Utc>,
    pub interfaces: Vec<InterfaceRecord>,
}

/// Reject empty output and the device's own error responses.
fn check_device_output(command: &str, output: &str) -> Result<(), ParseError> {
    if output.trim().is_empty() {
        return Err(ParseError::new(command, "empty output", output));
    }

    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("Error:") || line == "^" {
            return Err(ParseError::new(command, format!("device error: {}", line), output));
        }
    }

    Ok(())
}
