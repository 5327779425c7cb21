//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which "latest state" table an entity lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Bgp,
    Interface,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Bgp => write!(f, "bgp"),
            EntityKind::Interface => write!(f, "interface"),
        }
    }
}

/// Error returned when a stored or parsed enum value is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown value: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// BGP finite state machine state as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BgpStatus {
    Established,
    Idle,
    Active,
    Connect,
    OpenSent,
    OpenConfirm,
    Down,
}

impl BgpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BgpStatus::Established => "Established",
            BgpStatus::Idle => "Idle",
            BgpStatus::Active => "Active",
            BgpStatus::Connect => "Connect",
            BgpStatus::OpenSent => "OpenSent",
            BgpStatus::OpenConfirm => "OpenConfirm",
            BgpStatus::Down => "Down",
        }
    }

    pub fn is_up(&self) -> bool {
        *self == BgpStatus::Established
    }

    /// Abnormal on first sight.
    pub fn is_abnormal(&self) -> bool {
        *self == BgpStatus::Down
    }
}

impl fmt::Display for BgpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BgpStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "established" => Ok(BgpStatus::Established),
            "idle" => Ok(BgpStatus::Idle),
            "active" => Ok(BgpStatus::Active),
            "connect" => Ok(BgpStatus::Connect),
            "opensent" => Ok(BgpStatus::OpenSent),
            "openconfirm" => Ok(BgpStatus::OpenConfirm),
            "down" => Ok(BgpStatus::Down),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

/// Operational state of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceStatus {
    Up,
    Down,
    AdminDown,
}

impl InterfaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceStatus::Up => "up",
            InterfaceStatus::Down => "down",
            InterfaceStatus::AdminDown => "admin_down",
        }
    }

    pub fn is_up(&self) -> bool {
        *self == InterfaceStatus::Up
    }

    pub fn is_abnormal(&self) -> bool {
        !self.is_up()
    }
}

impl fmt::Display for InterfaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterfaceStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(InterfaceStatus::Up),
            "down" => Ok(InterfaceStatus::Down),
            "admin_down" => Ok(InterfaceStatus::AdminDown),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

/// Per-entity flap bookkeeping, persisted on the latest-state row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlapState {
    /// Status transitions still inside the flap window, oldest first.
    pub recent_transitions: Vec<DateTime<Utc>>,
    /// Set once a flapping event has fired for the current window.
    pub alerted: bool,
}

/// Latest known state of one BGP peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BgpSession {
    pub peer_address: String,
    pub peer_asn: u32,
    pub description: Option<String>,
    pub status: BgpStatus,
    pub uptime_seconds: u64,
    pub prefixes_received: u64,
    pub prefixes_sent: u64,
    pub last_state_change: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub flap: FlapState,
}

/// Rates and counters read from one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub capacity_bps: u64,
    pub in_bps: u64,
    pub out_bps: u64,
    pub in_pps: u64,
    pub out_pps: u64,
    pub errors_in: u64,
    pub errors_out: u64,
    pub discards_in: u64,
    pub discards_out: u64,
}

impl InterfaceCounters {
    /// Inbound utilisation in percent of capacity; zero when capacity is unknown.
    pub fn utilization_in(&self) -> f64 {
        utilization(self.in_bps, self.capacity_bps)
    }

    pub fn utilization_out(&self) -> f64 {
        utilization(self.out_bps, self.capacity_bps)
    }
}

fn utilization(bps: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        return 0.0;
    }
    bps as f64 / capacity as f64 * 100.0
}

/// Latest known state of one interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceState {
    pub name: String,
    pub description: Option<String>,
    pub status: InterfaceStatus,
    pub counters: InterfaceCounters,
    /// Whether `counters` holds a real reading, even an all-zero one.
    pub counters_seen: bool,
    pub utilization_in: f64,
    pub utilization_out: f64,
    pub last_state_change: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub flap: FlapState,
    /// Set while the error/discard delta stays above the breach threshold.
    pub error_breached: bool,
}

/// One row of BGP status history.
#[derive(Debug, Clone, PartialEq)]
pub struct BgpHistoryPoint {
    pub peer_address: String,
    pub status: BgpStatus,
    pub prefixes_received: u64,
    pub prefixes_sent: u64,
    pub timestamp: DateTime<Utc>,
}

impl From<&BgpSession> for BgpHistoryPoint {
    fn from(session: &BgpSession) -> Self {
        Self {
            peer_address: session.peer_address.clone(),
            status: session.status,
            prefixes_received: session.prefixes_received,
            prefixes_sent: session.prefixes_sent,
            timestamp: session.last_updated,
        }
    }
}

/// One row of interface traffic history.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceHistoryPoint {
    pub interface_name: String,
    pub counters: InterfaceCounters,
    pub utilization_in: f64,
    pub utilization_out: f64,
    pub timestamp: DateTime<Utc>,
}

impl From<&InterfaceState> for InterfaceHistoryPoint {
    fn from(state: &InterfaceState) -> Self {
        Self {
            interface_name: state.name.clone(),
            counters: state.counters,
            utilization_in: state.utilization_in,
            utilization_out: state.utilization_out,
            timestamp: state.last_updated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    BgpUp,
    BgpDown,
    InterfaceUp,
    InterfaceDown,
    HighErrors,
    Flapping,
    System,
    Info,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BgpUp => "bgp_up",
            EventType::BgpDown => "bgp_down",
            EventType::InterfaceUp => "interface_up",
            EventType::InterfaceDown => "interface_down",
            EventType::HighErrors => "high_errors",
            EventType::Flapping => "flapping",
            EventType::System => "system",
            EventType::Info => "info",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bgp_up" => Ok(EventType::BgpUp),
            "bgp_down" => Ok(EventType::BgpDown),
            "interface_up" => Ok(EventType::InterfaceUp),
            "interface_down" => Ok(EventType::InterfaceDown),
            "high_errors" => Ok(EventType::HighErrors),
            "flapping" => Ok(EventType::Flapping),
            "system" => Ok(EventType::System),
            "info" => Ok(EventType::Info),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Who wrote an event row: the diff engine, or the alert manager on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    Detector,
    Alert,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::Detector => "detector",
            EventOrigin::Alert => "alert",
        }
    }
}

impl FromStr for EventOrigin {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detector" => Ok(EventOrigin::Detector),
            "alert" => Ok(EventOrigin::Alert),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Structured event payload, stored as JSON in the `details` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetails {
    StatusChange {
        from: String,
        to: String,
    },
    FirstSeen {
        status: String,
    },
    Flapping {
        transitions: usize,
        window_secs: u64,
    },
    ErrorBreach {
        errors_delta: u64,
        discards_delta: u64,
        error_threshold: u64,
        discard_threshold: u64,
    },
    PollFailure {
        domain: String,
        consecutive_failures: u32,
        error: String,
    },
    PollRecovered {
        domain: String,
        failed_polls: u32,
    },
}

/// An event that has not been written yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub severity: Severity,
    pub source: String,
    pub message: String,
    pub details: Option<EventDetails>,
    pub origin: EventOrigin,
    pub source_event_id: Option<i64>,
}

impl NewEvent {
    pub fn detected(
        event_type: EventType,
        severity: Severity,
        source: &str,
        message: String,
        details: EventDetails,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            event_type,
            severity,
            source: source.to_string(),
            message,
            details: Some(details),
            origin: EventOrigin::Detector,
            source_event_id: None,
        }
    }
}

/// A stored event row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub severity: Severity,
    pub source: String,
    pub message: String,
    pub details: Option<EventDetails>,
    pub origin: EventOrigin,
    pub source_event_id: Option<i64>,
}

/// Audit entry for one gateway invocation.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandAuditRecord {
    pub id: i64,
    pub command: String,
    pub duration_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Counts returned by a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub bgp_history: usize,
    pub interface_history: usize,
    pub events: usize,
}
