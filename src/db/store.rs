//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("connection mutex poisoned")]
    Poisoned,
    #[error("timed out after {timeout:?} waiting for {kind} entity lock on {key}")]
    LockTimeout {
        kind: EntityKind,
        key: String,
        timeout: Duration,
    },
}

/// A row kind with exactly one "latest" record per key.
pub trait LatestRecord: Sized {
    const KIND: EntityKind;

    fn key(&self) -> &str;
    fn select(conn: &Connection, key: &str) -> SqlResult<Option<Self>>;
    fn select_all(conn: &Connection) -> SqlResult<Vec<Self>>;
    fn write(&self, conn: &Connection) -> Result<(), DbError>;
}

/// An append-only history row.
pub trait HistoryRecord {
    /// Returns the number of rows inserted (0 when the point already exists).
    fn insert(&self, conn: &Connection) -> SqlResult<usize>;
}

/// Result of an atomic read-diff-write.
#[derive(Debug)]
pub struct Applied<R> {
    pub previous: Option<R>,
    pub current: R,
    pub events: Vec<Event>,
}

/// Holds the per-entity write lock until dropped.
pub struct EntityGuard {
    _guard: OwnedMutexGuard<()>,
}

type LockMap = HashMap<(EntityKind, String), Arc<AsyncMutex<()>>>;

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    entity_locks: Arc<Mutex<LockMap>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            entity_locks: Arc::new(Mutex::new(HashMap::new())),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Entity locks ---

    /// Acquire the write lock for one entity, giving up after `timeout`.
    pub async fn lock_entity(
        &self,
        kind: EntityKind,
        key: &str,
        timeout: Duration,
    ) -> Result<EntityGuard, DbError> {
        let lock = {
            let mut locks = self.entity_locks.lock().map_err(|_| DbError::Poisoned)?;
            locks.entry((kind, key.to_string())).or_default().clone()
        };

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(EntityGuard { _guard: guard }),
            Err(_) => Err(DbError::LockTimeout {
                kind,
                key: key.to_string(),
                timeout,
            }),
        }
    }

    // --- Latest state ---

    /// Get the latest record for a key.
    #[cfg(test)]
    pub fn get_latest<R: LatestRecord>(&self, key: &str) -> Result<Option<R>, DbError> {
        let conn = self.conn()?;
        Ok(R::select(&conn, key)?)
    }

    /// Get every latest record of one kind.
    pub fn list_latest<R: LatestRecord>(&self) -> Result<Vec<R>, DbError> {
        let conn = self.conn()?;
        Ok(R::select_all(&conn)?)
    }

    /// Replace the latest record and return the one it replaced.
    #[cfg(test)]
    pub fn upsert_latest<R: LatestRecord>(&self, record: &R) -> Result<Option<R>, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let previous = R::select(&tx, record.key())?;
        record.write(&tx)?;

        tx.commit()?;
        Ok(previous)
    }

    /// Read the latest record, derive its successor and events, and write both
    /// in one transaction. Nothing is written if any step fails.
    pub fn apply_latest<R, F>(&self, key: &str, diff: F) -> Result<Applied<R>, DbError>
    where
        R: LatestRecord,
        F: FnOnce(Option<&R>) -> (R, Vec<NewEvent>),
    {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let previous = R::select(&tx, key)?;
        let (current, new_events) = diff(previous.as_ref());
        debug_assert_eq!(current.key(), key);
        current.write(&tx)?;

        let mut events = Vec::with_capacity(new_events.len());
        for event in &new_events {
            events.push(insert_event_on(&tx, event)?);
        }

        tx.commit()?;
        Ok(Applied {
            previous,
            current,
            events,
        })
    }

    // --- History ---

    /// Append one history point. Returns false if the point already existed.
    pub fn append_history<H: HistoryRecord>(&self, point: &H) -> Result<bool, DbError> {
        let conn = self.conn()?;
        Ok(point.insert(&conn)? > 0)
    }

    /// Most recent BGP history points for a peer, oldest first.
    #[cfg(test)]
    pub fn get_bgp_history(&self, peer_address: &str, limit: usize) -> Result<Vec<BgpHistoryPoint>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT peer_address, status, prefixes_received, prefixes_sent, timestamp
             FROM bgp_status_history WHERE peer_address = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;

        let mut points = stmt
            .query_map(params![peer_address, limit as i64], |row| {
                Ok(BgpHistoryPoint {
                    peer_address: row.get(0)?,
                    status: enum_col(row, 1)?,
                    prefixes_received: u64_col(row, 2)?,
                    prefixes_sent: u64_col(row, 3)?,
                    timestamp: time_col(row, 4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        points.reverse();
        Ok(points)
    }

    /// Most recent traffic history points for an interface, oldest first.
    #[cfg(test)]
    pub fn get_interface_history(&self, name: &str, limit: usize) -> Result<Vec<InterfaceHistoryPoint>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT interface_name, in_bps, out_bps, in_pps, out_pps, errors_in, errors_out,
                    discards_in, discards_out, utilization_in, utilization_out, timestamp
             FROM interface_traffic_history WHERE interface_name = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;

        let mut points = stmt
            .query_map(params![name, limit as i64], |row| {
                Ok(InterfaceHistoryPoint {
                    interface_name: row.get(0)?,
                    counters: InterfaceCounters {
                        capacity_bps: 0,
                        in_bps: u64_col(row, 1)?,
                        out_bps: u64_col(row, 2)?,
                        in_pps: u64_col(row, 3)?,
                        out_pps: u64_col(row, 4)?,
                        errors_in: u64_col(row, 5)?,
                        errors_out: u64_col(row, 6)?,
                        discards_in: u64_col(row, 7)?,
                        discards_out: u64_col(row, 8)?,
                    },
                    utilization_in: row.get(9)?,
                    utilization_out: row.get(10)?,
                    timestamp: time_col(row, 11)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        points.reverse();
        Ok(points)
    }

    // --- Events ---

    /// Insert a single event outside of any state update.
    pub fn insert_event(&self, event: &NewEvent) -> Result<Event, DbError> {
        let conn = self.conn()?;
        insert_event_on(&conn, event)
    }

    /// The most recent `limit` events, oldest first.
    #[cfg(test)]
    pub fn get_events(&self, limit: usize) -> Result<Vec<Event>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_type, severity, source, message, details, origin, source_event_id
             FROM events ORDER BY id DESC LIMIT ?1",
        )?;

        let mut events = stmt
            .query_map(params![limit as i64], event_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        events.reverse();
        Ok(events)
    }

    // --- Command audit ---

    /// Record one gateway invocation.
    pub fn add_command_audit(
        &self,
        command: &str,
        duration_ms: u64,
        success: bool,
        error_message: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO command_audit_log (command, duration_ms, success, error_message, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![command, duration_ms as i64, success, error_message, fmt_time(timestamp)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The most recent `limit` audit records, oldest first.
    #[cfg(test)]
    pub fn get_command_audits(&self, limit: usize) -> Result<Vec<CommandAuditRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, command, duration_ms, success, error_message, timestamp
             FROM command_audit_log ORDER BY id DESC LIMIT ?1",
        )?;

        let mut records = stmt
            .query_map(params![limit as i64], |row| {
                Ok(CommandAuditRecord {
                    id: row.get(0)?,
                    command: row.get(1)?,
                    duration_ms: u64_col(row, 2)?,
                    success: row.get(3)?,
                    error_message: row.get(4)?,
                    timestamp: time_col(row, 5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        records.reverse();
        Ok(records)
    }

    // --- Retention ---

    /// Delete history older than `history_cutoff` and events older than `event_cutoff`.
    pub fn purge_before(
        &self,
        history_cutoff: DateTime<Utc>,
        event_cutoff: DateTime<Utc>,
    ) -> Result<RetentionReport, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let history = fmt_time(history_cutoff);
        let bgp_history = tx.execute(
            "DELETE FROM bgp_status_history WHERE timestamp < ?1",
            params![history],
        )?;
        let interface_history = tx.execute(
            "DELETE FROM interface_traffic_history WHERE timestamp < ?1",
            params![history],
        )?;
        let events = tx.execute(
            "DELETE FROM events WHERE timestamp < ?1",
            params![fmt_time(event_cutoff)],
        )?;

        tx.commit()?;
        Ok(RetentionReport {
            bgp_history,
            interface_history,
            events,
        })
    }
}

// --- Row mapping ---

impl LatestRecord for BgpSession {
    const KIND: EntityKind = EntityKind::Bgp;

    fn key(&self) -> &str {
        &self.peer_address
    }

    fn select(conn: &Connection, key: &str) -> SqlResult<Option<Self>> {
        conn.query_row(
            &format!("{} WHERE peer_address = ?1", BGP_SELECT),
            params![key],
            bgp_from_row,
        )
        .optional()
    }

    fn select_all(conn: &Connection) -> SqlResult<Vec<Self>> {
        let mut stmt = conn.prepare(&format!("{} ORDER BY peer_address", BGP_SELECT))?;
        let rows = stmt.query_map([], bgp_from_row)?.collect();
        rows
    }

    fn write(&self, conn: &Connection) -> Result<(), DbError> {
        let transitions = serde_json::to_string(&self.flap.recent_transitions)?;
        conn.execute(
            "INSERT INTO bgp_sessions (peer_address, peer_asn, description, status, uptime_seconds,
                prefixes_received, prefixes_sent, last_state_change, last_updated, created_at,
                recent_transitions, flap_alerted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(peer_address) DO UPDATE SET
                peer_asn=excluded.peer_asn, description=excluded.description, status=excluded.status,
                uptime_seconds=excluded.uptime_seconds, prefixes_received=excluded.prefixes_received,
                prefixes_sent=excluded.prefixes_sent, last_state_change=excluded.last_state_change,
                last_updated=excluded.last_updated, recent_transitions=excluded.recent_transitions,
                flap_alerted=excluded.flap_alerted",
            params![
                self.peer_address,
                self.peer_asn as i64,
                self.description,
                self.status.as_str(),
                self.uptime_seconds as i64,
                self.prefixes_received as i64,
                self.prefixes_sent as i64,
                fmt_time(self.last_state_change),
                fmt_time(self.last_updated),
                fmt_time(self.created_at),
                transitions,
                self.flap.alerted,
            ],
        )?;
        Ok(())
    }
}

const BGP_SELECT: &str = "SELECT peer_address, peer_asn, description, status, uptime_seconds,
    prefixes_received, prefixes_sent, last_state_change, last_updated, created_at,
    recent_transitions, flap_alerted FROM bgp_sessions";

fn bgp_from_row(row: &Row<'_>) -> SqlResult<BgpSession> {
    Ok(BgpSession {
        peer_address: row.get(0)?,
        peer_asn: row.get::<_, i64>(1)? as u32,
        description: row.get(2)?,
        status: enum_col(row, 3)?,
        uptime_seconds: u64_col(row, 4)?,
        prefixes_received: u64_col(row, 5)?,
        prefixes_sent: u64_col(row, 6)?,
        last_state_change: time_col(row, 7)?,
        last_updated: time_col(row, 8)?,
        created_at: time_col(row, 9)?,
        flap: FlapState {
            recent_transitions: transitions_col(row, 10)?,
            alerted: row.get(11)?,
        },
    })
}

impl LatestRecord for InterfaceState {
    const KIND: EntityKind = EntityKind::Interface;

    fn key(&self) -> &str {
        &self.name
    }

    fn select(conn: &Connection, key: &str) -> SqlResult<Option<Self>> {
        conn.query_row(
            &format!("{} WHERE name = ?1", INTERFACE_SELECT),
            params![key],
            interface_from_row,
        )
        .optional()
    }

    fn select_all(conn: &Connection) -> SqlResult<Vec<Self>> {
        let mut stmt = conn.prepare(&format!("{} ORDER BY name", INTERFACE_SELECT))?;
        let rows = stmt.query_map([], interface_from_row)?.collect();
        rows
    }

    fn write(&self, conn: &Connection) -> Result<(), DbError> {
        let transitions = serde_json::to_string(&self.flap.recent_transitions)?;
        let c = &self.counters;
        conn.execute(
            "INSERT INTO interfaces (name, description, status, capacity_bps, in_bps, out_bps,
                in_pps, out_pps, errors_in, errors_out, discards_in, discards_out,
                utilization_in, utilization_out, last_state_change, last_updated, created_at,
                recent_transitions, flap_alerted, error_breached, counters_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
             ON CONFLICT(name) DO UPDATE SET
                description=excluded.description, status=excluded.status,
                capacity_bps=excluded.capacity_bps, in_bps=excluded.in_bps, out_bps=excluded.out_bps,
                in_pps=excluded.in_pps, out_pps=excluded.out_pps,
                errors_in=excluded.errors_in, errors_out=excluded.errors_out,
                discards_in=excluded.discards_in, discards_out=excluded.discards_out,
                utilization_in=excluded.utilization_in, utilization_out=excluded.utilization_out,
                last_state_change=excluded.last_state_change, last_updated=excluded.last_updated,
                recent_transitions=excluded.recent_transitions, flap_alerted=excluded.flap_alerted,
                error_breached=excluded.error_breached, counters_seen=excluded.counters_seen",
            params![
                self.name,
                self.description,
                self.status.as_str(),
                c.capacity_bps as i64,
                c.in_bps as i64,
                c.out_bps as i64,
                c.in_pps as i64,
                c.out_pps as i64,
                c.errors_in as i64,
                c.errors_out as i64,
                c.discards_in as i64,
                c.discards_out as i64,
                self.utilization_in,
                self.utilization_out,
                fmt_time(self.last_state_change),
                fmt_time(self.last_updated),
                fmt_time(self.created_at),
                transitions,
                self.flap.alerted,
                self.error_breached,
                self.counters_seen,
            ],
        )?;
        Ok(())
    }
}

const INTERFACE_SELECT: &str = "SELECT name, description, status, capacity_bps, in_bps, out_bps,
    in_pps, out_pps, errors_in, errors_out, discards_in, discards_out, utilization_in,
    utilization_out, last_state_change, last_updated, created_at, recent_transitions,
    flap_alerted, error_breached, counters_seen FROM interfaces";

fn interface_from_row(row: &Row<'_>) -> SqlResult<InterfaceState> {
    Ok(InterfaceState {
        name: row.get(0)?,
        description: row.get(1)?,
        status: enum_col(row, 2)?,
        counters: InterfaceCounters {
            capacity_bps: u64_col(row, 3)?,
            in_bps: u64_col(row, 4)?,
            out_bps: u64_col(row, 5)?,
            in_pps: u64_col(row, 6)?,
            out_pps: u64_col(row, 7)?,
            errors_in: u64_col(row, 8)?,
            errors_out: u64_col(row, 9)?,
            discards_in: u64_col(row, 10)?,
            discards_out: u64_col(row, 11)?,
        },
        utilization_in: row.get(12)?,
        utilization_out: row.get(13)?,
        last_state_change: time_col(row, 14)?,
        last_updated: time_col(row, 15)?,
        created_at: time_col(row, 16)?,
        flap: FlapState {
            recent_transitions: transitions_col(row, 17)?,
            alerted: row.get(18)?,
        },
        error_breached: row.get(19)?,
        counters_seen: row.get(20)?,
    })
}

impl HistoryRecord for BgpHistoryPoint {
    fn insert(&self, conn: &Connection) -> SqlResult<usize> {
        conn.execute(
            "INSERT OR IGNORE INTO bgp_status_history
             (peer_address, status, prefixes_received, prefixes_sent, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.peer_address,
                self.status.as_str(),
                self.prefixes_received as i64,
                self.prefixes_sent as i64,
                fmt_time(self.timestamp),
            ],
        )
    }
}

impl HistoryRecord for InterfaceHistoryPoint {
    fn insert(&self, conn: &Connection) -> SqlResult<usize> {
        let c = &self.counters;
        conn.execute(
            "INSERT OR IGNORE INTO interface_traffic_history
             (interface_name, in_bps, out_bps, in_pps, out_pps, errors_in, errors_out,
              discards_in, discards_out, utilization_in, utilization_out, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                self.interface_name,
                c.in_bps as i64,
                c.out_bps as i64,
                c.in_pps as i64,
                c.out_pps as i64,
                c.errors_in as i64,
                c.errors_out as i64,
                c.discards_in as i64,
                c.discards_out as i64,
                self.utilization_in,
                self.utilization_out,
                fmt_time(self.timestamp),
            ],
        )
    }
}

fn insert_event_on(conn: &Connection, event: &NewEvent) -> Result<Event, DbError> {
    let details = event
        .details
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO events (timestamp, event_type, severity, source, message, details, origin, source_event_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            fmt_time(event.timestamp),
            event.event_type.as_str(),
            event.severity.as_str(),
            event.source,
            event.message,
            details,
            event.origin.as_str(),
            event.source_event_id,
        ],
    )?;

    Ok(Event {
        id: conn.last_insert_rowid(),
        timestamp: event.timestamp,
        event_type: event.event_type,
        severity: event.severity,
        source: event.source.clone(),
        message: event.message.clone(),
        details: event.details.clone(),
        origin: event.origin,
        source_event_id: event.source_event_id,
    })
}

#[cfg(test)]
fn event_from_row(row: &Row<'_>) -> SqlResult<Event> {
    let details: Option<String> = row.get(6)?;
    Ok(Event {
        id: row.get(0)?,
        timestamp: time_col(row, 1)?,
        event_type: enum_col(row, 2)?,
        severity: enum_col(row, 3)?,
        source: row.get(4)?,
        message: row.get(5)?,
        details: details.and_then(|d| serde_json::from_str(&d).ok()),
        origin: enum_col(row, 7)?,
        source_event_id: row.get(8)?,
    })
}

fn enum_col<T>(row: &Row<'_>, idx: usize) -> SqlResult<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn u64_col(row: &Row<'_>, idx: usize) -> SqlResult<u64> {
    Ok(row.get::<_, i64>(idx)?.max(0) as u64)
}

fn time_col(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let time_str: String = row.get(idx)?;
    Ok(parse_db_time(&time_str).unwrap_or_else(Utc::now))
}

fn transitions_col(row: &Row<'_>, idx: usize) -> SqlResult<Vec<DateTime<Utc>>> {
    let raw: String = row.get(idx)?;
    Ok(serde_json::from_str(&raw).unwrap_or_default())
}

fn fmt_time(dt: DateTime<Utc>) -> String {
    dt.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;

    fn test_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn session(address: &str, status: BgpStatus, at: DateTime<Utc>) -> BgpSession {
        BgpSession {
            peer_address: address.to_string(),
            peer_asn: 65001,
            description: None,
            status,
            uptime_seconds: 0,
            prefixes_received: 100,
            prefixes_sent: 10,
            last_state_change: at,
            last_updated: at,
            created_at: at,
            flap: FlapState::default(),
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    #[test]
    fn test_upsert_returns_previous() {
        let (_tmp, store) = test_store();

        let first = session("203.0.113.1", BgpStatus::Established, t(0));
        assert!(store.upsert_latest(&first).unwrap().is_none());

        let mut second = first.clone();
        second.status = BgpStatus::Down;
        second.last_updated = t(60);
        second.flap.recent_transitions.push(t(60));

        let previous = store.upsert_latest(&second).unwrap().unwrap();
        assert_eq!(previous, first);

        let latest: BgpSession = store.get_latest("203.0.113.1").unwrap().unwrap();
        assert_eq!(latest, second);
        assert_eq!(store.list_latest::<BgpSession>().unwrap().len(), 1);
    }

    #[test]
    fn test_apply_latest_writes_state_and_events_together() {
        let (_tmp, store) = test_store();
        store.upsert_latest(&session("192.0.2.1", BgpStatus::Established, t(0))).unwrap();

        let applied = store
            .apply_latest::<BgpSession, _>("192.0.2.1", |prev| {
                let mut next = prev.unwrap().clone();
                next.status = BgpStatus::Idle;
                let event = NewEvent::detected(
                    EventType::BgpDown,
                    Severity::Critical,
                    "192.0.2.1",
                    "down".to_string(),
                    EventDetails::StatusChange {
                        from: "Established".to_string(),
                        to: "Idle".to_string(),
                    },
                    t(30),
                );
                (next, vec![event])
            })
            .unwrap();

        assert_eq!(applied.previous.unwrap().status, BgpStatus::Established);
        assert_eq!(applied.current.status, BgpStatus::Idle);
        assert_eq!(applied.events.len(), 1);

        let events = store.get_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, applied.events[0].id);
        assert_eq!(events[0].origin, EventOrigin::Detector);
        assert!(matches!(events[0].details, Some(EventDetails::StatusChange { .. })));
    }

    #[test]
    fn test_history_failure_leaves_latest_untouched() {
        let (_tmp, store) = test_store();
        let current = session("198.51.100.7", BgpStatus::Established, t(0));
        store.upsert_latest(&current).unwrap();

        // No owning row, so the foreign key rejects the point.
        let orphan = BgpHistoryPoint::from(&session("198.51.100.8", BgpStatus::Idle, t(0)));
        assert!(store.append_history(&orphan).is_err());

        let point = BgpHistoryPoint::from(&current);
        assert!(store.append_history(&point).unwrap());
        // Same (key, timestamp) is immutable and ignored.
        assert!(!store.append_history(&point).unwrap());

        let latest: BgpSession = store.get_latest("198.51.100.7").unwrap().unwrap();
        assert_eq!(latest, current);
        assert_eq!(store.get_bgp_history("198.51.100.7", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_history_cascades_with_owner() {
        let (_tmp, store) = test_store();
        let current = session("198.51.100.9", BgpStatus::Established, t(0));
        store.upsert_latest(&current).unwrap();
        store.append_history(&BgpHistoryPoint::from(&current)).unwrap();

        store
            .conn()
            .unwrap()
            .execute("DELETE FROM bgp_sessions WHERE peer_address = ?1", params!["198.51.100.9"])
            .unwrap();

        assert!(store.get_bgp_history("198.51.100.9", 10).unwrap().is_empty());
    }

    #[test]
    fn test_purge_keeps_recent_rows() {
        let (_tmp, store) = test_store();
        let mut current = session("203.0.113.5", BgpStatus::Established, t(0));
        store.upsert_latest(&current).unwrap();
        store.append_history(&BgpHistoryPoint::from(&current)).unwrap();
        current.last_updated = t(3600);
        store.append_history(&BgpHistoryPoint::from(&current)).unwrap();

        let report = store.purge_before(t(1800), t(1800)).unwrap();
        assert_eq!(report.bgp_history, 1);
        assert_eq!(store.get_bgp_history("203.0.113.5", 10).unwrap().len(), 1);
        assert!(store.get_latest::<BgpSession>("203.0.113.5").unwrap().is_some());
    }

    #[test]
    fn test_command_audit_roundtrip() {
        let (_tmp, store) = test_store();
        store.add_command_audit("display version", 12, true, None, t(0)).unwrap();
        store
            .add_command_audit("save", 0, false, Some("unauthorized"), t(1))
            .unwrap();

        let audits = store.get_command_audits(10).unwrap();
        assert_eq!(audits.len(), 2);
        assert!(audits[0].success);
        assert!(!audits[1].success);
        assert_eq!(audits[1].error_message.as_deref(), Some("unauthorized"));
    }

    #[tokio::test]
    async fn test_entity_lock_times_out_for_same_key_only() {
        let (_tmp, store) = test_store();
        let timeout = Duration::from_millis(50);

        let _held = store.lock_entity(EntityKind::Interface, "eth0", timeout).await.unwrap();

        let blocked = store.lock_entity(EntityKind::Interface, "eth0", timeout).await;
        assert!(matches!(blocked, Err(DbError::LockTimeout { .. })));

        let other = store.lock_entity(EntityKind::Interface, "eth1", timeout).await;
        assert!(other.is_ok());
    }
}
