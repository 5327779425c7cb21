//! Diff & event engine.
//!
//! Applies snapshots entity by entity: take the entity lock, diff against the
//! stored latest state and commit state plus events in one transaction, append
//! history (best effort), then hand the committed events to the alert manager.

mod counters;
mod diff;
mod flap;

pub use diff::*;

use crate::alert::AlertManager;
use crate::config::DetectionConfig;
use crate::db::{
    BgpHistoryPoint, BgpSession, DbError, Event, EventDetails, EventType, HistoryRecord,
    InterfaceHistoryPoint, InterfaceState, LatestRecord, NewEvent, Severity, Store,
};
use crate::parser::{BgpSnapshot, InterfaceSnapshot};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of applying one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub applied: usize,
    pub failed: usize,
    pub events: usize,
    pub alerts: usize,
}

pub struct DiffEngine {
    store: Arc<Store>,
    alerts: Arc<AlertManager>,
    rules: DiffRules,
    lock_timeout: Duration,
}

impl DiffEngine {
    pub fn new(store: Arc<Store>, alerts: Arc<AlertManager>, config: &DetectionConfig) -> Self {
        Self {
            store,
            alerts,
            rules: DiffRules::from_config(config),
            lock_timeout: config.lock_timeout,
        }
    }

    pub async fn apply_bgp_snapshot(&self, snapshot: &BgpSnapshot) -> CycleReport {
        let mut report = CycleReport::default();
        let now = snapshot.taken_at;

        for peer in &snapshot.peers {
            let result = self
                .apply_entity::<BgpSession, BgpHistoryPoint, _>(&peer.peer_address, |previous| {
                    diff_bgp(previous, peer, now, &self.rules)
                })
                .await;
            report.record(&peer.peer_address, result);
        }

        tracing::debug!("BGP snapshot applied: {:?}", report);
        report
    }

    pub async fn apply_interface_snapshot(&self, snapshot: &InterfaceSnapshot) -> CycleReport {
        let mut report = CycleReport::default();
        let now = snapshot.taken_at;

        for interface in &snapshot.interfaces {
            let result = self
                .apply_entity::<InterfaceState, InterfaceHistoryPoint, _>(&interface.name, |previous| {
                    diff_interface(previous, interface, now, &self.rules)
                })
                .await;
            report.record(&interface.name, result);
        }

        tracing::debug!("Interface snapshot applied: {:?}", report);
        report
    }

    /// Returns (events committed, alerts raised) for one entity.
    async fn apply_entity<R, H, F>(&self, key: &str, diff: F) -> Result<(usize, usize), DbError>
    where
        R: LatestRecord,
        H: HistoryRecord + for<'a> From<&'a R>,
        F: FnOnce(Option<&R>) -> (R, Vec<NewEvent>),
    {
        // Held until the alerts for this entity are out, so ordering is kept.
        let _guard = self.store.lock_entity(R::KIND, key, self.lock_timeout).await?;

        let applied = self.store.apply_latest(key, diff)?;
        if applied.previous.is_none() {
            tracing::info!("New {} entity: {}", R::KIND, key);
        }

        match self.store.append_history(&H::from(&applied.current)) {
            Ok(true) => {}
            Ok(false) => tracing::debug!("History point for {} {} already recorded", R::KIND, key),
            Err(e) => tracing::warn!("Failed to append history for {} {}: {}", R::KIND, key, e),
        }

        log_events(&applied.events);
        let alerts = self.alerts.process(&applied.events);
        Ok((applied.events.len(), alerts))
    }

    /// Record that a domain has started failing.
    pub fn record_poll_failure(
        &self,
        domain: &str,
        consecutive_failures: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<Event, DbError> {
        let event = NewEvent::detected(
            EventType::System,
            Severity::Warning,
            domain,
            format!("Polling {} failed: {}", domain, error),
            EventDetails::PollFailure {
                domain: domain.to_string(),
                consecutive_failures,
                error: error.to_string(),
            },
            at,
        );
        let event = self.store.insert_event(&event)?;
        log_events(std::slice::from_ref(&event));
        Ok(event)
    }

    /// Record that a failing domain polled successfully again.
    pub fn record_poll_recovery(&self, domain: &str, failed_polls: u32, at: DateTime<Utc>) -> Result<Event, DbError> {
        let event = NewEvent::detected(
            EventType::Info,
            Severity::Info,
            domain,
            format!("Polling {} recovered after {} failed polls", domain, failed_polls),
            EventDetails::PollRecovered {
                domain: domain.to_string(),
                failed_polls,
            },
            at,
        );
        let event = self.store.insert_event(&event)?;
        log_events(std::slice::from_ref(&event));
        Ok(event)
    }
}

impl CycleReport {
    fn record(&mut self, key: &str, result: Result<(usize, usize), DbError>) {
        match result {
            Ok((events, alerts)) => {
                self.applied += 1;
                self.events += events;
                self.alerts += alerts;
            }
            Err(e) => {
                tracing::error!("Failed to apply state for {}: {}", key, e);
                self.failed += 1;
            }
        }
    }
}

fn log_events(events: &[Event]) {
    for event in events {
        tracing::info!(
            "Event {} [{}/{}] {}: {}",
            event.id,
            event.event_type,
            event.severity,
            event.source,
            event.message
        );
    }
}
