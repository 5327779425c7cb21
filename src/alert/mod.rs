//! Alert manager: turns stored detector events into user-facing alert rows.
//!
//! Alerts are ordinary event rows with `origin = alert` that point back at the
//! event they were raised for. Disabling a category only suppresses the alert
//! row; the underlying event is already stored by the time it gets here.

use crate::config::AlertConfig;
use crate::db::{Event, EventDetails, EventOrigin, EventType, NewEvent, Store};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct AlertManager {
    store: Arc<Store>,
    config: AlertConfig,
    last_alerted: Mutex<HashMap<(EventType, String), DateTime<Utc>>>,
}

impl AlertManager {
    pub fn new(store: Arc<Store>, config: AlertConfig) -> Self {
        Self {
            store,
            config,
            last_alerted: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the configuration lets this event become an alert at all.
    pub fn is_enabled_for(&self, event: &Event) -> bool {
        if event.origin != EventOrigin::Detector {
            return false;
        }

        match event.event_type {
            EventType::BgpDown | EventType::BgpUp => self.config.bgp_down_enabled,
            EventType::InterfaceDown | EventType::InterfaceUp => self.config.interface_down_enabled,
            EventType::Flapping => self.config.flapping_enabled,
            EventType::HighErrors => match &event.details {
                Some(EventDetails::ErrorBreach {
                    errors_delta,
                    discards_delta,
                    ..
                }) => errors_delta.saturating_add(*discards_delta) > self.config.error_threshold,
                _ => false,
            },
            EventType::System | EventType::Info => false,
        }
    }

    /// Raise alerts for a batch of events from one entity, in order.
    /// Returns the number of alert rows written.
    pub fn process(&self, events: &[Event]) -> usize {
        let mut raised = 0;

        for event in events {
            if !self.is_enabled_for(event) {
                tracing::debug!("No alert for event {} ({} on {})", event.id, event.event_type, event.source);
                continue;
            }

            let key = (event.event_type, event.source.clone());
            if self.in_cooldown(&key, event.timestamp) {
                tracing::debug!(
                    "Alert for {} on {} suppressed by cooldown",
                    event.event_type,
                    event.source
                );
                continue;
            }

            match self.store.insert_event(&alert_for(event)) {
                Ok(alert) => {
                    self.remember(key, event.timestamp);
                    tracing::info!("Alert {} raised: {}", alert.id, alert.message);
                    raised += 1;
                }
                Err(e) => {
                    tracing::error!("Failed to store alert for event {}: {}", event.id, e);
                }
            }
        }

        raised
    }

    fn in_cooldown(&self, key: &(EventType, String), at: DateTime<Utc>) -> bool {
        let cooldown_ms = self.config.cooldown.as_millis().min(i64::MAX as u128) as i64;
        let last_alerted = self.last_alerted.lock().unwrap_or_else(|p| p.into_inner());
        last_alerted
            .get(key)
            .map_or(false, |last| at.signed_duration_since(*last).num_milliseconds() < cooldown_ms)
    }

    fn remember(&self, key: (EventType, String), at: DateTime<Utc>) {
        let mut last_alerted = self.last_alerted.lock().unwrap_or_else(|p| p.into_inner());
        last_alerted.insert(key, at);
    }
}

fn alert_for(event: &Event) -> NewEvent {
    NewEvent {
        timestamp: event.timestamp,
        event_type: event.event_type,
        severity: event.severity,
        source: event.source.clone(),
        message: format!("ALERT: {}", event.message),
        details: event.details.clone(),
        origin: EventOrigin::Alert,
        source_event_id: Some(event.id),
    }
}
