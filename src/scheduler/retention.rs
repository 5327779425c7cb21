//! Retention manager for cleaning up old history and events.

use crate::config::RetentionConfig;
use crate::db::{DbError, RetentionReport, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Manager for deleting data past retention periods.
pub struct RetentionManager {
    store: Arc<Store>,
    config: RetentionConfig,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, config: RetentionConfig) -> Self {
        Self {
            store,
            config,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub async fn start(&self) {
        let (tx, mut rx) = tokio::sync::broadcast::channel(1);
        *self.stop.lock().await = Some(tx);

        let store = self.store.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = process_retention(&store, &config, Utc::now()) {
                            tracing::error!("RetentionManager: sweep failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Delete history and events older than their retention windows. Latest
/// state and the command audit log are never touched.
pub fn process_retention(
    store: &Store,
    config: &RetentionConfig,
    now: DateTime<Utc>,
) -> Result<RetentionReport, DbError> {
    let history_cutoff = now - ChronoDuration::days(config.history_days);
    let event_cutoff = now - ChronoDuration::days(config.event_days);

    let report = store.purge_before(history_cutoff, event_cutoff)?;
    if report != RetentionReport::default() {
        tracing::info!(
            "RetentionManager: deleted {} BGP history, {} interface history, {} events",
            report.bgp_history,
            report.interface_history,
            report.events
        );
    }
    Ok(report)
}
