//! Command gateway: the single, serialized path to the device CLI.
//!
//! Every command is checked against the read-only allow-list before any I/O,
//! runs on the blocking pool under the session lock, is retried once after a
//! reconnect on transport failure, and leaves exactly one audit row behind.

mod ssh;
mod whitelist;

pub use ssh::*;
pub use whitelist::*;

use crate::db::Store;

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

/// Extra time given to the blocking call before the watchdog gives up on it.
const WATCHDOG_GRACE: Duration = Duration::from_secs(2);

/// Failures surfaced by the transport collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Connection(String),
}

/// Gateway error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("command not allowed: {0}")]
    Unauthorized(String),
    #[error("device did not respond within {0:?}")]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connection(String),
}

impl From<TransportError> for GatewayError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(d) => GatewayError::Timeout(d),
            TransportError::Connection(msg) => GatewayError::Connection(msg),
        }
    }
}

/// A blocking remote CLI session.
pub trait Transport: Send {
    fn connect(&mut self, timeout: Duration) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
    /// Send one command and return its output with echo and prompt removed.
    fn run(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError>;
    fn disconnect(&mut self);
}

/// Shared, mutex-guarded handle on the device session.
pub struct CommandGateway {
    session: Arc<Mutex<Box<dyn Transport>>>,
    store: Arc<Store>,
    timeout: Duration,
}

impl CommandGateway {
    pub fn new(transport: Box<dyn Transport>, store: Arc<Store>, timeout: Duration) -> Self {
        Self {
            session: Arc::new(Mutex::new(transport)),
            store,
            timeout,
        }
    }

    /// Run one read-only command and return its raw output.
    pub async fn execute(&self, command: &str) -> Result<String, GatewayError> {
        let started = Instant::now();
        let result = self.execute_authorized(command).await;
        self.audit(command, started.elapsed(), &result);
        result
    }

    async fn execute_authorized(&self, command: &str) -> Result<String, GatewayError> {
        let command = match authorize(command) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Rejected device command: {}", e);
                return Err(e);
            }
        };

        tracing::info!("Executing device command: {}", command);

        match self.attempt(&command).await {
            Ok(output) => Ok(output),
            Err(e @ (GatewayError::Connection(_) | GatewayError::Timeout(_))) => {
                tracing::warn!("Command '{}' failed ({}), reconnecting and retrying once", command, e);
                self.attempt(&command).await.map_err(|e| {
                    tracing::error!("Command '{}' failed after retry: {}", command, e);
                    e
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn attempt(&self, command: &str) -> Result<String, GatewayError> {
        let session = self.session.clone();
        let command = command.to_string();
        let timeout = self.timeout;

        // The guard moves into the blocking task, so a call that outlives the
        // watchdog still keeps the next command off the session until it
        // returns. Waiting for the lock counts against the same bound.
        let run = async move {
            let mut session = session.lock_owned().await;
            tokio::task::spawn_blocking(move || {
                if !session.is_connected() {
                    session.connect(timeout)?;
                }
                let result = session.run(&command, timeout);
                if result.is_err() {
                    session.disconnect();
                }
                result
            })
            .await
        };

        match tokio::time::timeout(timeout + WATCHDOG_GRACE, run).await {
            Ok(Ok(result)) => result.map_err(GatewayError::from),
            Ok(Err(e)) => Err(GatewayError::Connection(format!("session task failed: {}", e))),
            Err(_) => Err(GatewayError::Timeout(timeout)),
        }
    }

    fn audit(&self, command: &str, elapsed: Duration, result: &Result<String, GatewayError>) {
        let error = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self.store.add_command_audit(
            command,
            elapsed.as_millis() as u64,
            result.is_ok(),
            error.as_deref(),
            Utc::now(),
        ) {
            tracing::error!("Failed to write command audit for '{}': {}", command, e);
        }
    }

    /// Close the device session, waiting for any in-flight command.
    pub async fn shutdown(&self) {
        let mut session = self.session.clone().lock_owned().await;
        let _ = tokio::task::spawn_blocking(move || session.disconnect()).await;
        tracing::info!("Device session closed");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport for driving the gateway without a device.

    use super::{Transport, TransportError};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Responder = Arc<dyn Fn(&str) -> Result<String, TransportError> + Send + Sync>;

    #[derive(Default)]
    pub struct TransportStats {
        pub connects: AtomicUsize,
        pub runs: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl TransportStats {
        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    pub struct ScriptedTransport {
        responder: Responder,
        failures: Arc<Mutex<VecDeque<TransportError>>>,
        delay: Duration,
        connected: bool,
        pub stats: Arc<TransportStats>,
    }

    impl ScriptedTransport {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&str) -> Result<String, TransportError> + Send + Sync + 'static,
        {
            Self {
                responder: Arc::new(responder),
                failures: Arc::new(Mutex::new(VecDeque::new())),
                delay: Duration::ZERO,
                connected: false,
                stats: Arc::new(TransportStats::default()),
            }
        }

        /// Fail the next runs with these errors before answering normally.
        pub fn with_failures(self, failures: Vec<TransportError>) -> Self {
            *self.failures.lock().unwrap() = failures.into();
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl Transport for ScriptedTransport {
        fn connect(&mut self, _timeout: Duration) -> Result<(), TransportError> {
            self.stats.connects.fetch_add(1, Ordering::SeqCst);
            self.connected = true;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn run(&mut self, command: &str, _timeout: Duration) -> Result<String, TransportError> {
            self.stats.runs.fetch_add(1, Ordering::SeqCst);
            let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }

            let failure = self.failures.lock().unwrap().pop_front();
            let result = match failure {
                Some(e) => Err(e),
                None => (self.responder)(command),
            };

            self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }
    }
}
