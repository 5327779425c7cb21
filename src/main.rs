//! PeerWatch - router BGP and interface monitor
//!
//! Polls a router over SSH, keeps the latest state of every BGP peer and
//! interface in SQLite, and records events and alerts when they change.

mod alert;
mod collector;
mod config;
mod db;
mod engine;
mod gateway;
mod parser;
mod scheduler;

use alert::AlertManager;
use collector::Collector;
use config::MonitorConfig;
use db::Store;
use engine::DiffEngine;
use gateway::{CommandGateway, SshTransport};
use scheduler::{Domain, Pipeline, RetentionManager, Scheduler};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("peerwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = MonitorConfig::load();
    tracing::info!("Starting PeerWatch for device {}:{}", cfg.ssh.host, cfg.ssh.port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let known_peers = store.list_latest::<db::BgpSession>()?.len();
    let known_interfaces = store.list_latest::<db::InterfaceState>()?.len();
    tracing::info!(
        "Resuming with {} known BGP peers and {} interfaces",
        known_peers,
        known_interfaces
    );

    let transport = SshTransport::new(cfg.ssh.clone());
    let gateway = Arc::new(CommandGateway::new(
        Box::new(transport),
        store.clone(),
        cfg.ssh.command_timeout,
    ));

    let alerts = Arc::new(AlertManager::new(store.clone(), cfg.alerts.clone()));
    let engine = DiffEngine::new(store.clone(), alerts, &cfg.detection);
    let pipeline = Arc::new(Pipeline::new(Collector::new(gateway.clone()), engine));

    let scheduler = Scheduler::new(pipeline, cfg.schedule.clone());
    scheduler.start().await;

    let retention = RetentionManager::new(store.clone(), cfg.retention.clone());
    retention.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    retention.stop().await;
    scheduler.stop().await;
    gateway.shutdown().await;

    for domain in [Domain::Bgp, Domain::Interfaces] {
        let stats = scheduler.stats(domain);
        tracing::info!(
            "{}: {} polls ({} ok, {} failed), {} ticks skipped",
            domain,
            stats.polls_started(),
            stats.polls_succeeded(),
            stats.polls_failed(),
            stats.ticks_skipped()
        );
    }

    Ok(())
}
