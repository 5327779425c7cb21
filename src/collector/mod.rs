//! Collector module: runs the query commands for one domain and assembles a
//! snapshot from their parsed output.

use crate::gateway::{CommandGateway, GatewayError};
use crate::parser::{
    parse_bgp_peers, parse_bgp_prefixes, parse_interface_statistics, parse_interfaces, BgpSnapshot,
    InterfaceSnapshot, ParseError,
};

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

/// Collection error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
}

pub struct Collector {
    gateway: Arc<CommandGateway>,
}

impl Collector {
    pub fn new(gateway: Arc<CommandGateway>) -> Self {
        Self { gateway }
    }

    /// Collect the BGP peer table and per-peer prefix counts.
    pub async fn collect_bgp(&self) -> Result<BgpSnapshot, CollectError> {
        let output = self.gateway.execute("display bgp peer").await?;
        let mut peers = parse_bgp_peers(&output).map_err(rejected)?;

        for peer in &mut peers {
            let command = format!("display bgp routing-table peer {} received-routes", peer.peer_address);
            let output = self.gateway.execute(&command).await?;

            match parse_bgp_prefixes(&output) {
                Ok(counts) => {
                    peer.prefixes_received = Some(counts.received);
                    peer.prefixes_sent = Some(counts.sent);
                }
                Err(e) => {
                    tracing::warn!("No prefix counts for peer {}: {}", peer.peer_address, e.reason);
                }
            }
        }

        tracing::debug!("Collected {} BGP peers", peers.len());
        Ok(BgpSnapshot {
            taken_at: Utc::now(),
            peers,
        })
    }

    /// Collect the interface list and per-interface counters.
    pub async fn collect_interfaces(&self) -> Result<InterfaceSnapshot, CollectError> {
        let output = self.gateway.execute("display interface").await?;
        let mut interfaces = parse_interfaces(&output).map_err(rejected)?;

        for interface in &mut interfaces {
            let output = self
                .gateway
                .execute(&format!("display interface {}", interface.name))
                .await?;

            match parse_interface_statistics(&output) {
                Ok(stats) => interface.stats = Some(stats),
                // Keep whatever the list output carried for this block.
                Err(e) => {
                    tracing::warn!("No statistics for interface {}: {}", interface.name, e.reason);
                }
            }
        }

        tracing::debug!("Collected {} interfaces", interfaces.len());
        Ok(InterfaceSnapshot {
            taken_at: Utc::now(),
            interfaces,
        })
    }
}

fn rejected(e: ParseError) -> CollectError {
    tracing::debug!("Rejected output of '{}':\n{}", e.command, e.raw);
    CollectError::Parse(e)
}
