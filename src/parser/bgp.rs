//! Parsers for `display bgp peer` and `display bgp routing-table peer`.

use std::net::IpAddr;
use std::sync::OnceLock;

use regex::Regex;

use super::{check_device_output, BgpPeerRecord, ParseError};
use crate::db::BgpStatus;

const PEER_COMMAND: &str = "display bgp peer";
const ROUTES_COMMAND: &str = "display bgp routing-table peer";

/// Parse the peer table.
///
/// ```text
///  BGP local router ID : 192.168.1.1
///  Local AS number : 65000
///  Total number of peers : 2                 Peers in established state : 1
///
///   Peer            V          AS  MsgRcvd  MsgSent  OutQ  Up/Down       State  PrefRcv
///   10.0.0.1        4       65001   123456   123457     0  00:05:23 Established      150
///   10.0.0.2        4       65002        0        0     0  00:00:00        Idle        0
/// ```
pub fn parse_bgp_peers(output: &str) -> Result<Vec<BgpPeerRecord>, ParseError> {
    check_device_output(PEER_COMMAND, output)?;

    static ROW: OnceLock<Regex> = OnceLock::new();
    let row = ROW.get_or_init(|| {
        Regex::new(
            r"^\s*(?P<peer>\S+)\s+\d+\s+(?P<asn>\d+)\s+\d+\s+\d+\s+\d+\s+(?P<uptime>\S+)\s+(?P<state>\S+)(?:\s+(?P<pref>\d+))?\s*$",
        )
        .unwrap()
    });

    let mut saw_header = false;
    let mut peers = Vec::new();

    for line in output.lines() {
        if line.contains("Peer") && line.contains("State") {
            saw_header = true;
            continue;
        }

        let Some(caps) = row.captures(line) else {
            continue;
        };

        let peer = &caps["peer"];
        if peer.parse::<IpAddr>().is_err() {
            continue;
        }

        let status: BgpStatus = caps["state"].parse().map_err(|_| {
            ParseError::new(
                PEER_COMMAND,
                format!("unknown state '{}' for peer {}", &caps["state"], peer),
                output,
            )
        })?;

        let peer_asn = caps["asn"].parse().map_err(|_| {
            ParseError::new(PEER_COMMAND, format!("invalid AS number for peer {}", peer), output)
        })?;

        peers.push(BgpPeerRecord {
            peer_address: peer.to_string(),
            peer_asn,
            description: None,
            status,
            uptime_seconds: parse_uptime(&caps["uptime"]),
            prefixes_received: caps.name("pref").and_then(|m| m.as_str().parse().ok()),
            prefixes_sent: None,
        });

        tracing::debug!("Parsed BGP peer {} - {}", peer, status);
    }

    if !saw_header && peers.is_empty() {
        return Err(ParseError::new(PEER_COMMAND, "no peer table found", output));
    }

    Ok(peers)
}

/// Received and advertised prefix counts for one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefixCounts {
    pub received: u64,
    pub sent: u64,
}

/// Parse prefix counters from `display bgp routing-table peer <address> ...`.
pub fn parse_bgp_prefixes(output: &str) -> Result<PrefixCounts, ParseError> {
    check_device_output(ROUTES_COMMAND, output)?;

    static RECEIVED: OnceLock<Regex> = OnceLock::new();
    static ADVERTISED: OnceLock<Regex> = OnceLock::new();
    static TOTAL: OnceLock<Regex> = OnceLock::new();

    let received = RECEIVED.get_or_init(|| Regex::new(r"(?i)received[^:\n]*:\s*(\d+)").unwrap());
    let advertised =
        ADVERTISED.get_or_init(|| Regex::new(r"(?i)(?:advertised|sent)[^:\n]*:\s*(\d+)").unwrap());
    let total = TOTAL.get_or_init(|| Regex::new(r"(?i)total number of routes\s*:\s*(\d+)").unwrap());

    let capture = |re: &Regex| -> Option<u64> {
        re.captures(output)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    };

    let received_count = capture(received).or_else(|| capture(total));
    let sent_count = capture(advertised);

    if received_count.is_none() && sent_count.is_none() {
        return Err(ParseError::new(ROUTES_COMMAND, "no route counters found", output));
    }

    Ok(PrefixCounts {
        received: received_count.unwrap_or(0),
        sent: sent_count.unwrap_or(0),
    })
}

/// Convert a peer Up/Down column to seconds.
///
/// Accepts `HH:MM:SS`, `MM:SS`, `1d02h03m`, `0012h05m` and `Never`. Anything
/// unreadable, including values past `u64::MAX` seconds, is 0.
pub fn parse_uptime(s: &str) -> u64 {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("never") {
        return 0;
    }

    if s.contains(':') {
        let parts: Option<Vec<u64>> = s.split(':').map(|p| p.parse().ok()).collect();
        let seconds = match parts.as_deref() {
            Some([h, m, sec]) => h
                .checked_mul(3600)
                .and_then(|h| h.checked_add(m.checked_mul(60)?))
                .and_then(|hm| hm.checked_add(*sec)),
            Some([m, sec]) => m.checked_mul(60).and_then(|m| m.checked_add(*sec)),
            _ => None,
        };
        return seconds.unwrap_or(0);
    }

    static UNIT: OnceLock<Regex> = OnceLock::new();
    let unit = UNIT.get_or_init(|| Regex::new(r"(\d+)([dhms])").unwrap());

    unit.captures_iter(s)
        .try_fold(0u64, |total, caps| {
            let value: u64 = caps[1].parse().ok()?;
            let scale = match &caps[2] {
                "d" => 86_400,
                "h" => 3_600,
                "m" => 60,
                _ => 1,
            };
            total.checked_add(value.checked_mul(scale)?)
        })
        .unwrap_or(0)
}
