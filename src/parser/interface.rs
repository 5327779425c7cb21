//! Parsers for `display interface` output.

use std::sync::OnceLock;

use regex::Regex;

use super::{check_device_output, InterfaceRecord, ParseError};
use crate::db::{InterfaceCounters, InterfaceStatus};

const INTERFACE_COMMAND: &str = "display interface";

fn header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<name>[A-Za-z][\w./:-]*)\s+current state\s*:\s*(?P<state>.+?)\s*$").unwrap())
}

/// Parse the interface list. Each block starts with
/// `<name> current state : <UP|DOWN|Administratively DOWN>`; counters found
/// inside a block are attached to its record.
pub fn parse_interfaces(output: &str) -> Result<Vec<InterfaceRecord>, ParseError> {
    check_device_output(INTERFACE_COMMAND, output)?;

    static DESCRIPTION: OnceLock<Regex> = OnceLock::new();
    let description = DESCRIPTION.get_or_init(|| Regex::new(r"^\s*Description\s*:\s*(.*?)\s*$").unwrap());

    // (header, block text) pairs
    let mut blocks: Vec<(regex::Captures, String)> = Vec::new();
    for line in output.lines() {
        if let Some(caps) = header_regex().captures(line) {
            blocks.push((caps, String::new()));
        } else if let Some((_, body)) = blocks.last_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }

    if blocks.is_empty() {
        return Err(ParseError::new(INTERFACE_COMMAND, "no interface blocks found", output));
    }

    let mut interfaces = Vec::with_capacity(blocks.len());
    for (caps, body) in &blocks {
        let name = &caps["name"];
        let status = parse_interface_status(&caps["state"]).ok_or_else(|| {
            ParseError::new(
                INTERFACE_COMMAND,
                format!("unknown state '{}' for {}", &caps["state"], name),
                output,
            )
        })?;

        let desc = body
            .lines()
            .find_map(|l| description.captures(l))
            .map(|c| c[1].to_string())
            .filter(|d| !d.is_empty());

        interfaces.push(InterfaceRecord {
            name: name.to_string(),
            description: desc,
            status,
            stats: parse_interface_counters(body),
        });
    }

    Ok(interfaces)
}

/// Parse `display interface <name>` into counters.
pub fn parse_interface_statistics(output: &str) -> Result<InterfaceCounters, ParseError> {
    check_device_output(INTERFACE_COMMAND, output)?;
    parse_interface_counters(output)
        .ok_or_else(|| ParseError::new(INTERFACE_COMMAND, "no interface counters found", output))
}

fn parse_interface_status(state: &str) -> Option<InterfaceStatus> {
    let state = state.trim().to_ascii_lowercase();
    if state.starts_with("administratively") {
        Some(InterfaceStatus::AdminDown)
    } else if state.starts_with("up") {
        Some(InterfaceStatus::Up)
    } else if state.starts_with("down") {
        Some(InterfaceStatus::Down)
    } else {
        None
    }
}

/// Pull rate, error, discard and bandwidth counters out of a block of text.
/// Returns `None` when nothing recognisable is present.
fn parse_interface_counters(text: &str) -> Option<InterfaceCounters> {
    static PATTERNS: OnceLock<CounterPatterns> = OnceLock::new();
    let p = PATTERNS.get_or_init(CounterPatterns::new);

    let first = |re: &Regex| -> Option<u64> {
        re.captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    };

    let in_bps = first(&p.in_bps);
    let out_bps = first(&p.out_bps);
    let in_pps = first(&p.in_pps);
    let out_pps = first(&p.out_pps);
    let errors_in = first(&p.errors_in);
    let errors_out = first(&p.errors_out);
    let discards_in = first(&p.discards_in);
    let discards_out = first(&p.discards_out);
    let capacity_bps = p.bandwidth.captures(text).and_then(|caps| {
        let value: u64 = caps[1].parse().ok()?;
        let scale = match caps.get(2).map(|m| m.as_str().to_ascii_uppercase()) {
            Some(unit) if unit == "K" => 1_000,
            Some(unit) if unit == "M" => 1_000_000,
            Some(unit) if unit == "G" => 1_000_000_000,
            _ => 1,
        };
        // Out-of-range bandwidth is as unreadable as a missing one.
        value.checked_mul(scale)
    });

    let found = [
        in_bps, out_bps, in_pps, out_pps, errors_in, errors_out, discards_in, discards_out, capacity_bps,
    ];
    if found.iter().all(Option::is_none) {
        return None;
    }

    Some(InterfaceCounters {
        capacity_bps: capacity_bps.unwrap_or(0),
        in_bps: in_bps.unwrap_or(0),
        out_bps: out_bps.unwrap_or(0),
        in_pps: in_pps.unwrap_or(0),
        out_pps: out_pps.unwrap_or(0),
        errors_in: errors_in.unwrap_or(0),
        errors_out: errors_out.unwrap_or(0),
        discards_in: discards_in.unwrap_or(0),
        discards_out: discards_out.unwrap_or(0),
    })
}

struct CounterPatterns {
    in_bps: Regex,
    out_bps: Regex,
    in_pps: Regex,
    out_pps: Regex,
    errors_in: Regex,
    errors_out: Regex,
    discards_in: Regex,
    discards_out: Regex,
    bandwidth: Regex,
}

impl CounterPatterns {
    fn new() -> Self {
        let re = |pattern: &str| Regex::new(pattern).unwrap();
        Self {
            in_bps: re(r"(?i)input[^\n]*?rate[^\n]*?:\s*(\d+)\s*(?:bps|bits/sec)"),
            out_bps: re(r"(?i)output[^\n]*?rate[^\n]*?:\s*(\d+)\s*(?:bps|bits/sec)"),
            in_pps: re(r"(?i)input[^\n]*?\b(\d+)\s*(?:pps|packets/sec)"),
            out_pps: re(r"(?i)output[^\n]*?\b(\d+)\s*(?:pps|packets/sec)"),
            errors_in: re(r"(?i)input errors?\s*:\s*(\d+)"),
            errors_out: re(r"(?i)output errors?\s*:\s*(\d+)"),
            discards_in: re(r"(?i)input discards?\s*:\s*(\d+)"),
            discards_out: re(r"(?i)output discards?\s*:\s*(\d+)"),
            bandwidth: re(r"(?i)\bBW\s*:\s*(\d+)\s*([KMG])?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERFACE_OUTPUT: &str = r#"GigabitEthernet0/0/1 current state : UP
Line protocol current state : UP
Description: uplink to core-1
Route Port,The Maximum Transmit Unit is 1500
Port BW: 1G, Transceiver max BW: 1G
    Last 300 seconds input rate: 1250000 bits/sec, 980 packets/sec
    Last 300 seconds output rate: 2500000 bits/sec, 1500 packets/sec
    Input errors: 3
    Output errors: 1
    Input discards: 10
    Output discards: 0
GigabitEthernet0/0/2 current state : DOWN
Line protocol current state : DOWN
Description:
GigabitEthernet0/0/3 current state : Administratively DOWN
Line protocol current state : DOWN
Description: spare
"#;

    #[test]
    fn test_parse_interfaces() {
        let interfaces = parse_interfaces(INTERFACE_OUTPUT).unwrap();
        assert_eq!(interfaces.len(), 3);

        let ge1 = &interfaces[0];
        assert_eq!(ge1.name, "GigabitEthernet0/0/1");
        assert_eq!(ge1.status, InterfaceStatus::Up);
        assert_eq!(ge1.description.as_deref(), Some("uplink to core-1"));

        let stats = ge1.stats.as_ref().unwrap();
        assert_eq!(stats.capacity_bps, 1_000_000_000);
        assert_eq!(stats.in_bps, 1_250_000);
        assert_eq!(stats.out_bps, 2_500_000);
        assert_eq!(stats.in_pps, 980);
        assert_eq!(stats.out_pps, 1500);
        assert_eq!(stats.errors_in, 3);
        assert_eq!(stats.errors_out, 1);
        assert_eq!(stats.discards_in, 10);

        assert_eq!(interfaces[1].status, InterfaceStatus::Down);
        assert_eq!(interfaces[1].description, None);
        assert_eq!(interfaces[1].stats, None);
        assert_eq!(interfaces[2].status, InterfaceStatus::AdminDown);
        assert_eq!(interfaces[2].description.as_deref(), Some("spare"));
    }

    #[test]
    fn test_unknown_state_rejects_whole_output() {
        let output = "Eth-Trunk1 current state : UP\nEth-Trunk2 current state : TESTING\n";
        let err = parse_interfaces(output).unwrap_err();
        assert!(err.reason.contains("TESTING"));
    }

    #[test]
    fn test_no_blocks_rejected() {
        assert!(parse_interfaces("Info: no interfaces configured").is_err());
    }

    #[test]
    fn test_parse_interface_statistics() {
        let output = "Ethernet0 current state : UP\nBW: 100Mbps\nInput errors: 7\nOutput errors: 2\n";
        let stats = parse_interface_statistics(output).unwrap();
        assert_eq!(stats.capacity_bps, 100_000_000);
        assert_eq!(stats.errors_in, 7);
        assert_eq!(stats.errors_out, 2);
        assert_eq!(stats.in_bps, 0);

        assert!(parse_interface_statistics("Ethernet0 current state : UP\n").is_err());
    }

    #[test]
    fn test_out_of_range_bandwidth_is_dropped() {
        let output = "Ethernet0 current state : UP\nBW: 99999999999G\nInput errors: 4\n";
        let stats = parse_interface_statistics(output).unwrap();
        assert_eq!(stats.capacity_bps, 0);
        assert_eq!(stats.errors_in, 4);

        // Too many digits for a counter at all.
        let output = "Ethernet0 current state : UP\nBW: 1G\nInput errors: 99999999999999999999999\n";
        let stats = parse_interface_statistics(output).unwrap();
        assert_eq!(stats.capacity_bps, 1_000_000_000);
        assert_eq!(stats.errors_in, 0);

        let output = "Ethernet0 current state : UP\nBW: 99999999999G\n";
        assert!(parse_interface_statistics(output).is_err());
    }
}
