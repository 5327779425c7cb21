//! Pure diff functions: previous latest state plus one observation in, new
//! latest state plus derived events out. No I/O happens here.

use chrono::{DateTime, Utc};

use super::counters::ErrorDeltas;
use super::flap::FlapDetector;
use crate::config::DetectionConfig;
use crate::db::{
    BgpSession, BgpStatus, EventDetails, EventType, FlapState, InterfaceState, InterfaceStatus,
    NewEvent, Severity,
};
use crate::parser::{BgpPeerRecord, InterfaceRecord};

/// Thresholds applied while diffing.
#[derive(Debug, Clone, Copy)]
pub struct DiffRules {
    pub flap: FlapDetector,
    pub error_delta_threshold: u64,
    pub discard_delta_threshold: u64,
}

impl DiffRules {
    pub fn from_config(config: &DetectionConfig) -> Self {
        Self {
            flap: FlapDetector::new(config.flap_window, config.flap_threshold),
            error_delta_threshold: config.error_delta_threshold,
            discard_delta_threshold: config.discard_delta_threshold,
        }
    }

    fn is_breach(&self, deltas: &ErrorDeltas) -> bool {
        deltas.errors > self.error_delta_threshold || deltas.discards > self.discard_delta_threshold
    }
}

pub fn diff_bgp(
    previous: Option<&BgpSession>,
    observed: &BgpPeerRecord,
    now: DateTime<Utc>,
    rules: &DiffRules,
) -> (BgpSession, Vec<NewEvent>) {
    let source = observed.peer_address.as_str();
    let mut events = Vec::new();

    let Some(previous) = previous else {
        let session = BgpSession {
            peer_address: observed.peer_address.clone(),
            peer_asn: observed.peer_asn,
            description: observed.description.clone(),
            status: observed.status,
            uptime_seconds: observed.uptime_seconds,
            prefixes_received: observed.prefixes_received.unwrap_or(0),
            prefixes_sent: observed.prefixes_sent.unwrap_or(0),
            last_state_change: now,
            last_updated: now,
            created_at: now,
            flap: FlapState::default(),
        };

        if observed.status.is_abnormal() {
            events.push(NewEvent::detected(
                EventType::Info,
                Severity::Info,
                source,
                format!("BGP peer {} first seen in state {}", source, observed.status),
                EventDetails::FirstSeen {
                    status: observed.status.to_string(),
                },
                now,
            ));
        }
        return (session, events);
    };

    let transitioned = previous.status != observed.status;

    let mut session = BgpSession {
        peer_address: observed.peer_address.clone(),
        peer_asn: observed.peer_asn,
        description: observed.description.clone().or_else(|| previous.description.clone()),
        status: observed.status,
        uptime_seconds: observed.uptime_seconds,
        prefixes_received: observed.prefixes_received.unwrap_or(previous.prefixes_received),
        prefixes_sent: observed.prefixes_sent.unwrap_or(previous.prefixes_sent),
        last_state_change: if transitioned { now } else { previous.last_state_change },
        last_updated: now,
        created_at: previous.created_at,
        flap: previous.flap.clone(),
    };

    if transitioned {
        events.push(bgp_transition(source, previous.status, observed.status, now));
    }

    if let Some(count) = rules.flap.observe(&mut session.flap, transitioned, now) {
        events.push(flapping("BGP peer", source, count, rules, now));
    }

    (session, events)
}

fn bgp_transition(source: &str, from: BgpStatus, to: BgpStatus, now: DateTime<Utc>) -> NewEvent {
    let (event_type, severity, verb) = if to.is_up() {
        (EventType::BgpUp, Severity::Info, "established")
    } else {
        (EventType::BgpDown, Severity::Critical, "went down")
    };

    NewEvent::detected(
        event_type,
        severity,
        source,
        format!("BGP peer {} {} ({} -> {})", source, verb, from, to),
        EventDetails::StatusChange {
            from: from.to_string(),
            to: to.to_string(),
        },
        now,
    )
}

pub fn diff_interface(
    previous: Option<&InterfaceState>,
    observed: &InterfaceRecord,
    now: DateTime<Utc>,
    rules: &DiffRules,
) -> (InterfaceState, Vec<NewEvent>) {
    let source = observed.name.as_str();
    let mut events = Vec::new();

    let Some(previous) = previous else {
        let counters = observed.stats.unwrap_or_default();
        let state = InterfaceState {
            name: observed.name.clone(),
            description: observed.description.clone(),
            status: observed.status,
            counters,
            counters_seen: observed.stats.is_some(),
            utilization_in: counters.utilization_in(),
            utilization_out: counters.utilization_out(),
            last_state_change: now,
            last_updated: now,
            created_at: now,
            flap: FlapState::default(),
            error_breached: false,
        };

        if observed.status.is_abnormal() {
            events.push(NewEvent::detected(
                EventType::Info,
                Severity::Info,
                source,
                format!("Interface {} first seen {}", source, observed.status),
                EventDetails::FirstSeen {
                    status: observed.status.to_string(),
                },
                now,
            ));
        }
        return (state, events);
    };

    let transitioned = previous.status != observed.status;
    let counters = observed.stats.unwrap_or(previous.counters);

    let mut state = InterfaceState {
        name: observed.name.clone(),
        description: observed.description.clone().or_else(|| previous.description.clone()),
        status: observed.status,
        counters,
        counters_seen: previous.counters_seen || observed.stats.is_some(),
        utilization_in: counters.utilization_in(),
        utilization_out: counters.utilization_out(),
        last_state_change: if transitioned { now } else { previous.last_state_change },
        last_updated: now,
        created_at: previous.created_at,
        flap: previous.flap.clone(),
        error_breached: previous.error_breached,
    };

    if transitioned {
        events.push(interface_transition(source, previous.status, observed.status, now));
    }

    if let Some(count) = rules.flap.observe(&mut state.flap, transitioned, now) {
        events.push(flapping("Interface", source, count, rules, now));
    }

    // Without an earlier reading there is no baseline to diff against.
    if let Some(stats) = &observed.stats {
        if previous.counters_seen {
            let deltas = ErrorDeltas::between(&previous.counters, stats);
            if rules.is_breach(&deltas) {
                if !state.error_breached {
                    state.error_breached = true;
                    events.push(error_breach(source, &deltas, rules, now));
                }
            } else {
                state.error_breached = false;
            }
        }
    }

    (state, events)
}

fn interface_transition(
    source: &str,
    from: InterfaceStatus,
    to: InterfaceStatus,
    now: DateTime<Utc>,
) -> NewEvent {
    let (event_type, severity) = if to.is_up() {
        (EventType::InterfaceUp, Severity::Info)
    } else {
        (EventType::InterfaceDown, Severity::Critical)
    };

    NewEvent::detected(
        event_type,
        severity,
        source,
        format!("Interface {} is {} (was {})", source, to, from),
        EventDetails::StatusChange {
            from: from.to_string(),
            to: to.to_string(),
        },
        now,
    )
}

fn flapping(label: &str, source: &str, transitions: usize, rules: &DiffRules, now: DateTime<Utc>) -> NewEvent {
    let window_secs = rules.flap.window().as_secs();
    NewEvent::detected(
        EventType::Flapping,
        Severity::Warning,
        source,
        format!(
            "{} {} is flapping: {} state changes in {}s",
            label, source, transitions, window_secs
        ),
        EventDetails::Flapping {
            transitions,
            window_secs,
        },
        now,
    )
}

fn error_breach(source: &str, deltas: &ErrorDeltas, rules: &DiffRules, now: DateTime<Utc>) -> NewEvent {
    NewEvent::detected(
        EventType::HighErrors,
        Severity::Warning,
        source,
        format!(
            "Interface {} errors rising: +{} errors, +{} discards since last poll",
            source, deltas.errors, deltas.discards
        ),
        EventDetails::ErrorBreach {
            errors_delta: deltas.errors,
            discards_delta: deltas.discards,
            error_threshold: rules.error_delta_threshold,
            discard_threshold: rules.discard_delta_threshold,
        },
        now,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InterfaceCounters;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::time::Duration;

    fn rules() -> DiffRules {
        DiffRules {
            flap: FlapDetector::new(Duration::from_secs(300), 3),
            error_delta_threshold: 100,
            discard_delta_threshold: 1000,
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn peer(status: BgpStatus) -> BgpPeerRecord {
        BgpPeerRecord {
            peer_address: "203.0.113.1".to_string(),
            peer_asn: 65001,
            description: None,
            status,
            uptime_seconds: 0,
            prefixes_received: Some(100),
            prefixes_sent: Some(10),
        }
    }

    fn iface(status: InterfaceStatus, stats: Option<InterfaceCounters>) -> InterfaceRecord {
        InterfaceRecord {
            name: "eth0".to_string(),
            description: None,
            status,
            stats,
        }
    }

    fn errors_in(n: u64) -> Option<InterfaceCounters> {
        Some(InterfaceCounters {
            capacity_bps: 1_000_000,
            errors_in: n,
            ..Default::default()
        })
    }

    #[test]
    fn test_first_sight_emits_no_transition() {
        let (session, events) = diff_bgp(None, &peer(BgpStatus::Established), t(0), &rules());
        assert!(events.is_empty());
        assert_eq!(session.last_state_change, t(0));

        let (_, events) = diff_bgp(None, &peer(BgpStatus::Down), t(0), &rules());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Info);
        assert_eq!(events[0].severity, Severity::Info);

        // Idle is not abnormal on first sight.
        let (_, events) = diff_bgp(None, &peer(BgpStatus::Idle), t(0), &rules());
        assert!(events.is_empty());

        let (_, events) = diff_interface(None, &iface(InterfaceStatus::AdminDown, None), t(0), &rules());
        assert_eq!(events[0].event_type, EventType::Info);
    }

    #[test]
    fn test_unchanged_observation_keeps_state_change_time() {
        let (first, _) = diff_bgp(None, &peer(BgpStatus::Established), t(0), &rules());
        let (second, events) = diff_bgp(Some(&first), &peer(BgpStatus::Established), t(60), &rules());

        assert!(events.is_empty());
        assert_eq!(second.last_state_change, t(0));
        assert_eq!(second.last_updated, t(60));
        assert_eq!(second.created_at, t(0));
    }

    #[test]
    fn test_transition_classification() {
        let (up, _) = diff_bgp(None, &peer(BgpStatus::Established), t(0), &rules());
        let (active, events) = diff_bgp(Some(&up), &peer(BgpStatus::Active), t(60), &rules());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::BgpDown);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(active.last_state_change, t(60));

        let (_, events) = diff_bgp(Some(&active), &peer(BgpStatus::Established), t(120), &rules());
        assert_eq!(events[0].event_type, EventType::BgpUp);
        assert_eq!(events[0].severity, Severity::Info);

        let (if_up, _) = diff_interface(None, &iface(InterfaceStatus::Up, None), t(0), &rules());
        let (_, events) = diff_interface(Some(&if_up), &iface(InterfaceStatus::AdminDown, None), t(60), &rules());
        assert_eq!(events[0].event_type, EventType::InterfaceDown);
        assert_eq!(
            events[0].details,
            Some(EventDetails::StatusChange {
                from: "up".to_string(),
                to: "admin_down".to_string()
            })
        );
    }

    #[test]
    fn test_missing_details_carry_previous_values() {
        let (first, _) = diff_bgp(None, &peer(BgpStatus::Established), t(0), &rules());
        let mut observed = peer(BgpStatus::Established);
        observed.prefixes_received = None;
        observed.prefixes_sent = None;

        let (second, _) = diff_bgp(Some(&first), &observed, t(60), &rules());
        assert_eq!(second.prefixes_received, 100);
        assert_eq!(second.prefixes_sent, 10);

        let (if_first, _) = diff_interface(None, &iface(InterfaceStatus::Up, errors_in(50)), t(0), &rules());
        let (if_second, events) = diff_interface(Some(&if_first), &iface(InterfaceStatus::Up, None), t(60), &rules());
        assert!(events.is_empty());
        assert_eq!(if_second.counters.errors_in, 50);
    }

    #[test]
    fn test_toggles_produce_single_flapping_event() {
        let statuses = [
            BgpStatus::Established,
            BgpStatus::Idle,
            BgpStatus::Established,
            BgpStatus::Idle,
            BgpStatus::Established,
            BgpStatus::Idle,
        ];

        let mut latest: Option<BgpSession> = None;
        let mut all = Vec::new();
        for (i, status) in statuses.iter().enumerate() {
            let (session, events) = diff_bgp(latest.as_ref(), &peer(*status), t(i as i64 * 20), &rules());
            all.extend(events);
            latest = Some(session);
        }

        let transitions = all
            .iter()
            .filter(|e| matches!(e.event_type, EventType::BgpUp | EventType::BgpDown))
            .count();
        let flaps = all.iter().filter(|e| e.event_type == EventType::Flapping).count();
        assert_eq!(transitions, 5);
        assert_eq!(flaps, 1);
    }

    #[test]
    fn test_error_breach_once_then_clears() {
        let rules = rules();
        let (s0, _) = diff_interface(None, &iface(InterfaceStatus::Up, errors_in(50)), t(0), &rules);

        let (s1, events) = diff_interface(Some(&s0), &iface(InterfaceStatus::Up, errors_in(200)), t(60), &rules);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::HighErrors);
        assert_eq!(events[0].severity, Severity::Warning);
        assert!(s1.error_breached);

        let (s2, events) = diff_interface(Some(&s1), &iface(InterfaceStatus::Up, errors_in(205)), t(120), &rules);
        assert!(events.is_empty());

        let (s3, events) = diff_interface(Some(&s2), &iface(InterfaceStatus::Up, errors_in(30)), t(180), &rules);
        assert!(events.is_empty());
        assert!(!s3.error_breached);
    }

    #[test]
    fn test_reset_followed_by_small_increase_is_silent() {
        let rules = rules();
        let (s0, _) = diff_interface(None, &iface(InterfaceStatus::Up, errors_in(5_000)), t(0), &rules);
        let (s1, events) = diff_interface(Some(&s0), &iface(InterfaceStatus::Up, errors_in(10)), t(60), &rules);
        assert!(events.is_empty());
        let (_, events) = diff_interface(Some(&s1), &iface(InterfaceStatus::Up, errors_in(90)), t(120), &rules);
        assert!(events.is_empty());
    }

    #[test]
    fn test_no_baseline_means_no_breach() {
        let rules = rules();
        let (s0, _) = diff_interface(None, &iface(InterfaceStatus::Up, None), t(0), &rules);
        assert!(!s0.counters_seen);

        // A status-only observation does not create a baseline either.
        let (s1, _) = diff_interface(Some(&s0), &iface(InterfaceStatus::Up, None), t(30), &rules);
        assert!(!s1.counters_seen);

        let (s2, events) = diff_interface(Some(&s1), &iface(InterfaceStatus::Up, errors_in(5_000)), t(60), &rules);
        assert!(events.is_empty());
        assert!(!s2.error_breached);
        assert!(s2.counters_seen);
    }

    #[test]
    fn test_zero_reading_is_a_baseline() {
        let rules = rules();
        let idle = Some(InterfaceCounters::default());
        let (s0, _) = diff_interface(None, &iface(InterfaceStatus::Up, idle), t(0), &rules);
        assert!(s0.counters_seen);

        let (s1, events) = diff_interface(Some(&s0), &iface(InterfaceStatus::Up, errors_in(500)), t(60), &rules);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::HighErrors);
        assert!(s1.error_breached);

        // A missing reading later keeps the baseline.
        let (s2, _) = diff_interface(Some(&s1), &iface(InterfaceStatus::Up, None), t(120), &rules);
        assert!(s2.counters_seen);
        assert_eq!(s2.counters.errors_in, 500);
    }
}
