//! Reset-aware counter deltas.

use crate::db::InterfaceCounters;

/// Increase of a monotonic counter since the previous reading. A decrease
/// means the device reset the counter, so the new reading is the baseline.
pub fn counter_delta(previous: u64, current: u64) -> u64 {
    current.saturating_sub(previous)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorDeltas {
    pub errors: u64,
    pub discards: u64,
}

impl ErrorDeltas {
    pub fn between(previous: &InterfaceCounters, current: &InterfaceCounters) -> Self {
        Self {
            errors: counter_delta(previous.errors_in, current.errors_in)
                .saturating_add(counter_delta(previous.errors_out, current.errors_out)),
            discards: counter_delta(previous.discards_in, current.discards_in)
                .saturating_add(counter_delta(previous.discards_out, current.discards_out)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrease_is_a_reset() {
        assert_eq!(counter_delta(50, 200), 150);
        assert_eq!(counter_delta(200, 30), 0);
        assert_eq!(counter_delta(30, 30), 0);
    }

    #[test]
    fn test_deltas_sum_directions_independently() {
        let previous = InterfaceCounters {
            errors_in: 10,
            errors_out: 500,
            discards_in: 7,
            ..Default::default()
        };
        let current = InterfaceCounters {
            errors_in: 25,
            errors_out: 3,
            discards_in: 9,
            discards_out: 4,
            ..Default::default()
        };

        let deltas = ErrorDeltas::between(&previous, &current);
        assert_eq!(deltas, ErrorDeltas { errors: 15, discards: 6 });
    }

    #[test]
    fn test_deltas_saturate() {
        let current = InterfaceCounters {
            errors_in: u64::MAX,
            errors_out: u64::MAX,
            discards_in: u64::MAX,
            discards_out: 1,
            ..Default::default()
        };

        let deltas = ErrorDeltas::between(&InterfaceCounters::default(), &current);
        assert_eq!(deltas, ErrorDeltas { errors: u64::MAX, discards: u64::MAX });
    }
}
