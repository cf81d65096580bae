use std::{collections::HashMap, time::SystemTime};

use time::{macros::datetime, OffsetDateTime};
use traffic_client::domain::{RawReading, MAX_VEHICLE_COUNT};

use crate::config::{MissingValuePolicy, TransformConfig};
use crate::pipeline::{Envelope, PipelineError};

/// A reading with both measurements present and valid.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanReading {
    pub ts: OffsetDateTime,
    pub location: String,
    pub vehicle_count: u32,
    pub speed: f64,
}

#[derive(Debug, Default)]
pub struct CleanOutcome {
    pub readings: Vec<Envelope<CleanReading>>,
    pub dropped: usize,
    pub imputed: usize,
    pub invalid_values: usize,
    pub capped_speeds: usize,
}

/// Structural checks a reading must pass to be kept at all.
///
/// Rules:
/// - location must be non-empty.
/// - ts must be within a broad sanity window [2000-01-01, 2100-01-01).
pub fn validate_reading(r: &RawReading) -> Result<(), PipelineError> {
    if r.location.trim().is_empty() {
        return Err(PipelineError::Transform("location must not be empty".to_string()));
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if r.ts < min_ts || r.ts >= max_ts {
        return Err(PipelineError::Transform("timestamp out of allowed range".to_string()));
    }

    Ok(())
}

fn valid_count(v: i64) -> Option<u32> {
    u32::try_from(v).ok().filter(|&c| c <= MAX_VEHICLE_COUNT)
}

fn valid_speed(v: f64) -> Option<f64> {
    (v.is_finite() && v >= 0.0).then_some(v)
}

struct Slot {
    ts: OffsetDateTime,
    location: String,
    received_at: SystemTime,
    count: Option<u32>,
    speed: Option<f64>,
    imputed: bool,
}

/// Fill gaps with the next present value, then any trailing gaps with the
/// previous one. Returns the positions that were filled.
fn fill_adjacent<T: Copy>(values: &mut [Option<T>]) -> Vec<usize> {
    let was_missing: Vec<usize> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.is_none().then_some(i))
        .collect();

    let mut next = None;
    for v in values.iter_mut().rev() {
        match v {
            Some(x) => next = Some(*x),
            None => *v = next,
        }
    }
    let mut prev = None;
    for v in values.iter_mut() {
        match v {
            Some(x) => prev = Some(*x),
            None => *v = prev,
        }
    }

    was_missing.into_iter().filter(|&i| values[i].is_some()).collect()
}

/// Per-location backward-then-forward fill, in timestamp order.
fn fill_within_locations(slots: &mut [Slot]) {
    let mut series: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, slot) in slots.iter().enumerate() {
        series.entry(slot.location.as_str()).or_default().push(i);
    }
    let mut groups: Vec<Vec<usize>> = series.into_values().collect();
    for idx in &mut groups {
        idx.sort_by_key(|&i| slots[i].ts);
    }

    for idx in groups {
        let mut counts: Vec<Option<u32>> = idx.iter().map(|&i| slots[i].count).collect();
        for pos in fill_adjacent(&mut counts) {
            let slot = &mut slots[idx[pos]];
            slot.count = counts[pos];
            slot.imputed = true;
        }

        let mut speeds: Vec<Option<f64>> = idx.iter().map(|&i| slots[i].speed).collect();
        for pos in fill_adjacent(&mut speeds) {
            let slot = &mut slots[idx[pos]];
            slot.speed = speeds[pos];
            slot.imputed = true;
        }
    }
}

/// Validate, apply the missing-value policy and cap speeds.
///
/// Output keeps input order. A reading is dropped when it fails
/// [`validate_reading`], or when a value is still missing after the policy
/// ran (always the case under `Drop`).
pub fn clean(input: Vec<Envelope<RawReading>>, cfg: &TransformConfig) -> CleanOutcome {
    let mut out = CleanOutcome::default();
    let mut slots = Vec::with_capacity(input.len());

    for env in input {
        if let Err(e) = validate_reading(&env.payload) {
            tracing::debug!(error = %e, location = %env.payload.location, ts = %env.payload.ts, "dropping reading");
            out.dropped += 1;
            continue;
        }

        let r = env.payload;
        let count = r.vehicle_count.and_then(|v| {
            let valid = valid_count(v);
            if valid.is_none() {
                out.invalid_values += 1;
            }
            valid
        });
        let speed = r.speed.and_then(|v| {
            let valid = valid_speed(v);
            if valid.is_none() {
                out.invalid_values += 1;
            }
            valid
        });

        slots.push(Slot {
            ts: r.ts,
            location: r.location.trim().to_string(),
            received_at: env.received_at,
            count,
            speed,
            imputed: false,
        });
    }

    match cfg.missing_policy {
        MissingValuePolicy::Drop => {}
        MissingValuePolicy::FillDefault => {
            for slot in &mut slots {
                if slot.count.is_none() {
                    slot.count = Some(cfg.default_vehicle_count);
                    slot.imputed = true;
                }
                if slot.speed.is_none() {
                    slot.speed = Some(cfg.default_speed);
                    slot.imputed = true;
                }
            }
        }
        MissingValuePolicy::FillAdjacent => fill_within_locations(&mut slots),
    }

    out.readings.reserve(slots.len());
    for slot in slots {
        let (Some(vehicle_count), Some(mut speed)) = (slot.count, slot.speed) else {
            out.dropped += 1;
            continue;
        };
        if slot.imputed {
            out.imputed += 1;
        }
        if speed > cfg.max_speed {
            speed = cfg.max_speed;
            out.capped_speeds += 1;
        }

        out.readings.push(Envelope {
            payload: CleanReading {
                ts: slot.ts,
                location: slot.location,
                vehicle_count,
                speed,
            },
            received_at: slot.received_at,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn raw(hour: u8, location: &str, count: Option<i64>, speed: Option<f64>) -> Envelope<RawReading> {
        Envelope::now(RawReading {
            ts: datetime!(2023-10-02 00:00:00 UTC) + time::Duration::hours(i64::from(hour)),
            location: location.to_string(),
            vehicle_count: count,
            speed,
        })
    }

    fn cfg(policy: MissingValuePolicy) -> TransformConfig {
        TransformConfig {
            missing_policy: policy,
            ..TransformConfig::default()
        }
    }

    #[test]
    fn validation_rejects_empty_location() {
        let env = raw(0, "  ", Some(1), Some(1.0));
        assert!(matches!(validate_reading(&env.payload), Err(PipelineError::Transform(_))));
    }

    #[test]
    fn validation_rejects_out_of_range_ts() {
        let mut env = raw(0, "A", Some(1), Some(1.0));
        env.payload.ts = datetime!(1800-01-01 00:00:00 UTC);
        assert!(matches!(validate_reading(&env.payload), Err(PipelineError::Transform(_))));
    }

    #[test]
    fn fill_adjacent_prefers_next_value() {
        let mut v = vec![None, Some(1), None, None, Some(4), None];
        let filled = fill_adjacent(&mut v);
        assert_eq!(v, vec![Some(1), Some(1), Some(4), Some(4), Some(4), Some(4)]);
        assert_eq!(filled, vec![0, 2, 3, 5]);
    }

    #[test]
    fn fill_adjacent_leaves_all_missing_series_alone() {
        let mut v: Vec<Option<f64>> = vec![None, None];
        assert!(fill_adjacent(&mut v).is_empty());
        assert_eq!(v, vec![None, None]);
    }

    #[test]
    fn drop_policy_drops_incomplete_rows() {
        let input = vec![
            raw(0, "A", Some(10), Some(50.0)),
            raw(1, "A", None, Some(50.0)),
            raw(2, "A", Some(10), None),
        ];
        let out = clean(input, &cfg(MissingValuePolicy::Drop));
        assert_eq!(out.readings.len(), 1);
        assert_eq!(out.dropped, 2);
        assert_eq!(out.imputed, 0);
    }

    #[test]
    fn fill_default_imputes_missing_speed() {
        let input = vec![raw(0, "A", Some(10), None)];
        let config = TransformConfig {
            default_speed: 33.0,
            ..cfg(MissingValuePolicy::FillDefault)
        };
        let out = clean(input, &config);

        assert_eq!(out.dropped, 0);
        assert_eq!(out.imputed, 1);
        assert_eq!(out.readings[0].payload.speed, 33.0);
        assert_eq!(out.readings[0].payload.vehicle_count, 10);
    }

    #[test]
    fn fill_adjacent_stays_within_location() {
        let input = vec![
            raw(0, "A", Some(10), Some(40.0)),
            raw(0, "B", Some(99), Some(90.0)),
            raw(1, "A", None, Some(41.0)),
            raw(1, "B", Some(98), Some(91.0)),
            raw(2, "A", Some(30), Some(42.0)),
        ];
        let out = clean(input, &cfg(MissingValuePolicy::FillAdjacent));

        assert_eq!(out.readings.len(), 5);
        assert_eq!(out.imputed, 1);
        assert_eq!(out.readings[2].payload.location, "A");
        assert_eq!(out.readings[2].payload.vehicle_count, 30);
    }

    #[test]
    fn fill_adjacent_follows_timestamps_not_input_order() {
        let input = vec![
            raw(2, "A", Some(30), Some(42.0)),
            raw(1, "A", None, Some(41.0)),
            raw(0, "A", Some(10), Some(40.0)),
        ];
        let out = clean(input, &cfg(MissingValuePolicy::FillAdjacent));
        assert_eq!(out.readings[1].payload.vehicle_count, 30);
    }

    #[test]
    fn fill_adjacent_drops_unrecoverable_series() {
        let input = vec![raw(0, "A", Some(10), None), raw(1, "A", Some(11), None)];
        let out = clean(input, &cfg(MissingValuePolicy::FillAdjacent));
        assert!(out.readings.is_empty());
        assert_eq!(out.dropped, 2);
    }

    #[test]
    fn invalid_values_become_missing() {
        let input = vec![
            raw(0, "A", Some(-5), Some(f64::NAN)),
            raw(1, "A", Some(12), Some(-1.0)),
            raw(2, "A", Some(14), Some(60.0)),
        ];
        let out = clean(input, &cfg(MissingValuePolicy::FillAdjacent));

        assert_eq!(out.invalid_values, 3);
        assert_eq!(out.imputed, 2);
        assert_eq!(out.readings[0].payload.vehicle_count, 12);
        assert_eq!(out.readings[0].payload.speed, 60.0);
    }

    #[test]
    fn counts_beyond_the_column_are_invalid() {
        let input = vec![
            raw(0, "A", Some(3_000_000_000), Some(50.0)),
            raw(1, "A", Some(i64::from(MAX_VEHICLE_COUNT)), Some(50.0)),
        ];
        let out = clean(input, &cfg(MissingValuePolicy::Drop));

        assert_eq!(out.invalid_values, 1);
        assert_eq!(out.dropped, 1);
        assert_eq!(out.readings[0].payload.vehicle_count, MAX_VEHICLE_COUNT);
    }

    #[test]
    fn speeds_are_capped() {
        let input = vec![raw(0, "A", Some(1), Some(250.0))];
        let out = clean(input, &cfg(MissingValuePolicy::Drop));
        assert_eq!(out.capped_speeds, 1);
        assert_eq!(out.readings[0].payload.speed, 120.0);
    }
}
