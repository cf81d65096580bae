use time::OffsetDateTime;
use traffic_client::domain::{TrafficCategory, TrafficReading};

use crate::config::CategoryThresholds;
use crate::transform::clean::CleanReading;

/// `high` when both the high count and high speed thresholds are crossed,
/// `medium` for the medium pair, `low` otherwise.
pub fn categorize(vehicle_count: u32, speed: f64, t: &CategoryThresholds) -> TrafficCategory {
    if vehicle_count > t.high_count && speed < t.high_speed {
        TrafficCategory::High
    } else if vehicle_count > t.medium_count && speed < t.medium_speed {
        TrafficCategory::Medium
    } else {
        TrafficCategory::Low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeFeatures {
    pub hour_of_day: u8,
    /// Monday is 0.
    pub day_of_week: u8,
    pub is_weekend: bool,
}

/// Derived in the timestamp's own offset.
pub fn time_features(ts: OffsetDateTime) -> TimeFeatures {
    let day_of_week = ts.weekday().number_days_from_monday();
    TimeFeatures {
        hour_of_day: ts.hour(),
        day_of_week,
        is_weekend: day_of_week >= 5,
    }
}

pub fn enrich(r: CleanReading, thresholds: &CategoryThresholds) -> TrafficReading {
    let features = time_features(r.ts);
    TrafficReading {
        traffic_category: categorize(r.vehicle_count, r.speed, thresholds),
        ts: r.ts,
        location: r.location,
        vehicle_count: r.vehicle_count,
        speed: r.speed,
        hour_of_day: features.hour_of_day,
        day_of_week: features.day_of_week,
        is_weekend: features.is_weekend,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    #[test]
    fn categories_follow_thresholds() {
        let t = CategoryThresholds::default();
        assert_eq!(categorize(301, 19.9, &t), TrafficCategory::High);
        assert_eq!(categorize(300, 10.0, &t), TrafficCategory::Medium);
        assert_eq!(categorize(301, 25.0, &t), TrafficCategory::Medium);
        assert_eq!(categorize(151, 39.0, &t), TrafficCategory::Medium);
        assert_eq!(categorize(150, 10.0, &t), TrafficCategory::Low);
        assert_eq!(categorize(500, 40.0, &t), TrafficCategory::Low);
    }

    #[test]
    fn category_is_deterministic() {
        let t = CategoryThresholds::default();
        for count in (0..600).step_by(37) {
            for speed in [0.0, 12.5, 19.99, 20.0, 39.9, 80.0] {
                assert_eq!(categorize(count, speed, &t), categorize(count, speed, &t));
            }
        }
    }

    #[test]
    fn features_for_a_sunday_evening() {
        let f = time_features(datetime!(2023-10-01 18:45:00 UTC));
        assert_eq!(
            f,
            TimeFeatures {
                hour_of_day: 18,
                day_of_week: 6,
                is_weekend: true
            }
        );
    }

    #[test]
    fn features_use_the_timestamp_offset() {
        let ts = datetime!(2023-10-02 23:30:00 UTC).to_offset(offset!(+2));
        let f = time_features(ts);
        assert_eq!(f.hour_of_day, 1);
        assert_eq!(f.day_of_week, 1);
        assert!(!f.is_weekend);
    }
}
