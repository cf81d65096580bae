use std::{fmt, num::TryFromIntError, str::FromStr};

use time::OffsetDateTime;

/// A reading as produced by a source, before cleaning.
///
/// `None` marks a missing value. Values are kept wide and signed so that
/// invalid input (negative counts, NaN speeds) survives until validation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawReading {
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub ts: OffsetDateTime,
    pub location: String,
    pub vehicle_count: Option<i64>,
    pub speed: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TrafficCategory {
    Low,
    Medium,
    High,
}

impl TrafficCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for TrafficCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown traffic category '{0}'")]
pub struct ParseCategoryError(pub String);

impl FromStr for TrafficCategory {
    type Err = ParseCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(ParseCategoryError(other.to_string())),
        }
    }
}

/// Largest count the `traffic_data.vehicle_count` INTEGER column holds.
pub const MAX_VEHICLE_COUNT: u32 = i32::MAX as u32;

/// A cleaned reading with its derived time features and category.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrafficReading {
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub ts: OffsetDateTime,
    pub location: String,
    pub vehicle_count: u32,
    pub speed: f64,
    /// 0..=23, in the timestamp's own offset.
    pub hour_of_day: u8,
    /// 0..=6, Monday is 0.
    pub day_of_week: u8,
    pub is_weekend: bool,
    pub traffic_category: TrafficCategory,
}

impl TrafficReading {
    pub fn weekday(&self) -> time::Weekday {
        self.ts.weekday()
    }
}

/// A row of the `traffic_data` table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TrafficDataRow {
    pub id: i64,
    pub location_id: i64,
    #[sqlx(rename = "timestamp")]
    pub ts: OffsetDateTime,
    pub vehicle_count: i32,
    pub speed: f64,
    pub hour_of_day: i16,
    pub day_of_week: i16,
    pub is_weekend: bool,
    pub traffic_category: String,
}

impl TrafficDataRow {
    /// Fails when the count exceeds [`MAX_VEHICLE_COUNT`].
    pub fn from_reading(id: i64, location_id: i64, r: &TrafficReading) -> Result<Self, TryFromIntError> {
        Ok(Self {
            id,
            location_id,
            ts: r.ts,
            vehicle_count: i32::try_from(r.vehicle_count)?,
            speed: r.speed,
            hour_of_day: i16::from(r.hour_of_day),
            day_of_week: i16::from(r.day_of_week),
            is_weekend: r.is_weekend,
            traffic_category: r.traffic_category.as_str().to_string(),
        })
    }

    pub fn category(&self) -> Result<TrafficCategory, ParseCategoryError> {
        self.traffic_category.parse()
    }
}
