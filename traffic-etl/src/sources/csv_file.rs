use std::{fs::File, path::PathBuf};

use csv::StringRecord;
use futures::Stream;
use time::{format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime, PrimitiveDateTime};
use traffic_client::domain::RawReading;

use crate::pipeline::{Envelope, PipelineError, Source};

/// CSV source for raw readings.
///
/// Expected header columns (by name):
/// - timestamp (RFC3339, or `YYYY-MM-DD HH:MM:SS` taken as UTC)
/// - location (or location_id)
/// - vehicle_count (empty, `nan` or garbage = missing)
/// - speed (or average_speed; empty, `nan` or garbage = missing)
pub struct CsvFileSource {
    path: PathBuf,
}

impl CsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

struct Columns {
    ts: usize,
    location: usize,
    vehicle_count: usize,
    speed: usize,
}

impl Columns {
    fn resolve(headers: &StringRecord) -> Result<Self, PipelineError> {
        let find = |names: &[&str]| -> Result<usize, PipelineError> {
            headers
                .iter()
                .position(|h| names.contains(&h.trim()))
                .ok_or_else(|| PipelineError::Source(format!("missing column '{}' in CSV header", names[0])))
        };

        Ok(Self {
            ts: find(&["timestamp", "ts"])?,
            location: find(&["location", "location_id"])?,
            vehicle_count: find(&["vehicle_count"])?,
            speed: find(&["speed", "average_speed"])?,
        })
    }
}

/// RFC3339, else a naive `YYYY-MM-DD HH:MM:SS` as written by spreadsheet
/// tools, read as UTC.
pub(crate) fn parse_timestamp(s: &str) -> Result<OffsetDateTime, PipelineError> {
    let s = s.trim();
    OffsetDateTime::parse(s, &Rfc3339)
        .or_else(|_| {
            PrimitiveDateTime::parse(s, format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
                .map(PrimitiveDateTime::assume_utc)
        })
        .map_err(|e| PipelineError::Source(format!("invalid timestamp '{s}': {e}")))
}

fn parse_optional_f64(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        return None;
    }
    match trimmed.parse::<f64>() {
        Ok(v) => Some(v),
        Err(_) => {
            metrics::counter!("csv_unparseable_values_total").increment(1);
            None
        }
    }
}

/// Counts may have been written as floats (`125.0`) by tools that widen
/// integer columns holding blanks.
fn parse_optional_count(s: &str) -> Option<i64> {
    let v = parse_optional_f64(s)?;
    if v.is_finite() && v.fract() == 0.0 {
        Some(v as i64)
    } else {
        metrics::counter!("csv_unparseable_values_total").increment(1);
        None
    }
}

fn record_to_reading(record: &StringRecord, cols: &Columns) -> Result<RawReading, PipelineError> {
    let get = |idx: usize| record.get(idx).unwrap_or("");

    Ok(RawReading {
        ts: parse_timestamp(get(cols.ts))?,
        location: get(cols.location).trim().to_string(),
        vehicle_count: parse_optional_count(get(cols.vehicle_count)),
        speed: parse_optional_f64(get(cols.speed)),
    })
}

#[async_trait::async_trait]
impl Source<RawReading> for CsvFileSource {
    async fn stream(
        &self,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Envelope<RawReading>, PipelineError>> + Send>> {
        // Blocking reader inside a single async task; inputs are one batch file.
        let path = self.path.clone();
        let s = async_stream::try_stream! {
            tracing::info!(path = %path.display(), "reading raw readings from CSV");
            let file = File::open(&path)
                .map_err(|e| PipelineError::Source(format!("failed to open CSV file {}: {e}", path.display())))?;
            let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(file);
            let headers = rdr
                .headers()
                .map_err(|e| PipelineError::Source(format!("failed to read CSV headers: {e}")))?
                .clone();
            let cols = Columns::resolve(&headers)?;

            for result in rdr.records() {
                let record = result.map_err(|e| PipelineError::Source(format!(
                    "failed to read CSV record: {e}"
                )))?;

                let reading = match record_to_reading(&record, &cols) {
                    Ok(r) => r,
                    Err(e) => {
                        metrics::counter!("csv_parse_errors_total").increment(1);
                        Err(e)?
                    }
                };

                yield Envelope::now(reading);
            }
        };

        Box::pin(s)
    }
}
