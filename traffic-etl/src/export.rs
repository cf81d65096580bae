use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::Serialize;
use time::OffsetDateTime;
use traffic_client::domain::{RawReading, TrafficReading};

use crate::pipeline::{Envelope, PipelineError};

/// An intermediate file written during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactInfo {
    pub path: PathBuf,
    pub rows: usize,
    /// BLAKE3 of the file contents, hex.
    pub digest: String,
}

const RAW_HEADER: [&str; 4] = ["timestamp", "location", "vehicle_count", "speed"];

const ENRICHED_HEADER: [&str; 9] = [
    "timestamp",
    "location",
    "vehicle_count",
    "speed",
    "hour_of_day",
    "day_of_week",
    "day_name",
    "is_weekend",
    "traffic_category",
];

// Field order must match RAW_HEADER.
#[derive(Serialize)]
struct RawCsvRow<'a> {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    location: &'a str,
    vehicle_count: Option<i64>,
    speed: Option<f64>,
}

// Field order must match ENRICHED_HEADER.
#[derive(Serialize)]
struct EnrichedCsvRow<'a> {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    location: &'a str,
    vehicle_count: u32,
    speed: f64,
    hour_of_day: u8,
    day_of_week: u8,
    day_name: String,
    is_weekend: bool,
    traffic_category: &'static str,
}

fn export_err(path: &Path, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Sink(format!("failed to write {}: {e}", path.display()))
}

/// The header is written up front so a run with no rows still leaves a
/// replayable file.
fn write_rows<T, I>(path: &Path, header: &[&str], rows: I) -> Result<ArtifactInfo, PipelineError>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| export_err(path, e))?;
    }

    let file = File::create(path).map_err(|e| export_err(path, e))?;
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(BufWriter::new(file));
    wtr.write_record(header).map_err(|e| export_err(path, e))?;
    let mut count = 0;
    for row in rows {
        wtr.serialize(row).map_err(|e| export_err(path, e))?;
        count += 1;
    }
    let mut inner = wtr.into_inner().map_err(|e| export_err(path, e.error()))?;
    inner.flush().map_err(|e| export_err(path, e))?;
    drop(inner);

    let digest = file_digest(path)?;
    tracing::info!(path = %path.display(), rows = count, digest = %digest, "wrote intermediate file");

    Ok(ArtifactInfo {
        path: path.to_path_buf(),
        rows: count,
        digest,
    })
}

pub fn file_digest(path: &Path) -> Result<String, PipelineError> {
    let bytes = fs::read(path).map_err(|e| export_err(path, e))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Missing values are written as empty cells.
pub fn write_raw_csv(path: &Path, readings: &[Envelope<RawReading>]) -> Result<ArtifactInfo, PipelineError> {
    write_rows(
        path,
        &RAW_HEADER,
        readings.iter().map(|env| {
            let r = &env.payload;
            RawCsvRow {
                timestamp: r.ts,
                location: &r.location,
                vehicle_count: r.vehicle_count,
                speed: r.speed,
            }
        }),
    )
}

pub fn write_enriched_csv(
    path: &Path,
    readings: &[Envelope<TrafficReading>],
) -> Result<ArtifactInfo, PipelineError> {
    write_rows(
        path,
        &ENRICHED_HEADER,
        readings.iter().map(|env| {
            let r = &env.payload;
            EnrichedCsvRow {
                timestamp: r.ts,
                location: &r.location,
                vehicle_count: r.vehicle_count,
                speed: r.speed,
                hour_of_day: r.hour_of_day,
                day_of_week: r.day_of_week,
                day_name: r.weekday().to_string(),
                is_weekend: r.is_weekend,
                traffic_category: r.traffic_category.as_str(),
            }
        }),
    )
}
