use std::{path::PathBuf, pin::Pin, time::SystemTime};

use futures::{stream, Stream, StreamExt};
use serde::Serialize;
use traffic_client::domain::{RawReading, TrafficReading};

use crate::export::{self, ArtifactInfo};

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }

    /// Replace the payload, keeping the original receive time.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            payload: f(self.payload),
            received_at: self.received_at,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("source error: {0}")]
    Source(String),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("sink error: {0}")]
    Sink(String),
    #[error("reading references unknown location '{0}'")]
    UnresolvedLocation(String),
}

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(
        &self,
    ) -> Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;
}

/// Batch transform. Cleaning needs neighbouring readings, so a transform sees
/// the whole input at once rather than one envelope at a time.
pub trait Transform<I, O>: Send + Sync {
    fn apply(&self, input: Vec<Envelope<I>>) -> Result<Transformed<O>, PipelineError>;
}

#[derive(Debug)]
pub struct Transformed<O> {
    pub records: Vec<Envelope<O>>,
    pub stats: TransformStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformStats {
    pub input_rows: usize,
    pub output_rows: usize,
    pub dropped_rows: usize,
    pub imputed_rows: usize,
    pub invalid_values: usize,
    pub capped_speeds: usize,
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<LoadSummary, PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    /// Distinct locations referenced by this load.
    pub locations: usize,
    pub readings: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub extracted_rows: usize,
    pub transform: TransformStats,
    pub load: LoadSummary,
    pub raw_csv: Option<ArtifactInfo>,
    pub enriched_csv: Option<ArtifactInfo>,
}

/// Extract → Transform → Load, once, in order.
pub struct Pipeline<S, X, K> {
    pub source: S,
    pub transform: X,
    pub sink: K,
    /// Where to write the raw readings after extraction, if anywhere.
    pub raw_csv: Option<PathBuf>,
    /// Where to write the enriched readings after transformation, if anywhere.
    pub enriched_csv: Option<PathBuf>,
}

impl<S, X, K> Pipeline<S, X, K>
where
    S: Source<RawReading> + Send + Sync + 'static,
    X: Transform<RawReading, TrafficReading>,
    K: Sink<TrafficReading> + Send + Sync + 'static,
{
    pub async fn run(self) -> Result<RunReport, PipelineError> {
        let mut extracted = Vec::new();
        let mut stream = self.source.stream().await;
        while let Some(item) = stream.next().await {
            extracted.push(item?);
        }
        let extracted_rows = extracted.len();
        tracing::info!(rows = extracted_rows, "extract stage complete");

        let raw_csv = match &self.raw_csv {
            Some(path) => Some(export::write_raw_csv(path, &extracted)?),
            None => None,
        };

        let Transformed { records, stats } = self.transform.apply(extracted)?;
        if stats.output_rows + stats.dropped_rows != stats.input_rows {
            return Err(PipelineError::Transform(format!(
                "row accounting mismatch: {} in, {} out, {} dropped",
                stats.input_rows, stats.output_rows, stats.dropped_rows
            )));
        }
        tracing::info!(
            input = stats.input_rows,
            output = stats.output_rows,
            dropped = stats.dropped_rows,
            imputed = stats.imputed_rows,
            invalid_values = stats.invalid_values,
            capped_speeds = stats.capped_speeds,
            "transform stage complete"
        );

        let enriched_csv = match &self.enriched_csv {
            Some(path) => Some(export::write_enriched_csv(path, &records)?),
            None => None,
        };

        let to_load = records.len();
        let load = self
            .sink
            .run(stream::iter(records.into_iter().map(Ok::<_, PipelineError>)))
            .await?;
        if load.readings != to_load {
            return Err(PipelineError::Sink(format!(
                "loaded {} readings but {} were handed to the loader",
                load.readings, to_load
            )));
        }
        tracing::info!(
            locations = load.locations,
            readings = load.readings,
            "load stage complete"
        );

        Ok(RunReport {
            extracted_rows,
            transform: stats,
            load,
            raw_csv,
            enriched_csv,
        })
    }
}
