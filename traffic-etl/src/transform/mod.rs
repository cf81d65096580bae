pub mod clean;
pub mod enrich;

use traffic_client::domain::{RawReading, TrafficReading};

use crate::config::TransformConfig;
use crate::pipeline::{Envelope, PipelineError, Transform, TransformStats, Transformed};

pub use clean::{clean, validate_reading, CleanReading};
pub use enrich::{categorize, enrich, time_features, TimeFeatures};

/// Cleans raw readings and derives their time features and category.
#[derive(Debug, Clone)]
pub struct TrafficTransformer {
    cfg: TransformConfig,
}

impl TrafficTransformer {
    pub fn new(cfg: TransformConfig) -> Result<Self, PipelineError> {
        cfg.validate()?;
        Ok(Self { cfg })
    }
}

impl Transform<RawReading, TrafficReading> for TrafficTransformer {
    fn apply(&self, input: Vec<Envelope<RawReading>>) -> Result<Transformed<TrafficReading>, PipelineError> {
        let input_rows = input.len();
        let outcome = clean(input, &self.cfg);

        let thresholds = &self.cfg.thresholds;
        let records: Vec<Envelope<TrafficReading>> = outcome
            .readings
            .into_iter()
            .map(|env| env.map(|r| enrich(r, thresholds)))
            .collect();

        let stats = TransformStats {
            input_rows,
            output_rows: records.len(),
            dropped_rows: outcome.dropped,
            imputed_rows: outcome.imputed,
            invalid_values: outcome.invalid_values,
            capped_speeds: outcome.capped_speeds,
        };

        metrics::counter!("transform_dropped_rows_total").increment(stats.dropped_rows as u64);
        metrics::counter!("transform_imputed_rows_total").increment(stats.imputed_rows as u64);
        metrics::counter!("transform_invalid_values_total").increment(stats.invalid_values as u64);
        metrics::counter!("transform_capped_speeds_total").increment(stats.capped_speeds as u64);
        if stats.dropped_rows > 0 {
            tracing::warn!(
                dropped = stats.dropped_rows,
                policy = ?self.cfg.missing_policy,
                "readings dropped during cleaning"
            );
        }

        Ok(Transformed { records, stats })
    }
}
