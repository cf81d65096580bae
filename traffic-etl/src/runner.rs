use std::{fs, path::PathBuf};

use anyhow::Context;
use traffic_client::domain::RawReading;

use crate::config::AppConfig;
use crate::metrics_textfile;
use crate::pipeline::{Pipeline, PipelineError, RunReport, Source};
use crate::sinks::{postgres, LocationCatalog, MemorySink, PostgresSink};
use crate::transform::TrafficTransformer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadTarget {
    Postgres,
    /// Load into an in-memory store instead of the database.
    DryRun,
}

/// Run `source` through transform and load as configured.
///
/// For Postgres the connection is opened before extraction, so an unreachable
/// database aborts the run before any file or row is written, and it is
/// closed again whatever the outcome.
pub async fn execute<S>(
    source: S,
    cfg: &AppConfig,
    target: LoadTarget,
    raw_csv: Option<PathBuf>,
) -> Result<RunReport, PipelineError>
where
    S: Source<RawReading> + Send + Sync + 'static,
{
    let transform = TrafficTransformer::new(cfg.transform.clone())?;
    let catalog = LocationCatalog::from_config(&cfg.generator, &cfg.loader);
    let enriched_csv = cfg.output.enriched_csv.clone();

    match target {
        LoadTarget::DryRun => {
            let sink = MemorySink::new(catalog, cfg.loader.truncate);
            Pipeline {
                source,
                transform,
                sink,
                raw_csv,
                enriched_csv,
            }
            .run()
            .await
        }
        LoadTarget::Postgres => {
            let pool = postgres::connect(&cfg.database).await?;
            let sink = PostgresSink::new(pool.clone(), catalog, cfg.loader.batch_size, cfg.loader.truncate);
            let result = Pipeline {
                source,
                transform,
                sink,
                raw_csv,
                enriched_csv,
            }
            .run()
            .await;
            pool.close().await;
            tracing::debug!("database connection closed");
            result
        }
    }
}

/// Publish what a run produced. A failed run still renders the metrics
/// textfile, so error counters reach the collector; the error is returned.
pub fn publish_outcome(result: Result<RunReport, PipelineError>, cfg: &AppConfig) -> anyhow::Result<String> {
    match result {
        Ok(report) => publish_report(&report, cfg),
        Err(e) => {
            metrics::counter!("etl_failed_runs_total").increment(1);
            if let Some(path) = &cfg.output.metrics_textfile {
                if let Err(write_err) = metrics_textfile::write(path) {
                    tracing::warn!(error = %write_err, "could not write metrics textfile for failed run");
                }
            }
            Err(e.into())
        }
    }
}

/// Emit the run report (JSON) and the metrics textfile, if configured.
/// Returns the rendered report.
pub fn publish_report(report: &RunReport, cfg: &AppConfig) -> anyhow::Result<String> {
    metrics::gauge!("etl_last_run_loaded_readings").set(report.load.readings as f64);
    metrics::gauge!("etl_last_run_dropped_rows").set(report.transform.dropped_rows as f64);

    let json = serde_json::to_string_pretty(report)?;
    if let Some(path) = &cfg.output.report_json {
        fs::write(path, &json).with_context(|| format!("failed to write run report {}", path.display()))?;
    }
    if let Some(path) = &cfg.output.metrics_textfile {
        metrics_textfile::write(path)?;
    }
    Ok(json)
}
