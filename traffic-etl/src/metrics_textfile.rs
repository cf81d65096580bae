use std::{fs, path::Path};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::pipeline::PipelineError;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Later calls are no-ops.
pub fn init() -> Result<(), PipelineError> {
    PROM_HANDLE
        .get_or_try_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| PipelineError::Config(format!("failed to install Prometheus metrics recorder: {e}")))
        })
        .map(|_| ())
}

/// Render all metrics in Prometheus text format to `path`, for a node
/// exporter textfile collector. Written to a sibling temp file and renamed so
/// a scrape never sees a partial file.
pub fn write(path: &Path) -> Result<(), PipelineError> {
    let handle = PROM_HANDLE
        .get()
        .ok_or_else(|| PipelineError::Config("Prometheus recorder not initialized".to_string()))?;

    let tmp = path.with_extension("prom.tmp");
    fs::write(&tmp, handle.render())
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|e| PipelineError::Sink(format!("failed to write metrics file {}: {e}", path.display())))?;

    tracing::info!(path = %path.display(), "wrote metrics textfile");
    Ok(())
}
