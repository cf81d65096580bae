pub mod config;
pub mod export;
pub mod metrics_textfile;
pub mod observability;
pub mod pipeline;
pub mod runner;
pub mod sinks;
pub mod sources;
pub mod transform;

pub use pipeline::{Envelope, Pipeline, PipelineError, RunReport};
