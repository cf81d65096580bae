use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "warn,traffic_etl=info,traffic_client=info";

/// `RUST_LOG` when set, otherwise info for this workspace and warn elsewhere.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
