use std::path::PathBuf;

use anyhow::{bail, Result};
use traffic_etl::{
    config::{self, AppConfig},
    metrics_textfile, observability,
    runner::{self, LoadTarget},
    sources::SyntheticTrafficSource,
};

const USAGE: &str = "usage: traffic-etl [--dry-run] [--config <path>]";

struct Args {
    dry_run: bool,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        dry_run: false,
        config: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--dry-run" => args.dry_run = true,
            "--config" => match it.next() {
                Some(path) => args.config = Some(PathBuf::from(path)),
                None => bail!("--config needs a path\n{USAGE}"),
            },
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => bail!("unexpected argument '{other}'\n{USAGE}"),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();
    let args = parse_args()?;

    config::load_dotenv();

    let cfg = AppConfig::load(args.config.as_deref())?;
    cfg.validate()?;
    if cfg.output.metrics_textfile.is_some() {
        metrics_textfile::init()?;
    }

    let source = SyntheticTrafficSource::new(cfg.generator.clone())?;
    let target = if args.dry_run {
        LoadTarget::DryRun
    } else {
        LoadTarget::Postgres
    };

    let result = runner::execute(source, &cfg, target, cfg.output.raw_csv.clone()).await;
    let json = runner::publish_outcome(result, &cfg)?;
    println!("{json}");

    Ok(())
}
