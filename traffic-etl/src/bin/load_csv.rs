use std::path::PathBuf;

use anyhow::{bail, Result};
use traffic_etl::{
    config::{self, AppConfig},
    metrics_textfile, observability,
    runner::{self, LoadTarget},
    sources::CsvFileSource,
};

const USAGE: &str = "usage: load_csv <csv_file_path> [--dry-run] [--config <path>]";

struct Args {
    csv: PathBuf,
    dry_run: bool,
    config: Option<PathBuf>,
}

fn parse_args<I>(args: I) -> Result<Args>
where
    I: IntoIterator<Item = String>,
{
    let mut csv = None;
    let mut dry_run = false;
    let mut config = None;

    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            "--config" => match it.next() {
                Some(path) => config = Some(PathBuf::from(path)),
                None => bail!("--config needs a path\n{USAGE}"),
            },
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unexpected argument '{other}'\n{USAGE}"),
            path if csv.is_none() => csv = Some(PathBuf::from(path)),
            extra => bail!("unexpected argument '{extra}'\n{USAGE}"),
        }
    }

    let Some(csv) = csv else {
        bail!("{USAGE}");
    };
    Ok(Args { csv, dry_run, config })
}

/// Replay a raw CSV (for example the intermediate file of an earlier run)
/// through transform and load.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();
    let args = parse_args(std::env::args().skip(1))?;
    config::load_dotenv();

    let cfg = AppConfig::load(args.config.as_deref())?;
    cfg.validate()?;
    if cfg.output.metrics_textfile.is_some() {
        metrics_textfile::init()?;
    }

    let source = CsvFileSource::new(args.csv);
    let target = if args.dry_run {
        LoadTarget::DryRun
    } else {
        LoadTarget::Postgres
    };

    let result = runner::execute(source, &cfg, target, None).await;
    let json = runner::publish_outcome(result, &cfg)?;
    println!("{json}");

    Ok(())
}
