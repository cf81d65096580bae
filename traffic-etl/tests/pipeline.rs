use std::collections::HashSet;

use time::macros::datetime;
use traffic_client::domain::{NewLocation, TrafficCategory};
use traffic_etl::{
    config::{GeneratorConfig, LocationConfig, MissingValuePolicy, TransformConfig},
    pipeline::{Pipeline, PipelineError},
    sinks::{LocationCatalog, MemorySink},
    sources::{CsvFileSource, SyntheticTrafficSource},
    transform::{categorize, TrafficTransformer},
};

fn location(name: &str, area: &str, base_rate: f64, amplitude: f64) -> LocationConfig {
    LocationConfig {
        name: name.to_string(),
        area: Some(area.to_string()),
        latitude: None,
        longitude: None,
        base_rate,
        amplitude,
    }
}

fn two_locations_thirty_days() -> GeneratorConfig {
    GeneratorConfig {
        start: datetime!(2023-10-01 00:00:00 UTC),
        end: datetime!(2023-10-31 00:00:00 UTC),
        interval_minutes: 60,
        seed: Some(2023),
        missing_rate: 0.0,
        locations: vec![
            location("Main St", "Area North", 160.0, 140.0),
            location("Harbor Rd", "Area West", 90.0, 60.0),
        ],
        ..GeneratorConfig::default()
    }
}

fn catalog(gen: &GeneratorConfig, strict: bool) -> LocationCatalog {
    LocationCatalog::new(gen.locations.iter().map(|l| l.to_new_location()), strict)
}

#[tokio::test]
async fn two_locations_thirty_days_end_to_end() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let gen = two_locations_thirty_days();
    let sink = MemorySink::new(catalog(&gen, false), true);
    let store = sink.store();

    let pipeline = Pipeline {
        source: SyntheticTrafficSource::new(gen)?,
        transform: TrafficTransformer::new(TransformConfig::default())?,
        sink,
        raw_csv: Some(dir.path().join("raw.csv")),
        enriched_csv: Some(dir.path().join("enriched.csv")),
    };
    let report = pipeline.run().await?;

    assert_eq!(report.extracted_rows, 1440);
    assert_eq!(report.transform.output_rows, 1440);
    assert_eq!(report.transform.dropped_rows, 0);
    assert_eq!(report.transform.imputed_rows, 0);
    assert_eq!(report.load.locations, 2);
    assert_eq!(report.load.readings, 1440);
    assert_eq!(report.raw_csv.as_ref().map(|a| a.rows), Some(1440));
    assert_eq!(report.enriched_csv.as_ref().map(|a| a.rows), Some(1440));

    let snapshot = store.snapshot();
    assert_eq!(snapshot.locations.len(), 2);
    assert_eq!(snapshot.readings.len(), 1440);
    assert_eq!(snapshot.orphaned_readings(), 0);

    let ids: HashSet<i64> = snapshot.locations.iter().map(|l| l.id).collect();
    assert!(snapshot.readings.iter().all(|r| ids.contains(&r.location_id)));

    let main = snapshot.location("Main St").expect("Main St registered");
    assert_eq!(main.area.as_deref(), Some("Area North"));

    let thresholds = TransformConfig::default().thresholds;
    for row in &snapshot.readings {
        assert!(row.vehicle_count >= 0);
        assert!(row.speed >= 0.0);
        assert_eq!(i64::from(row.hour_of_day), i64::from(row.ts.hour()));
        assert_eq!(row.day_of_week as u8, row.ts.weekday().number_days_from_monday());
        assert_eq!(row.is_weekend, row.day_of_week >= 5);
        assert_eq!(
            row.category()?,
            categorize(row.vehicle_count as u32, row.speed, &thresholds)
        );
    }

    // Rush hour at the busy location reaches the congested bands.
    assert!(snapshot
        .readings
        .iter()
        .any(|r| r.location_id == main.id && r.category().ok() != Some(TrafficCategory::Low)));

    Ok(())
}

#[tokio::test]
async fn dropped_rows_are_accounted_for() -> anyhow::Result<()> {
    let gen = GeneratorConfig {
        missing_rate: 0.2,
        ..two_locations_thirty_days()
    };
    let sink = MemorySink::new(catalog(&gen, false), true);
    let store = sink.store();

    let report = Pipeline {
        source: SyntheticTrafficSource::new(gen)?,
        transform: TrafficTransformer::new(TransformConfig {
            missing_policy: MissingValuePolicy::Drop,
            ..TransformConfig::default()
        })?,
        sink,
        raw_csv: None,
        enriched_csv: None,
    }
    .run()
    .await?;

    let t = &report.transform;
    assert_eq!(t.input_rows, 1440);
    assert!(t.dropped_rows > 0);
    assert_eq!(t.output_rows, t.input_rows - t.dropped_rows);
    assert_eq!(report.load.readings, t.output_rows);
    assert_eq!(store.snapshot().readings.len(), t.output_rows);
    Ok(())
}

#[tokio::test]
async fn imputation_keeps_every_row() -> anyhow::Result<()> {
    let gen = GeneratorConfig {
        missing_rate: 0.05,
        ..two_locations_thirty_days()
    };

    let report = Pipeline {
        source: SyntheticTrafficSource::new(gen.clone())?,
        transform: TrafficTransformer::new(TransformConfig::default())?,
        sink: MemorySink::new(catalog(&gen, false), true),
        raw_csv: None,
        enriched_csv: None,
    }
    .run()
    .await?;

    assert_eq!(report.transform.dropped_rows, 0);
    assert!(report.transform.imputed_rows > 0);
    assert_eq!(report.load.readings, 1440);
    Ok(())
}

#[tokio::test]
async fn intermediate_csv_replays_to_the_same_load() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let raw = dir.path().join("traffic_data.csv");
    let gen = GeneratorConfig {
        missing_rate: 0.02,
        end: datetime!(2023-10-08 00:00:00 UTC),
        ..two_locations_thirty_days()
    };

    let first_sink = MemorySink::new(catalog(&gen, false), true);
    let first_store = first_sink.store();
    let first = Pipeline {
        source: SyntheticTrafficSource::new(gen.clone())?,
        transform: TrafficTransformer::new(TransformConfig::default())?,
        sink: first_sink,
        raw_csv: Some(raw.clone()),
        enriched_csv: None,
    }
    .run()
    .await?;

    let replay_sink = MemorySink::new(catalog(&gen, false), true);
    let replay_store = replay_sink.store();
    let replay = Pipeline {
        source: CsvFileSource::new(&raw),
        transform: TrafficTransformer::new(TransformConfig::default())?,
        sink: replay_sink,
        raw_csv: None,
        enriched_csv: None,
    }
    .run()
    .await?;

    assert_eq!(first.transform, replay.transform);
    assert_eq!(first_store.snapshot().readings, replay_store.snapshot().readings);
    Ok(())
}

#[tokio::test]
async fn strict_catalog_rejects_unknown_locations() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let gen = two_locations_thirty_days();
    let only_main = LocationCatalog::new(vec![NewLocation::named("Main St")], true);
    let sink = MemorySink::new(only_main, true);
    let store = sink.store();

    let err = Pipeline {
        source: SyntheticTrafficSource::new(gen)?,
        transform: TrafficTransformer::new(TransformConfig::default())?,
        sink,
        raw_csv: None,
        enriched_csv: Some(dir.path().join("enriched.csv")),
    }
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, PipelineError::UnresolvedLocation(ref name) if name == "Harbor Rd"));
    assert!(store.snapshot().readings.is_empty());
    assert!(store.snapshot().locations.is_empty());
    Ok(())
}

#[test]
fn invalid_generator_config_fails_before_anything_runs() {
    let gen = GeneratorConfig {
        start: datetime!(2023-10-31 00:00:00 UTC),
        end: datetime!(2023-10-01 00:00:00 UTC),
        ..two_locations_thirty_days()
    };
    assert!(matches!(
        SyntheticTrafficSource::new(gen),
        Err(PipelineError::Config(_))
    ));
}
