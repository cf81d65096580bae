use std::sync::{Arc, Mutex, MutexGuard};

use futures::Stream;
use traffic_client::domain::{Location, TrafficDataRow, TrafficReading};

use crate::pipeline::{Envelope, LoadSummary, PipelineError, Sink};
use crate::sinks::locations::{collect_readings, LocationCatalog, LocationIndex};

/// The two tables, held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub locations: Vec<Location>,
    pub readings: Vec<TrafficDataRow>,
}

impl MemoryStore {
    pub fn orphaned_readings(&self) -> usize {
        self.readings
            .iter()
            .filter(|r| !self.locations.iter().any(|l| l.id == r.location_id))
            .count()
    }

    pub fn location(&self, name: &str) -> Option<&Location> {
        self.locations.iter().find(|l| l.name == name)
    }
}

/// Handle on a sink's store that outlives the sink itself.
#[derive(Debug, Clone, Default)]
pub struct SharedStore(Arc<Mutex<MemoryStore>>);

impl SharedStore {
    fn lock(&self) -> MutexGuard<'_, MemoryStore> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> MemoryStore {
        self.lock().clone()
    }
}

/// In-process loader with the same semantics as the Postgres one. A failed
/// load leaves the store untouched.
pub struct MemorySink {
    catalog: LocationCatalog,
    truncate: bool,
    store: SharedStore,
}

impl MemorySink {
    pub fn new(catalog: LocationCatalog, truncate: bool) -> Self {
        Self {
            catalog,
            truncate,
            store: SharedStore::default(),
        }
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    pub fn snapshot(&self) -> MemoryStore {
        self.store.snapshot()
    }

    fn load(&self, readings: &[Envelope<TrafficReading>]) -> Result<LoadSummary, PipelineError> {
        let plan = self.catalog.plan(readings.iter().map(|e| &e.payload))?;

        let mut store = self.store.lock();
        let mut next = if self.truncate {
            MemoryStore::default()
        } else {
            store.clone()
        };

        let mut index = LocationIndex::default();
        let mut next_location_id = next.locations.iter().map(|l| l.id).max().unwrap_or(0) + 1;
        for loc in plan {
            let existing = next.location(&loc.name).map(|l| l.id);
            let id = match existing {
                Some(id) => id,
                None => {
                    let id = next_location_id;
                    next_location_id += 1;
                    next.locations.push(loc.clone().with_id(id));
                    id
                }
            };
            index.insert(loc.name, id);
        }

        let mut next_reading_id = next.readings.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        for env in readings {
            let location_id = index.resolve(&env.payload.location)?;
            let row = TrafficDataRow::from_reading(next_reading_id, location_id, &env.payload).map_err(|_| {
                PipelineError::Sink(format!(
                    "vehicle_count {} does not fit the column",
                    env.payload.vehicle_count
                ))
            })?;
            next.readings.push(row);
            next_reading_id += 1;
        }

        let orphans = next.orphaned_readings();
        if orphans > 0 {
            return Err(PipelineError::Sink(format!("{orphans} readings reference missing locations")));
        }

        *store = next;
        Ok(LoadSummary {
            locations: index.len(),
            readings: readings.len(),
        })
    }
}

#[async_trait::async_trait]
impl Sink<TrafficReading> for MemorySink {
    async fn run<S>(&self, input: S) -> Result<LoadSummary, PipelineError>
    where
        S: Stream<Item = Result<Envelope<TrafficReading>, PipelineError>> + Send + Unpin + 'static,
    {
        let readings = collect_readings(input).await?;
        let summary = self.load(&readings).inspect_err(|e| {
            tracing::error!(error = %e, "load failed, memory store left unchanged");
            metrics::counter!("loader_errors_total").increment(1);
        })?;
        metrics::counter!("loader_inserted_readings_total").increment(summary.readings as u64);
        tracing::info!(
            locations = summary.locations,
            readings = summary.readings,
            "loaded readings into memory store"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use time::macros::datetime;
    use traffic_client::domain::{NewLocation, TrafficCategory};

    fn env(location: &str, hour: i64) -> Result<Envelope<TrafficReading>, PipelineError> {
        Ok(Envelope::now(TrafficReading {
            ts: datetime!(2023-10-02 00:00:00 UTC) + time::Duration::hours(hour),
            location: location.to_string(),
            vehicle_count: 100,
            speed: 50.0,
            hour_of_day: hour as u8,
            day_of_week: 0,
            is_weekend: false,
            traffic_category: TrafficCategory::Low,
        }))
    }

    #[tokio::test]
    async fn assigns_keys_and_keeps_references() {
        let sink = MemorySink::new(LocationCatalog::default(), true);
        let input = stream::iter(vec![env("A", 0), env("B", 0), env("A", 1)]);

        let summary = sink.run(input).await.unwrap();
        assert_eq!(summary, LoadSummary { locations: 2, readings: 3 });

        let store = sink.snapshot();
        assert_eq!(store.locations.len(), 2);
        assert_eq!(store.readings.len(), 3);
        assert_eq!(store.orphaned_readings(), 0);
        let a = store.location("A").unwrap().id;
        assert_eq!(store.readings[2].location_id, a);
    }

    #[tokio::test]
    async fn truncate_replaces_previous_load() {
        let sink = MemorySink::new(LocationCatalog::default(), true);
        sink.run(stream::iter(vec![env("A", 0), env("B", 0)])).await.unwrap();
        sink.run(stream::iter(vec![env("C", 0)])).await.unwrap();

        let store = sink.snapshot();
        assert_eq!(store.locations.len(), 1);
        assert_eq!(store.locations[0].id, 1);
        assert_eq!(store.readings.len(), 1);
    }

    #[tokio::test]
    async fn append_reuses_existing_locations() {
        let sink = MemorySink::new(LocationCatalog::default(), false);
        sink.run(stream::iter(vec![env("A", 0)])).await.unwrap();
        sink.run(stream::iter(vec![env("A", 1), env("B", 1)])).await.unwrap();

        let store = sink.snapshot();
        assert_eq!(store.locations.len(), 2);
        assert_eq!(store.readings.len(), 3);
        assert_eq!(store.readings[1].location_id, store.readings[0].location_id);
        assert_eq!(store.readings[2].id, 3);
    }

    #[tokio::test]
    async fn unknown_location_in_strict_mode_writes_nothing() {
        let catalog = LocationCatalog::new(vec![NewLocation::named("A")], true);
        let sink = MemorySink::new(catalog, true);

        let err = sink
            .run(stream::iter(vec![env("A", 0), env("Z", 0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnresolvedLocation(_)));
        let store = sink.snapshot();
        assert!(store.locations.is_empty());
        assert!(store.readings.is_empty());
    }

    #[tokio::test]
    async fn count_beyond_the_column_fails_like_the_database() {
        let sink = MemorySink::new(LocationCatalog::default(), true);
        let mut oversized = env("A", 1).unwrap();
        oversized.payload.vehicle_count = 3_000_000_000;

        let err = sink
            .run(stream::iter(vec![env("A", 0), Ok(oversized)]))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Sink(_)));
        assert!(sink.snapshot().readings.is_empty());
    }

    #[tokio::test]
    async fn upstream_error_aborts_the_load() {
        let sink = MemorySink::new(LocationCatalog::default(), true);
        let input = stream::iter(vec![
            env("A", 0),
            Err(PipelineError::Transform("boom".to_string())),
        ]);

        assert!(sink.run(input).await.is_err());
        assert!(sink.snapshot().readings.is_empty());
    }
}
