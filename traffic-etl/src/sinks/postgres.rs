use std::time::Duration;

use futures::Stream;
use sqlx::{
    postgres::{PgConnection, PgPool, PgPoolOptions},
    Executor, Postgres, QueryBuilder,
};
use traffic_client::{
    db::traffic_queries,
    domain::{NewLocation, TrafficReading},
};

use crate::config::DatabaseConfig;
use crate::pipeline::{Envelope, LoadSummary, PipelineError, Sink};
use crate::sinks::locations::{collect_readings, LocationCatalog, LocationIndex};

const SCHEMA_SQL: &str = include_str!("../../sql/schema/01_traffic.sql");

/// Locations per multi-row upsert.
const LOCATION_BATCH: usize = 1000;

fn sink_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Sink(e.to_string())
}

/// Open the single connection used by the load stage.
///
/// Retries with linear backoff; exhausting the retries is a configuration
/// error, raised before anything has been written.
pub async fn connect(cfg: &DatabaseConfig) -> Result<PgPool, PipelineError> {
    let opts = cfg.connect_options()?;

    let mut attempt: u32 = 0;
    loop {
        let res = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(cfg.acquire_timeout_secs))
            .connect_with(opts.clone())
            .await;
        match res {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt < cfg.connect_retries => {
                attempt += 1;
                let sleep_for = cfg.retry_backoff() * attempt;
                tracing::warn!(
                    error = %e,
                    attempt,
                    "database connect failed, retrying with backoff"
                );
                tokio::time::sleep(sleep_for).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "database connect failed, giving up");
                return Err(PipelineError::Config(format!("database unreachable: {e}")));
            }
        }
    }
}

/// Loads enriched readings into `locations` and `traffic_data` inside one
/// transaction.
pub struct PostgresSink {
    pool: PgPool,
    catalog: LocationCatalog,
    batch_size: usize,
    truncate: bool,
}

impl PostgresSink {
    pub fn new(pool: PgPool, catalog: LocationCatalog, batch_size: usize, truncate: bool) -> Self {
        Self {
            pool,
            catalog,
            batch_size,
            truncate,
        }
    }

    async fn upsert_locations(conn: &mut PgConnection, locations: &[NewLocation]) -> Result<LocationIndex, sqlx::Error> {
        let mut index = LocationIndex::default();

        for chunk in locations.chunks(LOCATION_BATCH) {
            let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO locations (name, area, latitude, longitude) ");
            builder.push_values(chunk, |mut b, loc| {
                b.push_bind(&loc.name)
                    .push_bind(&loc.area)
                    .push_bind(loc.latitude)
                    .push_bind(loc.longitude);
            });
            // Keep existing keys; only fill in attributes that were unknown.
            builder.push(
                " ON CONFLICT (name) DO UPDATE SET \
                   area = COALESCE(EXCLUDED.area, locations.area), \
                   latitude = COALESCE(EXCLUDED.latitude, locations.latitude), \
                   longitude = COALESCE(EXCLUDED.longitude, locations.longitude) \
                 RETURNING id, name",
            );

            let rows: Vec<(i64, String)> = builder.build_query_as().fetch_all(&mut *conn).await?;
            for (id, name) in rows {
                index.insert(name, id);
            }
        }

        Ok(index)
    }

    async fn insert_batch(
        conn: &mut PgConnection,
        batch: &[Envelope<TrafficReading>],
        index: &LocationIndex,
    ) -> Result<(), PipelineError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut rows = Vec::with_capacity(batch.len());
        for env in batch {
            let r = &env.payload;
            let location_id = index.resolve(&r.location)?;
            let vehicle_count = i32::try_from(r.vehicle_count)
                .map_err(|_| PipelineError::Sink(format!("vehicle_count {} does not fit the column", r.vehicle_count)))?;
            rows.push((location_id, vehicle_count, r));
        }

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO traffic_data (location_id, \"timestamp\", vehicle_count, speed, hour_of_day, day_of_week, is_weekend, traffic_category) ",
        );
        builder.push_values(rows, |mut b, (location_id, vehicle_count, r)| {
            b.push_bind(location_id)
                .push_bind(r.ts)
                .push_bind(vehicle_count)
                .push_bind(r.speed)
                .push_bind(i16::from(r.hour_of_day))
                .push_bind(i16::from(r.day_of_week))
                .push_bind(r.is_weekend)
                .push_bind(r.traffic_category.as_str());
        });

        builder.build().execute(&mut *conn).await.map_err(sink_err)?;
        Ok(())
    }

    async fn load(&self, readings: &[Envelope<TrafficReading>]) -> Result<LoadSummary, PipelineError> {
        let plan = self.catalog.plan(readings.iter().map(|e| &e.payload))?;

        // Dropping `tx` on any early return rolls the whole load back.
        let mut tx = self.pool.begin().await.map_err(sink_err)?;

        (&mut *tx).execute(sqlx::raw_sql(SCHEMA_SQL)).await.map_err(sink_err)?;
        if self.truncate {
            sqlx::query("TRUNCATE TABLE traffic_data, locations RESTART IDENTITY")
                .execute(&mut *tx)
                .await
                .map_err(sink_err)?;
        }

        let index = Self::upsert_locations(&mut tx, &plan).await.map_err(sink_err)?;
        metrics::counter!("loader_upserted_locations_total").increment(index.len() as u64);

        let mut inserted = 0usize;
        for batch in readings.chunks(self.batch_size) {
            Self::insert_batch(&mut tx, batch, &index).await?;
            inserted += batch.len();
            tracing::debug!(inserted, total = readings.len(), "inserted reading batch");
        }

        let orphans = traffic_queries::count_orphaned_readings(&mut *tx).await.map_err(sink_err)?;
        if orphans > 0 {
            return Err(PipelineError::Sink(format!("{orphans} traffic_data rows reference missing locations")));
        }
        let total_rows = traffic_queries::count_readings(&mut *tx).await.map_err(sink_err)?;

        tx.commit().await.map_err(sink_err)?;
        tracing::info!(
            locations = index.len(),
            inserted,
            table_rows = total_rows,
            "load transaction committed"
        );

        Ok(LoadSummary {
            locations: index.len(),
            readings: inserted,
        })
    }
}

#[async_trait::async_trait]
impl Sink<TrafficReading> for PostgresSink {
    async fn run<S>(&self, input: S) -> Result<LoadSummary, PipelineError>
    where
        S: Stream<Item = Result<Envelope<TrafficReading>, PipelineError>> + Send + Unpin + 'static,
    {
        let readings = collect_readings(input).await?;

        match self.load(&readings).await {
            Ok(summary) => {
                metrics::counter!("loader_inserted_readings_total").increment(summary.readings as u64);
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(error = %e, "load failed, transaction rolled back");
                metrics::counter!("loader_errors_total").increment(1);
                Err(e)
            }
        }
    }
}
