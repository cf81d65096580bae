use anyhow::Result;
use sqlx::PgExecutor;

use crate::domain::{Location, TrafficDataRow};

pub async fn count_locations<'e, E>(executor: E) -> Result<i64>
where
    E: PgExecutor<'e>,
{
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM locations")
        .fetch_one(executor)
        .await?;
    Ok(n)
}

pub async fn count_readings<'e, E>(executor: E) -> Result<i64>
where
    E: PgExecutor<'e>,
{
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM traffic_data")
        .fetch_one(executor)
        .await?;
    Ok(n)
}

/// Number of `traffic_data` rows whose `location_id` has no matching location.
///
/// Zero after every successful load.
pub async fn count_orphaned_readings<'e, E>(executor: E) -> Result<i64>
where
    E: PgExecutor<'e>,
{
    let n: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM traffic_data td
        LEFT JOIN locations l ON l.id = td.location_id
        WHERE l.id IS NULL
        "#,
    )
    .fetch_one(executor)
    .await?;
    Ok(n)
}

pub async fn list_locations<'e, E>(executor: E) -> Result<Vec<Location>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, Location>(
        r#"
        SELECT id, name, area, latitude, longitude
        FROM locations
        ORDER BY id
        "#,
    )
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Time-ordered readings for one location, as stored.
pub async fn readings_for_location<'e, E>(executor: E, location_id: i64) -> Result<Vec<TrafficDataRow>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, TrafficDataRow>(
        r#"
        SELECT
            id,
            location_id,
            "timestamp",
            vehicle_count,
            speed,
            hour_of_day,
            day_of_week,
            is_weekend,
            traffic_category
        FROM traffic_data
        WHERE location_id = $1
        ORDER BY "timestamp", id
        "#,
    )
    .bind(location_id)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}
