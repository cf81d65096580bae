use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use time::{macros::datetime, OffsetDateTime};
use traffic_client::domain::{NewLocation, MAX_VEHICLE_COUNT};

use crate::pipeline::PipelineError;

pub const CONFIG_ENV: &str = "TRAFFIC_ETL_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "traffic-etl.toml";

/// Rows per multi-row INSERT. Eight binds per reading keeps this well under
/// the 65535 bind-parameter limit of the Postgres wire protocol.
pub const MAX_BATCH_SIZE: usize = 8000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Full connection URL. Takes precedence over the individual fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub connect_retries: u32,
    pub retry_backoff_ms: u64,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            user: None,
            password: None,
            database: None,
            connect_retries: 3,
            retry_backoff_ms: 500,
            acquire_timeout_secs: 10,
        }
    }
}

impl DatabaseConfig {
    /// Overlay connection parameters from the environment.
    ///
    /// `lookup` is `std::env::var(..).ok()` in production.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.url = Some(url);
        }
        if let Some(host) = lookup("TRAFFIC_DB_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("TRAFFIC_DB_PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(user) = lookup("TRAFFIC_DB_USER") {
            self.user = Some(user);
        }
        if let Some(password) = lookup("TRAFFIC_DB_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(database) = lookup("TRAFFIC_DB_NAME") {
            self.database = Some(database);
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions, PipelineError> {
        if let Some(url) = &self.url {
            return url
                .parse::<PgConnectOptions>()
                .map_err(|e| PipelineError::Config(format!("invalid database url: {e}")));
        }

        let user = self
            .user
            .as_deref()
            .ok_or_else(|| PipelineError::Config("database user is not set (TRAFFIC_DB_USER)".to_string()))?;
        let database = self
            .database
            .as_deref()
            .ok_or_else(|| PipelineError::Config("database name is not set (TRAFFIC_DB_NAME)".to_string()))?;

        let mut opts = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(user)
            .database(database);
        if let Some(password) = &self.password {
            opts = opts.password(password);
        }
        Ok(opts)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    pub name: String,
    pub area: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Average vehicles per interval, before the diurnal swing.
    pub base_rate: f64,
    /// Peak swing around `base_rate`.
    pub amplitude: f64,
}

impl LocationConfig {
    pub fn to_new_location(&self) -> NewLocation {
        NewLocation {
            name: self.name.clone(),
            area: self.area.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeedModel {
    pub speed_min: f64,
    pub speed_max: f64,
    /// Above this many vehicles the road slows down.
    pub congestion_count: u32,
    pub slowdown_min: f64,
    pub slowdown_max: f64,
    pub speed_floor: f64,
}

impl Default for SpeedModel {
    fn default() -> Self {
        Self {
            speed_min: 30.0,
            speed_max: 80.0,
            congestion_count: 200,
            slowdown_min: 10.0,
            slowdown_max: 40.0,
            speed_floor: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    /// Exclusive.
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub interval_minutes: u32,
    pub seed: Option<u64>,
    pub jitter: f64,
    pub missing_rate: f64,
    pub speed: SpeedModel,
    pub locations: Vec<LocationConfig>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        const AREAS: [&str; 4] = ["North", "South", "East", "West"];
        let locations = (1..=10)
            .map(|i| LocationConfig {
                name: format!("Street {i}"),
                area: Some(format!("Area {}", AREAS[(i - 1) % AREAS.len()])),
                latitude: None,
                longitude: None,
                base_rate: 125.0,
                amplitude: 100.0,
            })
            .collect();

        Self {
            start: datetime!(2023-10-01 00:00:00 UTC),
            end: datetime!(2023-10-31 00:00:00 UTC),
            interval_minutes: 60,
            seed: None,
            jitter: 0.25,
            missing_rate: 0.01,
            speed: SpeedModel::default(),
            locations,
        }
    }
}

impl GeneratorConfig {
    pub fn interval(&self) -> time::Duration {
        time::Duration::minutes(i64::from(self.interval_minutes))
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let err = |msg: String| Err(PipelineError::Config(msg));

        if self.locations.is_empty() {
            return err("generator needs at least one location".to_string());
        }
        let mut seen = HashSet::new();
        for loc in &self.locations {
            if loc.name.trim().is_empty() {
                return err("location name must not be empty".to_string());
            }
            if !seen.insert(loc.name.as_str()) {
                return err(format!("duplicate location name '{}'", loc.name));
            }
            if !(loc.base_rate >= 0.0 && loc.base_rate.is_finite()) {
                return err(format!("location '{}': base_rate must be a non-negative number", loc.name));
            }
            if !(loc.amplitude >= 0.0 && loc.amplitude.is_finite()) {
                return err(format!("location '{}': amplitude must be a non-negative number", loc.name));
            }
        }
        if self.end <= self.start {
            return err(format!(
                "date range is empty or inverted: start {} is not before end {}",
                self.start, self.end
            ));
        }
        if self.interval_minutes == 0 {
            return err("interval_minutes must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return err(format!("jitter must be in [0, 1), got {}", self.jitter));
        }
        if !(0.0..=1.0).contains(&self.missing_rate) {
            return err(format!("missing_rate must be in [0, 1], got {}", self.missing_rate));
        }

        let s = &self.speed;
        for (name, v) in [
            ("speed_min", s.speed_min),
            ("speed_max", s.speed_max),
            ("slowdown_min", s.slowdown_min),
            ("slowdown_max", s.slowdown_max),
            ("speed_floor", s.speed_floor),
        ] {
            if !v.is_finite() {
                return err(format!("speed model: {name} must be a finite number, got {v}"));
            }
        }
        if !(s.speed_min >= 0.0 && s.speed_min <= s.speed_max) {
            return err(format!("speed range [{}, {}] is invalid", s.speed_min, s.speed_max));
        }
        if !(s.slowdown_min >= 0.0 && s.slowdown_min <= s.slowdown_max) {
            return err(format!("slowdown range [{}, {}] is invalid", s.slowdown_min, s.slowdown_max));
        }
        if s.speed_floor < 0.0 {
            return err("speed_floor must be non-negative".to_string());
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingValuePolicy {
    /// Drop any reading with a missing field.
    Drop,
    /// Fill missing fields with the configured defaults.
    FillDefault,
    /// Backward-fill, then forward-fill, within each location's series.
    FillAdjacent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CategoryThresholds {
    pub high_count: u32,
    pub high_speed: f64,
    pub medium_count: u32,
    pub medium_speed: f64,
}

impl Default for CategoryThresholds {
    fn default() -> Self {
        Self {
            high_count: 300,
            high_speed: 20.0,
            medium_count: 150,
            medium_speed: 40.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub missing_policy: MissingValuePolicy,
    pub default_vehicle_count: u32,
    pub default_speed: f64,
    pub max_speed: f64,
    pub thresholds: CategoryThresholds,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            missing_policy: MissingValuePolicy::FillAdjacent,
            default_vehicle_count: 0,
            default_speed: 50.0,
            max_speed: 120.0,
            thresholds: CategoryThresholds::default(),
        }
    }
}

impl TransformConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(self.default_speed >= 0.0 && self.default_speed.is_finite()) {
            return Err(PipelineError::Config("default_speed must be a non-negative number".to_string()));
        }
        if !(self.max_speed > 0.0 && self.max_speed.is_finite()) {
            return Err(PipelineError::Config("max_speed must be a positive number".to_string()));
        }
        if self.default_vehicle_count > MAX_VEHICLE_COUNT {
            return Err(PipelineError::Config(format!(
                "default_vehicle_count must be at most {MAX_VEHICLE_COUNT}"
            )));
        }
        let t = &self.thresholds;
        if !(t.high_speed.is_finite() && t.medium_speed.is_finite()) {
            return Err(PipelineError::Config(format!(
                "thresholds: speeds must be finite, got high_speed {} and medium_speed {}",
                t.high_speed, t.medium_speed
            )));
        }
        if t.medium_count > t.high_count {
            return Err(PipelineError::Config(format!(
                "thresholds: medium_count {} exceeds high_count {}",
                t.medium_count, t.high_count
            )));
        }
        if t.high_speed > t.medium_speed {
            return Err(PipelineError::Config(format!(
                "thresholds: high_speed {} exceeds medium_speed {}",
                t.high_speed, t.medium_speed
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Empty both tables inside the load transaction before inserting.
    pub truncate: bool,
    /// Only locations named in the generator catalog may be registered.
    pub strict_locations: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            truncate: true,
            strict_locations: false,
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(PipelineError::Config(format!(
                "loader batch_size must be in 1..={MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub raw_csv: Option<PathBuf>,
    pub enriched_csv: Option<PathBuf>,
    pub report_json: Option<PathBuf>,
    /// Prometheus text-format file written at the end of the run.
    pub metrics_textfile: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            raw_csv: Some(PathBuf::from("traffic_data.csv")),
            enriched_csv: Some(PathBuf::from("traffic_data_enriched.csv")),
            report_json: None,
            metrics_textfile: None,
        }
    }
}

/// Connection parameters may live in a local `.env` file. A missing file is
/// fine; an unreadable one is reported and skipped.
pub fn load_dotenv() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            tracing::warn!(error = %e, "ignoring unreadable .env file");
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub generator: GeneratorConfig,
    pub transform: TransformConfig,
    pub loader: LoaderConfig,
    pub output: OutputConfig,
}

impl AppConfig {
    /// Load from `path`, else `$TRAFFIC_ETL_CONFIG`, else `traffic-etl.toml`.
    ///
    /// Only the implicit default path may be absent; the built-in defaults are
    /// used then. Database settings from the environment override the file.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        use std::env;

        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match env::var(CONFIG_ENV) {
                Ok(p) => (PathBuf::from(p), true),
                Err(_) => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
            },
        };

        let mut cfg = if explicit || path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            Self::default()
        };

        cfg.database.apply_env(|key| env::var(key).ok());
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Everything except database reachability, which is checked at connect time.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.generator.validate()?;
        self.transform.validate()?;
        self.loader.validate()?;
        Ok(())
    }
}
