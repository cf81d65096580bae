use std::pin::Pin;

use futures::Stream;
use rand::{rngs::StdRng, Rng, SeedableRng};
use time::OffsetDateTime;
use traffic_client::domain::RawReading;

use crate::config::{GeneratorConfig, LocationConfig};
use crate::pipeline::{Envelope, PipelineError, Source};

/// Share of `amplitude` added to `base_rate` for a given hour of day.
///
/// Peaks at the morning (07-09) and evening (16-18) rush, dips overnight.
pub fn diurnal_factor(hour: u8) -> f64 {
    match hour {
        0..=5 => -0.5,
        6 => 0.0,
        7..=9 => 1.0,
        10..=15 => 0.2,
        16..=18 => 1.0,
        19..=21 => 0.0,
        _ => -0.3,
    }
}

/// Synthetic traffic readings for every configured location at fixed
/// intervals over `[start, end)`.
pub struct SyntheticTrafficSource {
    cfg: GeneratorConfig,
}

impl SyntheticTrafficSource {
    /// Fails fast on an invalid configuration, before anything is generated.
    pub fn new(cfg: GeneratorConfig) -> Result<Self, PipelineError> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn expected_rows(&self) -> usize {
        let span = (self.cfg.end - self.cfg.start).whole_minutes();
        let step = i64::from(self.cfg.interval_minutes);
        let steps = (span + step - 1) / step;
        steps as usize * self.cfg.locations.len()
    }

    pub fn series(&self) -> SyntheticSeries {
        let rng = match self.cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        SyntheticSeries {
            cfg: self.cfg.clone(),
            rng,
            ts: self.cfg.start,
            loc_idx: 0,
        }
    }
}

/// Iterator over generated readings, time-major then in location order.
pub struct SyntheticSeries {
    cfg: GeneratorConfig,
    rng: StdRng,
    ts: OffsetDateTime,
    loc_idx: usize,
}

impl SyntheticSeries {
    fn reading(&mut self, loc: &LocationConfig, ts: OffsetDateTime) -> RawReading {
        let jitter = self.cfg.jitter;
        let expected = loc.base_rate + loc.amplitude * diurnal_factor(ts.hour());
        let noise = self.rng.gen_range(1.0 - jitter..=1.0 + jitter);
        let count = (expected * noise).round().max(0.0) as i64;

        let model = &self.cfg.speed;
        let mut speed = self.rng.gen_range(model.speed_min..=model.speed_max);
        if count > i64::from(model.congestion_count) {
            let slowdown = self.rng.gen_range(model.slowdown_min..=model.slowdown_max);
            speed = (speed - slowdown).max(model.speed_floor);
        }

        let drop_count = self.rng.gen_bool(self.cfg.missing_rate);
        let drop_speed = self.rng.gen_bool(self.cfg.missing_rate);

        RawReading {
            ts,
            location: loc.name.clone(),
            vehicle_count: (!drop_count).then_some(count),
            speed: (!drop_speed).then_some(speed),
        }
    }
}

impl Iterator for SyntheticSeries {
    type Item = RawReading;

    fn next(&mut self) -> Option<RawReading> {
        if self.ts >= self.cfg.end {
            return None;
        }

        let loc = self.cfg.locations[self.loc_idx].clone();
        let ts = self.ts;
        let reading = self.reading(&loc, ts);

        self.loc_idx += 1;
        if self.loc_idx == self.cfg.locations.len() {
            self.loc_idx = 0;
            self.ts += self.cfg.interval();
        }

        Some(reading)
    }
}

#[async_trait::async_trait]
impl Source<RawReading> for SyntheticTrafficSource {
    async fn stream(
        &self,
    ) -> Pin<Box<dyn Stream<Item = Result<Envelope<RawReading>, PipelineError>> + Send>> {
        tracing::info!(
            locations = self.cfg.locations.len(),
            start = %self.cfg.start,
            end = %self.cfg.end,
            interval_minutes = self.cfg.interval_minutes,
            expected_rows = self.expected_rows(),
            "generating synthetic traffic data"
        );

        let series = self.series();
        let s = async_stream::stream! {
            for reading in series {
                metrics::counter!("generator_readings_total").increment(1);
                yield Ok::<_, PipelineError>(Envelope::now(reading));
            }
        };

        Box::pin(s)
    }
}
