use std::collections::{HashMap, HashSet};

use futures::{Stream, StreamExt};
use traffic_client::domain::{NewLocation, TrafficReading};

use crate::config::{GeneratorConfig, LoaderConfig};
use crate::pipeline::{Envelope, PipelineError};

/// Locations known up front, with their attributes.
///
/// In strict mode only catalog locations may be registered by a load.
#[derive(Debug, Clone, Default)]
pub struct LocationCatalog {
    entries: HashMap<String, NewLocation>,
    strict: bool,
}

impl LocationCatalog {
    pub fn new(locations: impl IntoIterator<Item = NewLocation>, strict: bool) -> Self {
        let entries = locations.into_iter().map(|l| (l.name.clone(), l)).collect();
        Self { entries, strict }
    }

    pub fn from_config(generator: &GeneratorConfig, loader: &LoaderConfig) -> Self {
        Self::new(
            generator.locations.iter().map(|l| l.to_new_location()),
            loader.strict_locations,
        )
    }

    /// Distinct locations referenced by `readings`, in first-seen order, with
    /// catalog attributes filled in.
    pub fn plan<'a, I>(&self, readings: I) -> Result<Vec<NewLocation>, PipelineError>
    where
        I: IntoIterator<Item = &'a TrafficReading>,
    {
        let mut seen = HashSet::new();
        let mut planned = Vec::new();
        for r in readings {
            if !seen.insert(r.location.as_str()) {
                continue;
            }
            match self.entries.get(&r.location) {
                Some(known) => planned.push(known.clone()),
                None if self.strict => return Err(PipelineError::UnresolvedLocation(r.location.clone())),
                None => planned.push(NewLocation::named(r.location.clone())),
            }
        }
        Ok(planned)
    }
}

/// Location name to surrogate key, for one load.
#[derive(Debug, Default)]
pub struct LocationIndex {
    ids: HashMap<String, i64>,
}

impl LocationIndex {
    pub fn insert(&mut self, name: impl Into<String>, id: i64) {
        self.ids.insert(name.into(), id);
    }

    pub fn resolve(&self, name: &str) -> Result<i64, PipelineError> {
        self.ids
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::UnresolvedLocation(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Drain the loader input. Loads need every distinct location before the
/// first reading row, so they are not streamed through.
pub(crate) async fn collect_readings<S>(mut input: S) -> Result<Vec<Envelope<TrafficReading>>, PipelineError>
where
    S: Stream<Item = Result<Envelope<TrafficReading>, PipelineError>> + Unpin,
{
    let mut readings = Vec::new();
    while let Some(item) = input.next().await {
        match item {
            Ok(env) => readings.push(env),
            Err(e) => {
                tracing::error!(error = %e, "error in upstream pipeline, aborting load");
                return Err(e);
            }
        }
    }
    Ok(readings)
}
