// Broker Input Generation and Loading

use std::fs;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use indexmap::IndexMap;
use log::{info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;

use crate::bg_interface::{BrokerId, Metric};
use crate::bg_location::{Location, DEG_TO_KM};

/// Center of the area random brokers are placed in.
pub const RANDOM_AREA_CENTER: Location = Location { lat: 30.0, lon: 30.0 };

/// Radius of that area, in degrees.
pub const RANDOM_AREA_RADIUS_DEG: f64 = 5.0;

const WORLD_CITIES_FIELDS: usize = 11;

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {reason}")]
    InvalidRow { line: usize, reason: String },

    #[error("requested {requested} brokers, but only {available} are available")]
    NotEnoughBrokers { requested: usize, available: usize },
}

/// Locations and metrics of every broker of a simulation.
#[derive(Debug, Clone, Default)]
pub struct BrokerInput {
    pub locations: IndexMap<BrokerId, Location>,
    pub metrics: HashMap<BrokerId, Metric>,
}

impl BrokerInput {
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

/// Where the brokers of an experiment come from. `brokers` lists the network sizes to
/// simulate; every size is drawn afresh.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSource {
    /// Brokers spread uniformly around (30°N, 30°E)
    Random {
        brokers: Vec<usize>,
        #[serde(default = "default_metric_upper_bound")]
        metric_upper_bound: Metric,
    },

    /// A random subset of the cities in a simplemaps world-cities CSV, population as metric
    WorldCities { path: PathBuf, brokers: Vec<usize> },
}

fn default_metric_upper_bound() -> Metric {
    1000
}

impl InputSource {
    pub fn broker_counts(&self) -> &[usize] {
        match self {
            InputSource::Random { brokers, .. } | InputSource::WorldCities { brokers, .. } => brokers,
        }
    }

    /// Brokers for a network of `amount` brokers.
    pub fn load<R: Rng + ?Sized>(&self, amount: usize, rng: &mut R) -> Result<BrokerInput, InputError> {
        match self {
            InputSource::Random {
                metric_upper_bound, ..
            } => {
                let locations = generate_random_broker_locations(amount, rng);
                let metrics = generate_random_broker_metrics(locations.keys(), *metric_upper_bound, rng);
                Ok(BrokerInput { locations, metrics })
            }
            InputSource::WorldCities { path, .. } => load_world_cities(path, amount, rng),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            InputSource::Random {
                brokers,
                metric_upper_bound,
            } => format!("{:?} random brokers, metrics in 0..{}", brokers, metric_upper_bound),
            InputSource::WorldCities { path, brokers } => {
                format!("{:?} brokers from {}", brokers, path.display())
            }
        }
    }
}

// ============================================================================
// Synthetic Input
// ============================================================================

/// `count` brokers named `Broker-0`, `Broker-1`, ... placed uniformly at random
/// within 5° of (30°N, 30°E).
pub fn generate_random_broker_locations<R: Rng + ?Sized>(count: usize, rng: &mut R) -> IndexMap<BrokerId, Location> {
    let radius_km = RANDOM_AREA_RADIUS_DEG * DEG_TO_KM;

    (0..count)
        .map(|i| {
            (
                BrokerId::new(format!("Broker-{}", i)),
                Location::random_in_circle(&RANDOM_AREA_CENTER, radius_km, rng),
            )
        })
        .collect()
}

/// A metric drawn uniformly from `0..upper_bound` for every id.
pub fn generate_random_broker_metrics<'a, I, R>(ids: I, upper_bound: Metric, rng: &mut R) -> HashMap<BrokerId, Metric>
where
    I: IntoIterator<Item = &'a BrokerId>,
    R: Rng + ?Sized,
{
    let upper_bound = upper_bound.max(1);
    ids.into_iter()
        .map(|id| (id.clone(), rng.gen_range(0..upper_bound)))
        .collect()
}

// ============================================================================
// World Cities
// ============================================================================

/// Load `amount` randomly chosen brokers from a world-cities CSV.
pub fn load_world_cities<R: Rng + ?Sized>(path: &Path, amount: usize, rng: &mut R) -> Result<BrokerInput, InputError> {
    let content = fs::read_to_string(path).map_err(|source| InputError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut cities = parse_world_cities(&content)?;
    info!("Read {} distinct broker locations from {}", cities.len(), path.display());

    if cities.len() < amount {
        return Err(InputError::NotEnoughBrokers {
            requested: amount,
            available: cities.len(),
        });
    }

    cities.shuffle(rng);
    cities.truncate(amount);

    let mut input = BrokerInput::default();
    for (id, location, metric) in cities {
        input.metrics.insert(id.clone(), metric);
        input.locations.insert(id, location);
    }
    Ok(input)
}

/// Parse the rows of a world-cities CSV, skipping the header line.
///
/// Fields are quoted and separated by `","`. The broker is named after the ascii city
/// name and the row id; the population becomes the metric (1 if missing). Cities
/// sharing a location with an earlier row are dropped.
fn parse_world_cities(content: &str) -> Result<Vec<(BrokerId, Location, Metric)>, InputError> {
    let mut cities = Vec::new();
    let mut seen: HashMap<(u64, u64), BrokerId> = HashMap::new();

    for (index, row) in content.lines().enumerate().skip(1) {
        let line = index + 1;
        if row.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = row.split("\",\"").collect();
        if fields.len() != WORLD_CITIES_FIELDS {
            return Err(InputError::InvalidRow {
                line,
                reason: format!("expected {} fields, found {}", WORLD_CITIES_FIELDS, fields.len()),
            });
        }

        let id = BrokerId::new(format!("{}-{}", fields[1], fields[10].replace('"', "")));
        let coordinate = |i: usize, name: &str| {
            fields[i].parse::<f64>().map_err(|e| InputError::InvalidRow {
                line,
                reason: format!("invalid {} '{}': {}", name, fields[i], e),
            })
        };
        let location = Location::new(coordinate(2, "latitude")?, coordinate(3, "longitude")?);
        let metric = fields[9].replace(".0", "").parse::<Metric>().unwrap_or(1);

        let key = (location.lat.to_bits(), location.lon.to_bits());
        if let Some(first) = seen.get(&key) {
            warn!("{} has the same location as {}, skipping it", id, first);
            continue;
        }
        seen.insert(key, id.clone());

        cities.push((id, location, metric));
    }

    Ok(cities)
}
