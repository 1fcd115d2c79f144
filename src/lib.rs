//! # bg_sim - Broadcast Group Formation
//!
//! Simulates how geo-distributed brokers organize themselves into broadcast groups.
//! Each group has one leader; every member is within a latency threshold of its
//! leader, and no two leaders are within the threshold of each other.
//!
//! ## Core Components
//!
//! - **Broker**: per-broker state and the seven-phase merge protocol
//! - **SimulationRunner**: drives all brokers round by round until the grouping is valid
//! - **PostOffice / Mailbox**: non-blocking message delivery between brokers
//! - **Input**: random brokers or cities from a world-cities CSV
//! - **SimulationResult**: final groups, join counters and CSV/YAML export
//!
//! ```no_run
//! use bg_sim::{generate_random_broker_locations, generate_random_broker_metrics};
//! use bg_sim::{SimulationConfig, SimulationRunner};
//! use rand::SeedableRng;
//!
//! let mut rng = rand::rngs::StdRng::seed_from_u64(1);
//! let locations = generate_random_broker_locations(100, &mut rng);
//! let metrics = generate_random_broker_metrics(locations.keys(), 1000, &mut rng);
//!
//! let config = SimulationConfig { latency_threshold: 10.0, ..Default::default() };
//! let result = SimulationRunner::new(config, &locations, &metrics)?.run()?;
//! result.print_summary();
//! # Ok::<(), bg_sim::SimulationError>(())
//! ```

// Protocol
pub mod bg_broker;
pub mod bg_interface;
pub mod bg_mailbox;

// Simulation
pub mod bg_error;
pub mod bg_input;
pub mod bg_location;
pub mod bg_result;
pub mod bg_simulation;

// Re-export commonly used types
pub use bg_error::{ExportError, ProtocolError, SimulationError};
pub use bg_input::{
    generate_random_broker_locations, generate_random_broker_metrics, load_world_cities, BrokerInput,
    InputError, InputSource,
};
pub use bg_interface::{BrokerId, BrokerMessage, JoinType, LatencyMs, MergeReplyCode, Metric, MS_PER_KM};
pub use bg_location::Location;
pub use bg_result::{BrokerSnapshot, RoundStats, SimulationResult};
pub use bg_simulation::{SimulationConfig, SimulationRunner};
