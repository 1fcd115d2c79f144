// Default experiment: 1000 random brokers, evaluated at several latency thresholds.
//
// Results are written to ./simulation-result/.

use std::path::Path;

use bg_sim::{
    generate_random_broker_locations, generate_random_broker_metrics, SimulationConfig, SimulationRunner,
};
use log::{error, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simple_logger::SimpleLogger;

const BROKERS: usize = 1000;
const METRIC_UPPER_BOUND: i32 = 1000;
const LATENCY_THRESHOLDS: [f64; 5] = [10.0, 50.0, 100.0, 150.0, 200.0];
const OUTPUT_DIR: &str = "simulation-result";

fn main() {
    SimpleLogger::new().with_level(log::LevelFilter::Info).init().unwrap();

    info!("starting");

    let mut seed = [0u8; 32];
    rand::thread_rng().fill(&mut seed);
    let mut rng = StdRng::from_seed(seed);

    let locations = generate_random_broker_locations(BROKERS, &mut rng);
    let metrics = generate_random_broker_metrics(locations.keys(), METRIC_UPPER_BOUND, &mut rng);

    for threshold in LATENCY_THRESHOLDS {
        let config = SimulationConfig {
            latency_threshold: threshold,
            seed: Some(rng.gen()),
            ..Default::default()
        };

        let result = SimulationRunner::new(config, &locations, &metrics).and_then(|runner| runner.run());
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                error!("Simulation at {} ms failed: {}", threshold, e);
                std::process::exit(1);
            }
        };

        result.log_broadcast_groups();
        result.print_summary();

        if let Err(e) = result.save_experiment_data(Path::new(OUTPUT_DIR), "random") {
            error!("{}", e);
            std::process::exit(1);
        }
    }

    info!("done");
}
