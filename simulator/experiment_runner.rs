// Experiment Runner - Load and execute experiment YAML files
//
// Usage:
//   cargo run --bin experiment_runner experiments/random_1000.yaml
//   cargo run --bin experiment_runner experiments/  (runs all .yaml files in directory)
//   cargo run --bin experiment_runner experiments/random_1000.yaml --seed 0x1234... --verbose

use bg_sim::{InputSource, SimulationConfig, SimulationRunner};
use log::LevelFilter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simple_logger::SimpleLogger;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;

/// Experiment file format
#[derive(Debug, serde::Deserialize)]
struct ExperimentFile {
    /// Experiment metadata
    #[serde(default)]
    meta: ExperimentMeta,

    /// Where the brokers come from
    input: InputSource,

    /// Simulation parameter overrides
    #[serde(default)]
    simulation: SimulationConfig,

    /// One simulation per threshold (ms); defaults to `simulation.latency_threshold`
    #[serde(default)]
    latency_thresholds: Vec<f64>,

    #[serde(default)]
    output: OutputConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ExperimentMeta {
    name: Option<String>,
    description: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct OutputConfig {
    enabled: bool,
    directory: PathBuf,
    prefix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("simulation-result"),
            prefix: "experiment".to_string(),
        }
    }
}

struct Options {
    path: PathBuf,
    seed: Option<[u8; 32]>,
    level: LevelFilter,
}

fn main() {
    let args: Vec<String> = env::args().collect();

    let options = parse_args(&args[1..]).unwrap_or_else(|e| {
        eprintln!("Error: {}\n", e);
        eprintln!("Usage: {} <experiment.yaml | directory/> [--seed SEED_HEX] [--verbose]", args[0]);
        eprintln!("\nExamples:");
        eprintln!("  {} experiments/random_1000.yaml", args[0]);
        eprintln!("  {} experiments/", args[0]);
        eprintln!("  {} experiments/random_1000.yaml --seed 0x123456...", args[0]);
        exit(1);
    });

    SimpleLogger::new().with_level(options.level).init().unwrap();

    let experiments = experiment_files(&options.path).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        exit(1);
    });

    if experiments.len() > 1 {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║  EXPERIMENT RUNNER - {} experiments{}║", experiments.len(), " ".repeat(22));
        println!("╚════════════════════════════════════════════════════════╝\n");
    }

    for (i, experiment_path) in experiments.iter().enumerate() {
        println!("\n[{}/{}] {}", i + 1, experiments.len(), experiment_path.display());
        run_experiment_file(experiment_path, options.seed);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let (path, flags) = args.split_first().ok_or("missing experiment file or directory")?;
    let mut options = Options {
        path: PathBuf::from(path),
        seed: None,
        level: LevelFilter::Info,
    };

    let mut flags = flags.iter();
    while let Some(flag) = flags.next() {
        match flag.as_str() {
            "--seed" => {
                let hex = flags.next().ok_or("--seed needs a hex value")?;
                options.seed = Some(parse_seed(hex)?);
            }
            "--verbose" => options.level = LevelFilter::Debug,
            other => return Err(format!("unknown argument {}", other)),
        }
    }

    Ok(options)
}

/// The file itself, or every `.yaml`/`.yml` file of a directory in name order.
fn experiment_files(path: &Path) -> Result<Vec<PathBuf>, String> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let entries = fs::read_dir(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| matches!(p.extension().and_then(|s| s.to_str()), Some("yaml" | "yml")))
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(format!("no .yaml files found in {}", path.display()));
    }
    Ok(files)
}

fn run_experiment_file(path: &Path, seed: Option<[u8; 32]>) {
    let experiment: ExperimentFile = fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|yaml| serde_yaml::from_str(&yaml).map_err(|e| e.to_string()))
        .unwrap_or_else(|e| {
            eprintln!("Failed to load {}: {}", path.display(), e);
            exit(1);
        });

    // Print experiment header
    let name = experiment
        .meta
        .name
        .clone()
        .unwrap_or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default());
    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  {}{}║", name, " ".repeat(54_usize.saturating_sub(name.chars().count())));
    println!("╚════════════════════════════════════════════════════════╝\n");

    if let Some(ref desc) = experiment.meta.description {
        println!("{}\n", desc);
    }

    // The master seed drives input generation and every run
    let master_seed = seed.unwrap_or_else(|| {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill(&mut seed);
        seed
    });
    let mut rng = StdRng::from_seed(master_seed);

    let thresholds = if experiment.latency_thresholds.is_empty() {
        vec![experiment.simulation.latency_threshold]
    } else {
        experiment.latency_thresholds.clone()
    };

    println!("Configuration:");
    println!("  Input: {}", experiment.input.describe());
    println!("  Latency thresholds: {:?} ms", thresholds);
    println!("  Merge probability: {}", experiment.simulation.merge_probability);
    println!("  Max rounds: {}", experiment.simulation.max_rounds);
    println!("\nStarting simulation...\n");

    // every network size gets its own draw of brokers
    for &amount in experiment.input.broker_counts() {
        let input = experiment.input.load(amount, &mut rng).unwrap_or_else(|e| {
            eprintln!("Failed to load {} brokers: {}", amount, e);
            exit(1);
        });

        for &threshold in &thresholds {
            let config = SimulationConfig {
                latency_threshold: threshold,
                seed: Some(rng.gen()),
                ..experiment.simulation.clone()
            };

            let result = SimulationRunner::new(config, &input.locations, &input.metrics)
                .and_then(|runner| runner.run())
                .unwrap_or_else(|e| {
                    eprintln!("Simulation of {} brokers at {} ms failed: {}", amount, threshold, e);
                    exit(1);
                });

            result.log_broadcast_groups();
            result.print_summary();

            if experiment.output.enabled {
                if let Err(e) = result.save_experiment_data(&experiment.output.directory, &experiment.output.prefix) {
                    eprintln!("{}", e);
                    exit(1);
                }
            }
        }
    }

    println!("\n✓ Experiment complete!\n");
}

/// Hex seed, optionally `0x`-prefixed. Shorter seeds are padded with zero bytes.
fn parse_seed(hex: &str) -> Result<[u8; 32], String> {
    let digits = hex.strip_prefix("0x").unwrap_or(hex);
    if digits.len() > 64 || digits.len() % 2 != 0 {
        return Err(format!("seed {} must have an even number of at most 64 hex digits", hex));
    }

    let mut seed = [0u8; 32];
    for (byte, pair) in seed.iter_mut().zip(digits.as_bytes().chunks(2)) {
        let pair = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
        *byte = u8::from_str_radix(pair, 16).map_err(|e| format!("invalid seed {}: {}", hex, e))?;
    }
    Ok(seed)
}
