// Simulation Result and Experiment Export

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::Serialize;

use crate::bg_error::ExportError;
use crate::bg_interface::{BrokerId, LatencyMs, Metric};
use crate::bg_location::Location;

// ============================================================================
// Broker Snapshot
// ============================================================================

/// Final state of a single broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerSnapshot {
    pub id: BrokerId,
    pub location: Location,
    pub metric: Metric,
    pub leader_id: BrokerId,
    /// Sorted; empty unless the broker is a leader
    pub members: Vec<BrokerId>,
}

impl BrokerSnapshot {
    pub fn is_leader(&self) -> bool {
        self.leader_id == self.id
    }
}

// ============================================================================
// Round Statistics
// ============================================================================

/// Counters for one executed round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoundStats {
    /// Round number, starting at 1
    pub round: usize,

    /// Leaders at the start of the round
    pub leaders: usize,

    pub leader_joins: usize,
    pub member_joins: usize,
    pub member_notifications: usize,
}

// ============================================================================
// Simulation Result
// ============================================================================

/// Complete simulation result
#[derive(Debug, Clone)]
pub struct SimulationResult {
    /// Final broker states, in input order
    pub brokers: Vec<BrokerSnapshot>,

    pub latency_threshold: LatencyMs,

    /// Rounds executed until the state was valid
    pub rounds: usize,

    /// Leaders that gave up their group and joined another leader
    pub leader_joins: usize,

    /// Members that followed their leader to a new leader
    pub member_joins: usize,

    /// MergeInfo messages sent to members
    pub member_notifications: usize,

    /// Random seed used
    pub seed_used: [u8; 32],

    pub round_history: Vec<RoundStats>,
}

/// Contents of the `-info.yaml` file written next to the broker CSV.
#[derive(Serialize)]
struct ExperimentInfo<'a> {
    latency_threshold: LatencyMs,
    brokers: usize,
    leaders: usize,
    members: usize,
    rounds: usize,
    leader_joins: usize,
    member_joins: usize,
    member_notifications: usize,
    seed: String,
    round_history: &'a [RoundStats],
}

impl SimulationResult {
    pub fn number_of_brokers(&self) -> usize {
        self.brokers.len()
    }

    pub fn number_of_leaders(&self) -> usize {
        self.brokers.iter().filter(|b| b.is_leader()).count()
    }

    pub fn number_of_members(&self) -> usize {
        self.number_of_brokers() - self.number_of_leaders()
    }

    pub fn leader_ids(&self) -> Vec<&BrokerId> {
        self.brokers.iter().filter(|b| b.is_leader()).map(|b| &b.id).collect()
    }

    pub fn broker(&self, id: &BrokerId) -> Option<&BrokerSnapshot> {
        self.brokers.iter().find(|b| &b.id == id)
    }

    /// Leader id to the leader's members, ordered by leader id.
    pub fn broadcast_groups(&self) -> BTreeMap<&BrokerId, &[BrokerId]> {
        self.brokers
            .iter()
            .filter(|b| b.is_leader())
            .map(|b| (&b.id, b.members.as_slice()))
            .collect()
    }

    pub fn seed_hex(&self) -> String {
        self.seed_used.iter().fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
    }

    /// Print a summary of the run
    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║    BROADCAST GROUP SIMULATION RESULTS                  ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!("Latency threshold: {} ms", self.latency_threshold);
        println!("Seed: 0x{}", self.seed_hex());
        println!("Rounds: {}", self.rounds);
        println!();

        println!("═══ Final State ═══");
        println!("  Brokers: {}", self.number_of_brokers());
        println!("  Broadcast groups: {}", self.number_of_leaders());
        println!("  Members: {}", self.number_of_members());
        if let Some(max) = self
            .brokers
            .iter()
            .filter(|b| b.is_leader())
            .map(|b| b.members.len() + 1)
            .max()
        {
            println!("  Largest group: {} brokers", max);
        }
        println!();

        println!("═══ Joins ═══");
        println!("  Leader joins: {}", self.leader_joins);
        println!("  Member joins: {}", self.member_joins);
        println!("  Member notifications: {}", self.member_notifications);
        if self.rounds > 0 {
            println!(
                "  Leader joins per round: {:.2}",
                self.leader_joins as f64 / self.rounds as f64
            );
        }
        println!();
    }

    /// Log every broadcast group, one line per leader.
    pub fn log_broadcast_groups(&self) {
        info!(
            "{} broadcast groups for {} brokers at {} ms:",
            self.number_of_leaders(),
            self.number_of_brokers(),
            self.latency_threshold
        );
        for (leader, members) in self.broadcast_groups() {
            let names: Vec<&str> = members.iter().map(BrokerId::name).collect();
            info!("  {} ({} members): {}", leader, members.len(), names.join(", "));
        }
    }

    /// Write `<prefix>-<threshold>-<brokers>-brokers.csv` and the matching `-info.yaml`
    /// into `dir`, creating it if needed. Returns the two paths.
    pub fn save_experiment_data(&self, dir: &Path, prefix: &str) -> Result<(PathBuf, PathBuf), ExportError> {
        fs::create_dir_all(dir)?;

        let stem = format!("{}-{}-{}", prefix, self.latency_threshold, self.number_of_brokers());
        let csv_path = dir.join(format!("{}-brokers.csv", stem));
        let info_path = dir.join(format!("{}-info.yaml", stem));

        let mut csv = String::from("brokerId;latitude;longitude;lcm;leaderId\n");
        for b in &self.brokers {
            let _ = writeln!(
                csv,
                "{};{};{};{};{}",
                b.id, b.location.lat, b.location.lon, b.metric, b.leader_id
            );
        }
        fs::write(&csv_path, csv)?;

        let info = ExperimentInfo {
            latency_threshold: self.latency_threshold,
            brokers: self.number_of_brokers(),
            leaders: self.number_of_leaders(),
            members: self.number_of_members(),
            rounds: self.rounds,
            leader_joins: self.leader_joins,
            member_joins: self.member_joins,
            member_notifications: self.member_notifications,
            seed: self.seed_hex(),
            round_history: &self.round_history,
        };
        fs::write(&info_path, serde_yaml::to_string(&info)?)?;

        info!("Saved experiment data to {} and {}", csv_path.display(), info_path.display());
        Ok((csv_path, info_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot(id: &str, leader: &str, members: &[&str]) -> BrokerSnapshot {
        BrokerSnapshot {
            id: BrokerId::from(id),
            location: Location::new(1.5, -2.25),
            metric: 3,
            leader_id: BrokerId::from(leader),
            members: members.iter().map(|m| BrokerId::from(*m)).collect(),
        }
    }

    fn sample() -> SimulationResult {
        SimulationResult {
            brokers: vec![
                snapshot("a", "a", &["b", "c"]),
                snapshot("b", "a", &[]),
                snapshot("c", "a", &[]),
                snapshot("d", "d", &[]),
            ],
            latency_threshold: 50.0,
            rounds: 2,
            leader_joins: 2,
            member_joins: 0,
            member_notifications: 0,
            seed_used: [0xab; 32],
            round_history: vec![
                RoundStats {
                    round: 1,
                    leaders: 4,
                    leader_joins: 1,
                    ..Default::default()
                },
                RoundStats {
                    round: 2,
                    leaders: 3,
                    leader_joins: 1,
                    ..Default::default()
                },
            ],
        }
    }

    #[test]
    fn test_counts_and_groups() {
        let result = sample();

        assert_eq!(result.number_of_brokers(), 4);
        assert_eq!(result.number_of_leaders(), 2);
        assert_eq!(result.number_of_members(), 2);

        let groups = result.broadcast_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&BrokerId::from("a")].len(), 2);
        assert!(groups[&BrokerId::from("d")].is_empty());

        assert!(result.broker(&BrokerId::from("c")).is_some_and(|c| !c.is_leader()));
        assert!(result.broker(&BrokerId::from("x")).is_none());
    }

    #[test]
    fn test_seed_hex() {
        let result = sample();
        assert_eq!(result.seed_hex(), "ab".repeat(32));
    }

    #[test]
    fn test_save_experiment_data() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("nested");
        let result = sample();

        let (csv_path, info_path) = result.save_experiment_data(&out, "random").unwrap();

        assert_eq!(csv_path.file_name().unwrap(), "random-50-4-brokers.csv");
        assert_eq!(info_path.file_name().unwrap(), "random-50-4-info.yaml");

        let csv = fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "brokerId;latitude;longitude;lcm;leaderId");
        assert_eq!(lines[2], "b;1.5;-2.25;3;a");

        let info: serde_yaml::Value = serde_yaml::from_str(&fs::read_to_string(&info_path).unwrap()).unwrap();
        assert_eq!(info["leaders"].as_u64(), Some(2));
        assert_eq!(info["rounds"].as_u64(), Some(2));
        assert_eq!(info["round_history"].as_sequence().map(Vec::len), Some(2));
    }

    #[test]
    fn test_network_sizes_do_not_share_files() {
        let dir = TempDir::new().unwrap();
        let large = sample();
        let mut small = sample();
        small.brokers.truncate(1);

        let (large_csv, large_info) = large.save_experiment_data(dir.path(), "cities").unwrap();
        let (small_csv, small_info) = small.save_experiment_data(dir.path(), "cities").unwrap();

        assert_ne!(large_csv, small_csv);
        assert_ne!(large_info, small_info);
        assert_eq!(fs::read_to_string(&large_csv).unwrap().lines().count(), 5);
        assert_eq!(fs::read_to_string(&small_csv).unwrap().lines().count(), 2);
    }
}
