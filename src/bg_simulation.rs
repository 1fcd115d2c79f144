// Broadcast Group Simulation Engine
//
// Every broker runs the seven protocol phases of a round as its own rayon task;
// the end of each parallel pass is the barrier that separates the phases.

use hashbrown::HashMap;
use indexmap::IndexMap;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Deserialize;

use crate::bg_broker::Broker;
use crate::bg_error::SimulationError;
use crate::bg_interface::{BrokerId, JoinType, LatencyMs, Metric, MS_PER_KM};
use crate::bg_location::Location;
use crate::bg_mailbox::PostOffice;
use crate::bg_result::{RoundStats, SimulationResult};

// ============================================================================
// Configuration
// ============================================================================

/// Parameters of a single simulation run
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Maximum latency between a leader and its members, exclusive (ms)
    pub latency_threshold: LatencyMs,

    /// Latency estimate per km of great-circle distance
    pub ms_per_km: f64,

    /// Probability that a leader sends a MergeRequest in a round
    pub merge_probability: f64,

    /// Abort with an error if the state is still invalid after this many rounds
    pub max_rounds: usize,

    /// Random seed for reproducibility
    #[serde(skip)]
    pub seed: Option<[u8; 32]>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            latency_threshold: 50.0,
            ms_per_km: MS_PER_KM,
            merge_probability: 0.3,
            max_rounds: 100_000,
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), SimulationError> {
        if !(self.latency_threshold.is_finite() && self.latency_threshold > 0.0) {
            return Err(SimulationError::InvalidConfig(format!(
                "latency_threshold must be positive, got {}",
                self.latency_threshold
            )));
        }
        if !(self.ms_per_km.is_finite() && self.ms_per_km > 0.0) {
            return Err(SimulationError::InvalidConfig(format!(
                "ms_per_km must be positive, got {}",
                self.ms_per_km
            )));
        }
        if !(self.merge_probability > 0.0 && self.merge_probability <= 1.0) {
            return Err(SimulationError::InvalidConfig(format!(
                "merge_probability must be in (0, 1], got {}",
                self.merge_probability
            )));
        }
        if self.max_rounds == 0 {
            return Err(SimulationError::InvalidConfig("max_rounds must be at least 1".into()));
        }
        Ok(())
    }

    /// The configured seed, or a fresh random one.
    pub fn resolve_seed(&self) -> [u8; 32] {
        self.seed.unwrap_or_else(|| {
            let mut seed = [0u8; 32];
            rand::thread_rng().fill(&mut seed);
            seed
        })
    }
}

// ============================================================================
// Runner
// ============================================================================

pub struct SimulationRunner {
    config: SimulationConfig,
    seed: [u8; 32],
    brokers: Vec<Broker>,
    current_round: usize,
    round_history: Vec<RoundStats>,
}

impl SimulationRunner {
    /// Create one broker per entry of `locations`, in that order. Every broker needs
    /// an entry in `metrics`.
    pub fn new(
        config: SimulationConfig,
        locations: &IndexMap<BrokerId, Location>,
        metrics: &HashMap<BrokerId, Metric>,
    ) -> Result<Self, SimulationError> {
        config.validate()?;

        let seed = config.resolve_seed();
        let mut rng = StdRng::from_seed(seed);

        let (_, mailboxes) = PostOffice::open(locations.keys().cloned());

        // per-broker rngs are derived in input order so a seed reproduces the run
        let mut setups = Vec::with_capacity(locations.len());
        for (mailbox, (id, location)) in mailboxes.into_iter().zip(locations) {
            let metric = *metrics
                .get(id)
                .ok_or_else(|| SimulationError::MissingMetric(id.clone()))?;
            setups.push((mailbox, metric, *location, StdRng::from_seed(rng.gen())));
        }

        let brokers = setups
            .into_par_iter()
            .map(|(mailbox, metric, location, broker_rng)| {
                Broker::new(mailbox, metric, location, locations, &config, broker_rng)
            })
            .collect();

        debug!("Created {} brokers", locations.len());

        Ok(Self {
            config,
            seed,
            brokers,
            current_round: 0,
            round_history: Vec::new(),
        })
    }

    pub fn seed(&self) -> [u8; 32] {
        self.seed
    }

    pub fn brokers(&self) -> &[Broker] {
        &self.brokers
    }

    /// Run rounds until every broker satisfies the latency constraints.
    pub fn run(mut self) -> Result<SimulationResult, SimulationError> {
        info!(
            "Starting simulation of {} brokers with a latency threshold of {} ms",
            self.brokers.len(),
            self.config.latency_threshold
        );

        while !self.is_valid(false)? {
            if self.current_round >= self.config.max_rounds {
                return Err(SimulationError::NotConverged(self.current_round));
            }
            self.current_round += 1;

            let stats = self.run_round()?;
            info!(
                "Round {}: {} leaders, {} leader joins, {} member joins, {} member notifications",
                stats.round, stats.leaders, stats.leader_joins, stats.member_joins, stats.member_notifications
            );
            self.round_history.push(stats);
        }

        self.check_final_state()?;

        let result = self.build_result();
        info!(
            "Valid state reached after {} rounds with {} broadcast groups",
            result.rounds,
            result.number_of_leaders()
        );
        Ok(result)
    }

    fn run_round(&mut self) -> Result<RoundStats, SimulationError> {
        let leaders = self.current_leaders();
        let mut stats = RoundStats {
            round: self.current_round,
            leaders: leaders.len(),
            ..Default::default()
        };

        self.brokers.par_iter_mut().try_for_each(|b| b.start_new_tick())?;

        self.brokers
            .par_iter_mut()
            .try_for_each(|b| b.send_merge_request(&leaders))?;

        self.brokers
            .par_iter_mut()
            .try_for_each(|b| b.receive_and_process_merge_requests())?;

        self.brokers.par_iter_mut().try_for_each(|b| b.receive_merge_reply())?;

        let notified = self
            .brokers
            .par_iter_mut()
            .map(|b| b.notify_members_about_merge())
            .collect::<Result<Vec<_>, _>>()?;
        stats.member_notifications = notified.into_iter().sum();

        let joins = self
            .brokers
            .par_iter_mut()
            .map(|b| b.do_join())
            .collect::<Result<Vec<_>, _>>()?;
        for join in joins {
            match join {
                JoinType::JoinLeader => stats.leader_joins += 1,
                JoinType::JoinMember => stats.member_joins += 1,
                JoinType::NoJoin => {}
            }
        }

        self.brokers.par_iter_mut().try_for_each(|b| b.receive_join_info())?;

        Ok(stats)
    }

    fn current_leaders(&self) -> Vec<BrokerId> {
        self.brokers
            .iter()
            .filter(|b| b.is_leader())
            .map(|b| b.id().clone())
            .collect()
    }

    /// True if every broker satisfies its latency constraint.
    fn is_valid(&self, log: bool) -> Result<bool, SimulationError> {
        let leaders = self.current_leaders();
        let valid = self
            .brokers
            .par_iter()
            .map(|b| b.validate_latency(&leaders, log))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(valid.into_iter().all(|v| v))
    }

    fn check_final_state(&self) -> Result<(), SimulationError> {
        if let Some(b) = self.brokers.iter().find(|b| b.pending_messages() > 0) {
            return Err(SimulationError::InconsistentState(format!(
                "{} still has {} unprocessed messages",
                b.id(),
                b.pending_messages()
            )));
        }

        let index: HashMap<&BrokerId, &Broker> = self.brokers.iter().map(|b| (b.id(), b)).collect();
        let mut leaders = 0;
        let mut members = 0;

        for b in &self.brokers {
            if !b.is_leader() {
                if !b.members().is_empty() {
                    return Err(SimulationError::InconsistentState(format!(
                        "{} is a member of {} but has members itself",
                        b.id(),
                        b.leader_id()
                    )));
                }
                continue;
            }

            leaders += 1;
            members += b.members().len();
            for member in b.members() {
                let follows_b = index.get(member).is_some_and(|m| m.leader_id() == b.id());
                if !follows_b {
                    return Err(SimulationError::InconsistentState(format!(
                        "{} lists {} as member, but it does not follow {}",
                        b.id(),
                        member,
                        b.id()
                    )));
                }
            }
        }

        if leaders + members != self.brokers.len() {
            return Err(SimulationError::InconsistentState(format!(
                "{} leaders and {} members do not add up to {} brokers",
                leaders,
                members,
                self.brokers.len()
            )));
        }

        if !self.is_valid(true)? {
            return Err(SimulationError::InconsistentState(
                "latency constraints are violated".into(),
            ));
        }

        Ok(())
    }

    fn build_result(self) -> SimulationResult {
        let history = &self.round_history;

        SimulationResult {
            brokers: self.brokers.iter().map(Broker::snapshot).collect(),
            latency_threshold: self.config.latency_threshold,
            rounds: self.current_round,
            leader_joins: history.iter().map(|s| s.leader_joins).sum(),
            member_joins: history.iter().map(|s| s.member_joins).sum(),
            member_notifications: history.iter().map(|s| s.member_notifications).sum(),
            seed_used: self.seed,
            round_history: self.round_history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bg_input::{generate_random_broker_locations, generate_random_broker_metrics};

    /// name, metric, km east of the origin
    fn input(points: &[(&str, Metric, f64)]) -> (IndexMap<BrokerId, Location>, HashMap<BrokerId, Metric>) {
        let origin = Location::new(0.0, 0.0);
        let locations = points
            .iter()
            .map(|(name, _, km)| (BrokerId::from(*name), origin.other_in_distance(*km, 90.0)))
            .collect();
        let metrics = points
            .iter()
            .map(|(name, metric, _)| (BrokerId::from(*name), *metric))
            .collect();
        (locations, metrics)
    }

    /// One km is one ms.
    fn config(threshold: LatencyMs, seed: u8) -> SimulationConfig {
        SimulationConfig {
            latency_threshold: threshold,
            ms_per_km: 1.0,
            seed: Some([seed; 32]),
            ..Default::default()
        }
    }

    fn run(points: &[(&str, Metric, f64)], config: SimulationConfig) -> Result<SimulationResult, SimulationError> {
        let (locations, metrics) = input(points);
        SimulationRunner::new(config, &locations, &metrics)?.run()
    }

    fn leader_of<'a>(result: &'a SimulationResult, name: &str) -> &'a str {
        result
            .broker(&BrokerId::from(name))
            .map(|b| b.leader_id.name())
            .unwrap_or_default()
    }

    /// Groups partition the brokers, members are within the threshold of their leader,
    /// leaders are not within the threshold of each other.
    fn assert_valid_partition(result: &SimulationResult, ms_per_km: f64) {
        let latency = |a: &BrokerId, b: &BrokerId| {
            let a = result.broker(a).unwrap().location;
            let b = result.broker(b).unwrap().location;
            a.distance_km_to(&b) * ms_per_km
        };

        let mut covered = 0;
        for (leader, members) in result.broadcast_groups() {
            covered += 1 + members.len();
            for m in members {
                assert_eq!(result.broker(m).unwrap().leader_id, *leader);
                assert!(latency(leader, m) < result.latency_threshold);
            }
        }
        assert_eq!(covered, result.number_of_brokers());

        let leaders = result.leader_ids();
        for (i, a) in leaders.iter().enumerate() {
            for b in &leaders[i + 1..] {
                assert!(latency(*a, *b) >= result.latency_threshold, "{} and {} are too close", a, b);
            }
        }

        for b in result.brokers.iter().filter(|b| !b.is_leader()) {
            assert!(b.members.is_empty());
            assert!(result.broker(&b.leader_id).unwrap().is_leader());
        }
    }

    #[test]
    fn test_single_broker_needs_no_rounds() {
        let result = run(&[("a", 1, 0.0)], config(50.0, 1)).unwrap();

        assert_eq!(result.rounds, 0);
        assert_eq!(result.number_of_leaders(), 1);
        assert!(result.brokers[0].members.is_empty());
        assert!(result.round_history.is_empty());
    }

    #[test]
    fn test_two_close_brokers_merge_under_higher_metric() {
        for seed in 0..5 {
            let result = run(&[("a", 1, 0.0), ("b", 7, 10.0)], config(50.0, seed)).unwrap();

            assert_eq!(result.number_of_leaders(), 1);
            assert_eq!(leader_of(&result, "a"), "b");
            assert_eq!(result.brokers[1].members, [BrokerId::from("a")]);
            assert_eq!(result.leader_joins, 1);
            assert_eq!(result.member_joins, 0);
            assert!(result.rounds >= 1);
        }
    }

    #[test]
    fn test_two_distant_brokers_stay_separate() {
        let result = run(&[("a", 1, 0.0), ("b", 7, 10.0)], config(5.0, 1)).unwrap();

        assert_eq!(result.rounds, 0);
        assert_eq!(result.number_of_leaders(), 2);
        assert_eq!(result.leader_joins + result.member_joins + result.member_notifications, 0);
    }

    #[test]
    fn test_chain_with_weak_middle_forms_two_groups() {
        // a-b and b-c are 40 ms apart, a-c 80 ms
        for seed in 0..10 {
            let result = run(&[("a", 5, 0.0), ("b", 1, 40.0), ("c", 3, 80.0)], config(50.0, seed)).unwrap();

            assert_eq!(result.number_of_leaders(), 2);
            assert_eq!(result.number_of_members(), 1);
            assert!(result.broker(&BrokerId::from("b")).is_some_and(|b| !b.is_leader()));
            assert_valid_partition(&result, 1.0);
        }
    }

    #[test]
    fn test_chain_never_needs_more_than_two_groups() {
        for seed in 0..10 {
            let result = run(&[("a", 1, 0.0), ("b", 9, 40.0), ("c", 1, 80.0)], config(50.0, seed)).unwrap();

            assert!(result.number_of_leaders() <= 2);
            assert_valid_partition(&result, 1.0);
        }
    }

    #[test]
    fn test_brokers_all_within_threshold_form_one_group() {
        let points = [("a", 4, 0.0), ("b", 0, -10.0), ("c", 4, 20.0)];
        for seed in 0..10 {
            let result = run(&points, config(35.0, seed)).unwrap();

            assert_eq!(result.number_of_leaders(), 1);
            assert_valid_partition(&result, 1.0);
        }
    }

    #[test]
    fn test_random_brokers_form_valid_groups() {
        let mut rng = StdRng::seed_from_u64(42);
        let locations = generate_random_broker_locations(200, &mut rng);
        let metrics = generate_random_broker_metrics(locations.keys(), 1000, &mut rng);

        for threshold in [5.0, 10.0, 20.0] {
            let config = SimulationConfig {
                latency_threshold: threshold,
                seed: Some([7; 32]),
                ..Default::default()
            };
            let result = SimulationRunner::new(config, &locations, &metrics)
                .unwrap()
                .run()
                .unwrap();

            assert_valid_partition(&result, MS_PER_KM);
            assert_eq!(result.round_history.len(), result.rounds);
            assert_eq!(
                result.leader_joins,
                result.round_history.iter().map(|s| s.leader_joins).sum::<usize>()
            );
            // notified members either follow or become leaders again
            for pair in result.round_history.windows(2) {
                assert_eq!(
                    pair[1].leaders + pair[0].leader_joins + pair[0].member_joins,
                    pair[0].leaders + pair[0].member_notifications
                );
            }
        }
    }

    #[test]
    fn test_same_seed_same_result() {
        let mut rng = StdRng::seed_from_u64(3);
        let locations = generate_random_broker_locations(100, &mut rng);
        let metrics = generate_random_broker_metrics(locations.keys(), 10, &mut rng);

        let run = || {
            let config = SimulationConfig {
                latency_threshold: 10.0,
                seed: Some([9; 32]),
                ..Default::default()
            };
            SimulationRunner::new(config, &locations, &metrics)
                .unwrap()
                .run()
                .unwrap()
        };

        let first = run();
        let second = run();
        assert_eq!(first.rounds, second.rounds);
        assert_eq!(first.brokers, second.brokers);
        assert_eq!(first.round_history, second.round_history);
        assert_eq!(first.seed_used, [9; 32]);
    }

    #[test]
    fn test_round_cap() {
        // both always ask each other, so both always refuse
        let config = SimulationConfig {
            merge_probability: 1.0,
            max_rounds: 10,
            ..config(50.0, 1)
        };

        let err = run(&[("a", 1, 0.0), ("b", 2, 10.0)], config).unwrap_err();
        assert!(matches!(err, SimulationError::NotConverged(10)));
    }

    #[test]
    fn test_invalid_config() {
        let (locations, metrics) = input(&[("a", 1, 0.0)]);

        for config in [
            SimulationConfig {
                latency_threshold: 0.0,
                ..Default::default()
            },
            SimulationConfig {
                merge_probability: 0.0,
                ..Default::default()
            },
            SimulationConfig {
                ms_per_km: f64::NAN,
                ..Default::default()
            },
            SimulationConfig {
                max_rounds: 0,
                ..Default::default()
            },
        ] {
            assert!(matches!(
                SimulationRunner::new(config, &locations, &metrics),
                Err(SimulationError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_missing_metric() {
        let (locations, mut metrics) = input(&[("a", 1, 0.0), ("b", 1, 1.0)]);
        metrics.remove(&BrokerId::from("b"));

        let err = SimulationRunner::new(SimulationConfig::default(), &locations, &metrics)
            .err()
            .unwrap();
        assert!(matches!(err, SimulationError::MissingMetric(id) if id.name() == "b"));
    }

    #[test]
    fn test_runner_builds_brokers_in_input_order() {
        let (locations, metrics) = input(&[("a", 3, 0.0), ("b", 8, 5.0), ("c", 1, 9.0)]);

        let runner = SimulationRunner::new(config(50.0, 4), &locations, &metrics).unwrap();

        assert_eq!(runner.seed(), [4; 32]);
        assert_eq!(runner.brokers().len(), 3);
        for (broker, (id, location)) in runner.brokers().iter().zip(&locations) {
            assert_eq!(broker.id(), id);
            assert_eq!(broker.location(), *location);
            assert_eq!(broker.metric(), metrics[id]);
            assert!(broker.is_leader());
            assert_eq!(broker.pending_messages(), 0);
        }

        // a seed chosen by the runner is reported in the result
        let unseeded = SimulationConfig {
            seed: None,
            ..config(50.0, 0)
        };
        let runner = SimulationRunner::new(unseeded, &locations, &metrics).unwrap();
        let seed = runner.seed();
        assert_eq!(runner.run().unwrap().seed_used, seed);
    }

    #[test]
    fn test_colocated_brokers_are_rejected() {
        let config = SimulationConfig {
            merge_probability: 1.0,
            ..config(50.0, 1)
        };

        let err = run(&[("a", 1, 0.0), ("b", 2, 0.0)], config).unwrap_err();
        assert!(matches!(err, SimulationError::Protocol(_)));
    }

    #[test]
    fn test_config_from_yaml() {
        let config: SimulationConfig = serde_yaml::from_str("latency_threshold: 25.0\nmax_rounds: 500\n").unwrap();

        assert_eq!(config.latency_threshold, 25.0);
        assert_eq!(config.max_rounds, 500);
        assert_eq!(config.merge_probability, 0.3);
        assert!(config.seed.is_none());
        assert!(config.validate().is_ok());
    }
}
