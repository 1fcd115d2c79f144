use std::collections::BTreeSet;

use hashbrown::HashMap;
use indexmap::IndexMap;
use log::{debug, trace, warn};
use rand::rngs::StdRng;
use rand::Rng;

use crate::bg_error::ProtocolError;
use crate::bg_interface::{BrokerId, BrokerMessage, JoinType, LatencyMs, MergeReplyCode, Metric};
use crate::bg_location::Location;
use crate::bg_mailbox::Mailbox;
use crate::bg_result::BrokerSnapshot;
use crate::bg_simulation::SimulationConfig;

const PHASE_MERGE_REQUESTS: &str = "receive_and_process_merge_requests";
const PHASE_MERGE_REPLY: &str = "receive_merge_reply";
const PHASE_NOTIFY: &str = "notify_members_about_merge";
const PHASE_JOIN: &str = "do_join";
const PHASE_JOIN_INFO: &str = "receive_join_info";

/// A MergeRequest as seen by the receiving leader.
#[derive(Clone, Debug)]
struct MergeOffer {
    metric: Metric,
    group_size: usize,
    sender: BrokerId,
}

impl MergeOffer {
    fn rank(&self) -> (Metric, usize) {
        (self.metric, self.group_size)
    }
}

/// One simulated broker and its side of the merge protocol.
///
/// A broker starts out as the leader of a group that only contains itself. Each
/// round the simulation calls the phase methods below in order, on all brokers,
/// with a barrier between phases. A broker's state is only ever touched through
/// `&mut self` by its own phase task; other brokers are reached via the mailbox.
pub struct Broker {
    id: BrokerId,
    metric: Metric,
    location: Location,
    latency_threshold: LatencyMs,
    merge_probability: f64,

    // latency to every other broker, computed once
    latencies: HashMap<BrokerId, LatencyMs>,

    leader_id: BrokerId,
    // differs from leader_id while a join is in progress
    pending_leader_id: BrokerId,
    // only non-empty for leaders
    members: BTreeSet<BrokerId>,

    mailbox: Mailbox,
    // a message read by one phase that belongs to a later one
    lookahead: Option<BrokerMessage>,
    merge_in_flight: bool,

    rng: StdRng,
}

impl Broker {
    /// Create a broker owning `mailbox`. `locations` must contain every broker of the
    /// simulation; the latency to each of them is estimated from the great-circle distance.
    pub fn new(
        mailbox: Mailbox,
        metric: Metric,
        location: Location,
        locations: &IndexMap<BrokerId, Location>,
        config: &SimulationConfig,
        rng: StdRng,
    ) -> Self {
        let id = mailbox.owner().clone();

        let latencies = locations
            .iter()
            .filter(|(other, _)| **other != id)
            .map(|(other, other_location)| {
                (
                    other.clone(),
                    location.distance_km_to(other_location) * config.ms_per_km,
                )
            })
            .collect();

        Self {
            leader_id: id.clone(),
            pending_leader_id: id.clone(),
            id,
            metric,
            location,
            latency_threshold: config.latency_threshold,
            merge_probability: config.merge_probability,
            latencies,
            members: BTreeSet::new(),
            mailbox,
            lookahead: None,
            merge_in_flight: false,
            rng,
        }
    }

    pub fn id(&self) -> &BrokerId {
        &self.id
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn leader_id(&self) -> &BrokerId {
        &self.leader_id
    }

    pub fn is_leader(&self) -> bool {
        self.leader_id == self.id
    }

    pub fn members(&self) -> &BTreeSet<BrokerId> {
        &self.members
    }

    pub fn latency_to(&self, other: &BrokerId) -> Option<LatencyMs> {
        self.latencies.get(other).copied()
    }

    /// Messages not consumed yet, including a buffered one.
    pub fn pending_messages(&self) -> usize {
        self.mailbox.pending() + usize::from(self.lookahead.is_some())
    }

    pub fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            id: self.id.clone(),
            location: self.location,
            metric: self.metric,
            leader_id: self.leader_id.clone(),
            members: self.members.iter().cloned().collect(),
        }
    }

    // ------------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------------

    /// Phase 1: reset per-round state. Mail left over from the previous round means
    /// a message was sent in a phase where nobody reads it.
    pub fn start_new_tick(&mut self) -> Result<(), ProtocolError> {
        if let Some(message) = self.mailbox.poll() {
            return Err(ProtocolError::UndeliveredMessage {
                broker: self.id.clone(),
                message,
            });
        }

        self.lookahead = None;
        self.merge_in_flight = false;
        Ok(())
    }

    /// Phase 2: with `merge_probability`, a leader asks the nearest other leader to
    /// merge, provided that leader is reachable within the latency threshold.
    pub fn send_merge_request(&mut self, current_leaders: &[BrokerId]) -> Result<(), ProtocolError> {
        if !self.is_leader() || !self.rng.gen_bool(self.merge_probability) {
            return Ok(());
        }

        let mut nearest: Option<(&BrokerId, LatencyMs)> = None;
        for leader in current_leaders.iter().filter(|l| **l != self.id) {
            let latency = self.latency(leader)?;
            match nearest {
                Some((_, best)) if best <= latency => {}
                _ => nearest = Some((leader, latency)),
            }
        }

        let (target, latency) = nearest.ok_or_else(|| ProtocolError::NoMergeTarget {
            broker: self.id.clone(),
            leaders: current_leaders.to_vec(),
        })?;

        if !(latency > 0.0) {
            return Err(ProtocolError::NonPositiveLatency {
                broker: self.id.clone(),
                target: target.clone(),
                latency,
            });
        }

        if latency < self.latency_threshold {
            debug!("[{}] Sending MergeRequest to {} ({:.3} ms)", self.id, target, latency);
            self.merge_in_flight = true;
            self.send(
                target,
                BrokerMessage::MergeRequest {
                    metric: self.metric,
                    group_size: self.members.len(),
                    sender: self.id.clone(),
                },
            )
        } else {
            debug!(
                "[{}] {} has the lowest latency of all other leaders ({:.3} ms), but it is not below the threshold",
                self.id, target, latency
            );
            Ok(())
        }
    }

    /// Phase 3: answer every MergeRequest received this round.
    ///
    /// A broker waiting for the answer to its own request refuses all offers. Otherwise
    /// the best offer (highest metric, then largest group) is compared to the broker's
    /// own standing: if the offer is strictly better the broker joins it and turns down
    /// all other requesters, else every requester is told to join this broker.
    ///
    /// The drain stops at the first message that is not a MergeRequest; that message
    /// is kept for [`Broker::receive_merge_reply`].
    pub fn receive_and_process_merge_requests(&mut self) -> Result<(), ProtocolError> {
        if let Some(message) = self.lookahead.take() {
            return Err(self.unexpected(PHASE_MERGE_REQUESTS, message));
        }

        let mut offers = Vec::new();
        while let Some(message) = self.mailbox.poll() {
            match message {
                BrokerMessage::MergeRequest {
                    metric,
                    group_size,
                    sender,
                } => offers.push(MergeOffer {
                    metric,
                    group_size,
                    sender,
                }),
                other => {
                    trace!("[{}] Stopping to receive MergeRequests, found a {}", self.id, other.kind());
                    self.lookahead = Some(other);
                    break;
                }
            }
        }

        // equal offers are decided by the smaller broker id, not by arrival order
        let Some(winner) = offers
            .iter()
            .max_by(|a, b| a.rank().cmp(&b.rank()).then_with(|| b.sender.cmp(&a.sender)))
            .cloned()
        else {
            trace!("[{}] No MergeRequests this round", self.id);
            return Ok(());
        };

        if self.merge_in_flight {
            for offer in &offers {
                debug!(
                    "[{}] Merging myself, replying {:?} to {}",
                    self.id,
                    MergeReplyCode::NoLeaderAnymore,
                    offer.sender
                );
                self.reply(&offer.sender, MergeReplyCode::NoLeaderAnymore)?;
            }
            return Ok(());
        }

        if !self.is_leader() {
            return Err(self.not_a_leader(PHASE_MERGE_REQUESTS));
        }

        if winner.rank() > (self.metric, self.members.len()) {
            debug!("[{}] I join {}", self.id, winner.sender);
            self.pending_leader_id = winner.sender.clone();
            for offer in &offers {
                let code = if offer.sender == winner.sender {
                    MergeReplyCode::IJoin
                } else {
                    MergeReplyCode::NoLeaderAnymore
                };
                self.reply(&offer.sender, code)?;
            }
        } else {
            for offer in &offers {
                debug!("[{}] {} should join me", self.id, offer.sender);
                self.reply(&offer.sender, MergeReplyCode::JoinMe)?;
            }
        }

        Ok(())
    }

    /// Phase 4: read the answer to this broker's own MergeRequest, if any.
    /// Reply codes are stated from the replier's point of view.
    pub fn receive_merge_reply(&mut self) -> Result<(), ProtocolError> {
        let Some(message) = self.lookahead.take().or_else(|| self.mailbox.poll()) else {
            trace!("[{}] Did not receive a MergeReply", self.id);
            return Ok(());
        };

        let (code, sender) = match message {
            BrokerMessage::MergeReply { code, sender } if self.merge_in_flight => (code, sender),
            other => return Err(self.unexpected(PHASE_MERGE_REPLY, other)),
        };

        match code {
            MergeReplyCode::JoinMe => {
                debug!("[{}] I join {}", self.id, sender);
                self.pending_leader_id = sender;
            }
            MergeReplyCode::IJoin => debug!("[{}] {} joins me", self.id, sender),
            MergeReplyCode::NoLeaderAnymore => debug!("[{}] {} is no leader anymore", self.id, sender),
            MergeReplyCode::BusyTryAgain => debug!("[{}] {} is busy", self.id, sender),
        }

        Ok(())
    }

    /// Phase 5: a leader about to join another leader tells its members where to go.
    /// Returns the number of members notified.
    pub fn notify_members_about_merge(&mut self) -> Result<usize, ProtocolError> {
        if self.pending_leader_id == self.leader_id {
            return Ok(0);
        }

        if !self.is_leader() {
            return Err(self.not_a_leader(PHASE_NOTIFY));
        }

        if self.members.is_empty() {
            debug!(
                "[{}] No members to notify about me joining {}, broadcast group is empty",
                self.id, self.pending_leader_id
            );
            return Ok(0);
        }

        for member in &self.members {
            debug!("[{}] Notifying {} about me joining {}", self.id, member, self.pending_leader_id);
            self.send(
                member,
                BrokerMessage::MergeInfo {
                    new_leader: self.pending_leader_id.clone(),
                    sender: self.id.clone(),
                },
            )?;
        }

        Ok(self.members.len())
    }

    /// Phase 6: carry out the leadership transition.
    ///
    /// A departing leader dissolves its group. Everybody else looks for a MergeInfo from
    /// their leader and follows it if the new leader is within the threshold, or starts
    /// a group of their own if it is not. A JoinInfo found instead is kept for
    /// [`Broker::receive_join_info`].
    pub fn do_join(&mut self) -> Result<JoinType, ProtocolError> {
        if let Some(message) = self.lookahead.take() {
            return Err(self.unexpected(PHASE_JOIN, message));
        }

        let was_leader = self.is_leader();

        if self.pending_leader_id != self.leader_id {
            if !was_leader {
                return Err(self.not_a_leader(PHASE_JOIN));
            }
            debug!("[{}] Was leader, now joining other leader {}", self.id, self.pending_leader_id);
            self.members.clear();
        } else {
            match self.mailbox.poll() {
                None => {
                    trace!("[{}] Did not receive a MergeInfo, no join needed", self.id);
                    return Ok(JoinType::NoJoin);
                }
                Some(join @ BrokerMessage::JoinInfo { .. }) => {
                    trace!("[{}] Found a JoinInfo, preserving it for later", self.id);
                    self.lookahead = Some(join);
                    return Ok(JoinType::NoJoin);
                }
                Some(BrokerMessage::MergeInfo { new_leader, sender }) if sender == self.leader_id => {
                    if self.within_threshold(&new_leader)? {
                        debug!(
                            "[{}] Was member of {}, now joining other leader {}",
                            self.id, self.leader_id, new_leader
                        );
                        self.pending_leader_id = new_leader;
                    } else {
                        debug!(
                            "[{}] Latency to proposed leader {} would not be below the threshold, starting own broadcast group",
                            self.id, new_leader
                        );
                        self.leader_id = self.id.clone();
                        self.pending_leader_id = self.id.clone();
                        return Ok(JoinType::NoJoin);
                    }
                }
                Some(other) => return Err(self.unexpected(PHASE_JOIN, other)),
            }
        }

        self.send(
            &self.pending_leader_id,
            BrokerMessage::JoinInfo {
                sender: self.id.clone(),
            },
        )?;
        self.leader_id = self.pending_leader_id.clone();

        Ok(if was_leader {
            JoinType::JoinLeader
        } else {
            JoinType::JoinMember
        })
    }

    /// Phase 7: a leader adds every broker that joined it this round to its members.
    pub fn receive_join_info(&mut self) -> Result<(), ProtocolError> {
        loop {
            let Some(message) = self.lookahead.take().or_else(|| self.mailbox.poll()) else {
                trace!("[{}] Stopping to receive JoinInfo as mailbox is empty", self.id);
                return Ok(());
            };

            let sender = match message {
                BrokerMessage::JoinInfo { sender } => sender,
                other => return Err(self.unexpected(PHASE_JOIN_INFO, other)),
            };

            if !self.is_leader() {
                return Err(self.not_a_leader(PHASE_JOIN_INFO));
            }

            debug!("[{}] Adding {} to my broadcast group", self.id, sender);
            self.members.insert(sender);
        }
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    /// A leader is valid if no other leader is within the threshold; a member is valid
    /// if its leader is within the threshold. Does not modify any state.
    pub fn validate_latency(&self, leaders: &[BrokerId], log: bool) -> Result<bool, ProtocolError> {
        if self.is_leader() {
            for other in leaders.iter().filter(|l| **l != self.id) {
                if self.within_threshold(other)? {
                    if log {
                        warn!(
                            "[{}] Latency to other leader {} is below threshold, no valid state reached",
                            self.id, other
                        );
                    }
                    return Ok(false);
                }
            }
        } else if !self.within_threshold(&self.leader_id)? {
            if log {
                warn!(
                    "[{}] Latency to my leader {} is not below threshold, no valid state reached",
                    self.id, self.leader_id
                );
            }
            return Ok(false);
        }

        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn latency(&self, other: &BrokerId) -> Result<LatencyMs, ProtocolError> {
        self.latency_to(other).ok_or_else(|| ProtocolError::UnknownBroker {
            broker: self.id.clone(),
            target: other.clone(),
        })
    }

    fn within_threshold(&self, other: &BrokerId) -> Result<bool, ProtocolError> {
        Ok(self.latency(other)? < self.latency_threshold)
    }

    fn send(&self, to: &BrokerId, message: BrokerMessage) -> Result<(), ProtocolError> {
        self.mailbox.send(to, message)
    }

    fn reply(&self, to: &BrokerId, code: MergeReplyCode) -> Result<(), ProtocolError> {
        self.send(
            to,
            BrokerMessage::MergeReply {
                code,
                sender: self.id.clone(),
            },
        )
    }

    fn unexpected(&self, phase: &'static str, message: BrokerMessage) -> ProtocolError {
        ProtocolError::UnexpectedMessage {
            broker: self.id.clone(),
            phase,
            message,
        }
    }

    fn not_a_leader(&self, phase: &'static str) -> ProtocolError {
        ProtocolError::NotALeader {
            broker: self.id.clone(),
            leader: self.leader_id.clone(),
            phase,
        }
    }
}
