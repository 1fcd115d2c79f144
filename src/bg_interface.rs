use std::fmt;

use serde::{Deserialize, Serialize};

/// Priority used to decide leadership when two groups merge (the "lcm").
pub type Metric = i32;

/// Estimated one-way latency in milliseconds.
pub type LatencyMs = f64;

/// Milliseconds of latency per kilometer of great-circle distance.
/// Median over the 2016 iPlane latency measurements.
pub const MS_PER_KM: f64 = 0.021048134571484346;

/// Unique, ordered broker name. Also the routing address of its mailbox.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerId(String);

impl BrokerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BrokerId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Answer to a MergeRequest, stated from the perspective of the replying leader.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MergeReplyCode {
    /// The requester should join the replier's group.
    JoinMe,
    /// The replier joins the requester's group.
    IJoin,
    /// The replier is (about to be) a member and cannot take part in a merge.
    NoLeaderAnymore,
    /// The replier could not handle the request this round.
    BusyTryAgain,
}

#[derive(Clone, PartialEq, Debug)]
pub enum BrokerMessage {
    /// Sent from one leader to the nearest other leader to initiate a group merge.
    MergeRequest {
        metric: Metric,
        group_size: usize,
        sender: BrokerId,
    },
    /// Every leader replies with exactly one of these per received MergeRequest.
    MergeReply {
        code: MergeReplyCode,
        sender: BrokerId,
    },
    /// Sent from a leader to all of its members when it joins `new_leader`.
    /// Members follow if the latency permits; no confirmation is sent back.
    MergeInfo {
        new_leader: BrokerId,
        sender: BrokerId,
    },
    /// Sent to a leader by whoever just adopted it as their leader.
    JoinInfo { sender: BrokerId },
}

impl BrokerMessage {
    pub fn sender(&self) -> &BrokerId {
        match self {
            BrokerMessage::MergeRequest { sender, .. }
            | BrokerMessage::MergeReply { sender, .. }
            | BrokerMessage::MergeInfo { sender, .. }
            | BrokerMessage::JoinInfo { sender } => sender,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BrokerMessage::MergeRequest { .. } => "MergeRequest",
            BrokerMessage::MergeReply { .. } => "MergeReply",
            BrokerMessage::MergeInfo { .. } => "MergeInfo",
            BrokerMessage::JoinInfo { .. } => "JoinInfo",
        }
    }
}

/// Outcome of the join phase, used for result metrics.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum JoinType {
    /// A leader gave up its group and joined another leader.
    JoinLeader,
    /// A member followed its former leader to a new leader.
    JoinMember,
    NoJoin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_id_ordering_and_display() {
        let a = BrokerId::from("Broker-1");
        let b = BrokerId::new(String::from("Broker-2"));

        assert!(a < b);
        assert_eq!(a.to_string(), "Broker-1");
        assert_eq!(b.name(), "Broker-2");
    }

    #[test]
    fn test_message_sender_and_kind() {
        let sender = BrokerId::from("x");
        let messages = [
            BrokerMessage::MergeRequest {
                metric: 3,
                group_size: 1,
                sender: sender.clone(),
            },
            BrokerMessage::MergeReply {
                code: MergeReplyCode::JoinMe,
                sender: sender.clone(),
            },
            BrokerMessage::MergeInfo {
                new_leader: BrokerId::from("y"),
                sender: sender.clone(),
            },
            BrokerMessage::JoinInfo {
                sender: sender.clone(),
            },
        ];

        let kinds: Vec<_> = messages.iter().map(BrokerMessage::kind).collect();
        assert_eq!(kinds, ["MergeRequest", "MergeReply", "MergeInfo", "JoinInfo"]);
        assert!(messages.iter().all(|m| *m.sender() == sender));
    }
}
