use crate::bg_interface::{BrokerId, BrokerMessage, LatencyMs};

/// Violations of the merge protocol. None of these are recoverable: they point at a
/// defect in the protocol logic or at invalid input data, and abort the run.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("[{broker}] mailbox not empty at start of round, found {message:?}")]
    UndeliveredMessage {
        broker: BrokerId,
        message: BrokerMessage,
    },

    #[error("[{broker}] unexpected {} from {} during {phase}", .message.kind(), .message.sender())]
    UnexpectedMessage {
        broker: BrokerId,
        phase: &'static str,
        message: BrokerMessage,
    },

    #[error("[{broker}] no other leader to merge with, current leaders are {leaders:?}")]
    NoMergeTarget {
        broker: BrokerId,
        leaders: Vec<BrokerId>,
    },

    #[error("[{broker}] latency to {target} is {latency} ms, it must be positive")]
    NonPositiveLatency {
        broker: BrokerId,
        target: BrokerId,
        latency: LatencyMs,
    },

    #[error("[{broker}] there is no latency for broker {target}")]
    UnknownBroker { broker: BrokerId, target: BrokerId },

    #[error("[{broker}] there is no open mailbox for broker {target}")]
    NoMailbox { broker: BrokerId, target: BrokerId },

    #[error("[{broker}] should be a leader during {phase}, but follows {leader}")]
    NotALeader {
        broker: BrokerId,
        leader: BrokerId,
        phase: &'static str,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("there is no metric for broker {0}")]
    MissingMetric(BrokerId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no stable state reached after {0} rounds")]
    NotConverged(usize),

    #[error("inconsistent final state: {0}")]
    InconsistentState(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to write experiment data: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize experiment info: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
