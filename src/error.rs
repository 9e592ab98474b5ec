use std::{io, sync::Arc, time::Duration};

use thiserror::Error;

/// Error codes returned by the broker cluster inside responses.
///
/// Only the codes the client core reacts to are modeled; anything else is
/// carried through as [`BrokerError::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("offset out of range")]
    OffsetOutOfRange,

    #[error("unknown topic or partition")]
    UnknownTopicOrPartition,

    #[error("leader not available")]
    LeaderNotAvailable,

    #[error("not leader for partition")]
    NotLeaderForPartition,

    #[error("request timed out")]
    RequestTimeout,

    #[error("replica not available")]
    ReplicaNotAvailable,

    #[error("coordinator not available")]
    NoCoordinator,

    #[error("not coordinator for consumer group")]
    NotCoordinatorForConsumer,

    #[error("broker error code {0}")]
    Unknown(i16),
}

impl BrokerError {
    /// Decodes a wire error code. Code `0` means "no error".
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(Self::OffsetOutOfRange),
            3 => Some(Self::UnknownTopicOrPartition),
            5 => Some(Self::LeaderNotAvailable),
            6 => Some(Self::NotLeaderForPartition),
            7 => Some(Self::RequestTimeout),
            9 => Some(Self::ReplicaNotAvailable),
            15 => Some(Self::NoCoordinator),
            16 => Some(Self::NotCoordinatorForConsumer),
            other => Some(Self::Unknown(other)),
        }
    }

    pub fn code(&self) -> i16 {
        match self {
            Self::OffsetOutOfRange => 1,
            Self::UnknownTopicOrPartition => 3,
            Self::LeaderNotAvailable => 5,
            Self::NotLeaderForPartition => 6,
            Self::RequestTimeout => 7,
            Self::ReplicaNotAvailable => 9,
            Self::NoCoordinator => 15,
            Self::NotCoordinatorForConsumer => 16,
            Self::Unknown(code) => *code,
        }
    }

    /// The leader-moved family: the cached leader for the partition can no
    /// longer be trusted and the routing entry must be forgotten before the
    /// next attempt.
    pub fn is_leader_moved(&self) -> bool {
        matches!(
            self,
            Self::NotLeaderForPartition | Self::LeaderNotAvailable | Self::UnknownTopicOrPartition
        )
    }

    /// Transient cluster conditions worth a metadata refresh and retry.
    pub fn is_transient(&self) -> bool {
        self.is_leader_moved() || matches!(self, Self::ReplicaNotAvailable)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("connection is closed")]
    Closed,

    /// The backend for `addr` is saturated and no connection was returned
    /// within the idle wait. Local backpressure only: callers must not
    /// treat this as a stale-metadata signal.
    #[error("no connections available to {addr} within {wait:?}")]
    NoConnectionsAvailable { addr: String, wait: Duration },

    #[error("cannot dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("dialing {addr} timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("endpoint {0} is not part of the current broker set")]
    UnknownEndpoint(String),

    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("codec failure: {0}")]
    Codec(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("no known broker addresses")]
    NoKnownBrokers,

    #[error("metadata refresh timed out")]
    RefreshTimeout,

    /// Result of an in-flight refresh another task performed; waiters share
    /// the refresher's error without issuing a second request.
    #[error("metadata refresh failed: {0}")]
    Refresh(Arc<Error>),

    /// The consumer exhausted its retries against an empty partition.
    #[error("no data available")]
    NoData,

    /// Every partition of the topic is quarantined after write failures and
    /// none came back within the allowed wait.
    #[error("all partitions are failing; last error: {0}")]
    AllPartitionsFailing(String),
}

impl Error {
    /// Whether this failure invalidates the cached leader: the caller should
    /// forget the endpoint and refresh metadata before retrying.
    ///
    /// `NoConnectionsAvailable` is deliberately excluded (local saturation),
    /// as are broker-answered errors outside the leader-moved family.
    pub fn invalidates_leader(&self) -> bool {
        match self {
            Self::Broker(e) => e.is_transient(),
            Self::Closed
            | Self::Dial { .. }
            | Self::DialTimeout { .. }
            | Self::UnknownEndpoint(_)
            | Self::Io(_)
            | Self::Timeout(_) => true,
            _ => false,
        }
    }

    pub fn is_no_connections(&self) -> bool {
        matches!(self, Self::NoConnectionsAvailable { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trip() {
        for code in [1, 3, 5, 6, 7, 9, 15, 16, 42] {
            let err = BrokerError::from_code(code).unwrap();
            assert_eq!(err.code(), code);
        }
        assert_eq!(BrokerError::from_code(0), None);
    }

    #[test]
    fn leader_moved_classification() {
        assert!(BrokerError::NotLeaderForPartition.is_leader_moved());
        assert!(BrokerError::LeaderNotAvailable.is_leader_moved());
        assert!(BrokerError::UnknownTopicOrPartition.is_leader_moved());
        assert!(!BrokerError::RequestTimeout.is_leader_moved());
        assert!(BrokerError::ReplicaNotAvailable.is_transient());
    }

    #[test]
    fn saturation_does_not_invalidate_leader() {
        let err = Error::NoConnectionsAvailable {
            addr: "broker-1:9092".into(),
            wait: Duration::from_millis(200),
        };
        assert!(!err.invalidates_leader());
        assert!(err.is_no_connections());

        let err = Error::Dial {
            addr: "broker-1:9092".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(err.invalidates_leader());
    }
}
