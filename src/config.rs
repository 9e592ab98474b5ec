//! Connection-layer and broker-level configuration.

use std::{sync::Arc, time::Duration};

use crate::{
    transport::{Dialer, TcpDialer},
    wire::{BincodeCodec, Serializer},
};

/// Tunables shared by every connection pool talking to one cluster, plus
/// the injected transport and codec seams.
#[derive(Debug, Clone)]
pub struct ClusterConnectionConf {
    /// Bound on establishing a single broker connection.
    pub dial_timeout: Duration,

    /// How long a saturated backend waits for a connection to be returned
    /// before failing with `NoConnectionsAvailable`.
    pub idle_connection_wait: Duration,

    /// Maximum live connections per broker endpoint.
    pub connection_limit: usize,

    /// Bound on a full metadata refresh, including waiting on an in-flight
    /// refresh started by another task.
    pub metadata_refresh_timeout: Duration,

    pub dialer: Arc<dyn Dialer>,

    pub serializer: Arc<dyn Serializer>,
}

impl Default for ClusterConnectionConf {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            idle_connection_wait: Duration::from_millis(200),
            connection_limit: 10,
            metadata_refresh_timeout: Duration::from_secs(30),
            dialer: Arc::new(TcpDialer),
            serializer: Arc::new(BincodeCodec),
        }
    }
}

/// Per-client configuration for a [`Broker`](crate::broker::Broker).
#[derive(Debug, Clone)]
pub struct BrokerConf {
    /// Identifies this client in request headers; connection pools are
    /// shared per (cluster, client id).
    pub client_id: String,

    /// Attempts at resolving a leader and completing a leader-routed
    /// operation before giving up.
    pub leader_retry_limit: usize,

    /// Pause between leader resolution attempts.
    pub leader_retry_wait: Duration,

    /// Whether an unknown topic may be auto-created by requesting it in a
    /// topic-specific metadata refresh.
    pub allow_topic_creation: bool,

    pub cluster_connection: ClusterConnectionConf,
}

impl BrokerConf {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            leader_retry_limit: 10,
            leader_retry_wait: Duration::from_millis(500),
            allow_topic_creation: false,
            cluster_connection: ClusterConnectionConf::default(),
        }
    }
}
