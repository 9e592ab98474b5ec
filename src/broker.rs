//! The broker facade: cluster routing plus a connection pool, and the
//! factories for producers, consumers and offset coordinators.

use std::sync::Arc;

use tracing::debug;

use crate::{
    cluster::Cluster,
    config::BrokerConf,
    consumer::{BatchConsumer, Consumer, ConsumerConf},
    coordinator::{OffsetCoordinator, OffsetCoordinatorConf},
    error::{BrokerError, Error, Result},
    pool::{ConnectionPool, Leased},
    producer::{BrokerProducer, ProducerConf},
    wire::{OffsetsRequest, OffsetsRequestPartition, OffsetsRequestTopic},
};

/// Ask for the first offset still present in the partition.
pub const OFFSET_EARLIEST: i64 = -2;
/// Ask for the offset one past the last written message.
pub const OFFSET_LATEST: i64 = -1;

/// Client handle for one cluster. Cheap to clone; clones share the cluster
/// state and connection pool.
#[derive(Clone)]
pub struct Broker {
    cluster: Arc<Cluster>,
    pool: Arc<ConnectionPool>,
    conf: Arc<BrokerConf>,
}

impl Broker {
    /// Connects without shared registries: private cluster state and a
    /// private connection pool. Use [`ClientCache`](crate::cache::ClientCache)
    /// when brokers should share identity.
    pub async fn connect(
        cluster_name: &str,
        bootstrap_addrs: &[String],
        conf: BrokerConf,
    ) -> Result<Self> {
        let cluster =
            Cluster::connect(cluster_name, bootstrap_addrs, conf.cluster_connection.clone())
                .await?;
        let pool = ConnectionPool::new(conf.client_id.clone(), conf.cluster_connection.clone());
        cluster.attach_pool(&pool);
        Ok(Self::from_parts(cluster, pool, conf))
    }

    pub(crate) fn from_parts(
        cluster: Arc<Cluster>,
        pool: Arc<ConnectionPool>,
        conf: BrokerConf,
    ) -> Self {
        Self {
            cluster,
            pool,
            conf: Arc::new(conf),
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn conf(&self) -> &BrokerConf {
        &self.conf
    }

    /// Closes the connection pool; in-flight requests fail with
    /// [`Error::Closed`]. Brokers sharing the pool are affected alike.
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn producer(&self, conf: ProducerConf) -> BrokerProducer {
        BrokerProducer::new(self.clone(), conf)
    }

    /// Single-message consumer for one partition. Fails fast with
    /// `UnknownTopicOrPartition` when the partition has no known leader.
    pub async fn consumer(&self, conf: ConsumerConf) -> Result<Consumer> {
        Consumer::new(self.clone(), conf).await
    }

    /// Batch consumer for one partition, with the same leader validation.
    pub async fn batch_consumer(&self, conf: ConsumerConf) -> Result<BatchConsumer> {
        BatchConsumer::new(self.clone(), conf).await
    }

    pub async fn offset_coordinator(
        &self,
        conf: OffsetCoordinatorConf,
    ) -> Result<OffsetCoordinator> {
        OffsetCoordinator::new(self.clone(), conf).await
    }

    /// Resolves the leader endpoint, optionally auto-creating the topic by
    /// requesting it in a topic-specific refresh.
    pub(crate) async fn leader_endpoint(&self, topic: &str, partition: i32) -> Result<String> {
        match self.cluster.leader_endpoint(topic, partition).await {
            Err(Error::Broker(BrokerError::UnknownTopicOrPartition))
                if self.conf.allow_topic_creation =>
            {
                debug!(topic, "unknown topic, requesting topic-specific metadata");
                self.cluster
                    .refresh_with_topics(&[topic.to_string()])
                    .await?;
                self.cluster
                    .cached_leader_endpoint(topic, partition)
                    .ok_or_else(|| BrokerError::UnknownTopicOrPartition.into())
            }
            other => other,
        }
    }

    /// Checks a connection out of the pool for `endpoint`.
    pub(crate) async fn connection_to(&self, endpoint: &str) -> Result<Leased<'_>> {
        let conn = self.pool.get_connection_by_addr(endpoint).await?;
        Ok(Leased::new(&self.pool, conn))
    }

    /// A connection to any reachable broker, for cluster-wide requests such
    /// as coordinator discovery.
    pub(crate) async fn any_connection(&self) -> Result<Leased<'_>> {
        if let Some(conn) = self.pool.get_idle_connection() {
            return Ok(Leased::new(&self.pool, conn));
        }
        let mut addrs = self.pool.get_all_addrs();
        {
            use rand::prelude::*;
            addrs.shuffle(&mut thread_rng());
        }
        let mut last_err = Error::NoKnownBrokers;
        for addr in addrs {
            match self.pool.get_connection_by_addr(&addr).await {
                Ok(conn) => return Ok(Leased::new(&self.pool, conn)),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Forgets the endpoint and refreshes metadata after a failure that
    /// invalidates the cached leader. Refresh failures only surface through
    /// the caller's retry loop running dry.
    pub(crate) async fn fail_endpoint(&self, endpoint: &str, error: &Error) {
        if !error.invalidates_leader() {
            return;
        }
        debug!(endpoint, error = %error, "leader suspect, forgetting endpoint");
        self.cluster.forget_endpoint(endpoint);
        if let Err(e) = self.cluster.refresh_metadata().await {
            debug!(error = %e, "metadata refresh after endpoint failure failed");
        }
    }

    /// Number of partitions in the current snapshot, going through the
    /// topic-creation path for unknown topics when that is allowed.
    pub async fn partition_count(&self, topic: &str) -> Result<i32> {
        match self.cluster.partition_count(topic) {
            Err(Error::Broker(BrokerError::UnknownTopicOrPartition))
                if self.conf.allow_topic_creation =>
            {
                self.cluster
                    .refresh_with_topics(&[topic.to_string()])
                    .await?;
                self.cluster.partition_count(topic)
            }
            other => other,
        }
    }

    /// First offset of the partition still available on the leader.
    pub async fn offset_earliest(&self, topic: &str, partition: i32) -> Result<i64> {
        self.offset(topic, partition, OFFSET_EARLIEST).await
    }

    /// Offset one past the last message written to the partition.
    pub async fn offset_latest(&self, topic: &str, partition: i32) -> Result<i64> {
        self.offset(topic, partition, OFFSET_LATEST).await
    }

    pub(crate) async fn offset(&self, topic: &str, partition: i32, at: i64) -> Result<i64> {
        let mut last_err: Option<Error> = None;

        for attempt in 0..self.conf.leader_retry_limit {
            if attempt > 0 {
                tokio::time::sleep(self.conf.leader_retry_wait).await;
            }

            let endpoint = match self.leader_endpoint(topic, partition).await {
                Ok(endpoint) => endpoint,
                Err(e @ Error::Broker(BrokerError::UnknownTopicOrPartition)) => return Err(e),
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };

            let conn = match self.connection_to(&endpoint).await {
                Ok(conn) => conn,
                Err(e) => {
                    self.fail_endpoint(&endpoint, &e).await;
                    last_err = Some(e);
                    continue;
                }
            };

            let request = OffsetsRequest {
                replica_id: -1,
                topics: vec![OffsetsRequestTopic {
                    name: topic.to_string(),
                    partitions: vec![OffsetsRequestPartition {
                        partition,
                        time_ms: at,
                        max_offsets: 2,
                    }],
                }],
            };

            let response = match conn.offsets(request).await {
                Ok(response) => response,
                Err(e) => {
                    conn.close();
                    self.fail_endpoint(&endpoint, &e).await;
                    last_err = Some(e);
                    continue;
                }
            };

            let part = response
                .topics
                .iter()
                .find(|t| t.name == topic)
                .and_then(|t| t.partitions.iter().find(|p| p.partition == partition))
                .ok_or_else(|| {
                    Error::InvalidResponse(format!(
                        "offsets response misses {topic}/{partition}"
                    ))
                })?;

            match BrokerError::from_code(part.error_code) {
                Some(e) if e.is_transient() => {
                    self.fail_endpoint(&endpoint, &e.into()).await;
                    last_err = Some(e.into());
                    continue;
                }
                Some(e) => return Err(e.into()),
                None => {
                    return part.offsets.first().copied().ok_or_else(|| {
                        Error::InvalidResponse("offsets response carries no offsets".into())
                    });
                }
            }
        }

        Err(last_err.unwrap_or_else(|| BrokerError::UnknownTopicOrPartition.into()))
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("cluster", &self.cluster.name())
            .field("client_id", &self.conf.client_id)
            .finish_non_exhaustive()
    }
}
