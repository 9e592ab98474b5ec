//! Consumer-group offset storage against the group's coordinator broker.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    broker::Broker,
    error::{BrokerError, Error, Result},
    pool::Leased,
    wire::{
        GroupCoordinatorRequest, OffsetCommitRequest, OffsetCommitRequestPartition,
        OffsetCommitRequestTopic, OffsetFetchRequest, OffsetFetchRequestTopic,
    },
};

#[derive(Debug, Clone)]
pub struct OffsetCoordinatorConf {
    pub group: String,

    /// Attempts per operation, including coordinator rediscovery.
    pub retry_err_limit: usize,

    /// Pause between attempts.
    pub retry_err_wait: Duration,
}

impl OffsetCoordinatorConf {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            retry_err_limit: 10,
            retry_err_wait: Duration::from_millis(500),
        }
    }
}

/// Commits and reads consumer-group offsets against the coordinator broker
/// owning the group, rediscovering it when the cluster moves it.
pub struct OffsetCoordinator {
    broker: Broker,
    conf: OffsetCoordinatorConf,
    coordinator: Mutex<Option<String>>,
}

impl OffsetCoordinator {
    pub(crate) async fn new(broker: Broker, conf: OffsetCoordinatorConf) -> Result<Self> {
        let coordinator = Self {
            broker,
            conf,
            coordinator: Mutex::new(None),
        };
        // Try to locate the coordinator up front, but defer failures to the
        // first operation: a group may simply not exist yet.
        if let Err(e) = coordinator.discover().await {
            debug!(group = %coordinator.conf.group, error = %e, "coordinator discovery deferred");
        }
        Ok(coordinator)
    }

    pub fn group(&self) -> &str {
        &self.conf.group
    }

    /// Endpoint of the coordinator, discovering it if not cached.
    async fn coordinator_endpoint(&self) -> Result<String> {
        if let Some(endpoint) = self.coordinator.lock().clone() {
            return Ok(endpoint);
        }
        self.discover().await
    }

    async fn discover(&self) -> Result<String> {
        let conn = self.broker.any_connection().await?;
        let response = match conn
            .group_coordinator(GroupCoordinatorRequest {
                group: self.conf.group.clone(),
            })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };

        if let Some(e) = BrokerError::from_code(response.error_code) {
            return Err(e.into());
        }
        let endpoint = response.endpoint();
        debug!(group = %self.conf.group, endpoint = %endpoint, "discovered offset coordinator");
        *self.coordinator.lock() = Some(endpoint.clone());
        Ok(endpoint)
    }

    fn invalidate(&self) {
        self.coordinator.lock().take();
    }

    async fn coordinator_connection(&self) -> Result<Leased<'_>> {
        let endpoint = self.coordinator_endpoint().await?;
        self.broker.connection_to(&endpoint).await
    }

    /// Commits `offset` for `(topic, partition)` under this group.
    pub async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.commit_with_metadata(topic, partition, offset, "").await
    }

    pub async fn commit_with_metadata(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        metadata: &str,
    ) -> Result<()> {
        let mut last_err: Option<Error> = None;

        for attempt in 0..self.conf.retry_err_limit {
            if attempt > 0 {
                tokio::time::sleep(self.conf.retry_err_wait).await;
            }

            let conn = match self.coordinator_connection().await {
                Ok(conn) => conn,
                Err(e @ Error::Broker(BrokerError::NoCoordinator)) => return Err(e),
                Err(e) => {
                    self.invalidate();
                    last_err = Some(e);
                    continue;
                }
            };

            let request = OffsetCommitRequest {
                group: self.conf.group.clone(),
                topics: vec![OffsetCommitRequestTopic {
                    name: topic.to_string(),
                    partitions: vec![OffsetCommitRequestPartition {
                        partition,
                        offset,
                        metadata: metadata.to_string(),
                    }],
                }],
            };

            let response = match conn.offset_commit(request).await {
                Ok(response) => response,
                Err(e) => {
                    conn.close();
                    self.invalidate();
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
                        "offset commit response misses {topic}/{partition}"
                    ))
                })?;

            match BrokerError::from_code(part.error_code) {
                None => return Ok(()),
                Some(BrokerError::NotCoordinatorForConsumer) => {
                    warn!(group = %self.conf.group, "coordinator moved, rediscovering");
                    self.invalidate();
                    last_err = Some(BrokerError::NotCoordinatorForConsumer.into());
                    continue;
                }
                Some(e) => return Err(e.into()),
            }
        }

        Err(last_err.unwrap_or_else(|| BrokerError::NoCoordinator.into()))
    }

    /// Last committed offset and metadata for `(topic, partition)`.
    pub async fn offset(&self, topic: &str, partition: i32) -> Result<(i64, String)> {
        let mut last_err: Option<Error> = None;

        for attempt in 0..self.conf.retry_err_limit {
            if attempt > 0 {
                tokio::time::sleep(self.conf.retry_err_wait).await;
            }

            let conn = match self.coordinator_connection().await {
                Ok(conn) => conn,
                Err(e @ Error::Broker(BrokerError::NoCoordinator)) => return Err(e),
                Err(e) => {
                    self.invalidate();
                    last_err = Some(e);
                    continue;
                }
            };

            let request = OffsetFetchRequest {
                group: self.conf.group.clone(),
                topics: vec![OffsetFetchRequestTopic {
                    name: topic.to_string(),
                    partitions: vec![partition],
                }],
            };

            let response = match conn.offset_fetch(request).await {
                Ok(response) => response,
                Err(e) => {
                    conn.close();
                    self.invalidate();
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
                        "offset fetch response misses {topic}/{partition}"
                    ))
                })?;

            match BrokerError::from_code(part.error_code) {
                None => return Ok((part.offset, part.metadata.clone())),
                Some(BrokerError::NotCoordinatorForConsumer) => {
                    warn!(group = %self.conf.group, "coordinator moved, rediscovering");
                    self.invalidate();
                    last_err = Some(BrokerError::NotCoordinatorForConsumer.into());
                    continue;
                }
                Some(e) => return Err(e.into()),
            }
        }

        Err(last_err.unwrap_or_else(|| BrokerError::NoCoordinator.into()))
    }
}

impl std::fmt::Debug for OffsetCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetCoordinator")
            .field("group", &self.conf.group)
            .field("coordinator", &*self.coordinator.lock())
            .finish_non_exhaustive()
    }
}
