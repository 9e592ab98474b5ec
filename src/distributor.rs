//! Round-robin distribution across a topic's partitions, steering around
//! partitions that recently failed.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::prelude::*;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    broker::Broker,
    cluster::Cluster,
    error::{Error, Result},
    message::Message,
    producer::Producer,
};

/// Where the distributor learns how many partitions a topic has, and which
/// metadata epoch that knowledge belongs to. Typically the [`Cluster`].
#[async_trait]
pub trait PartitionCountSource: Send + Sync {
    async fn partition_count(&self, topic: &str) -> Result<i32>;

    /// Epoch of the snapshot behind the count. A change re-admits every
    /// quarantined partition: fresh routing deserves a fresh chance.
    fn epoch(&self) -> i64 {
        0
    }
}

#[async_trait]
impl PartitionCountSource for Arc<Cluster> {
    async fn partition_count(&self, topic: &str) -> Result<i32> {
        Cluster::partition_count(self, topic)
    }

    fn epoch(&self) -> i64 {
        Cluster::epoch(self)
    }
}

#[async_trait]
impl PartitionCountSource for Broker {
    async fn partition_count(&self, topic: &str) -> Result<i32> {
        Broker::partition_count(self, topic).await
    }

    fn epoch(&self) -> i64 {
        self.cluster().epoch()
    }
}

pub struct ErrorAverseRRProducerConf {
    pub partition_count_source: Arc<dyn PartitionCountSource>,
    pub producer: Arc<dyn Producer>,

    /// Triple duty, as one knob: how long a failed partition stays
    /// quarantined, how long a call may wait for one to come back, and how
    /// often the partition count is re-read.
    pub partition_fetch_timeout: Duration,
}

impl ErrorAverseRRProducerConf {
    pub fn new(
        partition_count_source: Arc<dyn PartitionCountSource>,
        producer: Arc<dyn Producer>,
    ) -> Self {
        Self {
            partition_count_source,
            producer,
            partition_fetch_timeout: Duration::from_secs(10),
        }
    }
}

struct TopicState {
    /// Rotation of partitions currently considered writable.
    live: Vec<i32>,
    /// Round-robin cursor; starts at a random index so many client
    /// processes do not stampede the same partition.
    cursor: usize,
    /// Partition count as of the last source read.
    total: i32,
    refreshed_at: Instant,
    source_epoch: i64,
    /// Partition id → when it may rejoin the rotation.
    quarantined: HashMap<i32, Instant>,
    /// Rendering of the last write failure, for calls that cannot even
    /// attempt a write.
    last_error: Option<String>,
}

impl TopicState {
    fn new(total: i32, source_epoch: i64, now: Instant) -> Self {
        let live: Vec<i32> = (0..total).collect();
        let cursor = thread_rng().gen_range(0..live.len().max(1));
        Self {
            live,
            cursor,
            total,
            refreshed_at: now,
            source_epoch,
            quarantined: HashMap::new(),
            last_error: None,
        }
    }

    /// Appends partitions the topic gained since the last count.
    fn grow_to(&mut self, total: i32) {
        if total > self.total {
            self.live.extend(self.total..total);
            self.total = total;
        }
    }

    fn readmit_expired(&mut self, now: Instant) {
        let mut expired: Vec<i32> = self
            .quarantined
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(p, _)| *p)
            .collect();
        if expired.is_empty() {
            return;
        }
        expired.sort_unstable();
        for partition in &expired {
            self.quarantined.remove(partition);
        }
        self.live.extend(expired);
    }

    fn readmit_all(&mut self) {
        let mut returning: Vec<i32> = self.quarantined.drain().map(|(p, _)| p).collect();
        returning.sort_unstable();
        self.live.extend(returning);
    }

    fn next_live(&mut self) -> Option<i32> {
        if self.live.is_empty() {
            return None;
        }
        let partition = self.live[self.cursor % self.live.len()];
        self.cursor = self.cursor.wrapping_add(1);
        Some(partition)
    }

    fn quarantine(&mut self, partition: i32, until: Instant) {
        self.live.retain(|p| *p != partition);
        self.quarantined.insert(partition, until);
    }

    fn earliest_readmission(&self) -> Option<Instant> {
        self.quarantined.values().min().copied()
    }
}

enum Pick {
    Write(i32),
    Wait(Instant),
    GiveUp,
}

/// Spreads batches round-robin over a topic's partitions via a wrapped
/// [`Producer`], quarantining partitions whose writes fail.
///
/// One batch maps to one write attempt: a failing call quarantines its
/// partition and surfaces the error, so the caller's retry rotates onto the
/// next live partition.
pub struct ErrorAverseRRProducer {
    conf: ErrorAverseRRProducerConf,
    topics: Mutex<HashMap<String, TopicState>>,
}

impl ErrorAverseRRProducer {
    pub fn new(conf: ErrorAverseRRProducerConf) -> Self {
        Self {
            conf,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Writes `messages` to the next live partition of `topic`, returning
    /// the partition and the assigned base offset.
    pub async fn distribute(
        &self,
        topic: &str,
        messages: &mut [Message],
    ) -> Result<(i32, i64)> {
        self.refresh_topic_state(topic).await?;

        let partition = loop {
            let pick = {
                let mut topics = self.topics.lock();
                let state = topics.get_mut(topic).expect("topic state ensured");
                state.readmit_expired(Instant::now());
                match state.next_live() {
                    Some(partition) => Pick::Write(partition),
                    None => match state.earliest_readmission() {
                        Some(at) => Pick::Wait(at),
                        None => Pick::GiveUp,
                    },
                }
            };

            match pick {
                Pick::Write(partition) => break partition,
                Pick::Wait(at) => {
                    if at > Instant::now() + self.conf.partition_fetch_timeout {
                        return Err(self.all_failing(topic));
                    }
                    debug!(topic, "all partitions quarantined, waiting for re-admission");
                    tokio::time::sleep_until(at).await;
                }
                Pick::GiveUp => return Err(self.all_failing(topic)),
            }
        };

        match self
            .conf
            .producer
            .produce(topic, partition, messages)
            .await
        {
            Ok(offset) => Ok((partition, offset)),
            Err(e) => {
                warn!(topic, partition, error = %e, "write failed, quarantining partition");
                let mut topics = self.topics.lock();
                if let Some(state) = topics.get_mut(topic) {
                    state.quarantine(
                        partition,
                        Instant::now() + self.conf.partition_fetch_timeout,
                    );
                    state.last_error = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Creates or refreshes the per-topic state: the partition count is
    /// re-read once it is older than `partition_fetch_timeout`, growth
    /// appends to the rotation, and a newer source epoch clears the
    /// quarantine.
    async fn refresh_topic_state(&self, topic: &str) -> Result<()> {
        let fresh_until = self.conf.partition_fetch_timeout;
        {
            let topics = self.topics.lock();
            if let Some(state) = topics.get(topic) {
                if state.refreshed_at.elapsed() < fresh_until {
                    return Ok(());
                }
            }
        }

        let total = self
            .conf
            .partition_count_source
            .partition_count(topic)
            .await?;
        let epoch = self.conf.partition_count_source.epoch();
        let now = Instant::now();

        let mut topics = self.topics.lock();
        match topics.get_mut(topic) {
            Some(state) => {
                state.grow_to(total);
                if state.source_epoch != epoch {
                    state.source_epoch = epoch;
                    state.readmit_all();
                }
                state.refreshed_at = now;
            }
            None => {
                topics.insert(topic.to_string(), TopicState::new(total, epoch, now));
            }
        }
        Ok(())
    }

    fn all_failing(&self, topic: &str) -> Error {
        let topics = self.topics.lock();
        let detail = topics
            .get(topic)
            .and_then(|state| state.last_error.clone())
            .unwrap_or_else(|| "no partitions available".to_string());
        Error::AllPartitionsFailing(detail)
    }
}

impl std::fmt::Debug for ErrorAverseRRProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorAverseRRProducer")
            .field("topics", &self.topics.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
