//! Consuming messages from one partition, tolerating leader migration,
//! empty fetches and offset anomalies.

use std::{collections::VecDeque, time::Duration};

use tracing::{debug, warn};

use crate::{
    broker::{Broker, OFFSET_EARLIEST, OFFSET_LATEST},
    error::{BrokerError, Error, Result},
    message::Message,
    wire::{FetchRequest, FetchRequestPartition, FetchRequestTopic},
};

#[derive(Debug, Clone)]
pub struct ConsumerConf {
    pub topic: String,
    pub partition: i32,

    /// `-2` earliest, `-1` latest, otherwise an absolute offset.
    pub start_offset: i64,

    /// Fetch attempts before giving up on the current call.
    pub retry_limit: usize,

    /// Pause after transport or leader errors.
    pub retry_wait: Duration,

    /// Pause after a fetch that returned no messages.
    pub retry_err_wait: Duration,

    pub min_fetch_size: i32,
    pub max_fetch_size: i32,
    pub request_timeout: Duration,
}

impl ConsumerConf {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
            start_offset: OFFSET_EARLIEST,
            retry_limit: 25,
            retry_wait: Duration::from_millis(50),
            retry_err_wait: Duration::from_millis(250),
            min_fetch_size: 1,
            max_fetch_size: 2 * 1024 * 1024,
            request_timeout: Duration::from_millis(500),
        }
    }
}

/// Shared fetch state machine behind [`Consumer`] and [`BatchConsumer`].
#[derive(Debug)]
struct Fetcher {
    broker: Broker,
    conf: ConsumerConf,
    next_offset: i64,
}

impl Fetcher {
    async fn new(broker: Broker, conf: ConsumerConf) -> Result<Self> {
        // Fail fast when the partition has no known leader.
        broker.leader_endpoint(&conf.topic, conf.partition).await?;

        let next_offset = if conf.start_offset < 0 {
            broker
                .offset(&conf.topic, conf.partition, conf.start_offset)
                .await?
        } else {
            conf.start_offset
        };

        Ok(Self {
            broker,
            conf,
            next_offset,
        })
    }

    /// Fetches until a non-empty batch of messages at or past `next_offset`
    /// arrives, advancing `next_offset` past it. Exhausting the retries on
    /// an empty partition yields [`Error::NoData`]; exhausting them on
    /// failures yields the last failure.
    async fn fetch_batch(&mut self) -> Result<Vec<Message>> {
        let topic = self.conf.topic.clone();
        let partition = self.conf.partition;
        let mut retries = 0;
        let mut last_err: Option<Error> = None;

        loop {
            if retries > self.conf.retry_limit {
                return Err(last_err.take().unwrap_or(Error::NoData));
            }

            let endpoint = match self.broker.leader_endpoint(&topic, partition).await {
                Ok(endpoint) => endpoint,
                // The partition may be mid-move with no leader elected yet;
                // unlike the producer, keep polling.
                Err(e) => {
                    debug!(topic = %topic, partition, error = %e, "cannot resolve leader");
                    last_err = Some(e);
                    retries += 1;
                    tokio::time::sleep(self.conf.retry_wait).await;
                    continue;
                }
            };

            let conn = match self.broker.connection_to(&endpoint).await {
                Ok(conn) => conn,
                Err(e) => {
                    self.broker.fail_endpoint(&endpoint, &e).await;
                    last_err = Some(e);
                    retries += 1;
                    tokio::time::sleep(self.conf.retry_wait).await;
                    continue;
                }
            };

            let request = FetchRequest {
                replica_id: -1,
                max_wait_ms: self.conf.request_timeout.as_millis() as i32,
                min_bytes: self.conf.min_fetch_size,
                topics: vec![FetchRequestTopic {
                    name: topic.clone(),
                    partitions: vec![FetchRequestPartition {
                        partition,
                        fetch_offset: self.next_offset,
                        max_bytes: self.conf.max_fetch_size,
                    }],
                }],
            };

            // Allow for the server-side long poll plus transit.
            let client_timeout = self.conf.request_timeout + Duration::from_secs(1);
            let response = match tokio::time::timeout(client_timeout, conn.fetch(request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    conn.close();
                    self.broker.fail_endpoint(&endpoint, &e).await;
                    last_err = Some(e);
                    retries += 1;
                    tokio::time::sleep(self.conf.retry_wait).await;
                    continue;
                }
                Err(_) => {
                    conn.close();
                    let e = Error::Timeout(client_timeout);
                    self.broker.fail_endpoint(&endpoint, &e).await;
                    last_err = Some(e);
                    retries += 1;
                    tokio::time::sleep(self.conf.retry_wait).await;
                    continue;
                }
            };

            let part = response
                .topics
                .iter()
                .find(|t| t.name == topic)
                .and_then(|t| t.partitions.iter().find(|p| p.partition == partition))
                .ok_or_else(|| {
                    Error::InvalidResponse(format!("fetch response misses {topic}/{partition}"))
                })?;

            match BrokerError::from_code(part.error_code) {
                None => {}
                Some(e) if e.is_transient() => {
                    warn!(topic = %topic, partition, endpoint = %endpoint, error = %e, "fetch rejected, leader moved");
                    self.broker.fail_endpoint(&endpoint, &e.into()).await;
                    last_err = Some(e.into());
                    retries += 1;
                    tokio::time::sleep(self.conf.retry_wait).await;
                    continue;
                }
                // `OffsetOutOfRange` and friends are the caller's problem.
                Some(e) => return Err(e.into()),
            }

            let mut messages: Vec<Message> = part
                .messages
                .iter()
                // The broker may hand back a batch starting before the
                // requested offset (log-compacted storage); skip those.
                .filter(|m| m.offset >= self.next_offset)
                .map(|m| Message {
                    offset: m.offset,
                    crc: m.crc,
                    key: m.key.clone(),
                    value: m.value.clone(),
                    topic: topic.clone(),
                    partition,
                })
                .collect();

            if messages.is_empty() {
                retries += 1;
                tokio::time::sleep(self.conf.retry_err_wait).await;
                continue;
            }

            messages.sort_by_key(|m| m.offset);
            self.next_offset = messages.last().expect("batch is non-empty").offset + 1;
            return Ok(messages);
        }
    }

    async fn seek_to_latest(&mut self) -> Result<i64> {
        let offset = self
            .broker
            .offset(&self.conf.topic, self.conf.partition, OFFSET_LATEST)
            .await?;
        debug!(topic = %self.conf.topic, partition = self.conf.partition, offset, "seeking to latest");
        self.next_offset = offset;
        Ok(offset)
    }
}

/// Single-message consumer for one partition.
///
/// Not meant for concurrent use: `consume` takes `&mut self`, and callers
/// wanting parallelism run one consumer per worker.
#[derive(Debug)]
pub struct Consumer {
    fetcher: Fetcher,
    buffer: VecDeque<Message>,
}

impl Consumer {
    pub(crate) async fn new(broker: Broker, conf: ConsumerConf) -> Result<Self> {
        Ok(Self {
            fetcher: Fetcher::new(broker, conf).await?,
            buffer: VecDeque::new(),
        })
    }

    /// Returns the next message, fetching when the buffer runs dry.
    /// Offsets of returned messages increase strictly across calls.
    pub async fn consume(&mut self) -> Result<Message> {
        if let Some(message) = self.buffer.pop_front() {
            return Ok(message);
        }
        let batch = self.fetcher.fetch_batch().await?;
        self.buffer.extend(batch);
        Ok(self.buffer.pop_front().expect("fetched batch is non-empty"))
    }

    /// Skips to the end of the partition, dropping anything buffered.
    pub async fn seek_to_latest(&mut self) -> Result<()> {
        self.fetcher.seek_to_latest().await?;
        self.buffer.clear();
        Ok(())
    }

    pub fn next_offset(&self) -> i64 {
        self.fetcher.next_offset
    }
}

/// Batch consumer: same fetch discipline as [`Consumer`], returning whole
/// decoded batches.
#[derive(Debug)]
pub struct BatchConsumer {
    fetcher: Fetcher,
}

impl BatchConsumer {
    pub(crate) async fn new(broker: Broker, conf: ConsumerConf) -> Result<Self> {
        Ok(Self {
            fetcher: Fetcher::new(broker, conf).await?,
        })
    }

    pub async fn consume_batch(&mut self) -> Result<Vec<Message>> {
        self.fetcher.fetch_batch().await
    }

    pub async fn seek_to_latest(&mut self) -> Result<()> {
        self.fetcher.seek_to_latest().await?;
        Ok(())
    }

    pub fn next_offset(&self) -> i64 {
        self.fetcher.next_offset
    }
}
