//! Producing message batches to the leader of a partition.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    broker::Broker,
    error::{BrokerError, Error, Result},
    message::Message,
    wire::{
        Compression, ProduceRequest, ProduceRequestPartition, ProduceRequestTopic, RequiredAcks,
        WireMessage,
    },
};

#[derive(Debug, Clone)]
pub struct ProducerConf {
    pub required_acks: RequiredAcks,

    /// Bound on local `NoConnectionsAvailable` backoff retries. Saturation
    /// is not a cluster-state signal, so these retries are counted apart
    /// from the leader retries.
    pub retry_limit: usize,

    /// Pause between produce attempts.
    pub retry_wait: Duration,

    pub request_timeout: Duration,

    pub compression: Compression,
}

impl Default for ProducerConf {
    fn default() -> Self {
        Self {
            required_acks: RequiredAcks::All,
            retry_limit: 10,
            retry_wait: Duration::from_millis(200),
            request_timeout: Duration::from_secs(5),
            compression: Compression::None,
        }
    }
}

/// Anything that can write a batch to a (topic, partition).
///
/// The broker-backed implementation is [`BrokerProducer`]; the distribution
/// producer wraps this trait so tests can substitute recording fakes.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Writes `messages` and returns the broker-assigned base offset. The
    /// assigned offsets are also written back into `messages`.
    async fn produce(&self, topic: &str, partition: i32, messages: &mut [Message])
        -> Result<i64>;
}

/// Produces to partition leaders resolved through a [`Broker`], retrying
/// across metadata refreshes while the leadership moves.
pub struct BrokerProducer {
    broker: Broker,
    conf: ProducerConf,
}

impl BrokerProducer {
    pub(crate) fn new(broker: Broker, conf: ProducerConf) -> Self {
        Self { broker, conf }
    }

    pub fn conf(&self) -> &ProducerConf {
        &self.conf
    }

    fn build_request(&self, topic: &str, partition: i32, messages: &[Message]) -> ProduceRequest {
        ProduceRequest {
            required_acks: self.conf.required_acks.code(),
            timeout_ms: self.conf.request_timeout.as_millis() as i32,
            compression: self.conf.compression,
            topics: vec![ProduceRequestTopic {
                name: topic.to_string(),
                partitions: vec![ProduceRequestPartition {
                    partition,
                    messages: messages
                        .iter()
                        .map(|m| WireMessage {
                            offset: 0,
                            crc: m.crc,
                            key: m.key.clone(),
                            value: m.value.clone(),
                        })
                        .collect(),
                }],
            }],
        }
    }
}

#[async_trait]
impl Producer for BrokerProducer {
    async fn produce(
        &self,
        topic: &str,
        partition: i32,
        messages: &mut [Message],
    ) -> Result<i64> {
        for message in messages.iter_mut() {
            message.topic = topic.to_string();
            message.partition = partition;
            message.crc = message.checksum();
        }

        let leader_retry_limit = self.broker.conf().leader_retry_limit;
        let mut leader_attempts = 0;
        let mut saturation_attempts = 0;
        let mut last_err: Option<Error> = None;

        while leader_attempts < leader_retry_limit {
            let endpoint = match self.broker.leader_endpoint(topic, partition).await {
                Ok(endpoint) => endpoint,
                // Usage error: the topic is genuinely unknown (creation,
                // when allowed, was already attempted).
                Err(e @ Error::Broker(BrokerError::UnknownTopicOrPartition)) => return Err(e),
                Err(e) => {
                    debug!(topic, partition, error = %e, "cannot resolve leader");
                    last_err = Some(e);
                    leader_attempts += 1;
                    tokio::time::sleep(self.conf.retry_wait).await;
                    continue;
                }
            };

            let conn = match self.broker.connection_to(&endpoint).await {
                Ok(conn) => conn,
                Err(e) if e.is_no_connections() => {
                    saturation_attempts += 1;
                    if saturation_attempts > self.conf.retry_limit {
                        return Err(e);
                    }
                    tokio::time::sleep(self.conf.retry_wait).await;
                    continue;
                }
                Err(e) => {
                    self.broker.fail_endpoint(&endpoint, &e).await;
                    last_err = Some(e);
                    leader_attempts += 1;
                    tokio::time::sleep(self.conf.retry_wait).await;
                    continue;
                }
            };

            let request = self.build_request(topic, partition, messages);

            if self.conf.required_acks == RequiredAcks::None {
                match tokio::time::timeout(self.conf.request_timeout, conn.produce(request)).await
                {
                    Ok(Ok(_)) => return Ok(0),
                    Ok(Err(e)) => {
                        conn.close();
                        self.broker.fail_endpoint(&endpoint, &e).await;
                        last_err = Some(e);
                    }
                    Err(_) => {
                        conn.close();
                        let e = Error::Timeout(self.conf.request_timeout);
                        self.broker.fail_endpoint(&endpoint, &e).await;
                        last_err = Some(e);
                    }
                }
                leader_attempts += 1;
                tokio::time::sleep(self.conf.retry_wait).await;
                continue;
            }

            let response =
                match tokio::time::timeout(self.conf.request_timeout, conn.produce(request)).await
                {
                    Ok(Ok(Some(response))) => response,
                    Ok(Ok(None)) => {
                        return Err(Error::InvalidResponse(
                            "produce with acks expected a response".into(),
                        ))
                    }
                    Ok(Err(e)) => {
                        conn.close();
                        self.broker.fail_endpoint(&endpoint, &e).await;
                        last_err = Some(e);
                        leader_attempts += 1;
                        tokio::time::sleep(self.conf.retry_wait).await;
                        continue;
                    }
                    Err(_) => {
                        conn.close();
                        let e = Error::Timeout(self.conf.request_timeout);
                        self.broker.fail_endpoint(&endpoint, &e).await;
                        last_err = Some(e);
                        leader_attempts += 1;
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
                    Error::InvalidResponse(format!("produce response misses {topic}/{partition}"))
                })?;

            match BrokerError::from_code(part.error_code) {
                None => {
                    let base = part.offset;
                    for (i, message) in messages.iter_mut().enumerate() {
                        message.offset = base + i as i64;
                    }
                    return Ok(base);
                }
                Some(e) if e.is_transient() => {
                    warn!(topic, partition, endpoint = %endpoint, error = %e, "produce rejected, leader moved");
                    self.broker.fail_endpoint(&endpoint, &e.into()).await;
                    last_err = Some(e.into());
                    leader_attempts += 1;
                    tokio::time::sleep(self.conf.retry_wait).await;
                }
                Some(e) => return Err(e.into()),
            }
        }

        Err(last_err.unwrap_or_else(|| BrokerError::UnknownTopicOrPartition.into()))
    }
}

impl std::fmt::Debug for BrokerProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerProducer")
            .field("broker", &self.broker)
            .field("conf", &self.conf)
            .finish()
    }
}
