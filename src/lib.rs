//! Cluster-aware client for a partitioned, leader-based commit-log broker.
//!
//! The crate routes produce and fetch traffic to the broker currently
//! leading each partition, riding out leader elections, partition moves and
//! dying nodes: a cached metadata snapshot (with a monotonic epoch and
//! coalesced refreshes) maps partitions to endpoints, bounded per-endpoint
//! connection pools carry the traffic, and the producer/consumer state
//! machines retry with forget-and-refresh on every signal that the cached
//! leader went stale.
//!
//! ```no_run
//! use logbus::{Broker, BrokerConf, Message, ProducerConf, Producer};
//!
//! # async fn example() -> logbus::Result<()> {
//! let broker = Broker::connect(
//!     "chat-cluster",
//!     &["broker-1:9092".to_string(), "broker-2:9092".to_string()],
//!     BrokerConf::new("example-app"),
//! )
//! .await?;
//!
//! let producer = broker.producer(ProducerConf::default());
//! let mut batch = vec![Message::from_value("hello")];
//! let offset = producer.produce("events", 0, &mut batch).await?;
//! assert_eq!(batch[0].offset, offset);
//! # Ok(())
//! # }
//! ```
//!
//! The byte-level wire codec and the transport are injected seams
//! ([`wire::Serializer`], [`transport::Dialer`]); [`testutil`] uses them to
//! run a whole cluster in-process.

pub mod broker;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod coordinator;
pub mod distributor;
pub mod error;
pub mod message;
pub mod pool;
pub mod producer;
pub mod testutil;
pub mod transport;
pub mod wire;

pub use broker::{Broker, OFFSET_EARLIEST, OFFSET_LATEST};
pub use cache::{ClientCache, ConnectionPoolCache, MetadataCache};
pub use cluster::Cluster;
pub use config::{BrokerConf, ClusterConnectionConf};
pub use consumer::{BatchConsumer, Consumer, ConsumerConf};
pub use coordinator::{OffsetCoordinator, OffsetCoordinatorConf};
pub use distributor::{ErrorAverseRRProducer, ErrorAverseRRProducerConf, PartitionCountSource};
pub use error::{BrokerError, Error, Result};
pub use message::Message;
pub use producer::{BrokerProducer, Producer, ProducerConf};
pub use wire::{Compression, RequiredAcks};
