//! Typed request/response messages and the codec seam.
//!
//! The byte-accurate wire codec is an injected dependency: the core only
//! speaks in the typed structs below and hands them to a [`Serializer`] to
//! turn into framed payload bytes (and back). The crate ships
//! [`BincodeCodec`] as the reference implementation, which the in-memory
//! test cluster uses as well.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Request kinds, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum ApiKind {
    Produce = 0,
    Fetch = 1,
    Offsets = 2,
    Metadata = 3,
    OffsetCommit = 8,
    OffsetFetch = 9,
    GroupCoordinator = 10,
}

/// Acknowledgement level the producer demands from the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequiredAcks {
    /// Fire and forget; the broker sends no response.
    None,
    /// The partition leader has written the batch.
    Leader,
    /// The full in-sync replica set has written the batch.
    All,
}

impl RequiredAcks {
    pub fn code(&self) -> i16 {
        match self {
            Self::None => 0,
            Self::Leader => 1,
            Self::All => -1,
        }
    }
}

/// Compression applied to produced message sets; interpreted by the codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub api_kind: ApiKind,
    pub correlation_id: i32,
    pub client_id: String,
}

/// A message as carried inside produce and fetch payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub offset: i64,
    pub crc: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRequest {
    /// Empty means "all topics". Naming a topic asks the cluster to include
    /// (and, if so configured, auto-create) exactly that topic.
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerMetadata {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl BrokerMetadata {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub id: i32,
    /// `-1` when the partition currently has no leader.
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
    pub error_code: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
    pub error_code: i16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub brokers: Vec<BrokerMetadata>,
    pub topics: Vec<TopicMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceRequest {
    pub required_acks: i16,
    pub timeout_ms: i32,
    pub compression: Compression,
    pub topics: Vec<ProduceRequestTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceRequestTopic {
    pub name: String,
    pub partitions: Vec<ProduceRequestPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceRequestPartition {
    pub partition: i32,
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub topics: Vec<ProduceResponseTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceResponseTopic {
    pub name: String,
    pub partitions: Vec<ProduceResponsePartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceResponsePartition {
    pub partition: i32,
    pub offset: i64,
    pub error_code: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub replica_id: i32,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub topics: Vec<FetchRequestTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequestTopic {
    pub name: String,
    pub partitions: Vec<FetchRequestPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequestPartition {
    pub partition: i32,
    pub fetch_offset: i64,
    pub max_bytes: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub topics: Vec<FetchResponseTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponseTopic {
    pub name: String,
    pub partitions: Vec<FetchResponsePartition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponsePartition {
    pub partition: i32,
    pub error_code: i16,
    pub high_watermark: i64,
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetsRequest {
    pub replica_id: i32,
    pub topics: Vec<OffsetsRequestTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetsRequestTopic {
    pub name: String,
    pub partitions: Vec<OffsetsRequestPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetsRequestPartition {
    pub partition: i32,
    /// `-1` latest, `-2` earliest, otherwise a timestamp in milliseconds.
    pub time_ms: i64,
    pub max_offsets: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetsResponse {
    pub topics: Vec<OffsetsResponseTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetsResponseTopic {
    pub name: String,
    pub partitions: Vec<OffsetsResponsePartition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetsResponsePartition {
    pub partition: i32,
    pub error_code: i16,
    pub offsets: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCoordinatorRequest {
    pub group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCoordinatorResponse {
    pub error_code: i16,
    pub coordinator_id: i32,
    pub host: String,
    pub port: i32,
}

impl GroupCoordinatorResponse {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCommitRequest {
    pub group: String,
    pub topics: Vec<OffsetCommitRequestTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCommitRequestTopic {
    pub name: String,
    pub partitions: Vec<OffsetCommitRequestPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCommitRequestPartition {
    pub partition: i32,
    pub offset: i64,
    pub metadata: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCommitResponse {
    pub topics: Vec<OffsetCommitResponseTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCommitResponseTopic {
    pub name: String,
    pub partitions: Vec<OffsetCommitResponsePartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCommitResponsePartition {
    pub partition: i32,
    pub error_code: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetFetchRequest {
    pub group: String,
    pub topics: Vec<OffsetFetchRequestTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetFetchRequestTopic {
    pub name: String,
    pub partitions: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetFetchResponse {
    pub topics: Vec<OffsetFetchResponseTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetFetchResponseTopic {
    pub name: String,
    pub partitions: Vec<OffsetFetchResponsePartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetFetchResponsePartition {
    pub partition: i32,
    pub offset: i64,
    pub metadata: String,
    pub error_code: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Metadata(MetadataRequest),
    Produce(ProduceRequest),
    Fetch(FetchRequest),
    Offsets(OffsetsRequest),
    GroupCoordinator(GroupCoordinatorRequest),
    OffsetCommit(OffsetCommitRequest),
    OffsetFetch(OffsetFetchRequest),
}

impl Request {
    pub fn api_kind(&self) -> ApiKind {
        match self {
            Self::Metadata(_) => ApiKind::Metadata,
            Self::Produce(_) => ApiKind::Produce,
            Self::Fetch(_) => ApiKind::Fetch,
            Self::Offsets(_) => ApiKind::Offsets,
            Self::GroupCoordinator(_) => ApiKind::GroupCoordinator,
            Self::OffsetCommit(_) => ApiKind::OffsetCommit,
            Self::OffsetFetch(_) => ApiKind::OffsetFetch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Metadata(MetadataResponse),
    Produce(ProduceResponse),
    Fetch(FetchResponse),
    Offsets(OffsetsResponse),
    GroupCoordinator(GroupCoordinatorResponse),
    OffsetCommit(OffsetCommitResponse),
    OffsetFetch(OffsetFetchResponse),
}

impl Response {
    pub fn api_kind(&self) -> ApiKind {
        match self {
            Self::Metadata(_) => ApiKind::Metadata,
            Self::Produce(_) => ApiKind::Produce,
            Self::Fetch(_) => ApiKind::Fetch,
            Self::Offsets(_) => ApiKind::Offsets,
            Self::GroupCoordinator(_) => ApiKind::GroupCoordinator,
            Self::OffsetCommit(_) => ApiKind::OffsetCommit,
            Self::OffsetFetch(_) => ApiKind::OffsetFetch,
        }
    }
}

/// Maps typed requests and responses to framed payload bytes and back.
///
/// Implementations must embed the correlation id so that
/// [`Serializer::decode_response`] can recover it without knowing which
/// request is in flight.
pub trait Serializer: Send + Sync + fmt::Debug {
    fn encode_request(&self, header: &RequestHeader, request: &Request) -> Result<Vec<u8>>;

    fn decode_request(&self, payload: &[u8]) -> Result<(RequestHeader, Request)>;

    fn encode_response(&self, correlation_id: i32, response: &Response) -> Result<Vec<u8>>;

    fn decode_response(&self, payload: &[u8]) -> Result<(i32, Response)>;
}

/// Reference codec: bincode over the typed messages, with the header (or
/// correlation id) encoded ahead of the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Serializer for BincodeCodec {
    fn encode_request(&self, header: &RequestHeader, request: &Request) -> Result<Vec<u8>> {
        bincode::serialize(&(header, request)).map_err(codec_err)
    }

    fn decode_request(&self, payload: &[u8]) -> Result<(RequestHeader, Request)> {
        bincode::deserialize(payload).map_err(codec_err)
    }

    fn encode_response(&self, correlation_id: i32, response: &Response) -> Result<Vec<u8>> {
        bincode::serialize(&(correlation_id, response)).map_err(codec_err)
    }

    fn decode_response(&self, payload: &[u8]) -> Result<(i32, Response)> {
        bincode::deserialize(payload).map_err(codec_err)
    }
}

fn codec_err(e: bincode::Error) -> Error {
    Error::Codec(e.to_string())
}
