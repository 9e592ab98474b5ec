//! Scenario tests for the broker, producer, consumer and coordinator against
//! an in-memory cluster.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use logbus::testutil::{MemoryNet, TestBroker};
use logbus::wire::{
    ApiKind, BrokerMetadata, FetchResponse, FetchResponsePartition, FetchResponseTopic,
    GroupCoordinatorResponse, MetadataResponse, OffsetCommitResponse, OffsetCommitResponsePartition,
    OffsetCommitResponseTopic, OffsetFetchResponse, OffsetFetchResponsePartition,
    OffsetFetchResponseTopic, OffsetsResponse, OffsetsResponsePartition, OffsetsResponseTopic,
    PartitionMetadata, ProduceResponse, ProduceResponsePartition, ProduceResponseTopic, Request,
    RequestHeader, Response, TopicMetadata, WireMessage,
};
use logbus::{
    Broker, BrokerConf, BrokerError, ClientCache, ConsumerConf, Error, Message,
    OffsetCoordinatorConf, Producer, ProducerConf, RequiredAcks,
};

fn test_conf(net: &Arc<MemoryNet>, client_id: &str) -> BrokerConf {
    let mut conf = BrokerConf::new(client_id);
    conf.leader_retry_limit = 10;
    conf.leader_retry_wait = Duration::from_millis(2);
    conf.cluster_connection.dial_timeout = Duration::from_millis(400);
    conf.cluster_connection.dialer = net.clone();
    conf
}

fn test_producer_conf() -> ProducerConf {
    ProducerConf {
        retry_wait: Duration::from_millis(1),
        ..ProducerConf::default()
    }
}

/// Metadata handler in the shape the real cluster answers: one broker (node
/// 1), two partitions per known topic, all led by node 1. Tracks how many
/// general (all-topics) and specific (named-topic) fetches it served, and
/// can auto-create requested topics.
struct MetadataTester {
    host: String,
    port: i32,
    allow_create: bool,
    topics: Mutex<HashSet<String>>,
    general: AtomicUsize,
    specific: AtomicUsize,
}

impl MetadataTester {
    fn install(srv: &TestBroker, allow_create: bool) -> Arc<Self> {
        let (host, port) = srv.host_port();
        let tester = Arc::new(Self {
            host,
            port,
            allow_create,
            topics: Mutex::new(HashSet::from(["test".to_string()])),
            general: AtomicUsize::new(0),
            specific: AtomicUsize::new(0),
        });
        let handler = Arc::clone(&tester);
        srv.handle(ApiKind::Metadata, move |_, request| handler.respond(request));
        tester
    }

    fn num_general(&self) -> usize {
        self.general.load(Ordering::SeqCst)
    }

    fn num_specific(&self) -> usize {
        self.specific.load(Ordering::SeqCst)
    }

    fn respond(&self, request: Request) -> Option<Response> {
        let Request::Metadata(request) = request else {
            return None;
        };

        let mut known = self.topics.lock().unwrap();
        if request.topics.is_empty() {
            self.general.fetch_add(1, Ordering::SeqCst);
        } else {
            self.specific.fetch_add(1, Ordering::SeqCst);
            if self.allow_create {
                for topic in &request.topics {
                    known.insert(topic.clone());
                }
            }
        }

        let topics = known
            .iter()
            .filter(|topic| request.topics.is_empty() || request.topics.contains(*topic))
            .map(|topic| TopicMetadata {
                name: topic.clone(),
                partitions: vec![
                    PartitionMetadata {
                        id: 0,
                        leader: 1,
                        replicas: vec![1],
                        isr: vec![1],
                        error_code: 0,
                    },
                    PartitionMetadata {
                        id: 1,
                        leader: 1,
                        replicas: vec![1],
                        isr: vec![1],
                        error_code: 0,
                    },
                ],
                error_code: 0,
            })
            .collect();

        Some(Response::Metadata(MetadataResponse {
            brokers: vec![BrokerMetadata {
                node_id: 1,
                host: self.host.clone(),
                port: self.port,
            }],
            topics,
        }))
    }
}

fn produce_ok(topic: &str, partition: i32, offset: i64) -> Option<Response> {
    Some(Response::Produce(ProduceResponse {
        topics: vec![ProduceResponseTopic {
            name: topic.to_string(),
            partitions: vec![ProduceResponsePartition {
                partition,
                offset,
                error_code: 0,
            }],
        }],
    }))
}

fn produce_err(topic: &str, partition: i32, error: BrokerError) -> Option<Response> {
    Some(Response::Produce(ProduceResponse {
        topics: vec![ProduceResponseTopic {
            name: topic.to_string(),
            partitions: vec![ProduceResponsePartition {
                partition,
                offset: 0,
                error_code: error.code(),
            }],
        }],
    }))
}

fn fetch_messages(
    topic: &str,
    partition: i32,
    high_watermark: i64,
    messages: Vec<WireMessage>,
) -> Option<Response> {
    Some(Response::Fetch(FetchResponse {
        topics: vec![FetchResponseTopic {
            name: topic.to_string(),
            partitions: vec![FetchResponsePartition {
                partition,
                error_code: 0,
                high_watermark,
                messages,
            }],
        }],
    }))
}

fn fetch_err(topic: &str, partition: i32, error: BrokerError) -> Option<Response> {
    Some(Response::Fetch(FetchResponse {
        topics: vec![FetchResponseTopic {
            name: topic.to_string(),
            partitions: vec![FetchResponsePartition {
                partition,
                error_code: error.code(),
                ..FetchResponsePartition::default()
            }],
        }],
    }))
}

fn wire_message(offset: i64, key: &str, value: &str) -> WireMessage {
    WireMessage {
        offset,
        crc: 0,
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
    }
}

/// Metadata handler with one topic ("test") holding a single partition 413
/// led by node 1; used by the consumer tests.
fn install_partition_413_metadata(srv: &TestBroker) {
    let (host, port) = srv.host_port();
    srv.handle(ApiKind::Metadata, move |_, _| {
        Some(Response::Metadata(MetadataResponse {
            brokers: vec![BrokerMetadata {
                node_id: 1,
                host: host.clone(),
                port,
            }],
            topics: vec![TopicMetadata {
                name: "test".to_string(),
                partitions: vec![PartitionMetadata {
                    id: 413,
                    leader: 1,
                    replicas: vec![1],
                    isr: vec![1],
                    error_code: 0,
                }],
                error_code: 0,
            }],
        }))
    });
}

#[tokio::test]
async fn dial_with_mixed_good_and_bad_addresses() {
    let net = MemoryNet::new();
    let srv = net.start_broker("live:9092");

    let addresses = vec![
        "localhost:4291190".to_string(),
        "localhost:2141202".to_string(),
        srv.addr(),
    ];
    Broker::connect("test-cluster-invalid", &addresses, test_conf(&net, "tester"))
        .await
        .unwrap();
}

#[tokio::test]
async fn dial_with_no_addresses() {
    let net = MemoryNet::new();
    net.start_broker("live:9092");

    let err = Broker::connect("test-cluster-nil-address", &[], test_conf(&net, "tester"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoKnownBrokers));
}

#[tokio::test]
async fn metadata_cache_coalesces_broker_construction() {
    let net = MemoryNet::new();
    let srv1 = net.start_broker("node-1:9092");
    let srv2 = net.start_broker("node-2:9092");
    let srv3 = net.start_broker("node-3:9092");
    let addresses = vec![srv1.addr(), srv2.addr(), srv3.addr()];

    let cache = ClientCache::new();
    for _ in 0..30 {
        cache
            .broker(
                "test-cluster-metadata-cache",
                &addresses,
                test_conf(&net, "tester"),
            )
            .await
            .unwrap();
    }

    assert_eq!(srv1.processed() + srv2.processed() + srv3.processed(), 1);
}

#[tokio::test]
async fn concurrent_broker_construction_issues_one_metadata_rpc() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    let addresses = vec![srv.addr()];

    let cache = Arc::new(ClientCache::new());
    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let net = Arc::clone(&net);
            let addresses = addresses.clone();
            tokio::spawn(async move {
                cache
                    .broker("test-cluster-concurrent", &addresses, test_conf(&net, "tester"))
                    .await
                    .unwrap()
            })
        })
        .collect();
    futures::future::try_join_all(tasks).await.unwrap();

    assert_eq!(srv.processed(), 1);
}

#[tokio::test]
async fn connection_pool_shared_per_cluster_and_client_id() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    let addresses = vec![srv.addr()];
    let cache = ClientCache::new();

    let same1 = cache
        .broker("test-cluster1", &addresses, test_conf(&net, "tester1"))
        .await
        .unwrap();
    let same2 = cache
        .broker("test-cluster1", &addresses, test_conf(&net, "tester1"))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(same1.pool(), same2.pool()));

    let different1 = cache
        .broker("test-cluster2", &addresses, test_conf(&net, "tester2"))
        .await
        .unwrap();
    let different2 = cache
        .broker("test-cluster3", &addresses, test_conf(&net, "tester3"))
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(different1.pool(), different2.pool()));
}

#[tokio::test]
async fn bootstrap_dialing_is_randomized() {
    let net = MemoryNet::new();
    let srv1 = net.start_broker("node-1:9092");
    let srv2 = net.start_broker("node-2:9092");
    let srv3 = net.start_broker("node-3:9092");
    let addresses = vec![srv1.addr(), srv2.addr(), srv3.addr()];

    for i in 0..30 {
        logbus::Cluster::connect(
            format!("test-cluster-randomized-{i}"),
            &addresses,
            test_conf(&net, "tester").cluster_connection,
        )
        .await
        .unwrap();
    }

    let counts = [srv1.processed(), srv2.processed(), srv3.processed()];
    assert_eq!(counts.iter().sum::<usize>(), 30);
    for count in counts {
        assert!(count > 0, "one broker was never chosen: {counts:?}");
        assert!(count < 30, "one broker absorbed every dial: {counts:?}");
    }
}

#[tokio::test]
async fn produce_assigns_offsets_and_writes_them_back() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    MetadataTester::install(&srv, false);

    let handler_err: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let created = Arc::new(AtomicUsize::new(0));
    {
        let handler_err = Arc::clone(&handler_err);
        let created = Arc::clone(&created);
        srv.handle(ApiKind::Produce, move |_, request| {
            let Request::Produce(request) = request else {
                return None;
            };
            let topic = &request.topics[0];
            let partition = &topic.partitions[0];
            if topic.name != "test" {
                *handler_err.lock().unwrap() = Some(format!("unexpected topic {}", topic.name));
                return None;
            }
            if partition.partition != 0 {
                *handler_err.lock().unwrap() =
                    Some(format!("unexpected partition {}", partition.partition));
                return None;
            }
            for message in &partition.messages {
                created.fetch_add(1, Ordering::SeqCst);
                let expected = Message::from_value(message.value.clone())
                    .with_key(message.key.clone())
                    .checksum();
                if message.crc != expected {
                    *handler_err.lock().unwrap() =
                        Some(format!("expected crc {expected}, got {}", message.crc));
                    return None;
                }
            }
            produce_ok("test", 0, 5)
        });
    }

    let broker = Broker::connect(
        "test-cluster-producer",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();
    let producer = broker.producer(test_producer_conf());

    let mut messages = vec![Message::from_value("first"), Message::from_value("second")];
    let err = producer
        .produce("does-not-exist", 42142, &mut messages)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Broker(BrokerError::UnknownTopicOrPartition)
    ));

    let offset = producer.produce("test", 0, &mut messages).await.unwrap();
    assert_eq!(handler_err.lock().unwrap().take(), None);
    assert_eq!(offset, 5);
    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert_eq!(messages[0].offset, 5);
    assert_eq!(messages[1].offset, 6);
}

#[tokio::test]
async fn produce_without_acks_expects_no_response() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    MetadataTester::install(&srv, false);

    let handler_err: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let created = Arc::new(AtomicUsize::new(0));
    {
        let handler_err = Arc::clone(&handler_err);
        let created = Arc::clone(&created);
        srv.handle(ApiKind::Produce, move |_, request| {
            let Request::Produce(request) = request else {
                return None;
            };
            if request.required_acks != 0 {
                *handler_err.lock().unwrap() =
                    Some(format!("expected no acks, got {}", request.required_acks));
            }
            created.fetch_add(request.topics[0].partitions[0].messages.len(), Ordering::SeqCst);
            // Nothing goes back on the wire for an ack-less produce.
            None
        });
    }

    let broker = Broker::connect(
        "test-cluster-no-ack",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();
    let producer = broker.producer(ProducerConf {
        required_acks: RequiredAcks::None,
        retry_wait: Duration::from_millis(1),
        ..ProducerConf::default()
    });

    let mut messages = vec![Message::from_value("first"), Message::from_value("second")];
    let err = producer
        .produce("does-not-exist", 42142, &mut messages)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Broker(BrokerError::UnknownTopicOrPartition)
    ));

    let offset = producer.produce("test", 0, &mut messages).await.unwrap();
    assert_eq!(offset, 0);

    // The produce is fire-and-forget; give the server a beat to decode it.
    for _ in 0..100 {
        if created.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(handler_err.lock().unwrap().take(), None);
    assert_eq!(created.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn metadata_refresh_is_coalesced() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    MetadataTester::install(&srv, false);

    let broker = Broker::connect(
        "test-cluster-metadata-refresh",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();
    let cluster = Arc::clone(broker.cluster());
    assert_eq!(cluster.epoch(), 1);

    cluster.refresh_metadata().await.unwrap();
    assert_eq!(cluster.epoch(), 2);

    // Two overlapping refreshes observe a single epoch increment.
    srv.set_request_delay(Duration::from_millis(100));
    let background = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move { cluster.refresh_metadata().await })
    };
    tokio::task::yield_now().await;
    cluster.refresh_metadata().await.unwrap();
    background.await.unwrap().unwrap();
    assert_eq!(cluster.epoch(), 3);
}

#[tokio::test(start_paused = true)]
async fn metadata_refresh_timeout_does_not_advance_epoch() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    MetadataTester::install(&srv, false);

    let mut conf = test_conf(&net, "tester");
    conf.cluster_connection.metadata_refresh_timeout = Duration::from_millis(50);
    let broker = Broker::connect("test-cluster-refresh-timeout", &[srv.addr()], conf)
        .await
        .unwrap();
    let cluster = broker.cluster();
    assert_eq!(cluster.epoch(), 1);

    srv.set_request_delay(Duration::from_millis(200));
    assert!(cluster.refresh_metadata().await.is_err());
    assert_eq!(cluster.epoch(), 1);
}

#[tokio::test(start_paused = true)]
async fn produce_while_leader_changes() {
    let net = MemoryNet::new();
    let srv1 = net.start_broker("node-1:9092");
    let srv2 = net.start_broker("node-2:9092");

    let (host1, port1) = srv1.host_port();
    let (host2, port2) = srv2.host_port();
    let brokers = vec![
        BrokerMetadata {
            node_id: 1,
            host: host1,
            port: port1,
        },
        BrokerMetadata {
            node_id: 2,
            host: host2,
            port: port2,
        },
    ];

    // The metadata keeps naming node 1 as the leader for the first few
    // refreshes even though node 1 keeps rejecting writes.
    let tries_required = 4;
    let meta_calls = Arc::new(AtomicUsize::new(0));
    for srv in [&srv1, &srv2] {
        let meta_calls = Arc::clone(&meta_calls);
        let brokers = brokers.clone();
        srv.handle(ApiKind::Metadata, move |_, _| {
            let calls = meta_calls.fetch_add(1, Ordering::SeqCst) + 1;
            let leader = if calls > tries_required { 2 } else { 1 };
            Some(Response::Metadata(MetadataResponse {
                brokers: brokers.clone(),
                topics: vec![TopicMetadata {
                    name: "test".to_string(),
                    partitions: vec![
                        PartitionMetadata {
                            id: 0,
                            leader: 1,
                            replicas: vec![1, 2],
                            isr: vec![1, 2],
                            error_code: 0,
                        },
                        PartitionMetadata {
                            id: 1,
                            leader,
                            replicas: vec![1, 2],
                            isr: vec![1, 2],
                            error_code: 0,
                        },
                    ],
                    error_code: 0,
                }],
            }))
        });
    }

    let produce1_calls = Arc::new(AtomicUsize::new(0));
    {
        let produce1_calls = Arc::clone(&produce1_calls);
        srv1.handle(ApiKind::Produce, move |_, _| {
            produce1_calls.fetch_add(1, Ordering::SeqCst);
            produce_err("test", 1, BrokerError::NotLeaderForPartition)
        });
    }
    let produce2_calls = Arc::new(AtomicUsize::new(0));
    {
        let produce2_calls = Arc::clone(&produce2_calls);
        srv2.handle(ApiKind::Produce, move |_, _| {
            produce2_calls.fetch_add(1, Ordering::SeqCst);
            produce_ok("test", 1, 5)
        });
    }

    let broker = Broker::connect(
        "test-cluster-leader-change",
        &[srv1.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();
    let producer = broker.producer(test_producer_conf());

    // One call rides through all four stale answers.
    let mut messages = vec![Message::from_value("foo")];
    let offset = producer.produce("test", 1, &mut messages).await.unwrap();
    assert_eq!(offset, 5);
    assert_eq!(produce1_calls.load(Ordering::SeqCst), tries_required);
    assert_eq!(produce2_calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.cluster().epoch(), 1 + tries_required as i64);
}

#[tokio::test(start_paused = true)]
async fn produce_request_timeout_is_surfaced_not_retried() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    MetadataTester::install(&srv, false);

    let requests = Arc::new(AtomicUsize::new(0));
    {
        let requests = Arc::clone(&requests);
        srv.handle(ApiKind::Produce, move |_, _| {
            requests.fetch_add(1, Ordering::SeqCst);
            produce_err("test", 0, BrokerError::RequestTimeout)
        });
    }

    let broker = Broker::connect(
        "test-cluster-produce-timeout",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();
    let producer = broker.producer(ProducerConf {
        retry_limit: 4,
        retry_wait: Duration::from_millis(1),
        ..ProducerConf::default()
    });

    let mut messages = vec![Message::from_value("first"), Message::from_value("second")];
    let err = producer.produce("test", 0, &mut messages).await.unwrap_err();
    assert!(matches!(err, Error::Broker(BrokerError::RequestTimeout)));
    assert_eq!(requests.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn produce_retries_through_leader_not_available() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    MetadataTester::install(&srv, false);

    let tries_required = 4;
    let requests = Arc::new(AtomicUsize::new(0));
    {
        let requests = Arc::clone(&requests);
        srv.handle(ApiKind::Produce, move |_, _| {
            let calls = requests.fetch_add(1, Ordering::SeqCst) + 1;
            if calls > tries_required {
                produce_ok("test", 0, 11)
            } else {
                produce_err("test", 0, BrokerError::LeaderNotAvailable)
            }
        });
    }

    let broker = Broker::connect(
        "test-cluster-leader-unavailable",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();
    let producer = broker.producer(ProducerConf {
        retry_limit: 5,
        retry_wait: Duration::from_millis(1),
        ..ProducerConf::default()
    });

    let mut messages = vec![Message::from_value("first"), Message::from_value("second")];
    let offset = producer.produce("test", 0, &mut messages).await.unwrap();
    assert_eq!(offset, 11);
    assert_eq!(requests.load(Ordering::SeqCst), tries_required + 1);
}

#[tokio::test(start_paused = true)]
async fn produce_does_not_create_topics_unless_allowed() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    let md = MetadataTester::install(&srv, false);

    let produces = Arc::new(AtomicUsize::new(0));
    {
        let produces = Arc::clone(&produces);
        srv.handle(ApiKind::Produce, move |_, _| {
            produces.fetch_add(1, Ordering::SeqCst);
            produce_ok("test2", 0, 5)
        });
    }

    let mut conf = test_conf(&net, "tester");
    conf.allow_topic_creation = false;
    let broker = Broker::connect("test-cluster-no-create-topic", &[srv.addr()], conf)
        .await
        .unwrap();
    let producer = broker.producer(ProducerConf {
        retry_limit: 5,
        retry_wait: Duration::from_millis(1),
        ..ProducerConf::default()
    });

    let mut messages = vec![Message::from_value("first"), Message::from_value("second")];
    let err = producer.produce("test2", 0, &mut messages).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Broker(BrokerError::UnknownTopicOrPartition)
    ));
    assert_eq!(md.num_specific(), 0);
    assert_eq!(produces.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn produce_creates_topic_when_allowed() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    let md = MetadataTester::install(&srv, true);

    let produces = Arc::new(AtomicUsize::new(0));
    {
        let produces = Arc::clone(&produces);
        srv.handle(ApiKind::Produce, move |_, _| {
            produces.fetch_add(1, Ordering::SeqCst);
            produce_ok("test2", 0, 5)
        });
    }

    let mut conf = test_conf(&net, "tester");
    conf.allow_topic_creation = true;
    let broker = Broker::connect("test-cluster-try-create-topic", &[srv.addr()], conf)
        .await
        .unwrap();
    let producer = broker.producer(ProducerConf {
        retry_limit: 5,
        retry_wait: Duration::from_millis(1),
        ..ProducerConf::default()
    });

    let mut messages = vec![Message::from_value("first"), Message::from_value("second")];
    producer.produce("test2", 0, &mut messages).await.unwrap();
    assert_eq!(md.num_specific(), 1);
    assert_eq!(produces.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn consumer_returns_messages_in_order() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    install_partition_413_metadata(&srv);

    let fetch_calls = Arc::new(AtomicUsize::new(0));
    {
        let fetch_calls = Arc::clone(&fetch_calls);
        srv.handle(ApiKind::Fetch, move |_, _| {
            let calls = fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if calls < 2 {
                return fetch_messages("test", 413, 0, vec![]);
            }
            fetch_messages(
                "test",
                413,
                2,
                vec![
                    wire_message(3, "1", "first"),
                    wire_message(4, "2", "second"),
                    wire_message(5, "3", "third"),
                ],
            )
        });
    }

    let broker = Broker::connect(
        "test-cluster-consumer",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();

    let err = broker
        .consumer(ConsumerConf::new("does-not-exist", 413))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Broker(BrokerError::UnknownTopicOrPartition)
    ));
    let err = broker
        .consumer(ConsumerConf::new("test", 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Broker(BrokerError::UnknownTopicOrPartition)
    ));

    let mut conf = ConsumerConf::new("test", 413);
    conf.retry_wait = Duration::from_millis(1);
    conf.start_offset = 0;
    conf.retry_limit = 4;
    let mut consumer = broker.consumer(conf).await.unwrap();

    let msg = consumer.consume().await.unwrap();
    assert_eq!((msg.offset, msg.key.as_slice(), msg.value.as_slice()), (3, b"1".as_ref(), b"first".as_ref()));

    let msg = consumer.consume().await.unwrap();
    assert_eq!((msg.offset, msg.key.as_slice(), msg.value.as_slice()), (4, b"2".as_ref(), b"second".as_ref()));
}

#[tokio::test(start_paused = true)]
async fn batch_consumer_returns_whole_batches() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    install_partition_413_metadata(&srv);

    let fetch_calls = Arc::new(AtomicUsize::new(0));
    {
        let fetch_calls = Arc::clone(&fetch_calls);
        srv.handle(ApiKind::Fetch, move |_, _| {
            let calls = fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if calls < 2 {
                return fetch_messages("test", 413, 0, vec![]);
            }
            fetch_messages(
                "test",
                413,
                2,
                vec![
                    wire_message(3, "1", "first"),
                    wire_message(4, "2", "second"),
                    wire_message(5, "3", "third"),
                ],
            )
        });
    }

    let broker = Broker::connect(
        "test-cluster-batch-consumer",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();

    let err = broker
        .batch_consumer(ConsumerConf::new("does-not-exist", 413))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Broker(BrokerError::UnknownTopicOrPartition)
    ));

    let mut conf = ConsumerConf::new("test", 413);
    conf.retry_wait = Duration::from_millis(1);
    conf.start_offset = 0;
    conf.retry_limit = 4;
    let mut consumer = broker.batch_consumer(conf).await.unwrap();

    let batch = consumer.consume_batch().await.unwrap();
    assert_eq!(batch.len(), 3);
    assert_eq!(batch[0].offset, 3);
    assert_eq!(batch[1].offset, 4);
    assert_eq!(batch[2].offset, 5);
    assert_eq!(batch[2].value, b"third");
}

#[tokio::test(start_paused = true)]
async fn consumer_retries_empty_partition_then_reports_no_data() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    MetadataTester::install(&srv, false);

    let fetch_calls = Arc::new(AtomicUsize::new(0));
    {
        let fetch_calls = Arc::clone(&fetch_calls);
        srv.handle(ApiKind::Fetch, move |_, _| {
            fetch_calls.fetch_add(1, Ordering::SeqCst);
            fetch_messages("test", 0, 0, vec![])
        });
    }

    let broker = Broker::connect(
        "test-cluster-retry",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();

    let mut conf = ConsumerConf::new("test", 0);
    conf.retry_limit = 5;
    conf.start_offset = 0;
    conf.retry_wait = Duration::from_millis(1);
    let mut consumer = broker.consumer(conf).await.unwrap();

    let err = consumer.consume().await.unwrap_err();
    assert!(matches!(err, Error::NoData));
    // The first call plus five retries.
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 6);
}

#[tokio::test(start_paused = true)]
async fn consumer_discards_messages_before_requested_offset() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    MetadataTester::install(&srv, false);

    srv.handle(ApiKind::Fetch, move |_, _| {
        // The batch starts before the requested offset, as a compacted
        // log segment would.
        fetch_messages(
            "test",
            0,
            2,
            vec![
                wire_message(3, "1", "first"),
                wire_message(4, "2", "second"),
                wire_message(5, "3", "third"),
            ],
        )
    });

    let broker = Broker::connect(
        "test-cluster-invalid-offset",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();

    let mut conf = ConsumerConf::new("test", 0);
    conf.start_offset = 4;
    let mut consumer = broker.consumer(conf).await.unwrap();

    let msg = consumer.consume().await.unwrap();
    assert_eq!(msg.offset, 4);
    assert_eq!(msg.value, b"second");
}

#[tokio::test(start_paused = true)]
async fn consumer_seek_to_latest_skips_buffered_messages() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    install_partition_413_metadata(&srv);

    let fetch_calls = Arc::new(AtomicUsize::new(0));
    {
        let fetch_calls = Arc::clone(&fetch_calls);
        srv.handle(ApiKind::Fetch, move |_, _| {
            let calls = fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if calls < 2 {
                return fetch_messages("test", 413, 0, vec![]);
            }
            fetch_messages(
                "test",
                413,
                2,
                vec![
                    wire_message(3, "1", "first"),
                    wire_message(4, "2", "second"),
                    wire_message(5, "3", "third"),
                ],
            )
        });
    }
    srv.handle(ApiKind::Offsets, move |_, _| {
        Some(Response::Offsets(OffsetsResponse {
            topics: vec![OffsetsResponseTopic {
                name: "test".to_string(),
                partitions: vec![OffsetsResponsePartition {
                    partition: 413,
                    error_code: 0,
                    offsets: vec![5, 0],
                }],
            }],
        }))
    });

    let broker = Broker::connect(
        "test-cluster-seek-latest",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();

    let mut conf = ConsumerConf::new("test", 413);
    conf.retry_wait = Duration::from_millis(1);
    conf.start_offset = 0;
    conf.retry_limit = 4;
    let mut consumer = broker.consumer(conf).await.unwrap();

    let msg = consumer.consume().await.unwrap();
    assert_eq!(msg.offset, 3);

    consumer.seek_to_latest().await.unwrap();

    let msg = consumer.consume().await.unwrap();
    assert_eq!(msg.offset, 5);
    assert_eq!(msg.value, b"third");
}

#[tokio::test(start_paused = true)]
async fn consume_while_partition_moves_between_brokers() {
    let net = MemoryNet::new();
    let srv1 = net.start_broker("node-1:9092");
    let srv2 = net.start_broker("node-2:9092");
    let srv3 = net.start_broker("node-3:9092");

    let brokers: Vec<BrokerMetadata> = [(1, &srv1), (2, &srv2), (3, &srv3)]
        .into_iter()
        .map(|(node_id, srv)| {
            let (host, port) = srv.host_port();
            BrokerMetadata {
                node_id,
                host,
                port,
            }
        })
        .collect();

    // Partition 1 starts on node 1, goes leaderless, then lands on node 3.
    let meta_calls = Arc::new(AtomicUsize::new(0));
    for srv in [&srv1, &srv2, &srv3] {
        let meta_calls = Arc::clone(&meta_calls);
        let brokers = brokers.clone();
        srv.handle(ApiKind::Metadata, move |_, _| {
            let calls = meta_calls.fetch_add(1, Ordering::SeqCst) + 1;
            let leader = if calls < 3 {
                1
            } else if calls < 6 {
                -1
            } else {
                3
            };
            Some(Response::Metadata(MetadataResponse {
                brokers: brokers.clone(),
                topics: vec![TopicMetadata {
                    name: "test".to_string(),
                    partitions: vec![
                        PartitionMetadata {
                            id: 0,
                            leader: 1,
                            replicas: vec![1, 2],
                            isr: vec![1, 2],
                            error_code: 0,
                        },
                        PartitionMetadata {
                            id: 1,
                            leader,
                            replicas: vec![1, 2],
                            isr: vec![1, 2],
                            error_code: 0,
                        },
                    ],
                    error_code: 0,
                }],
            }))
        });
    }

    let fetch1_calls = Arc::new(AtomicUsize::new(0));
    {
        let fetch1_calls = Arc::clone(&fetch1_calls);
        srv1.handle(ApiKind::Fetch, move |_, _| {
            let calls = fetch1_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if calls == 1 {
                fetch_messages("test", 1, 4, vec![wire_message(1, "", "first")])
            } else {
                // The partition is no longer ours.
                fetch_err("test", 1, BrokerError::UnknownTopicOrPartition)
            }
        });
    }
    let fetch2_calls = Arc::new(AtomicUsize::new(0));
    {
        let fetch2_calls = Arc::clone(&fetch2_calls);
        srv2.handle(ApiKind::Fetch, move |_, _| {
            fetch2_calls.fetch_add(1, Ordering::SeqCst);
            fetch_err("test", 1, BrokerError::NotLeaderForPartition)
        });
    }
    let fetch3_calls = Arc::new(AtomicUsize::new(0));
    {
        let fetch3_calls = Arc::clone(&fetch3_calls);
        let meta_calls = Arc::clone(&meta_calls);
        srv3.handle(ApiKind::Fetch, move |_, _| {
            fetch3_calls.fetch_add(1, Ordering::SeqCst);
            if meta_calls.load(Ordering::SeqCst) < 6 {
                fetch_err("test", 1, BrokerError::UnknownTopicOrPartition)
            } else {
                fetch_messages("test", 1, 8, vec![wire_message(2, "", "second")])
            }
        });
    }

    let broker = Broker::connect(
        "test-cluster-partition-moves",
        &[srv1.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();

    let mut conf = ConsumerConf::new("test", 1);
    conf.start_offset = 0;
    conf.retry_wait = Duration::from_millis(1);
    let mut consumer = broker.consumer(conf).await.unwrap();

    // Once from node 1 and once from node 3; node 2 never leads the
    // partition and is never fetched from.
    let msg = consumer.consume().await.unwrap();
    assert_eq!(msg.offset, 1);
    let msg = consumer.consume().await.unwrap();
    assert_eq!(msg.offset, 2);

    assert_eq!(meta_calls.load(Ordering::SeqCst), 6);
    assert_eq!(fetch1_calls.load(Ordering::SeqCst), 3);
    assert_eq!(fetch2_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fetch3_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn partition_offset_rides_through_transient_errors() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    let md = MetadataTester::install(&srv, false);

    let handler_err: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let offset_calls = Arc::new(AtomicUsize::new(0));
    {
        let handler_err = Arc::clone(&handler_err);
        let offset_calls = Arc::clone(&offset_calls);
        srv.handle(ApiKind::Offsets, move |_, request| {
            let Request::Offsets(request) = request else {
                return None;
            };
            if request.replica_id != -1 {
                *handler_err.lock().unwrap() =
                    Some(format!("expected replica -1, got {}", request.replica_id));
            }
            let time_ms = request.topics[0].partitions[0].time_ms;
            if time_ms != -2 {
                *handler_err.lock().unwrap() = Some(format!("expected time -2, got {time_ms}"));
            }

            let calls = offset_calls.fetch_add(1, Ordering::SeqCst) + 1;
            let error_code = if calls < 3 {
                BrokerError::LeaderNotAvailable.code()
            } else {
                0
            };
            Some(Response::Offsets(OffsetsResponse {
                topics: vec![OffsetsResponseTopic {
                    name: "test".to_string(),
                    partitions: vec![OffsetsResponsePartition {
                        partition: 1,
                        error_code,
                        offsets: vec![123, 0],
                    }],
                }],
            }))
        });
    }

    let broker = Broker::connect(
        "test-cluster-partition-offset",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();

    assert_eq!(md.num_general(), 1);
    let offset = broker.offset_earliest("test", 1).await.unwrap();
    assert_eq!(handler_err.lock().unwrap().take(), None);
    assert_eq!(offset, 123);
    // Initial fetch plus one per leader-not-available response.
    assert_eq!(md.num_general(), 3);
}

#[tokio::test]
async fn partition_count_follows_the_snapshot() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    MetadataTester::install(&srv, false);

    let broker = Broker::connect(
        "test-cluster-partition-count",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();

    assert_eq!(broker.cluster().partition_count("test").unwrap(), 2);
    assert!(matches!(
        broker.cluster().partition_count("test2"),
        Err(Error::Broker(BrokerError::UnknownTopicOrPartition))
    ));
}

#[tokio::test(start_paused = true)]
async fn partition_offset_fails_over_when_leader_dies() {
    let net = MemoryNet::new();
    let srv1 = net.start_broker("node-1:9092");
    let srv2 = net.start_broker("node-2:9092");

    let (host1, port1) = srv1.host_port();
    let (host2, port2) = srv2.host_port();
    let brokers = vec![
        BrokerMetadata {
            node_id: 1,
            host: host1,
            port: port1,
        },
        BrokerMetadata {
            node_id: 2,
            host: host2,
            port: port2,
        },
    ];

    let metadata = |leader: i32, brokers: Vec<BrokerMetadata>| {
        move |_: &RequestHeader, _: Request| {
            Some(Response::Metadata(MetadataResponse {
                brokers: brokers.clone(),
                topics: vec![TopicMetadata {
                    name: "test".to_string(),
                    partitions: vec![
                        PartitionMetadata {
                            id: 0,
                            leader,
                            replicas: vec![1, 2],
                            isr: vec![1, 2],
                            error_code: 0,
                        },
                        PartitionMetadata {
                            id: 1,
                            leader,
                            replicas: vec![1, 2],
                            isr: vec![1, 2],
                            error_code: 0,
                        },
                    ],
                    error_code: 0,
                }],
            }))
        }
    };
    srv1.handle(ApiKind::Metadata, metadata(1, brokers.clone()));
    srv2.handle(ApiKind::Metadata, metadata(2, brokers.clone()));

    let offsets = |value: i64| {
        move |_: &RequestHeader, _: Request| {
            Some(Response::Offsets(OffsetsResponse {
                topics: vec![OffsetsResponseTopic {
                    name: "test".to_string(),
                    partitions: vec![OffsetsResponsePartition {
                        partition: 1,
                        error_code: 0,
                        offsets: vec![value, 0],
                    }],
                }],
            }))
        }
    };
    srv1.handle(ApiKind::Offsets, offsets(123));
    srv2.handle(ApiKind::Offsets, offsets(234));

    let broker = Broker::connect(
        "test-cluster-closed-conn",
        &[srv1.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();

    assert_eq!(broker.offset_earliest("test", 1).await.unwrap(), 123);
    assert_eq!(broker.pool().get_all_addrs().len(), 2);

    // Kill the leader: the next lookup forgets it, refreshes through the
    // survivor and retargets, whether the dead connection is noticed on
    // first use or on dial.
    srv1.close();
    assert_eq!(broker.offset_earliest("test", 1).await.unwrap(), 234);
}

#[tokio::test(start_paused = true)]
async fn produce_fails_over_when_leader_connection_breaks() {
    let net = MemoryNet::new();
    let srv1 = net.start_broker("node-1:9092");
    let srv2 = net.start_broker("node-2:9092");

    let (host1, port1) = srv1.host_port();
    let (host2, port2) = srv2.host_port();
    let brokers = vec![
        BrokerMetadata {
            node_id: 1,
            host: host1,
            port: port1,
        },
        BrokerMetadata {
            node_id: 2,
            host: host2,
            port: port2,
        },
    ];

    let metadata = |leader: i32, brokers: Vec<BrokerMetadata>| {
        move |_: &RequestHeader, _: Request| {
            Some(Response::Metadata(MetadataResponse {
                brokers: brokers.clone(),
                topics: vec![TopicMetadata {
                    name: "test".to_string(),
                    partitions: vec![PartitionMetadata {
                        id: 0,
                        leader,
                        replicas: vec![1, 2],
                        isr: vec![1, 2],
                        error_code: 0,
                    }],
                    error_code: 0,
                }],
            }))
        }
    };
    srv1.handle(ApiKind::Metadata, metadata(1, brokers.clone()));
    srv2.handle(ApiKind::Metadata, metadata(2, brokers.clone()));
    srv1.handle(ApiKind::Produce, |_, _| produce_ok("test", 0, 3));
    srv2.handle(ApiKind::Produce, |_, _| produce_ok("test", 0, 30));

    let broker = Broker::connect(
        "test-cluster-broken-pipe",
        &[srv1.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();
    let producer = broker.producer(test_producer_conf());

    let mut messages = vec![Message::from_value("first")];
    assert_eq!(producer.produce("test", 0, &mut messages).await.unwrap(), 3);

    srv1.close();
    let mut messages = vec![Message::from_value("second")];
    assert_eq!(
        producer.produce("test", 0, &mut messages).await.unwrap(),
        30
    );
}

#[tokio::test(start_paused = true)]
async fn closed_broker_refuses_further_work() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    MetadataTester::install(&srv, false);
    srv.handle(ApiKind::Produce, |_, _| produce_ok("test", 0, 1));

    let broker = Broker::connect(
        "test-cluster-close",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();
    let producer = broker.producer(test_producer_conf());

    let mut messages = vec![Message::from_value("first")];
    producer.produce("test", 0, &mut messages).await.unwrap();

    broker.close();
    assert!(broker.pool().is_closed());

    // Metadata refreshes must not resurrect the closed pool either.
    broker.cluster().refresh_metadata().await.unwrap();
    assert!(broker.pool().get_all_addrs().is_empty());

    let mut messages = vec![Message::from_value("second")];
    let err = producer.produce("test", 0, &mut messages).await.unwrap_err();
    assert!(matches!(err, Error::Closed));
}

#[tokio::test(start_paused = true)]
async fn offset_coordinator_commits_and_fetches() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    MetadataTester::install(&srv, false);

    let (host, port) = srv.host_port();
    srv.handle(ApiKind::GroupCoordinator, move |_, _| {
        Some(Response::GroupCoordinator(GroupCoordinatorResponse {
            error_code: 0,
            coordinator_id: 1,
            host: host.clone(),
            port,
        }))
    });

    let committed: Arc<Mutex<Option<i64>>> = Arc::new(Mutex::new(None));
    {
        let committed = Arc::clone(&committed);
        srv.handle(ApiKind::OffsetCommit, move |_, request| {
            let Request::OffsetCommit(request) = request else {
                return None;
            };
            *committed.lock().unwrap() = Some(request.topics[0].partitions[0].offset);
            Some(Response::OffsetCommit(OffsetCommitResponse {
                topics: vec![OffsetCommitResponseTopic {
                    name: "first-topic".to_string(),
                    partitions: vec![OffsetCommitResponsePartition {
                        partition: 0,
                        error_code: 0,
                    }],
                }],
            }))
        });
    }
    {
        let committed = Arc::clone(&committed);
        srv.handle(ApiKind::OffsetFetch, move |_, _| {
            let partition = match *committed.lock().unwrap() {
                None => OffsetFetchResponsePartition {
                    partition: 0,
                    offset: 0,
                    metadata: String::new(),
                    error_code: BrokerError::UnknownTopicOrPartition.code(),
                },
                Some(offset) => OffsetFetchResponsePartition {
                    partition: 0,
                    offset,
                    metadata: "random data".to_string(),
                    error_code: 0,
                },
            };
            Some(Response::OffsetFetch(OffsetFetchResponse {
                topics: vec![OffsetFetchResponseTopic {
                    name: "first-topic".to_string(),
                    partitions: vec![partition],
                }],
            }))
        });
    }

    let broker = Broker::connect(
        "test-cluster-offset-coordinator",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();
    let coordinator = broker
        .offset_coordinator(OffsetCoordinatorConf::new("test-group"))
        .await
        .unwrap();

    assert!(coordinator.offset("does-not-exist", 1423).await.is_err());
    let err = coordinator.offset("first-topic", 0).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Broker(BrokerError::UnknownTopicOrPartition)
    ));

    coordinator.commit("first-topic", 0, 421).await.unwrap();

    let (offset, metadata) = coordinator.offset("first-topic", 0).await.unwrap();
    assert_eq!(offset, 421);
    assert_eq!(metadata, "random data");
}

#[tokio::test(start_paused = true)]
async fn offset_coordinator_surfaces_missing_coordinator() {
    let net = MemoryNet::new();
    let srv = net.start_broker("node-1:9092");
    MetadataTester::install(&srv, false);

    srv.handle(ApiKind::GroupCoordinator, |_, _| {
        Some(Response::GroupCoordinator(GroupCoordinatorResponse {
            error_code: BrokerError::NoCoordinator.code(),
            coordinator_id: 0,
            host: String::new(),
            port: 0,
        }))
    });

    let broker = Broker::connect(
        "test-cluster-not-coordinator",
        &[srv.addr()],
        test_conf(&net, "tester"),
    )
    .await
    .unwrap();
    let coordinator = broker
        .offset_coordinator(OffsetCoordinatorConf::new("test-group"))
        .await
        .unwrap();

    let err = coordinator.commit("foo", 0, 10).await.unwrap_err();
    assert!(matches!(err, Error::Broker(BrokerError::NoCoordinator)));
}
