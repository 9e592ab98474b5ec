//! In-memory broker cluster for tests.
//!
//! [`MemoryNet`] is a [`Dialer`] whose "network" is a map of synthetic
//! endpoint names to in-process brokers; dialing yields one half of a
//! [`tokio::io::duplex`] pipe. A [`TestBroker`] answers requests through
//! registered per-kind handlers, counts every request it processes, and
//! answers metadata requests about itself out of the box, so client
//! bootstrap works without any setup.

use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{io::DuplexStream, task::JoinHandle};

use crate::{
    transport::{read_frame, write_frame, BoxedStream, Dialer},
    wire::{
        ApiKind, BincodeCodec, BrokerMetadata, MetadataResponse, Request, RequestHeader, Response,
        Serializer,
    },
};

pub type Handler = Box<dyn Fn(&RequestHeader, Request) -> Option<Response> + Send + Sync>;

struct BrokerInner {
    host: String,
    port: i32,
    serializer: Arc<dyn Serializer>,
    handlers: Mutex<HashMap<ApiKind, Handler>>,
    processed: AtomicUsize,
    request_delay: Mutex<Duration>,
    running: AtomicBool,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerInner {
    fn dispatch(&self, header: &RequestHeader, request: Request) -> Dispatch {
        let handlers = self.handlers.lock();
        if let Some(handler) = handlers.get(&header.api_kind) {
            return Dispatch::Handled(handler(header, request));
        }
        drop(handlers);
        // Without a registered handler, a broker still knows itself.
        if header.api_kind == ApiKind::Metadata {
            return Dispatch::Handled(Some(Response::Metadata(MetadataResponse {
                brokers: vec![BrokerMetadata {
                    node_id: 1,
                    host: self.host.clone(),
                    port: self.port,
                }],
                topics: vec![],
            })));
        }
        Dispatch::Unhandled
    }
}

enum Dispatch {
    Handled(Option<Response>),
    Unhandled,
}

/// In-process "network" of test brokers, usable as the cluster dialer.
#[derive(Default)]
pub struct MemoryNet {
    brokers: Mutex<HashMap<String, Arc<BrokerInner>>>,
}

impl MemoryNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Starts a broker reachable under `addr` (a `host:port` string).
    pub fn start_broker(self: &Arc<Self>, addr: &str) -> TestBroker {
        let (host, port) = split_addr(addr);
        let inner = Arc::new(BrokerInner {
            host,
            port,
            serializer: Arc::new(BincodeCodec),
            handlers: Mutex::new(HashMap::new()),
            processed: AtomicUsize::new(0),
            request_delay: Mutex::new(Duration::ZERO),
            running: AtomicBool::new(true),
            connections: Mutex::new(Vec::new()),
        });
        self.brokers.lock().insert(addr.to_string(), Arc::clone(&inner));
        TestBroker {
            addr: addr.to_string(),
            inner,
        }
    }
}

#[async_trait]
impl Dialer for MemoryNet {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        let broker = self.brokers.lock().get(addr).cloned();
        let broker = match broker {
            Some(broker) if broker.running.load(Ordering::SeqCst) => broker,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("no broker listening on {addr}"),
                ))
            }
        };

        let (client_end, server_end) = tokio::io::duplex(256 * 1024);
        let task = tokio::spawn(serve(Arc::clone(&broker), server_end));
        broker.connections.lock().push(task);
        Ok(Box::new(client_end))
    }
}

impl std::fmt::Debug for MemoryNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNet")
            .field("brokers", &self.brokers.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

async fn serve(broker: Arc<BrokerInner>, stream: DuplexStream) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        let (header, request) = match broker.serializer.decode_request(&frame) {
            Ok(decoded) => decoded,
            Err(_) => return,
        };
        broker.processed.fetch_add(1, Ordering::SeqCst);

        let delay = *broker.request_delay.lock();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        if !broker.running.load(Ordering::SeqCst) {
            return;
        }

        match broker.dispatch(&header, request) {
            Dispatch::Handled(Some(response)) => {
                let frame = match broker
                    .serializer
                    .encode_response(header.correlation_id, &response)
                {
                    Ok(frame) => frame,
                    Err(_) => return,
                };
                if write_frame(&mut writer, &frame).await.is_err() {
                    return;
                }
            }
            // Handled with silence (e.g. produce without acks).
            Dispatch::Handled(None) => {}
            // No handler: drop the connection, as a confused peer would.
            Dispatch::Unhandled => return,
        }
    }
}

/// Handle on one in-memory broker.
pub struct TestBroker {
    addr: String,
    inner: Arc<BrokerInner>,
}

impl TestBroker {
    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    pub fn host_port(&self) -> (String, i32) {
        (self.inner.host.clone(), self.inner.port)
    }

    /// Registers the handler for one request kind, replacing any previous
    /// one.
    pub fn handle<F>(&self, kind: ApiKind, handler: F)
    where
        F: Fn(&RequestHeader, Request) -> Option<Response> + Send + Sync + 'static,
    {
        self.inner.handlers.lock().insert(kind, Box::new(handler));
    }

    /// Requests processed so far, of any kind.
    pub fn processed(&self) -> usize {
        self.inner.processed.load(Ordering::SeqCst)
    }

    /// Delays every response by `delay`; handy for provoking overlapping
    /// metadata refreshes.
    pub fn set_request_delay(&self, delay: Duration) {
        *self.inner.request_delay.lock() = delay;
    }

    /// Stops accepting dials and severs every live connection.
    pub fn close(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        for task in self.inner.connections.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for TestBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestBroker")
            .field("addr", &self.addr)
            .field("processed", &self.processed())
            .finish()
    }
}

fn split_addr(addr: &str) -> (String, i32) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().expect("test broker port must be numeric"),
        ),
        None => (addr.to_string(), 9092),
    }
}
