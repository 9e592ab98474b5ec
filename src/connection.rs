//! A single connection to one broker process.
//!
//! Requests are stamped with a monotonically increasing correlation id and
//! written to the transport; a background reader task decodes incoming
//! frames and routes each response to the waiter registered under its
//! correlation id. Any I/O failure (read or write side) marks the
//! connection closed before the error surfaces, and every operation against
//! a closed connection fails with [`Error::Closed`] without touching the
//! transport.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::{
    io::{ReadHalf, WriteHalf},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    transport::{read_frame, write_frame, BoxedStream},
    wire::{
        FetchRequest, FetchResponse, GroupCoordinatorRequest, GroupCoordinatorResponse,
        MetadataRequest, MetadataResponse, OffsetCommitRequest, OffsetCommitResponse,
        OffsetFetchRequest, OffsetFetchResponse, OffsetsRequest, OffsetsResponse, ProduceRequest,
        ProduceResponse, Request, RequestHeader, Response, Serializer,
    },
};

/// Waiters keyed by correlation id. `None` once the connection is closed,
/// so late registrations fail instead of hanging.
type Pending = Arc<Mutex<Option<HashMap<i32, oneshot::Sender<Response>>>>>;

pub struct Connection {
    addr: String,
    client_id: String,
    serializer: Arc<dyn Serializer>,
    correlation_id: AtomicI32,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    pub fn new(
        stream: BoxedStream,
        addr: impl Into<String>,
        client_id: impl Into<String>,
        serializer: Arc<dyn Serializer>,
    ) -> Arc<Self> {
        let addr = addr.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            read_half,
            addr.clone(),
            Arc::clone(&serializer),
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Arc::new(Self {
            addr,
            client_id: client_id.into(),
            serializer,
            correlation_id: AtomicI32::new(0),
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            closed,
            reader,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the connection closed and fails every in-flight request.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(addr = %self.addr, "closing connection");
            self.reader.abort();
            self.pending.lock().take();
        }
    }

    /// Issues `request` and waits for the response with the matching
    /// correlation id.
    pub async fn request(&self, request: Request) -> Result<Response> {
        let (correlation_id, payload) = self.encode(&request)?;

        let (tx, rx) = oneshot::channel();
        match self.pending.lock().as_mut() {
            Some(waiters) => {
                waiters.insert(correlation_id, tx);
            }
            None => return Err(Error::Closed),
        }

        if let Err(e) = self.write(&payload).await {
            if let Some(waiters) = self.pending.lock().as_mut() {
                waiters.remove(&correlation_id);
            }
            return Err(e);
        }

        // A dropped sender means the reader tore the connection down.
        rx.await.map_err(|_| Error::Closed)
    }

    /// Writes `request` without waiting for any response; used for produce
    /// requests with `RequiredAcks::None`.
    pub async fn send(&self, request: Request) -> Result<()> {
        let (_, payload) = self.encode(&request)?;
        self.write(&payload).await
    }

    fn encode(&self, request: &Request) -> Result<(i32, Vec<u8>)> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let correlation_id = self.correlation_id.fetch_add(1, Ordering::SeqCst);
        let header = RequestHeader {
            api_kind: request.api_kind(),
            correlation_id,
            client_id: self.client_id.clone(),
        };
        let payload = self.serializer.encode_request(&header, request)?;
        Ok((correlation_id, payload))
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if let Err(e) = write_frame(&mut *writer, payload).await {
            drop(writer);
            self.close();
            return Err(Error::Io(e));
        }
        Ok(())
    }

    pub async fn metadata(&self, request: MetadataRequest) -> Result<MetadataResponse> {
        match self.request(Request::Metadata(request)).await? {
            Response::Metadata(resp) => Ok(resp),
            other => Err(unexpected(&other)),
        }
    }

    /// A produce with `required_acks == 0` returns `None` without reading
    /// anything back.
    pub async fn produce(&self, request: ProduceRequest) -> Result<Option<ProduceResponse>> {
        if request.required_acks == 0 {
            self.send(Request::Produce(request)).await?;
            return Ok(None);
        }
        match self.request(Request::Produce(request)).await? {
            Response::Produce(resp) => Ok(Some(resp)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        match self.request(Request::Fetch(request)).await? {
            Response::Fetch(resp) => Ok(resp),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn offsets(&self, request: OffsetsRequest) -> Result<OffsetsResponse> {
        match self.request(Request::Offsets(request)).await? {
            Response::Offsets(resp) => Ok(resp),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn group_coordinator(
        &self,
        request: GroupCoordinatorRequest,
    ) -> Result<GroupCoordinatorResponse> {
        match self.request(Request::GroupCoordinator(request)).await? {
            Response::GroupCoordinator(resp) => Ok(resp),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn offset_commit(&self, request: OffsetCommitRequest) -> Result<OffsetCommitResponse> {
        match self.request(Request::OffsetCommit(request)).await? {
            Response::OffsetCommit(resp) => Ok(resp),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn offset_fetch(&self, request: OffsetFetchRequest) -> Result<OffsetFetchResponse> {
        match self.request(Request::OffsetFetch(request)).await? {
            Response::OffsetFetch(resp) => Ok(resp),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> Error {
    Error::InvalidResponse(format!(
        "response kind {:?} does not match the request",
        response.api_kind()
    ))
}

async fn read_loop(
    mut read_half: ReadHalf<BoxedStream>,
    addr: String,
    serializer: Arc<dyn Serializer>,
    pending: Pending,
    closed: Arc<AtomicBool>,
) {
    loop {
        let payload = match read_frame(&mut read_half).await {
            Ok(payload) => payload,
            Err(e) => {
                debug!(addr = %addr, error = %e, "connection reader terminating");
                break;
            }
        };
        match serializer.decode_response(&payload) {
            Ok((correlation_id, response)) => {
                let waiter = pending
                    .lock()
                    .as_mut()
                    .and_then(|waiters| waiters.remove(&correlation_id));
                match waiter {
                    // The waiter may have given up; that is fine.
                    Some(tx) => {
                        tx.send(response).ok();
                    }
                    None => debug!(addr = %addr, correlation_id, "response without waiter"),
                }
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "cannot decode response");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every in-flight request with `Closed`.
    pending.lock().take();
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("client_id", &self.client_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
