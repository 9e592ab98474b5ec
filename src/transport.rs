//! Raw transport: dialing and length-prefixed frames.
//!
//! The dialer is an injected seam so tests can run an entire cluster
//! in-memory; [`TcpDialer`] is the production implementation. Frames are an
//! i32 big-endian payload length followed by the payload, with an upper
//! bound to protect against garbage on the wire.

use std::{fmt, io};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

/// Upper bound on a single frame, enforced on read.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Byte stream to a single broker process.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Opens byte streams to broker endpoints.
#[async_trait]
pub trait Dialer: Send + Sync + fmt::Debug {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream>;
}

/// Dials brokers over plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", payload.len()),
        ));
    }
    writer.write_i32(payload.len() as i32).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

pub async fn read_frame<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_i32().await?;
    if len < 0 || len as usize > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length {len}"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}
