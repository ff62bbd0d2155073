//! Byte-stream collaborator.
//!
//! Everything in this crate talks to hardware through [`SerialPort`]: a
//! duplex object with `read`, `write` and `close`. A read of 0 bytes means
//! end-of-stream; partial reads and writes are expected and tolerated.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use buslet_sync::pipe::{self, PipeEnd, PipeReadError, PipeWriteError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// A duplex byte stream (serial line, socket, in-memory pair).
#[async_trait]
pub trait SerialPort: Send + Sync {
    /// Reads up to `buf.len()` bytes. `Ok(0)` means end-of-stream.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes a prefix of `buf`, returning how many bytes were accepted.
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    async fn close(&self) -> io::Result<()>;
}

/// Writes all of `buf`, looping over partial writes.
pub(crate) async fn write_all(port: &dyn SerialPort, buf: &[u8]) -> io::Result<()> {
    let mut offset = 0;
    while offset < buf.len() {
        let n = port.write(&buf[offset..]).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        offset += n;
    }
    Ok(())
}

/// Adapter exposing any tokio stream as a [`SerialPort`].
pub struct StreamPort<S> {
    reader: tokio::sync::Mutex<ReadHalf<S>>,
    writer: tokio::sync::Mutex<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Send> StreamPort<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send> SerialPort for StreamPort<S> {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().await.read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.writer.lock().await.write(buf).await
    }

    async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

/// In-memory serial port over a crossed pipe pair. The standard test
/// double: what one side writes, the other reads.
pub struct PipePort {
    end: PipeEnd,
}

#[async_trait]
impl SerialPort for PipePort {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.end.read(buf).await {
            Ok(n) => Ok(n),
            // Drained and closed: end-of-stream.
            Err(PipeReadError::Closed) => Ok(0),
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self.end.write(buf).await {
            Ok(n) => Ok(n),
            Err(PipeWriteError::Closed { written: 0 }) => {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            Err(PipeWriteError::Closed { written }) => Ok(written),
            Err(PipeWriteError::Full | PipeWriteError::Truncated { .. }) => {
                Err(io::ErrorKind::WouldBlock.into())
            }
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.end.close();
        Ok(())
    }
}

/// Creates two connected in-memory ports. `capacity` bounds each direction
/// in bytes; 0 means unbounded.
pub fn loopback(capacity: usize) -> (Arc<PipePort>, Arc<PipePort>) {
    let (a, b) = pipe::duplex(capacity);
    (Arc::new(PipePort { end: a }), Arc::new(PipePort { end: b }))
}
