use std::io::ErrorKind;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::codec::Encode;
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 256;

/// Writes complete frames to any `AsyncWrite` stream.
///
/// `write_frame` is not cancel-safe: dropping it part way can leave a partial
/// frame on the wire. Callers that may be cancelled must run the write in a
/// task of its own.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: AsyncWrite + Unpin> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Encode, write and flush one frame.
    pub async fn write_frame<F: Encode>(&mut self, frame: &F) -> Result<()> {
        self.buf.clear();
        frame.encode(&mut self.buf);

        self.inner.write_all(&self.buf).await.map_err(map_write_error)?;
        self.inner.flush().await.map_err(map_write_error)
    }

    /// Shut down the write half of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await.map_err(map_write_error)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

fn map_write_error(err: std::io::Error) -> FrameError {
    match err.kind() {
        ErrorKind::WriteZero | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => {
            FrameError::ConnectionClosed
        }
        _ => FrameError::Io(err),
    }
}
