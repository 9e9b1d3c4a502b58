use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::codec::{Decode, FrameConfig};
use crate::error::{FrameError, Result};

/// Reads complete frames from any `AsyncRead` stream.
///
/// Handles partial reads internally; callers always get complete frames.
/// `read_frame` is cancel-safe: bytes already received stay buffered in the
/// reader and are used by the next call.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: AsyncRead + Unpin> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(config.read_buffer_capacity),
            config,
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF falls on a frame
    /// boundary and `Err(FrameError::IncompleteFrame)` when it does not.
    pub async fn read_frame<F: Decode>(&mut self) -> Result<F> {
        loop {
            match F::decode(&mut self.buf) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(err) => {
                    debug!(buffered = self.buf.len(), error = %err, "undecodable frame");
                    return Err(err);
                }
            }

            self.buf.reserve(self.config.read_buffer_capacity);
            let read = self.inner.read_buf(&mut self.buf).await?;
            trace!(read, buffered = self.buf.len(), "read from stream");

            if read == 0 {
                if self.buf.is_empty() {
                    return Err(FrameError::ConnectionClosed);
                }
                debug!(buffered = self.buf.len(), "stream ended inside a frame");
                return Err(FrameError::IncompleteFrame {
                    buffered: self.buf.len(),
                });
            }
        }
    }

    /// Number of bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::codec::{encode_inbound, Inbound, InboundFrame, Timestamp};
    use crate::records::{Command, CommandCode, CommandStatus, CommandStatusCode, Config};

    fn status_frame(counter: u32) -> InboundFrame {
        InboundFrame::new(
            0x1234,
            counter as u16,
            Timestamp::new(10, 0),
            Inbound::CommandStatus(CommandStatus::new(counter, CommandStatusCode::Ack, 0.0)),
        )
    }

    #[tokio::test]
    async fn read_multiple_frames() {
        let mut wire = BytesMut::new();
        encode_inbound(&status_frame(1), &mut wire);
        encode_inbound(&status_frame(2), &mut wire);

        let bytes = wire.to_vec();
        let mut reader = FrameReader::new(bytes.as_slice());

        let f1: InboundFrame = reader.read_frame().await.unwrap();
        let f2: InboundFrame = reader.read_frame().await.unwrap();
        assert_eq!(f1, status_frame(1));
        assert_eq!(f2, status_frame(2));

        let err = reader.read_frame::<InboundFrame>().await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[tokio::test]
    async fn connection_closed_mid_frame() {
        let mut wire = BytesMut::new();
        encode_inbound(&status_frame(1), &mut wire);
        wire.truncate(wire.len() - 3);

        let bytes = wire.to_vec();
        let mut reader = FrameReader::new(bytes.as_slice());
        let err = reader.read_frame::<InboundFrame>().await.unwrap_err();
        assert!(matches!(err, FrameError::IncompleteFrame { buffered } if buffered == bytes.len()));
    }

    #[tokio::test]
    async fn unknown_frame_id_in_stream() {
        let bytes = [0x34u8, 0x12, 0x02, 0x00, 0x00, 0x00];
        let mut reader = FrameReader::new(&bytes[..]);
        let err = reader.read_frame::<InboundFrame>().await.unwrap_err();
        assert!(matches!(err, FrameError::UnknownFrameId(0x02)));
    }

    #[tokio::test]
    async fn partial_writes_are_reassembled() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx);

        let frame = InboundFrame::new(
            0x1234,
            0,
            Timestamp::new(1, 1),
            Inbound::Config(Config {
                min_position: -1.0,
                max_position: 1.0,
                max_velocity: 0.5,
            }),
        );
        let mut wire = BytesMut::new();
        encode_inbound(&frame, &mut wire);

        let writer = tokio::spawn(async move {
            for chunk in wire.chunks(5) {
                tx.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let decoded: InboundFrame = reader.read_frame().await.unwrap();
        assert_eq!(decoded, frame);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_read_keeps_buffered_bytes() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut reader = FrameReader::new(rx);

        let mut command = Command::with_param1(CommandCode::Move, 3.0);
        command.counter = 5;
        let mut wire = BytesMut::new();
        crate::codec::encode_command(&command, &mut wire);

        tx.write_all(&wire[..20]).await.unwrap();
        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), reader.read_frame::<Command>()).await;
        assert!(timed_out.is_err());
        assert_eq!(reader.buffered(), 20);

        tx.write_all(&wire[20..]).await.unwrap();
        let decoded: Command = reader.read_frame().await.unwrap();
        assert_eq!(decoded, command);
    }
}
