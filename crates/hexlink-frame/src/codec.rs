use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{FrameError, Result};
use crate::frame_id::FrameId;
use crate::records::{Command, CommandStatus, Config, Telemetry};

/// Inbound header: sync (2) + frame id (2) + counter (2) + sec (8) + nsec (8).
pub const HEADER_SIZE: usize = 22;

/// Default read buffer capacity; comfortably holds several telemetry frames.
pub const DEFAULT_READ_BUFFER: usize = 4 * 1024;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A fixed-size, packed, little-endian record.
///
/// `get` may assume `src` holds at least `SIZE` bytes; callers check first.
pub trait WireRecord: Sized {
    /// Exact encoded size in bytes.
    const SIZE: usize;

    fn put(&self, dst: &mut BytesMut);

    fn get<B: Buf>(src: &mut B) -> Self;
}

/// A message that can be pulled off the front of a receive buffer.
pub trait Decode: Sized {
    /// Returns `Ok(None)` until the buffer holds a complete message.
    fn decode(src: &mut BytesMut) -> Result<Option<Self>>;
}

/// A message that can be appended to a send buffer.
pub trait Encode {
    fn encode(&self, dst: &mut BytesMut);
}

/// Seconds and nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: i64,
}

impl Timestamp {
    pub fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    /// Current wall-clock time. A clock set before 1970 reads as zero.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: elapsed.as_secs() as i64,
            nsec: i64::from(elapsed.subsec_nanos()),
        }
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        let sec = secs.floor();
        let nsec = ((secs - sec) * NANOS_PER_SEC as f64).round() as i64;
        if nsec >= NANOS_PER_SEC {
            Self::new(sec as i64 + 1, nsec - NANOS_PER_SEC)
        } else {
            Self::new(sec as i64, nsec)
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 / NANOS_PER_SEC as f64
    }
}

/// Header preceding every inbound body.
///
/// Wire layout (22 bytes):
/// ```text
/// ┌──────────┬──────────┬──────────┬──────────────┬──────────────┐
/// │ sync     │ frame id │ counter  │ tai sec      │ tai nsec     │
/// │ (2B LE)  │ (2B LE)  │ (2B LE)  │ (8B i64 LE)  │ (8B i64 LE)  │
/// └──────────┴──────────┴──────────┴──────────────┴──────────────┘
/// ```
/// `frame_id` is kept raw so a header can be inspected before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub sync_pattern: u16,
    pub frame_id: u16,
    /// Wrapping per-kind frame counter.
    pub counter: u16,
    pub timestamp: Timestamp,
}

impl Header {
    pub fn new(sync_pattern: u16, frame_id: FrameId, counter: u16, timestamp: Timestamp) -> Self {
        Self {
            sync_pattern,
            frame_id: frame_id.into(),
            counter,
            timestamp,
        }
    }

    pub fn kind(&self) -> Result<FrameId> {
        FrameId::try_from(self.frame_id)
    }
}

impl WireRecord for Header {
    const SIZE: usize = HEADER_SIZE;

    fn put(&self, dst: &mut BytesMut) {
        dst.put_u16_le(self.sync_pattern);
        dst.put_u16_le(self.frame_id);
        dst.put_u16_le(self.counter);
        dst.put_i64_le(self.timestamp.sec);
        dst.put_i64_le(self.timestamp.nsec);
    }

    fn get<B: Buf>(src: &mut B) -> Self {
        Self {
            sync_pattern: src.get_u16_le(),
            frame_id: src.get_u16_le(),
            counter: src.get_u16_le(),
            timestamp: Timestamp {
                sec: src.get_i64_le(),
                nsec: src.get_i64_le(),
            },
        }
    }
}

/// Body of an inbound frame, selected by the header's frame id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Inbound {
    CommandStatus(CommandStatus),
    Config(Config),
    Telemetry(Telemetry),
}

impl Inbound {
    pub fn frame_id(&self) -> FrameId {
        match self {
            Inbound::CommandStatus(_) => FrameId::CommandStatus,
            Inbound::Config(_) => FrameId::Config,
            Inbound::Telemetry(_) => FrameId::Telemetry,
        }
    }

    fn put(&self, dst: &mut BytesMut) {
        match self {
            Inbound::CommandStatus(status) => status.put(dst),
            Inbound::Config(config) => config.put(dst),
            Inbound::Telemetry(telemetry) => telemetry.put(dst),
        }
    }
}

/// A header and the body it announces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InboundFrame {
    pub header: Header,
    pub body: Inbound,
}

impl InboundFrame {
    /// Build a frame whose header frame id matches `body`.
    pub fn new(sync_pattern: u16, counter: u16, timestamp: Timestamp, body: Inbound) -> Self {
        Self {
            header: Header::new(sync_pattern, body.frame_id(), counter, timestamp),
            body,
        }
    }

    /// Total encoded size.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.body.frame_id().body_size()
    }
}

/// Append a single record to `dst`.
pub fn encode_record<R: WireRecord>(record: &R, dst: &mut BytesMut) {
    dst.reserve(R::SIZE);
    record.put(dst);
}

/// Decode a single record from the front of `src`.
///
/// Trailing bytes are ignored; fewer than `R::SIZE` bytes is an error.
pub fn decode_record<R: WireRecord>(src: &[u8]) -> Result<R> {
    if src.len() < R::SIZE {
        return Err(FrameError::Truncated {
            expected: R::SIZE,
            actual: src.len(),
        });
    }
    let mut cursor = &src[..R::SIZE];
    Ok(R::get(&mut cursor))
}

/// Encode an inbound frame.
///
/// The header's frame id is taken from the body so the two cannot disagree.
pub fn encode_inbound(frame: &InboundFrame, dst: &mut BytesMut) {
    let header = Header {
        frame_id: frame.body.frame_id().into(),
        ..frame.header
    };
    dst.reserve(frame.wire_size());
    header.put(dst);
    frame.body.put(dst);
}

/// Decode an inbound frame from a receive buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// An unknown frame id is reported as soon as the id bytes arrive, without
/// waiting for a body whose size cannot be known.
pub fn decode_inbound(src: &mut BytesMut) -> Result<Option<InboundFrame>> {
    if src.len() < 4 {
        return Ok(None);
    }

    let raw_id = u16::from_le_bytes([src[2], src[3]]);
    let frame_id = FrameId::try_from(raw_id)?;

    let total = HEADER_SIZE + frame_id.body_size();
    if src.len() < total {
        return Ok(None);
    }

    let header = Header::get(src);
    let body = match frame_id {
        FrameId::CommandStatus => Inbound::CommandStatus(CommandStatus::get(src)),
        FrameId::Config => Inbound::Config(Config::get(src)),
        FrameId::Telemetry => Inbound::Telemetry(Telemetry::get(src)),
    };

    Ok(Some(InboundFrame { header, body }))
}

/// Encode an outbound command. Commands carry no header.
pub fn encode_command(command: &Command, dst: &mut BytesMut) {
    encode_record(command, dst);
}

/// Decode an outbound command from a receive buffer (controller side).
pub fn decode_command(src: &mut BytesMut) -> Result<Option<Command>> {
    if src.len() < Command::SIZE {
        return Ok(None);
    }
    Ok(Some(Command::get(src)))
}

impl Decode for InboundFrame {
    fn decode(src: &mut BytesMut) -> Result<Option<Self>> {
        decode_inbound(src)
    }
}

impl Encode for InboundFrame {
    fn encode(&self, dst: &mut BytesMut) {
        encode_inbound(self, dst);
    }
}

impl Decode for Command {
    fn decode(src: &mut BytesMut) -> Result<Option<Self>> {
        decode_command(src)
    }
}

impl Encode for Command {
    fn encode(&self, dst: &mut BytesMut) {
        encode_command(self, dst);
    }
}

/// Configuration for frame readers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Initial receive buffer capacity in bytes.
    pub read_buffer_capacity: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            read_buffer_capacity: DEFAULT_READ_BUFFER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{application_status, CommandCode, CommandStatusCode, ControllerState};

    fn sample_telemetry(time: f64) -> Telemetry {
        Telemetry {
            time,
            application_status: application_status::COMMANDABLE,
            state: ControllerState::Standby.raw(),
            ..Telemetry::default()
        }
    }

    #[test]
    fn test_header_layout() {
        let header = Header::new(0x1234, FrameId::Config, 7, Timestamp::new(1, 2));
        let mut buf = BytesMut::new();
        encode_record(&header, &mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[0..2], &[0x34, 0x12]);
        assert_eq!(&buf[2..4], &[0x19, 0x00]);
        assert_eq!(&buf[4..6], &[0x07, 0x00]);
        assert_eq!(&buf[6..14], &1i64.to_le_bytes());
        assert_eq!(&buf[14..22], &2i64.to_le_bytes());
    }

    #[test]
    fn test_inbound_roundtrip() {
        let frame = InboundFrame::new(
            0x1234,
            3,
            Timestamp::new(100, 500),
            Inbound::CommandStatus(CommandStatus::new(42, CommandStatusCode::Ack, 0.5)),
        );
        let mut buf = BytesMut::new();
        encode_inbound(&frame, &mut buf);
        assert_eq!(buf.len(), HEADER_SIZE + 16);

        let decoded = decode_inbound(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_fixes_mismatched_frame_id() {
        let mut frame = InboundFrame::new(
            0,
            0,
            Timestamp::default(),
            Inbound::Config(Config::default()),
        );
        frame.header.frame_id = FrameId::Telemetry.into();

        let mut buf = BytesMut::new();
        encode_inbound(&frame, &mut buf);
        let decoded = decode_inbound(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.header.kind().unwrap(), FrameId::Config);
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x34, 0x12, 0x05][..]);
        assert!(decode_inbound(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_incomplete_body() {
        let frame = InboundFrame::new(
            0,
            0,
            Timestamp::default(),
            Inbound::Telemetry(sample_telemetry(1.0)),
        );
        let mut buf = BytesMut::new();
        encode_inbound(&frame, &mut buf);
        buf.truncate(HEADER_SIZE + 10);

        assert!(decode_inbound(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_SIZE + 10);
    }

    #[test]
    fn test_decode_unknown_frame_id_fails_early() {
        // Only sync + frame id present; the id alone is enough to reject.
        let mut buf = BytesMut::from(&[0x34, 0x12, 0x42, 0x00][..]);
        let result = decode_inbound(&mut buf);
        assert!(matches!(result, Err(FrameError::UnknownFrameId(0x42))));
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = BytesMut::new();
        let config = InboundFrame::new(
            0,
            0,
            Timestamp::default(),
            Inbound::Config(Config {
                min_position: -10.0,
                max_position: 10.0,
                max_velocity: 1.0,
            }),
        );
        let telemetry = InboundFrame::new(
            0,
            1,
            Timestamp::new(5, 0),
            Inbound::Telemetry(sample_telemetry(5.0)),
        );
        encode_inbound(&config, &mut buf);
        encode_inbound(&telemetry, &mut buf);

        assert_eq!(decode_inbound(&mut buf).unwrap().unwrap(), config);
        assert_eq!(decode_inbound(&mut buf).unwrap().unwrap(), telemetry);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_record_truncated() {
        let result = decode_record::<Config>(&[0u8; 10]);
        assert!(matches!(
            result,
            Err(FrameError::Truncated {
                expected: 24,
                actual: 10
            })
        ));
    }

    #[test]
    fn test_command_stream_decode() {
        let mut first = Command::with_param1(CommandCode::Move, 1.5);
        first.counter = 1;
        let mut second = Command::with_param1(CommandCode::EnableDrives, 1.0);
        second.counter = 2;

        let mut buf = BytesMut::new();
        first.encode(&mut buf);
        second.encode(&mut buf);
        buf.truncate(Command::SIZE + 5);

        assert_eq!(Command::decode(&mut buf).unwrap(), Some(first));
        assert_eq!(Command::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_timestamp_float_conversion() {
        let ts = Timestamp::from_secs_f64(1_700_000_000.5);
        assert_eq!(ts, Timestamp::new(1_700_000_000, 500_000_000));
        assert_eq!(ts.as_secs_f64(), 1_700_000_000.5);

        let negative = Timestamp::from_secs_f64(-0.25);
        assert_eq!(negative, Timestamp::new(-1, 750_000_000));
    }

    #[test]
    fn test_timestamp_now_is_after_epoch() {
        assert!(Timestamp::now().sec > 0);
    }
}
