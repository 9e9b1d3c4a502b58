//! Fixed-layout binary framing for the controller command/telemetry link.
//!
//! The low-level controller speaks a packed, little-endian, delimiter-free
//! protocol:
//! - Inbound (controller → supervisor): a 22-byte [`Header`] whose `frame_id`
//!   selects one of the fixed-size bodies ([`CommandStatus`], [`Config`],
//!   [`Telemetry`]).
//! - Outbound (supervisor → controller): bare 58-byte [`Command`] records.
//!
//! There is no length prefix and no resync marker. An unknown frame id or a
//! short record means the stream can no longer be trusted.

pub mod codec;
pub mod error;
pub mod frame_id;
pub mod reader;
pub mod records;
pub mod writer;

pub use codec::{
    decode_command, decode_inbound, decode_record, encode_command, encode_inbound, encode_record,
    Decode, Encode, FrameConfig, Header, Inbound, InboundFrame, Timestamp, WireRecord,
    HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use frame_id::FrameId;
pub use reader::FrameReader;
pub use records::{
    application_status, Command, CommandCode, CommandStatus, CommandStatusCode, Config,
    ControllerState, EnabledSubstate, SetStateParam, Telemetry, DEFAULT_COMMANDER_ID, NUM_PARAMS,
};
pub use writer::FrameWriter;
