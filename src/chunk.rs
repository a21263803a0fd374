use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::status::Status;

/// The protocol epoch a chunk is declared in, or that two peers negotiated. This is an open
///  newtype rather than an enum so that versions newer than the ones this crate knows can be
///  represented and rejected.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ProtocolVersion(u8);

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::UNKNOWN => write!(f, "unknown"),
            Self::LEGACY => write!(f, "legacy"),
            ProtocolVersion(v) => write!(f, "v{}", v),
        }
    }
}

impl ProtocolVersion {
    pub const UNKNOWN: ProtocolVersion = ProtocolVersion(0);
    /// no handshake: the session id is the resource id, and a transfer starts out WAITING
    pub const LEGACY: ProtocolVersion = ProtocolVersion(1);
    pub const VERSION_TWO: ProtocolVersion = ProtocolVersion(2);
    pub const LATEST: ProtocolVersion = Self::VERSION_TWO;

    pub fn from_raw(value: u8) -> ProtocolVersion {
        ProtocolVersion(value)
    }

    pub fn to_raw(&self) -> u8 {
        self.0
    }

    pub fn is_supported(&self) -> bool {
        *self >= Self::LEGACY && *self <= Self::LATEST
    }

    /// Starting with version 2, a terminating chunk is acknowledged by the peer
    pub fn requires_completion_ack(&self) -> bool {
        *self >= Self::VERSION_TWO
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ChunkType {
    Data = 0,
    Start = 1,
    ParametersRetransmit = 2,
    ParametersContinue = 3,
    Completion = 4,
    CompletionAck = 5,
    StartAck = 6,
    StartAckConfirmation = 7,
}

/// A single protocol message, already decoded by whatever wire codec the transport uses.
#[derive(Clone, Eq, PartialEq)]
pub struct Chunk {
    pub protocol_version: ProtocolVersion,
    pub chunk_type: ChunkType,
    /// assigned by the peer during the handshake; `Some(0)` is the same as `None`
    pub session_id: Option<u32>,
    pub resource_id: Option<u32>,
    pub offset: u64,
    pub data: Bytes,
    pub window_end_offset: Option<u64>,
    pub max_chunk_size_bytes: Option<u32>,
    pub min_delay_microseconds: Option<u32>,
    /// `Some(0)` marks the final data chunk of a resource
    pub remaining_bytes: Option<u64>,
    /// present only on a terminating chunk
    pub status: Option<Status>,
}

impl Debug for Chunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CHUNK{{{}:{:?}", self.protocol_version, self.chunk_type)?;
        if let Some(session_id) = self.session_id {
            write!(f, " session={}", session_id)?;
        }
        if let Some(resource_id) = self.resource_id {
            write!(f, " resource={}", resource_id)?;
        }
        write!(f, " @{}", self.offset)?;
        if !self.data.is_empty() {
            write!(f, " +{}B", self.data.len())?;
        }
        if let Some(window_end_offset) = self.window_end_offset {
            write!(f, " window_end={}", window_end_offset)?;
        }
        if let Some(max_chunk_size) = self.max_chunk_size_bytes {
            write!(f, " max_chunk={}", max_chunk_size)?;
        }
        if let Some(delay) = self.min_delay_microseconds {
            write!(f, " delay={}us", delay)?;
        }
        if let Some(remaining) = self.remaining_bytes {
            write!(f, " remaining={}", remaining)?;
        }
        if let Some(status) = self.status {
            write!(f, " status={}", status)?;
        }
        write!(f, "}}")
    }
}

impl Chunk {
    pub fn new(protocol_version: ProtocolVersion, chunk_type: ChunkType) -> Chunk {
        Chunk {
            protocol_version,
            chunk_type,
            session_id: None,
            resource_id: None,
            offset: 0,
            data: Bytes::new(),
            window_end_offset: None,
            max_chunk_size_bytes: None,
            min_delay_microseconds: None,
            remaining_bytes: None,
            status: None,
        }
    }

    pub fn assigned_session_id(&self) -> Option<u32> {
        self.session_id
            .filter(|&id| id != 0)
    }

    /// A retransmit-style parameters chunk asks the sender to rewind to `offset`, while
    ///  PARAMETERS_CONTINUE only moves the window's end. A legacy peer answers a write START with
    ///  parameters typed as START, so that counts as a rewind as well.
    pub fn requests_transmission_from_offset(&self) -> bool {
        matches!(self.chunk_type, ChunkType::ParametersRetransmit | ChunkType::Start)
    }

    pub fn is_handshake_chunk(&self) -> bool {
        matches!(self.chunk_type, ChunkType::Start | ChunkType::StartAckConfirmation)
    }

    pub fn min_delay(&self) -> Option<Duration> {
        self.min_delay_microseconds
            .map(|us| Duration::from_micros(us.into()))
    }
}
