//! fleetbeat wire format: the envelope exchanged between node and collector.
//!
//! These types ARE the protocol. Every field, every size, every reserved byte
//! is part of the wire format. Changing a layout here is a breaking change for
//! every deployed node.
//!
//! All header types are `#[repr(C)]` over byte arrays and little-endian
//! zerocopy integers, so they have no padding, no alignment requirement and
//! can be read straight out of a received frame without copying.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Kind ──────────────────────────────────────────────────────────────────────

/// Payload interpretation tag carried by every envelope.
///
/// The discriminants are wire constants. New kinds are appended; existing
/// values never change meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Unknown = 0,
    Generic = 1,
    /// UTF-8 command for the receiving side, e.g. `flush`.
    Command = 2,
    /// A [`ConfigSnapshot`](crate::snapshot::ConfigSnapshot) in its fixed layout.
    ClientConfig = 3,
    /// A node identity record (see [`crate::identity`]).
    ClientInfo = 4,
    CpuData = 5,
    MemData = 6,
    NetData = 7,
    LoadData = 8,
    /// End of handshake. Empty payload.
    Eot = 9,
}

impl Kind {
    /// Kinds that carry telemetry samples.
    pub const METRICS: [Kind; 4] = [Kind::CpuData, Kind::MemData, Kind::NetData, Kind::LoadData];

    /// Decode a wire byte. Unrecognised values map to [`Kind::Unknown`] so a
    /// newer peer never breaks an older one.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Kind::Generic,
            2 => Kind::Command,
            3 => Kind::ClientConfig,
            4 => Kind::ClientInfo,
            5 => Kind::CpuData,
            6 => Kind::MemData,
            7 => Kind::NetData,
            8 => Kind::LoadData,
            9 => Kind::Eot,
            _ => Kind::Unknown,
        }
    }

    pub fn is_metric(self) -> bool {
        Self::METRICS.contains(&self)
    }

    /// Short lowercase name used in logs, config and the HTTP API.
    pub fn name(self) -> &'static str {
        match self {
            Kind::Unknown => "unknown",
            Kind::Generic => "generic",
            Kind::Command => "command",
            Kind::ClientConfig => "client_config",
            Kind::ClientInfo => "client_info",
            Kind::CpuData => "cpu",
            Kind::MemData => "mem",
            Kind::NetData => "net",
            Kind::LoadData => "load",
            Kind::Eot => "eot",
        }
    }
}

impl From<Kind> for u8 {
    fn from(k: Kind) -> u8 {
        k as u8
    }
}

// ── Message ID ────────────────────────────────────────────────────────────────

/// 16-byte envelope identifier: 8-byte nanosecond timestamp, 4-byte source
/// node id, 4-byte random nonce. All three parts are big-endian so ids from
/// one source sort by creation time.
///
/// Not guaranteed unique; the random nonce makes collisions negligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub fn new(source: u32) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::from_parts(nanos, source, rand::random())
    }

    pub fn from_parts(timestamp_nanos: u64, source: u32, nonce: u32) -> Self {
        let mut id = [0u8; 16];
        id[..8].copy_from_slice(&timestamp_nanos.to_be_bytes());
        id[8..12].copy_from_slice(&source.to_be_bytes());
        id[12..].copy_from_slice(&nonce.to_be_bytes());
        Self(id)
    }

    pub fn timestamp_nanos(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().unwrap_or([0; 8]))
    }

    pub fn source(&self) -> u32 {
        u32::from_be_bytes(self.0[8..12].try_into().unwrap_or([0; 4]))
    }

    pub fn nonce(&self) -> u32 {
        u32::from_be_bytes(self.0[12..].try_into().unwrap_or([0; 4]))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// ── Envelope Header ───────────────────────────────────────────────────────────

/// Fixed-layout header preceding every envelope payload.
///
/// Wire size: 28 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct EnvelopeHeader {
    /// See [`MessageId`].
    pub id: [u8; 16],

    /// Receiving node id. 0 = the collector.
    pub destination: U32<LittleEndian>,

    /// [`Kind`] discriminant.
    pub kind: u8,

    /// Envelope format version. 0 is read as [`ENVELOPE_VERSION`].
    pub version: u8,

    /// Reserved, must be zero.
    pub flags: U16<LittleEndian>,

    /// Length of the payload following this header.
    pub payload_len: U32<LittleEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(EnvelopeHeader, [u8; 28]);

pub const HEADER_LEN: usize = std::mem::size_of::<EnvelopeHeader>();

// ── Envelope ──────────────────────────────────────────────────────────────────

/// An owned envelope. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: MessageId,
    pub destination: u32,
    pub kind: Kind,
    pub payload: Bytes,
}

impl Envelope {
    /// Build an envelope originating at `source`, stamping a fresh id.
    pub fn new(source: u32, destination: u32, kind: Kind, payload: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::new(source),
            destination,
            kind,
            payload: payload.into(),
        }
    }

    /// Serialize into header ++ payload.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(self.payload.len()));
        }
        let header = EnvelopeHeader {
            id: self.id.0,
            destination: U32::new(self.destination),
            kind: self.kind.into(),
            version: ENVELOPE_VERSION,
            flags: U16::new(0),
            payload_len: U32::new(self.payload.len() as u32),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode and copy out of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        EnvelopeView::parse(buf).map(|view| view.to_owned())
    }
}

/// A decoded envelope borrowing the receive buffer.
///
/// Valid only as long as the buffer it was parsed from. Callers that keep a
/// payload past the current read must copy it, e.g. with [`Self::to_owned`].
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeView<'a> {
    header: &'a EnvelopeHeader,
    payload: &'a [u8],
}

impl<'a> EnvelopeView<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, WireError> {
        let header = EnvelopeHeader::ref_from_prefix(buf).ok_or(WireError::Truncated {
            needed: HEADER_LEN,
            got: buf.len(),
        })?;

        let version = header.version;
        if version > ENVELOPE_VERSION {
            return Err(WireError::UnknownVersion(version));
        }
        let flags = header.flags.get();
        if flags != 0 {
            return Err(WireError::ReservedFlagsSet(flags));
        }

        // Bytes past the declared payload are ignored.
        let declared = header.payload_len.get() as usize;
        let body = &buf[HEADER_LEN..];
        if declared > body.len() {
            return Err(WireError::PayloadLength {
                declared,
                available: body.len(),
            });
        }

        Ok(Self {
            header,
            payload: &body[..declared],
        })
    }

    pub fn id(&self) -> MessageId {
        MessageId(self.header.id)
    }

    pub fn destination(&self) -> u32 {
        self.header.destination.get()
    }

    pub fn kind(&self) -> Kind {
        Kind::from_u8(self.header.kind)
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn to_owned(&self) -> Envelope {
        Envelope {
            id: self.id(),
            destination: self.destination(),
            kind: self.kind(),
            payload: Bytes::copy_from_slice(self.payload),
        }
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 0x01;

/// Maximum payload size in bytes.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Reserved text frame acknowledging a received data frame.
/// A receiver never acknowledges an acknowledgement.
pub const ACK: &str = "ACK";

/// Destination id addressing the collector itself.
pub const COLLECTOR_ID: u32 = 0;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame too short: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("declared payload length {declared} exceeds {available} available bytes")]
    PayloadLength { declared: usize, available: usize },

    #[error("unknown envelope version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("reserved flags are non-zero: 0x{0:04x}")]
    ReservedFlagsSet(u16),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
