//! Fixed-header framing for GameNet streams.
//!
//! Every message on the wire is a 10-byte header followed by the payload:
//!
//! ```text
//! +------------------+----------+-----------+-----------------+-----------------+
//! | length (4 bytes) | type (1) | flags (1) | seq (4 bytes)   | payload         |
//! | u32 little-endian| u8       | u8        | i32 little-endian| (length bytes) |
//! +------------------+----------+-----------+-----------------+-----------------+
//! ```
//!
//! The length does **not** include the header itself and is bounded by
//! [`MAX_MESSAGE_SIZE`]. A length of 0 is valid and is what keepalive frames
//! (`Ping`/`Pong`) carry. The sequence number is informational only: it is
//! written by every sender but never validated by a receiver.

use std::ops::{BitOr, BitOrAssign};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 10;

/// Maximum payload carried by a single frame (4 MiB).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Type tag carried in byte 4 of every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Opaque application payload.
    Data = 0x01,
    /// Keepalive request. The receiver answers with [`MessageType::Pong`].
    Ping = 0x02,
    /// Keepalive answer.
    Pong = 0x03,
    /// Client login: `LPString username | LPString password`.
    AuthRequest = 0x10,
    /// Server login verdict: `success:i32 | LPString message`.
    AuthResponse = 0x11,
    /// Client registration: username, password, email, info as LPStrings.
    RegisterRequest = 0x12,
    /// Server registration verdict: `success:i32 | LPString message`.
    RegisterResponse = 0x13,
}

impl MessageType {
    /// Wire value of this type.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether frames of this type belong to the application rather than to
    /// the keepalive or authentication machinery.
    pub fn is_application(self) -> bool {
        matches!(self, MessageType::Data)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Data),
            0x02 => Ok(MessageType::Ping),
            0x03 => Ok(MessageType::Pong),
            0x10 => Ok(MessageType::AuthRequest),
            0x11 => Ok(MessageType::AuthResponse),
            0x12 => Ok(MessageType::RegisterRequest),
            0x13 => Ok(MessageType::RegisterResponse),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }
}

/// Flag bitset carried in byte 5 of every header.
///
/// Unknown bits are preserved so a header survives a parse/build round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set.
    pub const NONE: Self = Self(0x00);
    /// The payload is a fragment envelope (see [`crate::fragment`]).
    pub const FRAGMENT: Self = Self(0x01);
    /// The fragment is the final one of its transfer.
    pub const FRAGMENT_LAST: Self = Self(0x02);

    /// Wrap raw flag bits.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flag bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Shorthand for `contains(FrameFlags::FRAGMENT)`.
    pub const fn is_fragment(self) -> bool {
        self.contains(Self::FRAGMENT)
    }
}

impl BitOr for FrameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FrameFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A frame was about to be built with a payload outside `[0, MAX_MESSAGE_SIZE]`.
    #[error("payload length {len} out of range (max {max})")]
    OutOfRange {
        /// The offending payload length.
        len: usize,
        /// The enforced maximum.
        max: usize,
    },

    /// A received header declared a length outside `[0, MAX_MESSAGE_SIZE]`.
    #[error("invalid payload length {len} in header (max {max})")]
    InvalidLength {
        /// The declared length, as read from the wire.
        len: u32,
        /// The enforced maximum.
        max: usize,
    },

    /// The header buffer was not exactly [`HEADER_SIZE`] bytes.
    #[error("invalid header size {0}, expected {HEADER_SIZE}")]
    InvalidHeaderSize(usize),

    /// The header carried a type byte this protocol does not define.
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),

    /// The peer closed the stream before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether this error means the peer broke the wire format, as opposed
    /// to the transport failing underneath us.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidLength { .. }
                | FrameError::InvalidHeaderSize(_)
                | FrameError::UnknownMessageType(_)
        )
    }
}

/// Decoded form of the fixed 10-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes.
    pub length: u32,
    /// Message type tag.
    pub message_type: MessageType,
    /// Fragment flags.
    pub flags: FrameFlags,
    /// Sender's sequence number.
    pub seq: i32,
}

/// Encode a header for a payload of `payload_len` bytes.
pub fn build_header(
    payload_len: usize,
    message_type: MessageType,
    flags: FrameFlags,
    seq: i32,
) -> Result<[u8; HEADER_SIZE], FrameError> {
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(FrameError::OutOfRange {
            len: payload_len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&(payload_len as u32).to_le_bytes());
    header[4] = message_type.as_u8();
    header[5] = flags.bits();
    header[6..10].copy_from_slice(&seq.to_le_bytes());
    Ok(header)
}

/// Decode a header. `bytes` must be exactly [`HEADER_SIZE`] long.
pub fn parse_header(bytes: &[u8]) -> Result<FrameHeader, FrameError> {
    let header: &[u8; HEADER_SIZE] = bytes
        .try_into()
        .map_err(|_| FrameError::InvalidHeaderSize(bytes.len()))?;

    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if length as usize > MAX_MESSAGE_SIZE {
        return Err(FrameError::InvalidLength {
            len: length,
            max: MAX_MESSAGE_SIZE,
        });
    }

    Ok(FrameHeader {
        length,
        message_type: MessageType::try_from(header[4])?,
        flags: FrameFlags::from_bits(header[5]),
        seq: i32::from_le_bytes([header[6], header[7], header[8], header[9]]),
    })
}

/// One complete frame as handed out by [`read_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type tag.
    pub message_type: MessageType,
    /// Fragment flags.
    pub flags: FrameFlags,
    /// Sender's sequence number (informational).
    pub seq: i32,
    /// Payload bytes; a fragment envelope when `flags` has `FRAGMENT`.
    pub payload: Vec<u8>,
}

fn map_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read a single frame from the stream.
///
/// Blocks until the full header and payload are available; partial frames
/// are never returned. Returns [`FrameError::ConnectionClosed`] if the peer
/// closes the stream before the expected byte count is read.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await.map_err(map_eof)?;
    let header = parse_header(&header_buf)?;

    let mut payload = vec![0u8; header.length as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await.map_err(map_eof)?;
    }

    Ok(Frame {
        message_type: header.message_type,
        flags: header.flags,
        seq: header.seq,
        payload,
    })
}

/// Write a single frame: header, then the payload (omitted when empty), then flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message_type: MessageType,
    payload: &[u8],
    seq: i32,
    flags: FrameFlags,
) -> Result<(), FrameError> {
    let header = build_header(payload.len(), message_type, flags, seq)?;

    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}
