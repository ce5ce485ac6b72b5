//! ZimSync wire protocol implementation.
//!
//! ZimSync speaks a lightweight binary protocol over UDP datagrams. Every
//! datagram is self-contained: a fixed 16-byte header followed by one
//! complete payload.
//!
//! ## Frame Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           ZimSync Frame                              │
//! ├────────┬─────────┬──────┬───────┬──────┬──────────┬─────────┬────────┤
//! │ Magic  │ Version │ Type │ Flags │ Rsvd │ Sequence │ Payload │Checksum│
//! │ 4 bytes│ 1 byte  │1 byte│1 byte │1 byte│ 2 bytes  │  size   │ 4 bytes│
//! │        │         │      │       │      │          │ 2 bytes │        │
//! ├────────┴─────────┴──────┴───────┴──────┴──────────┴─────────┴────────┤
//! │                              Payload                                 │
//! │                         (variable length)                            │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Magic: `0x5A 0x49 0x4D 0x53` ("ZIMS")
//! - Version: `0x01`
//! - Type: packet type discriminator
//! - Flags: bitmask (compressed, encrypted, lastChunk, requiresAck)
//! - Reserved: zero on send, ignored on receive
//! - Sequence: peer-local wrapping counter (big-endian)
//! - Payload size: bytes following the header, at most 65 520 (big-endian)
//! - Checksum: first 4 bytes of SHA-256 over the payload as transmitted
//!
//! Payloads are JSON objects with camelCase keys; binary fields (chunk data,
//! ACK bitmaps, file checksums) are base64 strings so a 32 KiB chunk still
//! fits one datagram.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::device::DeviceInfo;
use crate::error::{Error, Result};
use crate::file::FileMetadata;

pub(crate) mod b64;

/// Protocol magic bytes: "ZIMS"
pub const MAGIC: [u8; 4] = [0x5A, 0x49, 0x4D, 0x53];

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Maximum datagram size the transport will carry
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Maximum payload size (datagram minus header)
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE;

/// Packet types in the ZimSync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Probe for peers and their catalogs
    Discover = 0x01,
    /// Device identity and capabilities
    Announce = 0x02,
    /// Shared-file catalog
    FileList = 0x03,
    /// Request a chunk of a file
    FileRequest = 0x04,
    /// One chunk of file content
    FileData = 0x05,
    /// Acknowledgement, optionally with a selective-ACK bitmap
    Ack = 0x06,
    /// Protocol-level error report
    Error = 0x07,
}

impl PacketType {
    /// Parse a packet type from its discriminator byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Discover),
            0x02 => Some(Self::Announce),
            0x03 => Some(Self::FileList),
            0x04 => Some(Self::FileRequest),
            0x05 => Some(Self::FileData),
            0x06 => Some(Self::Ack),
            0x07 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Header flag bitmask.
///
/// The `COMPRESSED` bit is reserved: chunk compression is signaled inside
/// [`FileDataPayload::original_size`], never here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Payload is compressed (reserved, never set)
    pub const COMPRESSED: Self = Self(1);
    /// Payload is encrypted (reserved, no key exchange defined)
    pub const ENCRYPTED: Self = Self(2);
    /// This FileData carries the final chunk of its file
    pub const LAST_CHUNK: Self = Self(4);
    /// Sender expects an Ack for this packet
    pub const REQUIRES_ACK: Self = Self(8);

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bitmask value.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Construct from a raw bitmask value.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// A frame header.
#[derive(Debug, Clone)]
pub struct PacketHeader {
    /// Protocol version
    pub version: u8,
    /// Packet type
    pub packet_type: PacketType,
    /// Header flags
    pub flags: PacketFlags,
    /// Sequence number
    pub sequence: u16,
    /// Payload length in bytes
    pub payload_size: u16,
    /// Truncated SHA-256 of the payload
    pub checksum: u32,
}

impl PacketHeader {
    /// Encode the header to its 16-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.version;
        buf[5] = self.packet_type as u8;
        buf[6] = self.flags.bits();
        buf[7] = 0;
        buf[8..10].copy_from_slice(&self.sequence.to_be_bytes());
        buf[10..12].copy_from_slice(&self.payload_size.to_be_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Decode a header from its 16-byte wire form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] for a bad magic or unknown type, and
    /// [`Error::UnsupportedVersion`] for a version newer than ours.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[0..4] != MAGIC {
            return Err(Error::InvalidPacket("invalid magic bytes".to_string()));
        }

        let version = buf[4];
        if version > PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let packet_type = PacketType::from_byte(buf[5])
            .ok_or_else(|| Error::InvalidPacket(format!("unknown packet type: {:#x}", buf[5])))?;

        let flags = PacketFlags::from_bits(buf[6]);
        let sequence = u16::from_be_bytes([buf[8], buf[9]]);
        let payload_size = u16::from_be_bytes([buf[10], buf[11]]);
        let checksum = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

        Ok(Self {
            version,
            packet_type,
            flags,
            sequence,
            payload_size,
            checksum,
        })
    }
}

/// Compression algorithm identifier carried in `FileRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    /// DEFLATE with zlib framing (default)
    #[default]
    Zlib,
    /// LZ4 block format, size-prepended
    Lz4,
    /// LZMA
    Lzma,
    /// No compression
    None,
}

impl CompressionType {
    /// Parse from a CLI string.
    #[must_use]
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "zlib" => Some(Self::Zlib),
            "lz4" => Some(Self::Lz4),
            "lzma" => Some(Self::Lzma),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Zlib => "zlib",
            Self::Lz4 => "lz4",
            Self::Lzma => "lzma",
            Self::None => "none",
        }
    }
}

/// Wire error codes.
///
/// The set is closed; unknown codes fail payload decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// 404: requested file absent or unknown file id
    FileNotFound,
    /// 507: not enough space on the receiving volume
    InsufficientSpace,
    /// 409: checksum or decompressed-size mismatch
    ChecksumMismatch,
    /// 415: unsupported format, path, or protocol version
    UnsupportedFormat,
    /// 408: operation timed out
    Timeout,
}

impl ErrorCode {
    /// The numeric wire code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::FileNotFound => 404,
            Self::InsufficientSpace => 507,
            Self::ChecksumMismatch => 409,
            Self::UnsupportedFormat => 415,
            Self::Timeout => 408,
        }
    }

    /// Resolve a numeric wire code.
    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            404 => Some(Self::FileNotFound),
            507 => Some(Self::InsufficientSpace),
            409 => Some(Self::ChecksumMismatch),
            415 => Some(Self::UnsupportedFormat),
            408 => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = u16::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown error code: {code}")))
    }
}

/// Discover payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverPayload {
    /// Stable device UUID of the prober
    pub device_id: Uuid,
    /// When the probe was sent
    pub timestamp: DateTime<Utc>,
}

/// Announce payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncePayload {
    /// Identity of the announcing device
    pub device_info: DeviceInfo,
    /// Bytes free on the shared volume
    pub available_space: i64,
    /// Feature tags; the core recognizes "compression", "chunking", "resume"
    pub supported_features: Vec<String>,
}

/// FileList payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileListPayload {
    /// Catalog entries
    pub files: Vec<FileMetadata>,
    /// Sum of all file sizes
    pub total_size: u64,
}

/// FileRequest payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequestPayload {
    /// Handle assigned by the sender when the file was offered
    pub file_id: Uuid,
    /// Byte offset to start from (must be non-negative)
    pub start_offset: i64,
    /// Chunk size for the whole session (must be positive)
    pub chunk_size: i32,
    /// Requested chunk compression; absent means zlib
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub compression_type: Option<CompressionType>,
}

/// FileData payload: one chunk of file content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDataPayload {
    /// File handle
    pub file_id: Uuid,
    /// Chunk index, starting at 0
    pub chunk_index: u32,
    /// Byte offset of this chunk (`chunk_index * chunk_size`)
    pub offset: i64,
    /// Total chunk count for the file
    pub total_chunks: u32,
    /// Chunk bytes, possibly compressed
    #[serde(with = "b64::bytes")]
    pub data: Vec<u8>,
    /// Uncompressed length; present iff `data` is compressed
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original_size: Option<i32>,
}

/// Ack payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    /// Header sequence of the packet being acknowledged
    pub sequence_number: u16,
    /// Selective-ACK bitmap over chunk indices; bit `k` set means chunk `k`
    /// has been stored
    #[serde(with = "b64::opt_bytes", skip_serializing_if = "Option::is_none", default)]
    pub received_bitmap: Option<Vec<u8>>,
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Wire error code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Optional structured context
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<HashMap<String, String>>,
}

impl ErrorPayload {
    /// Build a payload with no details map.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }
}

/// A decoded ZimSync packet.
///
/// Closed tagged union over the seven wire messages; owns no resources and
/// moves freely through channels.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Probe for peers
    Discover(DiscoverPayload),
    /// Device identity reply
    Announce(AnnouncePayload),
    /// Catalog reply
    FileList(FileListPayload),
    /// Chunk request
    FileRequest(FileRequestPayload),
    /// Chunk content
    FileData(FileDataPayload),
    /// Acknowledgement
    Ack(AckPayload),
    /// Error report
    Error(ErrorPayload),
}

impl Packet {
    /// The wire discriminator for this packet.
    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        match self {
            Self::Discover(_) => PacketType::Discover,
            Self::Announce(_) => PacketType::Announce,
            Self::FileList(_) => PacketType::FileList,
            Self::FileRequest(_) => PacketType::FileRequest,
            Self::FileData(_) => PacketType::FileData,
            Self::Ack(_) => PacketType::Ack,
            Self::Error(_) => PacketType::Error,
        }
    }

    /// Shorthand for a [`Packet::Error`] with no details.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload::new(code, message))
    }
}

/// Compute the header checksum for a payload: the first 4 bytes of its
/// SHA-256 hash, read big-endian.
#[must_use]
pub fn payload_checksum(payload: &[u8]) -> u32 {
    let digest = Sha256::digest(payload);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Encode a packet into a single datagram.
///
/// # Errors
///
/// Returns [`Error::InvalidPacket`] if the encoded datagram would exceed the
/// transport maximum, or [`Error::Serialization`] if the payload cannot be
/// serialized.
pub fn encode(packet: &Packet, sequence: u16) -> Result<Vec<u8>> {
    encode_with_flags(packet, sequence, PacketFlags::empty())
}

/// Encode a packet with explicit header flags.
///
/// # Errors
///
/// Same as [`encode`].
pub fn encode_with_flags(packet: &Packet, sequence: u16, flags: PacketFlags) -> Result<Vec<u8>> {
    let payload = match packet {
        Packet::Discover(p) => to_json(p),
        Packet::Announce(p) => to_json(p),
        Packet::FileList(p) => to_json(p),
        Packet::FileRequest(p) => to_json(p),
        Packet::FileData(p) => to_json(p),
        Packet::Ack(p) => to_json(p),
        Packet::Error(p) => to_json(p),
    }?;

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::InvalidPacket(format!(
            "encoded payload of {} bytes exceeds the {MAX_PAYLOAD_SIZE}-byte maximum",
            payload.len()
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let header = PacketHeader {
        version: PROTOCOL_VERSION,
        packet_type: packet.packet_type(),
        flags,
        sequence,
        payload_size: payload.len() as u16,
        checksum: payload_checksum(&payload),
    };

    let mut datagram = Vec::with_capacity(HEADER_SIZE + payload.len());
    datagram.extend_from_slice(&header.encode());
    datagram.extend_from_slice(&payload);
    Ok(datagram)
}

/// Decode one datagram into its header and typed packet.
///
/// # Errors
///
/// Returns [`Error::InvalidPacket`] for truncated datagrams, bad magic,
/// unknown type, or undecodable payloads; [`Error::UnsupportedVersion`] for
/// newer protocol versions; [`Error::ChecksumMismatch`] when the payload does
/// not hash to the header checksum.
pub fn decode(datagram: &[u8]) -> Result<(PacketHeader, Packet)> {
    if datagram.len() < HEADER_SIZE {
        return Err(Error::InvalidPacket(format!(
            "datagram of {} bytes is shorter than the {HEADER_SIZE}-byte header",
            datagram.len()
        )));
    }

    let mut header_buf = [0u8; HEADER_SIZE];
    header_buf.copy_from_slice(&datagram[..HEADER_SIZE]);
    let header = PacketHeader::decode(&header_buf)?;

    let end = HEADER_SIZE + header.payload_size as usize;
    if end > datagram.len() {
        return Err(Error::InvalidPacket(format!(
            "payload size {} reads past the {}-byte datagram",
            header.payload_size,
            datagram.len()
        )));
    }
    let payload = &datagram[HEADER_SIZE..end];

    let computed = payload_checksum(payload);
    if computed != header.checksum {
        return Err(Error::ChecksumMismatch(format!(
            "header checksum {:#010x} does not match payload checksum {computed:#010x}",
            header.checksum
        )));
    }

    let packet = match header.packet_type {
        PacketType::Discover => Packet::Discover(from_json(payload)?),
        PacketType::Announce => Packet::Announce(from_json(payload)?),
        PacketType::FileList => Packet::FileList(from_json(payload)?),
        PacketType::FileRequest => Packet::FileRequest(from_json(payload)?),
        PacketType::FileData => Packet::FileData(from_json(payload)?),
        PacketType::Ack => Packet::Ack(from_json(payload)?),
        PacketType::Error => Packet::Error(from_json(payload)?),
    };

    Ok((header, packet))
}

fn to_json<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| Error::Serialization(e.to_string()))
}

fn from_json<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data)
        .map_err(|e| Error::InvalidPacket(format!("payload decode failed: {e}")))
}

/// Pack a set of received chunk indices into a selective-ACK bitmap.
///
/// The bitmap is `⌈total_chunks / 8⌉` bytes; bit `k` lives at byte `k / 8`,
/// bit offset `k % 8`. Indices at or beyond `total_chunks` are ignored.
#[must_use]
pub fn encode_chunk_bitmap(received: &HashSet<u32>, total_chunks: u32) -> Vec<u8> {
    let mut bitmap = vec![0u8; (total_chunks as usize).div_ceil(8)];
    for &index in received {
        if index < total_chunks {
            bitmap[index as usize / 8] |= 1 << (index % 8);
        }
    }
    bitmap
}

/// Unpack a selective-ACK bitmap into sorted chunk indices.
#[must_use]
pub fn decode_chunk_bitmap(bitmap: &[u8]) -> Vec<u32> {
    let mut indices = Vec::new();
    for (byte_index, byte) in bitmap.iter().enumerate() {
        for bit in 0..8u32 {
            if byte & (1 << bit) != 0 {
                #[allow(clippy::cast_possible_truncation)]
                indices.push(byte_index as u32 * 8 + bit);
            }
        }
    }
    indices
}
