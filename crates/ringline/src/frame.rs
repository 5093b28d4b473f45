//! Frame codec for the cluster native protocol.
//!
//! Every message rides on a fixed 9-byte header (version:1 + flags:1 +
//! stream:2 + opcode:1 + body length:4) followed by an opaque body. The
//! codec supports streaming decode over partial socket reads: an incomplete
//! frame leaves the input buffer untouched so already-buffered bytes are
//! never re-parsed. Decoding is stateless apart from the injected
//! compression/version context and never blocks.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DriverError, Result};

/// Fixed header size in bytes (version:1 + flags:1 + stream:2 + opcode:1 + length:4).
pub const HEADER_SIZE: usize = 9;

/// Protocol version spoken by this driver.
pub const PROTOCOL_VERSION: u8 = 4;

/// Direction bit in the version byte; set on server-to-client frames.
pub const DIRECTION_RESPONSE: u8 = 0x80;

/// Stream id used by server-initiated event frames.
pub const EVENT_STREAM_ID: i16 = -1;

/// Default cap on body length; oversized frames are rejected before any
/// body allocation happens.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Operations in the native protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl Opcode {
    /// Maps a wire byte to an opcode, or `None` for unknown values.
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            0x0D => Opcode::Batch,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            _ => return None,
        })
    }
}

/// Per-frame control flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags {
    /// Body is compressed with the negotiated algorithm.
    pub compressed: bool,
}

impl FrameFlags {
    /// Empty flag set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Raw byte representation.
    pub fn as_u8(&self) -> u8 {
        if self.compressed {
            0x01
        } else {
            0x00
        }
    }

    /// Parses the raw flag byte. Unknown bits are ignored.
    pub fn from_u8(raw: u8) -> Self {
        Self {
            compressed: (raw & 0x01) != 0,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Negotiated protocol version (low 7 bits of the version byte).
    pub version: u8,
    /// True for server-to-client frames.
    pub response: bool,
    /// Control flags.
    pub flags: FrameFlags,
    /// Connection-scoped correlation id. Client requests use `0..=32767`;
    /// negative ids are reserved for server-initiated events.
    pub stream: i16,
    /// Operation code.
    pub opcode: Opcode,
    /// Body length in bytes as carried on the wire.
    pub length: u32,
}

/// One complete protocol message: header plus opaque body.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header.
    pub header: FrameHeader,
    /// Body bytes, decompressed if the wire frame was compressed.
    pub body: Bytes,
}

impl Frame {
    /// Builds a client request frame.
    pub fn request(opcode: Opcode, stream: i16, body: Bytes) -> Self {
        Self {
            header: FrameHeader {
                version: PROTOCOL_VERSION,
                response: false,
                flags: FrameFlags::empty(),
                stream,
                opcode,
                length: body.len() as u32,
            },
            body,
        }
    }

    /// Builds a server response frame. Used by tests and mock peers.
    pub fn response(opcode: Opcode, stream: i16, body: Bytes) -> Self {
        Self {
            header: FrameHeader {
                version: PROTOCOL_VERSION,
                response: true,
                flags: FrameFlags::empty(),
                stream,
                opcode,
                length: body.len() as u32,
            },
            body,
        }
    }
}

/// Body compression negotiated at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No body compression.
    #[default]
    None,
    /// LZ4 block compression with a big-endian uncompressed-length prefix.
    Lz4,
}

impl Compression {
    /// Name sent in the STARTUP option map.
    pub fn wire_name(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Lz4 => Some("lz4"),
        }
    }
}

/// Stateless frame encoder/decoder with an injected version/compression
/// context.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    version: u8,
    compression: Compression,
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION, Compression::None, DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    /// Creates a codec for the given negotiated version and compression.
    pub fn new(version: u8, compression: Compression, max_frame_len: usize) -> Self {
        Self {
            version,
            compression,
            max_frame_len,
        }
    }

    /// Returns the negotiated compression.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Encodes a frame into `dst`.
    ///
    /// Bodies are compressed when the context negotiated compression, except
    /// for STARTUP and OPTIONS which are exchanged before negotiation
    /// completes and must stay uncompressed.
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        let compressible = !matches!(frame.header.opcode, Opcode::Startup | Opcode::Options);
        let (flags, body) = match self.compression {
            Compression::Lz4 if compressible && !frame.body.is_empty() => {
                (FrameFlags { compressed: true }, Bytes::from(pack_lz4(&frame.body)))
            }
            _ => (frame.header.flags, frame.body.clone()),
        };

        if body.len() > self.max_frame_len {
            return Err(DriverError::FrameCorruption {
                reason: format!(
                    "outgoing body {} bytes exceeds frame cap {}",
                    body.len(),
                    self.max_frame_len
                ),
            });
        }

        let mut version = frame.header.version;
        if frame.header.response {
            version |= DIRECTION_RESPONSE;
        }

        dst.reserve(HEADER_SIZE + body.len());
        dst.put_u8(version);
        dst.put_u8(flags.as_u8());
        dst.put_i16(frame.header.stream);
        dst.put_u8(frame.header.opcode as u8);
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }

    /// Attempts to decode one frame from `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete frame; no
    /// bytes are consumed in that case. On success the frame's bytes are
    /// consumed from `src` and the body is returned decompressed.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
        if length > self.max_frame_len {
            return Err(DriverError::FrameCorruption {
                reason: format!("frame body {} bytes exceeds cap {}", length, self.max_frame_len),
            });
        }
        if src.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        let mut head = src.split_to(HEADER_SIZE);
        let version_byte = head.get_u8();
        let response = (version_byte & DIRECTION_RESPONSE) != 0;
        let version = version_byte & 0x7F;
        if version != self.version {
            return Err(DriverError::FrameCorruption {
                reason: format!("version {} does not match negotiated {}", version, self.version),
            });
        }

        let flags = FrameFlags::from_u8(head.get_u8());
        let stream = head.get_i16();
        let opcode_raw = head.get_u8();
        let opcode = Opcode::from_u8(opcode_raw).ok_or_else(|| DriverError::ProtocolViolation {
            reason: format!("unknown opcode 0x{opcode_raw:02X}"),
        })?;
        let wire_length = head.get_u32();

        let mut body = src.split_to(length).freeze();
        if flags.compressed {
            body = Bytes::from(unpack_lz4(&body)?);
        }

        Ok(Some(Frame {
            header: FrameHeader {
                version,
                response,
                flags,
                stream,
                opcode,
                length: wire_length,
            },
            body,
        }))
    }
}

/// Compresses a body into the wire form: big-endian u32 uncompressed length
/// followed by the LZ4 block.
pub fn pack_lz4(body: &[u8]) -> Vec<u8> {
    let compressed = lz4_flex::block::compress(body);
    let mut out = Vec::with_capacity(4 + compressed.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&compressed);
    out
}

/// Reverses [`pack_lz4`]. Truncated or undecodable input is frame corruption.
pub fn unpack_lz4(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < 4 {
        return Err(DriverError::FrameCorruption {
            reason: "compressed body shorter than length prefix".to_string(),
        });
    }
    let uncompressed_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    lz4_flex::block::decompress(&body[4..], uncompressed_len).map_err(|e| {
        DriverError::FrameCorruption {
            reason: format!("lz4 decompression failed: {e}"),
        }
    })
}

/// Writes a `[string]`: u16 length followed by UTF-8 bytes.
pub fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_u16(s.len() as u16);
    dst.put_slice(s.as_bytes());
}

/// Writes a `[string map]`: u16 entry count followed by key/value `[string]`s.
pub fn put_string_map<'a>(dst: &mut BytesMut, entries: &[(&'a str, &'a str)]) {
    dst.put_u16(entries.len() as u16);
    for (k, v) in entries {
        put_string(dst, k);
        put_string(dst, v);
    }
}

/// Reads a `[string]`, validating length against the remaining input.
pub fn get_string(src: &mut Bytes) -> Result<String> {
    if src.remaining() < 2 {
        return Err(truncated("string length"));
    }
    let len = src.get_u16() as usize;
    if src.remaining() < len {
        return Err(truncated("string bytes"));
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| DriverError::FrameCorruption {
        reason: "string is not valid UTF-8".to_string(),
    })
}

/// Reads a big-endian i32.
pub fn get_i32(src: &mut Bytes) -> Result<i32> {
    if src.remaining() < 4 {
        return Err(truncated("i32"));
    }
    Ok(src.get_i32())
}

/// Reads an `[inet]`: 1-byte address size (4 or 16), address bytes, i32 port.
pub fn get_inet(src: &mut Bytes) -> Result<std::net::SocketAddr> {
    if src.remaining() < 1 {
        return Err(truncated("inet size"));
    }
    let size = src.get_u8() as usize;
    if src.remaining() < size + 4 {
        return Err(truncated("inet body"));
    }
    let ip = match size {
        4 => {
            let mut octets = [0u8; 4];
            src.copy_to_slice(&mut octets);
            std::net::IpAddr::from(octets)
        }
        16 => {
            let mut octets = [0u8; 16];
            src.copy_to_slice(&mut octets);
            std::net::IpAddr::from(octets)
        }
        other => {
            return Err(DriverError::FrameCorruption {
                reason: format!("inet address size {other} is not 4 or 16"),
            })
        }
    };
    let port = src.get_i32();
    Ok(std::net::SocketAddr::new(ip, port as u16))
}

/// Parses an ERROR frame body into its code and message.
pub fn parse_error_body(body: &Bytes) -> Result<(i32, String)> {
    let mut cursor = body.clone();
    let code = get_i32(&mut cursor)?;
    let message = get_string(&mut cursor)?;
    Ok((code, message))
}

fn truncated(what: &str) -> DriverError {
    DriverError::FrameCorruption {
        reason: format!("truncated {what}"),
    }
}
