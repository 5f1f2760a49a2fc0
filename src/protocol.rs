//! FastCGI wire format.
//!
//! Fixed-layout record header and record bodies. Multi-byte fields are kept
//! in network byte order exactly as they appear on the wire; accessors
//! convert to host order.
//!
//! ```text
//! ┌─────────┬──────┬────────────┬────────────────┬─────────┬──────────┐
//! │ version │ type │ request_id │ content_length │ padding │ reserved │
//! │ u8      │ u8   │ u16 BE     │ u16 BE         │ u8      │ u8       │
//! └─────────┴──────┴────────────┴────────────────┴─────────┴──────────┘
//! ```
//!
//! A record is the header, `content_length` bytes of content, then
//! `padding_length` bytes of padding.
//!
//! PARAMS bodies only use single-byte name/value lengths (0-255). The
//! 4-byte extended length encoding is not supported.

use crate::error::ProtocolError;

/// The only protocol version this server speaks.
pub const VERSION_1: u8 = 1;

/// Size of a record header in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest content length a single record can carry.
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;

/// Responder role, the only role supported.
pub const ROLE_RESPONDER: u16 = 1;

/// Record types defined by FastCGI 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl TryFrom<u8> for RecordType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            other => return Err(ProtocolError::UnknownRecordType(other)),
        })
    }
}

/// `protocol_status` values of an END_REQUEST body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMultiplexConnection = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

/// Fixed-size structures that can be decoded from raw record bytes.
pub trait Decode: Sized {
    /// Encoded size in bytes.
    const LEN: usize;

    /// Decode from the first `LEN` bytes of `bytes`.
    ///
    /// Callers guarantee `bytes.len() >= LEN`.
    fn decode(bytes: &[u8]) -> Self;
}

/// Record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub record_type: u8,
    request_id: [u8; 2],
    content_length: [u8; 2],
    pub padding_length: u8,
    pub reserved: u8,
}

impl Header {
    /// Build a version 1 header with no padding.
    pub fn new(record_type: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: VERSION_1,
            record_type: record_type as u8,
            request_id: request_id.to_be_bytes(),
            content_length: content_length.to_be_bytes(),
            padding_length: 0,
            reserved: 0,
        }
    }

    pub fn request_id(&self) -> u16 {
        u16::from_be_bytes(self.request_id)
    }

    pub fn content_length(&self) -> u16 {
        u16::from_be_bytes(self.content_length)
    }

    /// Total bytes occupied by the record on the wire.
    pub fn record_len(&self) -> usize {
        HEADER_LEN + usize::from(self.content_length()) + usize::from(self.padding_length)
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        [
            self.version,
            self.record_type,
            self.request_id[0],
            self.request_id[1],
            self.content_length[0],
            self.content_length[1],
            self.padding_length,
            self.reserved,
        ]
    }
}

impl Decode for Header {
    const LEN: usize = HEADER_LEN;

    fn decode(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= Self::LEN);
        Self {
            version: bytes[0],
            record_type: bytes[1],
            request_id: [bytes[2], bytes[3]],
            content_length: [bytes[4], bytes[5]],
            padding_length: bytes[6],
            reserved: bytes[7],
        }
    }
}

/// Body of a BEGIN_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    role: [u8; 2],
    pub flags: u8,
    pub reserved: [u8; 5],
}

impl BeginRequest {
    pub fn new(role: u16, flags: u8) -> Self {
        Self {
            role: role.to_be_bytes(),
            flags,
            reserved: [0; 5],
        }
    }

    pub fn role(&self) -> u16 {
        u16::from_be_bytes(self.role)
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..2].copy_from_slice(&self.role);
        out[2] = self.flags;
        out[3..].copy_from_slice(&self.reserved);
        out
    }
}

impl Decode for BeginRequest {
    const LEN: usize = 8;

    fn decode(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= Self::LEN);
        let mut reserved = [0u8; 5];
        reserved.copy_from_slice(&bytes[3..8]);
        Self {
            role: [bytes[0], bytes[1]],
            flags: bytes[2],
            reserved,
        }
    }
}

/// Body of an END_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    app_status: [u8; 4],
    pub protocol_status: u8,
    pub reserved: [u8; 3],
}

impl EndRequest {
    /// An end-request body with `app_status` 0.
    pub fn new(protocol_status: ProtocolStatus) -> Self {
        Self {
            app_status: 0u32.to_be_bytes(),
            protocol_status: protocol_status as u8,
            reserved: [0; 3],
        }
    }

    pub fn app_status(&self) -> u32 {
        u32::from_be_bytes(self.app_status)
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.app_status);
        out[4] = self.protocol_status;
        out
    }
}

impl Decode for EndRequest {
    const LEN: usize = 8;

    fn decode(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= Self::LEN);
        Self {
            app_status: [bytes[0], bytes[1], bytes[2], bytes[3]],
            protocol_status: bytes[4],
            reserved: [bytes[5], bytes[6], bytes[7]],
        }
    }
}

/// Length prefix of one PARAMS entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamHeader {
    pub key_length: u8,
    pub value_length: u8,
}

impl Decode for ParamHeader {
    const LEN: usize = 2;

    fn decode(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= Self::LEN);
        Self {
            key_length: bytes[0],
            value_length: bytes[1],
        }
    }
}

/// Iterator over the `(key, value)` entries of a PARAMS body.
///
/// Yields an error for a truncated entry and then stops.
pub struct Params<'a> {
    remaining: &'a [u8],
}

impl<'a> Params<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { remaining: body }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining.len() < n {
            return None;
        }
        let (head, tail) = self.remaining.split_at(n);
        self.remaining = tail;
        Some(head)
    }

    fn truncated(&mut self, missing: &'static str) -> Option<<Self as Iterator>::Item> {
        self.remaining = &[];
        Some(Err(ProtocolError::TruncatedParam { missing }))
    }
}

impl<'a> Iterator for Params<'a> {
    type Item = Result<(&'a [u8], &'a [u8]), ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        let header = match self.take(ParamHeader::LEN) {
            Some(bytes) => ParamHeader::decode(bytes),
            None => return self.truncated("header"),
        };
        let Some(key) = self.take(usize::from(header.key_length)) else {
            return self.truncated("key");
        };
        let Some(value) = self.take(usize::from(header.value_length)) else {
            return self.truncated("value");
        };
        Some(Ok((key, value)))
    }
}

/// Append one PARAMS entry to `out`.
///
/// Returns `false` (leaving `out` untouched) when the key or value is longer
/// than a single-byte length can describe.
pub fn encode_param(out: &mut Vec<u8>, key: &[u8], value: &[u8]) -> bool {
    let (Ok(key_length), Ok(value_length)) = (u8::try_from(key.len()), u8::try_from(value.len()))
    else {
        return false;
    };
    out.reserve(ParamHeader::LEN + key.len() + value.len());
    out.push(key_length);
    out.push(value_length);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    true
}

/// Encode a complete record (header, content, padding) into a new buffer.
///
/// Returns `None` if `content` exceeds [`MAX_CONTENT_LEN`].
pub fn encode_record(
    record_type: RecordType,
    request_id: u16,
    content: &[u8],
    padding_length: u8,
) -> Option<Vec<u8>> {
    let content_length = u16::try_from(content.len()).ok()?;
    let mut header = Header::new(record_type, request_id, content_length);
    header.padding_length = padding_length;

    let mut out = Vec::with_capacity(header.record_len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(content);
    out.resize(out.len() + usize::from(padding_length), 0);
    Some(out)
}
