//! Logic for reading and parsing Postgres backend messages.

use std::io::Read;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Maximum allowed frame size from Postgres (1GiB).
///
/// This is an upper bound to prevent misbehaving servers from
/// allocating excessive memory or causing OOMs.
/// See: <https://github.com/postgres/postgres/blob/879c492480d0e9ad8155c4269f95c5e8add41901/src/include/utils/memutils.h#L40>
const MAX_FRAME_SIZE_BYTES: usize = 1 << 30; // 1GiB

/// Postgres backend messages are framed by a 1-byte message code,
/// followed by an i32 length for the rest of the message body.
///
/// The message code identifies the type of message and the structure
/// of its payload.
///
/// See: <https://www.postgresql.org/docs/current/protocol-message-formats.html>
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    pub const AUTHENTICATION: Self = Self(b'R');
    pub const BACKEND_KEY_DATA: Self = Self(b'K');
    pub const COMMAND_COMPLETE: Self = Self(b'C');
    pub const COPY_DATA: Self = Self(b'd');
    pub const COPY_DONE: Self = Self(b'c');
    pub const COPY_IN_RESPONSE: Self = Self(b'G');
    pub const COPY_OUT_RESPONSE: Self = Self(b'H');
    pub const DATA_ROW: Self = Self(b'D');
    pub const EMPTY_QUERY_RESPONSE: Self = Self(b'I');
    pub const ERROR_RESPONSE: Self = Self(b'E');
    pub const NOTICE_RESPONSE: Self = Self(b'N');
    pub const NOTIFICATION_RESPONSE: Self = Self(b'A');
    pub const PARAMETER_STATUS: Self = Self(b'S');
    pub const READY_FOR_QUERY: Self = Self(b'Z');
    pub const ROW_DESCRIPTION: Self = Self(b'T');
}

impl From<u8> for MessageCode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<MessageCode> for u8 {
    fn from(value: MessageCode) -> Self {
        value.0
    }
}

impl PartialEq<u8> for MessageCode {
    fn eq(&self, other: &u8) -> bool {
        self.0 == *other
    }
}

impl PartialEq<MessageCode> for u8 {
    fn eq(&self, other: &MessageCode) -> bool {
        *self == other.0
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            MessageCode::AUTHENTICATION => "Authentication",
            MessageCode::BACKEND_KEY_DATA => "BackendKeyData",
            MessageCode::COMMAND_COMPLETE => "CommandComplete",
            MessageCode::COPY_DATA => "CopyData",
            MessageCode::COPY_DONE => "CopyDone",
            MessageCode::COPY_IN_RESPONSE => "CopyInResponse",
            MessageCode::COPY_OUT_RESPONSE => "CopyOutResponse",
            MessageCode::DATA_ROW => "DataRow",
            MessageCode::EMPTY_QUERY_RESPONSE => "EmptyQueryResponse",
            MessageCode::ERROR_RESPONSE => "ErrorResponse",
            MessageCode::NOTICE_RESPONSE => "NoticeResponse",
            MessageCode::NOTIFICATION_RESPONSE => "NotificationResponse",
            MessageCode::PARAMETER_STATUS => "ParameterStatus",
            MessageCode::READY_FOR_QUERY => "ReadyForQuery",
            MessageCode::ROW_DESCRIPTION => "RowDescription",
            _ => "Unknown",
        };
        write!(f, "{name}({})", self.0 as char)
    }
}

impl std::fmt::Debug for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageCode({})", self.0 as char)
    }
}

/// A single backend protocol frame: the message code and the message body
/// with the header stripped.
#[derive(Debug, Clone)]
pub struct BackendFrame {
    /// The type of the message
    pub code: MessageCode,
    /// The payload of the message
    pub body: Bytes,
}

impl std::fmt::Display for BackendFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.code, self.body)
    }
}

/// Reads a single backend frame from a blocking stream: exactly five
/// header bytes, then exactly `length - 4` payload bytes.
///
/// Lengths below 4 or above [`MAX_FRAME_SIZE_BYTES`] fail before any
/// payload is read; the stream should be considered desynchronized.
pub fn read_frame(stream: &mut impl Read) -> Result<BackendFrame> {
    let mut header = [0; 5];
    stream.read_exact(&mut header)?;

    let code = MessageCode::from(header[0]);
    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len < 4 {
        return Err(Error::Protocol(format!("message length {len} in {code}")));
    }

    let len = len as usize - size_of::<u32>();
    if len > MAX_FRAME_SIZE_BYTES {
        return Err(Error::Protocol(format!(
            "frame size exceeds {MAX_FRAME_SIZE_BYTES}B in {code}"
        )));
    }

    let mut body = BytesMut::zeroed(len);
    stream.read_exact(&mut body)?;

    Ok(BackendFrame {
        code,
        body: body.freeze(),
    })
}

/// Reads a null-terminated string from a `Bytes` buffer.
///
/// The returned string excludes the null terminator. Fails if no null
/// terminator is found; invalid UTF-8 is replaced rather than rejected,
/// since Postgres strings are only ASCII-compatible by convention.
pub fn read_cstring(bytes: &mut Bytes) -> Result<String> {
    let Some(end) = bytes.iter().position(|&b| b == 0) else {
        return Err(Error::Protocol("null terminator missing".into()));
    };

    let bytes = bytes.split_to(end + 1);
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Per-column metadata from a RowDescription. All integers arrive
/// big-endian and signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Oid of the originating table, or zero
    pub table_oid: i32,
    /// Column number within the table, or zero
    pub column_no: i16,
    /// Oid of the column type
    pub data_type: i32,
    /// Binary type width; negative means variable width
    pub type_size: i16,
    /// Type-specific modifier
    pub type_modf: i32,
    /// Zero for text, one for binary
    pub format_code: i16,
}

impl FieldDescriptor {
    pub fn is_binary(&self) -> bool {
        self.format_code == 1
    }
}

/// Parses a RowDescription body into an ordered (name, descriptor) list.
pub fn parse_row_description(mut body: Bytes) -> Result<Vec<(String, FieldDescriptor)>> {
    if body.remaining() < 2 {
        return Err(Error::Protocol("truncated RowDescription".into()));
    }

    let nfields = body.get_i16();
    let mut fields = Vec::with_capacity(nfields.max(0) as usize);
    for _ in 0..nfields {
        let name = read_cstring(&mut body)?;
        if body.remaining() < 18 {
            return Err(Error::Protocol(format!(
                "truncated field descriptor for column {name:?}"
            )));
        }
        let descriptor = FieldDescriptor {
            table_oid: body.get_i32(),
            column_no: body.get_i16(),
            data_type: body.get_i32(),
            type_size: body.get_i16(),
            type_modf: body.get_i32(),
            format_code: body.get_i16(),
        };
        fields.push((name, descriptor));
    }

    Ok(fields)
}

/// Splits a DataRow payload into per-column byte slices: an i16 column
/// count, then per column an i32 length and that many bytes. A length of
/// -1 denotes SQL NULL and consumes no value bytes.
pub fn parse_data_row(payload: &[u8]) -> Result<Vec<Option<&[u8]>>> {
    let mut rest = payload
        .get(2..)
        .ok_or_else(|| Error::Protocol("truncated DataRow".into()))?;
    let ncols = i16::from_be_bytes([payload[0], payload[1]]);

    let mut columns = Vec::with_capacity(ncols.max(0) as usize);
    for _ in 0..ncols {
        let Some((len, tail)) = rest.split_first_chunk::<4>() else {
            return Err(Error::Protocol("truncated DataRow column".into()));
        };
        rest = tail;

        let len = i32::from_be_bytes(*len);
        if len < 0 {
            columns.push(None);
            continue;
        }

        let len = len as usize;
        if rest.len() < len {
            return Err(Error::Protocol("truncated DataRow value".into()));
        }
        columns.push(Some(&rest[..len]));
        rest = &rest[len..];
    }

    Ok(columns)
}

/// Parses a ParameterStatus body: the parameter name and its value.
pub fn parse_parameter_status(mut body: Bytes) -> Result<(String, String)> {
    let name = read_cstring(&mut body)?;
    let value = read_cstring(&mut body)?;
    Ok((name, value))
}

/// Parses a BackendKeyData body: the backend process id and the secret
/// key a later CancelRequest must present.
pub fn parse_backend_key_data(mut body: Bytes) -> Result<(i32, i32)> {
    if body.remaining() != 8 {
        return Err(Error::Protocol(format!(
            "BackendKeyData body of {} bytes",
            body.remaining()
        )));
    }
    Ok((body.get_i32(), body.get_i32()))
}

/// Server transaction status, as reported by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction
    Idle,
    /// In a transaction
    Active,
    /// In a failed transaction, queries rejected until the block ends
    Error,
}

/// Parses a ReadyForQuery body: a single status byte.
pub fn parse_ready_for_query(body: &Bytes) -> Result<TransactionStatus> {
    match body.first() {
        Some(b'I') => Ok(TransactionStatus::Idle),
        Some(b'T') => Ok(TransactionStatus::Active),
        Some(b'E') => Ok(TransactionStatus::Error),
        Some(b) => Err(Error::Protocol(format!(
            "transaction status byte 0x{b:02x}"
        ))),
        None => Err(Error::Protocol("empty ReadyForQuery body".into())),
    }
}

/// Parses a Copy{In,Out}Response body. The first byte selects the overall
/// format: non-zero is binary, zero is text. The per-column format codes
/// that follow are consumed with the frame and not retained.
pub fn parse_copy_response(body: &Bytes) -> Result<bool> {
    match body.first() {
        Some(format) => Ok(*format != 0),
        None => Err(Error::Protocol("empty CopyResponse body".into())),
    }
}

/// Renders the field list of an ErrorResponse, NoticeResponse or
/// NotificationResponse as `"<severity>: <message>"`.
///
/// Each field is a 1-byte tag followed by a NUL-terminated value; a zero
/// tag terminates the list, even as the first byte. Fields other than
/// severity (`S`) and message (`M`) are consumed and ignored.
pub fn render_fields(body: &[u8]) -> String {
    let mut severity = None;
    let mut message = None;

    let mut rest = body;
    while let [tag, tail @ ..] = rest {
        if *tag == 0 {
            break;
        }

        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        match tag {
            b'S' => severity = Some(&tail[..end]),
            b'M' => message = Some(&tail[..end]),
            _ => {}
        }
        rest = &tail[(end + 1).min(tail.len())..];
    }

    let mut rendered = String::new();
    if let Some(severity) = severity {
        rendered.push_str(&String::from_utf8_lossy(severity));
    }
    if let Some(message) = message {
        rendered.push_str(": ");
        rendered.push_str(&String::from_utf8_lossy(message));
    }
    rendered
}
