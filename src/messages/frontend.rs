//! Logic for building and framing Postgres frontend messages.

use bytes::{BufMut, Bytes, BytesMut};

/// Protocol version 3.0: major in the upper 16 bits, minor in the lower.
pub const PROTOCOL_VERSION: u32 = (3 << 16) | 0;

/// The CancelRequest code, chosen to never collide with a protocol version
/// (major 1234, minor 5678).
pub const CANCEL_REQUEST_CODE: u32 = (1234 << 16) | 5678;

/// Postgres frontend messages are framed by a 1 byte message code,
/// followed by a u32 integer delineating the length of the rest of
/// the message.
///
/// The message code identifies the type of message and format of its
/// payload. StartupMessage and CancelRequest are the exceptions: they
/// carry no code byte and open directly with the length.
///
/// For more information, see the official Postgres docs:
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html>
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    pub const COPY_DATA: Self = Self(b'd');
    pub const COPY_DONE: Self = Self(b'c');
    pub const COPY_FAIL: Self = Self(b'f');
    pub const FLUSH: Self = Self(b'H');
    pub const QUERY: Self = Self(b'Q');
    pub const SYNC: Self = Self(b'S');
    pub const TERMINATE: Self = Self(b'X');

    #[inline]
    pub fn frame(self, buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
        buf.put_u8(self.0);
        frame(buf, payload_fn);
    }
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
            MessageCode::COPY_DATA => "CopyData",
            MessageCode::COPY_DONE => "CopyDone",
            MessageCode::COPY_FAIL => "CopyFail",
            MessageCode::FLUSH => "Flush",
            MessageCode::QUERY => "Query",
            MessageCode::SYNC => "Sync",
            MessageCode::TERMINATE => "Terminate",
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

/// Frames a payload by reserving a u32 length slot, running `payload_fn`,
/// and backpatching the big-endian length (the four length bytes count
/// toward it).
#[inline]
pub fn frame(buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
    let base = buf.len();
    buf.put_u32(0);

    payload_fn(buf);

    let len = (buf.len() - base) as u32;
    buf[base..base + size_of::<u32>()].copy_from_slice(&len.to_be_bytes());
}

#[inline]
pub(crate) fn put_cstring(b: &mut impl BufMut, src: &[u8]) {
    b.put_slice(src);
    b.put_u8(0);
}

/// Builds a StartupMessage: length, protocol version, then NUL-terminated
/// `user` and `database` key/value pairs and a terminating NUL. An empty
/// `database` defaults to `user`.
pub fn startup_message(user: &str, database: &str) -> Bytes {
    let database = if database.is_empty() { user } else { database };

    let mut buf = BytesMut::new();
    frame(&mut buf, |b| {
        b.put_u32(PROTOCOL_VERSION);

        put_cstring(b, b"user");
        put_cstring(b, user.as_bytes());

        put_cstring(b, b"database");
        put_cstring(b, database.as_bytes());

        b.put_u8(0);
    });

    buf.freeze()
}

/// Builds the 16-byte CancelRequest carrying the process id and secret key
/// from a previous BackendKeyData. Sent over a fresh connection, never the
/// session's own socket.
pub fn cancel_message(pid: i32, skey: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    frame(&mut buf, |b| {
        b.put_u32(CANCEL_REQUEST_CODE);
        b.put_i32(pid);
        b.put_i32(skey);
    });

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, BytesMut};

    use super::{MessageCode, cancel_message, frame, put_cstring, startup_message};

    /// Helper macro for asserting a slice or string from the buffer.
    /// Usage: `assert_buf_eq!(buf, b"SELECT 1\0");`
    macro_rules! assert_buf_eq {
        ($buf:expr, $expected:expr) => {{
            let len = $expected.len();
            let got = $buf.copy_to_bytes(len);
            assert_eq!(&$expected[..], &got[..]);
        }};
    }

    #[test]
    fn test_startup_message() {
        let msg = startup_message("alice", "alice");

        let mut expected = BytesMut::new();
        expected.extend_from_slice(&[0x00, 0x00, 0x00, 0x16]);
        expected.extend_from_slice(&[0x00, 0x03, 0x00, 0x00]);
        expected.extend_from_slice(b"user\0alice\0database\0alice\0\0");

        assert_eq!(22, msg.len());
        assert_eq!(&expected[..], &msg[..]);
    }

    #[test]
    fn test_startup_message_database_defaults_to_user() {
        assert_eq!(startup_message("alice", ""), startup_message("alice", "alice"));
    }

    #[test]
    fn test_cancel_message() {
        let mut msg = cancel_message(1234, 5678);

        assert_eq!(16, msg.len());
        assert_eq!(16, msg.get_u32());
        assert_eq!(0x04D2_162E, msg.get_u32());
        assert_eq!(1234, msg.get_i32());
        assert_eq!(5678, msg.get_i32());
    }

    #[test]
    fn test_query_frame() {
        let mut buf = BytesMut::new();
        MessageCode::QUERY.frame(&mut buf, |b| put_cstring(b, b"SELECT 1"));

        assert_eq!(b'Q', buf.get_u8());
        assert_eq!(13, buf.get_u32());
        assert_buf_eq!(buf, b"SELECT 1\0");
    }

    #[test]
    fn test_empty_payload_frames() {
        for (code, tag) in [
            (MessageCode::TERMINATE, b'X'),
            (MessageCode::SYNC, b'S'),
            (MessageCode::FLUSH, b'H'),
            (MessageCode::COPY_DONE, b'c'),
        ] {
            let mut buf = BytesMut::new();
            code.frame(&mut buf, |_| {});

            assert_eq!(tag, buf.get_u8());
            assert_eq!(4, buf.get_u32());
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_copy_data_frame() {
        let mut buf = BytesMut::new();
        MessageCode::COPY_DATA.frame(&mut buf, |b| b.extend_from_slice(b"a\tb\n"));

        assert_eq!(b'd', buf.get_u8());
        assert_eq!(8, buf.get_u32());
        assert_buf_eq!(buf, b"a\tb\n");
    }

    #[test]
    fn test_copy_fail_frame() {
        let mut buf = BytesMut::new();
        MessageCode::COPY_FAIL.frame(&mut buf, |b| put_cstring(b, b"gave up"));

        assert_eq!(b'f', buf.get_u8());
        assert_eq!(12, buf.get_u32());
        assert_buf_eq!(buf, b"gave up\0");
    }

    #[test]
    fn test_length_counts_from_length_field() {
        let mut buf = BytesMut::new();
        frame(&mut buf, |b| b.extend_from_slice(&[1, 2, 3]));

        assert_eq!(7, buf.get_u32());
    }
}
