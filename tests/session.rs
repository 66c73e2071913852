use std::cell::RefCell;
use std::io::{self, Cursor, Read, Write};
use std::rc::Rc;

use bytes::{BufMut, BytesMut};
use pg_session::{BufferFormat, ErrorKind, Session, SessionState, TransactionStatus};

/// One half of a scripted exchange: replies are served from a pre-recorded
/// byte stream and everything the session writes is captured, so each test
/// can assert both sides of the wire.
#[derive(Clone)]
struct ScriptedStream {
    replies: Rc<RefCell<Cursor<Vec<u8>>>>,
    sent: Rc<RefCell<Vec<u8>>>,
}

impl ScriptedStream {
    fn new(replies: Vec<u8>) -> Self {
        ScriptedStream {
            replies: Rc::new(RefCell::new(Cursor::new(replies))),
            sent: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn sent(&self) -> Vec<u8> {
        self.sent.borrow().clone()
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.replies.borrow_mut().read(buf)
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sent.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn msg(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(tag);
    buf.put_u32(payload.len() as u32 + 4);
    buf.put_slice(payload);
    buf.to_vec()
}

fn row_description(names: &[&str]) -> Vec<u8> {
    let mut payload = BytesMut::new();
    payload.put_i16(names.len() as i16);
    for name in names {
        payload.put_slice(name.as_bytes());
        payload.put_u8(0);
        payload.put_i32(0); // table oid
        payload.put_i16(0); // column no
        payload.put_i32(23); // int4
        payload.put_i16(4);
        payload.put_i32(-1);
        payload.put_i16(0); // text
    }
    msg(b'T', &payload)
}

fn data_row(columns: &[Option<&[u8]>]) -> Vec<u8> {
    let mut payload = BytesMut::new();
    payload.put_i16(columns.len() as i16);
    for column in columns {
        match column {
            Some(bytes) => {
                payload.put_i32(bytes.len() as i32);
                payload.put_slice(bytes);
            }
            None => payload.put_i32(-1),
        }
    }
    msg(b'D', &payload)
}

fn startup_replies() -> Vec<Vec<u8>> {
    vec![
        msg(b'R', &0_i32.to_be_bytes()),
        msg(b'S', b"server_version\09.6\0"),
        msg(b'K', &[0x00, 0x00, 0x04, 0xD2, 0x00, 0x00, 0x16, 0x2E]),
        msg(b'Z', b"I"),
    ]
}

/// A session taken through startup, with `extra` replies queued behind it.
fn ready_session(extra: &[Vec<u8>]) -> (Session<ScriptedStream>, ScriptedStream) {
    let mut replies = startup_replies();
    replies.extend_from_slice(extra);
    let stream = ScriptedStream::new(replies.concat());
    let mut session = Session::from_stream(stream.clone());
    session.startup("alice", "").unwrap();
    (session, stream)
}

#[test]
fn trivial_startup() {
    let stream = ScriptedStream::new(startup_replies().concat());
    let mut session = Session::from_stream(stream.clone());

    session.startup("alice", "").unwrap();

    assert_eq!(SessionState::ReadyForQuery, session.state());
    assert_eq!(TransactionStatus::Idle, session.transaction_status());
    assert_eq!(Some("9.6"), session.get_parameter("server_version"));
    assert_eq!(1234, session.backend_pid());
    assert_eq!(5678, session.secret_key());

    let mut expected = vec![0x00, 0x00, 0x00, 0x16, 0x00, 0x03, 0x00, 0x00];
    expected.extend_from_slice(b"user\0alice\0database\0alice\0\0");
    assert_eq!(expected, stream.sent());
}

#[test]
fn startup_is_not_idempotent() {
    let (mut session, _stream) = ready_session(&[]);
    let err = session.startup("alice", "").unwrap_err();
    assert_eq!(ErrorKind::State, err.kind());
    // state errors are recoverable; the session is still ready
    assert!(session.is_ready());
}

#[test]
fn single_row_query() {
    let (mut session, _stream) = ready_session(&[
        row_description(&["?column?"]),
        data_row(&[Some(b"1")]),
        msg(b'C', b"SELECT 1\0"),
        msg(b'Z', b"I"),
    ]);

    session.query("SELECT 1;").unwrap();

    assert_eq!(SessionState::ReadyForQuery, session.state());
    assert_eq!(BufferFormat::Query, session.buffer_format());
    assert_eq!(1, session.row_queue_len());
    assert_eq!(vec!["1".to_string()], session.get_strings().unwrap());
    assert_eq!("SELECT 1", session.get_notification().unwrap());

    let (name, descriptor) = &session.field_descriptors()[0];
    assert_eq!("?column?", name);
    assert_eq!(23, descriptor.data_type);
}

#[test]
fn empty_query() {
    let (mut session, _stream) = ready_session(&[msg(b'I', b""), msg(b'Z', b"I")]);

    session.query(";").unwrap();

    assert_eq!(0, session.row_queue_len());
    assert_eq!(Some("[Empty request]"), session.peek_notification());
    assert_eq!("[Empty request]", session.get_notification().unwrap());
    assert_eq!(SessionState::ReadyForQuery, session.state());
}

#[test]
fn server_error_is_a_notification_not_an_err() {
    let (mut session, _stream) = ready_session(&[
        msg(b'E', b"SERROR\0C42703\0Mcolumn \"bad\" does not exist\0\0"),
        msg(b'Z', b"E"),
    ]);

    session.query("SELECT bad;").unwrap();

    assert_eq!(
        "ERROR: column \"bad\" does not exist",
        session.get_notification().unwrap()
    );
    assert_eq!(TransactionStatus::Error, session.transaction_status());
    assert_eq!(SessionState::ReadyForQuery, session.state());
}

#[test]
fn notice_during_startup() {
    let replies = [
        msg(b'R', &0_i32.to_be_bytes()),
        msg(b'N', b"SNOTICE\0Mhello\0\0"),
        msg(b'S', b"server_version\09.6\0"),
        msg(b'Z', b"I"),
    ];
    let stream = ScriptedStream::new(replies.concat());
    let mut session = Session::from_stream(stream);

    session.startup("alice", "").unwrap();

    assert_eq!(SessionState::ReadyForQuery, session.state());
    assert_eq!("NOTICE: hello", session.get_notification().unwrap());
}

#[test]
fn copy_out_of_two_rows() {
    let (mut session, _stream) = ready_session(&[
        msg(b'H', &[0, 0, 1, 0, 0]),
        msg(b'd', b"a\tb\n"),
        msg(b'd', b"c\td\n"),
        msg(b'c', b""),
        msg(b'C', b"COPY 2\0"),
        msg(b'Z', b"I"),
    ]);

    session.query("COPY t TO STDOUT;").unwrap();

    assert_eq!(BufferFormat::CopyText, session.buffer_format());
    assert_eq!(2, session.row_queue_len());
    assert_eq!(Some(&b"a\tb\n"[..]), session.peek_raw_row());
    assert_eq!(b"a\tb\n".to_vec(), session.get_raw_row().unwrap());
    assert_eq!(vec!["c\td\n".to_string()], session.get_strings().unwrap());
    assert_eq!("COPY 2", session.get_notification().unwrap());
    assert_eq!(SessionState::ReadyForQuery, session.state());
}

#[test]
fn copy_in_round_trip() {
    let (mut session, stream) = ready_session(&[
        msg(b'G', &[0, 0, 2, 0, 0, 0, 0]),
        msg(b'C', b"COPY 2\0"),
        msg(b'Z', b"I"),
    ]);

    session.query("COPY t FROM STDIN;").unwrap();
    assert_eq!(SessionState::CopyIn, session.state());
    assert_eq!(BufferFormat::CopyText, session.buffer_format());

    session.copy_data(b"1\tone\n").unwrap();
    session.copy_data(b"2\ttwo\n").unwrap();
    session.copy_done().unwrap();
    session.drive_to_ready().unwrap();

    assert_eq!(SessionState::ReadyForQuery, session.state());
    assert_eq!("COPY 2", session.get_notification().unwrap());

    let expected_tail = [
        msg(b'd', b"1\tone\n"),
        msg(b'd', b"2\ttwo\n"),
        msg(b'c', b""),
    ]
    .concat();
    let sent = stream.sent();
    assert_eq!(&expected_tail, &sent[sent.len() - expected_tail.len()..]);
}

#[test]
fn copy_fail_is_sent_and_error_surfaces_as_notification() {
    let (mut session, stream) = ready_session(&[
        msg(b'G', &[0, 0, 1, 0, 0]),
        msg(b'E', b"SERROR\0MCOPY from stdin failed: gave up\0\0"),
        msg(b'Z', b"I"),
    ]);

    session.query("COPY t FROM STDIN;").unwrap();
    session.copy_fail("gave up").unwrap();
    session.drive_to_ready().unwrap();

    assert_eq!(SessionState::ReadyForQuery, session.state());
    assert_eq!(
        "ERROR: COPY from stdin failed: gave up",
        session.get_notification().unwrap()
    );

    let expected_tail = msg(b'f', b"gave up\0");
    let sent = stream.sent();
    assert_eq!(&expected_tail[..], &sent[sent.len() - expected_tail.len()..]);
}

#[test]
fn row_description_resets_between_queries() {
    let (mut session, _stream) = ready_session(&[
        row_description(&["a"]),
        data_row(&[Some(b"1")]),
        data_row(&[Some(b"2")]),
        msg(b'C', b"SELECT 2\0"),
        msg(b'Z', b"I"),
        row_description(&["x", "y"]),
        data_row(&[Some(b"3"), None]),
        msg(b'C', b"SELECT 1\0"),
        msg(b'Z', b"I"),
    ]);

    session.query("SELECT a FROM t;").unwrap();
    assert_eq!(2, session.row_queue_len());

    // stale rows from the first result set are dropped by the new description
    session.query("SELECT x, y FROM u;").unwrap();
    assert_eq!(1, session.row_queue_len());
    assert_eq!(2, session.field_descriptors().len());
    assert_eq!(
        vec!["3".to_string(), String::new()],
        session.get_strings().unwrap()
    );
}

#[test]
fn parameter_updates_interleaved_with_query() {
    let (mut session, _stream) = ready_session(&[
        msg(b'S', b"TimeZone\0UTC\0"),
        msg(b'S', b"TimeZone\0America/Chicago\0"),
        msg(b'C', b"SET\0"),
        msg(b'Z', b"I"),
    ]);

    session.query("SET TimeZone = 'America/Chicago';").unwrap();

    assert_eq!(Some("America/Chicago"), session.get_parameter("TimeZone"));
}

#[test]
fn invalid_transaction_status_byte_is_a_protocol_error() {
    let (mut session, _stream) = ready_session(&[msg(b'C', b"SELECT 0\0"), msg(b'Z', b"X")]);

    let err = session.query("SELECT 0;").unwrap_err();
    assert_eq!(ErrorKind::Protocol, err.kind());
}

#[test]
fn unknown_tag_is_a_protocol_error_naming_it() {
    let (mut session, _stream) = ready_session(&[msg(b'v', b"junk")]);

    let err = session.query("SELECT 1;").unwrap_err();
    assert_eq!(ErrorKind::Protocol, err.kind());
    assert!(err.to_string().contains('v'), "{err}");
}

#[test]
fn sync_and_flush_send_their_frames() {
    let (mut session, stream) = ready_session(&[]);

    session.sync().unwrap();
    session.flush().unwrap();

    let sent = stream.sent();
    let expected_tail = [b'S', 0, 0, 0, 4, b'H', 0, 0, 0, 4];
    assert_eq!(&expected_tail, &sent[sent.len() - expected_tail.len()..]);
}

#[test]
fn terminate_sends_x_and_disconnects() {
    let (mut session, stream) = ready_session(&[]);

    session.terminate().unwrap();

    assert_eq!(SessionState::NotConnected, session.state());
    assert!(!session.is_connected());

    let sent = stream.sent();
    assert_eq!(&[b'X', 0, 0, 0, 4], &sent[sent.len() - 5..]);
}

#[test]
fn drop_sends_terminate() {
    let stream = ScriptedStream::new(startup_replies().concat());
    {
        let mut session = Session::from_stream(stream.clone());
        session.startup("alice", "").unwrap();
    }

    let sent = stream.sent();
    assert_eq!(&[b'X', 0, 0, 0, 4], &sent[sent.len() - 5..]);
}

#[test]
fn cancel_without_key_data_is_a_state_error() {
    let session = Session::new();

    let err = session.cancel().unwrap_err();
    assert_eq!(ErrorKind::State, err.kind());
    // issuing (or failing to issue) a cancel never touches the session
    assert_eq!(SessionState::NotConnected, session.state());
}
