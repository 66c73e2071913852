use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use log::{trace, warn};

use crate::error::{Error, Result};
use crate::messages::backend::{
    self, BackendFrame, FieldDescriptor, TransactionStatus,
};
use crate::messages::frontend::{self, put_cstring};
use crate::transport::{Endpoint, Transport};

/// Where a session is in its protocol lifecycle.
///
/// [`SessionState::ReadyForQuery`] is the only state in which a new simple
/// query may be submitted, and receiving a ReadyForQuery message is the
/// only way into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport attached.
    NotConnected,
    /// Transport attached, no startup exchange yet.
    NotStarted,
    /// The server is accepting input.
    ReadyForQuery,
    /// A simple query has been sent; replies are being consumed.
    InQuery,
    /// The server is waiting for CopyData from us.
    CopyIn,
    /// The server is streaming CopyData frames at us.
    CopyOut,
    /// The server finished its copy stream; CommandComplete pending.
    CopyDone,
    /// A command tag arrived; ReadyForQuery pending.
    Complete,
}

/// How queued raw rows should be split and rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFormat {
    /// No result data received yet.
    None,
    /// DataRow tuples described by the current field map.
    Query,
    /// Text-mode CopyData payloads.
    CopyText,
    /// Binary-mode CopyData payloads.
    CopyBinary,
}

/// A synchronous Postgres session: one exclusively-owned transport, the
/// protocol state machine, and the row and notification queues a caller
/// pulls from.
///
/// The stream type is generic so tests can drive a session from scripted
/// byte buffers; real sessions use [`Transport`] via
/// [`Session::connect_local`] or [`Session::connect_tcp`].
///
/// A session is not safe for concurrent use from multiple threads; every
/// call may block on the transport indefinitely.
pub struct Session<S: Read + Write = Transport> {
    stream: Option<S>,
    endpoint: Option<Endpoint>,
    buf: BytesMut,
    state: SessionState,
    tx_status: TransactionStatus,
    buffer_format: BufferFormat,
    pid: i32,
    skey: i32,
    parameters: HashMap<String, String>,
    notifications: VecDeque<String>,
    rows: VecDeque<Vec<u8>>,
    fields: Vec<(String, FieldDescriptor)>,
}

impl Session<Transport> {
    /// Creates an unconnected session.
    pub fn new() -> Self {
        Session {
            stream: None,
            endpoint: None,
            buf: BytesMut::new(),
            state: SessionState::NotConnected,
            tx_status: TransactionStatus::Idle,
            buffer_format: BufferFormat::None,
            pid: 0,
            skey: 0,
            parameters: HashMap::new(),
            notifications: VecDeque::new(),
            rows: VecDeque::new(),
            fields: Vec::new(),
        }
    }

    /// Connects to a local server over its Unix-domain socket file,
    /// assembled as `path + "/" + prefix + port`. Any prior transport is
    /// closed and all session state is reset.
    pub fn connect_local(&mut self, port: &str, path: &str, prefix: &str) -> Result<()> {
        let endpoint = Endpoint::unix(port, path, prefix);
        let transport = Transport::open(&endpoint)?;
        self.attach(transport, endpoint);
        Ok(())
    }

    /// Connects over TCP. The service may be a port number or a well-known
    /// Postgres service name; every resolved address is tried in order.
    /// Any prior transport is closed and all session state is reset.
    pub fn connect_tcp(&mut self, host: &str, service: &str) -> Result<()> {
        let endpoint = Endpoint::tcp(host, service)?;
        let transport = Transport::open(&endpoint)?;
        self.attach(transport, endpoint);
        Ok(())
    }

    fn attach(&mut self, transport: Transport, endpoint: Endpoint) {
        trace!("connected to {endpoint}");
        self.stream = Some(transport);
        self.endpoint = Some(endpoint);
        self.buf.clear();
        self.state = SessionState::NotStarted;
        self.tx_status = TransactionStatus::Idle;
        self.buffer_format = BufferFormat::None;
        self.pid = 0;
        self.skey = 0;
        self.parameters.clear();
        self.notifications.clear();
        self.rows.clear();
        self.fields.clear();
    }

    /// Asks the server to cancel the request currently running on this
    /// session's backend. The request travels over a fresh connection to
    /// the same endpoint and is advisory: the server may ignore it. The
    /// session itself — state, queues, field map — is left untouched.
    pub fn cancel(&self) -> Result<()> {
        if self.pid == 0 && self.skey == 0 {
            return Err(Error::State(
                "no backend key data received; cannot cancel".into(),
            ));
        }
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| Error::State("session has no endpoint to cancel against".into()))?;

        let mut channel = Transport::open(endpoint)?;
        channel.write_all(&frontend::cancel_message(self.pid, self.skey))?;
        channel.flush()?;
        trace!("(F)CancelRequest pid={}", self.pid);
        Ok(())
    }
}

impl Default for Session<Transport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Read + Write> Session<S> {
    /// Wraps an already-connected stream. The session starts in
    /// [`SessionState::NotStarted`], as if freshly connected.
    pub fn from_stream(stream: S) -> Session<S> {
        Session {
            stream: Some(stream),
            endpoint: None,
            buf: BytesMut::new(),
            state: SessionState::NotStarted,
            tx_status: TransactionStatus::Idle,
            buffer_format: BufferFormat::None,
            pid: 0,
            skey: 0,
            parameters: HashMap::new(),
            notifications: VecDeque::new(),
            rows: VecDeque::new(),
            fields: Vec::new(),
        }
    }

    /// Sends the startup message and processes replies until the server is
    /// ready for query. Only AuthenticationOk is accepted; any other
    /// authentication request fails the session.
    ///
    /// An empty `database` defaults to `user`. Not idempotent: a session
    /// that has already started must reconnect before starting again.
    pub fn startup(&mut self, user: &str, database: &str) -> Result<()> {
        if self.state != SessionState::NotStarted {
            return Err(Error::State(format!(
                "startup requires a freshly connected session (state {:?})",
                self.state
            )));
        }

        self.parameters.clear();
        self.buf.extend_from_slice(&frontend::startup_message(user, database));
        trace!("(F)StartupMessage user={user:?}");
        self.send()?;
        self.drive_to_ready()
    }

    /// Submits a simple query and processes every reply, returning once
    /// the server is ready for query again — or, for `COPY ... FROM
    /// STDIN`, once the server asks for input, in which case the session
    /// is left in [`SessionState::CopyIn`] and the caller feeds it with
    /// [`Session::copy_data`].
    ///
    /// Server errors do not fail this call: they are rendered into the
    /// notification queue and the transaction status reflects them.
    pub fn query(&mut self, sql: &str) -> Result<()> {
        if self.state != SessionState::ReadyForQuery {
            return Err(Error::State(format!(
                "query requires a session ready for input (state {:?})",
                self.state
            )));
        }

        frontend::MessageCode::QUERY.frame(&mut self.buf, |b| put_cstring(b, sql.as_bytes()));
        trace!("(F)Query {sql:?}");
        self.send()?;
        self.state = SessionState::InQuery;

        loop {
            match self.state {
                SessionState::ReadyForQuery | SessionState::CopyIn => return Ok(()),
                _ => {}
            }
            let frame = self.read_frame()?;
            self.process_reply(frame)?;
        }
    }

    /// Sends one CopyData frame. Legal only while the server is waiting
    /// for copy input.
    pub fn copy_data(&mut self, data: &[u8]) -> Result<()> {
        self.expect_copy_in("copy_data")?;
        frontend::MessageCode::COPY_DATA.frame(&mut self.buf, |b| b.put_slice(data));
        trace!("(F)CopyData {} bytes", data.len());
        self.send()
    }

    /// Ends a copy-in stream. The caller must still drive replies to
    /// completion with [`Session::drive_to_ready`].
    pub fn copy_done(&mut self) -> Result<()> {
        self.expect_copy_in("copy_done")?;
        frontend::MessageCode::COPY_DONE.frame(&mut self.buf, |_| {});
        trace!("(F)CopyDone");
        self.send()
    }

    /// Abandons a copy-in stream with an error message. The caller must
    /// still drive replies to completion with [`Session::drive_to_ready`].
    pub fn copy_fail(&mut self, message: &str) -> Result<()> {
        self.expect_copy_in("copy_fail")?;
        frontend::MessageCode::COPY_FAIL.frame(&mut self.buf, |b| put_cstring(b, message.as_bytes()));
        trace!("(F)CopyFail {message:?}");
        self.send()
    }

    fn expect_copy_in(&self, what: &str) -> Result<()> {
        if self.state != SessionState::CopyIn {
            return Err(Error::State(format!(
                "{what} requires a copy-in session (state {:?})",
                self.state
            )));
        }
        Ok(())
    }

    /// Sends a Sync message.
    pub fn sync(&mut self) -> Result<()> {
        frontend::MessageCode::SYNC.frame(&mut self.buf, |_| {});
        trace!("(F)Sync");
        self.send()
    }

    /// Sends a Flush message.
    pub fn flush(&mut self) -> Result<()> {
        frontend::MessageCode::FLUSH.frame(&mut self.buf, |_| {});
        trace!("(F)Flush");
        self.send()
    }

    /// Processes server replies until the session is ready for query.
    pub fn drive_to_ready(&mut self) -> Result<()> {
        while self.state != SessionState::ReadyForQuery {
            let frame = self.read_frame()?;
            self.process_reply(frame)?;
        }
        Ok(())
    }

    /// Sends Terminate and drops the transport. Called automatically on
    /// drop if the session is still connected.
    pub fn terminate(&mut self) -> Result<()> {
        let res = match self.stream.as_mut() {
            Some(stream) => {
                let mut buf = BytesMut::new();
                frontend::MessageCode::TERMINATE.frame(&mut buf, |_| {});
                trace!("(F)Terminate");
                stream
                    .write_all(&buf)
                    .and_then(|_| stream.flush())
                    .map_err(Error::Transport)
            }
            None => Ok(()),
        };
        self.stream = None;
        self.endpoint = None;
        self.state = SessionState::NotConnected;
        res
    }

    fn send(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::State("session is not connected".into()))?;
        stream.write_all(&self.buf)?;
        stream.flush()?;
        self.buf.clear();
        Ok(())
    }

    fn read_frame(&mut self) -> Result<BackendFrame> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::State("session is not connected".into()))?;
        let frame = backend::read_frame(stream)?;
        trace!("(B){}", frame.code);
        Ok(frame)
    }

    /// Dispatches one backend message: side effects on the queues and
    /// maps, then the state transition it drives. The frame body has
    /// already been consumed off the wire, so a failure here never leaves
    /// the stream desynchronized mid-message.
    fn process_reply(&mut self, mut frame: BackendFrame) -> Result<()> {
        use backend::MessageCode as Code;

        match frame.code {
            Code::AUTHENTICATION => {
                if frame.body.remaining() < 4 {
                    return Err(Error::Protocol("truncated Authentication body".into()));
                }
                let auth_code = frame.body.get_i32();
                if auth_code != 0 {
                    return Err(Error::Auth(format!(
                        "authentication mode {auth_code} is not supported"
                    )));
                }
            }
            Code::PARAMETER_STATUS => {
                let (name, value) = backend::parse_parameter_status(frame.body)?;
                self.parameters.insert(name, value);
            }
            Code::BACKEND_KEY_DATA => {
                (self.pid, self.skey) = backend::parse_backend_key_data(frame.body)?;
            }
            Code::ROW_DESCRIPTION => {
                self.fields = backend::parse_row_description(frame.body)?;
                self.rows.clear();
                self.buffer_format = BufferFormat::Query;
            }
            Code::DATA_ROW => {
                self.rows.push_back(frame.body.to_vec());
            }
            Code::COMMAND_COMPLETE => {
                let tag = backend::read_cstring(&mut frame.body)?;
                self.notifications.push_back(tag);
                self.state = SessionState::Complete;
            }
            Code::EMPTY_QUERY_RESPONSE => {
                self.notifications.push_back("[Empty request]".to_string());
            }
            Code::ERROR_RESPONSE | Code::NOTICE_RESPONSE | Code::NOTIFICATION_RESPONSE => {
                let rendered = backend::render_fields(&frame.body);
                if frame.code == Code::NOTICE_RESPONSE {
                    warn!("{rendered}");
                }
                self.notifications.push_back(rendered);
            }
            Code::COPY_IN_RESPONSE => {
                self.buffer_format = if backend::parse_copy_response(&frame.body)? {
                    BufferFormat::CopyBinary
                } else {
                    BufferFormat::CopyText
                };
                self.state = SessionState::CopyIn;
            }
            Code::COPY_OUT_RESPONSE => {
                self.buffer_format = if backend::parse_copy_response(&frame.body)? {
                    BufferFormat::CopyBinary
                } else {
                    BufferFormat::CopyText
                };
                self.rows.clear();
                self.state = SessionState::CopyOut;
            }
            Code::COPY_DATA => {
                self.rows.push_back(frame.body.to_vec());
            }
            Code::COPY_DONE => {
                self.state = SessionState::CopyDone;
            }
            Code::READY_FOR_QUERY => {
                self.tx_status = backend::parse_ready_for_query(&frame.body)?;
                self.state = SessionState::ReadyForQuery;
            }
            code => {
                return Err(Error::Protocol(format!("unexpected message {code}")));
            }
        }
        Ok(())
    }
}

impl<S: Read + Write> Session<S> {
    /// The current protocol state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The transaction status reported by the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// How the queued raw rows should be interpreted.
    pub fn buffer_format(&self) -> BufferFormat {
        self.buffer_format
    }

    /// Whether the server is accepting input.
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::ReadyForQuery
    }

    /// Whether a transport is attached.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// The backend process id from BackendKeyData, zero before startup.
    pub fn backend_pid(&self) -> i32 {
        self.pid
    }

    /// The cancellation secret key from BackendKeyData, zero before startup.
    pub fn secret_key(&self) -> i32 {
        self.skey
    }

    /// Server-advertised session parameters, last writer wins.
    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    /// Looks up one session parameter.
    pub fn get_parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// The columns of the current result set, in declaration order.
    pub fn field_descriptors(&self) -> &[(String, FieldDescriptor)] {
        &self.fields
    }

    pub fn row_queue_len(&self) -> usize {
        self.rows.len()
    }

    pub fn notification_queue_len(&self) -> usize {
        self.notifications.len()
    }

    /// Pops the oldest queued row as raw payload bytes.
    pub fn get_raw_row(&mut self) -> Result<Vec<u8>> {
        self.rows
            .pop_front()
            .ok_or_else(|| Error::State("row queue is empty".into()))
    }

    /// The oldest queued row, without removing it.
    pub fn peek_raw_row(&self) -> Option<&[u8]> {
        self.rows.front().map(Vec::as_slice)
    }

    /// Pops the oldest queued row decoded into one string per column
    /// under the current buffer format (see [`Session::peek_strings`]).
    pub fn get_strings(&mut self) -> Result<Vec<String>> {
        let row = self.peek_strings()?;
        self.rows.pop_front();
        Ok(row)
    }

    /// Decodes the oldest queued row without removing it.
    ///
    /// Query rows yield one string per column: NULL becomes the empty
    /// string, text columns are taken as UTF-8, and binary columns render
    /// printable bytes as themselves and `.` otherwise. Copy-text rows
    /// yield the payload as a single string; copy-binary rows the same,
    /// with non-printable bytes replaced by `.`.
    pub fn peek_strings(&self) -> Result<Vec<String>> {
        let row = self
            .rows
            .front()
            .ok_or_else(|| Error::State("row queue is empty".into()))?;

        match self.buffer_format {
            BufferFormat::Query => {
                let columns = backend::parse_data_row(row)?;
                let mut out = Vec::with_capacity(columns.len());
                for (i, column) in columns.iter().enumerate() {
                    let binary = self
                        .fields
                        .get(i)
                        .is_some_and(|(_, descriptor)| descriptor.is_binary());
                    out.push(match column {
                        None => String::new(),
                        Some(bytes) if binary => printable(bytes),
                        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                    });
                }
                Ok(out)
            }
            BufferFormat::CopyText => Ok(vec![String::from_utf8_lossy(row).into_owned()]),
            BufferFormat::CopyBinary | BufferFormat::None => Ok(vec![printable(row)]),
        }
    }

    /// Discards every queued row.
    pub fn clear_row_queue(&mut self) {
        self.rows.clear();
    }

    /// Pops the oldest queued notification string.
    pub fn get_notification(&mut self) -> Result<String> {
        self.notifications
            .pop_front()
            .ok_or_else(|| Error::State("notification queue is empty".into()))
    }

    /// The oldest queued notification, without removing it.
    pub fn peek_notification(&self) -> Option<&str> {
        self.notifications.front().map(String::as_str)
    }
}

impl<S: Read + Write> Drop for Session<S> {
    fn drop(&mut self) {
        if self.stream.is_some() {
            let _ = self.terminate();
        }
    }
}

fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}
