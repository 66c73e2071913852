//! PgSession.
//!
//! This crate provides synchronous client sessions over the Postgres
//! frontend/backend protocol: message framing, a session state machine on
//! top of a blocking byte stream, and pull-based row and notification
//! queues. It is deliberately low level — no query parsing, no type
//! decoding beyond declared format codes, no pooling.
//!
//! # Overview
//!
//! The crate is organized around a few core concepts:
//!
//! - **Connection establishment** over a Unix-domain socket or TCP via
//!   [`Session::connect_local`] / [`Session::connect_tcp`]
//! - **The session state machine** ([`Session`]), which frames client
//!   messages, consumes server replies in arrival order, and tracks
//!   connection, transaction and copy state
//! - **Queued results**: raw rows and rendered notifications pulled with
//!   [`Session::get_strings`], [`Session::get_raw_row`] and
//!   [`Session::get_notification`]
//!
//! # Example: Simple Query
//!
//! ```no_run
//! use pg_session::Session;
//!
//! # fn main() -> pg_session::Result<()> {
//! let mut session = Session::new();
//! session.connect_tcp("localhost", "postgresql")?;
//! session.startup("postgres", "")?;
//!
//! session.query("SELECT datname FROM pg_database;")?;
//! while session.row_queue_len() > 0 {
//!     println!("{}", session.get_strings()?.join("\t"));
//! }
//! while session.notification_queue_len() > 0 {
//!     println!("{}", session.get_notification()?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Copy In
//!
//! ```no_run
//! # use pg_session::{Session, SessionState};
//! # fn main() -> pg_session::Result<()> {
//! # let mut session = Session::new();
//! session.query("COPY t FROM STDIN;")?;
//! assert_eq!(SessionState::CopyIn, session.state());
//!
//! session.copy_data(b"1\tone\n")?;
//! session.copy_data(b"2\ttwo\n")?;
//! session.copy_done()?;
//! session.drive_to_ready()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Protocol scope
//!
//! Only the simple-query subprotocol is spoken: Query, Terminate, Sync,
//! Flush, the copy sub-modes, and out-of-band [`Session::cancel`] (which
//! opens a fresh connection, as the protocol requires). The extended
//! query protocol (Parse/Bind/Execute), TLS, and every authentication
//! mode other than AuthenticationOk are out of scope.
//!
//! # Concurrency
//!
//! Everything blocks. A session owns its transport exclusively and is not
//! safe for concurrent use from multiple threads; reads have no built-in
//! timeout. Server messages are consumed strictly in arrival order, and
//! both queues are strict FIFOs.
//!
//! # Error Handling
//!
//! Failures carry one [`ErrorKind`] and a message. Transport, protocol
//! and authentication errors are fatal to the session; state errors (an
//! API call in the wrong state, a pop from an empty queue) leave it
//! usable. Server-side errors are *not* Rust errors: an ErrorResponse is
//! rendered into the notification queue and the session proceeds to the
//! next ReadyForQuery.

mod error;
pub mod messages;
mod session;
mod transport;

pub use error::*;
pub use messages::backend::{FieldDescriptor, TransactionStatus};
pub use session::*;
pub use transport::*;
