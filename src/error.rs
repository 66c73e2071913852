pub type Result<T> = std::result::Result<T, Error>;

/// The error type for session, protocol and transport operations.
///
/// Server-reported errors (ErrorResponse) are not surfaced here: they are
/// rendered into the session's notification queue and the reply loop keeps
/// running until the server is ready for query again.
#[derive(Debug)]
pub enum Error {
    /// Socket open, resolve, read or write failure. The session should be
    /// discarded.
    Transport(std::io::Error),
    /// Malformed length, unexpected message tag, truncated payload or an
    /// invalid status byte. The stream can no longer be trusted.
    Protocol(String),
    /// The server requested an authentication mode other than
    /// AuthenticationOk.
    Auth(String),
    /// An API call made in the wrong session state, or a pop from an empty
    /// queue. The session remains usable.
    State(String),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Auth,
    State,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Auth(_) => ErrorKind::Auth,
            Error::State(_) => ErrorKind::State,
        }
    }

    /// Whether the session may keep being used after this error.
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::State
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::Protocol(e) => write!(f, "protocol violation: {e}"),
            Error::Auth(e) => write!(f, "authentication failed: {e}"),
            Error::State(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Transport(value)
    }
}
