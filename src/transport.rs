use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Default Unix-domain socket location pieces and TCP service name.
pub const DEFAULT_PORT: &str = "5432";
pub const DEFAULT_SOCKET_PATH: &str = "/private/tmp";
pub const DEFAULT_SOCKET_PREFIX: &str = ".s.PGSQL.";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_SERVICE: &str = "postgresql";

/// Where a session connects. Retained by the session so a CancelRequest
/// can open a second connection to the same place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A Unix-domain socket file.
    Unix(PathBuf),
    /// A TCP host and resolved port.
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// A local server's socket file, assembled as `path + "/" + prefix + port`.
    pub fn unix(port: &str, path: &str, prefix: &str) -> Self {
        Endpoint::Unix(PathBuf::from(format!("{path}/{prefix}{port}")))
    }

    /// A remote server reached over TCP. The service may be a port number
    /// or a well-known Postgres service name.
    pub fn tcp(host: &str, service: &str) -> Result<Self> {
        Ok(Endpoint::Tcp {
            host: host.to_string(),
            port: resolve_service(service)?,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

// std has no service-database lookup (getservbyname), so numeric services
// are ports and only the well-known Postgres names resolve.
fn resolve_service(service: &str) -> Result<u16> {
    if let Ok(port) = service.parse() {
        return Ok(port);
    }
    match service {
        "postgresql" | "postgres" => Ok(5432),
        _ => Err(Error::Transport(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot resolve service name {service:?}"),
        ))),
    }
}

/// A blocking byte channel to the server: a connected Unix-domain or TCP
/// stream behind one `Read`/`Write` surface.
#[derive(Debug)]
pub enum Transport {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Transport {
    /// Opens a stream to the endpoint. TCP hosts are resolved and each
    /// address is tried in order until one connects.
    pub fn open(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Unix(path) => Ok(Transport::Unix(UnixStream::connect(path)?)),
            Endpoint::Tcp { host, port } => {
                let mut last_err = None;
                for addr in (host.as_str(), *port).to_socket_addrs()? {
                    match TcpStream::connect(addr) {
                        Ok(stream) => {
                            stream.set_nodelay(true)?;
                            return Ok(Transport::Tcp(stream));
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(Error::Transport(last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, format!("{host} resolved to no addresses"))
                })))
            }
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Unix(stream) => stream.read(buf),
            Transport::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Unix(stream) => stream.write(buf),
            Transport::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Unix(stream) => stream.flush(),
            Transport::Tcp(stream) => stream.flush(),
        }
    }
}
