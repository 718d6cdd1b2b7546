//! Establishing transports.
//!
//! The connector resolves an [`Origin`] to a socket address, dials TCP within
//! the caller's deadline, and hands `https` sockets to a user-supplied
//! [`TlsConnector`]. TLS itself is deliberately not implemented here; the
//! client only needs a wrapped byte stream back.

use std::{fmt, future::Future, io, pin::Pin, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{lookup_host, TcpStream},
    time::Instant,
};
use tracing::{debug, trace};
use url::Url;

use crate::error::{BoxError, Error};

/// A byte stream a connection can run over.
///
/// Implemented for anything async-readable and -writable; [`TlsConnector`]
/// implementations return one of these boxed.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Io for T {}

/// Wraps a plain TCP socket in TLS.
///
/// Given the origin's host name for SNI and certificate verification, returns
/// the encrypted stream. The client treats the result as an opaque byte
/// stream; handshake failures are surfaced as connect errors.
pub trait TlsConnector: Send + Sync + 'static {
    fn wrap<'a>(
        &'a self,
        host: &'a str,
        io: TcpStream,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Io>, BoxError>> + Send + 'a>>;
}

/// The URL scheme of an [`Origin`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// The (scheme, host, port) triple a URL resolves to.
///
/// Origins are the unit of pooling: two URLs with the same origin share
/// connections, different origins never do.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Origin {
    pub(crate) fn from_url(url: &Url) -> crate::Result<Origin> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(Error::url_bad_scheme(url.clone())),
        };
        let host = match url.host_str() {
            Some(host) => host.trim_matches(|c| c == '[' || c == ']').to_owned(),
            None => return Err(Error::url_bad_scheme(url.clone())),
        };
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        Ok(Origin { scheme, host, port })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value for the `Host` header: the port is omitted when it is the
    /// scheme's default, and IPv6 literals get their brackets back.
    pub(crate) fn host_header(&self) -> String {
        let host: std::borrow::Cow<'_, str> = if self.host.contains(':') {
            format!("[{}]", self.host).into()
        } else {
            self.host.as_str().into()
        };
        if self.port == self.scheme.default_port() {
            host.into_owned()
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// How establishing a transport failed. Classified by the retry engine, so
/// the distinctions here are load-bearing.
#[derive(Debug)]
pub(crate) enum ConnectError {
    Dns(io::Error),
    Io(io::Error),
    Tls(BoxError),
    Timeout,
    NoTlsConnector,
}

pub(crate) struct Connector {
    connect_timeout: Option<Duration>,
    nodelay: bool,
    tls: Option<Arc<dyn TlsConnector>>,
}

impl Connector {
    pub(crate) fn new(
        connect_timeout: Option<Duration>,
        nodelay: bool,
        tls: Option<Arc<dyn TlsConnector>>,
    ) -> Connector {
        Connector {
            connect_timeout,
            nodelay,
            tls,
        }
    }

    pub(crate) fn has_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Opens a stream to `origin`, bounded by both the configured connect
    /// timeout and the caller's checkout deadline, whichever is sooner.
    pub(crate) async fn connect(
        &self,
        origin: &Origin,
        deadline: Option<Instant>,
    ) -> Result<crate::proto::Stream, ConnectError> {
        let mut effective = deadline;
        if let Some(timeout) = self.connect_timeout {
            let at = Instant::now() + timeout;
            effective = Some(effective.map_or(at, |d| d.min(at)));
        }

        match effective {
            Some(at) => tokio::time::timeout_at(at, self.dial(origin))
                .await
                .map_err(|_| ConnectError::Timeout)?,
            None => self.dial(origin).await,
        }
    }

    async fn dial(&self, origin: &Origin) -> Result<crate::proto::Stream, ConnectError> {
        trace!("dialing {origin}");
        let addrs = lookup_host((origin.host(), origin.port()))
            .await
            .map_err(ConnectError::Dns)?;

        let mut last_err = None;
        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => {
                    trace!("connect to {addr} failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        let tcp = match tcp {
            Some(tcp) => tcp,
            None => {
                let err = last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
                });
                return Err(if last_err_is_dns_shaped(&err) {
                    ConnectError::Dns(err)
                } else {
                    ConnectError::Io(err)
                });
            }
        };

        if self.nodelay {
            let _ = tcp.set_nodelay(true);
        }

        debug!("connected to {origin}");

        match origin.scheme() {
            Scheme::Http => Ok(crate::proto::Stream::Tcp(tcp)),
            Scheme::Https => match self.tls {
                Some(ref tls) => {
                    let io = tls
                        .wrap(origin.host(), tcp)
                        .await
                        .map_err(ConnectError::Tls)?;
                    Ok(crate::proto::Stream::Wrapped(io))
                }
                None => Err(ConnectError::NoTlsConnector),
            },
        }
    }
}

fn last_err_is_dns_shaped(err: &io::Error) -> bool {
    // getaddrinfo failures come back through `lookup_host`; a NotFound here
    // means the resolver yielded an empty set.
    err.kind() == io::ErrorKind::NotFound
}
