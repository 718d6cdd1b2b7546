use std::{error::Error as StdError, fmt};

use http::{HeaderMap, StatusCode};
use url::Url;

/// A `Result` alias where the `Err` case is `hyperhttp::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The phase of a request attempt in which a deadline elapsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Establishing the transport (DNS, TCP, TLS handshake).
    Connect,
    /// Writing the request head or body.
    Write,
    /// Waiting for the response head.
    ReadHeaders,
    /// Reading the response body.
    ReadBody,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Connect => "connect",
            Phase::Write => "write",
            Phase::ReadHeaders => "read-headers",
            Phase::ReadBody => "read-body",
        }
    }
}

/// The Errors that may occur when processing a `Request`.
///
/// Note: Errors may include the full URL used to make the `Request`. If the
/// URL contains sensitive information (e.g. an API key as a query parameter),
/// be sure to remove it ([`without_url`](Error::without_url)).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    url: Option<Url>,
    status: Option<StatusCode>,
    headers: Option<Box<HeaderMap>>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Connect,
    Network,
    Timeout(Phase),
    Protocol,
    Status,
    PoolExhausted,
    Canceled,
    Body,
    #[cfg(feature = "json")]
    Decode,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                url: None,
                status: None,
                headers: None,
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn builder_msg(msg: &'static str) -> Error {
        Error::new(Kind::Builder, Some(msg))
    }

    pub(crate) fn connect(source: Option<BoxError>) -> Error {
        Error::new(Kind::Connect, source)
    }

    pub(crate) fn network(source: Option<BoxError>) -> Error {
        Error::new(Kind::Network, source)
    }

    pub(crate) fn timeout(phase: Phase) -> Error {
        Error::new(Kind::Timeout(phase), None::<Error>)
    }

    pub(crate) fn protocol(msg: &'static str) -> Error {
        Error::new(Kind::Protocol, Some(msg))
    }

    pub(crate) fn status_code(url: Url, status: StatusCode, headers: HeaderMap) -> Error {
        let mut err = Error::new(Kind::Status, None::<Error>).with_url(url);
        err.inner.status = Some(status);
        err.inner.headers = Some(Box::new(headers));
        err
    }

    pub(crate) fn pool_exhausted() -> Error {
        Error::new(Kind::PoolExhausted, None::<Error>)
    }

    pub(crate) fn canceled() -> Error {
        Error::new(Kind::Canceled, None::<Error>)
    }

    pub(crate) fn body<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Body, Some(e))
    }

    #[cfg(feature = "json")]
    pub(crate) fn decode<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Decode, Some(e))
    }

    pub(crate) fn url_bad_scheme(url: Url) -> Error {
        Error::new(Kind::Builder, Some(BadScheme)).with_url(url)
    }
}

impl Error {
    /// Returns a possible URL related to this error.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// Add a url related to this error (overwriting any existing).
    pub fn with_url(mut self, url: Url) -> Self {
        self.inner.url = Some(url);
        self
    }

    /// Strip the related url from this error (if, for example, it contains
    /// sensitive information).
    pub fn without_url(mut self) -> Self {
        self.inner.url = None;
        self
    }

    /// Returns the final HTTP status, if the terminal outcome was a response.
    pub fn status(&self) -> Option<StatusCode> {
        self.inner.status
    }

    /// Returns the final response headers, if the terminal outcome was a
    /// response. Kept for forensic inspection after retries are exhausted.
    pub fn response_headers(&self) -> Option<&HeaderMap> {
        self.inner.headers.as_deref()
    }

    /// Returns the phase that timed out, if this is a timeout error.
    pub fn timeout_phase(&self) -> Option<Phase> {
        match self.inner.kind {
            Kind::Timeout(phase) => Some(phase),
            _ => None,
        }
    }

    /// Returns true if the error is from building a `Client` or `Request`.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if a transport could not be established.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if an established transport failed mid-use.
    pub fn is_network(&self) -> bool {
        matches!(self.inner.kind, Kind::Network)
    }

    /// Returns true if a phase exceeded its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(_))
    }

    /// Returns true if the response head or framing was malformed.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if a response was received but its status was terminal.
    pub fn is_status(&self) -> bool {
        matches!(self.inner.kind, Kind::Status)
    }

    /// Returns true if the pool budget prevented acquiring a connection
    /// within the checkout deadline.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolExhausted)
    }

    /// Returns true if the caller or client shutdown aborted the request.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the error is related to a request or response body.
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body)
    }

    #[cfg(feature = "json")]
    /// Returns true if the error is from decoding a response body.
    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, Kind::Decode)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("hyperhttp::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref url) = self.inner.url {
            builder.field("url", &url.as_str());
        }
        if let Some(status) = self.inner.status {
            builder.field("status", &status);
        }
        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Connect => f.write_str("error connecting to server")?,
            Kind::Network => f.write_str("connection failed mid-request")?,
            Kind::Timeout(phase) => write!(f, "operation timed out ({})", phase.as_str())?,
            Kind::Protocol => f.write_str("malformed HTTP response")?,
            Kind::Status => match self.inner.status {
                Some(status) => {
                    let prefix = if status.is_client_error() {
                        "HTTP status client error"
                    } else {
                        "HTTP status server error"
                    };
                    write!(f, "{prefix} ({status})")?;
                }
                None => f.write_str("HTTP status error")?,
            },
            Kind::PoolExhausted => f.write_str("connection pool exhausted")?,
            Kind::Canceled => f.write_str("request canceled")?,
            Kind::Body => f.write_str("request or response body error")?,
            #[cfg(feature = "json")]
            Kind::Decode => f.write_str("error decoding response body")?,
        };

        if let Some(url) = &self.inner.url {
            write!(f, " for url ({url})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) struct BadScheme;

impl fmt::Display for BadScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("URL scheme is not allowed")
    }
}

impl StdError for BadScheme {}
