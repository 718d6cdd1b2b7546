use std::fmt;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use url::Url;

use crate::{
    error::Error,
    pool::{Disposition, PooledConn},
    proto::{ProtoError, ResponseHead},
};

/// A response to a submitted `Request`.
///
/// The response head is fully parsed; the body streams from the pooled
/// connection on demand. Fully reading (or discarding) the body is what
/// returns the connection to the pool. Dropping a `Response` with an
/// unread body closes the connection instead.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    version: Version,
    url: Url,
    body: BodyHandle,
}

struct BodyHandle {
    conn: Option<PooledConn>,
}

impl Response {
    pub(crate) fn new(url: Url, head: ResponseHead, mut conn: PooledConn) -> Response {
        // Bodyless responses free the connection immediately.
        let conn = if conn.transport().body_complete() {
            release(conn);
            None
        } else {
            Some(conn)
        };
        Response {
            status: head.status,
            headers: head.headers,
            version: head.version,
            url,
            body: BodyHandle { conn },
        }
    }

    /// Get the `StatusCode` of this `Response`.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP `Version` of this `Response`.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the `Headers` of this `Response`.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get the final `Url` of this `Response`.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the content length, if the response carried one.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    /// Stream a piece of the response body.
    ///
    /// Returns `None` once the body is fully consumed, at which point the
    /// connection has been returned to the pool.
    pub async fn chunk(&mut self) -> crate::Result<Option<Bytes>> {
        let conn = match self.body.conn.as_mut() {
            Some(conn) => conn,
            None => return Ok(None),
        };
        match conn.transport().read_chunk().await {
            Ok(Some(bytes)) => {
                // The final piece frees the connection without waiting for
                // the caller to observe end-of-body.
                if conn.transport().body_complete() {
                    if let Some(conn) = self.body.conn.take() {
                        release(conn);
                    }
                }
                Ok(Some(bytes))
            }
            Ok(None) => {
                if let Some(conn) = self.body.conn.take() {
                    release(conn);
                }
                Ok(None)
            }
            Err(e) => {
                // Default disposition is Broken; just let go.
                self.body.conn.take();
                Err(body_error(e).with_url(self.url.clone()))
            }
        }
    }

    /// Get the full response body as `Bytes`.
    pub async fn bytes(mut self) -> crate::Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Get the response text.
    ///
    /// The body is decoded as UTF-8, replacing invalid sequences.
    pub async fn text(self) -> crate::Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Try to deserialize the response body as JSON.
    ///
    /// # Optional
    ///
    /// This requires the optional `json` feature to be enabled.
    #[cfg(feature = "json")]
    pub async fn json<T: serde::de::DeserializeOwned>(self) -> crate::Result<T> {
        let url = self.url.clone();
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::decode(e).with_url(url))
    }

    /// Convert the response into a `Stream` of `Bytes` from the body.
    pub fn bytes_stream(self) -> impl futures_util::Stream<Item = crate::Result<Bytes>> {
        futures_util::stream::unfold(self, |mut response| async move {
            match response.chunk().await {
                Ok(Some(bytes)) => Some((Ok(bytes), response)),
                Ok(None) => None,
                Err(e) => Some((Err(e), response)),
            }
        })
    }

    /// Turn a response into an error if the server returned an error status.
    pub fn error_for_status(self) -> crate::Result<Response> {
        if self.status.is_client_error() || self.status.is_server_error() {
            Err(Error::status_code(
                self.url.clone(),
                self.status,
                self.headers.clone(),
            ))
        } else {
            Ok(self)
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

fn release(mut conn: PooledConn) {
    let disposition = if conn.transport().is_reusable() {
        Disposition::Reusable
    } else {
        Disposition::Broken
    };
    conn.set_disposition(disposition);
}

fn body_error(e: ProtoError) -> Error {
    match e {
        ProtoError::Io(io) => Error::body(io),
        ProtoError::Protocol(msg) => Error::protocol(msg),
    }
}
