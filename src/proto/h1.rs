use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{
    header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST},
    HeaderMap, Method, StatusCode, Version,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};
use tracing::trace;

use super::headers;
use crate::connect::Io;

const MAX_HEADERS: usize = 100;
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 1024;
const INIT_BUF: usize = 8 * 1024;

/// One byte stream a connection runs over: plaintext TCP, or whatever the
/// user's TLS connector handed back.
pub(crate) enum Stream {
    Tcp(TcpStream),
    Wrapped(Box<dyn Io>),
}

impl Stream {
    /// Best-effort liveness probe. `false` means definitely dead; `true` is
    /// advisory. Never blocks.
    fn probe_alive(&self) -> bool {
        match self {
            Stream::Tcp(tcp) => {
                let mut buf = [0u8; 1];
                match tcp.try_read(&mut buf) {
                    // EOF, or unsolicited bytes on an idle connection.
                    Ok(_) => false,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => true,
                    Err(_) => false,
                }
            }
            // A wrapped stream has no peekable socket; age and idle checks
            // still apply.
            Stream::Wrapped(_) => true,
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Wrapped(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Wrapped(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Wrapped(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Wrapped(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[derive(Debug)]
pub(crate) enum ProtoError {
    Io(io::Error),
    Protocol(&'static str),
}

impl From<io::Error> for ProtoError {
    fn from(e: io::Error) -> ProtoError {
        ProtoError::Io(e)
    }
}

/// The per-attempt request head; built once per request, reused verbatim on
/// each retry.
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) host: String,
    pub(crate) headers: HeaderMap,
}

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

#[derive(Clone, Copy, Debug)]
enum Decoder {
    /// No response body in flight.
    Idle,
    /// Sized body, bytes remaining.
    Length(u64),
    Chunked(ChunkState),
    /// Body ends when the peer closes; the connection is already poisoned.
    Eof,
}

#[derive(Clone, Copy, Debug)]
enum ChunkState {
    Size,
    Data(u64),
    DataCrlf,
    Trailer,
}

/// One HTTP/1.1 connection.
///
/// A transport may be reused only after the previous response body has been
/// fully drained; anything else leaves the framing state unknown and the
/// transport reports itself non-reusable.
pub(crate) struct Transport {
    io: Stream,
    read_buf: BytesMut,
    decoder: Decoder,
    reusable: bool,
}

impl Transport {
    pub(crate) fn new(io: Stream) -> Transport {
        Transport {
            io,
            read_buf: BytesMut::with_capacity(INIT_BUF),
            decoder: Decoder::Idle,
            reusable: true,
        }
    }

    /// Whether the framing state permits another request on this connection.
    pub(crate) fn is_reusable(&self) -> bool {
        self.reusable && matches!(self.decoder, Decoder::Idle) && self.read_buf.is_empty()
    }

    /// Framing-clean *and* the socket still looks open.
    pub(crate) fn is_alive(&self) -> bool {
        self.is_reusable() && self.io.probe_alive()
    }

    pub(crate) fn body_complete(&self) -> bool {
        matches!(self.decoder, Decoder::Idle)
    }

    /// Writes the request head in one buffered write, then the body.
    ///
    /// `body_sent` flips to true before the first body byte is handed to the
    /// socket, so a failure mid-body is visibly unsafe to replay.
    pub(crate) async fn send_request(
        &mut self,
        head: &RequestHead,
        body: Option<&Bytes>,
        body_sent: &mut bool,
    ) -> Result<(), ProtoError> {
        debug_assert!(matches!(self.decoder, Decoder::Idle), "response in flight");
        let buf = encode_head(head, body.map(Bytes::len));
        self.io.write_all(&buf).await?;
        if let Some(body) = body {
            if !body.is_empty() {
                *body_sent = true;
                self.io.write_all(body).await?;
            }
        }
        self.io.flush().await?;
        Ok(())
    }

    pub(crate) async fn read_head(&mut self, method: &Method) -> Result<ResponseHead, ProtoError> {
        loop {
            if let Some((len, head)) = parse_head(&self.read_buf)? {
                self.read_buf.advance(len);
                self.prepare_body(method, &head)?;
                return Ok(head);
            }
            if self.read_buf.len() > MAX_HEAD_BYTES {
                self.reusable = false;
                return Err(ProtoError::Protocol("response head too large"));
            }
            let n = self.io.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                self.reusable = false;
                return if self.read_buf.is_empty() {
                    Err(ProtoError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before response head",
                    )))
                } else {
                    Err(ProtoError::Protocol("connection closed mid response head"))
                };
            }
        }
    }

    fn prepare_body(&mut self, method: &Method, head: &ResponseHead) -> Result<(), ProtoError> {
        if headers::connection_close(&head.headers) {
            trace!("peer requested connection close");
            self.reusable = false;
        }
        if head.version == Version::HTTP_10 && !headers::connection_keep_alive(&head.headers) {
            self.reusable = false;
        }

        let status = head.status;
        let no_body = *method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;

        self.decoder = if no_body {
            Decoder::Idle
        } else if headers::transfer_encoding_is_chunked(&head.headers) {
            Decoder::Chunked(ChunkState::Size)
        } else if head.headers.contains_key(CONTENT_LENGTH) {
            match headers::content_length_parse_all(&head.headers) {
                Some(0) => Decoder::Idle,
                Some(n) => Decoder::Length(n),
                None => {
                    self.reusable = false;
                    return Err(ProtoError::Protocol("invalid content-length"));
                }
            }
        } else {
            self.reusable = false;
            Decoder::Eof
        };
        Ok(())
    }

    /// Yields the next piece of the response body, `None` once it is fully
    /// consumed. Consuming the final piece returns the decoder to `Idle`,
    /// which is what makes the connection reusable again.
    pub(crate) async fn read_chunk(&mut self) -> Result<Option<Bytes>, ProtoError> {
        loop {
            match self.decoder {
                Decoder::Idle => return Ok(None),
                Decoder::Length(remaining) => {
                    if self.read_buf.is_empty() {
                        self.fill().await?;
                    }
                    let take = remaining.min(self.read_buf.len() as u64) as usize;
                    let out = self.read_buf.split_to(take).freeze();
                    let rest = remaining - take as u64;
                    self.decoder = if rest == 0 {
                        Decoder::Idle
                    } else {
                        Decoder::Length(rest)
                    };
                    return Ok(Some(out));
                }
                Decoder::Chunked(ChunkState::Size) => match find_crlf(&self.read_buf) {
                    Some(line) => {
                        let size = match parse_chunk_size(&self.read_buf[..line]) {
                            Ok(size) => size,
                            Err(e) => {
                                self.reusable = false;
                                return Err(e);
                            }
                        };
                        self.read_buf.advance(line + 2);
                        self.decoder = if size == 0 {
                            Decoder::Chunked(ChunkState::Trailer)
                        } else {
                            Decoder::Chunked(ChunkState::Data(size))
                        };
                    }
                    None => {
                        if self.read_buf.len() > MAX_CHUNK_LINE {
                            self.reusable = false;
                            return Err(ProtoError::Protocol("chunk size line too long"));
                        }
                        self.fill().await?;
                    }
                },
                Decoder::Chunked(ChunkState::Data(remaining)) => {
                    if self.read_buf.is_empty() {
                        self.fill().await?;
                    }
                    let take = remaining.min(self.read_buf.len() as u64) as usize;
                    let out = self.read_buf.split_to(take).freeze();
                    let rest = remaining - take as u64;
                    self.decoder = Decoder::Chunked(if rest == 0 {
                        ChunkState::DataCrlf
                    } else {
                        ChunkState::Data(rest)
                    });
                    return Ok(Some(out));
                }
                Decoder::Chunked(ChunkState::DataCrlf) => {
                    if self.read_buf.len() < 2 {
                        self.fill().await?;
                        continue;
                    }
                    if &self.read_buf[..2] != b"\r\n" {
                        self.reusable = false;
                        return Err(ProtoError::Protocol("missing chunk terminator"));
                    }
                    self.read_buf.advance(2);
                    self.decoder = Decoder::Chunked(ChunkState::Size);
                }
                Decoder::Chunked(ChunkState::Trailer) => match find_crlf(&self.read_buf) {
                    Some(0) => {
                        self.read_buf.advance(2);
                        self.decoder = Decoder::Idle;
                        return Ok(None);
                    }
                    Some(line) => {
                        // Trailer fields are discarded.
                        self.read_buf.advance(line + 2);
                    }
                    None => {
                        if self.read_buf.len() > MAX_HEAD_BYTES {
                            self.reusable = false;
                            return Err(ProtoError::Protocol("trailer section too large"));
                        }
                        self.fill().await?;
                    }
                },
                Decoder::Eof => {
                    if !self.read_buf.is_empty() {
                        return Ok(Some(self.read_buf.split().freeze()));
                    }
                    let n = self.io.read_buf(&mut self.read_buf).await?;
                    if n == 0 {
                        self.decoder = Decoder::Idle;
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Reads the remaining body to completion, giving up past `cap` bytes.
    ///
    /// Returns true if the body was fully consumed; false poisons the
    /// transport so the pool discards it.
    pub(crate) async fn drain(&mut self, cap: usize) -> Result<bool, ProtoError> {
        let mut total = 0usize;
        loop {
            match self.read_chunk().await? {
                None => return Ok(true),
                Some(chunk) => {
                    total += chunk.len();
                    if total > cap {
                        self.reusable = false;
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn fill(&mut self) -> Result<(), ProtoError> {
        let n = self.io.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            self.reusable = false;
            return Err(ProtoError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid body",
            )));
        }
        Ok(())
    }
}

fn encode_head(head: &RequestHead, body_len: Option<usize>) -> BytesMut {
    let mut buf = BytesMut::with_capacity(INIT_BUF);
    buf.put_slice(head.method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(head.target.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\nhost: ");
    buf.put_slice(head.host.as_bytes());
    buf.put_slice(b"\r\n");
    for (name, value) in head.headers.iter() {
        if name == &HOST {
            continue;
        }
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    if !head.headers.contains_key(CONNECTION) {
        buf.put_slice(b"connection: keep-alive\r\n");
    }
    if let Some(len) = body_len {
        if !head.headers.contains_key(CONTENT_LENGTH) {
            buf.put_slice(b"content-length: ");
            buf.put_slice(len.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
    }
    buf.put_slice(b"\r\n");
    buf
}

fn parse_head(buf: &[u8]) -> Result<Option<(usize, ResponseHead)>, ProtoError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let code = res
                .code
                .ok_or(ProtoError::Protocol("missing status code"))?;
            let status = StatusCode::from_u16(code)
                .map_err(|_| ProtoError::Protocol("invalid status code"))?;
            let version = match res.version {
                Some(0) => Version::HTTP_10,
                Some(1) => Version::HTTP_11,
                _ => return Err(ProtoError::Protocol("unsupported HTTP version")),
            };
            let mut map = HeaderMap::with_capacity(res.headers.len());
            for h in res.headers.iter() {
                let name = HeaderName::from_bytes(h.name.as_bytes())
                    .map_err(|_| ProtoError::Protocol("invalid header name"))?;
                let value = HeaderValue::from_bytes(h.value)
                    .map_err(|_| ProtoError::Protocol("invalid header value"))?;
                map.append(name, value);
            }
            Ok(Some((
                len,
                ResponseHead {
                    status,
                    version,
                    headers: map,
                },
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(ProtoError::Protocol("malformed response head")),
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ProtoError> {
    let mut size: u64 = 0;
    let mut seen = false;
    for &b in line {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            b';' | b' ' | b'\t' => break,
            _ => return Err(ProtoError::Protocol("invalid chunk size")),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(u64::from(digit)))
            .ok_or(ProtoError::Protocol("chunk size overflow"))?;
        seen = true;
    }
    if seen {
        Ok(size)
    } else {
        Err(ProtoError::Protocol("invalid chunk size"))
    }
}
