//! HTTP/1.1 wire protocol: request encoding, response head parsing, and body
//! framing over a single connection.

mod h1;
mod headers;

pub(crate) use h1::{ProtoError, RequestHead, ResponseHead, Stream, Transport};
