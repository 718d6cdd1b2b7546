//! # hyperhttp
//!
//! A fast asynchronous HTTP/1.1 client built for workloads that issue many
//! concurrent requests to a small set of hosts: microservices, crawlers,
//! benchmarking harnesses, service meshes.
//!
//! The work happens in three places:
//!
//! - a per-origin **connection pool** with health tracking, idle reaping,
//!   and FIFO fairness under contention;
//! - a policy-driven **retry engine** that classifies failures, computes
//!   backoff (including `Retry-After`), and refuses unsafe replays of
//!   non-idempotent requests;
//! - a **request executor** that binds each attempt to a connection,
//!   enforces per-attempt and total deadlines, and feeds outcomes back into
//!   pool health.
//!
//! ## Example
//!
//! ```rust,no_run
//! # async fn run() -> hyperhttp::Result<()> {
//! let client = hyperhttp::Client::builder()
//!     .max_connections_per_host(8)
//!     .build()?;
//!
//! let body = client
//!     .get("http://httpbin.org/get")
//!     .send()
//!     .await?
//!     .text()
//!     .await?;
//!
//! println!("{body}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Connection reuse
//!
//! A connection is returned to the pool once its response body has been
//! fully read (or the response had none). Dropping a [`Response`] with an
//! unread body closes the connection instead: the framing state would be
//! unknown, and the pool never hands out a connection it cannot trust.
//!
//! ## Retries
//!
//! Failures are classified into [`Category`] values and gated by the
//! client's [`RetryPolicy`]. Non-idempotent requests are never replayed
//! once any request-body byte may have reached the server; connect-phase
//! failures are always safe to retry. See [`RetryPolicy`] for the knobs.

#![deny(missing_debug_implementations)]

pub use http::{header, HeaderMap, Method, StatusCode, Version};
pub use url::Url;

mod client;
mod connect;
mod error;
mod into_url;
mod pool;
mod proto;
mod retry;
mod sync;
mod util;

pub use self::{
    client::{Body, Client, ClientBuilder, Request, RequestBuilder, Response},
    connect::{Io, Origin, Scheme, TlsConnector},
    error::{BoxError, Error, Phase, Result},
    into_url::IntoUrl,
    pool::{HostStats, PoolStats},
    retry::{AttemptRecord, Backoff, Category, Observer, RetryPolicy},
};
