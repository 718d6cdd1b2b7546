mod body;
mod exec;
mod request;
mod response;

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

pub use body::Body;
use http::{
    header::{HeaderValue, USER_AGENT},
    HeaderMap, Method,
};
pub use request::{Request, RequestBuilder};
pub use response::Response;
use tokio::sync::watch;

use crate::{
    connect::{Connector, TlsConnector},
    error::Error,
    into_url::{IntoUrl, IntoUrlSealed},
    pool::{Pool, PoolConfig, PoolStats},
    retry::{Observer, RetryPolicy},
};

/// An asynchronous HTTP/1.1 `Client` to make requests with.
///
/// The `Client` holds a connection pool internally, so it is advised that
/// you create one and **reuse** it for many requests; that is where the
/// performance comes from.
///
/// You do **not** have to wrap the `Client` in an [`Rc`] or [`Arc`] to
/// **reuse** it, because it already uses an [`Arc`] internally.
///
/// [`Rc`]: std::rc::Rc
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) pool: Pool,
    pub(crate) policy: RetryPolicy,
    pub(crate) default_headers: HeaderMap,
    pub(crate) timeout: Option<Duration>,
    pub(crate) per_attempt_timeout: Option<Duration>,
    pub(crate) observer: Option<Arc<dyn Observer>>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
}

/// A `ClientBuilder` can be used to create a `Client` with custom
/// configuration.
#[must_use]
pub struct ClientBuilder {
    config: Config,
}

struct Config {
    error: Option<Error>,
    headers: HeaderMap,
    max_connections: usize,
    max_connections_per_host: usize,
    idle_timeout: Option<Duration>,
    max_age: Option<Duration>,
    max_requests_per_connection: Option<u32>,
    reaper_interval: Duration,
    connect_timeout: Option<Duration>,
    timeout: Option<Duration>,
    per_attempt_timeout: Option<Duration>,
    tcp_nodelay: bool,
    retry_policy: RetryPolicy,
    tls: Option<Arc<dyn TlsConnector>>,
    observer: Option<Arc<dyn Observer>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("max_connections", &self.config.max_connections)
            .field(
                "max_connections_per_host",
                &self.config.max_connections_per_host,
            )
            .field("idle_timeout", &self.config.idle_timeout)
            .finish()
    }
}

impl ClientBuilder {
    /// Constructs a new `ClientBuilder`.
    ///
    /// This is the same as `Client::builder()`.
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            config: Config {
                error: None,
                headers: HeaderMap::new(),
                max_connections: 100,
                max_connections_per_host: 32,
                idle_timeout: Some(Duration::from_secs(90)),
                max_age: None,
                max_requests_per_connection: None,
                reaper_interval: Duration::from_secs(30),
                connect_timeout: None,
                timeout: None,
                per_attempt_timeout: None,
                tcp_nodelay: true,
                retry_policy: RetryPolicy::default(),
                tls: None,
                observer: None,
            },
        }
    }

    /// Returns a `Client` that uses this `ClientBuilder` configuration.
    pub fn build(self) -> crate::Result<Client> {
        let config = self.config;

        if let Some(err) = config.error {
            return Err(err);
        }

        if config.max_connections == 0 || config.max_connections_per_host == 0 {
            return Err(Error::builder_msg("connection limits must be non-zero"));
        }

        let connector = Connector::new(config.connect_timeout, config.tcp_nodelay, config.tls);
        let pool = Pool::new(
            PoolConfig {
                max_connections: config.max_connections,
                max_connections_per_host: config.max_connections_per_host,
                idle_timeout: config.idle_timeout,
                max_age: config.max_age,
                max_requests_per_connection: config.max_requests_per_connection,
                reaper_interval: config.reaper_interval,
            },
            connector,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Client {
            inner: Arc::new(ClientInner {
                pool,
                policy: config.retry_policy,
                default_headers: config.headers,
                timeout: config.timeout,
                per_attempt_timeout: config.per_attempt_timeout,
                observer: config.observer,
                shutdown_rx,
                shutdown_tx,
            }),
        })
    }

    // Higher-level options

    /// Sets the `User-Agent` header to be used by this client.
    pub fn user_agent<V>(mut self, value: V) -> ClientBuilder
    where
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        match value.try_into() {
            Ok(value) => {
                self.config.headers.insert(USER_AGENT, value);
            }
            Err(err) => {
                self.config.error = Some(Error::builder(err.into()));
            }
        };
        self
    }

    /// Sets the default headers for every request.
    pub fn default_headers(mut self, headers: HeaderMap) -> ClientBuilder {
        crate::util::replace_headers(&mut self.config.headers, headers);
        self
    }

    // Pool options

    /// Global ceiling on open connections across all origins.
    ///
    /// Default is 100.
    pub fn max_connections(mut self, max: usize) -> ClientBuilder {
        self.config.max_connections = max;
        self
    }

    /// Ceiling on open connections per origin.
    ///
    /// Default is 32.
    pub fn max_connections_per_host(mut self, max: usize) -> ClientBuilder {
        self.config.max_connections_per_host = max;
        self
    }

    /// Set an optional timeout for idle connections being kept alive.
    ///
    /// Pass `None` to disable the timeout. Default is 90 seconds.
    pub fn idle_timeout<D>(mut self, val: D) -> ClientBuilder
    where
        D: Into<Option<Duration>>,
    {
        self.config.idle_timeout = val.into();
        self
    }

    /// Force-close connections older than this, idle or not.
    ///
    /// Default is no maximum age.
    pub fn max_age<D>(mut self, val: D) -> ClientBuilder
    where
        D: Into<Option<Duration>>,
    {
        self.config.max_age = val.into();
        self
    }

    /// Force-close a connection after it has served this many responses.
    ///
    /// Default is no limit.
    pub fn max_requests_per_connection<C>(mut self, max: C) -> ClientBuilder
    where
        C: Into<Option<u32>>,
    {
        self.config.max_requests_per_connection = max.into();
        self
    }

    /// How often the background reaper scans for stale idle connections.
    ///
    /// Default is 30 seconds.
    pub fn reaper_interval(mut self, period: Duration) -> ClientBuilder {
        self.config.reaper_interval = period;
        self
    }

    // Timeout options

    /// Default total timeout for requests, from the first connection
    /// checkout until the response head, across all retries.
    ///
    /// Default is no timeout. A per-request timeout takes precedence.
    pub fn timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.timeout = Some(timeout);
        self
    }

    /// Upper bound on any single attempt.
    ///
    /// Default is no bound; the retry policy's own per-attempt timeout takes
    /// precedence if set.
    pub fn per_attempt_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.per_attempt_timeout = Some(timeout);
        self
    }

    /// Set a timeout for only the connect phase of a `Client`.
    ///
    /// Default is `None`.
    pub fn connect_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.connect_timeout = Some(timeout);
        self
    }

    // TCP options

    /// Set whether sockets have `TCP_NODELAY` enabled.
    ///
    /// Default is `true`.
    pub fn tcp_nodelay(mut self, enabled: bool) -> ClientBuilder {
        self.config.tcp_nodelay = enabled;
        self
    }

    // Retry options

    /// Set the [`RetryPolicy`] applied to every request.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> ClientBuilder {
        self.config.retry_policy = policy;
        self
    }

    /// Register a hook that receives one record per attempt, including
    /// attempts whose failures are retried away invisibly.
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> ClientBuilder {
        self.config.observer = Some(observer);
        self
    }

    // TLS options

    /// Supply the TLS connector used for `https` origins.
    ///
    /// Without one, `https` requests fail with a builder error.
    pub fn tls_connector(mut self, tls: Arc<dyn TlsConnector>) -> ClientBuilder {
        self.config.tls = Some(tls);
        self
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Constructs a new `Client` with default configuration.
    ///
    /// # Panics
    ///
    /// This method panics if the configuration is invalid. Use
    /// `Client::builder()` to handle the failure as an `Error` instead.
    pub fn new() -> Client {
        ClientBuilder::new().build().expect("Client::new()")
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Convenience method to make a `GET` request to a URL.
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Convenience method to make a `POST` request to a URL.
    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Convenience method to make a `PUT` request to a URL.
    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Convenience method to make a `PATCH` request to a URL.
    pub fn patch<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    /// Convenience method to make a `DELETE` request to a URL.
    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Convenience method to make a `HEAD` request to a URL.
    pub fn head<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Start building a `Request` with the `Method` and `Url`.
    ///
    /// Returns a `RequestBuilder`, which will allow setting headers and the
    /// request body before sending.
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        let req = url.into_url().map(move |url| Request::new(method, url));
        RequestBuilder::new(self.clone(), req)
    }

    /// Executes a `Request`.
    ///
    /// The connection is checked out of the pool (or dialed), the request
    /// is attempted under the configured timeouts, and failures are retried
    /// per the client's [`RetryPolicy`]. Only the terminal outcome is
    /// surfaced.
    pub async fn execute(&self, request: Request) -> crate::Result<Response> {
        exec::execute(&self.inner, request).await
    }

    /// Shuts the client down.
    ///
    /// New requests fail immediately; parked checkouts are failed; idle
    /// connections close now, and in-flight requests get up to `grace` to
    /// finish before their connections are abandoned.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.pool.shutdown(grace).await;
    }

    /// A point-in-time snapshot of pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish()
    }
}

impl tower_service::Service<Request> for Client {
    type Response = Response;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = crate::Result<Response>> + Send>>;

    #[inline]
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        Poll::Ready(Ok(()))
    }

    #[inline]
    fn call(&mut self, req: Request) -> Self::Future {
        let client = self.clone();
        Box::pin(async move { client.execute(req).await })
    }
}

impl tower_service::Service<Request> for &'_ Client {
    type Response = Response;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = crate::Result<Response>> + Send>>;

    #[inline]
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        Poll::Ready(Ok(()))
    }

    #[inline]
    fn call(&mut self, req: Request) -> Self::Future {
        let client = (*self).clone();
        Box::pin(async move { client.execute(req).await })
    }
}
