//! End-to-end orchestration of a single request: checkout, attempt, release,
//! classify, back off, repeat.

use std::{future::Future, io, time::Duration};

use bytes::Bytes;
use http::Method;
use tokio::{
    sync::watch,
    time::{sleep_until, timeout_at, Instant},
};
use tracing::{debug, trace};
use url::Url;

use super::{ClientInner, Request, Response};
use crate::{
    connect::{ConnectError, Origin, Scheme},
    error::{Error, Phase},
    pool::{AcquireError, Disposition, PooledConn},
    proto::{ProtoError, RequestHead, ResponseHead},
    retry::{AttemptRecord, NetworkKind, Outcome, RetryEngine, Verdict},
};

/// Bodies of retried statuses are read to completion up to this cap so the
/// connection can be reused; anything larger costs the connection instead.
const DRAIN_CAP: usize = 64 * 1024;

pub(super) async fn execute(inner: &ClientInner, req: Request) -> crate::Result<Response> {
    let url = req.url().clone();

    if inner.pool.is_closed() {
        return Err(Error::canceled().with_url(url));
    }

    let origin = Origin::from_url(&url)?;
    if origin.scheme() == Scheme::Https && !inner.pool.has_tls() {
        return Err(Error::builder_msg("https requires a TLS connector").with_url(url));
    }

    let head = build_head(inner, &req, &origin);
    let body: Option<Bytes> = req.body().map(|b| b.bytes().clone());
    let idempotent = req
        .idempotency_override()
        .unwrap_or_else(|| crate::util::method_is_idempotent(req.method()));
    let max_retries = req
        .max_retries_override()
        .unwrap_or(inner.policy.max_retries);
    let mut engine = RetryEngine::new(inner.policy.clone(), max_retries);
    let per_attempt = inner.policy.per_attempt_timeout.or(inner.per_attempt_timeout);

    let request_timeout = req.timeout().or(inner.timeout);
    let total_deadline = match (request_timeout, inner.policy.total_deadline) {
        (Some(a), Some(b)) => Some(Instant::now() + a.min(b)),
        (a, b) => a.or(b).map(|d| Instant::now() + d),
    };

    let mut shutdown = inner.shutdown_rx.clone();
    let mut attempt: u32 = 0;

    loop {
        let (outcome, body_sent) = match inner.pool.acquire(&origin, total_deadline).await {
            Ok(mut conn) => {
                let deadline = attempt_deadline(per_attempt, total_deadline);
                let mut body_sent = false;
                match run_attempt(
                    &mut conn,
                    &head,
                    body.as_ref(),
                    &mut body_sent,
                    deadline,
                    &mut shutdown,
                )
                .await
                {
                    Ok(resp) => {
                        if engine.policy().is_retry_status(resp.status) {
                            trace!("attempt {attempt} got retryable status {}", resp.status);
                            let disposition = drain_for_retry(&mut conn, deadline).await;
                            conn.set_disposition(disposition);
                            drop(conn);
                            (
                                Outcome::Status {
                                    status: resp.status,
                                    headers: resp.headers,
                                },
                                body_sent,
                            )
                        } else {
                            notify(
                                inner,
                                AttemptRecord {
                                    index: attempt,
                                    category: None,
                                    delay: None,
                                },
                            );
                            return Ok(Response::new(url, resp, conn));
                        }
                    }
                    Err(AttemptFail::Canceled) => {
                        // The connection's framing state is unknown; the
                        // default Broken disposition closes it. No backoff.
                        drop(conn);
                        return Err(Error::canceled().with_url(url));
                    }
                    Err(AttemptFail::Outcome(outcome)) => {
                        // I/O failures implicate the connection.
                        drop(conn);
                        (outcome, body_sent)
                    }
                }
            }
            Err(AcquireError::Exhausted) => {
                return Err(Error::pool_exhausted().with_url(url));
            }
            Err(AcquireError::Closed) => {
                return Err(Error::canceled().with_url(url));
            }
            Err(AcquireError::Connect(e)) => (connect_outcome(e), false),
        };

        let category = engine.policy().classify(&outcome);
        match engine.decide(attempt, idempotent, body_sent, &outcome) {
            Verdict::Giveup => {
                notify(
                    inner,
                    AttemptRecord {
                        index: attempt,
                        category: Some(category),
                        delay: None,
                    },
                );
                debug!("giving up after attempt {attempt} ({category:?})");
                return Err(outcome_into_error(outcome, url));
            }
            Verdict::RetryNow => {
                notify(
                    inner,
                    AttemptRecord {
                        index: attempt,
                        category: Some(category),
                        delay: Some(Duration::ZERO),
                    },
                );
                if deadline_would_pass(total_deadline, Duration::ZERO) {
                    return Err(outcome_into_error(outcome, url));
                }
            }
            Verdict::RetryAfter(delay) => {
                notify(
                    inner,
                    AttemptRecord {
                        index: attempt,
                        category: Some(category),
                        delay: Some(delay),
                    },
                );
                if deadline_would_pass(total_deadline, delay) {
                    debug!("backoff {delay:?} would pass the total deadline, giving up");
                    return Err(outcome_into_error(outcome, url));
                }
                trace!("attempt {attempt} failed ({category:?}), retrying in {delay:?}");
                let wake = Instant::now() + delay;
                tokio::select! {
                    biased;
                    _ = wait_shutdown(&mut shutdown) => {
                        return Err(Error::canceled().with_url(url));
                    }
                    _ = sleep_until(wake) => {}
                }
            }
        }
        attempt += 1;
    }
}

enum AttemptFail {
    Outcome(Outcome),
    Canceled,
}

async fn run_attempt(
    conn: &mut PooledConn,
    head: &RequestHead,
    body: Option<&Bytes>,
    body_sent: &mut bool,
    deadline: Option<Instant>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ResponseHead, AttemptFail> {
    let method: Method = head.method.clone();

    {
        let fut = conn.transport().send_request(head, body, body_sent);
        phase(Phase::Write, deadline, shutdown, fut).await?;
    }

    let fut = conn.transport().read_head(&method);
    phase(Phase::ReadHeaders, deadline, shutdown, fut).await
}

/// Runs one suspension point under the per-attempt deadline, raced against
/// client shutdown.
async fn phase<T>(
    phase: Phase,
    deadline: Option<Instant>,
    shutdown: &mut watch::Receiver<bool>,
    fut: impl Future<Output = Result<T, ProtoError>>,
) -> Result<T, AttemptFail> {
    let io = async {
        match deadline {
            Some(at) => match timeout_at(at, fut).await {
                Ok(res) => res.map_err(|e| AttemptFail::Outcome(proto_outcome(e))),
                Err(_) => Err(AttemptFail::Outcome(Outcome::Timeout(phase))),
            },
            None => fut.await.map_err(|e| AttemptFail::Outcome(proto_outcome(e))),
        }
    };
    tokio::select! {
        biased;
        _ = wait_shutdown(shutdown) => Err(AttemptFail::Canceled),
        res = io => res,
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|signaled| *signaled).await.is_err() {
        // Sender gone without signaling; stay out of the way.
        std::future::pending::<()>().await;
    }
}

async fn drain_for_retry(conn: &mut PooledConn, deadline: Option<Instant>) -> Disposition {
    let fut = conn.transport().drain(DRAIN_CAP);
    let drained = match deadline {
        Some(at) => match timeout_at(at, fut).await {
            Ok(res) => res,
            Err(_) => return Disposition::Broken,
        },
        None => fut.await,
    };
    match drained {
        Ok(true) if conn.transport().is_reusable() => Disposition::Reusable,
        _ => Disposition::Broken,
    }
}

fn attempt_deadline(per_attempt: Option<Duration>, total: Option<Instant>) -> Option<Instant> {
    let per = per_attempt.map(|d| Instant::now() + d);
    match (per, total) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn deadline_would_pass(total: Option<Instant>, delay: Duration) -> bool {
    total.is_some_and(|at| Instant::now() + delay >= at)
}

fn build_head(inner: &ClientInner, req: &Request, origin: &Origin) -> RequestHead {
    let mut headers = inner.default_headers.clone();
    crate::util::replace_headers(&mut headers, req.headers().clone());

    let mut target = req.url().path().to_owned();
    if let Some(query) = req.url().query() {
        target.push('?');
        target.push_str(query);
    }

    RequestHead {
        method: req.method().clone(),
        target,
        host: origin.host_header(),
        headers,
    }
}

fn proto_outcome(e: ProtoError) -> Outcome {
    match e {
        ProtoError::Protocol(message) => Outcome::Protocol { message },
        ProtoError::Io(io) => {
            let kind = match io.kind() {
                io::ErrorKind::UnexpectedEof => NetworkKind::UnexpectedEof,
                _ => NetworkKind::Reset,
            };
            Outcome::Network {
                kind,
                source: Some(Box::new(io)),
            }
        }
    }
}

fn connect_outcome(e: ConnectError) -> Outcome {
    match e {
        ConnectError::Dns(io) => Outcome::Network {
            kind: NetworkKind::Dns,
            source: Some(Box::new(io)),
        },
        ConnectError::Io(io) => Outcome::Network {
            kind: NetworkKind::ConnectRefused,
            source: Some(Box::new(io)),
        },
        ConnectError::Tls(source) => Outcome::Network {
            kind: NetworkKind::Tls,
            source: Some(source),
        },
        ConnectError::Timeout => Outcome::Timeout(Phase::Connect),
        ConnectError::NoTlsConnector => Outcome::Network {
            kind: NetworkKind::Tls,
            source: Some("no TLS connector configured".into()),
        },
    }
}

fn outcome_into_error(outcome: Outcome, url: Url) -> Error {
    match outcome {
        Outcome::Status { status, headers } => Error::status_code(url, status, headers),
        Outcome::Network { kind, source } => {
            let err = if kind.is_connect_phase() {
                Error::connect(source)
            } else {
                Error::network(source)
            };
            err.with_url(url)
        }
        Outcome::Timeout(phase) => Error::timeout(phase).with_url(url),
        Outcome::Protocol { message } => Error::protocol(message).with_url(url),
    }
}

fn notify(inner: &ClientInner, record: AttemptRecord) {
    if let Some(ref observer) = inner.observer {
        observer.on_attempt(&record);
    }
}
