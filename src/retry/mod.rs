//! Failure classification and retry gating.
//!
//! Every attempt ends in an [`Outcome`]; the engine classifies it into a
//! [`Category`], then walks the policy's decision rules in order to produce a
//! [`Verdict`]. Only terminal verdicts ever reach the caller; outcomes that
//! were retried successfully are invisible except through an [`Observer`].

mod backoff;

use std::time::Duration;

pub use backoff::Backoff;
pub(crate) use backoff::BackoffState;

use http::{header::RETRY_AFTER, HeaderMap, StatusCode};

use crate::error::{BoxError, Phase};

/// The coarse class of a failed attempt, for retry gating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    /// The request likely never reached the server (refused, reset before
    /// headers, DNS failure).
    Transient,
    /// A phase exceeded its deadline.
    Timeout,
    /// The server answered with a retryable status.
    Server,
    /// HTTP 429.
    RateLimit,
    /// A non-retryable 4xx answer.
    Client,
    /// The response violated HTTP framing.
    Protocol,
}

/// What failed mid-transfer, on an established connection or while making
/// one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NetworkKind {
    ConnectRefused,
    Reset,
    UnexpectedEof,
    Dns,
    Tls,
}

impl NetworkKind {
    /// Failures that happen strictly before any request byte leaves the
    /// client; always safe to replay.
    pub(crate) fn is_connect_phase(&self) -> bool {
        matches!(
            self,
            NetworkKind::ConnectRefused | NetworkKind::Dns | NetworkKind::Tls
        )
    }
}

/// How a single attempt ended, when it did not produce a usable response.
#[derive(Debug)]
pub(crate) enum Outcome {
    Network {
        kind: NetworkKind,
        source: Option<BoxError>,
    },
    Timeout(Phase),
    Protocol {
        message: &'static str,
    },
    Status {
        status: StatusCode,
        headers: HeaderMap,
    },
}

impl Outcome {
    fn is_connect_phase(&self) -> bool {
        match self {
            Outcome::Network { kind, .. } => kind.is_connect_phase(),
            Outcome::Timeout(phase) => *phase == Phase::Connect,
            _ => false,
        }
    }
}

/// The engine's answer for one failed attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    Giveup,
    RetryNow,
    RetryAfter(Duration),
}

/// When and how often a client retries failed attempts.
///
/// Immutable; build one with the with-style methods and hand it to
/// [`ClientBuilder::retry_policy`](crate::ClientBuilder::retry_policy).
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub(crate) max_retries: u32,
    pub(crate) categories: Vec<Category>,
    pub(crate) retry_statuses: Vec<u16>,
    pub(crate) backoff: Backoff,
    pub(crate) respect_retry_after: bool,
    pub(crate) per_attempt_timeout: Option<Duration>,
    pub(crate) total_deadline: Option<Duration>,
}

impl RetryPolicy {
    pub fn new() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            categories: vec![Category::Transient, Category::Timeout],
            retry_statuses: Vec::new(),
            backoff: Backoff::default(),
            respect_retry_after: true,
            per_attempt_timeout: None,
            total_deadline: None,
        }
    }

    /// A policy that never retries anything.
    pub fn never() -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            categories: Vec::new(),
            ..RetryPolicy::new()
        }
    }

    /// Maximum retries after the initial attempt. Default is 2.
    pub fn max_retries(mut self, max: u32) -> RetryPolicy {
        self.max_retries = max;
        self
    }

    /// Adds a category to the retryable set.
    ///
    /// [`Category::Client`] is refused: a definitive 4xx answer is never
    /// safe to replay blindly.
    pub fn retry_on(mut self, category: Category) -> RetryPolicy {
        if category != Category::Client && !self.categories.contains(&category) {
            self.categories.push(category);
        }
        self
    }

    /// Replaces the retryable category set.
    pub fn retry_categories(mut self, categories: impl IntoIterator<Item = Category>) -> RetryPolicy {
        self.categories = categories
            .into_iter()
            .filter(|c| *c != Category::Client)
            .collect();
        self
    }

    /// Statuses treated as retryable server failures in addition to
    /// 502/503/504.
    pub fn retry_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> RetryPolicy {
        self.retry_statuses = statuses.into_iter().collect();
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> RetryPolicy {
        self.backoff = backoff;
        self
    }

    /// Whether a 429's `Retry-After` header overrides the backoff strategy.
    /// Default is true.
    pub fn respect_retry_after(mut self, respect: bool) -> RetryPolicy {
        self.respect_retry_after = respect;
        self
    }

    /// Upper bound on any single attempt, including connection checkout.
    pub fn per_attempt_timeout(mut self, timeout: Duration) -> RetryPolicy {
        self.per_attempt_timeout = Some(timeout);
        self
    }

    /// Upper bound on the whole request across all attempts and backoffs.
    pub fn total_deadline(mut self, deadline: Duration) -> RetryPolicy {
        self.total_deadline = Some(deadline);
        self
    }

    /// Whether `status` should be drained and fed to the retry engine
    /// instead of being returned to the caller.
    pub(crate) fn is_retry_status(&self, status: StatusCode) -> bool {
        let code = status.as_u16();
        matches!(code, 429 | 502 | 503 | 504) || self.retry_statuses.contains(&code)
    }

    pub(crate) fn classify(&self, outcome: &Outcome) -> Category {
        match outcome {
            Outcome::Network { .. } => Category::Transient,
            Outcome::Timeout(_) => Category::Timeout,
            Outcome::Protocol { .. } => Category::Protocol,
            Outcome::Status { status, .. } => {
                let code = status.as_u16();
                if code == 429 {
                    Category::RateLimit
                } else if matches!(code, 502 | 503 | 504) || self.retry_statuses.contains(&code) {
                    Category::Server
                } else if status.is_client_error() {
                    Category::Client
                } else {
                    Category::Server
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy::new()
    }
}

/// Drives retry decisions for one request. Owns the per-request backoff
/// state so decorrelated jitter stays decorrelated across requests.
pub(crate) struct RetryEngine {
    policy: RetryPolicy,
    max_retries: u32,
    state: BackoffState,
}

impl RetryEngine {
    pub(crate) fn new(policy: RetryPolicy, max_retries: u32) -> RetryEngine {
        RetryEngine {
            policy,
            max_retries,
            state: BackoffState::default(),
        }
    }

    pub(crate) fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decision rules, evaluated in order. `attempt` is zero-based;
    /// `body_sent` is whether any request-body byte was handed to the socket
    /// during this attempt.
    pub(crate) fn decide(
        &mut self,
        attempt: u32,
        idempotent: bool,
        body_sent: bool,
        outcome: &Outcome,
    ) -> Verdict {
        let category = self.policy.classify(outcome);

        if attempt >= self.max_retries {
            return Verdict::Giveup;
        }

        // A non-idempotent request that may have reached the server is not
        // safe to replay. Connect-phase failures are exempt: no bytes left
        // the client.
        if !idempotent
            && body_sent
            && matches!(category, Category::Transient | Category::Timeout)
            && !outcome.is_connect_phase()
        {
            return Verdict::Giveup;
        }

        match category {
            Category::Client => return Verdict::Giveup,
            // Framing violations get a single replay on idempotent requests;
            // the connection was already discarded.
            Category::Protocol => {
                if !idempotent || attempt >= 1 {
                    return Verdict::Giveup;
                }
            }
            _ => {
                if !self.policy.categories.contains(&category) {
                    return Verdict::Giveup;
                }
            }
        }

        if category == Category::RateLimit && self.policy.respect_retry_after {
            if let Outcome::Status { headers, .. } = outcome {
                if let Some(secs) = parse_retry_after(headers) {
                    return Verdict::RetryAfter(secs.min(self.policy.backoff.max()));
                }
            }
        }

        let delay = self.policy.backoff.delay(&mut self.state, attempt);
        if delay.is_zero() {
            Verdict::RetryNow
        } else {
            Verdict::RetryAfter(delay)
        }
    }
}

/// Parses `Retry-After` in its delta-seconds form. The HTTP-date form is
/// rare from rate limiters and is ignored here.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: u64 = value.trim().parse().ok()?;
    Some(Duration::from_secs(secs))
}

/// A record of one attempt, delivered to the [`Observer`] hook.
#[derive(Clone, Debug)]
pub struct AttemptRecord {
    /// Zero-based attempt index.
    pub index: u32,
    /// Failure class; `None` for the successful attempt.
    pub category: Option<Category>,
    /// Backoff chosen before the next attempt; `None` on terminal attempts.
    pub delay: Option<Duration>,
}

/// Receives the retry audit trail, one entry per attempt.
///
/// The hook sees every attempt, including those whose outcomes are retried
/// away and never surface to the caller.
pub trait Observer: Send + Sync + 'static {
    fn on_attempt(&self, attempt: &AttemptRecord) {
        let _ = attempt;
    }
}
