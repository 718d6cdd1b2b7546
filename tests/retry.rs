mod support;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use hyperhttp::{Backoff, Category, RetryPolicy};
use support::{
    server::{self, Reply},
    Recorder,
};

fn exponential(base_ms: u64, cap: Duration) -> Backoff {
    Backoff::Exponential {
        base: Duration::from_millis(base_ms),
        max: cap,
    }
}

#[tokio::test]
async fn transient_503_is_retried_to_success() {
    support::init_trace();
    let server = server::start(|n| {
        if n == 0 {
            Reply::Status(503)
        } else {
            Reply::Body(200, "recovered")
        }
    })
    .await;

    let recorder = Arc::new(Recorder::default());
    let client = hyperhttp::Client::builder()
        .retry_policy(
            RetryPolicy::new()
                .max_retries(3)
                .retry_on(Category::Server)
                .backoff(exponential(10, Duration::from_secs(1))),
        )
        .observer(recorder.clone())
        .build()
        .unwrap();

    let start = Instant::now();
    let resp = client.get(server.url("/flaky")).send().await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "recovered");
    assert_eq!(server.requests(), 2);

    // Exponential(base=10ms) puts the first retry 10ms out.
    assert!(elapsed >= Duration::from_millis(10), "retried too early");

    let records = recorder.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].index, 0);
    assert_eq!(records[0].category, Some(Category::Server));
    assert_eq!(records[0].delay, Some(Duration::from_millis(10)));
    assert_eq!(records[1].index, 1);
    assert_eq!(records[1].category, None);
}

#[tokio::test]
async fn non_idempotent_post_is_not_replayed_after_body_bytes() {
    support::init_trace();
    // The server reads the request, then slams the connection shut.
    let server = server::always(Reply::CloseAbruptly).await;

    let recorder = Arc::new(Recorder::default());
    let client = hyperhttp::Client::builder()
        .retry_policy(
            RetryPolicy::new()
                .max_retries(3)
                .retry_on(Category::Transient),
        )
        .observer(recorder.clone())
        .build()
        .unwrap();

    let body = vec![b'x'; 1024];
    let err = client
        .post(server.url("/charge"))
        .body(body)
        .send()
        .await
        .unwrap_err();

    assert!(err.is_network());
    assert_eq!(server.requests(), 1, "a POST with body bytes sent must not replay");
    assert_eq!(recorder.records().len(), 1);

    // The dead connection was discarded.
    let stats = client.pool_stats();
    assert_eq!(stats.opened, 1);
    assert_eq!(stats.closed, 1);
}

#[tokio::test]
async fn non_idempotent_connect_failure_is_retried() {
    support::init_trace();
    // Bind a port, then drop the listener so connects are refused.
    let refused_addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let recorder = Arc::new(Recorder::default());
    let client = hyperhttp::Client::builder()
        .retry_policy(
            RetryPolicy::new()
                .max_retries(2)
                .retry_on(Category::Transient)
                .backoff(exponential(1, Duration::from_millis(10))),
        )
        .observer(recorder.clone())
        .build()
        .unwrap();

    let err = client
        .post(format!("http://{refused_addr}/job"))
        .body("payload")
        .send()
        .await
        .unwrap_err();

    assert!(err.is_connect());
    // Zero bytes ever left the client, so all attempts were allowed.
    let records = recorder.records();
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .all(|r| r.category == Some(Category::Transient)));
}

#[tokio::test]
async fn retry_after_header_is_honored() {
    support::init_trace();
    let server = server::start(|n| {
        if n == 0 {
            Reply::RetryAfter429(2)
        } else {
            Reply::Body(200, "ok")
        }
    })
    .await;

    let client = hyperhttp::Client::builder()
        .retry_policy(
            RetryPolicy::new()
                .max_retries(2)
                .retry_on(Category::RateLimit)
                .respect_retry_after(true)
                .backoff(exponential(10, Duration::from_secs(5))),
        )
        .build()
        .unwrap();

    let start = Instant::now();
    let resp = client.get(server.url("/limited")).send().await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(resp.status(), 200);
    assert!(
        elapsed >= Duration::from_millis(1950) && elapsed <= Duration::from_millis(2500),
        "Retry-After: 2 produced a delay of {elapsed:?}"
    );
}

#[tokio::test]
async fn rate_limit_without_header_uses_backoff() {
    support::init_trace();
    let server = server::start(|n| {
        if n == 0 {
            Reply::Status(429)
        } else {
            Reply::Body(200, "ok")
        }
    })
    .await;

    let recorder = Arc::new(Recorder::default());
    let client = hyperhttp::Client::builder()
        .retry_policy(
            RetryPolicy::new()
                .max_retries(2)
                .retry_on(Category::RateLimit)
                .backoff(exponential(30, Duration::from_secs(5))),
        )
        .observer(recorder.clone())
        .build()
        .unwrap();

    let resp = client.get(server.url("/limited")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let records = recorder.records();
    assert_eq!(records[0].category, Some(Category::RateLimit));
    assert_eq!(records[0].delay, Some(Duration::from_millis(30)));
}

#[tokio::test]
async fn forced_statuses_join_the_retry_set() {
    support::init_trace();
    let server = server::start(|n| {
        if n == 0 {
            Reply::Status(500)
        } else {
            Reply::Body(200, "ok")
        }
    })
    .await;

    let client = hyperhttp::Client::builder()
        .retry_policy(
            RetryPolicy::new()
                .max_retries(2)
                .retry_on(Category::Server)
                .retry_statuses([500])
                .backoff(exponential(1, Duration::from_millis(50))),
        )
        .build()
        .unwrap();

    let resp = client.get(server.url("/flaky")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(server.requests(), 2);
}

#[tokio::test]
async fn statuses_outside_the_retry_set_pass_through() {
    support::init_trace();
    let server = server::always(Reply::Status(500)).await;

    let recorder = Arc::new(Recorder::default());
    let client = hyperhttp::Client::builder()
        .retry_policy(RetryPolicy::new().max_retries(3).retry_on(Category::Server))
        .observer(recorder.clone())
        .build()
        .unwrap();

    let resp = client.get(server.url("/broken")).send().await.unwrap();
    assert_eq!(resp.status(), 500);
    assert_eq!(server.requests(), 1);
    assert_eq!(recorder.records().len(), 1);
}

#[tokio::test]
async fn exhausted_retries_surface_the_final_status() {
    support::init_trace();
    let server = server::always(Reply::Status(503)).await;

    let recorder = Arc::new(Recorder::default());
    let client = hyperhttp::Client::builder()
        .retry_policy(
            RetryPolicy::new()
                .max_retries(2)
                .retry_on(Category::Server)
                .backoff(exponential(1, Duration::from_millis(20))),
        )
        .observer(recorder.clone())
        .build()
        .unwrap();

    let err = client.get(server.url("/down")).send().await.unwrap_err();
    assert!(err.is_status());
    assert_eq!(err.status(), Some(hyperhttp::StatusCode::SERVICE_UNAVAILABLE));
    assert!(err.response_headers().is_some());
    assert_eq!(server.requests(), 3);

    let records = recorder.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.category == Some(Category::Server)));
    // The terminal attempt carries no delay.
    assert_eq!(records[2].delay, None);
}

#[tokio::test]
async fn retried_status_reuses_the_drained_connection() {
    support::init_trace();
    // Small 503 bodies are drained, so the retry can reuse the socket.
    let server = server::start(|n| {
        if n == 0 {
            Reply::Body(503, "try later")
        } else {
            Reply::Body(200, "ok")
        }
    })
    .await;

    let client = hyperhttp::Client::builder()
        .retry_policy(
            RetryPolicy::new()
                .max_retries(1)
                .retry_on(Category::Server)
                .backoff(exponential(1, Duration::from_millis(20))),
        )
        .build()
        .unwrap();

    let resp = client.get(server.url("/flaky")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(server.connections(), 1, "drained connection should be reused");
}

#[tokio::test]
async fn idempotency_override_allows_post_replay() {
    support::init_trace();
    // First connection dies after reading the request; the second serves it.
    let server = server::start(|n| {
        if n == 0 {
            Reply::CloseAbruptly
        } else {
            Reply::Body(200, "ok")
        }
    })
    .await;

    let client = hyperhttp::Client::builder()
        .retry_policy(
            RetryPolicy::new()
                .max_retries(2)
                .retry_on(Category::Transient)
                .backoff(exponential(1, Duration::from_millis(20))),
        )
        .build()
        .unwrap();

    // Without the override this exact shape gives up after one attempt
    // (see non_idempotent_post_is_not_replayed_after_body_bytes).
    let resp = client
        .post(server.url("/replayable"))
        .idempotent(true)
        .body("replayable")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(server.requests(), 2);
}
