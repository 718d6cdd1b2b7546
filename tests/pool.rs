mod support;

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures_util::future::join_all;
use support::server::{self, Reply};

#[tokio::test]
async fn sequential_gets_reuse_one_connection() {
    support::init_trace();
    let server = server::always(Reply::Body(200, "x")).await;

    let client = hyperhttp::Client::builder()
        .max_connections_per_host(2)
        .build()
        .unwrap();

    for _ in 0..10 {
        let resp = client.get(server.url("/x")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        resp.bytes().await.unwrap();
    }

    assert_eq!(server.connections(), 1);
    assert_eq!(server.requests(), 10);

    let stats = client.pool_stats();
    assert_eq!(stats.opened, 1);
    assert_eq!(stats.closed, 0);
    assert_eq!(stats.in_use, 0);
    let host = stats.origins.values().next().unwrap();
    assert_eq!(host.idle, 1);
}

#[tokio::test]
async fn concurrency_cap_parks_waiters() {
    support::init_trace();
    let server = server::always(Reply::Delayed(200, "ok", Duration::from_millis(50))).await;

    let client = hyperhttp::Client::builder()
        .max_connections_per_host(2)
        .build()
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        let url = server.url("/x");
        tasks.push(tokio::spawn(async move {
            client.get(url).send().await.unwrap().bytes().await.unwrap()
        }));
    }

    // Poll stats while requests are in flight to catch the waiter peak.
    let mut peak_waiters = 0;
    let poll_deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < poll_deadline {
        let stats = client.pool_stats();
        if let Some(host) = stats.origins.values().next() {
            peak_waiters = peak_waiters.max(host.waiters);
            assert!(host.idle + host.in_use <= 2, "per-host limit violated");
        }
        if peak_waiters >= 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(peak_waiters, 6);
    assert!(server.peak_open() <= 2, "server saw more than 2 connections");
    assert_eq!(server.requests(), 8);
}

#[tokio::test]
async fn waiters_are_served_in_fifo_order() {
    support::init_trace();
    let server = server::always(Reply::Delayed(200, "ok", Duration::from_millis(30))).await;

    let client = hyperhttp::Client::builder()
        .max_connections_per_host(1)
        .build()
        .unwrap();

    let completion: Arc<Mutex<Vec<usize>>> = Arc::default();
    let mut tasks = Vec::new();
    for i in 0..5 {
        let client = client.clone();
        let url = server.url("/x");
        let completion = completion.clone();
        tasks.push(tokio::spawn(async move {
            client.get(url).send().await.unwrap().bytes().await.unwrap();
            completion.lock().unwrap().push(i);
        }));
        // Ensure registration order matches spawn order.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*completion.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn global_ceiling_serializes_across_hosts() {
    support::init_trace();
    let server_a = server::always(Reply::Delayed(200, "a", Duration::from_millis(50))).await;
    let server_b = server::always(Reply::Delayed(200, "b", Duration::from_millis(50))).await;

    let client = hyperhttp::Client::builder()
        .max_connections(1)
        .max_connections_per_host(8)
        .build()
        .unwrap();

    let start = Instant::now();
    let (a, b) = tokio::join!(
        async {
            let client = client.clone();
            client.get(server_a.url("/")).send().await.unwrap().bytes().await.unwrap()
        },
        async {
            let client = client.clone();
            client.get(server_b.url("/")).send().await.unwrap().bytes().await.unwrap()
        },
    );
    let elapsed = start.elapsed();

    assert_eq!(&a[..], b"a");
    assert_eq!(&b[..], b"b");
    // With one global slot the two requests cannot overlap.
    assert!(
        elapsed >= Duration::from_millis(90),
        "requests overlapped under a global ceiling of 1: {elapsed:?}"
    );
}

#[tokio::test]
async fn max_requests_per_connection_rotates() {
    support::init_trace();
    let server = server::always(Reply::Body(200, "x")).await;

    let client = hyperhttp::Client::builder()
        .max_requests_per_connection(2)
        .build()
        .unwrap();

    for _ in 0..4 {
        client
            .get(server.url("/x"))
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
    }

    assert_eq!(server.connections(), 2);
    let stats = client.pool_stats();
    assert_eq!(stats.opened, 2);
}

#[tokio::test]
async fn max_age_expires_idle_connections() {
    support::init_trace();
    let server = server::always(Reply::Body(200, "x")).await;

    let client = hyperhttp::Client::builder()
        .max_age(Duration::from_millis(50))
        .reaper_interval(Duration::from_secs(60))
        .build()
        .unwrap();

    client.get(server.url("/a")).send().await.unwrap().bytes().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Checkout-time validation catches the expired connection even before
    // the reaper runs.
    client.get(server.url("/b")).send().await.unwrap().bytes().await.unwrap();

    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn idle_reaper_closes_stale_connections() {
    support::init_trace();
    let server = server::always(Reply::Body(200, "x")).await;

    let client = hyperhttp::Client::builder()
        .idle_timeout(Duration::from_millis(40))
        .reaper_interval(Duration::from_millis(20))
        .build()
        .unwrap();

    client.get(server.url("/x")).send().await.unwrap().bytes().await.unwrap();
    assert_eq!(client.pool_stats().closed, 0);

    // Stale after 40ms; the reaper must close it within one interval.
    tokio::time::sleep(Duration::from_millis(120)).await;

    let stats = client.pool_stats();
    assert_eq!(stats.closed, 1);
    let host = stats.origins.values().next().unwrap();
    assert_eq!(host.idle, 0);
}

#[tokio::test]
async fn broken_connections_are_never_handed_out_again() {
    support::init_trace();
    // First request dies mid-use; the replacement must be a new connection.
    let server = server::start(|n| {
        if n == 0 {
            Reply::CloseAbruptly
        } else {
            Reply::Body(200, "ok")
        }
    })
    .await;

    let client = hyperhttp::Client::builder()
        .retry_policy(hyperhttp::RetryPolicy::never())
        .build()
        .unwrap();

    let err = client.get(server.url("/a")).send().await.unwrap_err();
    assert!(err.is_network());

    let resp = client.get(server.url("/b")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    resp.bytes().await.unwrap();

    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn checkout_deadline_surfaces_pool_exhausted() {
    support::init_trace();
    let server = server::always(Reply::Delayed(200, "slow", Duration::from_millis(300))).await;

    let client = hyperhttp::Client::builder()
        .max_connections_per_host(1)
        .build()
        .unwrap();

    let blocker = {
        let client = client.clone();
        let url = server.url("/hold");
        tokio::spawn(async move { client.get(url).send().await.unwrap().bytes().await.unwrap() })
    };
    // Let the first request take the only slot.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let err = client
        .get(server.url("/starved"))
        .timeout(Duration::from_millis(50))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_pool_exhausted());

    blocker.await.unwrap();
}

#[tokio::test]
async fn shutdown_decays_open_connections_to_zero() {
    support::init_trace();
    let server = server::always(Reply::Delayed(200, "ok", Duration::from_millis(40))).await;

    let client = hyperhttp::Client::builder().build().unwrap();

    // One idle connection plus several in flight.
    client.get(server.url("/warm")).send().await.unwrap().bytes().await.unwrap();
    let inflight: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            let url = server.url("/work");
            tokio::spawn(async move {
                let resp = client.get(url).send().await?;
                resp.bytes().await.map(|_| ())
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.shutdown(Duration::from_secs(1)).await;

    let stats = client.pool_stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.opened, stats.closed);

    // In-flight requests either finished or were canceled, never left
    // half-open.
    for task in join_all(inflight).await {
        let _ = task.unwrap();
    }
}
