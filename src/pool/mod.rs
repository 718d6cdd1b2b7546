//! Connection pooling.
//!
//! The pool keys reusable connections by [`Origin`] and routes checkouts to
//! a per-origin [`HostPool`]. A single semaphore enforces the global
//! connection ceiling; its owned permits live inside the connections, so a
//! close anywhere releases budget everywhere. A background reaper sweeps all
//! host pools on a fixed interval.

mod host;

pub(crate) use host::{Disposition, HostPool, PooledConn};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use tokio::{
    sync::{Notify, Semaphore},
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, trace};

use crate::{
    connect::{ConnectError, Connector, Origin},
    sync::Mutex,
};

pub(crate) struct PoolConfig {
    pub(crate) max_connections: usize,
    pub(crate) max_connections_per_host: usize,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) max_age: Option<Duration>,
    pub(crate) max_requests_per_connection: Option<u32>,
    pub(crate) reaper_interval: Duration,
}

#[derive(Default)]
pub(crate) struct Metrics {
    opened: AtomicU64,
    closed: AtomicU64,
}

impl Metrics {
    pub(crate) fn record_open(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_close(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }
}

/// Why a checkout failed. Connect failures stay structured so the retry
/// engine can classify them; the other two are terminal.
#[derive(Debug)]
pub(crate) enum AcquireError {
    /// Per-host or global budget prevented acquisition within the deadline.
    Exhausted,
    /// The client is shut down.
    Closed,
    Connect(ConnectError),
}

pub(crate) struct PoolShared {
    hosts: Mutex<HashMap<Origin, Arc<HostPool>>>,
    pub(crate) semaphore: Arc<Semaphore>,
    /// Signaled whenever a connection is parked idle; dialers blocked on the
    /// global budget re-check whether an idle connection can be evicted.
    pub(crate) idle_parked: Notify,
    pub(crate) connector: Connector,
    pub(crate) config: PoolConfig,
    pub(crate) metrics: Metrics,
    pub(crate) next_id: AtomicU64,
    closed: AtomicBool,
    reaper_started: AtomicBool,
}

impl PoolShared {
    /// Closes one idle connection, anywhere, to free global budget.
    ///
    /// The per-host pools prefer their own MRU end; across hosts this takes
    /// whichever pool has something idle. Returns false when every open
    /// connection is in use.
    pub(crate) fn evict_one_idle(&self) -> bool {
        let hosts: Vec<Arc<HostPool>> = self.hosts.lock().values().cloned().collect();
        for host in hosts {
            if host.evict_lru_idle(self) {
                return true;
            }
        }
        false
    }
}

pub(crate) struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    pub(crate) fn new(config: PoolConfig, connector: Connector) -> Pool {
        let semaphore = Arc::new(Semaphore::new(config.max_connections));
        Pool {
            shared: Arc::new(PoolShared {
                hosts: Mutex::new(HashMap::new()),
                semaphore,
                idle_parked: Notify::new(),
                connector,
                config,
                metrics: Metrics::default(),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                reaper_started: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn has_tls(&self) -> bool {
        self.shared.connector.has_tls()
    }

    pub(crate) async fn acquire(
        &self,
        origin: &Origin,
        deadline: Option<Instant>,
    ) -> Result<PooledConn, AcquireError> {
        if self.is_closed() {
            return Err(AcquireError::Closed);
        }
        // Host pools are created lazily and never evicted before shutdown;
        // they are cheap, their connections are not.
        let host = {
            let mut hosts = self.shared.hosts.lock();
            hosts
                .entry(origin.clone())
                .or_insert_with(|| Arc::new(HostPool::new(origin.clone())))
                .clone()
        };
        self.ensure_reaper();
        host.checkout(&self.shared, deadline).await
    }

    /// Spawns the idle reaper on first use. Holding only a weak reference
    /// lets the task die with the pool.
    fn ensure_reaper(&self) {
        if self.shared.reaper_started.swap(true, Ordering::Relaxed) {
            return;
        }
        let needs_reaping = self.shared.config.idle_timeout.is_some()
            || self.shared.config.max_age.is_some()
            || self.shared.config.max_requests_per_connection.is_some();
        if !needs_reaping {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let period = self.shared.config.reaper_interval;
        tokio::spawn(reap_loop(weak, period));
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let hosts = self.shared.hosts.lock();
        let mut origins = HashMap::with_capacity(hosts.len());
        let mut in_use = 0;
        for (origin, host) in hosts.iter() {
            let (host_idle, host_in_use, host_waiters) = host.size();
            in_use += host_in_use;
            origins.insert(
                origin.clone(),
                HostStats {
                    idle: host_idle,
                    in_use: host_in_use,
                    waiters: host_waiters,
                },
            );
        }
        PoolStats {
            origins,
            opened: self.shared.metrics.opened(),
            closed: self.shared.metrics.closed(),
            in_use,
        }
    }

    /// Refuses new checkouts, fails parked waiters, closes idle connections,
    /// then waits up to `grace` for in-flight connections to come home.
    pub(crate) async fn shutdown(&self, grace: Duration) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let hosts: Vec<Arc<HostPool>> = self.shared.hosts.lock().values().cloned().collect();
        for host in &hosts {
            let drained = host.shutdown(&self.shared);
            drop(drained);
        }

        // Every open connection holds one permit; full availability means
        // the open-connection count has decayed to zero.
        let deadline = Instant::now() + grace;
        loop {
            if self.shared.semaphore.available_permits() >= self.shared.config.max_connections {
                debug!("pool drained");
                return;
            }
            if Instant::now() >= deadline {
                debug!("shutdown grace elapsed with connections still open");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn reap_loop(weak: Weak<PoolShared>, period: Duration) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    tick.tick().await;
    loop {
        tick.tick().await;
        let shared = match weak.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        // Snapshot the host list, then take each host's lock in turn; the
        // reaper never holds two locks at once.
        let hosts: Vec<Arc<HostPool>> = shared.hosts.lock().values().cloned().collect();
        for host in hosts {
            host.evict_idle(&shared);
        }
        trace!("reaper pass complete");
    }
}

/// Point-in-time pool counters, per origin and global.
#[derive(Clone, Debug)]
pub struct PoolStats {
    pub origins: HashMap<Origin, HostStats>,
    /// Connections opened since the client was built.
    pub opened: u64,
    /// Connections closed since the client was built.
    pub closed: u64,
    /// Connections currently checked out.
    pub in_use: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    pub idle: usize,
    pub in_use: usize,
    pub waiters: usize,
}
