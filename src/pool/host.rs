use std::{
    collections::VecDeque,
    sync::{atomic::Ordering, Arc, Weak},
    time::Instant,
};

use tokio::{
    sync::{oneshot, OwnedSemaphorePermit},
    time::{timeout_at, Instant as Deadline},
};
use tracing::{debug, trace};

use super::{AcquireError, PoolShared};
use crate::{connect::Origin, proto::Transport, sync::Mutex};

/// A pooled transport plus its bookkeeping. Exists in exactly one place at a
/// time: the host's idle list, or one executor's checkout guard.
pub(crate) struct Connection {
    pub(crate) id: u64,
    pub(crate) transport: Transport,
    created_at: Instant,
    idle_at: Instant,
    served: u32,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    fn new(id: u64, transport: Transport, permit: OwnedSemaphorePermit) -> Connection {
        let now = Instant::now();
        Connection {
            id,
            transport,
            created_at: now,
            idle_at: now,
            served: 0,
            _permit: permit,
        }
    }

    fn within_budgets(&self, shared: &PoolShared, now: Instant) -> bool {
        if let Some(max_age) = shared.config.max_age {
            if now.saturating_duration_since(self.created_at) >= max_age {
                return false;
            }
        }
        if let Some(max_requests) = shared.config.max_requests_per_connection {
            if self.served >= max_requests {
                return false;
            }
        }
        true
    }

    fn idle_expired(&self, shared: &PoolShared, now: Instant) -> bool {
        match shared.config.idle_timeout {
            Some(timeout) => now.saturating_duration_since(self.idle_at) > timeout,
            None => false,
        }
    }
}

/// What an executor tells the pool about the connection it is returning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Framing is clean; the connection may serve another request.
    Reusable,
    /// Framing state unknown or the transport failed. Close it.
    Broken,
    /// Aged out or reached its request budget. Closed, but not an error.
    Exhausted,
}

enum Grant {
    /// A checked-in connection, handed over directly.
    Idle(Connection),
    /// Freed capacity: the waiter dials its own replacement on a slot that
    /// stays reserved through the transfer.
    OpenSlot,
}

/// Per-origin connection pool.
///
/// The idle list, in-use count, and waiter queue form one critical section;
/// every mutation happens under the single mutex. Idle pops take the
/// most-recently-used end for cache warmth; waiter wakeups are strict FIFO
/// so saturation cannot starve an early caller.
pub(crate) struct HostPool {
    pub(crate) origin: Origin,
    inner: Mutex<HostInner>,
}

struct HostInner {
    /// MRU at the tail.
    idle: Vec<Connection>,
    in_use: usize,
    /// idle + in-use + reserved dial slots. Never exceeds the per-host max.
    total: usize,
    waiters: VecDeque<oneshot::Sender<Grant>>,
    closed: bool,
}

enum Step {
    Reuse(Connection),
    Dial,
    Wait(oneshot::Receiver<Grant>),
}

impl HostPool {
    pub(crate) fn new(origin: Origin) -> HostPool {
        HostPool {
            origin,
            inner: Mutex::new(HostInner {
                idle: Vec::new(),
                in_use: 0,
                total: 0,
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    pub(crate) async fn checkout(
        self: &Arc<Self>,
        shared: &Arc<PoolShared>,
        deadline: Option<Deadline>,
    ) -> Result<PooledConn, AcquireError> {
        loop {
            let step = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(AcquireError::Closed);
                }
                let now = Instant::now();
                let mut found = None;
                while let Some(conn) = inner.idle.pop() {
                    if conn.within_budgets(shared, now) && conn.transport.is_alive() {
                        found = Some(conn);
                        break;
                    }
                    trace!("discarding stale idle connection for {}", self.origin);
                    inner.total -= 1;
                    shared.metrics.record_close();
                }
                match found {
                    Some(conn) => {
                        inner.in_use += 1;
                        Step::Reuse(conn)
                    }
                    None if inner.total < shared.config.max_connections_per_host => {
                        inner.total += 1;
                        Step::Dial
                    }
                    None => {
                        let (tx, rx) = oneshot::channel();
                        inner.waiters.push_back(tx);
                        trace!("at capacity for {}, parking checkout", self.origin);
                        Step::Wait(rx)
                    }
                }
            };

            match step {
                Step::Reuse(conn) => {
                    trace!("reuse idle connection {} for {}", conn.id, self.origin);
                    return Ok(PooledConn::new(conn, self.clone(), Arc::downgrade(shared)));
                }
                Step::Dial => return self.dial(shared, deadline).await,
                Step::Wait(rx) => {
                    match self.await_grant(rx, deadline).await? {
                        Grant::OpenSlot => return self.dial(shared, deadline).await,
                        Grant::Idle(conn) => {
                            let usable = conn.within_budgets(shared, Instant::now())
                                && conn.transport.is_alive();
                            if usable {
                                self.inner.lock().in_use += 1;
                                return Ok(PooledConn::new(
                                    conn,
                                    self.clone(),
                                    Arc::downgrade(shared),
                                ));
                            }
                            // Died in transit; return its slot and go again.
                            trace!("granted connection was dead for {}", self.origin);
                            self.inner.lock().total -= 1;
                            shared.metrics.record_close();
                        }
                    }
                }
            }
        }
    }

    async fn await_grant(
        &self,
        rx: oneshot::Receiver<Grant>,
        deadline: Option<Deadline>,
    ) -> Result<Grant, AcquireError> {
        let received = match deadline {
            Some(at) => match timeout_at(at, rx).await {
                Ok(received) => received,
                Err(_) => {
                    debug!("checkout deadline elapsed waiting on {}", self.origin);
                    return Err(AcquireError::Exhausted);
                }
            },
            None => rx.await,
        };
        // The sender only disappears without a grant when the pool shuts
        // down.
        received.map_err(|_| AcquireError::Closed)
    }

    /// Dials on a slot already reserved in `total`.
    async fn dial(
        self: &Arc<Self>,
        shared: &Arc<PoolShared>,
        deadline: Option<Deadline>,
    ) -> Result<PooledConn, AcquireError> {
        match self.dial_inner(shared, deadline).await {
            Ok(conn) => {
                let mut inner = self.inner.lock();
                if inner.closed {
                    inner.total -= 1;
                    shared.metrics.record_close();
                    return Err(AcquireError::Closed);
                }
                inner.in_use += 1;
                drop(inner);
                Ok(PooledConn::new(conn, self.clone(), Arc::downgrade(shared)))
            }
            Err(e) => {
                self.release_slot();
                Err(e)
            }
        }
    }

    async fn dial_inner(
        &self,
        shared: &Arc<PoolShared>,
        deadline: Option<Deadline>,
    ) -> Result<Connection, AcquireError> {
        // The global budget gates the actual socket, not the reservation.
        let permit = self.acquire_global(shared, deadline).await?;

        let stream = shared
            .connector
            .connect(&self.origin, deadline)
            .await
            .map_err(AcquireError::Connect)?;

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        shared.metrics.record_open();
        debug!("opened connection {id} to {}", self.origin);
        Ok(Connection::new(id, Transport::new(stream), permit))
    }

    /// Takes one unit of the global connection budget.
    ///
    /// The ceiling counts open connections, idle included, so exhaustion
    /// often means another origin is hoarding idle sockets: evict one and
    /// take its permit rather than blocking behind it.
    async fn acquire_global(
        &self,
        shared: &Arc<PoolShared>,
        deadline: Option<Deadline>,
    ) -> Result<OwnedSemaphorePermit, AcquireError> {
        use tokio::sync::TryAcquireError;

        loop {
            match shared.semaphore.clone().try_acquire_owned() {
                Ok(permit) => return Ok(permit),
                Err(TryAcquireError::Closed) => return Err(AcquireError::Closed),
                Err(TryAcquireError::NoPermits) => {}
            }

            if shared.evict_one_idle() {
                // Freed a permit; race for it on the next spin.
                continue;
            }

            debug!("global connection budget exhausted dialing {}", self.origin);
            let wait = async {
                tokio::select! {
                    acquired = shared.semaphore.clone().acquire_owned() => {
                        acquired.map(Some).map_err(|_| AcquireError::Closed)
                    }
                    _ = shared.idle_parked.notified() => Ok(None),
                }
            };
            let woken = match deadline {
                Some(at) => match timeout_at(at, wait).await {
                    Ok(woken) => woken?,
                    Err(_) => return Err(AcquireError::Exhausted),
                },
                None => wait.await?,
            };
            if let Some(permit) = woken {
                return Ok(permit);
            }
            // A connection was parked idle somewhere; try evicting again.
        }
    }

    /// Returns a reserved-but-unused dial slot, preferring to pass it to the
    /// head waiter.
    fn release_slot(&self) {
        let mut inner = self.inner.lock();
        loop {
            match inner.waiters.pop_front() {
                Some(tx) => {
                    if tx.send(Grant::OpenSlot).is_ok() {
                        return;
                    }
                }
                None => {
                    inner.total -= 1;
                    return;
                }
            }
        }
    }

    pub(crate) fn checkin(&self, shared: &PoolShared, mut conn: Connection, disposition: Disposition) {
        let mut inner = self.inner.lock();
        inner.in_use -= 1;

        let disposition = if inner.closed {
            Disposition::Broken
        } else if disposition == Disposition::Reusable {
            conn.served += 1;
            conn.idle_at = Instant::now();
            if conn.within_budgets(shared, conn.idle_at) && conn.transport.is_reusable() {
                Disposition::Reusable
            } else {
                Disposition::Exhausted
            }
        } else {
            disposition
        };

        match disposition {
            Disposition::Reusable => {
                // FIFO handoff to parked checkouts before pooling idle.
                loop {
                    match inner.waiters.pop_front() {
                        Some(tx) => match tx.send(Grant::Idle(conn)) {
                            Ok(()) => {
                                trace!("handed connection to waiter for {}", self.origin);
                                return;
                            }
                            Err(grant) => {
                                conn = match grant {
                                    Grant::Idle(conn) => conn,
                                    Grant::OpenSlot => unreachable!("sent an idle grant"),
                                };
                            }
                        },
                        None => break,
                    }
                }
                trace!("pooling idle connection {} for {}", conn.id, self.origin);
                inner.idle.push(conn);
                shared.idle_parked.notify_one();
            }
            Disposition::Broken | Disposition::Exhausted => {
                trace!(
                    "closing connection {} for {} ({:?})",
                    conn.id,
                    self.origin,
                    disposition
                );
                inner.total -= 1;
                shared.metrics.record_close();
                drop(conn);
                // Capacity freed: wake the head waiter to dial a
                // replacement.
                loop {
                    match inner.waiters.pop_front() {
                        Some(tx) => {
                            inner.total += 1;
                            if tx.send(Grant::OpenSlot).is_ok() {
                                return;
                            }
                            inner.total -= 1;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Closes this host's least-recently-used idle connection to free
    /// global budget. Returns false if nothing is idle.
    pub(crate) fn evict_lru_idle(&self, shared: &PoolShared) -> bool {
        let mut inner = self.inner.lock();
        if inner.idle.is_empty() {
            return false;
        }
        let conn = inner.idle.remove(0);
        inner.total -= 1;
        shared.metrics.record_close();
        trace!(
            "evicting idle connection {} from {} for global budget",
            conn.id,
            self.origin
        );
        drop(conn);
        true
    }

    /// Reaper probe: closes idle connections past the idle timeout, over
    /// their budgets, or whose socket has gone away. Connections are dropped
    /// outside the critical section.
    pub(crate) fn evict_idle(&self, shared: &PoolShared) {
        let now = Instant::now();
        let evicted: Vec<Connection> = {
            let mut inner = self.inner.lock();
            let mut kept = Vec::with_capacity(inner.idle.len());
            let mut evicted = Vec::new();
            for conn in inner.idle.drain(..) {
                if conn.idle_expired(shared, now)
                    || !conn.within_budgets(shared, now)
                    || !conn.transport.is_alive()
                {
                    evicted.push(conn);
                } else {
                    kept.push(conn);
                }
            }
            inner.idle = kept;
            inner.total -= evicted.len();
            for _ in &evicted {
                shared.metrics.record_close();
            }
            evicted
        };
        if !evicted.is_empty() {
            debug!(
                "reaper closed {} idle connections for {}",
                evicted.len(),
                self.origin
            );
        }
    }

    /// Fails parked waiters and hands idle connections back for closing.
    pub(crate) fn shutdown(&self, shared: &PoolShared) -> Vec<Connection> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.waiters.clear();
        let drained: Vec<Connection> = inner.idle.drain(..).collect();
        inner.total -= drained.len();
        for _ in &drained {
            shared.metrics.record_close();
        }
        drained
    }

    /// (idle, in-use, waiters) snapshot. Prunes waiters whose checkouts were
    /// dropped so the count reflects live parked callers.
    pub(crate) fn size(&self) -> (usize, usize, usize) {
        let mut inner = self.inner.lock();
        inner.waiters.retain(|tx| !tx.is_closed());
        (inner.idle.len(), inner.in_use, inner.waiters.len())
    }
}

/// Checkout guard: exclusive access to one connection for one attempt.
///
/// Checked back in on drop with whatever disposition the executor last set.
/// The default is `Broken`, which is exactly what must happen when a caller
/// walks away from a response body without draining it.
pub(crate) struct PooledConn {
    conn: Option<Connection>,
    host: Arc<HostPool>,
    shared: Weak<PoolShared>,
    disposition: Disposition,
}

impl PooledConn {
    fn new(conn: Connection, host: Arc<HostPool>, shared: Weak<PoolShared>) -> PooledConn {
        PooledConn {
            conn: Some(conn),
            host,
            shared,
            disposition: Disposition::Broken,
        }
    }

    pub(crate) fn transport(&mut self) -> &mut Transport {
        &mut self
            .conn
            .as_mut()
            .expect("connection present until drop")
            .transport
    }

    pub(crate) fn set_disposition(&mut self, disposition: Disposition) {
        self.disposition = disposition;
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Some(shared) = self.shared.upgrade() {
                self.host.checkin(&shared, conn, self.disposition);
            }
            // Without the pool, dropping the connection closes the socket.
        }
    }
}
