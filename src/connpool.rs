//! Per-endpoint connection pool: a bounded reservoir of pre-dialed RPC
//! channels with a tri-state connection lifecycle.
//!
//! Connections are checked out and returned through atomic state rather
//! than `&mut self` checkout/checkin, over a capacity-bounded ring, so
//! the pool is safe to share across threads without a central lock on
//! the hot path.

use crate::error::{Error, Result};
use crate::kv::{Channel, Connector, KvError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const STATE_WAIT: u8 = 0;
const STATE_ALLOC: u8 = 1;
const STATE_CLOSE: u8 = 2;

const POOL_OPEN: u8 = 0;
const POOL_CLOSED: u8 = 1;

/// A capacity-bounded, non-blocking ring of pooled connections. `push`
/// never blocks -- it simply refuses once `capacity` is reached -- and
/// `pop` never blocks -- it simply returns `None` once empty. Overflow is
/// handled by closing the connection rather than waiting for room, so
/// there is no task-parking half to this ring.
struct Ring<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        Ring { capacity, items: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    fn push(&self, item: T) -> std::result::Result<(), T> {
        let mut items = self.items.lock().expect("pool ring lock poisoned");
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        Ok(())
    }

    fn pop(&self) -> Option<T> {
        self.items.lock().expect("pool ring lock poisoned").pop_front()
    }

    fn len(&self) -> usize {
        self.items.lock().expect("pool ring lock poisoned").len()
    }
}

/// One pooled RPC channel.
pub struct Connection<C: Channel> {
    pub id: String,
    state: AtomicU8,
    readonly: AtomicBool,
    channel: C,
    release: Arc<dyn Fn(Arc<Connection<C>>) + Send + Sync>,
}

impl<C: Channel> Connection<C> {
    fn new_wait(channel: C, release: Arc<dyn Fn(Arc<Connection<C>>) + Send + Sync>) -> Arc<Self> {
        Arc::new(Connection {
            id: Uuid::new_v4().to_string(),
            state: AtomicU8::new(STATE_WAIT),
            readonly: AtomicBool::new(false),
            channel,
            release,
        })
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Returns the connection to its pool. No-op unless the connection is
    /// currently allocated.
    pub fn release(self: &Arc<Self>) {
        if self.state.compare_exchange(
            STATE_ALLOC,
            STATE_WAIT,
            Ordering::AcqRel,
            Ordering::Acquire,
        ).is_err() {
            return;
        }
        self.readonly.store(false, Ordering::Release);
        (self.release)(self.clone());
    }

    /// Closes the connection. Refuses (without closing) when the
    /// connection was allocated readonly -- the borrower must `release`
    /// instead.
    pub fn close(&self) -> Result<()> {
        if self.state() == STATE_CLOSE {
            return Ok(());
        }
        if self.is_readonly() {
            return Err(Error::CloseReadonlyConn);
        }
        self.state.store(STATE_CLOSE, Ordering::Release);
        self.channel.close();
        Ok(())
    }

    fn force_close(&self) {
        self.state.store(STATE_CLOSE, Ordering::Release);
        self.channel.close();
    }
}

/// A fixed-capacity pool of connections to one endpoint address.
pub struct Pool<C: Channel> {
    state: AtomicU8,
    capacity: usize,
    ring: Arc<Ring<Arc<Connection<C>>>>,
    peer_address: String,
    connector: Arc<dyn Connector<C>>,
}

impl<C: Channel> Pool<C> {
    /// Dials `capacity` channels up front; any dial failure aborts
    /// construction. The channels dialed before the failure are handed
    /// back via the error so the caller's cleanup path can close them --
    /// `Pool` itself never leaks them silently, but it also never closes
    /// on the caller's behalf (see SPEC_FULL.md §9).
    pub async fn connect(
        peer_address: impl Into<String>,
        connector: Arc<dyn Connector<C>>,
        capacity: usize,
    ) -> std::result::Result<Pool<C>, (KvError, Vec<C>)> {
        let peer_address = peer_address.into();
        let ring = Arc::new(Ring::new(capacity.max(1)));
        let mut dialed = Vec::with_capacity(capacity);

        for _ in 0..capacity {
            match connector.dial(&peer_address).await {
                Ok(channel) => dialed.push(channel),
                Err(e) => return Err((e, dialed)),
            }
        }

        let pool = Pool {
            state: AtomicU8::new(POOL_OPEN),
            capacity,
            ring,
            peer_address,
            connector,
        };
        for channel in dialed {
            let conn = Connection::new_wait(channel, pool.release_fn());
            let _ = pool.ring.push(conn);
        }
        Ok(pool)
    }

    fn release_fn(&self) -> Arc<dyn Fn(Arc<Connection<C>>) + Send + Sync> {
        let ring = self.ring.clone();
        Arc::new(move |conn: Arc<Connection<C>>| {
            if ring.push(conn.clone()).is_err() {
                // Ring full: bounded memory wins over blocking the
                // borrower, so the connection is simply closed instead.
                conn.force_close();
            }
        })
    }

    fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == POOL_CLOSED
    }

    /// Non-blocking allocate. Tries the ring first, discarding any stale
    /// (non-`WAIT`) entry it pops; falls through to a fresh dial when the
    /// ring is empty.
    pub async fn alloc(&self, readonly: bool) -> Result<Arc<Connection<C>>> {
        if self.is_closed() {
            return Err(Error::ConnPoolClosed);
        }

        loop {
            match self.ring.pop() {
                Some(conn) => {
                    if conn.state.compare_exchange(
                        STATE_WAIT,
                        STATE_ALLOC,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ).is_ok() {
                        conn.readonly.store(readonly, Ordering::Release);
                        return Ok(conn);
                    }
                    // Stale entry (closed out from under the ring); retry.
                }
                None => {
                    let channel = self
                        .connector
                        .dial(&self.peer_address)
                        .await
                        .map_err(|e| Error::DialFailure(e.0))?;
                    let conn = Connection::new_wait(channel, self.release_fn());
                    conn.state.store(STATE_ALLOC, Ordering::Release);
                    conn.readonly.store(readonly, Ordering::Release);
                    return Ok(conn);
                }
            }
        }
    }

    /// Closes the pool: marks it terminal and drains + closes every
    /// ringed connection. Idempotent -- a second call returns
    /// `ConnPoolClosed`.
    pub fn close(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(POOL_OPEN, POOL_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ConnPoolClosed);
        }
        while let Some(conn) = self.ring.pop() {
            conn.force_close();
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }
}
