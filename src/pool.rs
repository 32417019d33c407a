// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Per-hostname cache of TLS listeners.
//!
//! A miss inserts a pending entry before any I/O, so concurrent requests for
//! the same hostname share one certificate and one bound listener. Entries
//! leave the pool on explicit removal, on listener or handshake faults, when
//! no secure handshake arrives within the idle timeout, or when a capacity
//! sweep finds them without live connections.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ca::RootAuthority;
use crate::cert::LeafCertificate;
use crate::config::PoolConfig;
use crate::error::{Rejection, RemovalCause, Result};
use crate::listener::{Handlers, ListenerSignal, SignalHook, TlsListener};
use crate::port::{LoopbackPortFinder, PortFinder};

/// What a waiter eventually receives: the bound port or the reason there is none.
pub type PortResult = std::result::Result<u16, Rejection>;

pub type ReadyCallback = Box<dyn FnOnce(PortResult) + Send>;

enum Outcome {
    Pending(Vec<ReadyCallback>),
    Ready(u16),
    Closed,
}

/// One hostname's slot in the pool.
struct ListenerEntry {
    hostname: String,
    outcome: Mutex<Outcome>,
    listener: Mutex<Option<Arc<TlsListener>>>,
    idle_timer: CancellationToken,
    query_in_flight: AtomicBool,
}

impl ListenerEntry {
    fn pending(hostname: &str, on_ready: ReadyCallback) -> Self {
        Self {
            hostname: hostname.to_string(),
            outcome: Mutex::new(Outcome::Pending(vec![on_ready])),
            listener: Mutex::new(None),
            idle_timer: CancellationToken::new(),
            query_in_flight: AtomicBool::new(false),
        }
    }

    fn port(&self) -> Option<u16> {
        match *lock(&self.outcome) {
            Outcome::Ready(port) => Some(port),
            Outcome::Pending(_) | Outcome::Closed => None,
        }
    }

    fn listener(&self) -> Option<Arc<TlsListener>> {
        lock(&self.listener).clone()
    }

    /// Queue `on_ready` while pending, otherwise hand it back with the
    /// settled outcome so the caller can invoke it outside any lock.
    fn observe(&self, on_ready: ReadyCallback) -> Option<(ReadyCallback, PortResult)> {
        let settled = match &mut *lock(&self.outcome) {
            Outcome::Pending(waiters) => {
                waiters.push(on_ready);
                return None;
            }
            Outcome::Ready(port) => Ok(*port),
            Outcome::Closed => Err(Rejection::Evicted {
                hostname: self.hostname.clone(),
                cause: RemovalCause::Explicit,
            }),
        };
        Some((on_ready, settled))
    }

    /// Pending -> Ready. Returns the waiters to notify; none if the entry
    /// was shut down in the meantime.
    fn resolve(&self, port: u16) -> Vec<ReadyCallback> {
        let mut outcome = lock(&self.outcome);
        match std::mem::replace(&mut *outcome, Outcome::Ready(port)) {
            Outcome::Pending(waiters) => waiters,
            previous => {
                *outcome = previous;
                Vec::new()
            }
        }
    }

    fn claim_query(self: &Arc<Self>) -> Option<QueryClaim> {
        self.query_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| QueryClaim(Arc::clone(self)))
    }

    /// Cancel the idle timer, close the listener and reject anyone still waiting.
    fn shut_down(&self, cause: RemovalCause, rejection: Rejection) {
        self.idle_timer.cancel();

        if let Some(listener) = lock(&self.listener).take() {
            if let Err(e) = listener.close() {
                debug!(hostname = %self.hostname, error = %e, "listener was already closed");
            }
        }

        let waiters = match std::mem::replace(&mut *lock(&self.outcome), Outcome::Closed) {
            Outcome::Pending(waiters) => waiters,
            Outcome::Ready(_) | Outcome::Closed => Vec::new(),
        };

        info!(hostname = %self.hostname, %cause, rejected = waiters.len(), "listener removed");
        for on_ready in waiters {
            on_ready(Err(rejection.clone()));
        }
    }
}

/// Marks an entry as having a connection-count query outstanding.
struct QueryClaim(Arc<ListenerEntry>);

impl Drop for QueryClaim {
    fn drop(&mut self) {
        self.0.query_in_flight.store(false, Ordering::Release);
    }
}

struct PoolInner {
    idle_timeout: Duration,
    max_listeners: usize,
    authority: Arc<RootAuthority>,
    port_finder: Arc<dyn PortFinder>,
    entries: Mutex<HashMap<String, Arc<ListenerEntry>>>,
}

impl PoolInner {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, Arc<ListenerEntry>>> {
        lock(&self.entries)
    }

    fn entry(&self, hostname: &str) -> Option<Arc<ListenerEntry>> {
        self.lock_entries().get(hostname).cloned()
    }

    /// Remove `entry` if it is still the one cached for its hostname.
    fn detach(&self, entry: &Arc<ListenerEntry>) -> bool {
        let mut entries = self.lock_entries();
        match entries.get(&entry.hostname) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(&entry.hostname);
                true
            }
            _ => false,
        }
    }

    fn evict(&self, entry: &Arc<ListenerEntry>, cause: RemovalCause) -> bool {
        if !self.detach(entry) {
            return false;
        }
        entry.shut_down(
            cause,
            Rejection::Evicted {
                hostname: entry.hostname.clone(),
                cause,
            },
        );
        true
    }

    async fn create(
        self: Arc<Self>,
        entry: Arc<ListenerEntry>,
        handlers: Handlers,
        protocol_timeout: Option<Duration>,
    ) {
        match self.bind_listener(&entry, handlers, protocol_timeout).await {
            Ok(listener) => self.publish(&entry, listener),
            Err(rejection) => {
                warn!(hostname = %entry.hostname, error = %rejection, "listener creation failed");
                if self.detach(&entry) {
                    entry.shut_down(RemovalCause::CreationFailed, rejection);
                }
            }
        }
    }

    async fn bind_listener(
        self: &Arc<Self>,
        entry: &Arc<ListenerEntry>,
        handlers: Handlers,
        protocol_timeout: Option<Duration>,
    ) -> std::result::Result<TlsListener, Rejection> {
        let hostname = &entry.hostname;

        let tls_config = LeafCertificate::issue(hostname, &self.authority)
            .and_then(|leaf| leaf.server_config(&self.authority))
            .map_err(|e| Rejection::Certificate {
                hostname: hostname.clone(),
                reason: e.to_string(),
            })?;
        debug!(hostname = %hostname, "leaf certificate issued");

        let port = self
            .port_finder
            .find_port()
            .await
            .map_err(|e| Rejection::PortUnavailable {
                hostname: hostname.clone(),
                reason: e.to_string(),
            })?;

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let hook = self.signal_hook(entry);
        TlsListener::bind(addr, tls_config, handlers, protocol_timeout, hook)
            .await
            .map_err(|e| Rejection::ListenerFault {
                hostname: hostname.clone(),
                reason: e.to_string(),
            })
    }

    fn publish(self: &Arc<Self>, entry: &Arc<ListenerEntry>, listener: TlsListener) {
        let port = listener.port();
        let listener = Arc::new(listener);

        {
            let entries = self.lock_entries();
            let current = entries
                .get(&entry.hostname)
                .is_some_and(|cached| Arc::ptr_eq(cached, entry));
            if !current {
                drop(entries);
                debug!(hostname = %entry.hostname, port, "entry removed while binding, discarding listener");
                let _ = listener.close();
                return;
            }
            *lock(&entry.listener) = Some(listener);
        }

        self.spawn_idle_timer(entry);

        let waiters = entry.resolve(port);
        info!(hostname = %entry.hostname, port, waiters = waiters.len(), "listener ready");
        for on_ready in waiters {
            on_ready(Ok(port));
        }
    }

    fn spawn_idle_timer(self: &Arc<Self>, entry: &Arc<ListenerEntry>) {
        let pool = Arc::downgrade(self);
        let weak_entry = Arc::downgrade(entry);
        let cancelled = entry.idle_timer.clone();
        let idle_timeout = self.idle_timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(idle_timeout) => {
                    if let (Some(pool), Some(entry)) = (pool.upgrade(), weak_entry.upgrade()) {
                        debug!(hostname = %entry.hostname, ?idle_timeout, "no secure handshake before idle timeout");
                        pool.evict(&entry, RemovalCause::IdleTimeout);
                    }
                }
            }
        });
    }

    fn signal_hook(self: &Arc<Self>, entry: &Arc<ListenerEntry>) -> SignalHook {
        let pool = Arc::downgrade(self);
        let entry = Arc::downgrade(entry);

        Arc::new(move |signal| {
            let (Some(pool), Some(entry)) = (pool.upgrade(), entry.upgrade()) else {
                return;
            };
            match signal {
                ListenerSignal::SecureConnection(peer) => {
                    if !entry.idle_timer.is_cancelled() {
                        debug!(hostname = %entry.hostname, %peer, "first secure handshake");
                        entry.idle_timer.cancel();
                    }
                }
                ListenerSignal::HandshakeFailed { peer, reason } => {
                    warn!(hostname = %entry.hostname, %peer, %reason, "TLS handshake failed");
                    pool.evict(&entry, RemovalCause::HandshakeFault);
                }
                ListenerSignal::Failed { reason } => {
                    warn!(hostname = %entry.hostname, %reason, "listener failed");
                    pool.evict(&entry, RemovalCause::ListenerFault);
                }
            }
        })
    }

    async fn sweep(&self) -> usize {
        let (snapshot, candidates) = {
            let entries = self.lock_entries();
            let snapshot = entries.len();
            if snapshot < self.max_listeners {
                return 0;
            }

            let candidates: Vec<_> = entries
                .values()
                .filter(|entry| entry.port().is_some())
                .filter_map(|entry| {
                    let listener = entry.listener()?;
                    entry.claim_query().map(|claim| (claim, listener))
                })
                .collect();
            (snapshot, candidates)
        };

        debug!(snapshot, queried = candidates.len(), max = self.max_listeners, "capacity sweep");

        let mut queries = JoinSet::new();
        for (claim, listener) in candidates {
            queries.spawn(async move {
                let count = listener.connection_count().await;
                (claim, count)
            });
        }

        let mut evicted = 0;
        while let Some(joined) = queries.join_next().await {
            let Ok((claim, count)) = joined else {
                continue;
            };
            let entry = Arc::clone(&claim.0);
            drop(claim);

            match count {
                Ok(0) => {
                    if self.evict(&entry, RemovalCause::CapacitySweep) {
                        evicted += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(hostname = %entry.hostname, error = %e, "connection count unavailable");
                }
            }
        }
        evicted
    }
}

/// Pool of loopback TLS listeners keyed by hostname.
///
/// Cloning is cheap and every clone drives the same pool. Call
/// [`ListenerPool::clear`] to shut it down. Dropping the last handle also
/// closes every cached listener once in-flight creations finish, but logs
/// nothing and rejects no waiters.
#[derive(Clone)]
pub struct ListenerPool {
    inner: Arc<PoolInner>,
}

impl ListenerPool {
    /// Build the root authority from `config.ca` and an empty pool that
    /// discovers ports with [`LoopbackPortFinder`].
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_port_finder(config, Arc::new(LoopbackPortFinder))
    }

    pub fn with_port_finder(config: PoolConfig, port_finder: Arc<dyn PortFinder>) -> Result<Self> {
        config.validate()?;
        let authority = RootAuthority::build(&config.ca)?;

        info!(
            common_name = %config.ca.common_name,
            imported_key = config.ca.key_pem.is_some(),
            max_listeners = config.max_listeners,
            idle_timeout_ms = config.idle_timeout_ms,
            "listener pool created"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                idle_timeout: config.idle_timeout(),
                max_listeners: config.max_listeners,
                authority: Arc::new(authority),
                port_finder,
                entries: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Ask for the listener serving `hostname`.
    ///
    /// `on_ready` receives the bound port, or the rejection when the listener
    /// could not be created or was removed before it became ready. Requests
    /// for a hostname that is already cached (pending or ready) only register
    /// `on_ready` and start no new work.
    ///
    /// `timeout_override` is the listener's protocol timeout in milliseconds
    /// (TLS handshake and request headers); `Some(0)` disables it. It is not
    /// applied when the hostname is already cached.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn get<F>(&self, hostname: &str, handlers: Handlers, on_ready: F, timeout_override: Option<u64>)
    where
        F: FnOnce(PortResult) + Send + 'static,
    {
        let on_ready: ReadyCallback = Box::new(on_ready);

        let (entry, at_capacity) = {
            let mut entries = self.inner.lock_entries();
            if let Some(cached) = entries.get(hostname) {
                debug!(hostname, "listener cache hit");
                let settled = cached.observe(on_ready);
                drop(entries);
                if let Some((on_ready, outcome)) = settled {
                    on_ready(outcome);
                }
                return;
            }

            let entry = Arc::new(ListenerEntry::pending(hostname, on_ready));
            entries.insert(hostname.to_string(), Arc::clone(&entry));
            (entry, entries.len() >= self.inner.max_listeners)
        };
        debug!(hostname, "listener cache miss");

        if at_capacity {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.sweep().await;
            });
        }

        let protocol_timeout = timeout_override
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        tokio::spawn(Arc::clone(&self.inner).create(entry, handlers, protocol_timeout));
    }

    /// [`ListenerPool::get`] as a future resolving to the port.
    pub async fn get_port(
        &self,
        hostname: &str,
        handlers: Handlers,
        timeout_override: Option<u64>,
    ) -> Result<u16> {
        let (tx, rx) = oneshot::channel();
        self.get(
            hostname,
            handlers,
            move |outcome| {
                let _ = tx.send(outcome);
            },
            timeout_override,
        );

        let outcome = rx.await.map_err(|_| Rejection::ListenerFault {
            hostname: hostname.to_string(),
            reason: "listener dropped before it became ready".to_string(),
        })?;
        Ok(outcome?)
    }

    /// Run the capacity sweep now. Returns how many listeners it evicted.
    ///
    /// Does nothing below capacity. At or above it, every ready listener
    /// without an outstanding query is asked for its live connection count and
    /// evicted when that count is zero.
    pub async fn sweep(&self) -> usize {
        self.inner.sweep().await
    }

    /// Remove `hostname` and close its listener. Returns whether it was cached.
    pub fn remove(&self, hostname: &str) -> bool {
        let Some(entry) = self.inner.lock_entries().remove(hostname) else {
            return false;
        };
        entry.shut_down(
            RemovalCause::Explicit,
            Rejection::Evicted {
                hostname: hostname.to_string(),
                cause: RemovalCause::Explicit,
            },
        );
        true
    }

    /// Remove every entry and close every listener.
    pub fn clear(&self) {
        let drained: Vec<_> = self.inner.lock_entries().drain().map(|(_, entry)| entry).collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "clearing listener pool");
        }
        for entry in drained {
            let rejection = Rejection::Evicted {
                hostname: entry.hostname.clone(),
                cause: RemovalCause::Cleared,
            };
            entry.shut_down(RemovalCause::Cleared, rejection);
        }
    }

    /// Whether `hostname` has an entry, pending or ready.
    pub fn exists(&self, hostname: &str) -> bool {
        self.inner.lock_entries().contains_key(hostname)
    }

    pub fn len(&self) -> usize {
        self.inner.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Port of the ready listener for `hostname`.
    pub fn port(&self, hostname: &str) -> Option<u16> {
        self.inner.entry(hostname)?.port()
    }

    /// Live connections on the ready listener for `hostname`.
    pub async fn connection_count(&self, hostname: &str) -> Option<usize> {
        let listener = self.inner.entry(hostname)?.listener()?;
        listener.connection_count().await.ok()
    }

    /// Root certificate and key, for installing trust or persisting them.
    pub fn authority(&self) -> &RootAuthority {
        &self.inner.authority
    }
}

impl fmt::Debug for ListenerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerPool")
            .field("listeners", &self.len())
            .field("max_listeners", &self.inner.max_listeners)
            .field("idle_timeout", &self.inner.idle_timeout)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
