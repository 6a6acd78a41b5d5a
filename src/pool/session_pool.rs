//! Bounded pool of backend sessions.
//!
//! Capacity is enforced with a semaphore that starts at zero permits; the
//! one-shot [`SessionPool::configure`] call adds the real capacity, so every
//! checkout before configuration parks until it fails fast. Sessions are
//! created lazily while servicing checkouts, kept in an idle queue between
//! leases, retired once they exceed the per-session command budget, and
//! destroyed the moment anything about their wire state becomes uncertain.
//!
//! Accounting invariant: permits in flight plus available always equals the
//! configured capacity. Checkout forgets its permit, every return path adds
//! exactly one back, and a session construction failure releases the permit
//! by dropping it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::GatewayError;
use crate::metrics::{metrics, Timer};
use crate::pool::lease::SessionLease;
use crate::session::{BackendSession, SessionConnector, SessionState, TcpConnector};

/// Tunables the pool carries from construction, before it knows its backend.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Bound on establishing one TCP session, handshake included.
    pub connect_timeout: Duration,
    /// Default bound on waiting for a free session. `None` waits forever.
    pub checkout_timeout: Option<Duration>,
    /// Commands a session may execute before it is retired on return.
    /// Zero disables retirement.
    pub max_commands_per_session: u64,
    /// Cap on any single inbound chunk and on captured documents.
    pub max_document_bytes: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            checkout_timeout: None,
            max_commands_per_session: 2_000,
            max_document_bytes: 16 * 1024 * 1024,
        }
    }
}

impl PoolOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.backend.connect_timeout(),
            checkout_timeout: config.pool.checkout_timeout(),
            max_commands_per_session: config.pool.max_commands_per_session,
            max_document_bytes: config.pool.max_document_bytes,
        }
    }
}

/// Everything that only exists once the pool has been pointed at a backend.
struct PoolRuntime {
    endpoint: String,
    capacity: usize,
    connector: Box<dyn SessionConnector>,
}

/// Point-in-time view of one live session, for stats dumps.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub commands_executed: u64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub configured: bool,
    pub endpoint: Option<String>,
    pub capacity: usize,
    pub available_permits: usize,
    pub checked_out: usize,
    pub idle: usize,
    pub created_total: u64,
    pub destroyed_total: u64,
    pub retired_total: u64,
    pub shutting_down: bool,
}

struct LiveEntry {
    state: SessionState,
    created_at: DateTime<Utc>,
    commands_executed: u64,
}

pub struct SessionPool {
    options: PoolOptions,
    runtime: OnceCell<PoolRuntime>,
    admission: Semaphore,
    idle: Mutex<VecDeque<BackendSession>>,
    live: DashMap<Uuid, LiveEntry>,
    checked_out: AtomicUsize,
    created_total: AtomicU64,
    destroyed_total: AtomicU64,
    retired_total: AtomicU64,
    shutting_down: AtomicBool,
}

impl SessionPool {
    /// An unconfigured pool. Checkouts fail with `NotConfigured` until
    /// [`SessionPool::configure`] succeeds.
    pub fn new(options: PoolOptions) -> Self {
        Self {
            options,
            runtime: OnceCell::new(),
            admission: Semaphore::new(0),
            idle: Mutex::new(VecDeque::new()),
            live: DashMap::new(),
            checked_out: AtomicUsize::new(0),
            created_total: AtomicU64::new(0),
            destroyed_total: AtomicU64::new(0),
            retired_total: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(PoolOptions::from_config(config))
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Points the pool at its backend. First caller wins and gets `true`;
    /// every later call, racing or not, leaves the pool untouched and gets
    /// `false`.
    pub fn configure(&self, host: &str, port: u16, capacity: usize) -> bool {
        let connector = TcpConnector::new(
            host,
            port,
            self.options.connect_timeout,
            self.options.max_document_bytes,
        );
        self.configure_with_connector(Box::new(connector), capacity)
    }

    /// Same one-shot contract with a caller-supplied connector. This is the
    /// seam alternate transports and the test harness plug into.
    pub fn configure_with_connector(
        &self,
        connector: Box<dyn SessionConnector>,
        capacity: usize,
    ) -> bool {
        let capacity = if capacity == 0 {
            warn!("pool capacity 0 requested; clamping to 1");
            1
        } else {
            capacity
        };
        let endpoint = connector.endpoint();
        let runtime = PoolRuntime {
            endpoint: endpoint.clone(),
            capacity,
            connector,
        };
        match self.runtime.set(runtime) {
            Ok(()) => {
                self.admission.add_permits(capacity);
                metrics().pool_capacity.set(capacity as i64);
                info!(endpoint = %endpoint, capacity, "session pool configured");
                true
            }
            Err(_) => {
                warn!("session pool already configured; ignoring");
                false
            }
        }
    }

    pub fn is_configured(&self) -> bool {
        self.runtime.get().is_some()
    }

    /// Checks a session out, waiting up to the pool's default checkout
    /// timeout for capacity.
    pub async fn checkout(self: &Arc<Self>) -> Result<SessionLease, GatewayError> {
        self.checkout_within(self.options.checkout_timeout).await
    }

    /// Checks a session out with an explicit bound on the capacity wait.
    /// `None` waits without bound.
    pub async fn checkout_within(
        self: &Arc<Self>,
        limit: Option<Duration>,
    ) -> Result<SessionLease, GatewayError> {
        let runtime = self.runtime.get().ok_or(GatewayError::NotConfigured)?;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }

        let wait = Timer::new();
        let permit = match limit {
            Some(bound) => {
                match tokio::time::timeout(bound, self.admission.acquire()).await {
                    Err(_) => {
                        metrics().checkout_timeouts_total.inc();
                        return Err(GatewayError::CheckoutTimeout {
                            waited_ms: bound.as_millis() as u64,
                            capacity: runtime.capacity,
                        });
                    }
                    Ok(Err(_)) => return Err(GatewayError::ShuttingDown),
                    Ok(Ok(permit)) => permit,
                }
            }
            None => self
                .admission
                .acquire()
                .await
                .map_err(|_| GatewayError::ShuttingDown)?,
        };
        wait.observe_duration(&metrics().checkout_wait);

        // A permit won during the shutdown race goes straight back so the
        // drain barrier can collect it.
        if self.shutting_down.load(Ordering::SeqCst) {
            drop(permit);
            return Err(GatewayError::ShuttingDown);
        }

        let reused = { self.idle.lock().pop_front() };
        let mut session = match reused {
            Some(session) => {
                debug!(session = %session.id(), "reusing idle session");
                session
            }
            None => match runtime.connector.connect().await {
                Ok(transport) => {
                    let session = BackendSession::new(transport);
                    self.created_total.fetch_add(1, Ordering::Relaxed);
                    metrics().sessions_created_total.inc();
                    info!(
                        session = %session.id(),
                        endpoint = %runtime.endpoint,
                        "backend session established"
                    );
                    session
                }
                // The permit guard is still held here; dropping it on the
                // error path releases the capacity slot.
                Err(e) => {
                    warn!(endpoint = %runtime.endpoint, error = %e, "session construction failed");
                    return Err(e.into());
                }
            },
        };

        session.set_state(SessionState::CheckedOut);
        self.live.insert(
            session.id(),
            LiveEntry {
                state: SessionState::CheckedOut,
                created_at: session.created_at(),
                commands_executed: session.commands_executed(),
            },
        );
        self.checked_out.fetch_add(1, Ordering::SeqCst);
        metrics().checkouts_total.inc();
        self.sync_gauges();

        permit.forget();
        Ok(SessionLease::new(session, Arc::clone(self)))
    }

    /// Return path for explicitly released leases. Decides requeue, retire,
    /// or destroy, then releases the capacity permit.
    pub(crate) async fn finish_return(&self, mut session: BackendSession) {
        let budget = self.options.max_commands_per_session;
        let over_budget = budget > 0 && session.commands_executed() >= budget;
        let draining = self.shutting_down.load(Ordering::SeqCst);

        if session.state() == SessionState::Dead {
            debug!(session = %session.id(), "destroying dead session");
            session.close(false).await;
            self.forget_session(session.id());
        } else if over_budget {
            info!(
                session = %session.id(),
                commands = session.commands_executed(),
                budget,
                "retiring session past its command budget"
            );
            self.retired_total.fetch_add(1, Ordering::Relaxed);
            metrics().sessions_retired_total.inc();
            session.close(true).await;
            self.forget_session(session.id());
        } else if draining {
            debug!(session = %session.id(), "pool draining; closing returned session");
            session.close(true).await;
            self.forget_session(session.id());
        } else {
            session.set_state(SessionState::Idle);
            if let Some(mut entry) = self.live.get_mut(&session.id()) {
                entry.state = SessionState::Idle;
                entry.commands_executed = session.commands_executed();
            }
            self.idle.lock().push_back(session);
        }

        self.checked_out.fetch_sub(1, Ordering::SeqCst);
        self.admission.add_permits(1);
        self.sync_gauges();
    }

    /// Return path for leases reclaimed by `Drop`. Synchronous, so the
    /// session is discarded; a graceful close is attempted only when a
    /// runtime is available to carry it.
    pub(crate) fn release_dropped(&self, session: BackendSession) {
        self.forget_session(session.id());
        self.checked_out.fetch_sub(1, Ordering::SeqCst);
        self.admission.add_permits(1);
        self.sync_gauges();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut session = session;
                session.close(false).await;
            });
        }
    }

    fn forget_session(&self, id: Uuid) {
        self.live.remove(&id);
        self.destroyed_total.fetch_add(1, Ordering::Relaxed);
        metrics().sessions_destroyed_total.inc();
    }

    /// Drains the pool: waits for every lease to come home, closes all idle
    /// sessions, and fails late checkouts fast. Idempotent; only the first
    /// call performs the drain.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            warn!("pool shutdown already requested");
            return;
        }
        let Some(runtime) = self.runtime.get() else {
            info!("pool shut down before it was configured");
            self.admission.close();
            return;
        };

        info!(endpoint = %runtime.endpoint, "draining session pool");
        if let Ok(all) = self.admission.acquire_many(runtime.capacity as u32).await {
            all.forget();
        }
        self.admission.close();

        let idle: Vec<BackendSession> = { self.idle.lock().drain(..).collect() };
        let closing = idle.into_iter().map(|mut session| async move {
            session.close(true).await;
            session.id()
        });
        let closed = futures::future::join_all(closing).await;
        for id in &closed {
            self.forget_session(*id);
        }
        self.sync_gauges();
        info!(sessions_closed = closed.len(), "session pool shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let runtime = self.runtime.get();
        PoolStats {
            configured: runtime.is_some(),
            endpoint: runtime.map(|r| r.endpoint.clone()),
            capacity: runtime.map_or(0, |r| r.capacity),
            available_permits: self.admission.available_permits(),
            checked_out: self.checked_out.load(Ordering::SeqCst),
            idle: self.idle.lock().len(),
            created_total: self.created_total.load(Ordering::Relaxed),
            destroyed_total: self.destroyed_total.load(Ordering::Relaxed),
            retired_total: self.retired_total.load(Ordering::Relaxed),
            shutting_down: self.shutting_down.load(Ordering::SeqCst),
        }
    }

    /// Live session registry, for operator dumps.
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.live
            .iter()
            .map(|entry| SessionSnapshot {
                id: *entry.key(),
                state: entry.value().state.to_string(),
                created_at: entry.value().created_at,
                commands_executed: entry.value().commands_executed,
            })
            .collect()
    }

    fn sync_gauges(&self) {
        metrics()
            .sessions_checked_out
            .set(self.checked_out.load(Ordering::SeqCst) as i64);
        metrics().sessions_idle.set(self.idle.lock().len() as i64);
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("SessionPool")
            .field("endpoint", &stats.endpoint)
            .field("capacity", &stats.capacity)
            .field("checked_out", &stats.checked_out)
            .field("idle", &stats.idle)
            .field("shutting_down", &stats.shutting_down)
            .finish()
    }
}
