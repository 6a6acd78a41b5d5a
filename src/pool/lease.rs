//! Session lease with automatic return.
//!
//! A checkout hands the caller a lease rather than the session itself. The
//! lease enforces the pool's accounting contract:
//!
//! 1. Owned data, no references back into the pool's collections
//! 2. Explicit return via [`SessionLease::release`], which consumes self
//! 3. Automatic return on drop, so a panicking transaction cannot strand a
//!    capacity permit
//! 4. Idempotent: the session is taken out at most once

use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWrite;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::TransportError;
use crate::metrics::metrics;
use crate::pool::session_pool::SessionPool;
use crate::session::{BackendSession, CommandOutcome};
use crate::transaction::Command;

pub struct SessionLease {
    session: Option<BackendSession>,
    pool: Arc<SessionPool>,
    session_id: Uuid,
    acquired_at: Instant,
}

impl SessionLease {
    pub(crate) fn new(session: BackendSession, pool: Arc<SessionPool>) -> Self {
        let session_id = session.id();
        Self {
            session: Some(session),
            pool,
            session_id,
            acquired_at: Instant::now(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// True while no command has ever run on this session.
    pub fn is_fresh(&self) -> bool {
        self.session.as_ref().is_some_and(BackendSession::is_fresh)
    }

    pub fn commands_executed(&self) -> u64 {
        self.session
            .as_ref()
            .map_or(0, BackendSession::commands_executed)
    }

    /// Sends one command, relaying the response into `sink`.
    pub async fn execute(
        &mut self,
        command: &Command,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<CommandOutcome, TransportError> {
        match self.session.as_mut() {
            Some(session) => session.execute(command, sink).await,
            None => Err(TransportError::SessionClosed),
        }
    }

    /// Sends one command and discards the response body.
    pub async fn execute_discarding(
        &mut self,
        command: &Command,
    ) -> Result<CommandOutcome, TransportError> {
        match self.session.as_mut() {
            Some(session) => session.execute_discarding(command).await,
            None => Err(TransportError::SessionClosed),
        }
    }

    /// Scrubs all per-session backend state.
    pub async fn reset(&mut self) -> Result<(), TransportError> {
        match self.session.as_mut() {
            Some(session) => session.reset().await,
            None => Err(TransportError::SessionClosed),
        }
    }

    /// Condemns the session: on release it will be destroyed, not requeued.
    pub fn mark_dead(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.mark_dead();
        }
    }

    /// Returns the session to the pool. The pool decides whether it is
    /// requeued, retired, or destroyed; the capacity permit comes back
    /// either way.
    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            debug!(
                session = %self.session_id,
                held_ms = self.acquired_at.elapsed().as_millis() as u64,
                "session lease released"
            );
            self.pool.finish_return(session).await;
        }
    }
}

impl Drop for SessionLease {
    /// Safety net for leases that fall out of scope without an explicit
    /// release. Drop cannot run the graceful close, so the session is
    /// discarded and only the accounting is repaired.
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!(
                session = %self.session_id,
                held_ms = self.acquired_at.elapsed().as_millis() as u64,
                "session lease dropped without release; discarding session"
            );
            metrics().leases_dropped_auto.inc();
            self.pool.release_dropped(session);
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session_id", &self.session_id)
            .field("held", &self.acquired_at.elapsed())
            .field("released", &self.session.is_none())
            .finish()
    }
}
