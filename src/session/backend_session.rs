//! One pooled backend session.
//!
//! Wraps a live transport with identity, lifecycle state, and the running
//! command count the pool's retirement budget is enforced against.

use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tracing::debug;
use uuid::Uuid;

use crate::errors::TransportError;
use crate::session::transport::BackendTransport;
use crate::transaction::{Command, TransactionComposer};

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// In the idle set, ready for checkout.
    Idle,
    /// Held by a lease.
    CheckedOut,
    /// Unusable. Returned dead sessions are destroyed, never requeued.
    Dead,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::CheckedOut => "checked-out",
            SessionState::Dead => "dead",
        };
        write!(f, "{}", label)
    }
}

/// Result of executing one command on a session.
#[derive(Debug)]
pub struct CommandOutcome {
    /// Error-channel content the backend attached to the response, if any.
    pub error_document: Option<Vec<u8>>,
    /// Bytes relayed to the caller's sink before any error flag.
    pub bytes_relayed: u64,
    /// The peer ended the conversation with this response.
    pub peer_closed: bool,
}

impl CommandOutcome {
    /// No error channel content arrived.
    pub fn is_clean(&self) -> bool {
        self.error_document.is_none()
    }
}

/// A live conversation with the backend, plus its bookkeeping.
pub struct BackendSession {
    id: Uuid,
    created_at: DateTime<Utc>,
    state: SessionState,
    commands_executed: u64,
    transport: Box<dyn BackendTransport>,
}

impl BackendSession {
    /// Sessions are born checked out: the pool creates them on demand while
    /// servicing a checkout.
    pub(crate) fn new(transport: Box<dyn BackendTransport>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            state: SessionState::CheckedOut,
            commands_executed: 0,
            transport,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub(crate) fn mark_dead(&mut self) {
        self.state = SessionState::Dead;
    }

    pub fn commands_executed(&self) -> u64 {
        self.commands_executed
    }

    /// True until the first command runs. Fresh sessions skip the
    /// pre-transaction reset.
    pub fn is_fresh(&self) -> bool {
        self.commands_executed == 0
    }

    /// Sends one command and relays its response into `sink`.
    ///
    /// A transport error here leaves the session in an unknown protocol
    /// state; callers destroy it. Error-channel content is captured into the
    /// outcome and is not a transport error.
    pub async fn execute(
        &mut self,
        command: &Command,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<CommandOutcome, TransportError> {
        if self.state == SessionState::Dead {
            return Err(TransportError::SessionClosed);
        }
        debug!(session = %self.id, command = %command, "executing backend command");
        self.transport
            .send_message(command.wire_line().as_bytes())
            .await?;
        let mut error_capture = Vec::new();
        let status = self.transport.read_message(sink, &mut error_capture).await?;
        self.commands_executed += 1;
        if status.peer_closed {
            debug!(session = %self.id, "backend closed during command");
            self.state = SessionState::Dead;
        }
        Ok(CommandOutcome {
            error_document: status.error_flagged.then_some(error_capture),
            bytes_relayed: status.bytes_to_sink,
            peer_closed: status.peer_closed,
        })
    }

    /// Executes a command whose response body is irrelevant.
    pub async fn execute_discarding(
        &mut self,
        command: &Command,
    ) -> Result<CommandOutcome, TransportError> {
        let mut devnull = tokio::io::sink();
        self.execute(command, &mut devnull).await
    }

    /// Scrubs all per-session backend state.
    ///
    /// Only transport failures matter here; a complaint in the response body
    /// of a delete is discarded along with the body.
    pub async fn reset(&mut self) -> Result<(), TransportError> {
        for command in TransactionComposer::reset_sequence() {
            self.execute_discarding(&command).await?;
        }
        Ok(())
    }

    /// Closes the underlying transport and marks the session dead.
    pub async fn close(&mut self, inform_peer: bool) {
        self.transport.close(inform_peer).await;
        self.state = SessionState::Dead;
    }
}

impl std::fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("commands_executed", &self.commands_executed)
            .finish()
    }
}
