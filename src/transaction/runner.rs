//! Transaction execution over pooled sessions.
//!
//! The runner owns the full lifecycle of one transaction: checkout, the
//! hygiene reset on reused sessions, the command plan, response routing, and
//! the disposition of the session afterwards. Disposition is the part that
//! matters for correctness:
//!
//! * backend faults leave the wire in a known state, so the session is reset
//!   and returned healthy
//! * transport failures and stream timeouts leave it unknown, so the session
//!   is condemned and the pool destroys it on return
//!
//! Either way the lease goes back, so capacity can never leak.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{GatewayError, TransportError};
use crate::fault::scanner::ResponseExceptionScanner;
use crate::metrics::{metrics, Timer};
use crate::observability::CorrelationId;
use crate::pool::{SessionLease, SessionPool};
use crate::transaction::{Command, Product, Transaction, TransactionComposer};

/// What a completed transaction reports back.
#[derive(Debug, Clone)]
pub struct TransactionReceipt {
    pub correlation_id: CorrelationId,
    pub session_id: Uuid,
    pub product: Product,
    pub bytes_relayed: u64,
    pub elapsed_ms: u64,
    pub session_reused: bool,
}

pub struct TransactionRunner {
    pool: Arc<SessionPool>,
}

impl TransactionRunner {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Executes one transaction, relaying the product into `sink`.
    ///
    /// Streamed products reach the sink as they arrive from the backend.
    /// Everything else is captured, scanned for embedded fault markers, and
    /// only relayed once it comes back clean.
    pub async fn run<W>(
        &self,
        tx: &Transaction,
        sink: &mut W,
    ) -> Result<TransactionReceipt, GatewayError>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let correlation_id = CorrelationId::new();
        metrics().transactions_total.inc();
        let timer = Timer::new();

        let mut lease = match tx.deadline {
            Some(limit) => self.pool.checkout_within(Some(limit)).await,
            None => self.pool.checkout().await,
        }
        .inspect_err(|e| {
            metrics().transactions_failed.inc();
            warn!(correlation = %correlation_id, error = %e, "session checkout failed");
        })?;

        let session_id = lease.session_id();
        let session_reused = !lease.is_fresh();
        debug!(
            correlation = %correlation_id,
            session = %session_id,
            product = %tx.product,
            dataset = %tx.dataset_id,
            session_reused,
            "transaction started"
        );

        let outcome = self.drive(&mut lease, tx, sink, session_reused).await;

        match &outcome {
            // Success and semantic faults both leave a parseable wire; scrub
            // the session so the next tenant starts from nothing.
            Ok(_) | Err(GatewayError::Fault(_)) => {
                if matches!(&outcome, Err(GatewayError::Fault(_))) {
                    metrics().faults_total.inc();
                }
                if let Err(e) = lease.reset().await {
                    warn!(
                        correlation = %correlation_id,
                        session = %session_id,
                        error = %e,
                        "post-transaction reset failed; destroying session"
                    );
                    lease.mark_dead();
                } else {
                    metrics().resets_total.inc();
                }
            }
            Err(e) if e.destroys_session() => {
                debug!(
                    correlation = %correlation_id,
                    session = %session_id,
                    "condemning session after transport failure"
                );
                lease.mark_dead();
            }
            Err(_) => {}
        }
        lease.release().await;

        let elapsed_ms = (timer.elapsed_secs() * 1_000.0) as u64;
        match outcome {
            Ok(bytes_relayed) => {
                timer.observe_duration(&metrics().transaction_latency);
                metrics().response_bytes.observe(bytes_relayed as f64);
                info!(
                    correlation = %correlation_id,
                    session = %session_id,
                    product = %tx.product,
                    bytes = bytes_relayed,
                    elapsed_ms,
                    session_reused,
                    "transaction complete"
                );
                Ok(TransactionReceipt {
                    correlation_id,
                    session_id,
                    product: tx.product,
                    bytes_relayed,
                    elapsed_ms,
                    session_reused,
                })
            }
            Err(e) => {
                metrics().transactions_failed.inc();
                warn!(
                    correlation = %correlation_id,
                    session = %session_id,
                    error = %e,
                    elapsed_ms,
                    "transaction failed"
                );
                Err(e)
            }
        }
    }

    /// The command phase: hygiene reset, setup commands, final retrieval.
    /// Returns the bytes relayed to the caller's sink.
    async fn drive<W>(
        &self,
        lease: &mut SessionLease,
        tx: &Transaction,
        sink: &mut W,
        session_reused: bool,
    ) -> Result<u64, GatewayError>
    where
        W: AsyncWrite + Send + Unpin,
    {
        // A reused session may carry leftovers from a tenant that failed
        // between its command phase and its reset. Start from nothing.
        if session_reused {
            lease.reset().await?;
            metrics().resets_total.inc();
        }

        let plan = TransactionComposer::compose(tx);
        debug!(
            session = %lease.session_id(),
            plan = %TransactionComposer::describe(&plan),
            "command plan composed"
        );

        let setup = plan.len() - 1;
        for command in plan.iter().take(setup) {
            let outcome = lease.execute_discarding(command).await?;
            if let Some(doc) = outcome.error_document {
                return Err(ResponseExceptionScanner::scan_error_channel(&doc).into());
            }
        }
        self.retrieve(lease, tx, plan.last(), sink).await
    }

    /// Runs the final command of the plan and routes its response.
    async fn retrieve<W>(
        &self,
        lease: &mut SessionLease,
        tx: &Transaction,
        command: &Command,
        sink: &mut W,
    ) -> Result<u64, GatewayError>
    where
        W: AsyncWrite + Send + Unpin,
    {
        if tx.product.is_streamed() {
            let outcome = match tx.deadline {
                Some(limit) => tokio::time::timeout(limit, lease.execute(command, sink))
                    .await
                    .map_err(|_| GatewayError::StreamTimeout {
                        limit_ms: limit.as_millis() as u64,
                    })?,
                None => lease.execute(command, sink).await,
            }?;
            if let Some(doc) = outcome.error_document {
                return Err(ResponseExceptionScanner::scan_error_channel(&doc).into());
            }
            return Ok(outcome.bytes_relayed);
        }

        let cap = self.pool.options().max_document_bytes;
        let mut capture = CappedBuffer::new(cap);
        let executed = match tx.deadline {
            Some(limit) => tokio::time::timeout(limit, lease.execute(command, &mut capture))
                .await
                .map_err(|_| GatewayError::StreamTimeout {
                    limit_ms: limit.as_millis() as u64,
                })?,
            None => lease.execute(command, &mut capture).await,
        };
        let outcome = match executed {
            Ok(outcome) => outcome,
            Err(e) => {
                if capture.overflowed() {
                    return Err(TransportError::ResponseTooLarge {
                        size: capture.len(),
                        limit: cap,
                    }
                    .into());
                }
                return Err(e.into());
            }
        };
        if let Some(doc) = outcome.error_document {
            return Err(ResponseExceptionScanner::scan_error_channel(&doc).into());
        }

        if let Some(fault) = ResponseExceptionScanner::scan(capture.as_slice()).into_fault() {
            debug!(
                session = %lease.session_id(),
                kind = %fault.kind,
                "fault marker found in captured document"
            );
            return Err(fault.into());
        }

        sink.write_all(capture.as_slice())
            .await
            .map_err(|e| TransportError::io("relaying captured document", &e))?;
        sink.flush()
            .await
            .map_err(|e| TransportError::io("flushing captured document", &e))?;
        Ok(capture.len() as u64)
    }
}

/// In-memory capture sink with a hard size cap.
///
/// The cap turns a runaway document into an error before it exhausts memory;
/// streamed products never pass through here.
struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    overflowed: bool,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            overflowed: false,
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn overflowed(&self) -> bool {
        self.overflowed
    }
}

impl AsyncWrite for CappedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.data.len() + buf.len() > this.cap {
            this.overflowed = true;
            return Poll::Ready(Err(io::Error::other("document capture cap exceeded")));
        }
        this.data.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn capped_buffer_accepts_up_to_the_cap() {
        let mut buffer = CappedBuffer::new(8);
        buffer.write_all(b"12345678").await.unwrap();
        assert_eq!(buffer.as_slice(), b"12345678");
        assert!(!buffer.overflowed());
    }

    #[tokio::test]
    async fn capped_buffer_rejects_overflow() {
        let mut buffer = CappedBuffer::new(8);
        buffer.write_all(b"123456").await.unwrap();
        let err = buffer.write_all(b"789").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(buffer.overflowed());
        // bytes before the overflow are intact
        assert_eq!(buffer.as_slice(), b"123456");
    }
}
