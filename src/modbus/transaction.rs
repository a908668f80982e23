use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

use super::connection::Connection;
use super::protocol::{decode_response, ParsedResponse, Request};
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Sending,
    AwaitingResponse,
    Resolved,
    TimedOut,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Idle => "idle",
            TransactionState::Sending => "sending",
            TransactionState::AwaitingResponse => "awaiting response",
            TransactionState::Resolved => "resolved",
            TransactionState::TimedOut => "timed out",
        };
        f.write_str(name)
    }
}

/// One request/response exchange.
#[derive(Debug)]
struct Transaction {
    id: u64,
    request: Request,
    deadline: Instant,
    state: TransactionState,
}

impl Transaction {
    fn new(id: u64, request: Request, timeout: Duration) -> Self {
        Self {
            id,
            request,
            deadline: Instant::now() + timeout,
            state: TransactionState::Idle,
        }
    }

    fn advance(&mut self, next: TransactionState) {
        debug!("Transaction #{}: {} -> {}", self.id, self.state, next);
        self.state = next;
    }
}

/// Clears the busy flag however `send` exits, including when its future
/// is dropped.
struct BusyGuard<'a> {
    busy: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn acquire(busy: &'a AtomicBool) -> Result<Self, ModbusError> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ModbusError::TransactionInProgress)?;
        Ok(Self { busy })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Runs transactions over one connection, at most one at a time.
pub struct TransactionManager {
    connection: Arc<Connection>,
    busy: AtomicBool,
    next_id: AtomicU64,
}

impl TransactionManager {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            busy: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Sends `request` and waits for its response, a timeout, or a failure.
    ///
    /// The listener is registered, bytes left over from earlier traffic are
    /// discarded and the deadline fixed before the frame is written. Whichever of frame arrival and deadline comes first resolves
    /// the transaction; the subscription is dropped on every exit path, so
    /// the timer and the listener are cleared together. Nothing is retried.
    pub async fn send(&self, request: &Request, timeout: Duration) -> Result<ParsedResponse, ModbusError> {
        let frames = self.connection.frames()?;
        let _busy = BusyGuard::acquire(&self.busy)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut transaction = Transaction::new(id, request.clone(), timeout);
        let mut subscription = frames.subscribe(id)?;

        // Bytes already on the line predate this request
        let stale = frames.drain();
        if stale > 0 {
            warn!("⚠️ Transaction #{} discarded {} stale bytes before sending", id, stale);
        }

        transaction.advance(TransactionState::Sending);
        let frame = transaction.request.encode();
        debug!("📤 Transaction #{} sending: {}", id, hex::encode(&frame));

        let written = timeout_at(transaction.deadline, self.connection.write(&frame)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                drop(subscription);
                transaction.advance(TransactionState::Resolved);
                warn!("❌ Transaction #{} write failed: {}", id, e);
                return Err(match e {
                    ModbusError::NotConnected => ModbusError::NotConnected,
                    ModbusError::WriteFailed(msg) => ModbusError::WriteFailed(msg),
                    other => ModbusError::WriteFailed(other.to_string()),
                });
            }
            Err(_) => {
                drop(subscription);
                return Err(self.expire(&mut transaction, timeout).await);
            }
        }

        transaction.advance(TransactionState::AwaitingResponse);
        let outcome = timeout_at(transaction.deadline, subscription.recv()).await;
        drop(subscription);

        match outcome {
            Ok(Ok(chunk)) => {
                transaction.advance(TransactionState::Resolved);
                let request = &transaction.request;
                let result = decode_response(
                    &chunk.bytes,
                    request.slave_id(),
                    request.function(),
                    request.expected_registers(),
                );
                if let Err(e) = &result {
                    warn!("⚠️ Transaction #{} rejected response {}: {}", id, hex::encode(&chunk.bytes), e);
                }
                result
            }
            Ok(Err(e)) => {
                transaction.advance(TransactionState::Resolved);
                info!("Transaction #{} cancelled: connection closed", id);
                Err(e)
            }
            Err(_) => Err(self.expire(&mut transaction, timeout).await),
        }
    }

    /// Deadline path: the listener is already gone. Clears partial input so
    /// a late reply cannot bleed into the next transaction.
    async fn expire(&self, transaction: &mut Transaction, timeout: Duration) -> ModbusError {
        transaction.advance(TransactionState::TimedOut);

        if let Ok(frames) = self.connection.frames() {
            let discarded = frames.drain();
            if discarded > 0 {
                debug!("Dropped {} partial bytes after timeout", discarded);
            }
        }
        if let Err(e) = self.connection.flush_input().await {
            debug!("Input flush after timeout skipped: {}", e);
        }

        warn!(
            "⏰ Transaction #{} to slave {} timed out after {} ms",
            transaction.id,
            transaction.request.slave_id(),
            timeout.as_millis()
        );
        ModbusError::Timeout(timeout.as_millis() as u64)
    }
}
