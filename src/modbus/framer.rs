//! Inter-byte timeout framing.
//!
//! RTU frames carry no length header, so a frame ends when the line has been
//! quiet for a configured interval. Anything separated by that much silence
//! becomes a candidate frame; validity is left to the codec.

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};

use crate::transport::ByteStream;
use crate::utils::error::ModbusError;

/// Largest RTU ADU; a longer run is cut into candidates of this size.
pub const MAX_FRAME_LEN: usize = 256;

pub const DEFAULT_QUIET_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub bytes: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl RawChunk {
    fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            received_at: Utc::now(),
        }
    }
}

/// Accumulates bytes and cuts them into candidate frames on silence.
#[derive(Debug)]
pub struct StreamFramer {
    buffer: BytesMut,
    quiet_interval: Duration,
    last_byte_at: Option<Instant>,
}

impl StreamFramer {
    pub fn new(quiet_interval: Duration) -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_LEN),
            quiet_interval,
            last_byte_at: None,
        }
    }

    pub fn quiet_interval(&self) -> Duration {
        self.quiet_interval
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Buffers `bytes`. Returns candidates cut early because the buffer hit
    /// `MAX_FRAME_LEN`; normally empty.
    pub fn push(&mut self, bytes: &[u8], now: Instant) -> Vec<RawChunk> {
        if bytes.is_empty() {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);
        self.last_byte_at = Some(now);

        let mut overflow = Vec::new();
        while self.buffer.len() >= MAX_FRAME_LEN {
            let chunk = self.buffer.split_to(MAX_FRAME_LEN);
            overflow.push(RawChunk::new(chunk.to_vec()));
        }
        if self.buffer.is_empty() {
            self.last_byte_at = None;
        }
        overflow
    }

    /// When the buffered bytes become a frame if nothing else arrives.
    pub fn deadline(&self) -> Option<Instant> {
        self.last_byte_at.map(|at| at + self.quiet_interval)
    }

    /// Emits the buffer once the quiet interval has elapsed.
    pub fn poll_quiet(&mut self, now: Instant) -> Option<RawChunk> {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.last_byte_at = None;
                let bytes = self.buffer.split().to_vec();
                Some(RawChunk::new(bytes))
            }
            _ => None,
        }
    }

    /// Drops a partially received frame. Returns the number of bytes lost.
    pub fn reset(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        self.last_byte_at = None;
        discarded
    }
}

#[derive(Debug)]
struct Listener {
    id: u64,
    tx: oneshot::Sender<RawChunk>,
}

#[derive(Debug)]
struct Shared {
    framer: StreamFramer,
    listener: Option<Listener>,
    closed: bool,
}

/// Framer shared between the driver task and the transaction manager.
///
/// Holds at most one one-shot listener. A candidate frame goes to that
/// listener and clears it; with no listener the frame is dropped so it can
/// never be picked up by a later transaction.
#[derive(Debug, Clone)]
pub struct FrameHandle {
    shared: Arc<Mutex<Shared>>,
}

impl FrameHandle {
    pub fn new(quiet_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                framer: StreamFramer::new(quiet_interval),
                listener: None,
                closed: false,
            })),
        }
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the listener for the next candidate frame.
    pub fn subscribe(&self, id: u64) -> Result<FrameSubscription, ModbusError> {
        let mut shared = self.shared();
        if shared.closed {
            return Err(ModbusError::NotConnected);
        }
        if shared.listener.is_some() {
            return Err(ModbusError::TransactionInProgress);
        }
        let (tx, rx) = oneshot::channel();
        shared.listener = Some(Listener { id, tx });
        Ok(FrameSubscription {
            handle: self.clone(),
            id,
            rx,
        })
    }

    /// Removes listener `id` if it is still registered. Idempotent.
    fn unsubscribe(&self, id: u64) {
        let mut shared = self.shared();
        if shared.listener.as_ref().map(|l| l.id) == Some(id) {
            shared.listener = None;
        }
    }

    pub fn has_listener(&self) -> bool {
        self.shared().listener.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.shared().framer.deadline()
    }

    /// Discards any partially received frame.
    pub fn drain(&self) -> usize {
        self.shared().framer.reset()
    }

    /// Stops delivery. A pending subscription observes `NotConnected`.
    pub fn shutdown(&self) {
        let mut shared = self.shared();
        shared.closed = true;
        shared.listener = None;
        shared.framer.reset();
    }

    pub fn push(&self, bytes: &[u8], now: Instant) {
        let overflow = self.shared().framer.push(bytes, now);
        for chunk in overflow {
            warn!("⚠️ {} bytes without a silence gap, cutting candidate frame", chunk.bytes.len());
            self.dispatch(chunk);
        }
    }

    pub fn flush_quiet(&self, now: Instant) {
        let chunk = self.shared().framer.poll_quiet(now);
        if let Some(chunk) = chunk {
            self.dispatch(chunk);
        }
    }

    fn dispatch(&self, chunk: RawChunk) {
        let listener = self.shared().listener.take();
        match listener {
            Some(listener) => {
                debug!("📥 Frame for transaction #{}: {}", listener.id, hex::encode(&chunk.bytes));
                // The receiver is gone only if the transaction already resolved
                if listener.tx.send(chunk).is_err() {
                    debug!("Transaction #{} resolved before its frame arrived", listener.id);
                }
            }
            None => {
                warn!("⚠️ Discarding unsolicited frame: {}", hex::encode(&chunk.bytes));
            }
        }
    }
}

/// Listener registration for one transaction; deregisters on drop.
#[derive(Debug)]
pub struct FrameSubscription {
    handle: FrameHandle,
    id: u64,
    rx: oneshot::Receiver<RawChunk>,
}

impl FrameSubscription {
    pub async fn recv(&mut self) -> Result<RawChunk, ModbusError> {
        (&mut self.rx).await.map_err(|_| ModbusError::NotConnected)
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        self.handle.unsubscribe(self.id);
    }
}

/// Feeds the line into `handle` until the byte stream ends.
pub async fn drive(handle: FrameHandle, mut bytes: ByteStream) {
    loop {
        let deadline = handle.deadline();
        // A disabled select branch still evaluates its future
        let wake_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            data = bytes.recv() => match data {
                Some(data) => handle.push(&data, Instant::now()),
                None => {
                    debug!("Serial byte stream closed, framer stopping");
                    break;
                }
            },
            _ = sleep_until(wake_at), if deadline.is_some() => {
                handle.flush_quiet(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const QUIET: Duration = Duration::from_millis(50);

    #[test]
    fn test_emits_only_after_quiet_interval() {
        let start = Instant::now();
        let mut framer = StreamFramer::new(QUIET);

        assert!(framer.push(&[0x01, 0x03], start).is_empty());
        assert!(framer.poll_quiet(start + Duration::from_millis(49)).is_none());

        // A byte inside the window extends the frame
        framer.push(&[0x02], start + Duration::from_millis(40));
        assert!(framer.poll_quiet(start + Duration::from_millis(60)).is_none());

        let chunk = framer.poll_quiet(start + Duration::from_millis(90)).unwrap();
        assert_eq!(chunk.bytes, vec![0x01, 0x03, 0x02]);
        assert_eq!(framer.buffered(), 0);
        assert!(framer.deadline().is_none());
    }

    #[test]
    fn test_empty_buffer_never_emits() {
        let start = Instant::now();
        let mut framer = StreamFramer::new(QUIET);
        assert!(framer.poll_quiet(start + Duration::from_secs(10)).is_none());
        framer.push(&[], start);
        assert!(framer.deadline().is_none());
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let start = Instant::now();
        let mut framer = StreamFramer::new(QUIET);
        framer.push(&[0xAA, 0xBB, 0xCC], start);
        assert_eq!(framer.reset(), 3);
        assert!(framer.poll_quiet(start + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_overflow_cuts_at_max_frame_len() {
        let start = Instant::now();
        let mut framer = StreamFramer::new(QUIET);
        let overflow = framer.push(&vec![0x55; MAX_FRAME_LEN + 4], start);
        assert_eq!(overflow.len(), 1);
        assert_eq!(overflow[0].bytes.len(), MAX_FRAME_LEN);
        assert_eq!(framer.buffered(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_without_listener_is_dropped() {
        let handle = FrameHandle::new(QUIET);
        let now = Instant::now();
        handle.push(&[0x01, 0x02], now);
        handle.flush_quiet(now + QUIET);

        // A later subscriber must not see the stale frame
        let mut subscription = handle.subscribe(1).unwrap();
        let late = tokio::time::timeout(Duration::from_millis(200), subscription.recv()).await;
        assert!(late.is_err());
    }

    #[tokio::test]
    async fn test_single_listener_and_idempotent_drop() {
        let handle = FrameHandle::new(QUIET);
        let first = handle.subscribe(1).unwrap();
        assert!(matches!(handle.subscribe(2), Err(ModbusError::TransactionInProgress)));
        drop(first);
        assert!(!handle.has_listener());

        let second = handle.subscribe(2).unwrap();
        // Stale id does not remove the current listener
        handle.unsubscribe(1);
        assert!(handle.has_listener());
        drop(second);
        assert!(!handle.has_listener());
    }

    #[tokio::test]
    async fn test_shutdown_resolves_pending_subscription() {
        let handle = FrameHandle::new(QUIET);
        let mut subscription = handle.subscribe(7).unwrap();
        handle.shutdown();
        assert!(matches!(subscription.recv().await, Err(ModbusError::NotConnected)));
        assert!(matches!(handle.subscribe(8), Err(ModbusError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_joins_bytes_within_quiet_interval() {
        let handle = FrameHandle::new(QUIET);
        let (tx, rx) = mpsc::channel(8);
        let driver = tokio::spawn(drive(handle.clone(), rx));

        let mut subscription = handle.subscribe(1).unwrap();
        tx.send(vec![0x01, 0x03]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(vec![0x02, 0x00, 0x2A]).await.unwrap();

        let chunk = subscription.recv().await.unwrap();
        assert_eq!(chunk.bytes, vec![0x01, 0x03, 0x02, 0x00, 0x2A]);
        assert!(!handle.has_listener());

        drop(tx);
        driver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_splits_on_silence() {
        let handle = FrameHandle::new(QUIET);
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(drive(handle.clone(), rx));

        let mut first = handle.subscribe(1).unwrap();
        tx.send(vec![0xAA]).await.unwrap();
        assert_eq!(first.recv().await.unwrap().bytes, vec![0xAA]);
        drop(first);

        let mut second = handle.subscribe(2).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(vec![0xBB]).await.unwrap();
        assert_eq!(second.recv().await.unwrap().bytes, vec![0xBB]);
    }
}
