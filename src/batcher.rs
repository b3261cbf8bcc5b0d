//! Call queue, flow-control window and the batching send path.
//!
//! Queued calls accumulate in FIFO order until the send path drains
//! them. One drain produces at most one frame: up to `budget` calls are
//! wrapped into a single multicall envelope and written with a vectored
//! fast path.
//!
//! ```text
//! queue_with() ─▶ CallQueue ─▶ drain_and_send ─▶ socket
//!                                  │
//!                            Window (debit n)
//!                                  ▲
//!                 demux credits on response / fault / send failure
//! ```
//!
//! The window is a signed budget of calls the server may still owe us
//! answers for. Every sent call debits it; every answered (or failed to
//! send) call credits it back exactly once. A negative value only means
//! callers raced past zero; sending stops until credits return.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{error, trace};

use crate::codec::encode_multicall_into;
use crate::connection::Core;
use crate::error::{Result, RpcError};
use crate::packet::Continuation;
use crate::protocol::encode_frame_header;

/// One serialized call waiting to be batched.
pub(crate) struct QueuedCall {
    pub(crate) body: String,
    pub(crate) continuation: Option<Continuation>,
}

/// FIFO queue of calls not yet sent.
#[derive(Default)]
pub(crate) struct CallQueue {
    inner: Mutex<VecDeque<QueuedCall>>,
}

impl CallQueue {
    pub(crate) fn push(&self, call: QueuedCall) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(call);
    }

    /// Remove up to `max` calls from the front, preserving order.
    pub(crate) fn drain_up_to(&self, max: usize) -> Vec<QueuedCall> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let n = inner.len().min(max);
        inner.drain(..n).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Signed flow-control budget shared by the send and receive paths.
pub(crate) struct Window {
    budget: AtomicI64,
    initial: i64,
}

impl Window {
    pub(crate) fn new(initial: usize) -> Self {
        Self {
            budget: AtomicI64::new(initial as i64),
            initial: initial as i64,
        }
    }

    pub(crate) fn take(&self, n: usize) {
        self.budget.fetch_sub(n as i64, Ordering::Relaxed);
    }

    pub(crate) fn restore(&self, n: usize) {
        self.budget.fetch_add(n as i64, Ordering::Relaxed);
    }

    pub(crate) fn available(&self) -> i64 {
        self.budget.load(Ordering::Relaxed)
    }

    /// Reset to the initial budget. Used after a stream reset, when all
    /// in-flight batches have been invalidated.
    pub(crate) fn reset(&self) {
        self.budget.store(self.initial, Ordering::Relaxed);
    }

    /// How long the send loop should sleep before looking at the queue
    /// again. Plenty of budget means tight polling; an exhausted window
    /// means the server is behind and polling hard would not help.
    pub(crate) fn poll_delay(&self) -> Duration {
        let available = self.available();
        if available <= 0 {
            Duration::from_millis(25)
        } else if available <= 100 {
            Duration::from_millis(5)
        } else {
            Duration::from_millis(2)
        }
    }
}

/// Write one frame: vectored fast path, byte-accurate slow path.
pub(crate) async fn write_frame<W>(io: &mut W, handle: u32, body: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let header = encode_frame_header(body.len() as u32, handle);
    let total = header.len() + body.len();

    let mut written = io
        .write_vectored(&[IoSlice::new(&header), IoSlice::new(body.as_bytes())])
        .await?;
    while written < total {
        if written < header.len() {
            io.write_all(&header[written..]).await?;
            written = header.len();
        } else {
            io.write_all(&body.as_bytes()[written - header.len()..]).await?;
            written = total;
        }
    }
    io.flush().await
}

/// Drain up to one window's worth of queued calls into a single frame.
///
/// Returns the number of calls sent (0 when the queue is empty or the
/// window is exhausted). On any send failure the batch is deregistered
/// and its window debit restored before the error propagates.
pub(crate) async fn drain_and_send(core: &Core) -> Result<usize> {
    let mut writer = core.writer.lock().await;
    let io = writer.as_mut().ok_or(RpcError::NotConnected)?;

    let available = core.window.available();
    if available <= 0 {
        return Ok(0);
    }
    let budget = (available as usize).min(core.config.max_calls_per_batch);

    let calls = core.queue.drain_up_to(budget);
    if calls.is_empty() {
        return Ok(0);
    }
    let count = calls.len();
    core.window.take(count);

    let mut bodies = Vec::with_capacity(count);
    let mut continuations = Vec::with_capacity(count);
    for call in calls {
        bodies.push(call.body);
        continuations.push(call.continuation);
    }

    let mut envelope = core.pool.checkout();
    encode_multicall_into(&mut envelope, &bodies);
    let handle = core.pending.register(continuations);

    let outcome = write_frame(io, handle, &envelope).await;

    core.pool.recycle(envelope);
    for body in bodies {
        core.pool.recycle(body);
    }

    match outcome {
        Ok(()) => {
            trace!(handle, calls = count, "sent batch");
            Ok(count)
        }
        Err(err) => {
            // The batch never reached the wire; give the calls'
            // window budget back and forget the handle.
            core.pending.remove(handle);
            core.window.restore(count);
            error!(handle, calls = count, error = %err, "batch send failed");
            Err(err.into())
        }
    }
}

/// Background task driving [`drain_and_send`] until shutdown.
pub(crate) async fn run_send_loop(core: Arc<Core>) {
    loop {
        let delay = match drain_and_send(&core).await {
            Ok(_) => core.window.poll_delay(),
            Err(RpcError::NotConnected) => Duration::from_millis(25),
            Err(_) => {
                // Already logged; the receive loop decides whether the
                // stream can be reestablished.
                Duration::from_millis(25)
            }
        };

        tokio::select! {
            _ = core.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    trace!("send loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_frame_header;

    fn queued(body: &str) -> QueuedCall {
        QueuedCall {
            body: body.to_string(),
            continuation: None,
        }
    }

    #[test]
    fn test_queue_drains_in_fifo_order() {
        let queue = CallQueue::default();
        queue.push(queued("a"));
        queue.push(queued("b"));
        queue.push(queued("c"));
        assert_eq!(queue.len(), 3);

        let drained = queue.drain_up_to(2);
        let bodies: Vec<&str> = drained.iter().map(|c| c.body.as_str()).collect();
        assert_eq!(bodies, vec!["a", "b"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_more_than_queued() {
        let queue = CallQueue::default();
        queue.push(queued("only"));
        assert_eq!(queue.drain_up_to(10).len(), 1);
        assert!(queue.drain_up_to(10).is_empty());
    }

    #[test]
    fn test_window_debit_credit() {
        let window = Window::new(400);
        assert_eq!(window.available(), 400);

        window.take(400);
        assert_eq!(window.available(), 0);

        // Racing past zero is tolerated, not clamped.
        window.take(3);
        assert_eq!(window.available(), -3);

        window.restore(403);
        assert_eq!(window.available(), 400);
    }

    #[test]
    fn test_window_reset() {
        let window = Window::new(100);
        window.take(60);
        window.reset();
        assert_eq!(window.available(), 100);
    }

    #[test]
    fn test_poll_delay_tiers() {
        let window = Window::new(400);
        assert_eq!(window.poll_delay(), Duration::from_millis(2));

        window.take(300);
        assert_eq!(window.poll_delay(), Duration::from_millis(5));

        window.take(100);
        assert_eq!(window.poll_delay(), Duration::from_millis(25));

        window.take(10);
        assert_eq!(window.poll_delay(), Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_write_frame_layout() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, 0xDEAD_BEEF, "<methodCall/>")
            .await
            .unwrap();

        use tokio::io::AsyncReadExt;
        let mut header = [0u8; 8];
        server.read_exact(&mut header).await.unwrap();
        let (len, handle) = decode_frame_header(&header);
        assert_eq!(len, 13);
        assert_eq!(handle, 0xDEAD_BEEF);

        let mut body = vec![0u8; len as usize];
        server.read_exact(&mut body).await.unwrap();
        assert_eq!(body, b"<methodCall/>");
    }
}
