//! Connection engine and the public [`Connection`] handle.
//!
//! The engine owns one TCP stream, split into halves behind async
//! mutexes so the send and receive paths never contend:
//!
//! ```text
//!               ┌──────────────── Core ────────────────┐
//! queue ──────▶ │ CallQueue ─▶ send loop ─▶ write half │
//!               │                                      │
//! replies ◀──── │ continuations ◀─ recv loop ◀─ read half
//!               └──────────────────────────────────────┘
//! ```
//!
//! Both loops are optional: with them disabled the caller drives the
//! engine deterministically through [`Connection::flush_queue`] and
//! [`Connection::poll_frame`], which the tests lean on heavily.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as TokioMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batcher::{self, CallQueue, QueuedCall, Window};
use crate::codec::{ArrayReader, CallWriter};
use crate::demux;
use crate::error::{Result, RpcError};
use crate::packet::{CallReply, Packet, ServerCall, ServerCallHandler};
use crate::pending::PendingTable;
use crate::pool::BufferPool;
use crate::protocol::{
    DEFAULT_MAX_CALLS_PER_BATCH, MAX_HANDSHAKE_SIZE, PROTOCOL_CALL_CEILING, PROTOCOL_IDENTIFIER,
};

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Read half plus its reusable frame-body scratch buffer.
pub(crate) struct ReadHalf {
    pub(crate) io: BoxedReader,
    pub(crate) scratch: BytesMut,
}

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) max_calls_per_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_calls_per_batch: DEFAULT_MAX_CALLS_PER_BATCH,
        }
    }
}

/// Shared state of one connection, owned jointly by the handle and the
/// background loops.
pub(crate) struct Core {
    pub(crate) config: Config,
    pub(crate) queue: CallQueue,
    pub(crate) window: Window,
    pub(crate) pending: PendingTable,
    pub(crate) pool: BufferPool,
    pub(crate) subscriber: StdMutex<Option<ServerCallHandler>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) writer: TokioMutex<Option<BoxedWriter>>,
    pub(crate) reader: TokioMutex<Option<ReadHalf>>,
    last_endpoint: StdMutex<Option<SocketAddr>>,
}

impl Core {
    /// A core with no socket attached. The connection attaches one via
    /// [`Core::establish`]; tests dispatch against it directly.
    pub(crate) fn detached(config: Config) -> Self {
        let window = Window::new(config.max_calls_per_batch);
        Self {
            config,
            queue: CallQueue::default(),
            window,
            pending: PendingTable::new(),
            pool: BufferPool::new(),
            subscriber: StdMutex::new(None),
            shutdown: CancellationToken::new(),
            writer: TokioMutex::new(None),
            reader: TokioMutex::new(None),
            last_endpoint: StdMutex::new(None),
        }
    }

    pub(crate) fn set_subscriber(&self, handler: Option<ServerCallHandler>) {
        *self.subscriber.lock().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    /// Connect, handshake and install the stream halves.
    pub(crate) async fn establish(&self, addr: SocketAddr) -> Result<()> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        handshake(&mut stream).await?;

        let (read, write) = stream.into_split();
        *self.writer.lock().await = Some(Box::new(write));
        *self.reader.lock().await = Some(ReadHalf {
            io: Box::new(read),
            scratch: BytesMut::new(),
        });
        *self.last_endpoint.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);

        info!(%addr, "connection established");
        Ok(())
    }

    /// Replace a reset stream with a fresh one.
    ///
    /// Every in-flight batch is invalidated (its replies can never
    /// arrive on the new stream) and the window returns to its initial
    /// budget. Queued-but-unsent calls survive and go out on the new
    /// stream.
    pub(crate) async fn reestablish(&self) -> Result<()> {
        let addr = self
            .last_endpoint
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ok_or(RpcError::NotConnected)?;

        *self.writer.lock().await = None;
        *self.reader.lock().await = None;

        let dropped = self.pending.clear();
        if dropped > 0 {
            warn!(batches = dropped, "dropping in-flight batches on reconnect");
        }
        self.window.reset();

        self.establish(addr).await
    }
}

/// Read and verify the server's handshake frame.
async fn handshake<R>(io: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_HANDSHAKE_SIZE {
        return Err(RpcError::Handshake(format!(
            "implausible identifier length {len}"
        )));
    }

    let mut identifier = vec![0u8; len];
    io.read_exact(&mut identifier).await?;
    if identifier != PROTOCOL_IDENTIFIER.as_bytes() {
        return Err(RpcError::Handshake(format!(
            "unexpected identifier {:?}",
            String::from_utf8_lossy(&identifier)
        )));
    }
    Ok(())
}

/// Configures and opens a [`Connection`].
pub struct ConnectionBuilder {
    max_calls_per_batch: usize,
    send_loop: bool,
    receive_loop: bool,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            max_calls_per_batch: DEFAULT_MAX_CALLS_PER_BATCH,
            send_loop: true,
            receive_loop: true,
        }
    }

    /// Cap on calls per multicall frame, also the initial flow-control
    /// window. Must be between 1 and the protocol ceiling of 512.
    pub fn max_calls_per_batch(mut self, max: usize) -> Self {
        self.max_calls_per_batch = max;
        self
    }

    /// Disable the background send loop; the caller drives sending via
    /// [`Connection::flush_queue`].
    pub fn manual_send(mut self) -> Self {
        self.send_loop = false;
        self
    }

    /// Disable the background receive loop; the caller drives reading
    /// via [`Connection::poll_frame`].
    pub fn manual_receive(mut self) -> Self {
        self.receive_loop = false;
        self
    }

    /// Connect to the server, perform the handshake and start the
    /// configured background loops.
    pub async fn connect(self, addr: impl tokio::net::ToSocketAddrs) -> Result<Connection> {
        if self.max_calls_per_batch == 0 || self.max_calls_per_batch > PROTOCOL_CALL_CEILING {
            return Err(RpcError::Config(format!(
                "max_calls_per_batch must be within 1..={PROTOCOL_CALL_CEILING}, got {}",
                self.max_calls_per_batch
            )));
        }

        let addr = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| RpcError::Config("endpoint resolved to no address".into()))?;

        let core = Arc::new(Core::detached(Config {
            max_calls_per_batch: self.max_calls_per_batch,
        }));
        core.establish(addr).await?;

        if self.send_loop {
            tokio::spawn(batcher::run_send_loop(Arc::clone(&core)));
        }
        if self.receive_loop {
            tokio::spawn(demux::run_receive_loop(Arc::clone(&core)));
        }

        Ok(Connection {
            core,
            send_loop: self.send_loop,
            receive_loop: self.receive_loop,
        })
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one server connection.
///
/// Cheap to use from many tasks through an `Arc`; all methods take
/// `&self`. Dropping the handle shuts the engine down.
pub struct Connection {
    core: Arc<Core>,
    send_loop: bool,
    receive_loop: bool,
}

impl Connection {
    /// Open a connection with default settings.
    pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        ConnectionBuilder::new().connect(addr).await
    }

    /// Start serializing a call, reusing a pooled buffer.
    pub fn writer(&self, method: &str) -> CallWriter {
        CallWriter::with_buffer(self.core.pool.checkout(), method)
    }

    fn enqueue(&self, writer: CallWriter, continuation: Option<crate::packet::Continuation>) -> Result<()> {
        if self.core.shutdown.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }
        let body = writer.into_member_body()?;
        self.core.queue.push(QueuedCall { body, continuation });
        Ok(())
    }

    /// Queue a fire-and-forget call. A fault for it is logged, not
    /// delivered.
    pub fn queue(&self, writer: CallWriter) -> Result<()> {
        self.enqueue(writer, None)
    }

    /// Queue a call and invoke `continuation` with its reply.
    pub fn queue_with<F>(&self, writer: CallWriter, continuation: F) -> Result<()>
    where
        F: for<'a> FnOnce(CallReply<'a>) + Send + 'static,
    {
        self.enqueue(writer, Some(Box::new(continuation)))
    }

    /// Queue a typed packet, fire-and-forget.
    pub fn queue_packet<P: Packet>(&self, packet: &P) -> Result<()> {
        let mut writer = self.writer(packet.method_name());
        packet.write(&mut writer);
        self.queue(writer)
    }

    /// Queue a call and await its completion, discarding return values.
    pub async fn call(&self, writer: CallWriter) -> Result<()> {
        self.call_map(writer, |_| Ok(())).await
    }

    /// Queue a call and await a value extracted from its reply.
    pub async fn call_map<T, F>(&self, writer: CallWriter, read: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(ArrayReader<'a>) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.queue_with(writer, move |reply: CallReply<'_>| {
            let outcome = reply.into_result().and_then(read);
            let _ = tx.send(outcome);
        })?;
        rx.await.map_err(|_| RpcError::ConnectionClosed)?
    }

    /// Send a typed packet and await it back, filled in from the reply.
    pub async fn call_packet<P>(&self, mut packet: P) -> Result<P>
    where
        P: Packet + Send + 'static,
    {
        let mut writer = self.writer(packet.method_name());
        packet.write(&mut writer);

        let (tx, rx) = oneshot::channel();
        self.queue_with(writer, move |reply: CallReply<'_>| {
            let outcome = match reply {
                CallReply::Success(values) => packet.read(&values).map(|()| packet),
                CallReply::Fault(fault) => Err(fault.into()),
            };
            let _ = tx.send(outcome);
        })?;
        rx.await.map_err(|_| RpcError::ConnectionClosed)?
    }

    /// Install the handler for server-initiated calls, replacing any
    /// previous one.
    pub fn on_server_call<F>(&self, handler: F)
    where
        F: for<'a> FnMut(ServerCall<'a>) + Send + 'static,
    {
        self.core.set_subscriber(Some(Box::new(handler)));
    }

    /// Drain up to one batch out of the queue onto the wire. Only valid
    /// with the background send loop disabled.
    pub async fn flush_queue(&self) -> Result<usize> {
        if self.send_loop {
            return Err(RpcError::Usage(
                "flush_queue conflicts with the background send loop",
            ));
        }
        batcher::drain_and_send(&self.core).await
    }

    /// Read and dispatch exactly one inbound frame. Only valid with the
    /// background receive loop disabled.
    pub async fn poll_frame(&self) -> Result<()> {
        if self.receive_loop {
            return Err(RpcError::Usage(
                "poll_frame conflicts with the background receive loop",
            ));
        }
        demux::read_one_frame(&self.core).await
    }

    /// Remaining flow-control budget; negative while callers race past
    /// an exhausted window.
    pub fn available_window(&self) -> i64 {
        self.core.window.available()
    }

    /// Calls queued but not yet sent.
    pub fn queued_calls(&self) -> usize {
        self.core.queue.len()
    }

    /// Batches sent and still awaiting a response frame.
    pub fn in_flight_batches(&self) -> usize {
        self.core.pending.len()
    }

    /// Stop the background loops and drop the stream. Queued calls that
    /// never went out are discarded.
    pub async fn close(&self) {
        self.core.shutdown.cancel();
        *self.core.writer.lock().await = None;
        *self.core.reader.lock().await = None;
        debug!("connection closed");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("send_loop", &self.send_loop)
            .field("receive_loop", &self.receive_loop)
            .field("queued_calls", &self.queued_calls())
            .field("in_flight_batches", &self.in_flight_batches())
            .field("available_window", &self.available_window())
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.core.shutdown.cancel();
    }
}
