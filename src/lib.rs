//! Batched XML-RPC client transport for GBX-style dedicated game servers.
//!
//! The server speaks a persistent-TCP dialect of XML-RPC: after a short
//! handshake, both sides exchange length-prefixed frames carrying one
//! XML document each. This crate multiplexes many logical calls over
//! that single stream by packing them into `system.multicall` batches,
//! with a flow-control window keeping the server's input queue from
//! overflowing.
//!
//! ```text
//!  caller ── queue_with ──▶ CallQueue ──▶ batcher ──▶ TCP ──▶ server
//!                                            │ handle
//!                                       PendingTable
//!                                            │ handle
//!  caller ◀─ continuation ◀── demux ◀─────── TCP ◀─────────── server
//! ```
//!
//! The core is callback-driven: [`Connection::queue_with`] pairs a call
//! with a continuation that borrows the parsed reply. Awaitable
//! adapters ([`Connection::call`], [`Connection::call_map`],
//! [`Connection::call_packet`]) bridge that to async callers.
//!
//! # Example
//!
//! ```no_run
//! use gbxrpc::Connection;
//!
//! # async fn run() -> gbxrpc::Result<()> {
//! let conn = Connection::connect("127.0.0.1:5000").await?;
//!
//! let mut auth = conn.writer("Authenticate");
//! auth.write_string("SuperAdmin");
//! auth.write_string("SuperAdmin");
//! conn.call(auth).await?;
//!
//! let mut chat = conn.writer("ChatSendServerMessage");
//! chat.write_string("hello from gbxrpc");
//! conn.queue(chat)?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod packet;
pub mod pool;
pub mod protocol;

mod batcher;
mod connection;
mod demux;
mod pending;

pub use codec::{ArrayReader, ArrayWriter, CallWriter, MemberArrayWriter, StructReader, StructWriter, ValueReader};
pub use connection::{Connection, ConnectionBuilder};
pub use error::{Fault, Result, RpcError};
pub use packet::{CallReply, Continuation, Packet, ServerCall, ServerCallHandler};
