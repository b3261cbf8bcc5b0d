//! Inbound frame demultiplexing.
//!
//! One task owns the read half of the socket. Each frame is parsed once
//! and routed by its body's root element:
//!
//! - `methodResponse`: a batch reply; continuations registered under
//!   the frame handle are invoked in lockstep with the outer result
//!   array, and the flow-control window is credited.
//! - `methodCall`: a server-initiated notification, handed to the
//!   subscriber if one is installed.
//!
//! A single malformed frame is logged and dropped; the stream stays up.
//! Only a framing-level violation (oversized length field) or an
//! unrecoverable socket error tears the connection down.

use std::sync::Arc;
use std::time::Duration;

use roxmltree::{Document, Node};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, trace, warn};

use crate::codec::{ArrayReader, ValueReader};
use crate::connection::Core;
use crate::error::{Fault, Result, RpcError};
use crate::packet::{CallReply, ServerCall};
use crate::protocol::{decode_frame_header, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};

fn find_child<'a>(node: Node<'a, 'a>, tag: &str) -> Option<Node<'a, 'a>> {
    node.children().find(|c| c.has_tag_name(tag))
}

/// Read and dispatch exactly one frame.
///
/// Recoverable body problems (bad UTF-8, bad XML, unknown handle) are
/// logged and swallowed. Errors returned from here are fatal to the
/// current stream.
pub(crate) async fn read_one_frame(core: &Core) -> Result<()> {
    // The reader lock is scoped to the socket reads; continuations and
    // subscribers must never run with a transport lock held.
    let (handle, scratch) = {
        let mut guard = core.reader.lock().await;
        let reader = guard.as_mut().ok_or(RpcError::NotConnected)?;

        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader.io.read_exact(&mut header).await?;
        let (body_length, handle) = decode_frame_header(&header);
        let body_length = body_length as usize;

        if body_length > MAX_FRAME_SIZE {
            return Err(RpcError::Protocol(format!(
                "frame length {body_length} exceeds limit {MAX_FRAME_SIZE}"
            )));
        }

        reader.scratch.resize(body_length, 0);
        reader.io.read_exact(&mut reader.scratch[..]).await?;
        (handle, std::mem::take(&mut reader.scratch))
    };

    handle_frame(core, handle, &scratch);

    // Hand the scratch buffer back for the next frame. A reconnect may
    // have replaced the read half in the meantime; its fresh buffer wins.
    if let Some(reader) = core.reader.lock().await.as_mut() {
        reader.scratch = scratch;
    }
    Ok(())
}

fn handle_frame(core: &Core, handle: u32, body: &[u8]) {
    if handle == 0 {
        // The stream stays aligned only because the body was consumed
        // before this check.
        warn!(body_length = body.len(), "discarding frame with zero handle");
        return;
    }

    let body = match std::str::from_utf8(body) {
        Ok(body) => body,
        Err(err) => {
            warn!(handle, error = %err, "dropping frame with invalid UTF-8 body");
            return;
        }
    };

    let doc = match Document::parse(body) {
        Ok(doc) => doc,
        Err(err) => {
            warn!(handle, error = %err, "dropping unparsable frame body");
            return;
        }
    };

    dispatch_body(core, handle, &doc);
}

/// Route one parsed frame body.
pub(crate) fn dispatch_body(core: &Core, handle: u32, doc: &Document<'_>) {
    let root = doc.root_element();
    match root.tag_name().name() {
        "methodResponse" => dispatch_response(core, handle, root),
        "methodCall" => dispatch_server_call(core, root),
        other => warn!(handle, root = other, "dropping frame with unknown root element"),
    }
}

fn dispatch_response(core: &Core, handle: u32, root: Node<'_, '_>) {
    let Some(continuations) = core.pending.remove(handle) else {
        error!(handle, "response for unknown handle");
        return;
    };
    let expected = continuations.len();

    if let Some(fault) = find_child(root, "fault") {
        // The server rejected the whole batch. None of its calls ran,
        // so none will be answered individually.
        core.window.restore(expected);
        let fault = parse_fault(find_child(fault, "value"));
        error!(
            handle,
            calls = expected,
            code = fault.code,
            message = %fault.message,
            "batch rejected by server"
        );
        return;
    }

    // Every call in the batch was answered by this frame; the credit is
    // owed regardless of how well the payload parses.
    core.window.restore(expected);

    let results = find_child(root, "params")
        .and_then(|params| find_child(params, "param"))
        .and_then(|param| find_child(param, "value"))
        .map(ValueReader::new)
        .and_then(|value| value.as_array().ok());
    let Some(results) = results else {
        error!(handle, "malformed batch response envelope");
        return;
    };

    if results.len() != expected {
        error!(
            handle,
            expected,
            received = results.len(),
            "batch response length mismatch"
        );
        return;
    }

    for (index, (result, continuation)) in results.iter().zip(continuations).enumerate() {
        let reply = read_call_result(&result);
        match continuation {
            Some(continuation) => {
                trace!(handle, index, fault = reply.is_fault(), "delivering reply");
                continuation(reply);
            }
            None => {
                if let CallReply::Fault(fault) = reply {
                    error!(
                        handle,
                        index,
                        code = fault.code,
                        message = %fault.message,
                        "fault for fire-and-forget call"
                    );
                }
            }
        }
    }
}

/// Interpret one element of the outer result array: an `array` is the
/// call's return values, a `struct` is a per-call fault.
fn read_call_result<'a>(value: &ValueReader<'a>) -> CallReply<'a> {
    match value.as_array() {
        Ok(values) => CallReply::Success(values),
        Err(_) => CallReply::Fault(parse_fault_value(*value)),
    }
}

fn parse_fault(value: Option<Node<'_, '_>>) -> Fault {
    value
        .map(ValueReader::new)
        .map(parse_fault_value)
        .unwrap_or_else(|| Fault::new(0, "malformed fault"))
}

fn parse_fault_value(value: ValueReader<'_>) -> Fault {
    match value.as_struct() {
        Ok(members) => {
            let code = members
                .try_member("faultCode")
                .and_then(|v| v.as_int().ok())
                .unwrap_or(0);
            let message = members
                .try_member("faultString")
                .and_then(|v| v.as_str().ok())
                .unwrap_or("malformed fault")
                .to_string();
            Fault::new(code, message)
        }
        Err(_) => Fault::new(0, "malformed fault"),
    }
}

fn dispatch_server_call(core: &Core, root: Node<'_, '_>) {
    let Some(method) = find_child(root, "methodName").and_then(|n| n.text()) else {
        warn!("dropping server call without method name");
        return;
    };
    let args = match find_child(root, "params") {
        Some(params) => ArrayReader::from_params(params),
        None => {
            warn!(method, "dropping server call without params");
            return;
        }
    };

    // The handler is taken out of the slot for the duration of the
    // call, so it may install a replacement (or itself be replaced)
    // without re-entering the lock.
    let handler = core
        .subscriber
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    match handler {
        Some(mut handler) => {
            trace!(method, args = args.len(), "delivering server call");
            handler(ServerCall { method, args });
            let mut slot = core.subscriber.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
        None => debug!(method, "no subscriber for server call"),
    }
}

/// Whether an I/O error means the peer went away (as opposed to a local
/// or fatal condition).
pub(crate) fn is_connection_reset(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// Background task reading frames until shutdown.
///
/// A reset stream is reestablished once per incident; anything else
/// fatal cancels the whole engine.
pub(crate) async fn run_receive_loop(core: Arc<Core>) {
    loop {
        let result = tokio::select! {
            _ = core.shutdown.cancelled() => break,
            result = read_one_frame(&core) => result,
        };

        match result {
            Ok(()) => {}
            Err(RpcError::NotConnected) => {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(RpcError::Io(err)) if is_connection_reset(&err) => {
                if core.shutdown.is_cancelled() {
                    break;
                }
                warn!(error = %err, "stream reset, reconnecting");
                if let Err(err) = core.reestablish().await {
                    error!(error = %err, "reconnect failed, shutting down");
                    core.shutdown.cancel();
                    break;
                }
            }
            Err(err) => {
                error!(error = %err, "unrecoverable receive error, shutting down");
                core.shutdown.cancel();
                break;
            }
        }
    }
    trace!("receive loop stopped");
}
