//! Typed call surface.
//!
//! A [`Packet`] couples a method name, argument serialization and reply
//! deserialization into one type, so call sites can say "send this" and
//! get the filled-in packet back. Untyped call sites use [`CallReply`]
//! and closures directly.

use crate::codec::{ArrayReader, CallWriter};
use crate::error::{Fault, Result};

/// One remote method call, described as a type.
pub trait Packet {
    /// Remote method name.
    fn method_name(&self) -> &str;

    /// Serialize the arguments in call order.
    fn write(&self, writer: &mut CallWriter);

    /// Absorb the reply values. The default ignores them, which suits
    /// fire-and-forget methods that return only a status flag.
    fn read(&mut self, _reply: &ArrayReader<'_>) -> Result<()> {
        Ok(())
    }
}

/// Outcome of one call inside a batch, borrowed from the parsed frame.
pub enum CallReply<'a> {
    /// The call succeeded; its return values are readable in order.
    Success(ArrayReader<'a>),
    /// The server faulted this call (or the whole batch containing it).
    Fault(Fault),
}

impl<'a> CallReply<'a> {
    /// The return values, or the fault as an error.
    pub fn into_result(self) -> Result<ArrayReader<'a>> {
        match self {
            CallReply::Success(values) => Ok(values),
            CallReply::Fault(fault) => Err(fault.into()),
        }
    }

    /// Whether this reply is a fault.
    pub fn is_fault(&self) -> bool {
        matches!(self, CallReply::Fault(_))
    }
}

/// Callback invoked with the reply to one queued call.
///
/// Invoked exactly once, off the caller's stack, with no transport lock
/// held. The borrowed reply must be consumed before returning.
pub type Continuation = Box<dyn for<'a> FnOnce(CallReply<'a>) + Send>;

/// A call initiated by the server (a callback notification).
pub struct ServerCall<'a> {
    /// Remote method name, e.g. `ManiaPlanet.PlayerChat`.
    pub method: &'a str,
    /// Positional arguments.
    pub args: ArrayReader<'a>,
}

/// Handler for server-initiated calls.
pub type ServerCallHandler = Box<dyn for<'a> FnMut(ServerCall<'a>) + Send>;
