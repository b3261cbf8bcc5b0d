//! Call serialization and response deserialization.
//!
//! The write side builds XML text directly into `String` buffers; the
//! read side is a set of borrowing views over a `roxmltree` parse.

mod multicall;
mod reader;
mod writer;

pub(crate) use multicall::encode_multicall_into;
pub use reader::{ArrayReader, StructReader, ValueReader};
pub use writer::{ArrayWriter, CallWriter, MemberArrayWriter, StructWriter};
