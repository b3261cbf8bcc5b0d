//! Frame wire format and protocol constants.
//!
//! Every frame after the handshake carries an 8-byte header:
//! ```text
//! ┌────────────┬──────────┐
//! │ Body length│ Handle   │
//! │ 4 bytes    │ 4 bytes  │
//! │ uint32 LE  │ uint32 LE│
//! └────────────┴──────────┘
//! ```
//! followed by `body_length` bytes of UTF-8 text forming one XML document.
//! The body length excludes the header itself.
//!
//! The handshake frame is different: a single `u32` length followed by an
//! ASCII identifier that must equal [`PROTOCOL_IDENTIFIER`] exactly.

/// Identifier the server must present during the handshake.
pub const PROTOCOL_IDENTIFIER: &str = "GBXRemote 2";

/// Frame header size in bytes (fixed, exactly 8).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Reserved method name for batched calls.
pub const MULTICALL_METHOD: &str = "system.multicall";

/// Hard server-side ceiling on calls per multicall.
pub const PROTOCOL_CALL_CEILING: usize = 512;

/// Default per-batch budget, kept well under the protocol ceiling.
pub const DEFAULT_MAX_CALLS_PER_BATCH: usize = 400;

/// Maximum accepted inbound frame body (4 MB).
///
/// The server never legitimately sends bodies anywhere near this; a larger
/// length field means the stream is corrupt.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound on a plausible handshake identifier length.
pub(crate) const MAX_HANDSHAKE_SIZE: usize = 64;

/// Encode a frame header (Little Endian, matching the server).
#[inline]
pub fn encode_frame_header(body_length: u32, handle: u32) -> [u8; FRAME_HEADER_SIZE] {
    let mut buf = [0u8; FRAME_HEADER_SIZE];
    buf[0..4].copy_from_slice(&body_length.to_le_bytes());
    buf[4..8].copy_from_slice(&handle.to_le_bytes());
    buf
}

/// Decode a frame header into `(body_length, handle)`.
#[inline]
pub fn decode_frame_header(buf: &[u8; FRAME_HEADER_SIZE]) -> (u32, u32) {
    let body_length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let handle = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    (body_length, handle)
}
