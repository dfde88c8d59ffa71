//! Wire-level constants shared by both peers.
//!
//! These values ARE the protocol. Both sides of a proxy pair must agree on
//! every constant here; changing any of them is a breaking change that
//! desynchronises deployed pairs. All multi-byte integers on the wire are
//! big-endian.

use static_assertions::const_assert;

/// Length of a dictionary segment in bytes.
///
/// Carried implicitly: `EXTRACT` and `LEARN` have no length field, both
/// peers simply read this many bytes.
pub const SEGMENT_LENGTH: usize = 128;

/// A dictionary segment: exactly [`SEGMENT_LENGTH`] payload bytes.
pub type Segment = [u8; SEGMENT_LENGTH];

/// Magic byte introducing every inner codec opcode.
///
/// The encoder guarantees this byte never appears in its output except as
/// the first byte of an opcode pair; a literal occurrence in the input is
/// escaped.
pub const MAGIC: u8 = 0xf1;

/// Inner opcodes, each preceded by [`MAGIC`].
pub const OP_ESCAPE: u8 = 0x01;
pub const OP_EXTRACT: u8 = 0x02;
pub const OP_REF: u8 = 0x03;

/// Outer pipe-protocol opcodes (one byte each, no magic prefix).
///
/// Each direction of a paired connection opens with `HELLO`, then carries
/// any mix of the rest. `FRAME` wraps inner codec output; `ASK`/`LEARN`
/// synchronise the dictionaries; `EOS`/`EOS_ACK` drive the half-close
/// handshake.
pub const PIPE_OP_HELLO: u8 = 0xff;
pub const PIPE_OP_LEARN: u8 = 0xfe;
pub const PIPE_OP_ASK: u8 = 0xfd;
pub const PIPE_OP_EOS: u8 = 0xfc;
pub const PIPE_OP_EOS_ACK: u8 = 0xfb;
pub const PIPE_OP_FRAME: u8 = 0x00;

/// Maximum payload of a single `FRAME`. The length field is a u16 and a
/// frame is never empty: `0 < len <= MAX_FRAME`.
pub const MAX_FRAME: usize = 32768;

/// Canonical UUID string length (8-4-4-4-12 hex form with hyphens), as
/// carried in `HELLO`.
pub const UUID_STRING_SIZE: usize = 36;

/// `HELLO` payload length: the UUID string plus the nominal cache size.
pub const HELLO_LENGTH: usize = UUID_STRING_SIZE + 8;

const_assert!(MAX_FRAME <= u16::MAX as usize + 1);
const_assert!(HELLO_LENGTH <= u8::MAX as usize);
