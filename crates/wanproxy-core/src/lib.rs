//! Core of the WANProxy pair: the XCodec dedup engine and its caches.
//!
//! The codec turns a byte stream into references into a shared dictionary
//! of fixed-size segments keyed by a 64-bit rolling hash. Two proxy
//! instances running the same codec against caches synchronised over the
//! pipe protocol (see [`wire`]) achieve end-to-end deduplication of
//! repeating traffic.

pub mod cache;
pub mod config;
pub mod coss;
pub mod decoder;
pub mod encoder;
pub mod hash;
pub mod wire;

pub use cache::{CacheIdentity, MemoryCache, SegmentCache, SharedCache};
pub use decoder::Decoder;
pub use encoder::Encoder;
pub use hash::RollingHash;
pub use wire::{Segment, SEGMENT_LENGTH};

/// Errors raised by the encoder/decoder pair.
///
/// Every variant is fatal for the connection that hit it: a dictionary
/// collision would otherwise compound silently on both peers.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("dictionary collision on hash {hash:#018x}")]
    Collision { hash: u64 },

    #[error("unsupported opcode {0:#04x} in codec stream")]
    UnknownOpcode(u8),
}
