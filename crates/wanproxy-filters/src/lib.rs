//! Stream filters and the chain that wires them together.
//!
//! A connection is driven by two chains of filters — request and response
//! — each transforming one byte stream into another: SSH decrypt, zlib
//! inflate, dedup decode, dedup encode, zlib deflate, SSH encrypt, byte
//! counting. Filters that implement a paired protocol (dedup, SSH) talk
//! to their counterpart in the opposite chain through peer operations
//! routed by the connection driver.

pub mod chain;
pub mod count;
pub mod pipe;
pub mod ssh;
pub mod zlib;

pub use chain::{ChainRun, Effects, Filter, FilterChain, Flags, Item, PeerOp};
pub use count::CountFilter;
pub use pipe::{DecodeFilter, EncodeFilter};
pub use ssh::{DecryptFilter, EncryptFilter, Role, SshSession};
pub use zlib::{DeflateFilter, InflateFilter};

use wanproxy_core::CodecError;

/// Errors raised inside a filter. All fatal for the owning connection.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("malformed pipe stream: {0}")]
    Pipe(&'static str),

    #[error("ssh transport: {0}")]
    Ssh(String),

    #[error("deflate: {0}")]
    Deflate(#[from] flate2::CompressError),

    #[error("inflate: {0}")]
    Inflate(#[from] flate2::DecompressError),
}
