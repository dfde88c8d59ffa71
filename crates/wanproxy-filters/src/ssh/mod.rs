//! SSH-style transport encryption between paired proxies.
//!
//! Each leg of a secured connection runs an encrypt/decrypt filter pair
//! sharing one [`SshSession`]. The session starts with a version-line
//! exchange and a `KEXINIT`-style algorithm negotiation, agrees keys via a
//! curve25519 exchange, and then carries data in SSH binary packets:
//! length, padding, payload, MAC over the packet sequence number, all
//! encrypted with the per-direction cipher.

mod filter;
mod negotiate;

pub use filter::{new_session, DecryptFilter, EncryptFilter, SharedSession};
pub use negotiate::SshSession;

/// Which side of the key exchange this session plays. Independent of the
/// proxy's client/server role: the accepting leg is the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Version line sent by both sides before any packet.
pub const VERSION_STRING: &str = "SSH-2.0-wanproxy";

/// Tag byte prefixed to payloads that carry already-encoded codec data.
pub const STREAM_PACKET: u8 = 0xff;
