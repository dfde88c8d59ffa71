//! Algorithm negotiation and key agreement for the SSH transport.
//!
//! A compact KEXINIT-style exchange: both sides announce their algorithm
//! name-lists, the client initiates a curve25519 exchange, keys are
//! derived from the shared secret and the exchange hash with the classic
//! per-purpose letter scheme. Only one algorithm per slot is spoken
//! (`curve25519-sha256`, `aes128-ctr`, `hmac-sha2-256`); negotiation
//! exists so either side can refuse a mismatched peer outright.

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use super::Role;
use crate::FilterError;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Message numbers, in the ranges SSH assigns them.
pub const MSG_KEXINIT: u8 = 20;
pub const MSG_NEWKEYS: u8 = 21;
pub const MSG_KEXDH_INIT: u8 = 30;
pub const MSG_KEXDH_REPLY: u8 = 31;

const KEX_NAME: &str = "curve25519-sha256";
const CIPHER_NAME: &str = "aes128-ctr";
const MAC_NAME: &str = "hmac-sha2-256";

/// Bytes of MAC appended to each packet once keys are live.
pub const MAC_SIZE: usize = 32;

/// Cipher block size; packets are padded to a multiple of this.
pub const BLOCK_SIZE: usize = 16;

/// One direction's working cipher and MAC state. The CTR keystream runs
/// continuously across packets, as SSH ciphers do.
pub struct CipherState {
    cipher: Aes128Ctr,
    mac_key: Zeroizing<[u8; 32]>,
}

impl CipherState {
    fn new(key: &[u8; 16], iv: &[u8; 16], mac_key: [u8; 32]) -> Self {
        Self {
            cipher: Aes128Ctr::new(key.into(), iv.into()),
            mac_key: Zeroizing::new(mac_key),
        }
    }

    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }

    /// MAC over the packet sequence number and the plaintext packet.
    pub fn mac(&self, sequence: u32, packet: &[u8]) -> [u8; MAC_SIZE] {
        let mut mac = HmacSha256::new_from_slice(&*self.mac_key).expect("any key length works");
        mac.update(&sequence.to_be_bytes());
        mac.update(packet);
        mac.finalize().into_bytes().into()
    }
}

/// What the negotiation wants done after ingesting a packet.
pub struct NegotiationStep {
    /// Payloads to send to the peer, in order.
    pub replies: Vec<Vec<u8>>,
    /// True once both sides have switched to the agreed keys.
    pub negotiated: bool,
}

enum State {
    /// Waiting for the peer's KEXINIT.
    Idle,
    /// Client only: KEXDH_INIT sent, waiting for the reply.
    AwaitReply,
    /// Server only: lists agreed, waiting for KEXDH_INIT.
    AwaitInit,
    /// Keys derived, waiting for the peer's NEWKEYS.
    AwaitNewKeys,
    Done,
}

/// Shared state of one encrypt/decrypt filter pair.
pub struct SshSession {
    pub role: Role,
    state: State,
    local_version: String,
    remote_version: Option<String>,
    local_kexinit: Vec<u8>,
    remote_kexinit: Option<Vec<u8>>,
    secret: Option<EphemeralSecret>,
    public: [u8; 32],
    /// Derived but not yet activated keys. NEWKEYS is itself sent and
    /// received in the clear: tx arms right after our NEWKEYS goes out,
    /// rx arms when the peer's NEWKEYS arrives.
    staged_tx: Option<CipherState>,
    staged_rx: Option<CipherState>,

    /// Live directions. `tx` is used by the encrypt filter, `rx` by the
    /// decrypt filter; both are None until the handshake completes.
    pub tx: Option<CipherState>,
    pub rx: Option<CipherState>,
    pub tx_sequence: u32,
    pub rx_sequence: u32,
}

struct KeySet {
    tx: CipherState,
    rx: CipherState,
}

impl SshSession {
    pub fn new(role: Role) -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self {
            role,
            state: State::Idle,
            local_version: super::VERSION_STRING.to_string(),
            remote_version: None,
            local_kexinit: Vec::new(),
            remote_kexinit: None,
            secret: Some(secret),
            public: *public.as_bytes(),
            staged_tx: None,
            staged_rx: None,
            tx: None,
            rx: None,
            tx_sequence: 0,
            rx_sequence: 0,
        }
    }

    pub fn local_version(&self) -> &str {
        &self.local_version
    }

    pub fn negotiated(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Switch the transmit direction onto the agreed keys. Called by the
    /// encrypt filter immediately after its NEWKEYS packet is emitted.
    pub fn arm_tx(&mut self) {
        if let Some(tx) = self.staged_tx.take() {
            self.tx = Some(tx);
        }
    }

    /// Record the peer's version line and produce our KEXINIT.
    pub fn remote_version(&mut self, line: &str) -> Vec<u8> {
        self.remote_version = Some(line.to_string());
        let mut payload = Vec::with_capacity(64);
        payload.push(MSG_KEXINIT);
        let mut cookie = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut cookie);
        payload.extend_from_slice(&cookie);
        put_name_list(&mut payload, KEX_NAME);
        put_name_list(&mut payload, CIPHER_NAME);
        put_name_list(&mut payload, MAC_NAME);
        self.local_kexinit = payload.clone();
        payload
    }

    /// Ingest one negotiation packet payload.
    pub fn input(&mut self, payload: &[u8]) -> Result<NegotiationStep, FilterError> {
        let msg = *payload
            .first()
            .ok_or_else(|| FilterError::Ssh("empty negotiation packet".into()))?;

        match msg {
            MSG_KEXINIT => self.on_kexinit(payload),
            MSG_KEXDH_INIT => self.on_kexdh_init(payload),
            MSG_KEXDH_REPLY => self.on_kexdh_reply(payload),
            MSG_NEWKEYS => self.on_newkeys(),
            other => Err(FilterError::Ssh(format!(
                "unexpected negotiation message {other}"
            ))),
        }
    }

    fn on_kexinit(&mut self, payload: &[u8]) -> Result<NegotiationStep, FilterError> {
        if self.remote_kexinit.is_some() {
            return Err(FilterError::Ssh("duplicate KEXINIT".into()));
        }

        let mut rest = &payload[1..];
        if rest.len() < 16 {
            return Err(FilterError::Ssh("short KEXINIT".into()));
        }
        rest = &rest[16..];
        for want in [KEX_NAME, CIPHER_NAME, MAC_NAME] {
            let names = get_name_list(&mut rest)
                .ok_or_else(|| FilterError::Ssh("truncated KEXINIT name-list".into()))?;
            if !names.split(',').any(|n| n == want) {
                return Err(FilterError::Ssh(format!("no common algorithm: need {want}")));
            }
        }
        self.remote_kexinit = Some(payload.to_vec());

        match self.role {
            Role::Client => {
                // Initiate the exchange.
                let mut init = Vec::with_capacity(1 + 4 + 32);
                init.push(MSG_KEXDH_INIT);
                put_string(&mut init, &self.public);
                self.state = State::AwaitReply;
                Ok(NegotiationStep {
                    replies: vec![init],
                    negotiated: false,
                })
            }
            Role::Server => {
                self.state = State::AwaitInit;
                Ok(NegotiationStep {
                    replies: Vec::new(),
                    negotiated: false,
                })
            }
        }
    }

    fn on_kexdh_init(&mut self, payload: &[u8]) -> Result<NegotiationStep, FilterError> {
        if !matches!((self.role, &self.state), (Role::Server, State::AwaitInit)) {
            return Err(FilterError::Ssh("KEXDH_INIT out of order".into()));
        }
        let mut rest = &payload[1..];
        let peer_public = get_public_key(&mut rest)?;

        let keys = self.derive(&peer_public)?;

        let mut reply = Vec::with_capacity(1 + 4 + 32);
        reply.push(MSG_KEXDH_REPLY);
        put_string(&mut reply, &self.public);

        // Keys stage now; each direction arms on its NEWKEYS boundary.
        self.staged_tx = Some(keys.tx);
        self.staged_rx = Some(keys.rx);
        self.state = State::AwaitNewKeys;

        Ok(NegotiationStep {
            replies: vec![reply, vec![MSG_NEWKEYS]],
            negotiated: false,
        })
    }

    fn on_kexdh_reply(&mut self, payload: &[u8]) -> Result<NegotiationStep, FilterError> {
        if !matches!((self.role, &self.state), (Role::Client, State::AwaitReply)) {
            return Err(FilterError::Ssh("KEXDH_REPLY out of order".into()));
        }
        let mut rest = &payload[1..];
        let peer_public = get_public_key(&mut rest)?;

        let keys = self.derive(&peer_public)?;

        // Keys stage now; each direction arms on its NEWKEYS boundary.
        self.staged_tx = Some(keys.tx);
        self.staged_rx = Some(keys.rx);
        self.state = State::AwaitNewKeys;

        Ok(NegotiationStep {
            replies: vec![vec![MSG_NEWKEYS]],
            negotiated: false,
        })
    }

    fn on_newkeys(&mut self) -> Result<NegotiationStep, FilterError> {
        if !matches!(self.state, State::AwaitNewKeys) {
            return Err(FilterError::Ssh("NEWKEYS out of order".into()));
        }
        let rx = self
            .staged_rx
            .take()
            .ok_or_else(|| FilterError::Ssh("NEWKEYS without derived keys".into()))?;
        self.rx = Some(rx);
        self.state = State::Done;
        tracing::debug!(role = ?self.role, "transport keys negotiated");
        Ok(NegotiationStep {
            replies: Vec::new(),
            negotiated: true,
        })
    }

    /// Derive both directions from the shared secret and exchange hash.
    fn derive(&mut self, peer_public: &[u8; 32]) -> Result<KeySet, FilterError> {
        let secret = self
            .secret
            .take()
            .ok_or_else(|| FilterError::Ssh("key exchange already completed".into()))?;
        let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
        let shared = Zeroizing::new(*shared.as_bytes());

        let remote_version = self
            .remote_version
            .as_deref()
            .ok_or_else(|| FilterError::Ssh("key exchange before version line".into()))?;
        let remote_kexinit = self
            .remote_kexinit
            .as_deref()
            .ok_or_else(|| FilterError::Ssh("key exchange before KEXINIT".into()))?;

        // Exchange hash binds versions, negotiation payloads and both
        // public keys. Sort by role so both sides hash identical input.
        let mut hasher = Sha256::new();
        let (client_version, server_version, client_kex, server_kex, client_pub, server_pub) =
            match self.role {
                Role::Client => (
                    self.local_version.as_str(),
                    remote_version,
                    self.local_kexinit.as_slice(),
                    remote_kexinit,
                    &self.public,
                    peer_public,
                ),
                Role::Server => (
                    remote_version,
                    self.local_version.as_str(),
                    remote_kexinit,
                    self.local_kexinit.as_slice(),
                    peer_public,
                    &self.public,
                ),
            };
        hasher.update(client_version.as_bytes());
        hasher.update(server_version.as_bytes());
        hasher.update(client_kex);
        hasher.update(server_kex);
        hasher.update(client_pub);
        hasher.update(server_pub);
        hasher.update(&*shared);
        let exchange_hash: [u8; 32] = hasher.finalize().into();

        let key_material = |letter: u8| -> Zeroizing<[u8; 32]> {
            let mut h = Sha256::new();
            h.update(&*shared);
            h.update(exchange_hash);
            h.update([letter]);
            Zeroizing::new(h.finalize().into())
        };

        let iv_c2s = key_material(b'A');
        let iv_s2c = key_material(b'B');
        let key_c2s = key_material(b'C');
        let key_s2c = key_material(b'D');
        let mac_c2s = key_material(b'E');
        let mac_s2c = key_material(b'F');

        let c2s = CipherState::new(
            key_c2s[..16].try_into().expect("sha256 yields 32 bytes"),
            iv_c2s[..16].try_into().expect("sha256 yields 32 bytes"),
            *mac_c2s,
        );
        let s2c = CipherState::new(
            key_s2c[..16].try_into().expect("sha256 yields 32 bytes"),
            iv_s2c[..16].try_into().expect("sha256 yields 32 bytes"),
            *mac_s2c,
        );

        Ok(match self.role {
            Role::Client => KeySet { tx: c2s, rx: s2c },
            Role::Server => KeySet { tx: s2c, rx: c2s },
        })
    }
}

fn put_string(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

fn put_name_list(out: &mut Vec<u8>, names: &str) {
    put_string(out, names.as_bytes());
}

fn get_name_list(rest: &mut &[u8]) -> Option<String> {
    if rest.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes(rest[..4].try_into().ok()?) as usize;
    if rest.len() < 4 + len {
        return None;
    }
    let names = String::from_utf8(rest[4..4 + len].to_vec()).ok()?;
    *rest = &rest[4 + len..];
    Some(names)
}

fn get_public_key(rest: &mut &[u8]) -> Result<[u8; 32], FilterError> {
    if rest.len() < 4 {
        return Err(FilterError::Ssh("truncated key exchange".into()));
    }
    let len = u32::from_be_bytes(rest[..4].try_into().expect("length checked")) as usize;
    if len != 32 || rest.len() < 4 + len {
        return Err(FilterError::Ssh("bad public key length".into()));
    }
    let key: [u8; 32] = rest[4..36].try_into().expect("length checked");
    *rest = &rest[36..];
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run the whole negotiation between two sessions at the payload
    /// level, returning them once both report negotiated.
    fn handshake() -> (SshSession, SshSession) {
        let mut client = SshSession::new(Role::Client);
        let mut server = SshSession::new(Role::Server);

        let client_kexinit = client.remote_version(server.local_version().to_string().as_str());
        let server_kexinit = server.remote_version(client.local_version().to_string().as_str());

        // client's KEXINIT ingested by server and vice versa.
        let mut to_server = vec![client_kexinit];
        let mut to_client = vec![server_kexinit];
        let mut client_done = false;
        let mut server_done = false;

        while !(client_done && server_done) {
            let mut next_to_client = Vec::new();
            for payload in to_server.drain(..) {
                let step = server.input(&payload).unwrap();
                server_done |= step.negotiated;
                for reply in step.replies {
                    let newkeys = reply.first() == Some(&MSG_NEWKEYS);
                    next_to_client.push(reply);
                    if newkeys {
                        server.arm_tx();
                    }
                }
            }
            let mut next_to_server = Vec::new();
            for payload in to_client.drain(..) {
                let step = client.input(&payload).unwrap();
                client_done |= step.negotiated;
                for reply in step.replies {
                    let newkeys = reply.first() == Some(&MSG_NEWKEYS);
                    next_to_server.push(reply);
                    if newkeys {
                        client.arm_tx();
                    }
                }
            }
            to_client = next_to_client;
            to_server = next_to_server;
            assert!(
                !(to_client.is_empty() && to_server.is_empty()) || (client_done && server_done),
                "handshake stalled"
            );
        }
        (client, server)
    }

    #[test]
    fn sessions_agree_on_keys() {
        let (mut client, mut server) = handshake();
        assert!(client.negotiated() && server.negotiated());

        // Client tx keystream must match server rx keystream.
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        client.tx.as_mut().unwrap().apply_keystream(&mut a);
        server.rx.as_mut().unwrap().apply_keystream(&mut b);
        assert_eq!(a, b, "c2s keystreams diverge");

        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        server.tx.as_mut().unwrap().apply_keystream(&mut a);
        client.rx.as_mut().unwrap().apply_keystream(&mut b);
        assert_eq!(a, b, "s2c keystreams diverge");
    }

    #[test]
    fn macs_agree() {
        let (client, server) = handshake();
        let packet = b"\x00\x00\x00\x0c\x05hello world";
        let tag_c = client.tx.as_ref().unwrap().mac(3, packet);
        let tag_s = server.rx.as_ref().unwrap().mac(3, packet);
        assert_eq!(tag_c, tag_s);
    }

    #[test]
    fn mismatched_algorithms_refused() {
        let mut client = SshSession::new(Role::Client);
        client.remote_version("SSH-2.0-other");

        let mut bogus = vec![MSG_KEXINIT];
        bogus.extend_from_slice(&[0u8; 16]);
        put_name_list(&mut bogus, "kex-nonsense");
        put_name_list(&mut bogus, "aes128-ctr");
        put_name_list(&mut bogus, "hmac-sha2-256");
        assert!(client.input(&bogus).is_err());
    }

    #[test]
    fn out_of_order_messages_refused() {
        let mut server = SshSession::new(Role::Server);
        server.remote_version("SSH-2.0-x");
        assert!(server.input(&[MSG_NEWKEYS]).is_err());
    }
}
