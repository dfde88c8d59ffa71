//! The SSH encrypt/decrypt filter pair.
//!
//! The decrypt filter drives the handshake: it waits for the peer's
//! identification line, feeds negotiation packets to the shared session
//! and sends replies out through its paired encrypt filter. Once both
//! sides have exchanged NEWKEYS it releases the encrypt filter with an
//! `ALGORITHM_NEGOTIATED` flush and plaintext starts to flow.
//!
//! Payload framing depends on what sits behind the pair: already-encoded
//! codec data travels tagged so the peer can tell it apart from stray
//! control payloads; raw edge traffic is carried as-is, packet boundaries
//! being meaningless to it.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Buf, BufMut, BytesMut};

use super::negotiate::{
    SshSession, BLOCK_SIZE, MAC_SIZE, MSG_KEXDH_INIT, MSG_KEXDH_REPLY, MSG_KEXINIT, MSG_NEWKEYS,
};
use super::{Role, STREAM_PACKET, VERSION_STRING};
use crate::chain::{Effects, Filter, Flags, ALGORITHM_NEGOTIATED};
use crate::FilterError;

/// Hard ceiling on a single packet; anything larger is a corrupt stream.
const MAX_PACKET: usize = 256 * 1024;

/// Plaintext carried per packet when draining buffered data.
const MAX_PAYLOAD: usize = 32 * 1024;

pub type SharedSession = Arc<Mutex<SshSession>>;

pub fn new_session(role: Role) -> SharedSession {
    Arc::new(Mutex::new(SshSession::new(role)))
}

fn lock(session: &SharedSession) -> MutexGuard<'_, SshSession> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Encrypt ──────────────────────────────────────────────────────────────────

pub struct EncryptFilter {
    session: SharedSession,
    source_encoded: bool,
    pending: BytesMut,
    negotiated: bool,
    flushing: bool,
    flush_flags: Flags,
}

impl EncryptFilter {
    pub fn new(session: SharedSession, source_encoded: bool) -> Self {
        Self {
            session,
            source_encoded,
            pending: BytesMut::new(),
            negotiated: false,
            flushing: false,
            flush_flags: 0,
        }
    }

    /// Drain buffered plaintext into packets. Only called once negotiated.
    fn drain(&mut self, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        while !self.pending.is_empty() {
            let n = self.pending.len().min(MAX_PAYLOAD);
            let chunk = self.pending.split_to(n);
            let packet = if self.source_encoded {
                // Codec data is tagged so the peer can tell it from a
                // stray control payload.
                let mut packet = BytesMut::with_capacity(1 + chunk.len());
                packet.put_u8(STREAM_PACKET);
                packet.extend_from_slice(&chunk);
                packet
            } else {
                chunk
            };
            self.produce(packet, flags, fx)?;
        }
        Ok(())
    }
}

impl Filter for EncryptFilter {
    fn start(&mut self, fx: &mut Effects) -> Result<(), FilterError> {
        // The identification line goes out before anything else.
        let mut line = BytesMut::new();
        line.put_slice(VERSION_STRING.as_bytes());
        line.put_slice(b"\r\n");
        fx.data(line, 0);
        Ok(())
    }

    fn consume(&mut self, buf: BytesMut, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        self.pending.extend_from_slice(&buf);
        if self.negotiated {
            self.drain(flags, fx)?;
        }
        Ok(())
    }

    /// Wrap one payload in an SSH binary packet: length, padding, MAC over
    /// the sequence number, cipher. Negotiation replies injected by the
    /// paired decrypt filter take this path too, which is what keeps them
    /// correctly framed before keys exist.
    fn produce(&mut self, buf: BytesMut, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        let mut session = lock(&self.session);

        let block_size = if session.tx.is_some() { BLOCK_SIZE } else { 8 };
        let payload_len = buf.len();
        let mut packet_len = (1 + payload_len) as u32;
        let padding_len =
            (4 + (block_size - ((4 + packet_len as usize + 4) % block_size))) as u8;
        packet_len += padding_len as u32;

        let mut packet = BytesMut::with_capacity(4 + packet_len as usize + MAC_SIZE);
        packet.put_u32(packet_len);
        packet.put_u8(padding_len);
        packet.extend_from_slice(&buf);
        packet.put_bytes(0, padding_len as usize);

        let sequence = session.tx_sequence;
        session.tx_sequence = session.tx_sequence.wrapping_add(1);

        let mac = session.tx.as_ref().map(|tx| tx.mac(sequence, &packet));
        if let Some(tx) = session.tx.as_mut() {
            tx.apply_keystream(&mut packet);
        }
        if let Some(mac) = mac {
            packet.extend_from_slice(&mac);
        }

        // NEWKEYS marks the key switchover for our direction.
        if buf.first() == Some(&MSG_NEWKEYS) {
            session.arm_tx();
        }
        drop(session);

        fx.data(packet, flags);
        Ok(())
    }

    fn flush(&mut self, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        if flags & ALGORITHM_NEGOTIATED != 0 {
            self.negotiated = true;
            if !self.pending.is_empty() {
                self.drain(0, fx)?;
            }
        } else {
            self.flushing = true;
            self.flush_flags |= flags;
        }
        if self.flushing && self.negotiated {
            fx.forward_flush(self.flush_flags);
        }
        Ok(())
    }
}

// ── Decrypt ──────────────────────────────────────────────────────────────────

pub struct DecryptFilter {
    session: SharedSession,
    source_encoded: bool,
    pending: BytesMut,
    identified: bool,
    /// Decrypted first block of the packet being assembled.
    first_block: Option<BytesMut>,
}

impl DecryptFilter {
    pub fn new(session: SharedSession, source_encoded: bool) -> Self {
        Self {
            session,
            source_encoded,
            pending: BytesMut::new(),
            identified: false,
            first_block: None,
        }
    }

    /// Consume identification lines until the SSH version appears.
    fn identify(&mut self, fx: &mut Effects) -> Result<(), FilterError> {
        while let Some(nl) = self.pending.iter().position(|&b| b == b'\n') {
            let line = self.pending.split_to(nl + 1);
            let line = &line[..nl];
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if !line.starts_with(b"SSH-") {
                continue;
            }
            if !line.starts_with(b"SSH-2.0") {
                return Err(FilterError::Ssh("unsupported protocol version".into()));
            }
            let text = std::str::from_utf8(line)
                .map_err(|_| FilterError::Ssh("malformed identification line".into()))?;

            let kexinit = lock(&self.session).remote_version(text);
            fx.peer_produce(BytesMut::from(&kexinit[..]));
            self.identified = true;
            return Ok(());
        }
        Ok(())
    }

    /// Parse and handle packets out of `pending`. Returns when more bytes
    /// are needed.
    fn packets(&mut self, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        loop {
            let mut session = lock(&self.session);
            let encrypted = session.rx.is_some();
            let block_size = if encrypted { BLOCK_SIZE } else { 8 };
            let mac_size = if encrypted { MAC_SIZE } else { 0 };

            if self.first_block.is_none() && self.pending.len() < block_size.max(4) {
                return Ok(());
            }

            // With a cipher live the length field is inside the first
            // encrypted block; decrypt it once and keep it.
            let packet_len = if encrypted {
                if self.first_block.is_none() {
                    if self.pending.len() < block_size {
                        return Ok(());
                    }
                    let mut block = self.pending.split_to(block_size);
                    session
                        .rx
                        .as_mut()
                        .expect("encrypted implies rx keys")
                        .apply_keystream(&mut block);
                    self.first_block = Some(block);
                }
                let block = self.first_block.as_ref().expect("set above");
                u32::from_be_bytes(block[..4].try_into().expect("block holds length")) as usize
            } else {
                u32::from_be_bytes(self.pending[..4].try_into().expect("length checked")) as usize
            };

            if packet_len == 0 || packet_len > MAX_PACKET {
                return Err(FilterError::Ssh(format!("bad packet length {packet_len}")));
            }

            // Assemble the full plaintext packet (length field included).
            let mut packet;
            if encrypted {
                let have = block_size + self.pending.len();
                if have < 4 + packet_len + mac_size {
                    return Ok(());
                }
                packet = self.first_block.take().expect("set above");
                if 4 + packet_len > block_size {
                    let mut rest = self.pending.split_to(4 + packet_len - block_size);
                    session
                        .rx
                        .as_mut()
                        .expect("encrypted implies rx keys")
                        .apply_keystream(&mut rest);
                    packet.extend_from_slice(&rest);
                }
            } else {
                if self.pending.len() < 4 + packet_len + mac_size {
                    return Ok(());
                }
                packet = self.pending.split_to(4 + packet_len);
            }

            let sequence = session.rx_sequence;
            session.rx_sequence = session.rx_sequence.wrapping_add(1);

            if mac_size > 0 {
                let received = self.pending.split_to(mac_size);
                let expected = session
                    .rx
                    .as_ref()
                    .expect("encrypted implies rx keys")
                    .mac(sequence, &packet);
                if received[..] != expected[..] {
                    return Err(FilterError::Ssh("MAC verification failed".into()));
                }
            }

            // Strip length, padding and trailing pad bytes.
            packet.advance(4);
            if packet.is_empty() {
                return Err(FilterError::Ssh("empty packet".into()));
            }
            let padding_len = packet[0] as usize;
            packet.advance(1);
            if padding_len >= packet.len() + 1 {
                return Err(FilterError::Ssh("padding exceeds packet".into()));
            }
            packet.truncate(packet.len() - padding_len);
            if packet.is_empty() {
                return Err(FilterError::Ssh("packet with no payload".into()));
            }

            let msg = packet[0];
            let in_handshake = !session.negotiated();
            if in_handshake
                && matches!(msg, MSG_KEXINIT | MSG_NEWKEYS | MSG_KEXDH_INIT | MSG_KEXDH_REPLY)
            {
                let step = session.input(&packet)?;
                drop(session);
                for reply in step.replies {
                    fx.peer_produce(BytesMut::from(&reply[..]));
                }
                if step.negotiated {
                    fx.peer_flush(ALGORITHM_NEGOTIATED);
                }
                continue;
            }
            if in_handshake {
                return Err(FilterError::Ssh(format!(
                    "data message {msg} before key agreement"
                )));
            }
            drop(session);

            // Data: untag codec payloads, pass raw ones through.
            if self.source_encoded {
                if msg != STREAM_PACKET || packet.len() == 1 {
                    return Err(FilterError::Ssh("encoded packet with wrong tag".into()));
                }
                packet.advance(1);
            }
            fx.data(packet, flags);
        }
    }
}

impl Filter for DecryptFilter {
    fn consume(&mut self, buf: BytesMut, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        self.pending.extend_from_slice(&buf);

        if !self.identified {
            self.identify(fx)?;
            if !self.identified {
                return Ok(());
            }
        }

        self.packets(flags, fx)
    }

    fn flush(&mut self, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        if !self.pending.is_empty() && self.identified {
            self.packets(0, fx)?;
        }
        fx.forward_flush(flags);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{FilterChain, PeerOp};

    /// One leg endpoint: tx chain with the encrypt filter, rx chain with
    /// the decrypt filter, both on one session.
    struct Endpoint {
        tx: FilterChain,
        rx: FilterChain,
    }

    impl Endpoint {
        fn new(role: Role, source_encoded: bool) -> Self {
            let session = new_session(role);
            let mut tx = FilterChain::new();
            let enc = tx.push(Box::new(EncryptFilter::new(session.clone(), source_encoded)));
            let mut rx = FilterChain::new();
            let dec = rx.push(Box::new(DecryptFilter::new(session, source_encoded)));
            rx.link_peer(dec, enc);
            Self { tx, rx }
        }
    }

    /// Pump wire bytes both ways until quiet, returning what each side
    /// delivered as plaintext.
    fn pump(a: &mut Endpoint, b: &mut Endpoint, mut a_to_b: Vec<BytesMut>, mut b_to_a: Vec<BytesMut>) -> (BytesMut, BytesMut) {
        let mut a_plain = BytesMut::new();
        let mut b_plain = BytesMut::new();

        while !(a_to_b.is_empty() && b_to_a.is_empty()) {
            for chunk in a_to_b.drain(..) {
                let run = b.rx.consume(chunk, 0).unwrap();
                b_plain.extend_from_slice(&run.output);
                for (idx, op) in run.peer_ops {
                    let reply = b.tx.inject(idx, op).unwrap();
                    if !reply.output.is_empty() {
                        b_to_a.push(reply.output);
                    }
                }
            }
            for chunk in b_to_a.drain(..) {
                let run = a.rx.consume(chunk, 0).unwrap();
                a_plain.extend_from_slice(&run.output);
                for (idx, op) in run.peer_ops {
                    let reply = a.tx.inject(idx, op).unwrap();
                    if !reply.output.is_empty() {
                        a_to_b.push(reply.output);
                    }
                }
            }
        }
        (a_plain, b_plain)
    }

    fn handshake(a: &mut Endpoint, b: &mut Endpoint) {
        let a_hello = a.tx.start().unwrap().output;
        let b_hello = b.tx.start().unwrap().output;
        pump(a, b, vec![a_hello], vec![b_hello]);
    }

    #[test]
    fn encoded_data_round_trips_encrypted() {
        let mut client = Endpoint::new(Role::Client, true);
        let mut server = Endpoint::new(Role::Server, true);
        handshake(&mut client, &mut server);

        let payload = b"secret codec stream bytes";
        let run = client
            .tx
            .consume(BytesMut::from(&payload[..]), 0)
            .unwrap();
        assert!(!run.output.is_empty());
        // Ciphertext must not contain the plaintext.
        assert!(!run
            .output
            .windows(payload.len())
            .any(|w| w == &payload[..]));

        let (_, plain) = pump(&mut client, &mut server, vec![run.output], vec![]);
        assert_eq!(&plain[..], &payload[..]);
    }

    #[test]
    fn raw_data_survives_the_encrypted_leg() {
        let mut client = Endpoint::new(Role::Client, false);
        let mut server = Endpoint::new(Role::Server, false);
        handshake(&mut client, &mut server);

        // Raw bytes entering an edge proxy are carried as-is.
        let payload = b"boundary-agnostic raw stream";
        let run = client.tx.consume(BytesMut::from(&payload[..]), 0).unwrap();
        let (_, plain) = pump(&mut client, &mut server, vec![run.output], vec![]);
        assert_eq!(&plain[..], &payload[..]);
    }

    #[test]
    fn data_buffered_before_negotiation_is_released() {
        let mut client = Endpoint::new(Role::Client, true);
        let mut server = Endpoint::new(Role::Server, true);

        // Queue plaintext before any handshake traffic has flowed.
        let early = client
            .tx
            .consume(BytesMut::from(&b"early bird"[..]), 0)
            .unwrap();
        assert!(early.output.is_empty(), "nothing may leave before negotiation");

        let a_hello = client.tx.start().unwrap().output;
        let b_hello = server.tx.start().unwrap().output;
        let (_, plain) = pump(&mut client, &mut server, vec![a_hello], vec![b_hello]);
        assert_eq!(&plain[..], b"early bird", "buffered data must flow after negotiation");
    }

    #[test]
    fn tampered_packet_fails_mac() {
        let mut client = Endpoint::new(Role::Client, true);
        let mut server = Endpoint::new(Role::Server, true);
        handshake(&mut client, &mut server);

        let run = client
            .tx
            .consume(BytesMut::from(&b"integrity matters"[..]), 0)
            .unwrap();
        let mut tampered = run.output;
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;

        assert!(server.rx.consume(tampered, 0).is_err());
    }

    #[test]
    fn hold_and_release_via_algorithm_negotiated_flush() {
        let session = new_session(Role::Client);
        let mut chain = FilterChain::new();
        let enc = chain.push(Box::new(EncryptFilter::new(session, true)));

        // A flush before negotiation is held.
        let run = chain.flush(crate::chain::REQUEST_CHAIN_READY).unwrap();
        assert!(!run.flushed, "flush must wait for key agreement");

        // The release signal lets it through.
        let run = chain
            .inject(enc, PeerOp::Flush(ALGORITHM_NEGOTIATED))
            .unwrap();
        assert!(run.flushed);
        assert_eq!(run.completed, crate::chain::REQUEST_CHAIN_READY);
    }
}
