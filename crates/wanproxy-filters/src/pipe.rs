//! Pipe framing around the dedup codec: the encode/decode filter pair and
//! the in-band protocol that lets two peers converge on a shared
//! dictionary while streaming.
//!
//! Each direction opens with `HELLO` (cache identity + nominal size), then
//! carries `FRAME`-wrapped codec output. A decoder that hits a reference
//! it cannot resolve records the hash, stops feeding frames and sends
//! `ASK` back through the opposite chain; the peer answers with `LEARN`
//! and the frames drain. `EOS`/`EOS_ACK` close each direction only after
//! every frame is decoded and every outstanding `ASK` is answered.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

use wanproxy_core::cache::{CacheResolver, SegmentCache};
use wanproxy_core::wire::{
    HELLO_LENGTH, MAX_FRAME, PIPE_OP_ASK, PIPE_OP_EOS, PIPE_OP_EOS_ACK, PIPE_OP_FRAME,
    PIPE_OP_HELLO, PIPE_OP_LEARN, SEGMENT_LENGTH, UUID_STRING_SIZE,
};
use wanproxy_core::{Decoder, Encoder, RollingHash, SharedCache};

use crate::chain::{Effects, Filter, Flags, ALGORITHM_NEGOTIATED, EOS_ACK_FLUSH};
use crate::FilterError;

// ── Encode ───────────────────────────────────────────────────────────────────

/// Encodes a stream and frames it for the peer. Holds its final flush
/// until the peer has acknowledged our `EOS`.
pub struct EncodeFilter {
    cache: SharedCache,
    encoder: Option<Encoder>,
    flushing: bool,
    flush_flags: Flags,
    sent_eos: bool,
    eos_acked: bool,
}

impl EncodeFilter {
    pub fn new(cache: SharedCache) -> Self {
        Self {
            cache,
            encoder: None,
            flushing: false,
            flush_flags: 0,
            sent_eos: false,
            eos_acked: false,
        }
    }

    fn hello(&self, out: &mut BytesMut) {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let identity = cache.identity().clone();
        drop(cache);

        out.put_u8(PIPE_OP_HELLO);
        out.put_u8(HELLO_LENGTH as u8);
        let uuid = identity.uuid.to_string();
        debug_assert_eq!(uuid.len(), UUID_STRING_SIZE);
        out.put_slice(uuid.as_bytes());
        out.put_u64(identity.size_mb);
    }
}

impl Filter for EncodeFilter {
    fn consume(&mut self, buf: BytesMut, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        let mut output = BytesMut::new();

        if self.encoder.is_none() {
            self.hello(&mut output);
            self.encoder = Some(Encoder::new(self.cache.clone()));
        }

        let mut encoded = BytesMut::new();
        self.encoder
            .as_mut()
            .expect("encoder installed above")
            .encode(&buf, &mut encoded);

        while !encoded.is_empty() {
            let n = encoded.len().min(MAX_FRAME);
            let frame = encoded.split_to(n);
            output.put_u8(PIPE_OP_FRAME);
            output.put_u16(n as u16);
            output.extend_from_slice(&frame);
        }

        fx.data(output, flags);
        Ok(())
    }

    fn flush(&mut self, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        if flags & EOS_ACK_FLUSH != 0 {
            self.eos_acked = true;
        } else {
            self.flushing = true;
            self.flush_flags |= flags;
            if !self.sent_eos {
                let mut out = BytesMut::new();
                out.put_u8(PIPE_OP_EOS);
                fx.data(out, 0);
                self.sent_eos = true;
            }
        }
        if self.flushing && self.eos_acked {
            fx.forward_flush(self.flush_flags);
        }
        Ok(())
    }
}

// ── Decode ───────────────────────────────────────────────────────────────────

/// Decodes framed peer traffic and answers the dictionary-synchronisation
/// opcodes. Control traffic back to the peer (`ASK`, `LEARN`, `EOS_ACK`)
/// rides the opposite chain through the linked [`EncodeFilter`].
pub struct DecodeFilter {
    /// Resolves the peer's `HELLO` identity to a cache.
    resolver: Arc<dyn CacheResolver>,
    /// Our own side's cache, answering the peer's `ASK`s.
    encoder_cache: SharedCache,

    decoder_cache: Option<SharedCache>,
    decoder: Option<Decoder>,

    pending: BytesMut,
    frame_buffer: BytesMut,
    unknown: BTreeSet<u64>,

    received_eos: bool,
    received_eos_ack: bool,
    sent_eos_ack: bool,
    upflushed: bool,
    flushing: bool,
    flush_flags: Flags,
}

impl DecodeFilter {
    pub fn new(resolver: Arc<dyn CacheResolver>, encoder_cache: SharedCache) -> Self {
        Self {
            resolver,
            encoder_cache,
            decoder_cache: None,
            decoder: None,
            pending: BytesMut::new(),
            frame_buffer: BytesMut::new(),
            unknown: BTreeSet::new(),
            received_eos: false,
            received_eos_ack: false,
            sent_eos_ack: false,
            upflushed: false,
            flushing: false,
            flush_flags: 0,
        }
    }

    /// Handle one pipe opcode from the front of `pending`. Returns false
    /// when more bytes are needed.
    fn step(&mut self, fx: &mut Effects) -> Result<bool, FilterError> {
        let op = self.pending[0];
        match op {
            PIPE_OP_HELLO => {
                if self.decoder_cache.is_some() {
                    return Err(FilterError::Pipe("duplicate HELLO"));
                }
                if self.pending.len() < 2 {
                    return Ok(false);
                }
                let len = self.pending[1] as usize;
                if len != HELLO_LENGTH {
                    return Err(FilterError::Pipe("unsupported HELLO length"));
                }
                if self.pending.len() < 2 + len {
                    return Ok(false);
                }

                let uuid_text = std::str::from_utf8(&self.pending[2..2 + UUID_STRING_SIZE])
                    .map_err(|_| FilterError::Pipe("invalid UUID in HELLO"))?;
                let uuid: uuid::Uuid = uuid_text
                    .parse()
                    .map_err(|_| FilterError::Pipe("invalid UUID in HELLO"))?;
                let size_mb = u64::from_be_bytes(
                    self.pending[2 + UUID_STRING_SIZE..2 + len]
                        .try_into()
                        .expect("length checked"),
                );
                self.pending.advance(2 + len);

                let cache = self
                    .resolver
                    .find_or_add(uuid, size_mb)
                    .ok_or(FilterError::Pipe("peer cache unavailable"))?;
                self.decoder = Some(Decoder::new(cache.clone()));
                self.decoder_cache = Some(cache);
                tracing::debug!(peer = %uuid, size_mb, "peer connected");
            }

            PIPE_OP_ASK => {
                if self.pending.len() < 1 + 8 {
                    return Ok(false);
                }
                let hash = u64::from_be_bytes(
                    self.pending[1..9].try_into().expect("length checked"),
                );
                self.pending.advance(1 + 8);

                let segment = {
                    let mut cache = self.encoder_cache.lock().unwrap_or_else(|e| e.into_inner());
                    cache.lookup(hash)
                };
                match segment {
                    Some(segment) => {
                        tracing::debug!(hash = %format_args!("{hash:#018x}"), "answering ASK with LEARN");
                        let mut learn = BytesMut::with_capacity(1 + SEGMENT_LENGTH);
                        learn.put_u8(PIPE_OP_LEARN);
                        learn.put_slice(&segment);
                        fx.peer_produce(learn);
                    }
                    None => return Err(FilterError::Pipe("unknown hash in ASK")),
                }
            }

            PIPE_OP_LEARN => {
                let cache = self
                    .decoder_cache
                    .as_ref()
                    .ok_or(FilterError::Pipe("LEARN before HELLO"))?
                    .clone();
                if self.pending.len() < 1 + SEGMENT_LENGTH {
                    return Ok(false);
                }
                let segment: wanproxy_core::Segment = self.pending[1..1 + SEGMENT_LENGTH]
                    .try_into()
                    .expect("length checked");
                let hash = RollingHash::digest(&segment);
                if !self.unknown.remove(&hash) {
                    tracing::info!(hash = %format_args!("{hash:#018x}"), "gratuitous LEARN without ASK");
                }

                let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
                match cache.lookup(hash) {
                    Some(stored) if stored == segment => {
                        tracing::debug!("redundant LEARN");
                    }
                    Some(_) => {
                        return Err(FilterError::Codec(
                            wanproxy_core::CodecError::Collision { hash },
                        ))
                    }
                    None => cache.insert(hash, &segment),
                }
                self.pending.advance(1 + SEGMENT_LENGTH);
            }

            PIPE_OP_EOS => {
                if self.received_eos {
                    return Err(FilterError::Pipe("duplicate EOS"));
                }
                self.pending.advance(1);
                self.received_eos = true;
            }

            PIPE_OP_EOS_ACK => {
                if self.received_eos_ack {
                    return Err(FilterError::Pipe("duplicate EOS_ACK"));
                }
                self.pending.advance(1);
                self.received_eos_ack = true;
            }

            PIPE_OP_FRAME => {
                if self.decoder.is_none() {
                    return Err(FilterError::Pipe("FRAME before HELLO"));
                }
                if self.pending.len() < 1 + 2 {
                    return Ok(false);
                }
                let len = u16::from_be_bytes(
                    self.pending[1..3].try_into().expect("length checked"),
                ) as usize;
                if len == 0 || len > MAX_FRAME {
                    return Err(FilterError::Pipe("invalid frame length"));
                }
                if self.pending.len() < 3 + len {
                    return Ok(false);
                }
                self.pending.advance(3);
                let frame = self.pending.split_to(len);
                self.frame_buffer.extend_from_slice(&frame);
            }

            _ => return Err(FilterError::Pipe("unsupported pipe opcode")),
        }

        Ok(true)
    }

    /// Feed buffered frames to the decoder when no hash is outstanding,
    /// producing decoded output and any new `ASK`s.
    fn drain_frames(&mut self, fx: &mut Effects) -> Result<(), FilterError> {
        if self.frame_buffer.is_empty() || !self.unknown.is_empty() {
            return Ok(());
        }

        let decoder = self.decoder.as_mut().expect("frames only buffered after HELLO");
        let mut output = BytesMut::new();
        decoder.decode(&mut self.frame_buffer, &mut output, &mut self.unknown)?;

        if !output.is_empty() {
            fx.data(output, 0);
        }

        if !self.unknown.is_empty() {
            let mut ask = BytesMut::with_capacity(self.unknown.len() * 9);
            for &hash in self.unknown.iter() {
                ask.put_u8(PIPE_OP_ASK);
                ask.put_u64(hash);
            }
            tracing::debug!(count = self.unknown.len(), "sending ASKs");
            fx.peer_produce(ask);
        }
        Ok(())
    }
}

impl Filter for DecodeFilter {
    fn consume(&mut self, buf: BytesMut, _flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        self.pending.extend_from_slice(&buf);

        while !self.pending.is_empty() {
            if !self.step(fx)? {
                break;
            }
            self.drain_frames(fx)?;
        }

        // EOS handshake: acknowledge only once every frame is decoded and
        // every ASK answered.
        if self.received_eos
            && !self.sent_eos_ack
            && self.frame_buffer.is_empty()
            && self.unknown.is_empty()
        {
            tracing::debug!("received EOS, sending EOS_ACK");
            let mut ack = BytesMut::with_capacity(1);
            ack.put_u8(PIPE_OP_EOS_ACK);
            self.sent_eos_ack = true;
            fx.peer_produce(ack);
        }

        if self.received_eos && !self.flushing {
            if self.unknown.is_empty() {
                if !self.frame_buffer.is_empty() {
                    return Err(FilterError::Pipe("EOS with undecodable frame data"));
                }
                tracing::debug!("peer closed its direction, flushing decoder output");
                self.flushing = true;
                fx.forward_flush(self.flush_flags);
            } else {
                if self.frame_buffer.is_empty() {
                    return Err(FilterError::Pipe("EOS with unanswered ASKs and no frames"));
                }
                tracing::debug!("holding EOS until ASKs are answered");
            }
        }

        if self.sent_eos_ack && self.received_eos_ack && !self.upflushed {
            tracing::debug!("both directions acknowledged, releasing encoder flush");
            self.upflushed = true;
            fx.peer_flush(EOS_ACK_FLUSH);
        }

        Ok(())
    }

    fn flush(&mut self, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        // Our own read side ended without the peer protocol completing.
        self.flushing = true;
        self.flush_flags |= flags & !(ALGORITHM_NEGOTIATED | EOS_ACK_FLUSH);
        if !self.pending.is_empty() {
            tracing::debug!(len = self.pending.len(), "flushing decoder with data outstanding");
        }
        if !self.frame_buffer.is_empty() {
            tracing::debug!(len = self.frame_buffer.len(), "flushing decoder with frames outstanding");
        }
        if !self.upflushed {
            self.upflushed = true;
            fx.peer_flush(EOS_ACK_FLUSH);
        }
        fx.forward_flush(self.flush_flags);
        Ok(())
    }
}
