//! The encoder: turns a byte stream into escapes, declarations and
//! references against the shared dictionary.
//!
//! One encoder exists per direction per connection and is reset on every
//! buffer — deduplication does not span a `consume` boundary, which keeps
//! the encoder stateless between calls and the framing simple.

use bytes::{BufMut, BytesMut};

use crate::cache::{SegmentCache, SharedCache};
use crate::hash::RollingHash;
use crate::wire::{MAGIC, OP_ESCAPE, OP_EXTRACT, OP_REF, SEGMENT_LENGTH};

pub struct Encoder {
    cache: SharedCache,
}

impl Encoder {
    pub fn new(cache: SharedCache) -> Self {
        Self { cache }
    }

    /// Encode `input` into `output` as a stream of `ESCAPE` / `EXTRACT` /
    /// `REF` opcodes.
    ///
    /// The algorithm slides a rolling hash across the input and keeps at
    /// most one *candidate* segment — the earliest full window whose hash
    /// missed the cache. A later window that hits the cache (with matching
    /// bytes) becomes a `REF`; a candidate that the window has moved past
    /// becomes an `EXTRACT` declaring a new dictionary entry.
    pub fn encode(&mut self, input: &[u8], output: &mut BytesMut) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let mut hasher = RollingHash::new();

        // (start offset, hash) of the pending declaration, if any.
        let mut candidate: Option<(usize, u64)> = None;
        // First input byte not yet emitted in any form.
        let mut offset = 0usize;

        for pos in 0..input.len() {
            let b = input[pos];
            if !hasher.is_full() {
                hasher.add(b);
                if !hasher.is_full() {
                    continue;
                }
            } else {
                hasher.roll(b);
            }

            // The window now covers input[end - SEGMENT_LENGTH..end].
            let end = pos + 1;
            let hash = hasher.mix();

            // A pending candidate that no longer overlaps the window can
            // be declared without disturbing the rolling state.
            if let Some((cand_off, cand_hash)) = candidate {
                if cand_off + 2 * SEGMENT_LENGTH <= end {
                    self.declare(&mut *cache, input, &mut offset, cand_off, cand_hash, output);
                    candidate = None;
                }
            }

            let window = &input[end - SEGMENT_LENGTH..end];
            match cache.lookup(hash) {
                Some(stored) => {
                    if stored[..] == *window {
                        // Everything before the window goes out escaped,
                        // then the window collapses to a reference.
                        escape(input, offset, end - SEGMENT_LENGTH, output);
                        output.put_u8(MAGIC);
                        output.put_u8(OP_REF);
                        output.put_u64(hash);
                        offset = end;
                        hasher.reset();
                        candidate = None;
                    } else {
                        // Collision: the hash is unusable here, keep rolling.
                        tracing::debug!(hash = %format_args!("{hash:#018x}"), "collision in first pass");
                    }
                }
                None => {
                    if candidate.is_none() {
                        candidate = Some((end - SEGMENT_LENGTH, hash));
                    }
                }
            }
        }

        if let Some((cand_off, cand_hash)) = candidate {
            self.declare(&mut *cache, input, &mut offset, cand_off, cand_hash, output);
        }

        if offset < input.len() {
            escape(input, offset, input.len(), output);
        }
    }

    /// Declare the candidate segment: escape anything before it, enter it
    /// into the dictionary and emit `EXTRACT` with its bytes.
    fn declare(
        &self,
        cache: &mut dyn SegmentCache,
        input: &[u8],
        offset: &mut usize,
        start: usize,
        hash: u64,
        output: &mut BytesMut,
    ) {
        if *offset < start {
            escape(input, *offset, start, output);
        }

        let segment: &crate::wire::Segment =
            input[start..start + SEGMENT_LENGTH].try_into().expect("window is segment sized");
        cache.insert(hash, segment);

        output.put_u8(MAGIC);
        output.put_u8(OP_EXTRACT);
        output.put_slice(segment);
        *offset = start + SEGMENT_LENGTH;
    }
}

/// Copy `input[offset..limit]` to the output, escaping every occurrence of
/// the magic byte.
fn escape(input: &[u8], mut offset: usize, limit: usize, output: &mut BytesMut) {
    while offset < limit {
        match input[offset..limit].iter().position(|&b| b == MAGIC) {
            Some(rel) => {
                let pos = offset + rel;
                output.put_slice(&input[offset..pos]);
                output.put_u8(MAGIC);
                output.put_u8(OP_ESCAPE);
                offset = pos + 1;
            }
            None => {
                output.put_slice(&input[offset..limit]);
                break;
            }
        }
    }
}
