//! The decoder: inverse of the encoder, resolving references through the
//! local dictionary.
//!
//! The decoder never consumes bytes it cannot fully decode: a partial
//! opcode stays in the input buffer for the next call, and a `REF` whose
//! hash is unknown pauses the stream — the hash lands in `unknown` and the
//! framing layer issues an `ASK`, resuming decode once the matching
//! `LEARN` has filled the gap.

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, BytesMut};

use crate::cache::{SegmentCache, SharedCache};
use crate::hash::RollingHash;
use crate::wire::{MAGIC, OP_ESCAPE, OP_EXTRACT, OP_REF, SEGMENT_LENGTH};
use crate::CodecError;

pub struct Decoder {
    cache: SharedCache,
}

impl Decoder {
    pub fn new(cache: SharedCache) -> Self {
        Self { cache }
    }

    /// Decode as much of `input` as possible into `output`.
    ///
    /// Returns normally both when the input was fully decoded and when it
    /// paused on a partial opcode or an unknown hash; in the latter case
    /// the undecoded tail (including the pausing `REF`) remains in
    /// `input` and the missing hash is recorded in `unknown`.
    pub fn decode(
        &mut self,
        input: &mut BytesMut,
        output: &mut BytesMut,
        unknown: &mut BTreeSet<u64>,
    ) -> Result<(), CodecError> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());

        while !input.is_empty() {
            let off = match input.iter().position(|&b| b == MAGIC) {
                Some(off) => off,
                None => {
                    output.put_slice(input);
                    input.clear();
                    break;
                }
            };

            if off > 0 {
                output.put_slice(&input[..off]);
                input.advance(off);
            }

            // Need the opcode byte as well.
            if input.len() < 2 {
                break;
            }

            let op = input[1];
            match op {
                OP_ESCAPE => {
                    output.put_u8(MAGIC);
                    input.advance(2);
                }

                OP_EXTRACT => {
                    if input.len() < 2 + SEGMENT_LENGTH {
                        break;
                    }
                    let segment: crate::wire::Segment =
                        input[2..2 + SEGMENT_LENGTH].try_into().expect("length checked");
                    let hash = RollingHash::digest(&segment);

                    match cache.lookup(hash) {
                        Some(stored) if stored == segment => {
                            tracing::debug!(
                                hash = %format_args!("{hash:#018x}"),
                                "declared segment already cached"
                            );
                        }
                        Some(_) => return Err(CodecError::Collision { hash }),
                        None => cache.insert(hash, &segment),
                    }

                    output.put_slice(&segment);
                    input.advance(2 + SEGMENT_LENGTH);
                }

                OP_REF => {
                    if input.len() < 2 + 8 {
                        break;
                    }
                    let hash = u64::from_be_bytes(input[2..10].try_into().expect("length checked"));
                    match cache.lookup(hash) {
                        Some(stored) => {
                            output.put_slice(&stored);
                            input.advance(2 + 8);
                        }
                        None => {
                            // Pause: leave the REF in place and let the
                            // framing layer ask the peer for the segment.
                            if unknown.insert(hash) {
                                tracing::debug!(
                                    hash = %format_args!("{hash:#018x}"),
                                    "unknown hash, awaiting LEARN"
                                );
                            }
                            return Ok(());
                        }
                    }
                }

                other => return Err(CodecError::UnknownOpcode(other)),
            }
        }

        Ok(())
    }
}
