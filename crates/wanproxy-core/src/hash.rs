//! Rolling hash over a fixed window of [`SEGMENT_LENGTH`] bytes.
//!
//! A polynomial hash in wrapping 64-bit arithmetic: shifting one byte out
//! and one in is O(1), so the encoder can slide the window across the
//! input one byte at a time. The mixed digest is carried on the wire in
//! `REF` opcodes, so it must be byte-exact across peers — nothing here may
//! depend on platform byte order or hasher randomisation.

use crate::wire::{Segment, SEGMENT_LENGTH};

/// Polynomial base. Odd, so multiplication by it is invertible mod 2^64.
const BASE: u64 = 6364136223846793005;

/// BASE^(SEGMENT_LENGTH - 1), used to remove the outgoing byte in O(1).
const BASE_TOP: u64 = pow_wrapping(BASE, (SEGMENT_LENGTH - 1) as u32);

const fn pow_wrapping(base: u64, mut exp: u32) -> u64 {
    let mut acc = 1u64;
    let mut b = base;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = acc.wrapping_mul(b);
        }
        b = b.wrapping_mul(b);
        exp >>= 1;
    }
    acc
}

/// Finalizer: a splitmix64-style avalanche so that windows differing in a
/// single byte produce unrelated digests.
fn finalize(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

/// Incremental rolling hash with an internal window ring.
pub struct RollingHash {
    state: u64,
    window: Segment,
    cursor: usize,
    filled: usize,
}

impl RollingHash {
    pub fn new() -> Self {
        Self {
            state: 0,
            window: [0u8; SEGMENT_LENGTH],
            cursor: 0,
            filled: 0,
        }
    }

    /// Number of bytes currently in the window.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_full(&self) -> bool {
        self.filled == SEGMENT_LENGTH
    }

    /// Shift a byte in while the window is still filling.
    pub fn add(&mut self, b: u8) {
        debug_assert!(self.filled < SEGMENT_LENGTH);
        self.state = self.state.wrapping_mul(BASE).wrapping_add(b as u64);
        self.window[self.cursor] = b;
        self.cursor = (self.cursor + 1) % SEGMENT_LENGTH;
        self.filled += 1;
    }

    /// Shift the oldest byte out and a new byte in. Constant time; only
    /// valid once the window is full.
    pub fn roll(&mut self, b: u8) {
        debug_assert!(self.is_full());
        let out = self.window[self.cursor] as u64;
        self.state = self
            .state
            .wrapping_sub(out.wrapping_mul(BASE_TOP))
            .wrapping_mul(BASE)
            .wrapping_add(b as u64);
        self.window[self.cursor] = b;
        self.cursor = (self.cursor + 1) % SEGMENT_LENGTH;
    }

    /// Mix the current window state into a 64-bit digest.
    pub fn mix(&self) -> u64 {
        finalize(self.state)
    }

    /// Clear the window.
    pub fn reset(&mut self) {
        self.state = 0;
        self.cursor = 0;
        self.filled = 0;
    }

    /// One-shot digest of a whole segment. Equals the incremental value
    /// obtained by `add`ing every byte in order.
    pub fn digest(segment: &[u8]) -> u64 {
        debug_assert_eq!(segment.len(), SEGMENT_LENGTH);
        let mut state = 0u64;
        for &b in segment {
            state = state.wrapping_mul(BASE).wrapping_add(b as u64);
        }
        finalize(state)
    }
}

impl Default for RollingHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_incremental_add() {
        let seg: Vec<u8> = (0..SEGMENT_LENGTH as u32).map(|i| (i * 7 + 3) as u8).collect();
        let mut h = RollingHash::new();
        for &b in &seg {
            h.add(b);
        }
        assert!(h.is_full());
        assert_eq!(h.mix(), RollingHash::digest(&seg));
    }

    #[test]
    fn roll_matches_fresh_window() {
        // Rolling across a long buffer must agree with hashing each window
        // from scratch.
        let data: Vec<u8> = (0..SEGMENT_LENGTH * 3).map(|i| (i * 31 + 11) as u8).collect();

        let mut h = RollingHash::new();
        for &b in &data[..SEGMENT_LENGTH] {
            h.add(b);
        }
        for end in SEGMENT_LENGTH..data.len() {
            h.roll(data[end]);
            let start = end + 1 - SEGMENT_LENGTH;
            assert_eq!(
                h.mix(),
                RollingHash::digest(&data[start..=end]),
                "divergence at window ending {end}"
            );
        }
    }

    #[test]
    fn single_byte_difference_changes_digest() {
        let a = [0x55u8; SEGMENT_LENGTH];
        let mut b = a;
        b[SEGMENT_LENGTH / 2] ^= 1;
        assert_ne!(RollingHash::digest(&a), RollingHash::digest(&b));
    }

    #[test]
    fn reset_clears_state() {
        let mut h = RollingHash::new();
        for i in 0..SEGMENT_LENGTH {
            h.add(i as u8);
        }
        h.reset();
        assert_eq!(h.len(), 0);
        for i in 0..SEGMENT_LENGTH {
            h.add(i as u8);
        }
        let seg: Vec<u8> = (0..SEGMENT_LENGTH).map(|i| i as u8).collect();
        assert_eq!(h.mix(), RollingHash::digest(&seg));
    }
}
