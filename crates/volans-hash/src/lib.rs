//! 64-bit content fingerprints used throughout Volans.
//!
//! Translation cache keys, binary identifiers and block signatures are all
//! derived from the same non-cryptographic fingerprint: XXH64. The whole
//! system depends on these values being stable across runs (the on-disk
//! cache stores them) and across call styles, so this crate provides both a
//! one-shot [`xxh64`] and a streaming [`Xxh64`] that agree bit-for-bit for
//! any input split.
//!
//! Multi-byte loads are little-endian regardless of host byte order.
//! Hashing cannot fail.

#![forbid(unsafe_code)]

const PRIME64_1: u64 = 0x9E37_79B1_85EB_CA87;
const PRIME64_2: u64 = 0xC2B2_AE3D_27D4_EB4F;
const PRIME64_3: u64 = 0x1656_67B1_9E37_79F9;
const PRIME64_4: u64 = 0x85EB_CA77_C2B2_AE63;
const PRIME64_5: u64 = 0x27D4_EB2F_1656_67C5;

/// Internal stripe width. Inputs at least this long go through the four-lane
/// accumulator loop; shorter ones use only the finalisation path.
const STRIPE_LEN: usize = 32;

#[inline]
fn read_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[..8].try_into().expect("8-byte slice"))
}

#[inline]
fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[..4].try_into().expect("4-byte slice"))
}

#[inline]
fn round(acc: u64, input: u64) -> u64 {
    acc.wrapping_add(input.wrapping_mul(PRIME64_2))
        .rotate_left(31)
        .wrapping_mul(PRIME64_1)
}

#[inline]
fn merge_round(acc: u64, val: u64) -> u64 {
    let val = round(0, val);
    (acc ^ val).wrapping_mul(PRIME64_1).wrapping_add(PRIME64_4)
}

#[inline]
fn avalanche(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(PRIME64_2);
    h ^= h >> 29;
    h = h.wrapping_mul(PRIME64_3);
    h ^= h >> 32;
    h
}

/// Consume the 0..=31 byte tail and apply the final avalanche.
fn finalize(mut h: u64, mut tail: &[u8]) -> u64 {
    while tail.len() >= 8 {
        h ^= round(0, read_u64(tail));
        h = h.rotate_left(27).wrapping_mul(PRIME64_1).wrapping_add(PRIME64_4);
        tail = &tail[8..];
    }
    if tail.len() >= 4 {
        h ^= u64::from(read_u32(tail)).wrapping_mul(PRIME64_1);
        h = h.rotate_left(23).wrapping_mul(PRIME64_2).wrapping_add(PRIME64_3);
        tail = &tail[4..];
    }
    for &byte in tail {
        h ^= u64::from(byte).wrapping_mul(PRIME64_5);
        h = h.rotate_left(11).wrapping_mul(PRIME64_1);
    }
    avalanche(h)
}

/// One-shot XXH64 of `input` with the given `seed`.
pub fn xxh64(input: &[u8], seed: u64) -> u64 {
    let mut h: u64;
    let mut rest = input;

    if input.len() >= STRIPE_LEN {
        let mut v1 = seed.wrapping_add(PRIME64_1).wrapping_add(PRIME64_2);
        let mut v2 = seed.wrapping_add(PRIME64_2);
        let mut v3 = seed;
        let mut v4 = seed.wrapping_sub(PRIME64_1);

        while rest.len() >= STRIPE_LEN {
            v1 = round(v1, read_u64(&rest[0..8]));
            v2 = round(v2, read_u64(&rest[8..16]));
            v3 = round(v3, read_u64(&rest[16..24]));
            v4 = round(v4, read_u64(&rest[24..32]));
            rest = &rest[STRIPE_LEN..];
        }

        h = v1
            .rotate_left(1)
            .wrapping_add(v2.rotate_left(7))
            .wrapping_add(v3.rotate_left(12))
            .wrapping_add(v4.rotate_left(18));
        h = merge_round(h, v1);
        h = merge_round(h, v2);
        h = merge_round(h, v3);
        h = merge_round(h, v4);
    } else {
        h = seed.wrapping_add(PRIME64_5);
    }

    h = h.wrapping_add(input.len() as u64);
    finalize(h, rest)
}

/// Streaming XXH64 state.
///
/// Feed bytes with [`update`](Self::update) in arbitrary chunk sizes and read
/// the fingerprint with [`digest`](Self::digest). Digesting does not consume
/// the state; it can be called mid-stream and updating can continue after.
#[derive(Debug, Clone)]
pub struct Xxh64 {
    total_len: u64,
    v1: u64,
    v2: u64,
    v3: u64,
    v4: u64,
    buf: [u8; STRIPE_LEN],
    buf_len: usize,
}

impl Xxh64 {
    pub fn new(seed: u64) -> Self {
        Self {
            total_len: 0,
            v1: seed.wrapping_add(PRIME64_1).wrapping_add(PRIME64_2),
            v2: seed.wrapping_add(PRIME64_2),
            v3: seed,
            v4: seed.wrapping_sub(PRIME64_1),
            buf: [0; STRIPE_LEN],
            buf_len: 0,
        }
    }

    /// Reset to the initial state for `seed`, discarding all buffered input.
    pub fn reset(&mut self, seed: u64) {
        *self = Self::new(seed);
    }

    pub fn update(&mut self, mut input: &[u8]) {
        if input.is_empty() {
            return;
        }
        self.total_len = self.total_len.wrapping_add(input.len() as u64);

        // Top up a partial stripe first.
        if self.buf_len > 0 {
            let want = STRIPE_LEN - self.buf_len;
            let take = want.min(input.len());
            self.buf[self.buf_len..self.buf_len + take].copy_from_slice(&input[..take]);
            self.buf_len += take;
            input = &input[take..];

            if self.buf_len == STRIPE_LEN {
                let buf = self.buf;
                self.consume_stripe(&buf);
                self.buf_len = 0;
            }
        }

        while input.len() >= STRIPE_LEN {
            let (stripe, tail) = input.split_at(STRIPE_LEN);
            let stripe: [u8; STRIPE_LEN] = stripe.try_into().expect("32-byte stripe");
            self.consume_stripe(&stripe);
            input = tail;
        }

        if !input.is_empty() {
            self.buf[..input.len()].copy_from_slice(input);
            self.buf_len = input.len();
        }
    }

    #[inline]
    fn consume_stripe(&mut self, stripe: &[u8; STRIPE_LEN]) {
        self.v1 = round(self.v1, read_u64(&stripe[0..8]));
        self.v2 = round(self.v2, read_u64(&stripe[8..16]));
        self.v3 = round(self.v3, read_u64(&stripe[16..24]));
        self.v4 = round(self.v4, read_u64(&stripe[24..32]));
    }

    /// Fingerprint of everything fed so far.
    pub fn digest(&self) -> u64 {
        let mut h = if self.total_len >= STRIPE_LEN as u64 {
            let mut acc = self
                .v1
                .rotate_left(1)
                .wrapping_add(self.v2.rotate_left(7))
                .wrapping_add(self.v3.rotate_left(12))
                .wrapping_add(self.v4.rotate_left(18));
            acc = merge_round(acc, self.v1);
            acc = merge_round(acc, self.v2);
            acc = merge_round(acc, self.v3);
            merge_round(acc, self.v4)
        } else {
            // v3 still holds the raw seed when no full stripe was consumed.
            self.v3.wrapping_add(PRIME64_5)
        };

        h = h.wrapping_add(self.total_len);
        finalize(h, &self.buf[..self.buf_len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference values from the canonical xxHash test suite.
    #[test]
    fn known_vectors() {
        assert_eq!(xxh64(b"", 0), 0xEF46_DB37_51D8_E999);
        assert_eq!(xxh64(b"abc", 0), 0x44BC_2CF5_AD77_0999);
    }

    #[test]
    fn seed_changes_fingerprint() {
        let data = b"volans translation block";
        assert_ne!(xxh64(data, 0), xxh64(data, 1));
        assert_ne!(xxh64(data, 0), xxh64(data, u64::MAX));
    }

    #[test]
    fn content_sensitivity() {
        let a = [0x90u8, 0xC3];
        let b = [0x50u8, 0xC3];
        assert_ne!(xxh64(&a, 0), xxh64(&b, 0));
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(7)).collect()
    }

    #[test]
    fn streaming_matches_one_shot_for_all_small_lengths() {
        for len in 0..=96 {
            let data = pattern(len);
            for seed in [0u64, 1, 0xDEAD_BEEF] {
                let mut state = Xxh64::new(seed);
                state.update(&data);
                assert_eq!(state.digest(), xxh64(&data, seed), "len={len} seed={seed}");
            }
        }
    }

    #[test]
    fn streaming_is_split_invariant() {
        let data = pattern(257);
        let whole = xxh64(&data, 42);
        // Chunk sizes chosen to land on and straddle stripe boundaries.
        for chunk in [1usize, 3, 7, 8, 13, 31, 32, 33, 64, 100] {
            let mut state = Xxh64::new(42);
            for piece in data.chunks(chunk) {
                state.update(piece);
            }
            assert_eq!(state.digest(), whole, "chunk={chunk}");
        }
    }

    #[test]
    fn digest_is_non_consuming() {
        let data = pattern(80);
        let mut state = Xxh64::new(0);
        state.update(&data[..50]);
        let mid = state.digest();
        assert_eq!(mid, xxh64(&data[..50], 0));
        state.update(&data[50..]);
        assert_eq!(state.digest(), xxh64(&data, 0));
    }

    #[test]
    fn empty_update_is_a_no_op() {
        let mut state = Xxh64::new(9);
        state.update(b"");
        state.update(b"abc");
        state.update(b"");
        assert_eq!(state.digest(), xxh64(b"abc", 9));
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut state = Xxh64::new(0);
        state.update(b"stale input");
        state.reset(0);
        state.update(b"abc");
        assert_eq!(state.digest(), xxh64(b"abc", 0));
    }
}
