//! Block signatures: recognising recurring guest code.
//!
//! A signature pairs a reference byte pattern with a per-byte significance
//! mask (1 = must match, 0 = don't care) and a similarity threshold. Masked
//! comparison lets structurally identical code match even when relocatable
//! immediates differ, so a function copied to a new address still picks up
//! its optimised translation.
//!
//! Matching is memoised: once a query hash resolves to a signature, later
//! queries with the same hash skip the linear fuzzy pass.

#![forbid(unsafe_code)]

mod analyser;
mod db;

use std::collections::HashMap;

use tracing::debug;
use volans_hash::xxh64;

pub use analyser::static_analyse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureKind {
    Generic,
    Function,
    Loop,
    Branch,
    Simd,
    Hotspot,
}

impl SignatureKind {
    pub(crate) fn to_code(self) -> u8 {
        match self {
            SignatureKind::Generic => 0,
            SignatureKind::Function => 1,
            SignatureKind::Loop => 2,
            SignatureKind::Branch => 3,
            SignatureKind::Simd => 4,
            SignatureKind::Hotspot => 5,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => SignatureKind::Generic,
            1 => SignatureKind::Function,
            2 => SignatureKind::Loop,
            3 => SignatureKind::Branch,
            4 => SignatureKind::Simd,
            5 => SignatureKind::Hotspot,
            _ => return None,
        })
    }
}

/// Immutable once stored; created by [`SignatureEngine::create_signature`],
/// the static analyser, or loaded from a signature database file.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    /// Fingerprint of the reference bytes.
    pub hash: u64,
    pub kind: SignatureKind,
    /// Guest address the reference bytes were observed at.
    pub address: u64,
    /// The pattern itself.
    pub reference: Vec<u8>,
    /// Per-byte weights: 1 = significant, 0 = don't care.
    pub mask: Vec<u8>,
    /// Minimum weighted agreement in `[0, 1]` for a fuzzy match.
    pub similarity_threshold: f32,
}

impl Signature {
    pub fn len(&self) -> usize {
        self.reference.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reference.is_empty()
    }
}

/// Weighted agreement between two equal-length byte strings.
///
/// Counts positions where `mask` is 1 and the bytes agree, over the number
/// of positions where `mask` is 1. Length disagreement or an all-zero mask
/// is 0.0 by convention.
pub fn compare_with_mask(a: &[u8], b: &[u8], mask: &[u8]) -> f32 {
    if a.len() != b.len() || a.len() != mask.len() {
        return 0.0;
    }

    let mut matches = 0usize;
    let mut total = 0usize;
    for ((&x, &y), &weight) in a.iter().zip(b).zip(mask) {
        if weight == 1 {
            total += 1;
            if x == y {
                matches += 1;
            }
        }
    }

    if total > 0 {
        matches as f32 / total as f32
    } else {
        0.0
    }
}

/// Derive a mask from byte-equal-length variants of the same code: 1 where
/// all variants agree, 0 where any differs.
///
/// Fewer than two variants or unequal lengths give an all-zero mask, the
/// signal that no reliable pattern exists.
pub fn generate_mask(variants: &[Vec<u8>]) -> Vec<u8> {
    let Some(reference) = variants.first() else {
        return Vec::new();
    };
    if variants.len() < 2 || variants.iter().any(|v| v.len() != reference.len()) {
        return vec![0; reference.len()];
    }

    let mut mask = vec![1u8; reference.len()];
    for variant in &variants[1..] {
        for (slot, (&r, &v)) in mask.iter_mut().zip(reference.iter().zip(variant)) {
            if r != v {
                *slot = 0;
            }
        }
    }
    mask
}

#[derive(Debug, Default)]
pub struct SignatureEngine {
    db: HashMap<u64, Signature>,
    match_cache: HashMap<u64, u64>,
}

impl SignatureEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_signature(
        code: &[u8],
        kind: SignatureKind,
        address: u64,
        mask: Vec<u8>,
        similarity_threshold: f32,
    ) -> Signature {
        Signature {
            hash: xxh64(code, 0),
            kind,
            address,
            reference: code.to_vec(),
            mask,
            similarity_threshold,
        }
    }

    pub fn add(&mut self, signature: Signature) {
        self.db.insert(signature.hash, signature);
    }

    pub fn bulk_add(&mut self, signatures: impl IntoIterator<Item = Signature>) {
        for signature in signatures {
            self.add(signature);
        }
    }

    /// Find the signature matching `code`: memoised result first, then an
    /// exact hash hit, then a linear fuzzy pass over equal-length signatures.
    pub fn find_match(&mut self, code: &[u8]) -> Option<&Signature> {
        let hash = xxh64(code, 0);

        if let Some(&matched) = self.match_cache.get(&hash) {
            if self.db.contains_key(&matched) {
                return self.db.get(&matched);
            }
        }

        if self.db.contains_key(&hash) {
            return self.db.get(&hash);
        }

        let fuzzy = self
            .db
            .values()
            .find(|sig| {
                sig.reference.len() == code.len()
                    && compare_with_mask(code, &sig.reference, &sig.mask)
                        >= sig.similarity_threshold
            })
            .map(|sig| sig.hash);

        if let Some(matched) = fuzzy {
            debug!(
                query = format_args!("{hash:#018x}"),
                matched = format_args!("{matched:#018x}"),
                "fuzzy signature match"
            );
            self.match_cache.insert(hash, matched);
            return self.db.get(&matched);
        }

        None
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    pub fn clear(&mut self) {
        self.db.clear();
        self.match_cache.clear();
    }

    pub fn kind_counts(&self) -> HashMap<SignatureKind, usize> {
        let mut counts = HashMap::new();
        for sig in self.db.values() {
            *counts.entry(sig.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn signatures(&self) -> impl Iterator<Item = &Signature> {
        self.db.values()
    }

    /// Save the database to `path` (see [`db`] for the format).
    pub fn save(&self, path: &std::path::Path) -> Result<(), SigDbError> {
        db::save(path, self.db.values())
    }

    /// Load signatures from `path` into the database, replacing entries with
    /// the same hash. Returns how many records were read.
    pub fn load(&mut self, path: &std::path::Path) -> Result<usize, SigDbError> {
        let signatures = db::load(path)?;
        let count = signatures.len();
        self.bulk_add(signatures);
        Ok(count)
    }
}

pub use db::SigDbError;

/// Discover recurring byte patterns across `blocks`.
///
/// For every contiguous substring of length `16..=len/2` of each block,
/// exact occurrences in the *other* blocks are counted; three or more
/// occurrences form a generic signature with threshold 0.9 and a mask
/// derived from the variants. Quadratic in both block count and length, so
/// this runs at binary load time only.
pub fn identify_patterns(blocks: &[Vec<u8>], addresses: &[u64]) -> Vec<Signature> {
    const MIN_PATTERN_LEN: usize = 16;
    const MIN_OCCURRENCES: usize = 3;
    const PATTERN_THRESHOLD: f32 = 0.9;

    let mut patterns = Vec::new();

    for (i, block) in blocks.iter().enumerate() {
        for pattern_len in MIN_PATTERN_LEN..=block.len() / 2 {
            for start in 0..=block.len() - pattern_len {
                let candidate = &block[start..start + pattern_len];

                let mut occurrences = vec![candidate.to_vec()];
                for (j, other) in blocks.iter().enumerate() {
                    if i == j || other.len() < pattern_len {
                        continue;
                    }
                    for other_start in 0..=other.len() - pattern_len {
                        let window = &other[other_start..other_start + pattern_len];
                        if window == candidate {
                            occurrences.push(window.to_vec());
                        }
                    }
                }

                if occurrences.len() >= MIN_OCCURRENCES {
                    let mask = generate_mask(&occurrences);
                    patterns.push(SignatureEngine::create_signature(
                        candidate,
                        SignatureKind::Generic,
                        addresses[i] + start as u64,
                        mask,
                        PATTERN_THRESHOLD,
                    ));
                }
            }
        }
    }

    patterns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_blocks_fully_agree() {
        let a = vec![1u8, 2, 3, 4];
        let mask = vec![1u8; 4];
        assert_eq!(compare_with_mask(&a, &a, &mask), 1.0);
    }

    #[test]
    fn all_zero_mask_compares_to_zero() {
        let a = vec![1u8, 2, 3, 4];
        let b = vec![9u8, 9, 9, 9];
        let mask = vec![0u8; 4];
        assert_eq!(compare_with_mask(&a, &b, &mask), 0.0);
        // Even for identical inputs: no significant positions, no agreement.
        assert_eq!(compare_with_mask(&a, &a, &mask), 0.0);
    }

    #[test]
    fn length_mismatch_compares_to_zero() {
        assert_eq!(compare_with_mask(&[1, 2], &[1, 2, 3], &[1, 1]), 0.0);
        assert_eq!(compare_with_mask(&[1, 2], &[1, 2], &[1]), 0.0);
    }

    #[test]
    fn partial_agreement_is_fractional() {
        let a = [1u8, 2, 3, 4];
        let b = [1u8, 2, 9, 9];
        let mask = [1u8, 1, 1, 1];
        assert_eq!(compare_with_mask(&a, &b, &mask), 0.5);
        // Masking out the disagreeing half restores full agreement.
        let masked = [1u8, 1, 0, 0];
        assert_eq!(compare_with_mask(&a, &b, &masked), 1.0);
    }

    #[test]
    fn mask_generation_zeroes_disagreements() {
        let variants = vec![vec![1u8, 2, 3, 4], vec![1u8, 2, 9, 4], vec![1u8, 2, 7, 4]];
        assert_eq!(generate_mask(&variants), vec![1, 1, 0, 1]);
    }

    #[test]
    fn mask_generation_rejects_unequal_lengths() {
        let variants = vec![vec![1u8, 2, 3, 4], vec![1u8, 2, 3]];
        assert_eq!(generate_mask(&variants), vec![0, 0, 0, 0]);
    }

    #[test]
    fn mask_generation_needs_two_variants() {
        assert_eq!(generate_mask(&[vec![5u8, 6]]), vec![0, 0]);
        assert!(generate_mask(&[]).is_empty());
    }

    #[test]
    fn exact_hash_match_wins() {
        let mut engine = SignatureEngine::new();
        let code = [0x55u8, 0x48, 0x89, 0xE5];
        let sig =
            SignatureEngine::create_signature(&code, SignatureKind::Function, 0x1000, vec![1; 4], 0.85);
        let hash = sig.hash;
        engine.add(sig);

        let found = engine.find_match(&code).expect("exact match");
        assert_eq!(found.hash, hash);
        assert_eq!(found.kind, SignatureKind::Function);
    }

    #[test]
    fn fuzzy_match_respects_threshold() {
        let mut engine = SignatureEngine::new();
        // Bytes 0-7 significant, 8-15 free.
        let reference: Vec<u8> = (0u8..16).collect();
        let mut mask = vec![1u8; 8];
        mask.extend(vec![0u8; 8]);
        engine.add(Signature {
            hash: xxh64(&reference, 0),
            kind: SignatureKind::Generic,
            address: 0x2000,
            reference: reference.clone(),
            mask,
            similarity_threshold: 0.75,
        });

        // Agrees on the significant half, differs on the rest.
        let mut query = reference.clone();
        for byte in &mut query[8..] {
            *byte = byte.wrapping_add(0x40);
        }
        let found = engine.find_match(&query).expect("fuzzy match");
        assert_eq!(found.address, 0x2000);

        // Disagreement inside the significant half sinks the score to 0.
        let mut miss = reference;
        for byte in &mut miss[..8] {
            *byte = byte.wrapping_add(1);
        }
        assert!(engine.find_match(&miss).is_none());
    }

    #[test]
    fn fuzzy_match_skips_other_lengths() {
        let mut engine = SignatureEngine::new();
        let reference = vec![0xAAu8; 16];
        engine.add(Signature {
            hash: xxh64(&reference, 0),
            kind: SignatureKind::Generic,
            address: 0,
            reference,
            mask: vec![0u8; 16],
            similarity_threshold: 0.0,
        });
        // Same leading bytes, different length: never considered. (With a
        // zero threshold a same-length query would match trivially.)
        assert!(engine.find_match(&[0xAAu8; 15]).is_none());
    }

    #[test]
    fn match_is_memoised() {
        let mut engine = SignatureEngine::new();
        let reference: Vec<u8> = (0u8..16).collect();
        let sig = Signature {
            hash: xxh64(&reference, 0),
            kind: SignatureKind::Generic,
            address: 0x3000,
            reference: reference.clone(),
            mask: vec![1u8; 16],
            similarity_threshold: 0.5,
        };
        engine.add(sig);

        let mut query = reference;
        query[15] ^= 0xFF;
        let first = engine.find_match(&query).expect("fuzzy").hash;
        assert_eq!(engine.match_cache.len(), 1);
        let second = engine.find_match(&query).expect("memoised").hash;
        assert_eq!(first, second);
    }

    #[test]
    fn pattern_discovery_needs_three_occurrences() {
        let shared: Vec<u8> = (0u8..20).collect();
        let mut a = vec![0xCCu8; 4];
        a.extend(&shared);
        a.extend(vec![0xCCu8; 16]);
        let mut b = vec![0xDDu8; 8];
        b.extend(&shared);
        b.extend(vec![0xDDu8; 12]);
        let mut c = vec![0xEEu8; 2];
        c.extend(&shared);
        c.extend(vec![0xEEu8; 18]);

        let found = identify_patterns(&[a, b, c], &[0x1000, 0x2000, 0x3000]);
        assert!(
            found.iter().any(|sig| sig.reference == shared),
            "shared 20-byte run not discovered"
        );
        for sig in &found {
            assert_eq!(sig.kind, SignatureKind::Generic);
            assert_eq!(sig.similarity_threshold, 0.9);
        }

        // Two blocks only: the run occurs twice, below the threshold.
        let mut d = vec![0xCCu8; 4];
        d.extend(&shared);
        d.extend(vec![0xCCu8; 16]);
        let mut e = vec![0xDDu8; 8];
        e.extend(&shared);
        e.extend(vec![0xDDu8; 12]);
        let found = identify_patterns(&[d, e], &[0x1000, 0x2000]);
        assert!(found.iter().all(|sig| sig.reference != shared));
    }

    #[test]
    fn pattern_discovery_ignores_short_blocks() {
        // len/2 < 16: no candidate lengths at all.
        let blocks = vec![vec![0u8; 30], vec![0u8; 30], vec![0u8; 30]];
        assert!(identify_patterns(&blocks, &[0, 0x100, 0x200]).is_empty());
    }
}
