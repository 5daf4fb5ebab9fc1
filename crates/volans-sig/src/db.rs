//! Binary on-disk format for the signature database.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! u64 magic = "VOLASIG\0"
//! u32 version = 1
//! u32 count
//! count records:
//!   u64 hash
//!   u8  kind
//!   u64 address
//!   f32 similarity_threshold (IEEE-754 bits)
//!   u32 reference_len, reference bytes
//!   u32 mask_len, mask bytes
//! ```
//!
//! Validation is strict: the file may be stale or damaged, and a rejected
//! database is simply treated as absent by callers.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::{Signature, SignatureKind};

const MAGIC: &[u8; 8] = b"VOLASIG\0";
const VERSION: u32 = 1;

/// Upper bound on a single reference/mask, against absurd allocations from
/// untrusted files.
const MAX_PATTERN_BYTES: u32 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum SigDbError {
    #[error("invalid signature database: {0}")]
    Invalid(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn save<'a>(
    path: &Path,
    signatures: impl Iterator<Item = &'a Signature>,
) -> Result<(), SigDbError> {
    let signatures: Vec<&Signature> = signatures.collect();

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(signatures.len() as u32).to_le_bytes());

    for sig in signatures {
        out.extend_from_slice(&sig.hash.to_le_bytes());
        out.push(sig.kind.to_code());
        out.extend_from_slice(&sig.address.to_le_bytes());
        out.extend_from_slice(&sig.similarity_threshold.to_bits().to_le_bytes());
        out.extend_from_slice(&(sig.reference.len() as u32).to_le_bytes());
        out.extend_from_slice(&sig.reference);
        out.extend_from_slice(&(sig.mask.len() as u32).to_le_bytes());
        out.extend_from_slice(&sig.mask);
    }

    fs::write(path, out)?;
    Ok(())
}

pub(crate) fn load(path: &Path) -> Result<Vec<Signature>, SigDbError> {
    let bytes = fs::read(path)?;
    let mut reader = Reader { bytes: &bytes, pos: 0 };

    if reader.take(8)? != MAGIC {
        return Err(SigDbError::Invalid("bad magic"));
    }
    if reader.u32()? != VERSION {
        return Err(SigDbError::Invalid("unsupported version"));
    }

    let count = reader.u32()?;
    let mut signatures = Vec::new();
    for _ in 0..count {
        let hash = reader.u64()?;
        let kind = SignatureKind::from_code(reader.u8()?)
            .ok_or(SigDbError::Invalid("unknown signature kind"))?;
        let address = reader.u64()?;
        let similarity_threshold = f32::from_bits(reader.u32()?);
        if !(0.0..=1.0).contains(&similarity_threshold) {
            return Err(SigDbError::Invalid("threshold out of range"));
        }

        let reference_len = reader.u32()?;
        if reference_len > MAX_PATTERN_BYTES {
            return Err(SigDbError::Invalid("reference too large"));
        }
        let reference = reader.take(reference_len as usize)?.to_vec();

        let mask_len = reader.u32()?;
        if mask_len > MAX_PATTERN_BYTES {
            return Err(SigDbError::Invalid("mask too large"));
        }
        let mask = reader.take(mask_len as usize)?.to_vec();

        signatures.push(Signature {
            hash,
            kind,
            address,
            reference,
            mask,
            similarity_threshold,
        });
    }

    if reader.pos != bytes.len() {
        return Err(SigDbError::Invalid("trailing bytes"));
    }

    Ok(signatures)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], SigDbError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(SigDbError::Invalid("truncated"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, SigDbError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, SigDbError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64, SigDbError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SignatureEngine;

    fn sample_engine() -> SignatureEngine {
        let mut engine = SignatureEngine::new();
        engine.add(SignatureEngine::create_signature(
            &[0x55, 0x48, 0x89, 0xE5, 0xC3],
            SignatureKind::Function,
            0x1000,
            vec![1, 1, 1, 1, 1],
            0.85,
        ));
        engine.add(SignatureEngine::create_signature(
            &[0xFF, 0xC8, 0x75, 0xFA],
            SignatureKind::Loop,
            0x2000,
            vec![1, 1, 1, 0],
            0.9,
        ));
        engine
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signatures.db");

        let engine = sample_engine();
        engine.save(&path).unwrap();

        let mut restored = SignatureEngine::new();
        assert_eq!(restored.load(&path).unwrap(), 2);
        assert_eq!(restored.len(), 2);

        let mut original: Vec<Signature> = engine.signatures().cloned().collect();
        let mut loaded: Vec<Signature> = restored.signatures().cloned().collect();
        original.sort_by_key(|s| s.hash);
        loaded.sort_by_key(|s| s.hash);
        assert_eq!(original, loaded);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signatures.db");
        fs::write(&path, b"NOTASIG\0garbage").unwrap();

        let mut engine = SignatureEngine::new();
        let err = engine.load(&path).unwrap_err();
        assert!(matches!(err, SigDbError::Invalid("bad magic")));
    }

    #[test]
    fn rejects_truncated_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signatures.db");

        sample_engine().save(&path).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 3);
        fs::write(&path, bytes).unwrap();

        let mut engine = SignatureEngine::new();
        assert!(engine.load(&path).is_err());
        assert!(engine.is_empty());
    }

    #[test]
    fn rejects_absurd_pattern_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signatures.db");

        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes()); // hash
        bytes.push(0); // kind
        bytes.extend_from_slice(&0u64.to_le_bytes()); // address
        bytes.extend_from_slice(&0.5f32.to_bits().to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes()); // reference_len
        fs::write(&path, bytes).unwrap();

        let mut engine = SignatureEngine::new();
        let err = engine.load(&path).unwrap_err();
        assert!(matches!(err, SigDbError::Invalid("reference too large")));
    }
}
