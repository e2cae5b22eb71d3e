//! Persisted metadata snapshots
//!
//! Smap and BMD snapshots are written to well-known files in the node's
//! config directory as a length-prefixed, optionally LZ4-compressed,
//! checksummed JSON encoding:
//!
//! ```text
//! [magic u32][flags u8][pad u8*3][payload_len u64][checksum u64][payload]
//! ```
//!
//! All integers are big-endian. `flags` bit 0 marks an LZ4 payload (block
//! format, size-prepended). The checksum covers the payload bytes as
//! stored. On load, any length or checksum mismatch makes the file count
//! as absent: a corrupt snapshot must never be installed.

use crate::{hrw, Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Smap snapshot basename
pub const SMAP_FNAME: &str = ".ais.smap";
/// BMD snapshot basename
pub const BMD_FNAME: &str = ".ais.bmd";

const META_MAGIC: u32 = 0x5348_4f4c; // "SHOL"
const FLAG_LZ4: u8 = 1 << 0;
const PREFIX_LEN: usize = 4 + 1 + 3 + 8 + 8;

/// Encode and write a snapshot; the write is atomic (temp file + rename)
pub fn local_save<T: Serialize>(path: &Path, v: &T, compress: bool) -> Result<()> {
    let plain = serde_json::to_vec(v)?;
    let (payload, flags) = if compress {
        let compressed = lz4::block::compress(&plain, None, true)
            .map_err(|e| Error::Compression(e.to_string()))?;
        (compressed, FLAG_LZ4)
    } else {
        (plain, 0)
    };

    let mut buf = Vec::with_capacity(PREFIX_LEN + payload.len());
    buf.extend_from_slice(&META_MAGIC.to_be_bytes());
    buf.push(flags);
    buf.extend_from_slice(&[0u8; 3]);
    buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    buf.extend_from_slice(&hrw::hash64(&payload).to_be_bytes());
    buf.extend_from_slice(&payload);

    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("no parent dir for {}", path.display())))?;
    fs::create_dir_all(dir)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &buf)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read and decode a snapshot written by [`local_save`]
///
/// Corruption (bad magic, short file, length or checksum mismatch) is an
/// error; callers treat it the same as a missing file.
pub fn local_load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let buf = fs::read(path)?;
    if buf.len() < PREFIX_LEN {
        return Err(Error::Framing(format!(
            "{}: truncated prefix ({} bytes)",
            path.display(),
            buf.len()
        )));
    }
    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if magic != META_MAGIC {
        return Err(Error::Framing(format!(
            "{}: bad magic {magic:#x}",
            path.display()
        )));
    }
    let flags = buf[4];
    let payload_len = u64::from_be_bytes(buf[8..16].try_into().unwrap()) as usize;
    let expected_cksum = u64::from_be_bytes(buf[16..24].try_into().unwrap());

    let payload = &buf[PREFIX_LEN..];
    if payload.len() != payload_len {
        return Err(Error::Framing(format!(
            "{}: payload length {} != {}",
            path.display(),
            payload.len(),
            payload_len
        )));
    }
    let actual_cksum = hrw::hash64(payload);
    if actual_cksum != expected_cksum {
        return Err(Error::InvalidChecksum {
            expected: format!("{expected_cksum:x}"),
            actual: format!("{actual_cksum:x}"),
        });
    }

    let plain;
    let payload = if flags & FLAG_LZ4 != 0 {
        plain = lz4::block::decompress(payload, None)
            .map_err(|e| Error::Compression(e.to_string()))?;
        &plain[..]
    } else {
        payload
    };
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        version: i64,
        names: Vec<String>,
    }

    fn sample() -> Snapshot {
        Snapshot {
            version: 3,
            names: (0..64).map(|i| format!("bucket-{i}")).collect(),
        }
    }

    #[test]
    fn test_roundtrip_compressed_and_plain() {
        let dir = tempfile::tempdir().unwrap();
        for compress in [true, false] {
            let path = dir.path().join(format!("snap-{compress}"));
            local_save(&path, &sample(), compress).unwrap();
            let loaded: Snapshot = local_load(&path).unwrap();
            assert_eq!(loaded, sample());
        }
    }

    #[test]
    fn test_encode_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("a");
        let p2 = dir.path().join("b");
        local_save(&p1, &sample(), true).unwrap();
        local_save(&p2, &sample(), true).unwrap();
        assert_eq!(fs::read(&p1).unwrap(), fs::read(&p2).unwrap());
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap");
        local_save(&path, &sample(), true).unwrap();

        // flip 12 bytes starting at offset 10
        let mut buf = fs::read(&path).unwrap();
        for b in buf[10..22].iter_mut() {
            *b ^= 0xff;
        }
        fs::write(&path, &buf).unwrap();

        assert!(local_load::<Snapshot>(&path).is_err());
    }

    #[test]
    fn test_payload_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap");
        local_save(&path, &sample(), false).unwrap();

        let mut buf = fs::read(&path).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        fs::write(&path, &buf).unwrap();

        assert!(matches!(
            local_load::<Snapshot>(&path),
            Err(Error::InvalidChecksum { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = local_load::<Snapshot>(&dir.path().join("absent")).unwrap_err();
        assert!(err.is_obj_nought());
    }
}
