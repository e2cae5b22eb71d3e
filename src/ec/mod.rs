//! Erasure coding: per-bucket data protection
//!
//! EC is configured per bucket (see `EcConf`): objects at or below the
//! size limit are replicated 1 + parity times; larger objects are split
//! into `data` slices plus `parity` parity slices. All slices are the same
//! size, the last one zero-padded.
//!
//! Placement follows the HRW target list: the first target (the "main")
//! keeps the full object, the next targets keep one replica or slice
//! each - all on distinct targets. Every slice and replica has a metadata
//! sidecar in the same mountpath; the sidecar alone proves the object
//! existed at a given version.
//!
//! Local layout inside a mountpath:
//!
//! ```text
//! obj/  - main object and full replicas
//! ec/   - data and parity slices
//! meta/ - metadata sidecars
//! ```

pub mod codec;
pub mod engine;

pub use codec::Codec;
pub use engine::{EcEngine, EcPeers, HttpEcPeers, MemEcPeers};

use crate::cluster::Bck;
use crate::config::EcTuneConf;
use crate::fs::{ContentType, TargetStore};
use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Response/request header carrying base64(JSON) metadata
pub const HEADER_EC_META: &str = "x-ec-meta";

// =============================================================================
// Metadata sidecar
// =============================================================================

/// EC information stored in a metafile beside every replica and slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Size of the original object (slices together exceed it)
    pub size: i64,
    /// Checksum of the original object
    #[serde(rename = "obj_chk")]
    pub obj_cksum: String,
    #[serde(rename = "obj_version", default, skip_serializing_if = "String::is_empty")]
    pub obj_version: String,
    /// Slice checksum type
    #[serde(rename = "slice_ck_type", default, skip_serializing_if = "String::is_empty")]
    pub cksum_type: String,
    /// Checksum of this slice
    #[serde(rename = "slice_chk_value", default, skip_serializing_if = "String::is_empty")]
    pub cksum_value: String,
    /// Number of data slices
    pub data: usize,
    /// Number of parity slices
    pub parity: usize,
    /// 0 for a full replica, 1..=data+parity for slices
    #[serde(rename = "sliceid", default, skip_serializing_if = "is_zero")]
    pub slice_id: usize,
    /// Replicated (true) or erasure-encoded (false)
    #[serde(rename = "copy")]
    pub is_copy: bool,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl Metadata {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(b: &[u8]) -> Result<Metadata> {
        Ok(serde_json::from_slice(b)?)
    }

    /// Header-field encoding for HEAD responses
    pub fn to_base64(&self) -> Result<String> {
        Ok(data_encoding::BASE64.encode(&self.to_json()?))
    }

    pub fn from_base64(s: &str) -> Result<Metadata> {
        let raw = data_encoding::BASE64
            .decode(s.as_bytes())
            .map_err(|e| Error::Ec(format!("bad metadata encoding: {e}")))?;
        Metadata::from_json(&raw)
    }
}

/// Size of one slice for an object of `size` bytes split `data` ways
pub fn slice_size(size: i64, data: usize) -> i64 {
    (size + data as i64 - 1) / data as i64
}

// =============================================================================
// Inbound staging buffer
// =============================================================================

/// Staging buffer for an inbound object of known size: memory by default,
/// a temp file when the object is large and memory pressure is high
pub enum ObjBuffer {
    Mem(Vec<u8>),
    File { file: fs::File, path: tempfile::TempPath, size: i64 },
}

impl ObjBuffer {
    /// Pick memory or disk staging for an object of `size` bytes
    pub fn new(size: i64, tune: &EcTuneConf) -> Result<ObjBuffer> {
        if size > tune.obj_size_high_mem {
            let file = tempfile::NamedTempFile::new()?;
            let (file, path) = file.into_parts();
            Ok(ObjBuffer::File { file, path, size: 0 })
        } else {
            Ok(ObjBuffer::Mem(Vec::with_capacity(size.max(0) as usize)))
        }
    }

    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        match self {
            ObjBuffer::Mem(buf) => buf.extend_from_slice(chunk),
            ObjBuffer::File { file, size, .. } => {
                file.write_all(chunk)?;
                *size += chunk.len() as i64;
            }
        }
        Ok(())
    }

    /// Materialize the staged bytes for encoding
    pub fn into_bytes(self) -> Result<Bytes> {
        match self {
            ObjBuffer::Mem(buf) => Ok(Bytes::from(buf)),
            ObjBuffer::File { path, .. } => {
                let data = fs::read(&path)?;
                Ok(Bytes::from(data))
                // temp file removed on path drop
            }
        }
    }
}

// =============================================================================
// Local part storage (used by the engine and by receive-side handlers)
// =============================================================================

/// Write a replica or slice plus its metadata sidecar, co-located on the
/// same mountpath; the pair is removed together
pub fn store_part(
    store: &TargetStore,
    bck: &Bck,
    obj_name: &str,
    meta: &Metadata,
    data: &[u8],
) -> Result<()> {
    let uname = bck.make_uname(obj_name);
    let mpath = store.mpaths().hrw_mpath(&uname)?;
    let ct = if meta.slice_id == 0 {
        ContentType::Object
    } else {
        ContentType::Slice
    };
    let data_fqn = mpath.make_fqn(ct, bck, obj_name);
    if let Some(dir) = data_fqn.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(&data_fqn, data)?;
    write_meta(store, bck, obj_name, meta)?;
    Ok(())
}

pub fn write_meta(store: &TargetStore, bck: &Bck, obj_name: &str, meta: &Metadata) -> Result<()> {
    let uname = bck.make_uname(obj_name);
    let mpath = store.mpaths().hrw_mpath(&uname)?;
    let meta_fqn = mpath.make_fqn(ContentType::Meta, bck, obj_name);
    if let Some(dir) = meta_fqn.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(&meta_fqn, meta.to_json()?)?;
    Ok(())
}

/// Load the local metadata sidecar, if present
pub fn load_meta(store: &TargetStore, bck: &Bck, obj_name: &str) -> Result<Option<Metadata>> {
    let uname = bck.make_uname(obj_name);
    let mpath = store.mpaths().hrw_mpath(&uname)?;
    let meta_fqn = mpath.make_fqn(ContentType::Meta, bck, obj_name);
    match fs::read(&meta_fqn) {
        Ok(buf) => Ok(Some(Metadata::from_json(&buf)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Load the local replica or slice together with its sidecar
pub fn load_part(
    store: &TargetStore,
    bck: &Bck,
    obj_name: &str,
) -> Result<Option<(Metadata, Bytes)>> {
    let Some(meta) = load_meta(store, bck, obj_name)? else {
        return Ok(None);
    };
    let uname = bck.make_uname(obj_name);
    let mpath = store.mpaths().hrw_mpath(&uname)?;
    let ct = if meta.slice_id == 0 {
        ContentType::Object
    } else {
        ContentType::Slice
    };
    match fs::read(mpath.make_fqn(ct, bck, obj_name)) {
        Ok(data) => Ok(Some((meta, Bytes::from(data)))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove slice/replica data and the sidecar, atomically as a pair
pub fn delete_parts(store: &TargetStore, bck: &Bck, obj_name: &str) -> Result<()> {
    let uname = bck.make_uname(obj_name);
    let mpath = store.mpaths().hrw_mpath(&uname)?;
    let paths: [PathBuf; 4] = [
        mpath.make_fqn(ContentType::Object, bck, obj_name),
        mpath.make_fqn(ContentType::Slice, bck, obj_name),
        mpath.make_fqn(ContentType::Meta, bck, obj_name),
        mpath.make_fqn(ContentType::Attr, bck, obj_name),
    ];
    for p in paths {
        if let Err(e) = fs::remove_file(&p) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
    }
    Ok(())
}

/// Local EC namespace: object names that have a sidecar on this target
pub fn list_meta(store: &TargetStore, bck: &Bck) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for mpath in store.mpaths().get() {
        let root = mpath.make_path_bucket(ContentType::Meta, bck);
        if !root.is_dir() {
            continue;
        }
        collect_files(&root, &root, &mut names)?;
    }
    names.sort();
    names.dedup();
    Ok(names)
}

fn collect_files(root: &std::path::Path, dir: &std::path::Path, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_json_field_names() {
        let meta = Metadata {
            size: 1024,
            obj_cksum: "abc".into(),
            obj_version: "2".into(),
            cksum_type: "blake3".into(),
            cksum_value: "def".into(),
            data: 4,
            parity: 2,
            slice_id: 3,
            is_copy: false,
        };
        let json = String::from_utf8(meta.to_json().unwrap()).unwrap();
        for field in [
            "\"size\"",
            "\"obj_chk\"",
            "\"obj_version\"",
            "\"slice_ck_type\"",
            "\"slice_chk_value\"",
            "\"data\"",
            "\"parity\"",
            "\"sliceid\"",
            "\"copy\"",
        ] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
        assert_eq!(Metadata::from_json(json.as_bytes()).unwrap(), meta);
    }

    #[test]
    fn test_metadata_base64_roundtrip() {
        let meta = Metadata {
            size: 7,
            obj_cksum: "x".into(),
            data: 2,
            parity: 1,
            is_copy: true,
            ..Default::default()
        };
        let encoded = meta.to_base64().unwrap();
        assert_eq!(Metadata::from_base64(&encoded).unwrap(), meta);
        assert!(Metadata::from_base64("!!!").is_err());
    }

    #[test]
    fn test_slice_size() {
        assert_eq!(slice_size(1024 * 1024, 4), 256 * 1024);
        assert_eq!(slice_size(100, 4), 25);
        assert_eq!(slice_size(101, 4), 26);
    }

    #[test]
    fn test_obj_buffer_staging() {
        let tune = EcTuneConf {
            obj_size_high_mem: 64,
        };
        let mut mem = ObjBuffer::new(10, &tune).unwrap();
        assert!(matches!(&mem, ObjBuffer::Mem(_)));
        mem.write(b"0123456789").unwrap();
        assert_eq!(&mem.into_bytes().unwrap()[..], b"0123456789");

        let mut disk = ObjBuffer::new(1000, &tune).unwrap();
        assert!(matches!(&disk, ObjBuffer::File { .. }));
        for _ in 0..100 {
            disk.write(b"0123456789").unwrap();
        }
        assert_eq!(disk.into_bytes().unwrap().len(), 1000);
    }
}
