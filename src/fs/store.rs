//! Local object store
//!
//! Synchronous, mountpath-aware object I/O for one target: atomic puts
//! (work file + rename), attribute records, copy tracking across
//! mountpaths, and namespace walks. Async callers wrap these in
//! `spawn_blocking`.

use crate::cluster::Bck;
use crate::fs::{ContentType, Mountpath, MpathRegistry};
use crate::{hrw, Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

// =============================================================================
// Object attributes
// =============================================================================

/// Durable per-object attributes, stored beside the data
///
/// Access time advances on client GETs only: restoration and cold pulls
/// write data without touching it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectAttrs {
    pub size: i64,
    /// Access time, nanoseconds since the UNIX epoch
    pub atime: i64,
    pub cksum_type: String,
    pub cksum_value: String,
    pub version: String,
}

impl ObjectAttrs {
    pub fn new(data: &[u8], version: impl Into<String>) -> Self {
        Self {
            size: data.len() as i64,
            atime: unix_nano_now(),
            cksum_type: "blake3".to_string(),
            cksum_value: blake3::hash(data).to_hex().to_string(),
            version: version.into(),
        }
    }
}

fn unix_nano_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

// =============================================================================
// TargetStore
// =============================================================================

/// One target's local object namespace
pub struct TargetStore {
    mpaths: Arc<MpathRegistry>,
}

impl TargetStore {
    pub fn new(mpaths: Arc<MpathRegistry>) -> Self {
        Self { mpaths }
    }

    pub fn mpaths(&self) -> &Arc<MpathRegistry> {
        &self.mpaths
    }

    /// The HRW-primary mountpath for an object
    pub fn primary_mpath(&self, bck: &Bck, obj_name: &str) -> Result<Arc<Mountpath>> {
        self.mpaths.hrw_mpath(&bck.make_uname(obj_name))
    }

    // =========================================================================
    // Put / get / delete
    // =========================================================================

    /// Store an object on its primary mountpath; returns its attributes
    ///
    /// The data lands in the work directory first and is renamed into
    /// place, so readers never observe a partial object.
    pub fn put_object(
        &self,
        bck: &Bck,
        obj_name: &str,
        data: &[u8],
        version: &str,
    ) -> Result<ObjectAttrs> {
        let mpath = self.primary_mpath(bck, obj_name)?;
        let attrs = ObjectAttrs::new(data, version);
        self.write_content(&mpath, bck, obj_name, data)?;
        self.save_attrs(&mpath, bck, obj_name, &attrs)?;
        debug!("put {}/{} ({} B)", bck, obj_name, data.len());
        Ok(attrs)
    }

    /// Read an object and advance its access time
    ///
    /// On a checksum mismatch the object is restored from a surviving
    /// mirror copy when one exists; otherwise the mismatch is surfaced.
    pub fn get_object(&self, bck: &Bck, obj_name: &str) -> Result<(Bytes, ObjectAttrs)> {
        let (data, mut attrs, mpath) = self.read_validated(bck, obj_name)?;
        attrs.atime = attrs.atime.saturating_add(1).max(unix_nano_now());
        self.save_attrs(&mpath, bck, obj_name, &attrs)?;
        Ok((data, attrs))
    }

    /// Read an object without advancing its access time (internal paths:
    /// rebalance, EC encode, restoration sources)
    pub fn peek_object(&self, bck: &Bck, obj_name: &str) -> Result<(Bytes, ObjectAttrs)> {
        let (data, attrs, _) = self.read_validated(bck, obj_name)?;
        Ok((data, attrs))
    }

    /// Write restored/incoming object data with the attributes it had at
    /// the source; access time is preserved, not advanced
    pub fn put_restored(
        &self,
        bck: &Bck,
        obj_name: &str,
        data: &[u8],
        attrs: &ObjectAttrs,
    ) -> Result<()> {
        let mpath = self.primary_mpath(bck, obj_name)?;
        self.write_content(&mpath, bck, obj_name, data)?;
        self.save_attrs(&mpath, bck, obj_name, attrs)?;
        Ok(())
    }

    /// Remove the object, its copies and attribute records from every
    /// mountpath
    pub fn delete_object(&self, bck: &Bck, obj_name: &str) -> Result<()> {
        let mut found = false;
        for mpath in self.mpaths.get() {
            let fqn = mpath.make_fqn(ContentType::Object, bck, obj_name);
            match fs::remove_file(&fqn) {
                Ok(()) => found = true,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let attrs = mpath.make_fqn(ContentType::Attr, bck, obj_name);
            if let Err(e) = fs::remove_file(&attrs) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("removing attrs {}: {e}", attrs.display());
                }
            }
        }
        if !found {
            return Err(Error::ObjectDoesNotExist(bck.make_uname(obj_name)));
        }
        Ok(())
    }

    pub fn object_exists(&self, bck: &Bck, obj_name: &str) -> bool {
        self.primary_mpath(bck, obj_name)
            .map(|m| m.make_fqn(ContentType::Object, bck, obj_name).is_file())
            .unwrap_or(false)
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    pub fn load_attrs(&self, bck: &Bck, obj_name: &str) -> Result<ObjectAttrs> {
        let mpath = self.primary_mpath(bck, obj_name)?;
        let path = mpath.make_fqn(ContentType::Attr, bck, obj_name);
        let buf = fs::read(&path)
            .map_err(|_| Error::ObjectDoesNotExist(bck.make_uname(obj_name)))?;
        Ok(serde_json::from_slice(&buf)?)
    }

    fn save_attrs(
        &self,
        mpath: &Mountpath,
        bck: &Bck,
        obj_name: &str,
        attrs: &ObjectAttrs,
    ) -> Result<()> {
        let path = mpath.make_fqn(ContentType::Attr, bck, obj_name);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, serde_json::to_vec(attrs)?)?;
        Ok(())
    }

    // =========================================================================
    // Copies (mirroring support)
    // =========================================================================

    /// Number of mountpaths holding this object's data
    pub fn num_copies(&self, bck: &Bck, obj_name: &str) -> usize {
        self.mpaths
            .get()
            .iter()
            .filter(|m| m.make_fqn(ContentType::Object, bck, obj_name).is_file())
            .count()
    }

    /// Mountpaths currently holding a copy
    pub fn copy_mpaths(&self, bck: &Bck, obj_name: &str) -> Vec<Arc<Mountpath>> {
        self.mpaths
            .get()
            .into_iter()
            .filter(|m| m.make_fqn(ContentType::Object, bck, obj_name).is_file())
            .collect()
    }

    /// Create one more copy on `dst`, reusing `buf` for the transfer
    pub fn copy_object(
        &self,
        bck: &Bck,
        obj_name: &str,
        src: &Mountpath,
        dst: &Mountpath,
        buf: &mut Vec<u8>,
    ) -> Result<i64> {
        let src_fqn = src.make_fqn(ContentType::Object, bck, obj_name);
        let mut reader = fs::File::open(&src_fqn)?;
        buf.clear();
        std::io::Read::read_to_end(&mut reader, buf)?;
        self.write_content(dst, bck, obj_name, buf)?;
        Ok(buf.len() as i64)
    }

    /// Drop the copy on one mountpath; refuses to drop the HRW-primary
    pub fn remove_copy(&self, bck: &Bck, obj_name: &str, mpath: &Mountpath) -> Result<()> {
        let primary = self.primary_mpath(bck, obj_name)?;
        if primary.path == mpath.path {
            return Err(Error::Internal(format!(
                "refusing to remove the primary copy of {}/{obj_name}",
                bck
            )));
        }
        fs::remove_file(mpath.make_fqn(ContentType::Object, bck, obj_name))?;
        Ok(())
    }

    // =========================================================================
    // Namespace walks
    // =========================================================================

    /// Object names present under one mountpath for one bucket
    pub fn walk_mpath(&self, mpath: &Mountpath, bck: &Bck) -> Result<Vec<String>> {
        let root = mpath.make_path_bucket(ContentType::Object, bck);
        let mut names = Vec::new();
        if root.is_dir() {
            walk_dir(&root, &root, &mut names)?;
        }
        Ok(names)
    }

    /// Distinct object names of a bucket across all mountpaths
    pub fn walk_bucket(&self, bck: &Bck) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for mpath in self.mpaths.get() {
            names.extend(self.walk_mpath(&mpath, bck)?);
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn read_validated(
        &self,
        bck: &Bck,
        obj_name: &str,
    ) -> Result<(Bytes, ObjectAttrs, Arc<Mountpath>)> {
        let mpath = self.primary_mpath(bck, obj_name)?;
        let fqn = mpath.make_fqn(ContentType::Object, bck, obj_name);
        let data = match fs::read(&fqn) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::ObjectDoesNotExist(bck.make_uname(obj_name)))
            }
            Err(e) => return Err(e.into()),
        };
        let attrs = self.load_attrs(bck, obj_name)?;

        if attrs.cksum_type == "blake3" {
            let actual = blake3::hash(&data).to_hex().to_string();
            if actual != attrs.cksum_value {
                warn!("{bck}/{obj_name}: checksum mismatch, trying a copy");
                return self
                    .restore_from_copy(bck, obj_name, &mpath, &attrs)
                    .map(|data| (data, attrs.clone(), mpath.clone()))
                    .map_err(|_| Error::InvalidChecksum {
                        expected: attrs.cksum_value.clone(),
                        actual,
                    });
            }
        }
        Ok((Bytes::from(data), attrs, mpath))
    }

    // scan other mountpaths for a copy whose checksum matches; repair the
    // primary in place on success
    fn restore_from_copy(
        &self,
        bck: &Bck,
        obj_name: &str,
        primary: &Mountpath,
        attrs: &ObjectAttrs,
    ) -> Result<Bytes> {
        for mpath in self.mpaths.get() {
            if mpath.path == primary.path {
                continue;
            }
            let fqn = mpath.make_fqn(ContentType::Object, bck, obj_name);
            let Ok(data) = fs::read(&fqn) else { continue };
            if blake3::hash(&data).to_hex().to_string() == attrs.cksum_value {
                self.write_content(primary, bck, obj_name, &data)?;
                debug!("{bck}/{obj_name}: restored from {mpath}");
                return Ok(Bytes::from(data));
            }
        }
        Err(Error::ObjectDoesNotExist(bck.make_uname(obj_name)))
    }

    fn write_content(
        &self,
        mpath: &Mountpath,
        bck: &Bck,
        obj_name: &str,
        data: &[u8],
    ) -> Result<()> {
        let fqn = mpath.make_fqn(ContentType::Object, bck, obj_name);
        let work = work_fqn(mpath, &fqn)?;
        fs::write(&work, data)?;
        if let Some(dir) = fqn.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::rename(&work, &fqn)?;
        Ok(())
    }
}

/// Staging path for an atomic write; unique per destination
pub(crate) fn work_fqn(mpath: &Mountpath, dst: &Path) -> Result<PathBuf> {
    let dir = mpath.path.join(ContentType::Work.dir());
    fs::create_dir_all(&dir)?;
    let tag = hrw::hash64(dst.to_string_lossy().as_bytes());
    Ok(dir.join(format!("{tag:016x}")))
}

fn walk_dir(root: &Path, dir: &Path, names: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_dir(root, &path, names)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            names.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}
