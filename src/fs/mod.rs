//! Mountpaths and on-disk content layout
//!
//! A target owns one or more mountpaths, each a local filesystem root where
//! bucket data lives. Content is segregated by type inside every mountpath:
//!
//! ```text
//! <mpath>/obj/<provider>/<bucket>/<object>    - main object and its copies
//! <mpath>/ec/<provider>/<bucket>/<object>     - EC data and parity slices
//! <mpath>/meta/<provider>/<bucket>/<object>   - EC metadata sidecars
//! <mpath>/xattr/<provider>/<bucket>/<object>  - object attribute records
//! <mpath>/work/...                            - temporary staging
//! ```
//!
//! Object-to-mountpath placement uses the same HRW scheme as object-to-
//! target placement, keyed by the mountpath digest.

pub mod store;

pub use store::{ObjectAttrs, TargetStore};

use crate::{hrw, Error, Result};
use parking_lot::RwLock;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cluster::Bck;

// =============================================================================
// Content types
// =============================================================================

/// What a file under a mountpath is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Main object data (and mirror copies)
    Object,
    /// EC data/parity slice
    Slice,
    /// EC metadata sidecar
    Meta,
    /// Object attribute record (checksum, version, atime, copies)
    Attr,
    /// Temporary staging
    Work,
}

impl ContentType {
    pub fn dir(&self) -> &'static str {
        match self {
            ContentType::Object => "obj",
            ContentType::Slice => "ec",
            ContentType::Meta => "meta",
            ContentType::Attr => "xattr",
            ContentType::Work => "work",
        }
    }
}

// =============================================================================
// Mountpath
// =============================================================================

/// A local filesystem root holding bucket data
#[derive(Debug)]
pub struct Mountpath {
    pub path: PathBuf,
    digest: u64,
}

impl Mountpath {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(Error::InvalidMountpath {
                mpath: path.display().to_string(),
                cause: "does not exist or is not a directory".to_string(),
            });
        }
        let digest = hrw::hash64(path.to_string_lossy().as_bytes());
        Ok(Self { path, digest })
    }

    pub fn digest(&self) -> u64 {
        self.digest
    }

    /// `<mpath>/<content>/<provider>/<bucket>`
    pub fn make_path_bucket(&self, ct: ContentType, bck: &Bck) -> PathBuf {
        self.path
            .join(ct.dir())
            .join(bck.provider.as_str())
            .join(&bck.name)
    }

    /// Fully qualified name of one piece of content
    pub fn make_fqn(&self, ct: ContentType, bck: &Bck, obj_name: &str) -> PathBuf {
        self.make_path_bucket(ct, bck).join(obj_name)
    }
}

impl fmt::Display for Mountpath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// The target's set of mountpaths
#[derive(Default)]
pub struct MpathRegistry {
    mpaths: RwLock<Vec<Arc<Mountpath>>>,
}

impl MpathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and validate a mountpath; duplicate registration of the
    /// same path is a programming error
    pub fn add(&self, path: impl AsRef<Path>) -> Result<Arc<Mountpath>> {
        let mpath = Arc::new(Mountpath::new(path.as_ref())?);
        let mut mpaths = self.mpaths.write();
        assert!(
            !mpaths.iter().any(|m| m.path == mpath.path),
            "FATAL: duplicate mountpath: '{}'",
            mpath.path.display()
        );
        mpaths.push(mpath.clone());
        Ok(mpath)
    }

    pub fn get(&self) -> Vec<Arc<Mountpath>> {
        self.mpaths.read().clone()
    }

    pub fn count(&self) -> usize {
        self.mpaths.read().len()
    }

    /// The HRW-primary mountpath for an object
    pub fn hrw_mpath(&self, uname: &str) -> Result<Arc<Mountpath>> {
        let mpaths = self.mpaths.read();
        if mpaths.is_empty() {
            return Err(Error::NoMountpath("<none registered>".to_string()));
        }
        let digests: Vec<u64> = mpaths.iter().map(|m| m.digest).collect();
        let idx = hrw::hrw_index(uname, &digests).unwrap();
        Ok(mpaths[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Bck;

    #[test]
    fn test_mountpath_validation() {
        assert!(matches!(
            Mountpath::new("/definitely/not/here"),
            Err(Error::InvalidMountpath { .. })
        ));
        let dir = tempfile::tempdir().unwrap();
        assert!(Mountpath::new(dir.path()).is_ok());
    }

    #[test]
    fn test_fqn_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mpath = Mountpath::new(dir.path()).unwrap();
        let bck = Bck::ais("b1");
        let fqn = mpath.make_fqn(ContentType::Slice, &bck, "o1");
        assert_eq!(fqn, dir.path().join("ec").join("ais").join("b1").join("o1"));
    }

    #[test]
    fn test_hrw_mpath_deterministic() {
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let reg = MpathRegistry::new();
        for d in &dirs {
            reg.add(d.path()).unwrap();
        }
        let a = reg.hrw_mpath("ais/b/o").unwrap();
        let b = reg.hrw_mpath("ais/b/o").unwrap();
        assert_eq!(a.path, b.path);
    }

    #[test]
    #[should_panic(expected = "duplicate mountpath")]
    fn test_duplicate_mountpath_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let reg = MpathRegistry::new();
        reg.add(dir.path()).unwrap();
        let _ = reg.add(dir.path());
    }

    #[test]
    fn test_empty_registry() {
        let reg = MpathRegistry::new();
        assert!(matches!(
            reg.hrw_mpath("ais/b/o"),
            Err(Error::NoMountpath(_))
        ));
    }
}
