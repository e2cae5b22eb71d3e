//! Bucket metadata (BMD) and its single-owner store
//!
//! Same discipline as the Smap: immutable versioned snapshots, a single
//! writer lock, clone-modify-commit, persistence on every commit. Unlike
//! Smap mutators, bucket create/destroy collisions are user-facing
//! conditions and come back as errors, not assertions.

use crate::cluster::bck::{Bck, BucketProps, Provider};
use crate::cluster::persist::{self, BMD_FNAME};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

// =============================================================================
// Bmd
// =============================================================================

/// The bucket catalog: every known bucket and its properties
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bmd {
    pub version: i64,
    /// Cluster identity; matches the Smap origin
    pub origin: u64,
    /// ais buckets by name
    pub ais_buckets: BTreeMap<String, BucketProps>,
    /// Cloud buckets by name
    pub cloud_buckets: BTreeMap<String, BucketProps>,
    /// High water mark for assigned bucket IDs
    pub last_bid: u64,
}

impl Bmd {
    pub fn new(origin: u64) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    fn map_for(&self, provider: Provider) -> &BTreeMap<String, BucketProps> {
        match provider {
            Provider::Ais => &self.ais_buckets,
            Provider::Cloud => &self.cloud_buckets,
        }
    }

    fn map_for_mut(&mut self, provider: Provider) -> &mut BTreeMap<String, BucketProps> {
        match provider {
            Provider::Ais => &mut self.ais_buckets,
            Provider::Cloud => &mut self.cloud_buckets,
        }
    }

    pub fn get(&self, bck: &Bck) -> Option<&BucketProps> {
        self.map_for(bck.provider).get(&bck.name)
    }

    pub fn is_ais(&self, name: &str) -> bool {
        self.ais_buckets.contains_key(name)
    }

    pub fn is_cloud(&self, name: &str) -> bool {
        self.cloud_buckets.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.ais_buckets.len() + self.cloud_buckets.len()
    }

    /// The next durable bucket identity
    pub fn gen_bid(&mut self) -> u64 {
        self.last_bid += 1;
        self.last_bid
    }

    // Mutators: every committed change bumps the version.

    pub fn add_bucket(&mut self, bck: &Bck, mut props: BucketProps) -> Result<()> {
        if self.get(bck).is_some() {
            return Err(Error::BucketAlreadyExists(bck.name.clone()));
        }
        if props.bid == 0 {
            props.bid = self.gen_bid();
        }
        self.map_for_mut(bck.provider).insert(bck.name.clone(), props);
        self.version += 1;
        Ok(())
    }

    pub fn del_bucket(&mut self, bck: &Bck) -> Result<()> {
        if self.map_for_mut(bck.provider).remove(&bck.name).is_none() {
            return Err(match bck.provider {
                Provider::Ais => Error::BucketDoesNotExist(bck.name.clone()),
                Provider::Cloud => Error::CloudBucketDoesNotExist(bck.name.clone()),
            });
        }
        self.version += 1;
        Ok(())
    }

    /// Replace the props of an existing bucket, preserving its BID
    pub fn set_props(&mut self, bck: &Bck, mut props: BucketProps) -> Result<()> {
        let cur = self
            .map_for_mut(bck.provider)
            .get_mut(&bck.name)
            .ok_or_else(|| Error::BucketDoesNotExist(bck.name.clone()))?;
        props.bid = cur.bid;
        *cur = props;
        self.version += 1;
        Ok(())
    }

    /// Resolve a bucket reference against this BMD, filling in its props
    pub fn init_bck(&self, bck: &mut Bck) -> Result<()> {
        match self.get(bck) {
            Some(props) => {
                bck.props = Some(props.clone());
                Ok(())
            }
            None => Err(match bck.provider {
                Provider::Ais => Error::BucketDoesNotExist(bck.name.clone()),
                Provider::Cloud => Error::CloudBucketDoesNotExist(bck.name.clone()),
            }),
        }
    }
}

// =============================================================================
// BmdOwner
// =============================================================================

/// Single-owner-per-process store of the current BMD
pub struct BmdOwner {
    wlock: Mutex<()>,
    bmd: RwLock<Arc<Bmd>>,
    confdir: PathBuf,
}

impl BmdOwner {
    pub fn new(confdir: impl Into<PathBuf>) -> Self {
        Self {
            wlock: Mutex::new(()),
            bmd: RwLock::new(Arc::new(Bmd::default())),
            confdir: confdir.into(),
        }
    }

    /// The current immutable snapshot
    pub fn get(&self) -> Arc<Bmd> {
        self.bmd.read().clone()
    }

    /// Install `newbmd` if strictly newer; same version rules as the Smap
    pub fn synchronize(&self, newbmd: Bmd, lesser_is_err: bool) -> Result<()> {
        let _g = self.wlock.lock();
        let myver = self.bmd.read().version;
        if newbmd.version <= myver {
            if lesser_is_err && newbmd.version < myver {
                return Err(Error::Downgrade {
                    tag: "bmd",
                    have: myver,
                    got: newbmd.version,
                });
            }
            return Ok(());
        }
        self.persist(&newbmd)?;
        self.put(newbmd);
        Ok(())
    }

    /// Clone-modify-commit under the writer lock
    pub fn commit_update<F>(&self, mutate: F) -> Result<Arc<Bmd>>
    where
        F: FnOnce(&mut Bmd) -> Result<()>,
    {
        let _g = self.wlock.lock();
        let cur = self.bmd.read().clone();
        let mut clone = (*cur).clone();
        mutate(&mut clone)?;
        assert!(
            clone.version > cur.version,
            "FATAL: bmd commit without version bump (v{})",
            cur.version
        );
        self.persist(&clone)?;
        Ok(self.put(clone))
    }

    /// Load the persisted BMD; corruption counts as absent
    pub fn load(&self) -> Option<Bmd> {
        match persist::local_load::<Bmd>(&self.confdir.join(BMD_FNAME)) {
            Ok(bmd) => Some(bmd),
            Err(e) => {
                if !e.is_obj_nought() {
                    warn!("discarding persisted bmd: {e}");
                }
                None
            }
        }
    }

    fn put(&self, bmd: Bmd) -> Arc<Bmd> {
        let arc = Arc::new(bmd);
        *self.bmd.write() = arc.clone();
        arc
    }

    fn persist(&self, bmd: &Bmd) -> Result<()> {
        persist::local_save(&self.confdir.join(BMD_FNAME), bmd, true)
    }
}
