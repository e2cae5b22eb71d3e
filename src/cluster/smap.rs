//! Cluster map (Smap) and its single-owner store
//!
//! The Smap is immutable and versioned; versioning is monotonic and
//! incremental, and the map uniquely and solely defines the current primary
//! proxy. The typical update transaction is:
//!
//! ```text
//! lock -- clone() -- modify the clone -- persist -- put(clone) -- unlock
//! ```
//!
//! Readers never take the writer lock: they load the current snapshot
//! pointer and work with an `Arc<Smap>` that can never change underneath
//! them.

use crate::cluster::node::Snode;
use crate::cluster::persist::{self, SMAP_FNAME};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Listener channel capacity; slow listeners drop versions, never block
/// the installer
pub const SMAP_LISTENER_BUF: usize = 8;

// =============================================================================
// Smap
// =============================================================================

/// The cluster map: all member nodes and the current primary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Smap {
    pub version: i64,
    /// Cluster identity, assigned once at bootstrap
    pub origin: u64,
    pub creation_time: Option<DateTime<Utc>>,
    /// Proxies by daemon ID
    pub pmap: BTreeMap<String, Snode>,
    /// Targets by daemon ID
    pub tmap: BTreeMap<String, Snode>,
    /// The primary proxy; must be present in `pmap`
    pub primary: Option<Snode>,
    /// Proxies excluded from primary election
    pub non_elects: BTreeSet<String>,
}

impl Smap {
    pub fn new(origin: u64) -> Self {
        Self {
            origin,
            creation_time: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn get_target(&self, id: &str) -> Option<&Snode> {
        self.tmap.get(id)
    }

    pub fn get_proxy(&self, id: &str) -> Option<&Snode> {
        self.pmap.get(id)
    }

    pub fn get_node(&self, id: &str) -> Option<&Snode> {
        self.tmap.get(id).or_else(|| self.pmap.get(id))
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.tmap.contains_key(id) || self.pmap.contains_key(id)
    }

    pub fn count_targets(&self) -> usize {
        self.tmap.len()
    }

    pub fn count_proxies(&self) -> usize {
        self.pmap.len()
    }

    /// A valid Smap has a primary that is present among its proxies
    pub fn is_valid(&self) -> bool {
        match &self.primary {
            Some(p) => self.pmap.contains_key(&p.daemon_id),
            None => false,
        }
    }

    pub fn is_primary(&self, node: &Snode) -> bool {
        self.is_valid()
            && self.primary.as_ref().map(|p| p.daemon_id.as_str())
                == Some(node.daemon_id.as_str())
    }

    pub fn is_present(&self, node: &Snode) -> bool {
        if node.is_proxy() {
            self.pmap.contains_key(&node.daemon_id)
        } else {
            self.tmap.contains_key(&node.daemon_id)
        }
    }

    /// True when both maps hold exactly the same target IDs; rebalance
    /// triggers on the transitions where this is false
    pub fn same_target_set(&self, other: &Smap) -> bool {
        self.tmap.len() == other.tmap.len()
            && self.tmap.keys().all(|id| other.tmap.contains_key(id))
    }

    // Mutators: every committed change bumps the version. Duplicate-insert
    // and delete-missing are programming errors, not runtime conditions.

    pub fn add_target(&mut self, tsi: Snode) {
        assert!(
            !self.contains_id(&tsi.daemon_id),
            "FATAL: duplicate daemon ID: '{}'",
            tsi.daemon_id
        );
        self.tmap.insert(tsi.daemon_id.clone(), tsi);
        self.version += 1;
    }

    pub fn add_proxy(&mut self, psi: Snode) {
        assert!(
            !self.contains_id(&psi.daemon_id),
            "FATAL: duplicate daemon ID: '{}'",
            psi.daemon_id
        );
        self.pmap.insert(psi.daemon_id.clone(), psi);
        self.version += 1;
    }

    pub fn del_target(&mut self, id: &str) {
        assert!(
            self.tmap.contains_key(id),
            "FATAL: target {id} is not in the smap"
        );
        self.tmap.remove(id);
        self.version += 1;
    }

    pub fn del_proxy(&mut self, id: &str) {
        assert!(
            self.pmap.contains_key(id),
            "FATAL: proxy {id} is not in the smap"
        );
        self.pmap.remove(id);
        self.non_elects.remove(id);
        self.version += 1;
    }

    /// Join (or re-join) a node; an existing entry with the same ID is
    /// replaced
    pub fn put_node(&mut self, nsi: Snode, non_electable: bool) {
        let id = nsi.daemon_id.clone();
        if nsi.is_proxy() {
            if self.pmap.contains_key(&id) {
                self.del_proxy(&id);
            }
            self.add_proxy(nsi);
            if non_electable {
                self.non_elects.insert(id.clone());
                warn!("p[{id}] won't be electable");
            }
        } else {
            if self.tmap.contains_key(&id) {
                self.del_target(&id);
            }
            self.add_target(nsi);
        }
    }

    pub fn set_primary(&mut self, psi: Snode) {
        if !self.pmap.contains_key(&psi.daemon_id) {
            self.add_proxy(psi.clone());
        } else {
            self.version += 1;
        }
        self.primary = Some(psi);
    }

    /// Copy nodes missing from `dst` (either map); fill origin and creation
    /// time when `dst` has none. Returns the number of nodes added.
    pub fn merge(&self, dst: &mut Smap) -> usize {
        let mut added = 0;
        for (id, si) in &self.tmap {
            if !dst.contains_id(id) {
                dst.tmap.insert(id.clone(), si.clone());
                added += 1;
            }
        }
        for (id, si) in &self.pmap {
            if !dst.contains_id(id) {
                dst.pmap.insert(id.clone(), si.clone());
                added += 1;
            }
        }
        if self.origin != 0 && dst.origin == 0 {
            dst.origin = self.origin;
            dst.creation_time = self.creation_time;
        }
        added
    }

    /// Recompute node digests after deserialization; `synchronize` does
    /// this for installed maps, wire glue working with raw maps calls it
    /// directly
    pub fn init_digests(&mut self) {
        for si in self.tmap.values_mut() {
            si.init_digest();
        }
        for si in self.pmap.values_mut() {
            si.init_digest();
        }
        if let Some(p) = self.primary.as_mut() {
            p.init_digest();
        }
    }
}

// =============================================================================
// Listeners
// =============================================================================

/// Registry of Smap-change listeners
///
/// Registration is idempotent by identity (name); a duplicate registration
/// is a fatal programming error. Unregistration drops the sender so the
/// listener observes channel close.
#[derive(Default)]
pub struct SmapListeners {
    chans: Mutex<HashMap<String, mpsc::Sender<i64>>>,
}

impl SmapListeners {
    pub fn reg(&self, name: &str) -> mpsc::Receiver<i64> {
        let (tx, rx) = mpsc::channel(SMAP_LISTENER_BUF);
        let mut chans = self.chans.lock();
        assert!(
            !chans.contains_key(name),
            "FATAL: smap-listener {name} is already registered"
        );
        chans.insert(name.to_string(), tx);
        info!("registered smap-listener {name}");
        rx
    }

    pub fn unreg(&self, name: &str) {
        let mut chans = self.chans.lock();
        assert!(
            chans.remove(name).is_some(),
            "FATAL: smap-listener {name} is not registered"
        );
    }

    fn notify(&self, version: i64) {
        let chans = self.chans.lock();
        for (name, tx) in chans.iter() {
            if let Err(e) = tx.try_send(version) {
                warn!("smap-listener {name} dropped v{version}: {e}");
            }
        }
    }
}

// =============================================================================
// SmapOwner
// =============================================================================

/// Single-owner-per-process store of the current Smap
pub struct SmapOwner {
    /// Serializes all mutations; readers never take it
    wlock: Mutex<()>,
    smap: RwLock<Arc<Smap>>,
    listeners: SmapListeners,
    confdir: PathBuf,
    /// Proxies rewrite the primary URL into this node config file on every
    /// commit so a restart can find the primary
    conf_file: Option<PathBuf>,
}

impl SmapOwner {
    pub fn new(confdir: impl Into<PathBuf>, conf_file: Option<PathBuf>) -> Self {
        Self {
            wlock: Mutex::new(()),
            smap: RwLock::new(Arc::new(Smap::default())),
            listeners: SmapListeners::default(),
            confdir: confdir.into(),
            conf_file,
        }
    }

    /// The current immutable snapshot
    pub fn get(&self) -> Arc<Smap> {
        self.smap.read().clone()
    }

    pub fn listeners(&self) -> &SmapListeners {
        &self.listeners
    }

    /// Install `newsmap` if it is strictly newer than the current version.
    ///
    /// A lesser version is an error only when `lesser_is_err`; an equal
    /// version is always a silent no-op.
    pub fn synchronize(&self, mut newsmap: Smap, lesser_is_err: bool) -> Result<()> {
        if !newsmap.is_valid() {
            return Err(Error::Internal(format!(
                "invalid smap v{}: primary missing",
                newsmap.version
            )));
        }
        let _g = self.wlock.lock();
        let cur = self.smap.read().clone();
        let myver = cur.version;
        if newsmap.version <= myver {
            if lesser_is_err && newsmap.version < myver {
                return Err(Error::Downgrade {
                    tag: "smap",
                    have: myver,
                    got: newsmap.version,
                });
            }
            return Ok(());
        }
        newsmap.init_digests();
        self.persist(&newsmap)?;
        self.put(newsmap);
        Ok(())
    }

    /// Clone-modify-commit: run `mutate` against a clone of the current map
    /// under the writer lock, persist, swap, notify.
    pub fn commit_update<F>(&self, mutate: F) -> Result<Arc<Smap>>
    where
        F: FnOnce(&mut Smap) -> Result<()>,
    {
        let _g = self.wlock.lock();
        let cur = self.smap.read().clone();
        let mut clone = (*cur).clone();
        mutate(&mut clone)?;
        assert!(
            clone.version > cur.version,
            "FATAL: smap commit without version bump (v{})",
            cur.version
        );
        clone.init_digests();
        self.persist(&clone)?;
        Ok(self.put(clone))
    }

    /// Load the persisted Smap, if any; a checksum failure is treated as
    /// an absent file
    pub fn load(&self) -> Option<Smap> {
        match persist::local_load::<Smap>(&self.confdir.join(SMAP_FNAME)) {
            Ok(mut smap) => {
                smap.init_digests();
                Some(smap)
            }
            Err(e) => {
                if !e.is_obj_nought() {
                    warn!("discarding persisted smap: {e}");
                }
                None
            }
        }
    }

    // install + notify; caller holds the writer lock
    fn put(&self, smap: Smap) -> Arc<Smap> {
        let version = smap.version;
        let arc = Arc::new(smap);
        *self.smap.write() = arc.clone();
        self.listeners.notify(version);
        arc
    }

    // Both writes must succeed for the commit to proceed
    fn persist(&self, smap: &Smap) -> Result<()> {
        persist::local_save(&self.confdir.join(SMAP_FNAME), smap, true)?;
        if let Some(conf_file) = &self.conf_file {
            let primary_url = smap
                .primary
                .as_ref()
                .map(|p| p.public_net.direct_url.clone())
                .unwrap_or_default();
            let mut config: crate::Config =
                persist::local_load(conf_file).unwrap_or_default();
            config.primary_url = primary_url;
            persist::local_save(conf_file, &config, false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::{DaemonType, NetInfo};

    fn proxy(id: &str) -> Snode {
        Snode::new(
            id,
            DaemonType::Proxy,
            NetInfo::new("http", "127.0.0.1", 8080),
            None,
            None,
        )
    }

    fn target(id: &str) -> Snode {
        Snode::new(
            id,
            DaemonType::Target,
            NetInfo::new("http", "127.0.0.1", 8081),
            None,
            None,
        )
    }

    fn valid_smap(version: i64) -> Smap {
        let mut smap = Smap::new(42);
        let p = proxy("p1");
        smap.add_proxy(p.clone());
        smap.primary = Some(p);
        smap.add_target(target("t1"));
        smap.version = version;
        smap
    }

    #[test]
    fn test_mutators_bump_version() {
        let mut smap = Smap::new(1);
        assert_eq!(smap.version, 0);
        smap.add_target(target("t1"));
        assert_eq!(smap.version, 1);
        smap.add_proxy(proxy("p1"));
        assert_eq!(smap.version, 2);
        smap.del_target("t1");
        assert_eq!(smap.version, 3);
    }

    #[test]
    #[should_panic(expected = "duplicate daemon ID")]
    fn test_duplicate_id_is_fatal() {
        let mut smap = Smap::new(1);
        smap.add_target(target("t1"));
        smap.add_proxy(proxy("t1"));
    }

    #[test]
    #[should_panic(expected = "is not in the smap")]
    fn test_del_missing_is_fatal() {
        let mut smap = Smap::new(1);
        smap.del_target("nope");
    }

    #[test]
    fn test_put_node_replaces() {
        let mut smap = Smap::new(1);
        smap.put_node(target("t1"), false);
        let v = smap.version;
        smap.put_node(target("t1"), false);
        assert_eq!(smap.count_targets(), 1);
        assert!(smap.version > v);
    }

    #[test]
    fn test_merge() {
        let src = valid_smap(5);
        let mut dst = Smap::default();
        let added = src.merge(&mut dst);
        assert_eq!(added, 2); // p1 + t1
        assert_eq!(dst.origin, 42);
        // already-present nodes are not re-added
        assert_eq!(src.merge(&mut dst), 0);
    }

    #[test]
    fn test_same_target_set() {
        let a = valid_smap(5);
        let mut b = a.clone();
        assert!(a.same_target_set(&b));
        b.add_target(target("t2"));
        assert!(!a.same_target_set(&b));
    }

    #[test]
    fn test_synchronize_versions() {
        let dir = tempfile::tempdir().unwrap();
        let owner = SmapOwner::new(dir.path(), None);

        owner.synchronize(valid_smap(5), true).unwrap();
        assert_eq!(owner.get().version, 5);

        // equal version: silent no-op even with lesser_is_err
        owner.synchronize(valid_smap(5), true).unwrap();
        assert_eq!(owner.get().version, 5);

        // lesser version: downgrade error when flagged...
        let err = owner.synchronize(valid_smap(4), true).unwrap_err();
        assert!(matches!(err, Error::Downgrade { have: 5, got: 4, .. }));
        assert_eq!(owner.get().version, 5);

        // ...and an ignored no-op otherwise
        owner.synchronize(valid_smap(3), false).unwrap();
        assert_eq!(owner.get().version, 5);
    }

    #[test]
    fn test_synchronize_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let owner = SmapOwner::new(dir.path(), None);
        let mut smap = Smap::new(7);
        smap.add_target(target("t1"));
        smap.version = 3;
        assert!(owner.synchronize(smap, false).is_err());
    }

    #[test]
    fn test_commit_update_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let owner = SmapOwner::new(dir.path(), None);

        owner
            .commit_update(|smap| {
                let p = proxy("p1");
                smap.add_proxy(p.clone());
                smap.primary = Some(p);
                smap.add_target(target("t1"));
                smap.origin = 9;
                Ok(())
            })
            .unwrap();
        let v1 = owner.get().version;
        assert!(v1 > 0);

        let reloaded = SmapOwner::new(dir.path(), None).load().unwrap();
        assert_eq!(reloaded.version, v1);
        assert_eq!(reloaded, *owner.get());
    }

    #[test]
    fn test_listeners_receive_versions() {
        let dir = tempfile::tempdir().unwrap();
        let owner = SmapOwner::new(dir.path(), None);
        let mut rx = owner.listeners().reg("tester");

        owner.synchronize(valid_smap(2), false).unwrap();
        owner.synchronize(valid_smap(3), false).unwrap();

        assert_eq!(rx.try_recv().unwrap(), 2);
        assert_eq!(rx.try_recv().unwrap(), 3);

        owner.listeners().unreg("tester");
        // sender dropped: channel reports closed once drained
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_proxy_conf_file_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let conf_file = dir.path().join("node.conf");
        let owner = SmapOwner::new(dir.path(), Some(conf_file.clone()));

        owner.synchronize(valid_smap(2), false).unwrap();

        let config: crate::Config = persist::local_load(&conf_file).unwrap();
        assert_eq!(config.primary_url, "http://127.0.0.1:8080");
    }
}
