//! Cluster-level metadata: nodes, the cluster map, the bucket catalog
//!
//! Both maps follow the same update discipline: immutable versioned
//! snapshots behind a single-owner store, clone-modify-commit under a
//! writer lock, persistence on every commit, lock-free readers.

pub mod bck;
pub mod bmd;
pub mod node;
pub mod persist;
pub mod smap;

pub use bck::{Bck, BucketProps, CksumConf, EcConf, LruConf, MirrorConf, Provider};
pub use bmd::{Bmd, BmdOwner};
pub use node::{DaemonType, NetInfo, Snode};
pub use persist::{BMD_FNAME, SMAP_FNAME};
pub use smap::{Smap, SmapListeners, SmapOwner};
