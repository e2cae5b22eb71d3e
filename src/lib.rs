//! Shoal - Distributed Object Store Core
//!
//! The data-plane and control-plane coordination core of a horizontally
//! scalable object store: a cluster of gateway (proxy) and storage (target)
//! nodes that jointly expose a bucket/object namespace, route requests by
//! consistent hashing, and maintain redundancy through mirroring and erasure
//! coding.
//!
//! # Architecture
//!
//! ```text
//!           ┌────── Clients ──────┐
//!           ▼                     ▼
//!        [Proxy ...]         [Proxy (primary)]   ── owns Smap/BMD authority
//!           │                     │
//!           └──────── HRW ────────┘
//!                    │
//!           ┌────────┼────────┐
//!           ▼        ▼        ▼
//!        [Target][Target][Target]
//!           │        │        │
//!           └── streaming transport (bulk) ──┘
//!           └── control RPC ──┘
//! ```
//!
//! # Modules
//!
//! - [`cluster`] - Versioned cluster/bucket metadata (Smap, BMD) with
//!   clone-modify-commit owners and checksummed persistence
//! - [`hrw`] - Highest Random Weight placement
//! - [`xaction`] - Long-running background task lifecycle
//! - [`fs`] - Mountpaths and the local object store
//! - [`transport`] - Long-lived framed bulk-object streams between targets
//! - [`ec`] - Per-object replication / erasure coding and restoration
//! - [`mirror`] - N-way local copies across mountpaths
//! - [`reb`] - Staged global rebalance
//! - [`config`] - Node configuration
//! - [`error`] - Error types
//!
//! The HTTP surface, CLI, authentication and cloud back-ends are external
//! collaborators; this crate exposes seam traits where they plug in.

pub mod cluster;
pub mod config;
pub mod ec;
pub mod error;
pub mod fs;
pub mod hrw;
pub mod mirror;
pub mod reb;
pub mod transport;
pub mod xaction;

// Re-export commonly used types
pub use cluster::{Bck, Bmd, BmdOwner, BucketProps, Provider, Smap, SmapOwner, Snode};
pub use config::Config;
pub use error::{Error, Result};
pub use hrw::{hrw_target, hrw_target_list};
pub use xaction::{Xact, XactBase};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
