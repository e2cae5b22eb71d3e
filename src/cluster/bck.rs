//! Buckets: providers, properties, unames, access control

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Uname separator; bucket and object names must not start with it
pub const UNAME_SEP: char = '/';

// =============================================================================
// Provider
// =============================================================================

/// Who backs a bucket: this cluster, or a pluggable cloud back-end
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ais,
    Cloud,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Ais => "ais",
            Provider::Cloud => "cloud",
        }
    }

    /// Normalize a provider tag; cloud vendor tags collapse to `Cloud`
    pub fn parse(s: &str) -> Result<Provider> {
        match s {
            "ais" => Ok(Provider::Ais),
            "cloud" | "aws" | "gcp" | "azure" => Ok(Provider::Cloud),
            other => Err(Error::Internal(format!("unknown provider {other:?}"))),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Provider {
    fn default() -> Self {
        Provider::Ais
    }
}

// =============================================================================
// Bucket properties
// =============================================================================

/// Checksum configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CksumConf {
    /// Checksum type tag stored with objects ("blake3" or "none")
    pub ty: String,
    /// Validate on warm reads
    pub validate: bool,
}

impl Default for CksumConf {
    fn default() -> Self {
        Self {
            ty: "blake3".to_string(),
            validate: false,
        }
    }
}

/// LRU eviction hook configuration; the eviction math lives outside the core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LruConf {
    pub enabled: bool,
    /// Low watermark, percent used capacity
    pub lowwm: i64,
    /// High watermark, percent used capacity
    pub highwm: i64,
    /// Out-of-space threshold, percent
    pub oos: i64,
}

impl Default for LruConf {
    fn default() -> Self {
        Self {
            enabled: true,
            lowwm: 75,
            highwm: 90,
            oos: 95,
        }
    }
}

/// N-way mirroring policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConf {
    pub enabled: bool,
    pub copies: u32,
}

/// Erasure-coding policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcConf {
    pub enabled: bool,
    pub data_slices: usize,
    pub parity_slices: usize,
    /// Objects at or below this size are replicated instead of encoded;
    /// 0 means the default (256 KiB)
    pub obj_size_limit: i64,
}

/// Replication-versus-encoding threshold used when `obj_size_limit` is 0
pub const EC_DEFAULT_SIZE_LIMIT: i64 = 256 * 1024;

impl EcConf {
    pub fn size_limit(&self) -> i64 {
        if self.obj_size_limit == 0 {
            EC_DEFAULT_SIZE_LIMIT
        } else {
            self.obj_size_limit
        }
    }

    /// Replicate (true) or erasure-encode (false) an object of `size` bytes
    pub fn is_copy(&self, size: i64) -> bool {
        size <= self.size_limit()
    }

    /// Number of peers (beyond the main target) that hold a part
    pub fn num_peers(&self, size: i64) -> usize {
        if self.is_copy(size) {
            self.parity_slices
        } else {
            self.data_slices + self.parity_slices
        }
    }
}

/// Durable per-bucket metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketProps {
    /// Durable bucket identity, assigned at creation, survives renames
    pub bid: u64,
    /// Set while a create/rename transaction is still in flight
    pub in_progress: bool,
    /// Access bitmask; 0 allows every operation
    pub access: u64,
    pub cksum: CksumConf,
    pub lru: LruConf,
    pub mirror: MirrorConf,
    pub ec: EcConf,
}

// =============================================================================
// Access bits
// =============================================================================

pub const ACCESS_GET: u64 = 1 << 0;
pub const ACCESS_HEAD: u64 = 1 << 1;
pub const ACCESS_PUT: u64 = 1 << 2;
pub const ACCESS_APPEND: u64 = 1 << 3;
pub const ACCESS_PATCH: u64 = 1 << 4;
pub const ACCESS_COLD_GET: u64 = 1 << 5;
pub const ACCESS_DELETE: u64 = 1 << 6;
pub const ACCESS_RENAME: u64 = 1 << 7;

/// Unset mask: every operation permitted
pub const ALLOW_ANY_ACCESS: u64 = 0;

// =============================================================================
// Bck
// =============================================================================

/// A bucket reference, optionally resolved against the BMD
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bck {
    pub name: String,
    pub provider: Provider,
    #[serde(skip)]
    pub props: Option<BucketProps>,
}

impl Bck {
    pub fn new(name: impl Into<String>, provider: Provider) -> Self {
        Self {
            name: name.into(),
            provider,
            props: None,
        }
    }

    pub fn ais(name: impl Into<String>) -> Self {
        Self::new(name, Provider::Ais)
    }

    pub fn is_ais(&self) -> bool {
        self.provider == Provider::Ais
    }

    /// Canonical `provider/bucket/object` string; the HRW hash input
    pub fn make_uname(&self, obj_name: &str) -> String {
        let prov = self.provider.as_str();
        let mut uname =
            String::with_capacity(prov.len() + self.name.len() + obj_name.len() + 2);
        uname.push_str(prov);
        uname.push(UNAME_SEP);
        uname.push_str(&self.name);
        uname.push(UNAME_SEP);
        uname.push_str(obj_name);
        uname
    }

    /// Inverse of [`make_uname`](Self::make_uname)
    pub fn parse_uname(uname: &str) -> Result<(Bck, String)> {
        let malformed = || Error::Internal(format!("malformed uname {uname:?}"));
        let (prov, rest) = uname.split_once(UNAME_SEP).ok_or_else(malformed)?;
        let (bucket, obj) = rest.split_once(UNAME_SEP).ok_or_else(malformed)?;
        if bucket.is_empty() {
            return Err(malformed());
        }
        Ok((Bck::new(bucket, Provider::parse(prov)?), obj.to_string()))
    }

    // Access checks; surfaced verbatim to callers, never retried

    pub fn allow_get(&self, obj: &str) -> Result<()> {
        self.allow("GET", obj, ACCESS_GET)
    }
    pub fn allow_head(&self, obj: &str) -> Result<()> {
        self.allow("HEAD", obj, ACCESS_HEAD)
    }
    pub fn allow_put(&self, obj: &str) -> Result<()> {
        self.allow("PUT", obj, ACCESS_PUT)
    }
    pub fn allow_cold_get(&self, obj: &str) -> Result<()> {
        self.allow("cold-GET", obj, ACCESS_COLD_GET)
    }
    pub fn allow_delete(&self, obj: &str) -> Result<()> {
        self.allow("DELETE", obj, ACCESS_DELETE)
    }
    pub fn allow_rename(&self) -> Result<()> {
        self.allow("RENAME", "", ACCESS_RENAME)
    }

    fn allow(&self, oper: &str, obj: &str, bits: u64) -> Result<()> {
        let access = self.props.as_ref().map_or(ALLOW_ANY_ACCESS, |p| p.access);
        if access == ALLOW_ANY_ACCESS || access & bits != 0 {
            return Ok(());
        }
        if obj.is_empty() {
            Err(Error::BucketAccessDenied {
                entity: self.to_string(),
                operation: oper.to_string(),
                access,
            })
        } else {
            Err(Error::ObjectAccessDenied {
                entity: format!("{self}/{obj}"),
                operation: oper.to_string(),
                access,
            })
        }
    }
}

impl fmt::Display for Bck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.props {
            Some(p) => write!(
                f,
                "{}({:x}, {}, {})",
                self.name, p.bid, self.provider, p.in_progress
            ),
            None => write!(f, "{}(-, {})", self.name, self.provider),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_uname_roundtrip() {
        let bck = Bck::ais("images");
        let uname = bck.make_uname("cats/001.jpg");
        assert_eq!(uname, "ais/images/cats/001.jpg");

        let (parsed, obj) = Bck::parse_uname(&uname).unwrap();
        assert_eq!(parsed.name, "images");
        assert_eq!(parsed.provider, Provider::Ais);
        assert_eq!(obj, "cats/001.jpg");
    }

    #[test]
    fn test_uname_malformed() {
        assert!(Bck::parse_uname("nosep").is_err());
        assert!(Bck::parse_uname("ais/only-bucket").is_err());
        assert!(Bck::parse_uname("weird/b/o").is_err());
    }

    #[test]
    fn test_provider_normalization() {
        assert_eq!(Provider::parse("ais").unwrap(), Provider::Ais);
        assert_eq!(Provider::parse("aws").unwrap(), Provider::Cloud);
        assert_eq!(Provider::parse("gcp").unwrap(), Provider::Cloud);
        assert!(Provider::parse("floppy").is_err());
    }

    #[test]
    fn test_access_mask() {
        let mut bck = Bck::ais("locked");
        bck.props = Some(BucketProps {
            access: ACCESS_GET | ACCESS_HEAD,
            ..Default::default()
        });
        assert!(bck.allow_get("o").is_ok());
        assert!(matches!(
            bck.allow_put("o"),
            Err(Error::ObjectAccessDenied { .. })
        ));
        assert!(matches!(
            bck.allow_rename(),
            Err(Error::BucketAccessDenied { .. })
        ));

        // unset mask allows everything
        bck.props.as_mut().unwrap().access = ALLOW_ANY_ACCESS;
        assert!(bck.allow_delete("o").is_ok());
    }

    #[test]
    fn test_ec_conf_thresholds() {
        let ec = EcConf {
            enabled: true,
            data_slices: 4,
            parity_slices: 2,
            obj_size_limit: 0,
        };
        assert_eq!(ec.size_limit(), EC_DEFAULT_SIZE_LIMIT);
        assert!(ec.is_copy(1024));
        assert!(!ec.is_copy(EC_DEFAULT_SIZE_LIMIT + 1));
        assert_eq!(ec.num_peers(1024), 2);
        assert_eq!(ec.num_peers(1024 * 1024), 6);
    }

    proptest! {
        #[test]
        fn prop_uname_roundtrip(
            bucket in "[a-z][a-z0-9-]{0,30}",
            obj in "[a-zA-Z0-9/._-]{1,60}",
        ) {
            let bck = Bck::ais(bucket.clone());
            let uname = bck.make_uname(&obj);
            let (parsed, parsed_obj) = Bck::parse_uname(&uname).unwrap();
            prop_assert_eq!(parsed.name, bucket);
            prop_assert_eq!(parsed_obj, obj);
        }
    }
}
