//! Error types for the object store core

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cluster core
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Intra-cluster HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Bucket / object "nought" errors
    // =========================================================================
    /// Bucket does not exist in this cluster
    #[error("bucket {0:?} does not appear to be an ais bucket or does not exist")]
    BucketDoesNotExist(String),

    /// Cloud bucket does not exist
    #[error("cloud bucket {0:?} does not exist")]
    CloudBucketDoesNotExist(String),

    /// Cloud bucket exists but is unreachable
    #[error("{provider} bucket {bucket:?} is currently unreachable")]
    CloudBucketOffline { bucket: String, provider: String },

    /// Bucket already exists
    #[error("bucket {0:?} already exists")]
    BucketAlreadyExists(String),

    /// Object does not exist (and could not be restored)
    #[error("object {0:?} does not exist")]
    ObjectDoesNotExist(String),

    /// Object's bucket ID does not match the current BMD
    #[error("{name} is defunct ({bid_meta} != {bid_bmd})")]
    ObjDefunct {
        name: String,
        bid_meta: u64,
        bid_bmd: u64,
    },

    // =========================================================================
    // Capacity and access
    // =========================================================================
    /// Used capacity above the high watermark, or out of space entirely
    #[error("{}", fmt_capacity(.high, .used, .oos))]
    CapacityExceeded { high: i64, used: i32, oos: bool },

    /// Bucket operation not permitted by the bucket's access mask
    #[error("bucket {entity}: {operation} access denied ({access:#x})")]
    BucketAccessDenied {
        entity: String,
        operation: String,
        access: u64,
    },

    /// Object operation not permitted by the bucket's access mask
    #[error("object {entity}: {operation} access denied ({access:#x})")]
    ObjectAccessDenied {
        entity: String,
        operation: String,
        access: u64,
    },

    // =========================================================================
    // Integrity
    // =========================================================================
    /// Stored checksum does not match the computed one
    #[error("checksum: expected [{expected}], actual [{actual}]")]
    InvalidChecksum { expected: String, actual: String },

    /// Attempt to install an older cluster/bucket map version
    #[error("attempt to downgrade local {tag} v{have} to v{got}")]
    Downgrade {
        tag: &'static str,
        have: i64,
        got: i64,
    },

    /// Framing or header-checksum violation on the streaming transport
    #[error("transport framing: {0}")]
    Framing(String),

    // =========================================================================
    // Timeouts, xactions
    // =========================================================================
    /// Operation exceeded its wait budget
    #[error("{cause} timed out")]
    Timeout { cause: String },

    /// Control RPC referenced an unknown xaction
    #[error("xaction {0:?} not found")]
    XactionNotFound(String),

    /// Control RPC referenced a demand xaction that already self-terminated
    #[error("xaction {0:?} expired")]
    XactExpired(String),

    /// Operation observed an abort
    #[error("{0} aborted")]
    Aborted(String),

    // =========================================================================
    // Mountpaths
    // =========================================================================
    /// No mountpaths registered (or the named one is missing)
    #[error("mountpath [{0}] doesn't exist")]
    NoMountpath(String),

    /// Mountpath failed validation
    #[error("invalid mountpath [{mpath}]; {cause}")]
    InvalidMountpath { mpath: String, cause: String },

    // =========================================================================
    // Erasure coding
    // =========================================================================
    /// EC is not enabled for the bucket
    #[error("EC is disabled for bucket {0:?}")]
    EcDisabled(String),

    /// No metafile found for the object on any target
    #[error("no metafile for {0:?}")]
    NoMetafile(String),

    /// Not enough targets to place the requested replicas/slices
    #[error("insufficient targets: have {have}, need {need}")]
    InsufficientTargets { have: usize, need: usize },

    /// Reed-Solomon encode/reconstruct failure
    #[error("EC: {0}")]
    Ec(String),

    // =========================================================================
    // Transport / misc
    // =========================================================================
    /// Send on a stream that has already terminated
    #[error("stream {0} terminated, cannot send")]
    StreamTerminated(String),

    /// Compression or decompression failure
    #[error("compression: {0}")]
    Compression(String),

    /// Internal invariant violation that is not a programming error
    #[error("internal error: {0}")]
    Internal(String),
}

fn fmt_capacity(high: &i64, used: &i32, oos: &bool) -> String {
    if *oos {
        format!("OUT OF SPACE (used {used}% of total available capacity)")
    } else {
        format!("used capacity {used}% exceeded high watermark {high}%")
    }
}

impl Error {
    pub fn timeout(cause: impl Into<String>) -> Self {
        Error::Timeout {
            cause: cause.into(),
        }
    }

    /// Bucket-level "not a thing" errors: reported verbatim, never retried
    pub fn is_bucket_nought(&self) -> bool {
        matches!(
            self,
            Error::BucketDoesNotExist(_)
                | Error::CloudBucketDoesNotExist(_)
                | Error::CloudBucketOffline { .. }
        )
    }

    /// Object-level "not a thing" errors
    pub fn is_obj_nought(&self) -> bool {
        match self {
            Error::ObjectDoesNotExist(_) | Error::ObjDefunct { .. } => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_nought(&self) -> bool {
        self.is_bucket_nought() || self.is_obj_nought()
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nought_grouping() {
        assert!(Error::BucketDoesNotExist("b1".into()).is_bucket_nought());
        assert!(Error::CloudBucketOffline {
            bucket: "b1".into(),
            provider: "cloud".into()
        }
        .is_bucket_nought());
        assert!(Error::ObjectDoesNotExist("o".into()).is_obj_nought());
        assert!(!Error::ObjectDoesNotExist("o".into()).is_bucket_nought());

        let notfound = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(notfound.is_obj_nought());
    }

    #[test]
    fn test_capacity_rendering() {
        let err = Error::CapacityExceeded {
            high: 90,
            used: 97,
            oos: false,
        };
        assert!(err.to_string().contains("high watermark 90%"));

        let oos = Error::CapacityExceeded {
            high: 90,
            used: 100,
            oos: true,
        };
        assert!(oos.to_string().contains("OUT OF SPACE"));
    }

    #[test]
    fn test_downgrade_rendering() {
        let err = Error::Downgrade {
            tag: "smap",
            have: 5,
            got: 4,
        };
        assert_eq!(err.to_string(), "attempt to downgrade local smap v5 to v4");
    }
}
