//! Node configuration
//!
//! Tuning knobs for the control plane, rebalance, streaming transport
//! compression, mirroring and erasure coding. Every section has sensible
//! defaults; nodes load one `Config` at startup and treat it as read-mostly.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * 1024;
pub const GIB: usize = 1024 * 1024 * 1024;

// =============================================================================
// Config
// =============================================================================

/// Per-node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding persisted cluster metadata (.ais.smap, .ais.bmd)
    pub confdir: PathBuf,

    /// Proxy-only: public URL of the current primary, rewritten on every
    /// Smap commit so a restarting proxy can find the primary
    #[serde(default)]
    pub primary_url: String,

    #[serde(default)]
    pub timeout: TimeoutConf,

    #[serde(default)]
    pub rebalance: RebConf,

    #[serde(default)]
    pub compression: CompressionConf,

    #[serde(default)]
    pub mirror: MirrorTuneConf,

    #[serde(default)]
    pub ec: EcTuneConf,
}

// =============================================================================
// Timeouts
// =============================================================================

/// Control-plane and data-plane wait budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConf {
    /// One control-plane round trip (stage polls use 2x this)
    #[serde(with = "duration_ms")]
    pub cplane_operation: Duration,

    /// Keepalive probe ceiling
    #[serde(with = "duration_ms")]
    pub max_keepalive: Duration,

    /// Default RPC deadline
    #[serde(with = "duration_ms")]
    pub default: Duration,

    /// Whole-object send deadline
    #[serde(with = "duration_ms")]
    pub send_file: Duration,
}

impl Default for TimeoutConf {
    fn default() -> Self {
        Self {
            cplane_operation: Duration::from_secs(1),
            max_keepalive: Duration::from_secs(4),
            default: Duration::from_secs(30),
            send_file: Duration::from_secs(300),
        }
    }
}

/// Retry interval derived from the keepalive settings; wait loops sleep this
/// long between peer-status probes
pub fn keepalive_retry_duration(config: &Config) -> Duration {
    config.timeout.cplane_operation * 2
}

// =============================================================================
// Rebalance
// =============================================================================

/// Global-rebalance tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebConf {
    /// Disabled clusters never schedule a rebalance on membership change
    pub enabled: bool,

    /// Ceiling for waiting on a destination to reach a stage
    #[serde(with = "duration_ms")]
    pub dest_retry_time: Duration,

    /// How long the cluster must stay quiet before WaitAck gives up
    #[serde(with = "duration_ms")]
    pub quiescent: Duration,

    /// Per-destination object send retries before leaving the ACK pending
    pub send_retries: u32,
}

impl Default for RebConf {
    fn default() -> Self {
        Self {
            enabled: true,
            dest_retry_time: Duration::from_secs(120),
            quiescent: Duration::from_secs(20),
            send_retries: 3,
        }
    }
}

// =============================================================================
// Transport compression
// =============================================================================

/// LZ4 frame settings for compressed streams and persisted metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConf {
    /// Uncompressed block max size: 64KiB, 256KiB, 1MiB or 4MiB
    pub block_max_size: usize,

    /// Checksum each lz4 block
    pub checksum: bool,
}

impl Default for CompressionConf {
    fn default() -> Self {
        Self {
            block_max_size: 256 * KIB,
            checksum: false,
        }
    }
}

impl CompressionConf {
    pub fn validate(&self) -> crate::Result<()> {
        match self.block_max_size {
            s if s == 64 * KIB || s == 256 * KIB || s == MIB || s == 4 * MIB => Ok(()),
            other => Err(crate::Error::Internal(format!(
                "invalid lz4 block max size {other} (expecting 64K, 256K, 1M or 4M)"
            ))),
        }
    }
}

// =============================================================================
// Mirror
// =============================================================================

/// Local N-way mirroring knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorTuneConf {
    /// Disk-utilization high watermark (percent); joggers yield above it
    pub util_thresh: i64,

    /// Pending-copy queue depth per jogger
    pub burst: usize,
}

impl Default for MirrorTuneConf {
    fn default() -> Self {
        Self {
            util_thresh: 95,
            burst: 512,
        }
    }
}

// =============================================================================
// Erasure coding
// =============================================================================

/// Node-level EC tuning (per-bucket policy lives in BucketProps)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcTuneConf {
    /// Objects above this size are staged to disk instead of memory when
    /// memory pressure is high
    pub obj_size_high_mem: i64,
}

impl Default for EcTuneConf {
    fn default() -> Self {
        Self {
            obj_size_high_mem: 50 * MIB as i64,
        }
    }
}

// =============================================================================
// Duration <-> millis serde helper
// =============================================================================

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.timeout.cplane_operation, Duration::from_secs(1));
        assert_eq!(config.rebalance.dest_retry_time, Duration::from_secs(120));
        assert_eq!(config.compression.block_max_size, 256 * KIB);
        assert!(config.rebalance.enabled);
    }

    #[test]
    fn test_compression_validation() {
        let mut conf = CompressionConf::default();
        assert!(conf.validate().is_ok());
        conf.block_max_size = 123;
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config {
            confdir: PathBuf::from("/tmp/node0"),
            ..Default::default()
        };
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: Config = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.confdir, config.confdir);
        assert_eq!(decoded.timeout.max_keepalive, config.timeout.max_keepalive);
    }
}
