//! Highest Random Weight (HRW) placement
//!
//! Deterministic, stability-preserving selection: every node computes the
//! same ordering for a given uname and target set, and a membership change
//! displaces only ~1/|targets| of all objects.
//!
//! The weight of target `t` for uname `u` is `mix64(digest(t) ^ hash64(u))`;
//! targets are ordered by descending weight with the daemon ID as tie-break.
//! The first entry is the "main" target (holds the full object), the rest
//! are replica/slice holders.

use crate::cluster::{Smap, Snode};
use crate::{Error, Result};

/// 64-bit digest of arbitrary bytes (first 8 bytes of the blake3 hash)
pub fn hash64(b: &[u8]) -> u64 {
    let hash = blake3::hash(b);
    u64::from_le_bytes(hash.as_bytes()[..8].try_into().unwrap())
}

/// Fixed 64-bit mixing function (splitmix64 finalizer); also checksums
/// transport frame headers
pub fn mix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// The main target for an object
pub fn hrw_target<'a>(uname: &str, smap: &'a Smap) -> Result<&'a Snode> {
    let seed = hash64(uname.as_bytes());
    let mut best: Option<(&Snode, u64)> = None;
    for si in smap.tmap.values() {
        let weight = mix64(si.digest() ^ seed);
        let wins = match best {
            None => true,
            Some((b, w)) => weight > w || (weight == w && si.daemon_id < b.daemon_id),
        };
        if wins {
            best = Some((si, weight));
        }
    }
    best.map(|(si, _)| si).ok_or(Error::InsufficientTargets {
        have: 0,
        need: 1,
    })
}

/// The `n` highest-weight targets for an object, main first
pub fn hrw_target_list<'a>(uname: &str, smap: &'a Smap, n: usize) -> Result<Vec<&'a Snode>> {
    if smap.count_targets() < n {
        return Err(Error::InsufficientTargets {
            have: smap.count_targets(),
            need: n,
        });
    }
    let seed = hash64(uname.as_bytes());
    let mut weighted: Vec<(u64, &Snode)> = smap
        .tmap
        .values()
        .map(|si| (mix64(si.digest() ^ seed), si))
        .collect();
    // descending weight; daemon ID breaks ties deterministically
    weighted.sort_unstable_by(|(wa, sa), (wb, sb)| {
        wb.cmp(wa).then_with(|| sa.daemon_id.cmp(&sb.daemon_id))
    });
    Ok(weighted.into_iter().take(n).map(|(_, si)| si).collect())
}

/// An electable proxy, excluding the current primary when `skip_id` is set
pub fn hrw_proxy<'a>(smap: &'a Smap, skip_id: Option<&str>) -> Result<&'a Snode> {
    let mut best: Option<(&Snode, u64)> = None;
    for psi in smap.pmap.values() {
        if smap.non_elects.contains(&psi.daemon_id) {
            continue;
        }
        if skip_id == Some(psi.daemon_id.as_str()) {
            continue;
        }
        let weight = mix64(psi.digest());
        let wins = match best {
            None => true,
            Some((b, w)) => weight > w || (weight == w && psi.daemon_id < b.daemon_id),
        };
        if wins {
            best = Some((psi, weight));
        }
    }
    best.map(|(si, _)| si).ok_or(Error::InsufficientTargets {
        have: 0,
        need: 1,
    })
}

/// HRW over a set of local digests (mountpath selection)
pub fn hrw_index(uname: &str, digests: &[u64]) -> Option<usize> {
    let seed = hash64(uname.as_bytes());
    digests
        .iter()
        .enumerate()
        .max_by_key(|(i, d)| (mix64(**d ^ seed), usize::MAX - i))
        .map(|(i, _)| i)
}
