//! Local mirroring: N-way copies across mountpaths
//!
//! One jogger per mountpath, each traversing only its own path. An object
//! is handled by the jogger owning its HRW-primary mountpath, so every
//! object is visited exactly once regardless of how many copies exist.
//! I/O errors are logged and counted without aborting sibling joggers;
//! only an abort of the owning xaction stops the traversal.

pub mod copy_bucket;
pub mod make_n_copies;

pub use copy_bucket::XactCopyBucket;
pub use make_n_copies::XactMakeNCopies;

use crate::cluster::Bck;
use crate::fs::{Mountpath, TargetStore};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Validation ceiling for per-bucket copies
pub const MAX_N_COPIES: u32 = 16;

/// Self-throttling unit: check every this many objects
const THROTTLE_NUM_OBJECTS: i64 = 16;
/// ...and yield when at least this much moved since the last check
const THROTTLE_MIN_SIZE: i64 = 4 * 1024 * 1024;

/// N must fit both the hard ceiling and the number of mountpaths
pub fn validate_n_copies(prefix: &str, copies: u32, mpath_count: usize) -> Result<()> {
    if copies < 1 || copies > MAX_N_COPIES {
        return Err(Error::Internal(format!(
            "{prefix}: number of copies ({copies}) out of range [1, {MAX_N_COPIES}]"
        )));
    }
    if mpath_count == 0 {
        return Err(Error::NoMountpath(format!("{prefix}: no mountpaths")));
    }
    if copies as usize > mpath_count {
        return Err(Error::Internal(format!(
            "{prefix}: number of copies ({copies}) exceeds the number of mountpaths ({mpath_count})"
        )));
    }
    Ok(())
}

// =============================================================================
// Jogger plumbing
// =============================================================================

/// Per-jogger progress
#[derive(Debug, Default, Clone, Copy)]
pub struct JogStats {
    pub objects: i64,
    pub bytes: i64,
    pub errors: i64,
}

impl JogStats {
    pub fn merge(&mut self, other: JogStats) {
        self.objects += other.objects;
        self.bytes += other.bytes;
        self.errors += other.errors;
    }
}

struct Throttler {
    num: i64,
    size: i64,
}

impl Throttler {
    fn new() -> Self {
        Self { num: 0, size: 0 }
    }

    // yield every 16 objects once >= 4 MiB accumulated; keeps joggers from
    // saturating the disks they share with the data path
    fn tick(&mut self, bytes: i64) {
        self.num += 1;
        self.size += bytes;
        if self.num % THROTTLE_NUM_OBJECTS == 0 {
            if self.size >= THROTTLE_MIN_SIZE {
                self.size = 0;
                std::thread::sleep(Duration::from_millis(1));
            } else {
                std::thread::yield_now();
            }
        }
    }
}

/// Walk one mountpath's share of a bucket, invoking `visit` for every
/// object whose HRW-primary mountpath this is. Returns per-jogger stats;
/// per-object errors are counted, not fatal.
pub(crate) fn jog_bucket<F>(
    store: &TargetStore,
    bck: &Bck,
    mpath: &Mountpath,
    abort: &CancellationToken,
    mut visit: F,
) -> Result<JogStats>
where
    F: FnMut(&str) -> Result<i64>,
{
    let mut stats = JogStats::default();
    let mut throttler = Throttler::new();
    for obj_name in store.walk_mpath(mpath, bck)? {
        if abort.is_cancelled() {
            return Err(Error::Aborted(format!("jogger[{mpath}/{}]", bck.name)));
        }
        // copy instances are handled by their primary jogger
        if store.primary_mpath(bck, &obj_name)?.path != mpath.path {
            continue;
        }
        match visit(&obj_name) {
            Ok(bytes) => {
                stats.objects += 1;
                stats.bytes += bytes;
                throttler.tick(bytes);
            }
            Err(e) if e.is_obj_nought() => {} // raced with a delete
            Err(e) => {
                warn!("jogger[{mpath}/{}]: {obj_name}: {e}", bck.name);
                stats.errors += 1;
            }
        }
    }
    Ok(stats)
}

/// Run one jogger per mountpath and merge their stats; jogger panics and
/// aborts surface as errors, per-object failures are partial success
pub(crate) async fn run_joggers<F>(
    store: &Arc<TargetStore>,
    bck: &Bck,
    abort: &CancellationToken,
    make_visit: F,
) -> Result<JogStats>
where
    F: Fn(Arc<TargetStore>, Bck, Arc<Mountpath>) -> Box<dyn FnMut(&str) -> Result<i64> + Send>,
{
    let mut handles = Vec::new();
    for mpath in store.mpaths().get() {
        let store = store.clone();
        let bck = bck.clone();
        let abort = abort.clone();
        let mut visit = make_visit(store.clone(), bck.clone(), mpath.clone());
        handles.push(tokio::task::spawn_blocking(move || {
            jog_bucket(&store, &bck, &mpath, &abort, &mut *visit)
        }));
    }

    let mut total = JogStats::default();
    let mut aborted = false;
    for handle in handles {
        match handle
            .await
            .map_err(|e| Error::Internal(format!("jogger task: {e}")))?
        {
            Ok(stats) => total.merge(stats),
            Err(Error::Aborted(_)) => aborted = true,
            Err(e) => return Err(e),
        }
    }
    if aborted {
        return Err(Error::Aborted(format!("mirror joggers for {bck}")));
    }
    Ok(total)
}
