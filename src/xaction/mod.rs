//! Extended actions: long-running background task lifecycle
//!
//! An xaction wraps every long-running job (rebalance, EC encode, mirror
//! fill, bucket copy) with uniform accounting and cancellation: an abort
//! token closed exactly once, start/end timestamps, and atomic object/byte
//! counters. The demand variant self-terminates after staying idle, with a
//! renew token and a pending-work refcount bracketing external callers.

use crate::cluster::Bck;
use crate::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Demand xactions check for idleness this often unless told otherwise
pub const XACT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

fn unix_nano_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Xact
// =============================================================================

/// Common interface of all extended actions
pub trait Xact: Send + Sync {
    fn base(&self) -> &XactBase;

    fn id(&self) -> i64 {
        self.base().id
    }
    fn kind(&self) -> &str {
        &self.base().kind
    }
    fn bck(&self) -> Option<&Bck> {
        self.base().bck.as_ref()
    }
    fn finished(&self) -> bool {
        self.base().finished()
    }
    fn aborted(&self) -> bool {
        self.base().aborted()
    }
    fn abort(&self) {
        self.base().abort()
    }
    fn abort_token(&self) -> CancellationToken {
        self.base().abort_token()
    }
    fn objects_count(&self) -> i64 {
        self.base().objects.load(Ordering::Relaxed)
    }
    fn bytes_count(&self) -> i64 {
        self.base().bytes.load(Ordering::Relaxed)
    }
}

// =============================================================================
// XactBase
// =============================================================================

/// Partially implements [`Xact`]; concrete xactions embed it
pub struct XactBase {
    id: i64,
    /// Global sequence (e.g. the rebalance ID); 0 when not applicable
    gid: AtomicI64,
    kind: String,
    bck: Option<Bck>,
    sutime: AtomicI64,
    eutime: AtomicI64,
    aborted: AtomicBool,
    abort: CancellationToken,
    pub objects: AtomicI64,
    pub bytes: AtomicI64,
}

impl XactBase {
    pub fn new(id: i64, kind: impl Into<String>) -> Self {
        Self {
            id,
            gid: AtomicI64::new(0),
            kind: kind.into(),
            bck: None,
            sutime: AtomicI64::new(unix_nano_now()),
            eutime: AtomicI64::new(0),
            aborted: AtomicBool::new(false),
            abort: CancellationToken::new(),
            objects: AtomicI64::new(0),
            bytes: AtomicI64::new(0),
        }
    }

    pub fn with_bucket(id: i64, kind: impl Into<String>, bck: Bck) -> Self {
        let mut base = Self::new(id, kind);
        base.bck = Some(bck);
        base
    }

    pub fn set_gid(&self, gid: i64) {
        self.gid.store(gid, Ordering::Relaxed);
    }

    pub fn gid(&self) -> i64 {
        self.gid.load(Ordering::Relaxed)
    }

    pub fn start_time(&self) -> i64 {
        self.sutime.load(Ordering::Relaxed)
    }

    /// End timestamp in unix nanos; 0 while still running
    pub fn end_time(&self) -> i64 {
        self.eutime.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> bool {
        self.end_time() != 0
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Stamp the end time; idempotent
    pub fn finish(&self) {
        let _ = self
            .eutime
            .compare_exchange(0, unix_nano_now(), Ordering::AcqRel, Ordering::Relaxed);
    }

    /// Abort: set the flag, stamp the end time and close the abort token,
    /// exactly once
    pub fn abort(&self) {
        if self
            .aborted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            info!("already aborted: {self}");
            return;
        }
        self.finish();
        self.abort.cancel();
        info!("ABORT: {self}");
    }

    /// The token cancelled by [`abort`](Self::abort); loops select on it
    /// at every iteration and I/O boundary
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Sleep `dur`, reporting whether an abort happened meanwhile
    pub async fn aborted_after(&self, dur: Duration) -> bool {
        tokio::select! {
            _ = self.abort.cancelled() => true,
            _ = tokio::time::sleep(dur) => self.aborted(),
        }
    }

    pub fn objects_inc(&self) -> i64 {
        self.objects.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn bytes_add(&self, size: i64) -> i64 {
        self.bytes.fetch_add(size, Ordering::Relaxed) + size
    }
}

impl Xact for XactBase {
    fn base(&self) -> &XactBase {
        self
    }
}

impl fmt::Display for XactBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut prefix = self.kind.clone();
        if let Some(bck) = &self.bck {
            prefix.push('@');
            prefix.push_str(&bck.name);
        }
        let gid = self.gid();
        if !self.finished() {
            if gid == 0 {
                write!(f, "{}({})", prefix, self.id)
            } else {
                write!(f, "{}[{}, g{}]", prefix, self.id, gid)
            }
        } else {
            let elapsed = Duration::from_nanos(
                (self.end_time() - self.start_time()).max(0) as u64,
            );
            write!(f, "{}({}) finished in {:?}", prefix, self.id, elapsed)
        }
    }
}

// =============================================================================
// XactDemand
// =============================================================================

/// An xaction that self-terminates after staying idle for a while, with an
/// added capability to renew itself and refcount its pending work
pub struct XactDemandBase {
    base: XactBase,
    idle: Duration,
    renew: AtomicI64,
    pending: AtomicI64,
}

impl XactDemandBase {
    pub fn new(id: i64, kind: impl Into<String>, bck: Option<Bck>, idle: Option<Duration>) -> Self {
        let base = match bck {
            Some(b) => XactBase::with_bucket(id, kind, b),
            None => XactBase::new(id, kind),
        };
        Self {
            base,
            idle: idle.unwrap_or(XACT_IDLE_TIMEOUT),
            renew: AtomicI64::new(0),
            pending: AtomicI64::new(0),
        }
    }

    /// Ticker for idleness checks; call [`timeout`](Self::timeout) on
    /// every tick
    pub fn idle_ticker(&self) -> tokio::time::Interval {
        let mut interval = tokio::time::interval(self.idle);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    }

    /// Mark the xaction as recently used; see [`timeout`](Self::timeout)
    pub fn renew(&self) {
        self.renew.store(1, Ordering::Release);
    }

    pub fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_pending(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    /// True when there is no pending work and the renew token has not been
    /// refreshed since the previous tick
    pub fn timeout(&self) -> bool {
        if self.pending() > 0 {
            return false;
        }
        self.renew.fetch_sub(1, Ordering::AcqRel) - 1 < 0
    }

    /// Error returned to control paths that reference this xaction after
    /// self-termination
    pub fn expired_err(&self) -> Error {
        Error::XactExpired(format!("{}", self.base))
    }

    pub fn guard(&self) -> PendingGuard<'_> {
        self.inc_pending();
        self.renew();
        PendingGuard { x: self }
    }
}

impl Xact for XactDemandBase {
    fn base(&self) -> &XactBase {
        &self.base
    }
}

/// Brackets one external caller; dropping it decrements the pending count
pub struct PendingGuard<'a> {
    x: &'a XactDemandBase,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.x.dec_pending();
    }
}

/// Check an xaction is still usable from a control path
pub fn check_not_expired(x: &XactDemandBase) -> Result<()> {
    if x.finished() {
        return Err(x.expired_err());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_once() {
        let x = XactBase::new(1, "test");
        assert!(!x.finished());
        assert!(!x.aborted());

        x.abort();
        assert!(x.aborted());
        assert!(x.finished());
        assert!(x.abort_token().is_cancelled());

        let end = x.end_time();
        x.abort(); // second abort is a no-op
        assert_eq!(x.end_time(), end);
    }

    #[test]
    fn test_counters() {
        let x = XactBase::new(2, "test");
        assert_eq!(x.objects_inc(), 1);
        assert_eq!(x.objects_inc(), 2);
        assert_eq!(x.bytes_add(100), 100);
        assert_eq!(x.bytes_add(50), 150);
        assert_eq!(x.objects_count(), 2);
        assert_eq!(x.bytes_count(), 150);
    }

    #[test]
    fn test_finish_stamps_end_once() {
        let x = XactBase::new(3, "test");
        x.finish();
        let end = x.end_time();
        assert!(end > 0);
        x.finish();
        assert_eq!(x.end_time(), end);
        assert!(!x.aborted());
    }

    #[test]
    fn test_demand_timeout_semantics() {
        let x = XactDemandBase::new(4, "demand", None, Some(Duration::from_millis(10)));

        // pending work blocks timeout regardless of the renew token
        x.inc_pending();
        assert!(!x.timeout());
        x.dec_pending();

        // renewed: first tick consumes the token, second tick times out
        x.renew();
        assert!(!x.timeout());
        assert!(x.timeout());
    }

    #[test]
    fn test_demand_guard() {
        let x = XactDemandBase::new(5, "demand", None, None);
        {
            let _g = x.guard();
            assert_eq!(x.pending(), 1);
            assert!(!x.timeout());
        }
        assert_eq!(x.pending(), 0);
    }

    #[tokio::test]
    async fn test_aborted_after() {
        let x = XactBase::new(6, "test");
        assert!(!x.aborted_after(Duration::from_millis(1)).await);
        x.abort();
        assert!(x.aborted_after(Duration::from_millis(1)).await);
    }

    #[test]
    fn test_display() {
        let x = XactBase::with_bucket(7, "mirror", Bck::ais("b1"));
        assert_eq!(format!("{x}"), "mirror@b1(7)");
        x.set_gid(3);
        assert_eq!(format!("{x}"), "mirror@b1[7, g3]");
    }
}
