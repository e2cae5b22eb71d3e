//! Cluster-wide synchronization at rebalance stage boundaries
//!
//! Push notifications pre-populate the per-sender stage cache, but every
//! wait loop falls through to polling the peer's status endpoint: polls
//! are authoritative, pushes only save round trips. All loops run under a
//! bounded wait budget and re-check the abort token between probes.

use crate::cluster::{Smap, Snode};
use crate::config::{keepalive_retry_duration, Config};
use crate::reb::{RebManager, RebStage, RebStatus};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Intra-cluster control exchanges of the rebalance protocol
#[async_trait]
pub trait RebPeers: Send + Sync {
    /// Liveness probe
    async fn health(&self, node: &Snode) -> crate::Result<()>;

    /// Authoritative stage/status poll
    async fn status(&self, node: &Snode) -> crate::Result<RebStatus>;

    /// Advisory stage announcement
    async fn push(&self, node: &Snode, req: &super::PushReq) -> crate::Result<()>;

    /// Object ACK back to the sender, keyed by uname
    async fn ack(&self, node: &Snode, sender: &str, uname: &str) -> crate::Result<()>;
}

/// Immutable per-round context shared by the wait loops
pub struct GlobArgs {
    pub smap: Arc<Smap>,
    pub config: Arc<Config>,
}

/// Per-peer synchronization callback; returns success
pub type SyncCb = for<'a> fn(&'a RebManager, &'a Snode, &'a GlobArgs) -> BoxFuture<'a, bool>;

/// Run `cb` against every other target concurrently; returns the number
/// of failures
pub async fn bcast(mgr: &RebManager, md: &GlobArgs, cb: SyncCb) -> usize {
    let calls = md
        .smap
        .tmap
        .values()
        .filter(|node| node.daemon_id != mgr.node_id())
        .map(|node| cb(mgr, node, md));
    futures::future::join_all(calls)
        .await
        .into_iter()
        .filter(|ok| !ok)
        .count()
}

/// Wait until every other target reaches `stage`; returns the number of
/// peers that never did
pub async fn bcast_wait_stage(mgr: &RebManager, md: &GlobArgs, stage: RebStage) -> usize {
    let calls = md
        .smap
        .tmap
        .values()
        .filter(|node| node.daemon_id != mgr.node_id())
        .map(|node| wait_stage(mgr, node, md, stage));
    futures::future::join_all(calls)
        .await
        .into_iter()
        .filter(|ok| !ok)
        .count()
}

// =============================================================================
// Callbacks
// =============================================================================

/// Probe a target 3 times before giving up; a newer local Smap meanwhile
/// means this round already lost
pub fn ping_target<'a>(
    mgr: &'a RebManager,
    node: &'a Snode,
    md: &'a GlobArgs,
) -> BoxFuture<'a, bool> {
    async move {
        let sleep = md.config.timeout.cplane_operation;
        for attempt in 0..3 {
            match mgr.peers().health(node).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!("{}: {node} is online", mgr.loghdr());
                    }
                    return true;
                }
                Err(e) => warn!("{}: waiting for {node}, err {e}", mgr.loghdr()),
            }
            tokio::time::sleep(sleep).await;
            if mgr.smap_version() > md.smap.version {
                return false;
            }
        }
        warn!("{}: timed out waiting for {node}", mgr.loghdr());
        false
    }
    .boxed()
}

/// Wait for a target to get ready to receive objects (stage >= Traverse)
pub fn rx_ready<'a>(
    mgr: &'a RebManager,
    node: &'a Snode,
    md: &'a GlobArgs,
) -> BoxFuture<'a, bool> {
    async move {
        let sleep = md.config.timeout.cplane_operation * 2;
        let maxwt = md.config.rebalance.dest_retry_time
            + md.config.rebalance.dest_retry_time / 2;
        let mut curwt = Duration::ZERO;
        while curwt < maxwt {
            if mgr.is_node_in_stage(node, RebStage::Traverse) {
                // push notification arrived; skip the poll
                return true;
            }
            if let PollOutcome::Reached = check_status(mgr, node, md, RebStage::Traverse).await {
                return true;
            }
            if mgr.aborted() {
                debug!("{}: abrt rx-ready", mgr.loghdr());
                return false;
            }
            tokio::time::sleep(sleep).await;
            curwt += sleep;
        }
        warn!(
            "{}: timed out waiting for {node} to reach {}",
            mgr.loghdr(),
            RebStage::Traverse.name()
        );
        false
    }
    .boxed()
}

/// Wait for the target to reach Fin. A target stuck in WaitAck that is
/// waiting for ACKs from *this* node keeps us waiting; one waiting on
/// someone else counts as done.
pub fn wait_fin_extended<'a>(
    mgr: &'a RebManager,
    node: &'a Snode,
    md: &'a GlobArgs,
) -> BoxFuture<'a, bool> {
    async move {
        let sleep = md.config.timeout.cplane_operation;
        let sleep_retry = keepalive_retry_duration(&md.config);
        let maxwt = md.config.rebalance.dest_retry_time;
        let mut curwt = Duration::ZERO;
        while curwt < maxwt {
            if mgr.aborted() {
                debug!("{}: abrt wack", mgr.loghdr());
                return false;
            }
            if mgr.is_node_in_stage(node, RebStage::Fin) {
                return true;
            }
            curwt += sleep;
            let status = match check_status(mgr, node, md, RebStage::Fin).await {
                PollOutcome::Reached => return true,
                PollOutcome::Fatal => return false,
                PollOutcome::NotYet(status) => status,
            };
            if status.stage <= RebStage::EcNamespace as u32 {
                info!(
                    "{}: keep waiting for {node}[{}]",
                    mgr.loghdr(),
                    RebStage::from_u32(status.stage).name()
                );
                tokio::time::sleep(sleep_retry).await;
                curwt += sleep_retry;
                if status.stage != RebStage::Inactive as u32 {
                    curwt = Duration::ZERO; // traversal still running; wait it out
                }
                continue;
            }
            // node in WaitAck: is it waiting for me?
            let w4me = status.tmap.contains_key(mgr.node_id());
            if !w4me {
                info!(
                    "{}: {node}[{}] ok (not waiting for me)",
                    mgr.loghdr(),
                    RebStage::from_u32(status.stage).name()
                );
                return true;
            }
            info!("{}: keep wack <= {node}", mgr.loghdr());
            tokio::time::sleep(sleep_retry).await;
            curwt += sleep_retry;
        }
        warn!(
            "{}: timed out waiting for {node} to reach {}",
            mgr.loghdr(),
            RebStage::Fin.name()
        );
        false
    }
    .boxed()
}

/// Generic wait for a stage, cache first, poll second
pub fn wait_stage<'a>(
    mgr: &'a RebManager,
    node: &'a Snode,
    md: &'a GlobArgs,
    stage: RebStage,
) -> BoxFuture<'a, bool> {
    async move {
        let sleep = md.config.timeout.cplane_operation * 2;
        let maxwt = md.config.rebalance.dest_retry_time
            + md.config.rebalance.dest_retry_time / 2;
        let mut curwt = Duration::ZERO;
        while curwt < maxwt {
            if mgr.is_node_in_stage(node, stage) {
                return true;
            }
            if let PollOutcome::Reached = check_status(mgr, node, md, stage).await {
                return true;
            }
            if mgr.aborted() {
                return false;
            }
            tokio::time::sleep(sleep).await;
            curwt += sleep;
        }
        false
    }
    .boxed()
}

// =============================================================================
// The authoritative poll
// =============================================================================

pub enum PollOutcome {
    /// Peer is at (or past) the desired stage
    Reached,
    /// Keep waiting; carries the last status for extended checks
    NotYet(RebStatus),
    /// This round lost (newer Smap/RebID elsewhere) or the peer is gone
    Fatal,
}

/// Poll one peer's status and enforce Smap and rebalance-ID consistency
/// across the round; may abort the local rebalance
pub async fn check_status(
    mgr: &RebManager,
    node: &Snode,
    md: &GlobArgs,
    desired: RebStage,
) -> PollOutcome {
    let ver = md.smap.version;
    let status = match mgr.peers().status(node).await {
        Ok(status) => status,
        Err(_) => {
            // retry once before giving up on the peer
            tokio::time::sleep(keepalive_retry_duration(&md.config)).await;
            match mgr.peers().status(node).await {
                Ok(status) => status,
                Err(e) => {
                    warn!("{}: failed to call {node}: {e}", mgr.loghdr());
                    mgr.abort();
                    return PollOutcome::Fatal;
                }
            }
        }
    };

    // enforce Smap consistency across this round
    let (tver, rver) = (status.smap_version, status.reb_version);
    if tver > ver || rver > ver {
        warn!(
            "{}: {node} has newer Smap (v{tver}, v{rver}) - aborting",
            mgr.loghdr()
        );
        mgr.abort();
        return PollOutcome::Fatal;
    }
    // enforce the same global rebalance transaction
    if status.glob_reb_id > mgr.glob_reb_id() {
        warn!(
            "{}: {node} runs newer (g{}) transaction - aborting",
            mgr.loghdr(),
            status.glob_reb_id
        );
        mgr.abort();
        return PollOutcome::Fatal;
    }
    // let the target catch up
    if tver < ver || rver < ver {
        debug!(
            "{}: {node} has older Smap (v{tver}, v{rver}) - keep waiting",
            mgr.loghdr()
        );
        return PollOutcome::NotYet(status);
    }
    if status.glob_reb_id < mgr.glob_reb_id() {
        debug!(
            "{}: {node} runs older (g{}) transaction - keep waiting",
            mgr.loghdr(),
            status.glob_reb_id
        );
        return PollOutcome::NotYet(status);
    }
    if status.stage >= desired as u32 {
        return PollOutcome::Reached;
    }
    debug!(
        "{}: {node}[{}] not yet at {}",
        mgr.loghdr(),
        RebStage::from_u32(status.stage).name(),
        desired.name()
    );
    PollOutcome::NotYet(status)
}
