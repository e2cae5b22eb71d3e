//! Global rebalance: staged, cluster-wide object redistribution
//!
//! Any Smap change that alters the target set schedules a rebalance with
//! a unique, monotone ID; a newer ID preempts an older run. Every target
//! walks its namespace, pushes misplaced objects to their new HRW mains,
//! tracks per-object ACKs, and synchronizes with its peers stage by
//! stage. Stage announcements travel as push notifications (advisory) and
//! via the status endpoint (authoritative, see [`bcast`]).
//!
//! The local replica stays authoritative for every object whose ACK never
//! arrives: rebalance completes partially rather than blocking the
//! cluster.

pub mod bcast;

pub use bcast::RebPeers;

use crate::cluster::{Bck, Bmd, Smap, SmapOwner, Snode};
use crate::config::{keepalive_retry_duration, Config};
use crate::ec::{self, EcPeers};
use crate::fs::TargetStore;
use crate::transport::{Extra, ObjAttrs, ObjHdr, Stream, StreamDispatcher};
use crate::xaction::XactBase;
use crate::{hrw, Error, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, error, info, warn};

const ACK_SHARDS: usize = 16;

// =============================================================================
// Stages
// =============================================================================

/// Rebalance stages, monotone within one run; EC stages are entered and
/// immediately left when no bucket has EC enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum RebStage {
    Inactive = 0,
    InitStreams = 1,
    Traverse = 2,
    EcNamespace = 3,
    EcDetect = 4,
    EcGlobRepair = 5,
    EcCleanup = 6,
    WaitAck = 7,
    Fin = 8,
    Done = 9,
}

impl RebStage {
    pub fn from_u32(v: u32) -> RebStage {
        match v {
            1 => RebStage::InitStreams,
            2 => RebStage::Traverse,
            3 => RebStage::EcNamespace,
            4 => RebStage::EcDetect,
            5 => RebStage::EcGlobRepair,
            6 => RebStage::EcCleanup,
            7 => RebStage::WaitAck,
            8 => RebStage::Fin,
            9 => RebStage::Done,
            _ => RebStage::Inactive,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RebStage::Inactive => "<inactive>",
            RebStage::InitStreams => "streams",
            RebStage::Traverse => "traverse",
            RebStage::EcNamespace => "ec-namespace",
            RebStage::EcDetect => "ec-detect",
            RebStage::EcGlobRepair => "ec-repair",
            RebStage::EcCleanup => "ec-cleanup",
            RebStage::WaitAck => "wack",
            RebStage::Fin => "fin",
            RebStage::Done => "done",
        }
    }
}

// =============================================================================
// Wire shapes
// =============================================================================

/// Rebalance stats carried in the status body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebStatsDelta {
    pub tx_reb_count: i64,
    pub tx_reb_size: i64,
    pub rx_reb_count: i64,
    pub rx_reb_size: i64,
}

/// Status served from the health endpoint; peers poll it to synchronize
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebStatus {
    /// Targets this node is still waiting for ACKs from
    #[serde(default)]
    pub tmap: BTreeMap<String, Snode>,
    #[serde(with = "i64_string")]
    pub smap_version: i64,
    #[serde(with = "i64_string")]
    pub reb_version: i64,
    #[serde(with = "i64_string")]
    pub glob_reb_id: i64,
    pub stats_delta: RebStatsDelta,
    pub stage: u32,
    pub aborted: bool,
    pub running: bool,
}

/// Push notification sent on every stage transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushReq {
    /// Sender's daemon ID
    pub sid: String,
    #[serde(rename = "rebid", with = "i64_string")]
    pub reb_id: i64,
    pub stage: u32,
    #[serde(default)]
    pub batch: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Vec<u8>>,
}

// numeric i64 fields cross the wire as JSON strings
mod i64_string {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &i64, s: S) -> Result<S::Ok, S::Error> {
        v.to_string().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Default)]
struct RebStats {
    tx_count: AtomicI64,
    tx_size: AtomicI64,
    rx_count: AtomicI64,
    rx_size: AtomicI64,
}

/// One target's rebalance coordinator; at most one run active at a time
pub struct RebManager {
    node_id: String,
    config: Arc<Config>,
    store: Arc<TargetStore>,
    smap_owner: Arc<SmapOwner>,
    peers: Arc<dyn RebPeers>,
    ec_peers: Option<Arc<dyn EcPeers>>,
    dispatcher: Arc<dyn StreamDispatcher>,

    stage: AtomicU32,
    glob_reb_id: AtomicI64,
    reb_smap: RwLock<Option<Arc<Smap>>>,
    /// Advisory per-sender stage cache fed by push notifications; the
    /// polling path stays authoritative
    node_stages: DashMap<String, (i64, u32)>,
    acks: Vec<Mutex<HashMap<String, Snode>>>,
    stats: RebStats,
    begin_stats: Mutex<RebStatsDelta>,
    xreb: Mutex<Option<Arc<XactBase>>>,
    streams: Mutex<HashMap<String, Arc<Stream>>>,
}

impl RebManager {
    pub fn new(
        node_id: impl Into<String>,
        config: Arc<Config>,
        store: Arc<TargetStore>,
        smap_owner: Arc<SmapOwner>,
        peers: Arc<dyn RebPeers>,
        ec_peers: Option<Arc<dyn EcPeers>>,
        dispatcher: Arc<dyn StreamDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            config,
            store,
            smap_owner,
            peers,
            ec_peers,
            dispatcher,
            stage: AtomicU32::new(RebStage::Inactive as u32),
            glob_reb_id: AtomicI64::new(0),
            reb_smap: RwLock::new(None),
            node_stages: DashMap::new(),
            acks: (0..ACK_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            stats: RebStats::default(),
            begin_stats: Mutex::new(RebStatsDelta::default()),
            xreb: Mutex::new(None),
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn stage(&self) -> RebStage {
        RebStage::from_u32(self.stage.load(Ordering::Acquire))
    }

    pub fn glob_reb_id(&self) -> i64 {
        self.glob_reb_id.load(Ordering::Acquire)
    }

    pub fn running(&self) -> bool {
        self.xreb.lock().as_ref().map(|x| !x.finished()).unwrap_or(false)
    }

    pub fn aborted(&self) -> bool {
        self.xreb.lock().as_ref().map(|x| x.aborted()).unwrap_or(false)
    }

    pub(crate) fn loghdr(&self) -> String {
        format!("t[{}][g{}]", self.node_id, self.glob_reb_id())
    }

    pub(crate) fn peers(&self) -> &Arc<dyn RebPeers> {
        &self.peers
    }

    pub(crate) fn smap_version(&self) -> i64 {
        self.smap_owner.get().version
    }

    // =========================================================================
    // Status / notifications
    // =========================================================================

    /// The status peers poll to synchronize stages
    pub fn status(&self) -> RebStatus {
        let mut status = RebStatus {
            smap_version: self.smap_owner.get().version,
            reb_version: self
                .reb_smap
                .read()
                .as_ref()
                .map(|s| s.version)
                .unwrap_or(0),
            glob_reb_id: self.glob_reb_id(),
            stage: self.stage.load(Ordering::Acquire),
            aborted: self.aborted(),
            running: self.running(),
            ..Default::default()
        };
        let begin = *self.begin_stats.lock();
        status.stats_delta = RebStatsDelta {
            tx_reb_count: self.stats.tx_count.load(Ordering::Relaxed) - begin.tx_reb_count,
            tx_reb_size: self.stats.tx_size.load(Ordering::Relaxed) - begin.tx_reb_size,
            rx_reb_count: self.stats.rx_count.load(Ordering::Relaxed) - begin.rx_reb_count,
            rx_reb_size: self.stats.rx_size.load(Ordering::Relaxed) - begin.rx_reb_size,
        };

        // in WaitAck, report whom we are still waiting for
        if status.stage == RebStage::WaitAck as u32 {
            for shard in &self.acks {
                for dest in shard.lock().values() {
                    status.tmap.insert(dest.daemon_id.clone(), dest.clone());
                }
            }
        }
        status
    }

    /// A peer entered a new stage; newer runs preempt ours
    pub fn handle_push(&self, req: PushReq) {
        if req.reb_id > self.glob_reb_id() && self.running() {
            warn!(
                "{}: {} runs newer (g{}) rebalance - aborting ours",
                self.loghdr(),
                req.sid,
                req.reb_id
            );
            self.abort();
        }
        self.node_stages.insert(req.sid, (req.reb_id, req.stage));
    }

    /// Destination committed one of our objects
    pub fn handle_ack(&self, uname: &str) {
        let shard = &self.acks[ack_shard(uname)];
        if shard.lock().remove(uname).is_none() {
            debug!("{}: stray ack for {uname}", self.loghdr());
        }
    }

    /// Receive side: commit an inbound object durably, then ACK the sender
    pub async fn handle_recv(&self, hdr: ObjHdr, data: bytes::Bytes) -> Result<()> {
        let provider = if hdr.bck_is_ais {
            crate::cluster::Provider::Ais
        } else {
            crate::cluster::Provider::Cloud
        };
        let bck = Bck::new(hdr.bucket.clone(), provider);
        let attrs = crate::fs::ObjectAttrs {
            size: hdr.attrs.size,
            atime: hdr.attrs.atime,
            cksum_type: hdr.attrs.cksum_type.clone(),
            cksum_value: hdr.attrs.cksum_value.clone(),
            version: hdr.attrs.version.clone(),
        };
        self.store
            .put_restored(&bck, &hdr.obj_name, &data, &attrs)?;
        self.stats.rx_count.fetch_add(1, Ordering::Relaxed);
        self.stats.rx_size.fetch_add(hdr.attrs.size, Ordering::Relaxed);

        let sender_id = String::from_utf8_lossy(&hdr.opaque).into_owned();
        let uname = bck.make_uname(&hdr.obj_name);
        if let Some(sender) = self.reb_lookup_node(&sender_id) {
            self.peers.ack(&sender, &self.node_id, &uname).await?;
        } else {
            warn!("{}: unknown sender {sender_id} for {uname}", self.loghdr());
        }
        Ok(())
    }

    fn reb_lookup_node(&self, id: &str) -> Option<Snode> {
        if let Some(smap) = self.reb_smap.read().as_ref() {
            if let Some(node) = smap.get_target(id) {
                return Some(node.clone());
            }
        }
        self.smap_owner.get().get_target(id).cloned()
    }

    pub(crate) fn is_node_in_stage(&self, node: &Snode, stage: RebStage) -> bool {
        match self.node_stages.get(&node.daemon_id) {
            Some(entry) => {
                let (reb_id, node_stage) = *entry;
                reb_id >= self.glob_reb_id() && node_stage >= stage as u32
            }
            None => false,
        }
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Watch for Smap versions that change the target set and run a
    /// rebalance round for each; newer rounds preempt older ones
    pub fn listen(self: Arc<Self>, bmd: Arc<Bmd>) -> tokio::task::JoinHandle<()> {
        let mgr = self;
        let mut rx = mgr.smap_owner.listeners().reg(&format!("reb-{}", mgr.node_id));
        tokio::spawn(async move {
            let mut last: Option<Arc<Smap>> = None;
            while let Some(version) = rx.recv().await {
                let smap = mgr.smap_owner.get();
                if smap.version < version {
                    continue; // stale notification
                }
                let changed = match &last {
                    Some(prev) => !prev.same_target_set(&smap),
                    None => true,
                };
                last = Some(smap.clone());
                if !changed || !mgr.config.rebalance.enabled {
                    continue;
                }
                let next_id = mgr.glob_reb_id() + 1;
                if mgr.running() {
                    mgr.abort();
                }
                if let Err(e) = mgr.run(smap, bmd.clone(), next_id).await {
                    error!("{}: rebalance failed: {e}", mgr.loghdr());
                }
            }
        })
    }

    /// Abort the current run and terminate its streams
    pub fn abort(&self) {
        if let Some(xreb) = self.xreb.lock().as_ref() {
            xreb.abort();
        }
        for stream in self.streams.lock().values() {
            stream.stop();
        }
    }

    // =========================================================================
    // The run
    // =========================================================================

    /// Execute one global rebalance round against `smap`
    pub async fn run(&self, smap: Arc<Smap>, bmd: Arc<Bmd>, reb_id: i64) -> Result<()> {
        if smap.get_target(&self.node_id).is_none() {
            debug!("t[{}]: not a member of v{}, skipping", self.node_id, smap.version);
            return Ok(());
        }

        // ---- init
        let xreb = Arc::new(XactBase::new(reb_id, "rebalance"));
        xreb.set_gid(reb_id);
        {
            let mut cur = self.xreb.lock();
            if let Some(prev) = cur.as_ref() {
                if !prev.finished() {
                    return Err(Error::Internal(format!(
                        "{}: previous round still running",
                        self.loghdr()
                    )));
                }
            }
            *cur = Some(xreb.clone());
        }
        self.glob_reb_id.store(reb_id, Ordering::Release);
        *self.reb_smap.write() = Some(smap.clone());
        *self.begin_stats.lock() = RebStatsDelta {
            tx_reb_count: self.stats.tx_count.load(Ordering::Relaxed),
            tx_reb_size: self.stats.tx_size.load(Ordering::Relaxed),
            rx_reb_count: self.stats.rx_count.load(Ordering::Relaxed),
            rx_reb_size: self.stats.rx_size.load(Ordering::Relaxed),
        };
        for shard in &self.acks {
            shard.lock().clear();
        }
        info!("{}: starting, reb version v{}", self.loghdr(), smap.version);

        let result = self.run_stages(&smap, &bmd, &xreb).await;

        // ---- teardown
        let streams: Vec<Arc<Stream>> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            if xreb.aborted() {
                stream.stop_and_join().await;
            } else {
                stream.fin().await;
            }
        }
        match &result {
            Ok(()) => {
                self.set_stage(&smap, RebStage::Done).await;
                info!("{}: done", self.loghdr());
            }
            Err(e) => {
                warn!("{}: {e}", self.loghdr());
                xreb.abort();
            }
        }
        xreb.finish();
        result
    }

    async fn run_stages(
        &self,
        smap: &Arc<Smap>,
        bmd: &Arc<Bmd>,
        xreb: &Arc<XactBase>,
    ) -> Result<()> {
        // 1. streams to every other target
        self.set_stage(smap, RebStage::InitStreams).await;
        {
            let mut streams = self.streams.lock();
            for node in smap.tmap.values() {
                if node.daemon_id == self.node_id {
                    continue;
                }
                let url = format!("{}/v1/reb", node.data_url());
                streams.insert(
                    node.daemon_id.clone(),
                    Arc::new(Stream::new(self.dispatcher.clone(), url, Extra::default())),
                );
            }
        }

        // 2. everyone must be alive
        let md = bcast::GlobArgs {
            smap: smap.clone(),
            config: self.config.clone(),
        };
        if bcast::bcast(self, &md, bcast::ping_target).await > 0 {
            return Err(Error::timeout(format!("{}: peer ping", self.loghdr())));
        }
        self.check_not_preempted(smap, xreb)?;

        // 3. traverse and transmit
        self.set_stage(smap, RebStage::Traverse).await;
        if bcast::bcast(self, &md, bcast::rx_ready).await > 0 {
            return Err(Error::timeout(format!("{}: receivers not ready", self.loghdr())));
        }
        self.traverse(smap, bmd, xreb).await?;

        // 4. EC stages; no-ops without EC buckets, but still announced
        let have_ec = bmd
            .ais_buckets
            .values()
            .chain(bmd.cloud_buckets.values())
            .any(|p| p.ec.enabled);
        for stage in [
            RebStage::EcNamespace,
            RebStage::EcDetect,
            RebStage::EcGlobRepair,
            RebStage::EcCleanup,
        ] {
            self.check_not_preempted(smap, xreb)?;
            self.set_stage(smap, stage).await;
            if have_ec {
                self.run_ec_stage(smap, bmd, stage).await?;
                bcast::bcast_wait_stage(self, &md, stage).await;
            }
        }

        // 5. wait for destination ACKs
        self.set_stage(smap, RebStage::WaitAck).await;
        self.wait_acks(&md, xreb).await;

        self.check_not_preempted(smap, xreb)?;
        self.set_stage(smap, RebStage::Fin).await;
        if bcast::bcast(self, &md, bcast::wait_fin_extended).await > 0 {
            warn!("{}: some peers never reached fin", self.loghdr());
        }
        Ok(())
    }

    // the local Smap moving past the rebalance version means a newer round
    // is (or will be) running; this one loses
    fn check_not_preempted(&self, smap: &Smap, xreb: &XactBase) -> Result<()> {
        if xreb.aborted() {
            return Err(Error::Aborted(self.loghdr()));
        }
        let cur = self.smap_owner.get();
        if cur.version > smap.version {
            return Err(Error::Aborted(format!(
                "{}: smap v{} > reb version v{}",
                self.loghdr(),
                cur.version,
                smap.version
            )));
        }
        Ok(())
    }

    async fn set_stage(&self, smap: &Smap, stage: RebStage) {
        self.stage.store(stage as u32, Ordering::Release);
        debug!("{}: => {}", self.loghdr(), stage.name());
        let req = PushReq {
            sid: self.node_id.clone(),
            reb_id: self.glob_reb_id(),
            stage: stage as u32,
            batch: 0,
            extra: None,
        };
        for node in smap.tmap.values() {
            if node.daemon_id == self.node_id {
                continue;
            }
            if let Err(e) = self.peers.push(node, &req).await {
                debug!("{}: push to {node} failed: {e}", self.loghdr());
            }
        }
    }

    // walk every bucket; transmit objects whose new main is another target
    async fn traverse(
        &self,
        smap: &Arc<Smap>,
        bmd: &Arc<Bmd>,
        xreb: &Arc<XactBase>,
    ) -> Result<()> {
        for bck in buckets_of(bmd) {
            for obj_name in self.store.walk_bucket(&bck)? {
                if xreb.aborted() {
                    return Err(Error::Aborted(self.loghdr()));
                }
                let uname = bck.make_uname(&obj_name);
                let main = hrw::hrw_target(&uname, smap)?;
                if main.daemon_id == self.node_id {
                    continue;
                }
                self.send_object(&bck, &obj_name, &uname, main, xreb).await;
            }
        }
        Ok(())
    }

    // bounded retries; a never-ACKed object stays pending and the local
    // replica remains authoritative
    async fn send_object(
        &self,
        bck: &Bck,
        obj_name: &str,
        uname: &str,
        dest: &Snode,
        xreb: &Arc<XactBase>,
    ) {
        let retries = self.config.rebalance.send_retries.max(1);
        for attempt in 0..retries {
            match self.send_object_once(bck, obj_name, uname, dest).await {
                Ok(size) => {
                    self.stats.tx_count.fetch_add(1, Ordering::Relaxed);
                    self.stats.tx_size.fetch_add(size, Ordering::Relaxed);
                    xreb.objects_inc();
                    xreb.bytes_add(size);
                    return;
                }
                Err(e) => {
                    warn!(
                        "{}: sending {uname} to {dest} (attempt {}): {e}",
                        self.loghdr(),
                        attempt + 1
                    );
                }
            }
        }
        // ack stays pending; reported from the status endpoint
    }

    async fn send_object_once(
        &self,
        bck: &Bck,
        obj_name: &str,
        uname: &str,
        dest: &Snode,
    ) -> Result<i64> {
        let (data, attrs) = self.store.peek_object(bck, obj_name)?;
        let size = attrs.size;
        let hdr = ObjHdr {
            bucket: bck.name.clone(),
            obj_name: obj_name.to_string(),
            bck_is_ais: bck.is_ais(),
            opaque: self.node_id.as_bytes().to_vec(),
            attrs: ObjAttrs {
                size,
                atime: attrs.atime,
                cksum_type: attrs.cksum_type,
                cksum_value: attrs.cksum_value,
                version: attrs.version,
            },
        };
        let stream = self
            .streams
            .lock()
            .get(&dest.daemon_id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no stream to {dest}")))?;

        // record before transmitting: the ACK may race the completion
        self.acks[ack_shard(uname)]
            .lock()
            .insert(uname.to_string(), dest.clone());

        let reader: Box<dyn AsyncRead + Send + Unpin> =
            Box::new(std::io::Cursor::new(data.to_vec()));
        stream.send(hdr, Some(reader), None, None).await?;
        Ok(size)
    }

    fn pending_acks(&self) -> usize {
        self.acks.iter().map(|s| s.lock().len()).sum()
    }

    // wait for destinations to confirm; on timeout, log and move on
    async fn wait_acks(&self, md: &bcast::GlobArgs, xreb: &Arc<XactBase>) {
        let sleep = keepalive_retry_duration(&md.config);
        let maxwt = md.config.rebalance.dest_retry_time;
        let mut waited = std::time::Duration::ZERO;
        while self.pending_acks() > 0 && waited < maxwt {
            if xreb.aborted() {
                return;
            }
            debug!("{}: waiting for {} acks", self.loghdr(), self.pending_acks());
            tokio::time::sleep(sleep).await;
            waited += sleep;
        }
        let left = self.pending_acks();
        if left > 0 {
            warn!(
                "{}: timed out with {left} acks pending; local replicas stay authoritative",
                self.loghdr()
            );
        }
    }

    // =========================================================================
    // EC stages
    // =========================================================================

    // namespace/detect are folded into one local pass per stage entry: the
    // slice listing is cheap and recomputing it keeps the stages stateless
    async fn run_ec_stage(
        &self,
        smap: &Arc<Smap>,
        bmd: &Arc<Bmd>,
        stage: RebStage,
    ) -> Result<()> {
        let Some(ec_peers) = &self.ec_peers else {
            return Ok(());
        };
        match stage {
            RebStage::EcNamespace | RebStage::EcDetect => Ok(()),
            RebStage::EcGlobRepair => self.ec_repair(smap, bmd, ec_peers).await,
            RebStage::EcCleanup => self.ec_cleanup(smap, bmd).await,
            _ => Ok(()),
        }
    }

    // move local slices/replicas whose holder changed under the new Smap
    async fn ec_repair(
        &self,
        smap: &Arc<Smap>,
        bmd: &Arc<Bmd>,
        ec_peers: &Arc<dyn EcPeers>,
    ) -> Result<()> {
        for bck in buckets_of(bmd).into_iter().filter(has_ec) {
            let ec_conf = bck.props.as_ref().map(|p| p.ec.clone()).unwrap_or_default();
            let total = ec_conf.data_slices + ec_conf.parity_slices;
            for obj_name in ec::list_meta(&self.store, &bck)? {
                let Some((meta, data)) = ec::load_part(&self.store, &bck, &obj_name)? else {
                    continue;
                };
                let uname = bck.make_uname(&obj_name);
                let Ok(targets) = hrw::hrw_target_list(&uname, smap, 1 + total) else {
                    continue;
                };
                let proper = if meta.slice_id == 0 {
                    targets[0]
                } else {
                    targets[meta.slice_id.min(total)]
                };
                if proper.daemon_id == self.node_id {
                    continue;
                }
                debug!(
                    "{}: ec part {uname}[{}] moves to {proper}",
                    self.loghdr(),
                    meta.slice_id
                );
                if let Err(e) = ec_peers
                    .put_part(proper, &bck, &obj_name, &meta, data.clone())
                    .await
                {
                    warn!("{}: ec repair of {uname} failed: {e}", self.loghdr());
                }
            }
        }
        Ok(())
    }

    // drop parts that no longer place on this node; only after repair
    async fn ec_cleanup(&self, smap: &Arc<Smap>, bmd: &Arc<Bmd>) -> Result<()> {
        for bck in buckets_of(bmd).into_iter().filter(has_ec) {
            let ec_conf = bck.props.as_ref().map(|p| p.ec.clone()).unwrap_or_default();
            let total = ec_conf.data_slices + ec_conf.parity_slices;
            for obj_name in ec::list_meta(&self.store, &bck)? {
                let Some(meta) = ec::load_meta(&self.store, &bck, &obj_name)? else {
                    continue;
                };
                let uname = bck.make_uname(&obj_name);
                let Ok(targets) = hrw::hrw_target_list(&uname, smap, 1 + total) else {
                    continue;
                };
                let proper = if meta.slice_id == 0 {
                    targets[0]
                } else {
                    targets[meta.slice_id.min(total)]
                };
                if proper.daemon_id != self.node_id {
                    debug!("{}: dropping stale ec part {uname}", self.loghdr());
                    let _ = ec::delete_parts(&self.store, &bck, &obj_name);
                }
            }
        }
        Ok(())
    }
}

fn ack_shard(uname: &str) -> usize {
    (hrw::hash64(uname.as_bytes()) as usize) % ACK_SHARDS
}

fn buckets_of(bmd: &Bmd) -> Vec<Bck> {
    let mut out = Vec::with_capacity(bmd.count());
    for (name, props) in &bmd.ais_buckets {
        let mut bck = Bck::ais(name.clone());
        bck.props = Some(props.clone());
        out.push(bck);
    }
    for (name, props) in &bmd.cloud_buckets {
        let mut bck = Bck::new(name.clone(), crate::cluster::Provider::Cloud);
        bck.props = Some(props.clone());
        out.push(bck);
    }
    out
}

fn has_ec(bck: &Bck) -> bool {
    bck.props.as_ref().map(|p| p.ec.enabled).unwrap_or(false)
}

// =============================================================================
// In-memory peers (tests, single-process clusters)
// =============================================================================

/// Control-plane peer transport wired directly between in-process
/// managers
#[derive(Default)]
pub struct MemRebPeers {
    managers: DashMap<String, Arc<RebManager>>,
    down: DashMap<String, ()>,
}

impl MemRebPeers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, mgr: Arc<RebManager>) {
        self.managers.insert(mgr.node_id().to_string(), mgr);
    }

    pub fn set_down(&self, node_id: &str, down: bool) {
        if down {
            self.down.insert(node_id.to_string(), ());
        } else {
            self.down.remove(node_id);
        }
    }

    fn resolve(&self, node: &Snode) -> Result<Arc<RebManager>> {
        if self.down.contains_key(&node.daemon_id) {
            return Err(Error::timeout(format!("{node}")));
        }
        self.managers
            .get(&node.daemon_id)
            .map(|m| m.clone())
            .ok_or_else(|| Error::Internal(format!("{node} not registered")))
    }
}

#[async_trait::async_trait]
impl RebPeers for MemRebPeers {
    async fn health(&self, node: &Snode) -> Result<()> {
        self.resolve(node).map(|_| ())
    }

    async fn status(&self, node: &Snode) -> Result<RebStatus> {
        Ok(self.resolve(node)?.status())
    }

    async fn push(&self, node: &Snode, req: &PushReq) -> Result<()> {
        self.resolve(node)?.handle_push(req.clone());
        Ok(())
    }

    async fn ack(&self, node: &Snode, _sender: &str, uname: &str) -> Result<()> {
        self.resolve(node)?.handle_ack(uname);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_ordering() {
        assert!(RebStage::Traverse < RebStage::WaitAck);
        assert!(RebStage::WaitAck < RebStage::Fin);
        assert_eq!(RebStage::from_u32(7), RebStage::WaitAck);
        assert_eq!(RebStage::from_u32(99), RebStage::Inactive);
    }

    #[test]
    fn test_status_wire_shape() {
        let status = RebStatus {
            smap_version: 12,
            reb_version: 12,
            glob_reb_id: 3,
            stage: RebStage::WaitAck as u32,
            running: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&status).unwrap();
        // i64s cross the wire as strings
        assert!(json.contains("\"smap_version\":\"12\""));
        assert!(json.contains("\"glob_reb_id\":\"3\""));

        let back: RebStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.smap_version, 12);
        assert_eq!(back.glob_reb_id, 3);
        assert_eq!(back.stage, RebStage::WaitAck as u32);
    }

    #[test]
    fn test_push_req_roundtrip() {
        let req = PushReq {
            sid: "t1".into(),
            reb_id: 5,
            stage: RebStage::Traverse as u32,
            batch: 0,
            extra: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"rebid\":\"5\""));
        let back: PushReq = serde_json::from_str(&json).unwrap();
        assert_eq!(back.reb_id, 5);
        assert_eq!(back.sid, "t1");
    }

    #[test]
    fn test_ack_sharding_stable() {
        for uname in ["ais/b/o1", "ais/b/o2", "cloud/x/y"] {
            assert_eq!(ack_shard(uname), ack_shard(uname));
            assert!(ack_shard(uname) < ACK_SHARDS);
        }
    }
}
