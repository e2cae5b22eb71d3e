//! EC engine: encode on put, restore on get, cluster-wide delete
//!
//! Runs on the main target of each object (the first target in HRW
//! order). Peers hold one replica or slice each and answer metadata
//! queries; the [`EcPeers`] seam carries those exchanges so the engine
//! works the same against HTTP peers and in-memory test clusters.

use crate::cluster::{Bck, EcConf, Smap, Snode};
use crate::config::EcTuneConf;
use crate::ec::{self, Codec, Metadata, HEADER_EC_META};
use crate::fs::{ObjectAttrs, TargetStore};
use crate::hrw;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Peer seam
// =============================================================================

/// Intra-cluster EC exchanges; production goes over HTTP, tests run
/// against an in-memory cluster
#[async_trait]
pub trait EcPeers: Send + Sync {
    /// Store a replica or slice (plus sidecar) on `node`
    async fn put_part(
        &self,
        node: &Snode,
        bck: &Bck,
        obj_name: &str,
        meta: &Metadata,
        data: Bytes,
    ) -> Result<()>;

    /// Fetch the metadata sidecar from `node`, if it has one
    async fn get_meta(&self, node: &Snode, bck: &Bck, obj_name: &str) -> Result<Option<Metadata>>;

    /// Fetch a replica or slice with its sidecar
    async fn get_part(
        &self,
        node: &Snode,
        bck: &Bck,
        obj_name: &str,
    ) -> Result<Option<(Metadata, Bytes)>>;

    /// Remove the part and sidecar; missing parts are not an error
    async fn delete(&self, node: &Snode, bck: &Bck, obj_name: &str) -> Result<()>;
}

// =============================================================================
// Engine
// =============================================================================

pub struct EcEngine {
    node_id: String,
    store: Arc<TargetStore>,
    peers: Arc<dyn EcPeers>,
    tune: EcTuneConf,
}

impl EcEngine {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<TargetStore>,
        peers: Arc<dyn EcPeers>,
        tune: EcTuneConf,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            peers,
            tune,
        }
    }

    pub fn store(&self) -> &Arc<TargetStore> {
        &self.store
    }

    pub fn tune(&self) -> &EcTuneConf {
        &self.tune
    }

    fn ec_conf<'a>(&self, bck: &'a Bck) -> Result<&'a EcConf> {
        match bck.props.as_ref().map(|p| &p.ec) {
            Some(ec) if ec.enabled => Ok(ec),
            _ => Err(Error::EcDisabled(bck.name.clone())),
        }
    }

    // =========================================================================
    // Put
    // =========================================================================

    /// Store the full object locally and fan out replicas or slices.
    ///
    /// An unreachable peer aborts the put: the object is not committed.
    pub async fn encode_put(
        &self,
        bck: &Bck,
        obj_name: &str,
        data: Bytes,
        version: &str,
        smap: &Smap,
    ) -> Result<ObjectAttrs> {
        let ec = self.ec_conf(bck)?;
        let size = data.len() as i64;
        let uname = bck.make_uname(obj_name);
        let targets = hrw::hrw_target_list(&uname, smap, 1 + ec.num_peers(size))?;
        if targets[0].daemon_id != self.node_id {
            return Err(Error::Internal(format!(
                "{uname}: t[{}] is not the main target (main is {})",
                self.node_id, targets[0]
            )));
        }

        let attrs = self.store.put_object(bck, obj_name, &data, version)?;
        let main_meta = Metadata {
            size,
            obj_cksum: attrs.cksum_value.clone(),
            obj_version: version.to_string(),
            data: ec.data_slices,
            parity: ec.parity_slices,
            slice_id: 0,
            is_copy: ec.is_copy(size),
            ..Default::default()
        };
        ec::write_meta(&self.store, bck, obj_name, &main_meta)?;

        let result = if ec.is_copy(size) {
            self.fan_out_replicas(bck, obj_name, &targets[1..], &main_meta, data)
                .await
        } else {
            self.fan_out_slices(bck, obj_name, &targets[1..], &main_meta, ec, data)
                .await
        };
        if let Err(e) = result {
            // not committed: roll the local state back
            warn!("{uname}: aborting put: {e}");
            let _ = ec::delete_parts(&self.store, bck, obj_name);
            let _ = self.store.delete_object(bck, obj_name);
            return Err(e);
        }
        Ok(attrs)
    }

    // full copies to the next `parity` targets; the shared `Bytes` is the
    // fan-out refcount, freed on the last send
    async fn fan_out_replicas(
        &self,
        bck: &Bck,
        obj_name: &str,
        peers: &[&Snode],
        main_meta: &Metadata,
        data: Bytes,
    ) -> Result<()> {
        let sends = peers.iter().map(|peer| {
            let meta = Metadata {
                slice_id: 0,
                is_copy: true,
                ..main_meta.clone()
            };
            let data = data.clone();
            async move { self.peers.put_part(peer, bck, obj_name, &meta, data).await }
        });
        future::try_join_all(sends).await?;
        Ok(())
    }

    // slice i goes to peer i with slice_id = i + 1
    async fn fan_out_slices(
        &self,
        bck: &Bck,
        obj_name: &str,
        peers: &[&Snode],
        main_meta: &Metadata,
        ec: &EcConf,
        data: Bytes,
    ) -> Result<()> {
        let codec = Codec::new(ec.data_slices, ec.parity_slices)?;
        let slices = codec.encode(&data)?;
        drop(data); // slices hold their own copies from here on

        let sends = peers.iter().zip(slices).enumerate().map(|(i, (peer, slice))| {
            let meta = Metadata {
                slice_id: i + 1,
                is_copy: false,
                cksum_type: "blake3".to_string(),
                cksum_value: blake3::hash(&slice).to_hex().to_string(),
                ..main_meta.clone()
            };
            async move { self.peers.put_part(peer, bck, obj_name, &meta, slice).await }
        });
        future::try_join_all(sends).await?;
        Ok(())
    }

    // =========================================================================
    // Get / restore
    // =========================================================================

    /// Serve the object, restoring it from peers when the local copy is
    /// gone; a served GET advances the access time
    pub async fn get(&self, bck: &Bck, obj_name: &str, smap: &Smap) -> Result<(Bytes, ObjectAttrs)> {
        if !self.store.object_exists(bck, obj_name) {
            self.restore(bck, obj_name, smap).await?;
        }
        self.store.get_object(bck, obj_name)
    }

    /// Cold-cache pull: restore the object if missing without advancing
    /// its access time
    pub async fn prefetch(&self, bck: &Bck, obj_name: &str, smap: &Smap) -> Result<()> {
        if self.store.object_exists(bck, obj_name) {
            return Ok(());
        }
        self.restore(bck, obj_name, smap).await.map(|_| ())
    }

    // Pull surviving parts and rebuild the main copy; heals missing
    // slices and sidecars on their HRW holders
    async fn restore(&self, bck: &Bck, obj_name: &str, smap: &Smap) -> Result<Bytes> {
        let ec = self.ec_conf(bck)?;
        let uname = bck.make_uname(obj_name);
        let others: Vec<&Snode> = smap
            .tmap
            .values()
            .filter(|t| t.daemon_id != self.node_id)
            .collect();

        // 1. who has what
        let metas = future::join_all(others.iter().map(|node| {
            let uname = uname.clone();
            async move {
                match self.peers.get_meta(node, bck, obj_name).await {
                    Ok(meta) => meta.map(|m| (*node, m)),
                    Err(e) => {
                        warn!("{uname}: meta query to {node} failed: {e}");
                        None
                    }
                }
            }
        }))
        .await;
        let metas: Vec<(&Snode, Metadata)> = metas.into_iter().flatten().collect();
        if metas.is_empty() {
            return Err(Error::ObjectDoesNotExist(uname));
        }

        // 2. a surviving full replica wins
        for (node, _) in metas.iter().filter(|(_, m)| m.is_copy) {
            match self.peers.get_part(node, bck, obj_name).await {
                Ok(Some((meta, data)))
                    if blake3::hash(&data).to_hex().to_string() == meta.obj_cksum =>
                {
                    info!("{uname}: restored from replica on {node}");
                    self.commit_restored(bck, obj_name, &meta, &data)?;
                    return Ok(data);
                }
                Ok(_) => warn!("{uname}: replica on {node} unusable"),
                Err(e) => warn!("{uname}: replica pull from {node} failed: {e}"),
            }
        }

        // 3. reconstruct from any `data` of `data + parity` slices
        let total = ec.data_slices + ec.parity_slices;
        let mut slices: Vec<Option<Vec<u8>>> = vec![None; total];
        let mut obj_meta: Option<Metadata> = None;
        let pulls = metas
            .iter()
            .filter(|(_, m)| !m.is_copy && m.slice_id >= 1 && m.slice_id <= total);
        let parts = future::join_all(pulls.map(|(node, _)| {
            let node = *node;
            async move { (node, self.peers.get_part(node, bck, obj_name).await) }
        }))
        .await;
        for (node, part) in parts {
            match part {
                Ok(Some((meta, data))) => {
                    let idx = meta.slice_id - 1;
                    if !meta.cksum_value.is_empty()
                        && blake3::hash(&data).to_hex().to_string() != meta.cksum_value
                    {
                        warn!("{uname}: slice {} on {node} corrupt", meta.slice_id);
                        continue;
                    }
                    slices[idx] = Some(data.to_vec());
                    obj_meta.get_or_insert(meta);
                }
                Ok(None) => {}
                Err(e) => warn!("{uname}: slice pull from {node} failed: {e}"),
            }
        }

        let survivors = slices.iter().filter(|s| s.is_some()).count();
        if survivors < ec.data_slices {
            debug!("{uname}: only {survivors} of {} slices survive", ec.data_slices);
            return Err(Error::ObjectDoesNotExist(uname));
        }
        let meta = obj_meta.ok_or_else(|| Error::NoMetafile(uname.clone()))?;
        let missing: Vec<usize> = (0..total).filter(|i| slices[*i].is_none()).collect();

        let codec = Codec::new(ec.data_slices, ec.parity_slices)?;
        let data = codec.decode(&mut slices, meta.size)?;
        if blake3::hash(&data).to_hex().to_string() != meta.obj_cksum {
            return Err(Error::InvalidChecksum {
                expected: meta.obj_cksum.clone(),
                actual: blake3::hash(&data).to_hex().to_string(),
            });
        }
        info!("{uname}: reconstructed from {survivors}/{total} slices");
        self.commit_restored(bck, obj_name, &meta, &data)?;

        // 4. heal the losers: rewrite their slices and sidecars
        let targets = hrw::hrw_target_list(&uname, smap, 1 + total)?;
        for idx in missing {
            let holder = targets[1 + idx];
            let slice = slices[idx].as_ref().map(|s| Bytes::from(s.clone()));
            let Some(slice) = slice else { continue };
            let slice_meta = Metadata {
                slice_id: idx + 1,
                is_copy: false,
                cksum_type: "blake3".to_string(),
                cksum_value: blake3::hash(&slice).to_hex().to_string(),
                ..meta.clone()
            };
            if let Err(e) = self
                .peers
                .put_part(holder, bck, obj_name, &slice_meta, slice)
                .await
            {
                warn!("{uname}: healing slice {} on {holder} failed: {e}", idx + 1);
            }
        }
        Ok(data)
    }

    // restored objects keep a zeroed access time; only client GETs touch it
    fn commit_restored(
        &self,
        bck: &Bck,
        obj_name: &str,
        meta: &Metadata,
        data: &[u8],
    ) -> Result<()> {
        let attrs = ObjectAttrs {
            size: meta.size,
            atime: 0,
            cksum_type: "blake3".to_string(),
            cksum_value: meta.obj_cksum.clone(),
            version: meta.obj_version.clone(),
        };
        self.store.put_restored(bck, obj_name, data, &attrs)?;
        ec::write_meta(
            &self.store,
            bck,
            obj_name,
            &Metadata {
                slice_id: 0,
                ..meta.clone()
            },
        )
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove the object everywhere; the broadcast is best-effort, the
    /// rebalance EC-cleanup stage sweeps stragglers
    pub async fn delete(&self, bck: &Bck, obj_name: &str, smap: &Smap) -> Result<()> {
        ec::delete_parts(&self.store, bck, obj_name)?;
        match self.store.delete_object(bck, obj_name) {
            Ok(()) => {}
            Err(e) if e.is_obj_nought() => {}
            Err(e) => return Err(e),
        }
        for node in smap.tmap.values() {
            if node.daemon_id == self.node_id {
                continue;
            }
            if let Err(e) = self.peers.delete(node, bck, obj_name).await {
                warn!("{}: delete on {node} failed: {e}", bck.make_uname(obj_name));
            }
        }
        Ok(())
    }
}

// =============================================================================
// In-memory peers (tests, single-process clusters)
// =============================================================================

/// Peer transport backed by the target stores of an in-process cluster
#[derive(Default)]
pub struct MemEcPeers {
    stores: DashMap<String, Arc<TargetStore>>,
    down: DashMap<String, ()>,
}

impl MemEcPeers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node_id: impl Into<String>, store: Arc<TargetStore>) {
        self.stores.insert(node_id.into(), store);
    }

    /// Simulate a dead target: every exchange with it times out
    pub fn set_down(&self, node_id: &str, down: bool) {
        if down {
            self.down.insert(node_id.to_string(), ());
        } else {
            self.down.remove(node_id);
        }
    }

    fn resolve(&self, node: &Snode) -> Result<Arc<TargetStore>> {
        if self.down.contains_key(&node.daemon_id) {
            return Err(Error::timeout(format!("{node}")));
        }
        self.stores
            .get(&node.daemon_id)
            .map(|s| s.clone())
            .ok_or_else(|| Error::Internal(format!("{node} not registered")))
    }
}

#[async_trait]
impl EcPeers for MemEcPeers {
    async fn put_part(
        &self,
        node: &Snode,
        bck: &Bck,
        obj_name: &str,
        meta: &Metadata,
        data: Bytes,
    ) -> Result<()> {
        let store = self.resolve(node)?;
        ec::store_part(&store, bck, obj_name, meta, &data)
    }

    async fn get_meta(&self, node: &Snode, bck: &Bck, obj_name: &str) -> Result<Option<Metadata>> {
        let store = self.resolve(node)?;
        ec::load_meta(&store, bck, obj_name)
    }

    async fn get_part(
        &self,
        node: &Snode,
        bck: &Bck,
        obj_name: &str,
    ) -> Result<Option<(Metadata, Bytes)>> {
        let store = self.resolve(node)?;
        ec::load_part(&store, bck, obj_name)
    }

    async fn delete(&self, node: &Snode, bck: &Bck, obj_name: &str) -> Result<()> {
        let store = self.resolve(node)?;
        ec::delete_parts(&store, bck, obj_name)
    }
}

// =============================================================================
// HTTP peers
// =============================================================================

/// Production peer transport: EC exchanges over the intra-data network.
/// Metadata rides in the [`HEADER_EC_META`] header, base64(JSON).
pub struct HttpEcPeers {
    client: reqwest::Client,
}

impl HttpEcPeers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
        })
    }

    fn url(node: &Snode, bck: &Bck, obj_name: &str) -> String {
        format!(
            "{}/v1/ec/{}/{}/{}",
            node.data_url(),
            bck.provider,
            bck.name,
            obj_name
        )
    }
}

#[async_trait]
impl EcPeers for HttpEcPeers {
    async fn put_part(
        &self,
        node: &Snode,
        bck: &Bck,
        obj_name: &str,
        meta: &Metadata,
        data: Bytes,
    ) -> Result<()> {
        self.client
            .put(Self::url(node, bck, obj_name))
            .header(HEADER_EC_META, meta.to_base64()?)
            .body(data)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get_meta(&self, node: &Snode, bck: &Bck, obj_name: &str) -> Result<Option<Metadata>> {
        let resp = self
            .client
            .head(Self::url(node, bck, obj_name))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        let Some(value) = resp.headers().get(HEADER_EC_META) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .map_err(|e| Error::Ec(format!("metadata header: {e}")))?;
        Ok(Some(Metadata::from_base64(value)?))
    }

    async fn get_part(
        &self,
        node: &Snode,
        bck: &Bck,
        obj_name: &str,
    ) -> Result<Option<(Metadata, Bytes)>> {
        let resp = self
            .client
            .get(Self::url(node, bck, obj_name))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        let meta = match resp.headers().get(HEADER_EC_META) {
            Some(v) => Metadata::from_base64(
                v.to_str()
                    .map_err(|e| Error::Ec(format!("metadata header: {e}")))?,
            )?,
            None => return Ok(None),
        };
        let data = resp.bytes().await?;
        Ok(Some((meta, data)))
    }

    async fn delete(&self, node: &Snode, bck: &Bck, obj_name: &str) -> Result<()> {
        let resp = self
            .client
            .delete(Self::url(node, bck, obj_name))
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::NOT_FOUND {
            resp.error_for_status()?;
        }
        Ok(())
    }
}
