//! Erasure coding end-to-end: encode, lose slices, restore

use bytes::Bytes;
use shoal::cluster::{Bck, DaemonType, EcConf, NetInfo, Smap, Snode};
use shoal::config::EcTuneConf;
use shoal::ec::{self, EcEngine, MemEcPeers};
use shoal::fs::{MpathRegistry, TargetStore};
use shoal::{hrw, BucketProps, Error};
use std::sync::Arc;

const MIB: usize = 1024 * 1024;

struct EcCluster {
    smap: Smap,
    stores: Vec<(String, Arc<TargetStore>)>,
    peers: Arc<MemEcPeers>,
    _dirs: Vec<tempfile::TempDir>,
}

fn cluster(n: usize) -> EcCluster {
    let mut smap = Smap::new(1);
    let peers = MemEcPeers::new();
    let mut stores = Vec::new();
    let mut dirs = Vec::new();
    for i in 0..n {
        let id = format!("t{i}");
        smap.add_target(Snode::new(
            id.clone(),
            DaemonType::Target,
            NetInfo::new("http", "127.0.0.1", 9100 + i as u16),
            None,
            None,
        ));
        let dir = tempfile::tempdir().unwrap();
        let reg = Arc::new(MpathRegistry::new());
        reg.add(dir.path()).unwrap();
        let store = Arc::new(TargetStore::new(reg));
        peers.register(&id, store.clone());
        stores.push((id, store));
        dirs.push(dir);
    }
    EcCluster {
        smap,
        stores,
        peers,
        _dirs: dirs,
    }
}

impl EcCluster {
    fn store_of(&self, id: &str) -> Arc<TargetStore> {
        self.stores
            .iter()
            .find(|(sid, _)| sid == id)
            .map(|(_, s)| s.clone())
            .unwrap()
    }

    fn engine_for_main(&self, bck: &Bck, obj: &str) -> EcEngine {
        let uname = bck.make_uname(obj);
        let main = hrw::hrw_target(&uname, &self.smap).unwrap().daemon_id.clone();
        EcEngine::new(
            main.clone(),
            self.store_of(&main),
            self.peers.clone(),
            EcTuneConf::default(),
        )
    }
}

fn bck_4_2() -> Bck {
    let mut bck = Bck::ais("protected");
    bck.props = Some(BucketProps {
        ec: EcConf {
            enabled: true,
            data_slices: 4,
            parity_slices: 2,
            obj_size_limit: 0, // default 256 KiB threshold
        },
        ..Default::default()
    });
    bck
}

fn payload(n: usize) -> Bytes {
    Bytes::from((0..n).map(|i| ((i * 31 + i / 997) % 251) as u8).collect::<Vec<u8>>())
}

// Scenario: D=4, P=2, 1 MiB object -> 6 slices of 256 KiB; delete any 2
// slices; GET restores identical bytes and the healed targets get their
// sidecars back
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restore_at_parity_2() {
    let cl = cluster(8);
    let bck = bck_4_2();
    let obj = "vol/chunk-0001";
    let data = payload(MIB);

    let engine = cl.engine_for_main(&bck, obj);
    engine
        .encode_put(&bck, obj, data.clone(), "1", &cl.smap)
        .await
        .unwrap();

    // 6 slices of exactly 256 KiB each on 6 distinct holders
    let uname = bck.make_uname(obj);
    let targets = hrw::hrw_target_list(&uname, &cl.smap, 7).unwrap();
    for (i, holder) in targets[1..].iter().enumerate() {
        let store = cl.store_of(&holder.daemon_id);
        let (meta, part) = ec::load_part(&store, &bck, obj).unwrap().unwrap();
        assert_eq!(meta.slice_id, i + 1);
        assert_eq!(part.len(), 256 * 1024);
        assert_eq!(meta.size, MIB as i64);
    }

    // lose the main copy plus any 2 slices
    engine.store().delete_object(&bck, obj).unwrap();
    let victims = [targets[2], targets[5]];
    for v in victims {
        ec::delete_parts(&cl.store_of(&v.daemon_id), &bck, obj).unwrap();
    }

    let (restored, _) = engine.get(&bck, obj, &cl.smap).await.unwrap();
    assert_eq!(restored.len(), data.len());
    assert_eq!(&restored[..], &data[..]);

    // sidecars on the two healed targets reappear
    for v in victims {
        let store = cl.store_of(&v.daemon_id);
        let meta = ec::load_meta(&store, &bck, obj).unwrap().unwrap();
        assert!(meta.slice_id > 0);
        assert_eq!(meta.size, MIB as i64);
        let (_, part) = ec::load_part(&store, &bck, obj).unwrap().unwrap();
        assert_eq!(part.len(), 256 * 1024);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_fails_with_parity_plus_one_losses() {
    let cl = cluster(8);
    let bck = bck_4_2();
    let obj = "vol/chunk-0002";
    let engine = cl.engine_for_main(&bck, obj);
    engine
        .encode_put(&bck, obj, payload(MIB), "1", &cl.smap)
        .await
        .unwrap();

    let uname = bck.make_uname(obj);
    let targets = hrw::hrw_target_list(&uname, &cl.smap, 7).unwrap();
    engine.store().delete_object(&bck, obj).unwrap();
    for v in &targets[1..4] {
        // P + 1 = 3 slice holders
        ec::delete_parts(&cl.store_of(&v.daemon_id), &bck, obj).unwrap();
    }

    assert!(matches!(
        engine.get(&bck, obj, &cl.smap).await,
        Err(Error::ObjectDoesNotExist(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_small_objects_survive_via_replicas() {
    let cl = cluster(8);
    let bck = bck_4_2();
    let obj = "small/config.json";
    let data = payload(10 * 1024); // below the 256 KiB limit: replicated

    let engine = cl.engine_for_main(&bck, obj);
    engine
        .encode_put(&bck, obj, data.clone(), "1", &cl.smap)
        .await
        .unwrap();

    // main is gone; a replica serves the read and the main is restored
    engine.store().delete_object(&bck, obj).unwrap();
    let (got, _) = engine.get(&bck, obj, &cl.smap).await.unwrap();
    assert_eq!(&got[..], &data[..]);
    assert!(engine.store().object_exists(&bck, obj));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_decode_identity_for_any_d_of_dp() {
    // pure codec property at the cluster's 4+2 shape
    let codec = shoal::ec::Codec::new(4, 2).unwrap();
    let obj = payload(MIB);
    let slices = codec.encode(&obj).unwrap();

    for lost_a in 0..6 {
        for lost_b in (lost_a + 1)..6 {
            let mut opts: Vec<Option<Vec<u8>>> =
                slices.iter().map(|s| Some(s.to_vec())).collect();
            opts[lost_a] = None;
            opts[lost_b] = None;
            let decoded = codec.decode(&mut opts, obj.len() as i64).unwrap();
            assert_eq!(&decoded[..], &obj[..], "lost {lost_a} and {lost_b}");
        }
    }
}
