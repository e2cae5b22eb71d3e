//! Cluster metadata end-to-end: versioning, persistence, corruption

use shoal::cluster::persist::{local_load, BMD_FNAME};
use shoal::cluster::{Bck, Bmd, BmdOwner, DaemonType, NetInfo, Smap, SmapOwner, Snode};
use shoal::{BucketProps, Error};

fn proxy(id: &str) -> Snode {
    Snode::new(
        id,
        DaemonType::Proxy,
        NetInfo::new("http", "10.0.0.1", 8080),
        None,
        None,
    )
}

fn target(id: &str, port: u16) -> Snode {
    Snode::new(
        id,
        DaemonType::Target,
        NetInfo::new("http", "10.0.0.2", port),
        None,
        None,
    )
}

fn smap_at_version(version: i64) -> Smap {
    let mut smap = Smap::new(77);
    let p = proxy("p1");
    smap.add_proxy(p.clone());
    smap.primary = Some(p);
    for i in 0..3 {
        smap.add_target(target(&format!("t{i}"), 9000 + i));
    }
    smap.version = version;
    smap
}

// Scenario: v=5 installed; synchronize(v=4, lesser_is_err) must fail with
// a downgrade error and leave the stored version at 5
#[test]
fn test_smap_downgrade_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let owner = SmapOwner::new(dir.path(), None);

    owner.synchronize(smap_at_version(5), true).unwrap();
    assert_eq!(owner.get().version, 5);

    let err = owner.synchronize(smap_at_version(4), true).unwrap_err();
    assert!(matches!(
        err,
        Error::Downgrade {
            tag: "smap",
            have: 5,
            got: 4
        }
    ));
    assert_eq!(owner.get().version, 5);

    // persisted state also stays at 5
    let reloaded = SmapOwner::new(dir.path(), None).load().unwrap();
    assert_eq!(reloaded.version, 5);
}

#[test]
fn test_smap_versions_monotone_across_installs() {
    let dir = tempfile::tempdir().unwrap();
    let owner = SmapOwner::new(dir.path(), None);
    let mut installed = Vec::new();
    for v in [1, 3, 4, 9] {
        owner.synchronize(smap_at_version(v), false).unwrap();
        installed.push(owner.get().version);
    }
    for pair in installed.windows(2) {
        assert!(pair[1] > pair[0]);
    }
}

// Scenario: write BMD v=3, flip 12 bytes at offset 10, reload; the
// checksum must reject the file and the in-memory BMD stays default
#[test]
fn test_bmd_corruption_detected_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let owner = BmdOwner::new(dir.path());
    owner
        .commit_update(|bmd| {
            bmd.origin = 77;
            bmd.add_bucket(&Bck::ais("b1"), BucketProps::default())?;
            bmd.add_bucket(&Bck::ais("b2"), BucketProps::default())?;
            bmd.version = 3;
            Ok(())
        })
        .unwrap();
    let original = owner.get();

    let path = dir.path().join(BMD_FNAME);
    let mut bytes = std::fs::read(&path).unwrap();
    for b in bytes[10..22].iter_mut() {
        *b = !*b;
    }
    std::fs::write(&path, &bytes).unwrap();

    // raw load errors out...
    assert!(local_load::<Bmd>(&path).is_err());

    // ...and the owner treats the file as absent: fresh default state
    let fresh = BmdOwner::new(dir.path());
    assert!(fresh.load().is_none());
    assert_eq!(fresh.get().version, 0);
    assert_eq!(fresh.get().count(), 0);
    assert_ne!(*fresh.get(), *original);
}

#[test]
fn test_smap_encode_roundtrip_and_determinism() {
    let smap = smap_at_version(5);
    let encoded = serde_json::to_vec(&smap).unwrap();

    let mut decoded: Smap = serde_json::from_slice(&encoded).unwrap();
    decoded.init_digests();
    assert_eq!(decoded, smap);

    // equal values encode to identical bytes (creation time pinned by
    // construction)
    let mut x = smap_at_version(5);
    let mut y = smap_at_version(5);
    x.creation_time = None;
    y.creation_time = None;
    assert_eq!(
        serde_json::to_vec(&x).unwrap(),
        serde_json::to_vec(&y).unwrap()
    );
}

#[test]
fn test_bmd_encode_roundtrip() {
    let mut bmd = Bmd::new(7);
    bmd.add_bucket(&Bck::ais("alpha"), BucketProps::default()).unwrap();
    bmd.add_bucket(
        &Bck::new("remote", shoal::Provider::Cloud),
        BucketProps::default(),
    )
    .unwrap();

    let encoded = serde_json::to_vec(&bmd).unwrap();
    let decoded: Bmd = serde_json::from_slice(&encoded).unwrap();
    assert_eq!(decoded, bmd);
    assert_eq!(serde_json::to_vec(&decoded).unwrap(), encoded);
}

#[test]
fn test_uname_roundtrip() {
    for (provider, bucket, obj) in [
        (shoal::Provider::Ais, "images", "cats/001.jpg"),
        (shoal::Provider::Cloud, "backups", "2026/07/dump.tar"),
        (shoal::Provider::Ais, "b", "o"),
    ] {
        let bck = Bck::new(bucket, provider);
        let uname = bck.make_uname(obj);
        let (parsed, parsed_obj) = Bck::parse_uname(&uname).unwrap();
        assert_eq!(parsed.provider, provider);
        assert_eq!(parsed.name, bucket);
        assert_eq!(parsed_obj, obj);
    }
}
