//! Object attribute semantics: access-time ordering

use shoal::cluster::Bck;
use shoal::fs::{MpathRegistry, TargetStore};
use std::sync::Arc;

fn store_with_mpaths(n: usize) -> (Vec<tempfile::TempDir>, TargetStore) {
    let dirs: Vec<_> = (0..n).map(|_| tempfile::tempdir().unwrap()).collect();
    let reg = Arc::new(MpathRegistry::new());
    for d in &dirs {
        reg.add(d.path()).unwrap();
    }
    (dirs, TargetStore::new(reg))
}

// Scenario: PUT o, read atime A1; GET o, read atime A2; A2 > A1 in
// nanoseconds. A cold-cache pull must not advance atime.
#[test]
fn test_atime_ordering() {
    let (_dirs, store) = store_with_mpaths(2);
    let bck = Bck::ais("b1");

    let put_attrs = store.put_object(&bck, "o1", b"payload", "1").unwrap();
    let a1 = put_attrs.atime;
    assert!(a1 > 0);

    let (_, get_attrs) = store.get_object(&bck, "o1").unwrap();
    let a2 = get_attrs.atime;
    assert!(a2 > a1, "GET atime {a2} must be strictly after PUT atime {a1}");

    // and it keeps advancing strictly
    let (_, get_attrs) = store.get_object(&bck, "o1").unwrap();
    assert!(get_attrs.atime > a2);
}

#[test]
fn test_internal_reads_do_not_advance_atime() {
    let (_dirs, store) = store_with_mpaths(1);
    let bck = Bck::ais("b1");
    store.put_object(&bck, "o1", b"payload", "1").unwrap();
    let before = store.load_attrs(&bck, "o1").unwrap().atime;

    // rebalance/EC source reads peek without touching atime
    for _ in 0..3 {
        store.peek_object(&bck, "o1").unwrap();
    }
    assert_eq!(store.load_attrs(&bck, "o1").unwrap().atime, before);
}

#[test]
fn test_cold_pull_preserves_given_atime() {
    let (_dirs, store) = store_with_mpaths(1);
    let bck = Bck::ais("b1");

    // a restored object arrives with the attrs of its source
    let attrs = shoal::fs::ObjectAttrs {
        size: 4,
        atime: 0,
        cksum_type: "blake3".into(),
        cksum_value: blake3::hash(b"cold").to_hex().to_string(),
        version: "1".into(),
    };
    store.put_restored(&bck, "cold-obj", b"cold", &attrs).unwrap();
    assert_eq!(store.load_attrs(&bck, "cold-obj").unwrap().atime, 0);

    // the first client GET then stamps a real access time
    let (_, got) = store.get_object(&bck, "cold-obj").unwrap();
    assert!(got.atime > 0);
}
