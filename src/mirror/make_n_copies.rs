//! MakeNCopies: converge every object of a bucket to exactly N copies

use crate::cluster::Bck;
use crate::fs::TargetStore;
use crate::mirror::{run_joggers, validate_n_copies, JogStats};
use crate::xaction::{Xact, XactBase};
use crate::Result;
use std::sync::Arc;
use tracing::info;

/// Background xaction that traverses all local mountpaths and makes sure
/// the bucket is N-way replicated (N >= 1)
pub struct XactMakeNCopies {
    base: Arc<XactBase>,
    store: Arc<TargetStore>,
    copies: u32,
}

impl XactMakeNCopies {
    pub fn new(id: i64, bck: Bck, store: Arc<TargetStore>, copies: u32) -> Self {
        Self {
            base: Arc::new(XactBase::with_bucket(id, "makencopies", bck)),
            store,
            copies,
        }
    }

    pub async fn run(&self) -> Result<JogStats> {
        let bck = self
            .bck()
            .cloned()
            .expect("makencopies is always bucket-scoped");
        validate_n_copies(&format!("{}", self.base), self.copies, self.store.mpaths().count())?;
        info!("{} copies={}", self.base, self.copies);

        let copies = self.copies as usize;
        let base = self.base.clone();
        let result = run_joggers(
            &self.store,
            &bck,
            &self.base.abort_token(),
            move |store, bck, _mpath| {
                let base = base.clone();
                let mut buf = Vec::new(); // reused across this jogger's objects
                Box::new(move |obj_name: &str| {
                    let bytes = del_add_copies(&store, &bck, obj_name, copies, &mut buf)?;
                    base.objects_inc();
                    base.bytes_add(bytes);
                    Ok(bytes)
                })
            },
        )
        .await;
        self.base.finish();
        result
    }
}

impl Xact for XactMakeNCopies {
    fn base(&self) -> &XactBase {
        &self.base
    }
}

// converge one object: M > N drops extras (primary kept), M < N adds
// copies on mountpaths not already holding one
fn del_add_copies(
    store: &TargetStore,
    bck: &Bck,
    obj_name: &str,
    copies: usize,
    buf: &mut Vec<u8>,
) -> Result<i64> {
    let current = store.copy_mpaths(bck, obj_name);
    let have = current.len();
    if have == copies {
        return Ok(0);
    }

    let primary = store.primary_mpath(bck, obj_name)?;
    let mut moved = 0i64;
    if have > copies {
        let mut extra = have - copies;
        for mpath in current {
            if extra == 0 {
                break;
            }
            if mpath.path == primary.path {
                continue;
            }
            store.remove_copy(bck, obj_name, &mpath)?;
            extra -= 1;
        }
    } else {
        let mut missing = copies - have;
        for mpath in store.mpaths().get() {
            if missing == 0 {
                break;
            }
            if current.iter().any(|m| m.path == mpath.path) {
                continue;
            }
            moved += store.copy_object(bck, obj_name, &primary, &mpath, buf)?;
            missing -= 1;
        }
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MpathRegistry;

    fn store_with_mpaths(n: usize) -> (Vec<tempfile::TempDir>, Arc<TargetStore>) {
        let dirs: Vec<_> = (0..n).map(|_| tempfile::tempdir().unwrap()).collect();
        let reg = Arc::new(MpathRegistry::new());
        for d in &dirs {
            reg.add(d.path()).unwrap();
        }
        (dirs, Arc::new(TargetStore::new(reg)))
    }

    fn fill(store: &TargetStore, bck: &Bck, n: usize) {
        for i in 0..n {
            store
                .put_object(bck, &format!("o{i:03}"), format!("payload-{i}").as_bytes(), "1")
                .unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_make_three_copies() {
        let (_dirs, store) = store_with_mpaths(4);
        let bck = Bck::ais("b1");
        fill(&store, &bck, 50);

        let xact = XactMakeNCopies::new(1, bck.clone(), store.clone(), 3);
        let stats = xact.run().await.unwrap();
        assert_eq!(stats.objects, 50);
        assert_eq!(stats.errors, 0);
        assert!(xact.finished());

        // every object: exactly 3 copies, all on distinct mountpaths
        for i in 0..50 {
            let name = format!("o{i:03}");
            let mpaths = store.copy_mpaths(&bck, &name);
            assert_eq!(mpaths.len(), 3, "{name}");
            let mut paths: Vec<_> = mpaths.iter().map(|m| m.path.clone()).collect();
            paths.sort();
            paths.dedup();
            assert_eq!(paths.len(), 3, "{name}: copies must be on distinct mountpaths");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shrink_back_to_one() {
        let (_dirs, store) = store_with_mpaths(3);
        let bck = Bck::ais("b1");
        fill(&store, &bck, 20);

        XactMakeNCopies::new(1, bck.clone(), store.clone(), 3)
            .run()
            .await
            .unwrap();
        XactMakeNCopies::new(2, bck.clone(), store.clone(), 1)
            .run()
            .await
            .unwrap();

        for i in 0..20 {
            let name = format!("o{i:03}");
            assert_eq!(store.num_copies(&bck, &name), 1, "{name}");
            // the surviving copy is the HRW-primary one
            let primary = store.primary_mpath(&bck, &name).unwrap();
            let holder = &store.copy_mpaths(&bck, &name)[0];
            assert_eq!(holder.path, primary.path);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_noop_when_already_converged() {
        let (_dirs, store) = store_with_mpaths(2);
        let bck = Bck::ais("b1");
        fill(&store, &bck, 5);

        XactMakeNCopies::new(1, bck.clone(), store.clone(), 2)
            .run()
            .await
            .unwrap();
        let stats = XactMakeNCopies::new(2, bck.clone(), store.clone(), 2)
            .run()
            .await
            .unwrap();
        assert_eq!(stats.objects, 5);
        assert_eq!(stats.bytes, 0, "no data moved on a converged bucket");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_copies_validation() {
        let (_dirs, store) = store_with_mpaths(2);
        let bck = Bck::ais("b1");
        assert!(XactMakeNCopies::new(1, bck.clone(), store.clone(), 3)
            .run()
            .await
            .is_err());
        assert!(XactMakeNCopies::new(2, bck.clone(), store.clone(), 0)
            .run()
            .await
            .is_err());
        assert!(XactMakeNCopies::new(3, bck, store, 17).run().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abort_stops_joggers() {
        let (_dirs, store) = store_with_mpaths(2);
        let bck = Bck::ais("b1");
        fill(&store, &bck, 10);

        let xact = XactMakeNCopies::new(1, bck, store, 2);
        xact.abort();
        assert!(matches!(xact.run().await, Err(crate::Error::Aborted(_))));
        assert!(xact.aborted());
    }
}
