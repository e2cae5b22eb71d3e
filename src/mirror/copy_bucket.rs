//! CopyBucket: duplicate every object of one bucket into another

use crate::cluster::Bck;
use crate::fs::TargetStore;
use crate::mirror::{run_joggers, JogStats};
use crate::xaction::{Xact, XactBase};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::info;

/// Background xaction copying the local share of `src` into `dst`
///
/// Object attributes (checksum, version, access time) travel with the
/// data; the copy is an internal transfer, not a client access.
pub struct XactCopyBucket {
    base: Arc<XactBase>,
    store: Arc<TargetStore>,
    dst: Bck,
}

impl XactCopyBucket {
    pub fn new(id: i64, src: Bck, dst: Bck, store: Arc<TargetStore>) -> Self {
        Self {
            base: Arc::new(XactBase::with_bucket(id, "copybucket", src)),
            store,
            dst,
        }
    }

    pub async fn run(&self) -> Result<JogStats> {
        let src = self
            .bck()
            .cloned()
            .expect("copybucket is always bucket-scoped");
        if src == self.dst {
            return Err(Error::Internal(format!(
                "cannot copy bucket {src} onto itself"
            )));
        }
        info!("{} => {}", self.base, self.dst);

        let base = self.base.clone();
        let dst = self.dst.clone();
        let result = run_joggers(
            &self.store,
            &src,
            &self.base.abort_token(),
            move |store, src, _mpath| {
                let base = base.clone();
                let dst = dst.clone();
                Box::new(move |obj_name: &str| {
                    let (data, attrs) = store.peek_object(&src, obj_name)?;
                    store.put_restored(&dst, obj_name, &data, &attrs)?;
                    base.objects_inc();
                    base.bytes_add(attrs.size);
                    Ok(attrs.size)
                })
            },
        )
        .await;
        self.base.finish();
        result
    }
}

impl Xact for XactCopyBucket {
    fn base(&self) -> &XactBase {
        &self.base
    }
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

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_copy_bucket() {
        let (_dirs, store) = store_with_mpaths(3);
        let src = Bck::ais("src");
        let dst = Bck::ais("dst");
        for i in 0..30 {
            store
                .put_object(&src, &format!("o{i}"), format!("data-{i}").as_bytes(), "1")
                .unwrap();
        }

        let xact = XactCopyBucket::new(1, src.clone(), dst.clone(), store.clone());
        let stats = xact.run().await.unwrap();
        assert_eq!(stats.objects, 30);
        assert_eq!(xact.objects_count(), 30);

        for i in 0..30 {
            let name = format!("o{i}");
            let (data, _) = store.peek_object(&dst, &name).unwrap();
            assert_eq!(&data[..], format!("data-{i}").as_bytes());
        }
        // source untouched
        assert_eq!(store.walk_bucket(&src).unwrap().len(), 30);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_copy_preserves_attrs() {
        let (_dirs, store) = store_with_mpaths(2);
        let src = Bck::ais("src");
        let dst = Bck::ais("dst");
        store.put_object(&src, "o1", b"payload", "7").unwrap();
        let src_attrs = store.load_attrs(&src, "o1").unwrap();

        XactCopyBucket::new(1, src, dst.clone(), store.clone())
            .run()
            .await
            .unwrap();

        let dst_attrs = store.load_attrs(&dst, "o1").unwrap();
        assert_eq!(dst_attrs.version, "7");
        assert_eq!(dst_attrs.cksum_value, src_attrs.cksum_value);
        assert_eq!(dst_attrs.atime, src_attrs.atime);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_copy_onto_itself_rejected() {
        let (_dirs, store) = store_with_mpaths(1);
        let bck = Bck::ais("same");
        assert!(XactCopyBucket::new(1, bck.clone(), bck, store)
            .run()
            .await
            .is_err());
    }
}
