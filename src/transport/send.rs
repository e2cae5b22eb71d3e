//! Stream sender
//!
//! A `Stream` is a long-lived, one-directional bulk-object channel to a
//! single peer, reused over many HTTP PUT requests. The sending pipeline
//! is a pair (SQ, SCQ): a bounded send queue feeding a single send loop,
//! and a completion queue processed in FIFO order. Together they guarantee
//! that completion callbacks fire in exactly the order of `send` calls and
//! that every object reader is released exactly once, on every termination
//! path.
//!
//! Session lifecycle: the stream starts inactive; the first posted object
//! opens an HTTP request whose body is the framed record sequence. When
//! the queue stays empty past the idle timeout, the loop writes an idle
//! tick and closes the request; the next object opens a fresh one.

use crate::config::CompressionConf;
use crate::transport::frame::{self, ObjHdr};
use crate::transport::{StreamDispatcher, REASON_END_OF_STREAM, REASON_ERROR, REASON_STOPPED};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default max objects posted for sending without back-pressure
pub const BURST_NUM: usize = 32;

/// Send-queue capacity override
pub const ENV_BURST_NUM: &str = "AIS_STREAM_BURST_NUM";

/// When set, sends are framed and discarded locally (testing)
pub const ENV_DRY_RUN: &str = "AIS_STREAM_DRY_RUN";

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2);
const BODY_CHUNK: usize = 64 * 1024;

static NEXT_SESSION_ID: AtomicI64 = AtomicI64::new(100);

/// Object reader; released by the completion pipeline exactly once
pub type ObjReader = Box<dyn AsyncRead + Send + Unpin>;

/// Completion callback: fires when the object finished sending or when the
/// stream terminated with it still pending
pub type SendCallback = Arc<dyn Fn(&ObjHdr, Option<&Error>) + Send + Sync>;

// =============================================================================
// Extra / Stats
// =============================================================================

/// Optional stream controls
#[derive(Default)]
pub struct Extra {
    pub idle_timeout: Option<Duration>,
    /// Stream-wide completion callback; a per-object callback overrides it
    pub callback: Option<SendCallback>,
    /// LZ4-frame the request bodies
    pub compression: Option<CompressionConf>,
}

/// Stream transfer counters
#[derive(Default)]
pub struct Stats {
    /// Transferred objects, header-only included
    pub num: AtomicI64,
    /// Payload bytes (transport headers excluded)
    pub size: AtomicI64,
    /// Stream offset: payload plus headers
    pub offset: AtomicI64,
    /// Bytes after compression; converges to the actual wire size
    pub compressed_size: AtomicI64,
}

impl Stats {
    pub fn compression_ratio(&self) -> f64 {
        let read = self.offset.load(Ordering::Relaxed) as f64;
        let sent = self.compressed_size.load(Ordering::Relaxed) as f64;
        if sent == 0.0 {
            return 1.0;
        }
        read / sent
    }
}

// =============================================================================
// Stream
// =============================================================================

struct Obj {
    hdr: ObjHdr,
    reader: Option<ObjReader>,
    callback: Option<SendCallback>,
    /// Optional fan-out refcount: the callback fires on the final decrement
    refcount: Option<Arc<AtomicI64>>,
}

struct Shared {
    lid: String,
    stats: Stats,
    terminated: AtomicBool,
    term: Mutex<(&'static str, Option<Arc<Error>>)>,
    stop: CancellationToken,
}

impl Shared {
    fn set_term(&self, reason: &'static str, err: Option<Error>) {
        let mut term = self.term.lock();
        if !self.terminated.swap(true, Ordering::AcqRel) {
            *term = (reason, err.map(Arc::new));
        }
    }
}

/// A bulk-object send stream to one peer
pub struct Stream {
    to_url: String,
    sess_id: i64,
    work_tx: mpsc::Sender<Obj>,
    shared: Arc<Shared>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Stream {
    /// Create the stream and spawn its send/completion loops; must run
    /// inside a tokio runtime
    pub fn new(
        dispatcher: Arc<dyn StreamDispatcher>,
        to_url: impl Into<String>,
        extra: Extra,
    ) -> Stream {
        let to_url = to_url.into();
        let sess_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed) + 1;
        let idle_timeout = extra.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT);
        let lid = match &extra.compression {
            None => format!("{to_url}[{sess_id}]"),
            Some(c) => format!("{to_url}[{sess_id}[lz4:{}]]", c.block_max_size),
        };

        let burst = burst_from_env();
        let dryrun = dryrun_from_env();
        let (work_tx, work_rx) = mpsc::channel(burst);
        let (cmpl_tx, cmpl_rx) = mpsc::channel(burst);

        let shared = Arc::new(Shared {
            lid,
            stats: Stats::default(),
            terminated: AtomicBool::new(false),
            term: Mutex::new(("", None)),
            stop: CancellationToken::new(),
        });

        let send_task = tokio::spawn(send_loop(SendLoop {
            dispatcher,
            to_url: to_url.clone(),
            sess_id,
            idle_timeout,
            compression: extra.compression,
            dryrun,
            shared: shared.clone(),
            work_rx,
            cmpl_tx,
        }));
        let cmpl_task = tokio::spawn(cmpl_loop(cmpl_rx, extra.callback, shared.clone()));

        Stream {
            to_url,
            sess_id,
            work_tx,
            shared,
            tasks: Mutex::new(Some((send_task, cmpl_task))),
        }
    }

    /// Asynchronously send an object defined by its header and its reader.
    ///
    /// Header-only objects (size 0) need no reader. Blocks only when the
    /// send queue is full (back-pressure). The reader is always released
    /// by the completion pipeline, on success and on every failure path.
    pub async fn send(
        &self,
        hdr: ObjHdr,
        reader: Option<ObjReader>,
        callback: Option<SendCallback>,
        refcount: Option<Arc<AtomicI64>>,
    ) -> Result<()> {
        if self.terminated() {
            return Err(Error::StreamTerminated(self.shared.lid.clone()));
        }
        debug_assert!(reader.is_some() || hdr.is_header_only());
        let obj = Obj {
            hdr,
            reader,
            callback,
            refcount,
        };
        self.work_tx
            .send(obj)
            .await
            .map_err(|_| Error::StreamTerminated(self.shared.lid.clone()))
    }

    /// Graceful shutdown: enqueue the end-of-stream marker and wait for
    /// all pending completions
    pub async fn fin(&self) {
        let obj = Obj {
            hdr: ObjHdr::last_marker(),
            reader: None,
            callback: None,
            refcount: None,
        };
        if self.work_tx.send(obj).await.is_err() {
            debug!("{}: fin on terminated stream", self.shared.lid);
        }
        self.join().await;
    }

    /// Abort: close the request; pending completions receive the stream's
    /// termination error
    pub fn stop(&self) {
        self.shared.stop.cancel();
    }

    /// Stop and wait for both loops to drain
    pub async fn stop_and_join(&self) {
        self.stop();
        self.join().await;
    }

    pub fn terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    /// Termination reason and error, once terminated
    pub fn term_info(&self) -> (&'static str, Option<Arc<Error>>) {
        self.shared.term.lock().clone()
    }

    pub fn url(&self) -> &str {
        &self.to_url
    }

    pub fn id(&self) -> i64 {
        self.sess_id
    }

    pub fn stats(&self) -> &Stats {
        &self.shared.stats
    }

    async fn join(&self) {
        let tasks = self.tasks.lock().take();
        if let Some((send_task, cmpl_task)) = tasks {
            let _ = send_task.await;
            let _ = cmpl_task.await;
        }
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.shared.lid)
    }
}

fn burst_from_env() -> usize {
    match std::env::var(ENV_BURST_NUM) {
        Ok(v) => match v.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                error!("error parsing env {ENV_BURST_NUM}={v}");
                BURST_NUM
            }
        },
        Err(_) => BURST_NUM,
    }
}

fn dryrun_from_env() -> bool {
    match std::env::var(ENV_DRY_RUN) {
        Ok(v) => v.parse::<bool>().unwrap_or_else(|_| {
            error!("error parsing env {ENV_DRY_RUN}={v}");
            false
        }),
        Err(_) => false,
    }
}

// =============================================================================
// Send loop
// =============================================================================

struct SendLoop {
    dispatcher: Arc<dyn StreamDispatcher>,
    to_url: String,
    sess_id: i64,
    idle_timeout: Duration,
    compression: Option<CompressionConf>,
    dryrun: bool,
    shared: Arc<Shared>,
    work_rx: mpsc::Receiver<Obj>,
    cmpl_tx: mpsc::Sender<(Obj, Option<Arc<Error>>)>,
}

enum LoopExit {
    EndOfStream,
    Stopped,
    Error(Error),
}

async fn send_loop(mut sl: SendLoop) {
    let exit = run_sessions(&mut sl).await;
    let (reason, err) = match exit {
        LoopExit::EndOfStream => (REASON_END_OF_STREAM, None),
        LoopExit::Stopped => {
            info!("{}: stopped", sl.shared.lid);
            (REASON_STOPPED, None)
        }
        LoopExit::Error(e) => {
            error!("{}: terminating ({e})", sl.shared.lid);
            (REASON_ERROR, Some(e))
        }
    };
    sl.shared.set_term(reason, err);

    // complete whatever is still queued with the termination error
    let term_err = sl.shared.term.lock().1.clone();
    sl.work_rx.close();
    while let Ok(obj) = sl.work_rx.try_recv() {
        let _ = sl.cmpl_tx.send((obj, term_err.clone())).await;
    }
    // dropping cmpl_tx ends the completion loop
}

// One iteration per HTTP request (session); returns only on termination
async fn run_sessions(sl: &mut SendLoop) -> LoopExit {
    loop {
        // inactive: wait for the first object of the next session
        let first = tokio::select! {
            _ = sl.shared.stop.cancelled() => return LoopExit::Stopped,
            obj = sl.work_rx.recv() => match obj {
                Some(obj) => obj,
                None => return LoopExit::Stopped,
            },
        };
        debug!("{}: inactive => active", sl.shared.lid);
        match run_one_session(sl, first).await {
            SessionExit::Idle => continue,
            SessionExit::Last => return LoopExit::EndOfStream,
            SessionExit::Stopped => return LoopExit::Stopped,
            SessionExit::Error(e) => return LoopExit::Error(e),
        }
    }
}

enum SessionExit {
    /// Idled out; the request closed cleanly, the stream stays usable
    Idle,
    Last,
    Stopped,
    Error(Error),
}

async fn run_one_session(sl: &mut SendLoop, first: Obj) -> SessionExit {
    let (body_tx, body_rx) = mpsc::channel::<Bytes>(8);
    let request = if sl.dryrun {
        drop(body_rx);
        None
    } else {
        let dispatcher = sl.dispatcher.clone();
        let url = sl.to_url.clone();
        let sess_id = sl.sess_id;
        let compressed = sl.compression.is_some();
        Some(tokio::spawn(async move {
            dispatcher.dispatch(&url, sess_id, compressed, body_rx).await
        }))
    };
    let mut body = match BodySink::new(
        body_tx,
        sl.compression.as_ref(),
        sl.dryrun,
        sl.shared.clone(),
    ) {
        Ok(body) => body,
        Err(e) => return SessionExit::Error(e),
    };

    let mut pending = Some(first);
    let exit = loop {
        let obj = match pending.take() {
            Some(obj) => obj,
            None => {
                tokio::select! {
                    _ = sl.shared.stop.cancelled() => break SessionExit::Stopped,
                    obj = sl.work_rx.recv() => match obj {
                        Some(obj) => obj,
                        None => break SessionExit::Stopped,
                    },
                    _ = tokio::time::sleep(sl.idle_timeout) => {
                        // deactivate: write the tick so the receiver sees
                        // liveness, then close this request
                        if let Err(e) = body.write_header(&ObjHdr::tick_marker()).await {
                            break SessionExit::Error(e);
                        }
                        debug!("{}: idle timeout, connection teardown", sl.shared.lid);
                        break SessionExit::Idle;
                    }
                }
            }
        };

        if obj.hdr.is_last() {
            if let Err(e) = body.write_header(&obj.hdr).await {
                break SessionExit::Error(e);
            }
            break SessionExit::Last;
        }

        match send_obj(&sl.shared, &sl.cmpl_tx, &mut body, obj).await {
            Ok(()) => {}
            Err(e) => break SessionExit::Error(e),
        }
    };

    // close the body before awaiting the request so the server observes EOF
    let flush_result = body.finish().await;
    drop(body);
    if let Some(request) = request {
        match request.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if matches!(exit, SessionExit::Idle | SessionExit::Last) {
                    return SessionExit::Error(e);
                }
            }
            Err(e) => return SessionExit::Error(Error::Internal(format!("request task: {e}"))),
        }
    }
    if let Err(e) = flush_result {
        return SessionExit::Error(e);
    }
    exit
}

// Frame one object into the body; posts its completion in FIFO order
async fn send_obj(
    shared: &Shared,
    cmpl_tx: &mpsc::Sender<(Obj, Option<Arc<Error>>)>,
    body: &mut BodySink,
    mut obj: Obj,
) -> Result<()> {
    let stats = &shared.stats;
    let result = async {
        body.write_header(&obj.hdr).await?;
        let size = obj.hdr.attrs.size;
        if size > 0 {
            let reader = obj
                .reader
                .as_mut()
                .ok_or_else(|| Error::Internal(format!("no reader for {size} bytes")))?;
            let mut sent: i64 = 0;
            let mut chunk = vec![0u8; BODY_CHUNK.min(size as usize)];
            while sent < size {
                let want = chunk.len().min((size - sent) as usize);
                let n = reader.read(&mut chunk[..want]).await?;
                if n == 0 {
                    break;
                }
                body.write_data(Bytes::copy_from_slice(&chunk[..n])).await?;
                sent += n as i64;
            }
            if sent != size {
                return Err(Error::Framing(format!(
                    "{}: obj {}/{} offset {sent} != {size} size",
                    shared.lid, obj.hdr.bucket, obj.hdr.obj_name
                )));
            }
            stats.size.fetch_add(size, Ordering::Relaxed);
            stats.offset.fetch_add(size, Ordering::Relaxed);
        }
        body.flush().await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            stats.num.fetch_add(1, Ordering::Relaxed);
            let _ = cmpl_tx.send((obj, None)).await;
            Ok(())
        }
        Err(e) => {
            warn!("{}: {e}", shared.lid);
            let shared_err = Arc::new(Error::Internal(e.to_string()));
            let _ = cmpl_tx.send((obj, Some(shared_err))).await;
            Err(e)
        }
    }
}

// =============================================================================
// Completion loop
// =============================================================================

async fn cmpl_loop(
    mut cmpl_rx: mpsc::Receiver<(Obj, Option<Arc<Error>>)>,
    stream_cb: Option<SendCallback>,
    shared: Arc<Shared>,
) {
    while let Some((obj, err)) = cmpl_rx.recv().await {
        obj_done(obj, err, &stream_cb, &shared);
    }
}

// refcount, invoke the callback, and always release the reader
fn obj_done(
    obj: Obj,
    err: Option<Arc<Error>>,
    stream_cb: &Option<SendCallback>,
    shared: &Shared,
) {
    let rc = match &obj.refcount {
        Some(prc) => {
            let rc = prc.fetch_sub(1, Ordering::AcqRel) - 1;
            debug_assert!(rc >= 0, "{}: negative refcount", shared.lid);
            rc
        }
        None => 0,
    };
    if rc == 0 {
        if let Some(cb) = &obj.callback {
            cb(&obj.hdr, err.as_deref());
        } else if let Some(cb) = stream_cb {
            cb(&obj.hdr, err.as_deref());
        }
    }
    // the reader drops here, on every termination path, exactly once
    drop(obj);
}

// =============================================================================
// Body sink: raw or LZ4-framed
// =============================================================================

// Accumulates compressed output of the lz4 frame encoder; drained into the
// body channel after every write
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct BodySink {
    tx: mpsc::Sender<Bytes>,
    encoder: Option<lz4::Encoder<SharedBuf>>,
    encoded: SharedBuf,
    dryrun: bool,
    shared: Arc<Shared>,
}

impl BodySink {
    fn new(
        tx: mpsc::Sender<Bytes>,
        compression: Option<&CompressionConf>,
        dryrun: bool,
        shared: Arc<Shared>,
    ) -> Result<Self> {
        let encoded = SharedBuf::default();
        let encoder = match compression {
            None => None,
            Some(conf) => {
                let mut builder = lz4::EncoderBuilder::new();
                builder
                    .block_size(block_size_of(conf.block_max_size))
                    .checksum(if conf.checksum {
                        lz4::ContentChecksum::ChecksumEnabled
                    } else {
                        lz4::ContentChecksum::NoChecksum
                    });
                Some(
                    builder
                        .build(encoded.clone())
                        .map_err(|e| Error::Compression(e.to_string()))?,
                )
            }
        };
        Ok(Self {
            tx,
            encoder,
            encoded,
            dryrun,
            shared,
        })
    }

    async fn write_header(&mut self, hdr: &ObjHdr) -> Result<()> {
        let bytes = frame::insert_header(hdr)?;
        self.shared
            .stats
            .offset
            .fetch_add(bytes.len() as i64, Ordering::Relaxed);
        self.write_data(bytes).await
    }

    async fn write_data(&mut self, bytes: Bytes) -> Result<()> {
        match &mut self.encoder {
            Some(enc) => {
                enc.write_all(&bytes)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                self.drain_encoded().await
            }
            None => self.push(bytes).await,
        }
    }

    /// Emit any buffered lz4 block; bounds end-to-end latency per object
    async fn flush(&mut self) -> Result<()> {
        if let Some(enc) = &mut self.encoder {
            enc.flush().map_err(|e| Error::Compression(e.to_string()))?;
            self.drain_encoded().await?;
        }
        Ok(())
    }

    /// Close the body; finishes the lz4 frame when compressing
    async fn finish(&mut self) -> Result<()> {
        if let Some(enc) = self.encoder.take() {
            let (_, result) = enc.finish();
            result.map_err(|e| Error::Compression(e.to_string()))?;
            self.drain_encoded().await?;
        }
        Ok(())
    }

    async fn push(&mut self, bytes: Bytes) -> Result<()> {
        if self.dryrun {
            return Ok(());
        }
        self.tx
            .send(bytes)
            .await
            .map_err(|_| Error::Internal("request body closed".into()))
    }

    async fn drain_encoded(&mut self) -> Result<()> {
        let chunk = {
            let mut buf = self.encoded.0.lock();
            if buf.is_empty() {
                return Ok(());
            }
            Bytes::from(std::mem::take(&mut *buf))
        };
        self.shared
            .stats
            .compressed_size
            .fetch_add(chunk.len() as i64, Ordering::Relaxed);
        self.push(chunk).await
    }
}

fn block_size_of(max: usize) -> lz4::BlockSize {
    match max {
        s if s <= 64 * 1024 => lz4::BlockSize::Max64KB,
        s if s <= 256 * 1024 => lz4::BlockSize::Max256KB,
        s if s <= 1024 * 1024 => lz4::BlockSize::Max1MB,
        _ => lz4::BlockSize::Max4MB,
    }
}
