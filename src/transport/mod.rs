//! Streaming transport: long-lived framed bulk-object streams
//!
//! One sender, one receiver, many small-to-medium objects over reused
//! HTTP PUT requests, with optional LZ4 frame compression and
//! back-pressure from a bounded send queue. See [`frame`] for the wire
//! format, [`send`] for the sender state machine and [`recv`] for the
//! receiving side.
//!
//! The HTTP client itself sits behind [`StreamDispatcher`] so the sender
//! can be exercised without a network (and so server glue stays outside
//! the core).

pub mod frame;
pub mod recv;
pub mod send;

pub use frame::{ObjAttrs, ObjHdr, LAST_MARKER, MAX_HEADER_SIZE, TICK_MARKER};
pub use recv::{receive, RecvStats};
pub use send::{Extra, ObjReader, SendCallback, Stats, Stream, BURST_NUM, ENV_BURST_NUM, ENV_DRY_RUN};

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Request header carrying the stream session ID
pub const HEADER_SESS_ID: &str = "x-stream-session-id";
/// Content-encoding tag for LZ4-framed bodies
pub const LZ4_CONTENT_ENCODING: &str = "lz4";

// termination reasons
pub const REASON_CANCELED: &str = "canceled";
pub const REASON_UNKNOWN: &str = "unknown";
pub const REASON_ERROR: &str = "error";
pub const REASON_END_OF_STREAM: &str = "end-of-stream";
pub const REASON_STOPPED: &str = "stopped";

// =============================================================================
// Dispatcher
// =============================================================================

/// Runs one HTTP PUT per active stream session, draining `body` until it
/// closes. Returning an error terminates the stream.
#[async_trait]
pub trait StreamDispatcher: Send + Sync + 'static {
    async fn dispatch(
        &self,
        url: &str,
        sess_id: i64,
        compressed: bool,
        body: mpsc::Receiver<Bytes>,
    ) -> Result<()>;
}

/// Production dispatcher: reqwest with a streaming request body
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamDispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        url: &str,
        sess_id: i64,
        compressed: bool,
        body: mpsc::Receiver<Bytes>,
    ) -> Result<()> {
        let stream = futures::stream::unfold(body, |mut rx| async move {
            rx.recv().await.map(|b| (Ok::<_, std::io::Error>(b), rx))
        });
        let mut req = self
            .client
            .put(url)
            .header(HEADER_SESS_ID, sess_id.to_string())
            .body(reqwest::Body::wrap_stream(stream));
        if compressed {
            req = req.header(reqwest::header::CONTENT_ENCODING, LZ4_CONTENT_ENCODING);
        }
        let resp = req.send().await?;
        resp.error_for_status()?;
        Ok(())
    }
}

/// Test dispatcher: collects every request body, one buffer per session
#[derive(Default)]
pub struct CollectDispatcher {
    pub requests: parking_lot::Mutex<Vec<Vec<u8>>>,
}

impl CollectDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl StreamDispatcher for CollectDispatcher {
    async fn dispatch(
        &self,
        _url: &str,
        _sess_id: i64,
        _compressed: bool,
        mut body: mpsc::Receiver<Bytes>,
    ) -> Result<()> {
        let mut buf = Vec::new();
        while let Some(chunk) = body.recv().await {
            buf.extend_from_slice(&chunk);
        }
        self.requests.lock().push(buf);
        Ok(())
    }
}
