//! Stream receiver
//!
//! Parses one framed request body: records are handed to the registered
//! handler with a reader bounded to exactly the object size. Handler
//! errors are logged and counted without aborting the request; framing and
//! header-checksum violations abort it. The loop drains whatever the
//! handler left unconsumed, so a misbehaving handler cannot desynchronize
//! the framing.
//!
//! The body is a synchronous `Read`: HTTP server glue bridges async
//! request bodies onto a blocking thread, and tests feed byte buffers
//! directly.

use crate::transport::frame::{self, ObjHdr, PREFIX_LEN};
use crate::{Error, Result};
use std::io::{self, Read};
use tracing::{debug, warn};

/// Per-request receive counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecvStats {
    /// Delivered objects, header-only included
    pub num: i64,
    /// Payload bytes
    pub bytes: i64,
    /// Records whose handler returned an error
    pub handler_errors: i64,
    /// True when the end-of-stream marker arrived (vs plain EOF)
    pub eos: bool,
}

/// Record handler: must consume `reader` before returning; the loop drains
/// any remainder as a safety net
pub type RecvHandler<'a> = dyn FnMut(ObjHdr, &mut dyn Read) -> Result<()> + 'a;

/// Receive one request body, invoking `handler` per record
pub fn receive<R: Read>(
    body: R,
    compressed: bool,
    handler: &mut RecvHandler<'_>,
) -> Result<RecvStats> {
    if compressed {
        let decoder =
            lz4::Decoder::new(body).map_err(|e| Error::Compression(e.to_string()))?;
        receive_records(decoder, handler)
    } else {
        receive_records(body, handler)
    }
}

fn receive_records<R: Read>(body: R, handler: &mut RecvHandler<'_>) -> Result<RecvStats> {
    let mut body = CountingReader { inner: body, n: 0 };
    let mut stats = RecvStats::default();
    let mut hdr_buf = [0u8; frame::MAX_HEADER_SIZE];

    loop {
        let mut prefix = [0u8; PREFIX_LEN];
        if !read_prefix(&mut body, &mut prefix)? {
            return Ok(stats); // clean EOF between records
        }
        let hdr_len = frame::parse_prefix(&prefix)?;
        body.read_exact(&mut hdr_buf[..hdr_len])
            .map_err(|e| Error::Framing(format!("truncated header: {e}")))?;
        let hdr = frame::parse_header(&hdr_buf[..hdr_len])?;

        if hdr.is_last() {
            debug!("received end-of-stream");
            stats.eos = true;
            return Ok(stats);
        }
        if hdr.is_idle_tick() {
            continue;
        }

        let size = hdr.attrs.size;
        if size < 0 {
            return Err(Error::Framing(format!("negative object size {size}")));
        }
        let start = body.n;
        let uname = format!("{}/{}", hdr.bucket, hdr.obj_name);
        let mut bounded = (&mut body).take(size as u64);
        if let Err(e) = handler(hdr, &mut bounded) {
            warn!("handler failed on {uname}: {e}");
            stats.handler_errors += 1;
        }
        // next record parse depends on full consumption
        let leftover = io::copy(&mut bounded, &mut io::sink())
            .map_err(|e| Error::Framing(format!("draining {uname}: {e}")))?;
        if leftover > 0 {
            debug!("drained {leftover} unconsumed bytes of {uname}");
        }
        let consumed = (body.n - start) as i64;
        if consumed != size {
            return Err(Error::Framing(format!(
                "truncated payload for {uname}: {consumed} of {size} bytes"
            )));
        }
        stats.num += 1;
        stats.bytes += size;
    }
}

struct CountingReader<R> {
    inner: R,
    n: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.n += n as u64;
        Ok(n)
    }
}

// Returns false on clean EOF at a record boundary; mid-prefix EOF is a
// framing error
fn read_prefix<R: Read>(body: &mut R, prefix: &mut [u8; PREFIX_LEN]) -> Result<bool> {
    let mut off = 0;
    while off < PREFIX_LEN {
        match body.read(&mut prefix[off..]) {
            Ok(0) => {
                if off == 0 {
                    return Ok(false);
                }
                return Err(Error::Framing(format!(
                    "EOF inside record prefix ({off}/{PREFIX_LEN} bytes)"
                )));
            }
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionConf;
    use crate::transport::frame::{insert_header, ObjAttrs};
    use std::io::Write;

    fn record(bucket: &str, obj: &str, data: &[u8]) -> Vec<u8> {
        let hdr = ObjHdr {
            bucket: bucket.into(),
            obj_name: obj.into(),
            bck_is_ais: true,
            opaque: Vec::new(),
            attrs: ObjAttrs {
                size: data.len() as i64,
                ..Default::default()
            },
        };
        let mut out = insert_header(&hdr).unwrap().to_vec();
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn test_receive_sequence_with_tick_and_eos() {
        let mut body = Vec::new();
        body.extend(record("b", "o1", b"hello"));
        body.extend(insert_header(&ObjHdr::tick_marker()).unwrap());
        body.extend(record("b", "o2", b""));
        body.extend(record("b", "o3", &vec![7u8; 10_000]));
        body.extend(insert_header(&ObjHdr::last_marker()).unwrap());

        let mut seen = Vec::new();
        let mut handler = |hdr: ObjHdr, r: &mut dyn Read| {
            let mut buf = Vec::new();
            r.read_to_end(&mut buf)?;
            assert_eq!(buf.len() as i64, hdr.attrs.size);
            seen.push(hdr.obj_name);
            Ok(())
        };
        let stats = receive(&body[..], false, &mut handler).unwrap();
        assert_eq!(seen, vec!["o1", "o2", "o3"]);
        assert_eq!(stats.num, 3);
        assert_eq!(stats.bytes, 5 + 10_000);
        assert!(stats.eos);
        assert_eq!(stats.handler_errors, 0);
    }

    #[test]
    fn test_plain_eof_between_records_is_clean() {
        let body = record("b", "o1", b"x");
        let mut handler = |_: ObjHdr, r: &mut dyn Read| {
            io::copy(r, &mut io::sink())?;
            Ok(())
        };
        let stats = receive(&body[..], false, &mut handler).unwrap();
        assert_eq!(stats.num, 1);
        assert!(!stats.eos);
    }

    #[test]
    fn test_handler_error_does_not_abort() {
        let mut body = Vec::new();
        body.extend(record("b", "bad", b"junk-payload"));
        body.extend(record("b", "good", b"fine"));

        let mut delivered = Vec::new();
        let mut handler = |hdr: ObjHdr, r: &mut dyn Read| {
            if hdr.obj_name == "bad" {
                // return early without consuming; the loop must drain
                return Err(Error::Internal("refused".into()));
            }
            let mut buf = Vec::new();
            r.read_to_end(&mut buf)?;
            delivered.push((hdr.obj_name, buf));
            Ok(())
        };
        let stats = receive(&body[..], false, &mut handler).unwrap();
        assert_eq!(stats.num, 2);
        assert_eq!(stats.handler_errors, 1);
        assert_eq!(delivered, vec![("good".to_string(), b"fine".to_vec())]);
    }

    #[test]
    fn test_corrupt_prefix_aborts() {
        let mut body = record("b", "o1", b"data");
        body[9] ^= 0xff; // header checksum
        let mut handler = |_: ObjHdr, _: &mut dyn Read| Ok(());
        assert!(matches!(
            receive(&body[..], false, &mut handler),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn test_truncated_payload_aborts() {
        let mut body = record("b", "o1", &vec![1u8; 100]);
        body.truncate(body.len() - 40);
        let mut handler = |_: ObjHdr, r: &mut dyn Read| {
            io::copy(r, &mut io::sink())?;
            Ok(())
        };
        assert!(matches!(
            receive(&body[..], false, &mut handler),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn test_compressed_roundtrip() {
        let mut plain = Vec::new();
        plain.extend(record("b", "o1", &vec![3u8; 50_000]));
        plain.extend(insert_header(&ObjHdr::last_marker()).unwrap());

        let mut encoder = lz4::EncoderBuilder::new()
            .block_size(lz4::BlockSize::Max64KB)
            .build(Vec::new())
            .unwrap();
        encoder.write_all(&plain).unwrap();
        let (compressed, result) = encoder.finish();
        result.unwrap();

        let mut total = 0usize;
        let mut handler = |_: ObjHdr, r: &mut dyn Read| {
            let mut buf = Vec::new();
            r.read_to_end(&mut buf)?;
            total += buf.len();
            Ok(())
        };
        let stats = receive(&compressed[..], true, &mut handler).unwrap();
        assert_eq!(stats.num, 1);
        assert_eq!(total, 50_000);
        assert!(stats.eos);
    }
}
