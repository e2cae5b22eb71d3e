//! Wire framing for bulk-object streams
//!
//! Each request body is a sequence of records:
//!
//! ```text
//! [hdr_len u64][checksum(hdr_len) u64]
//! [bucket lp][obj_name lp][bck_is_ais u8 lp][opaque lp]
//! [size i64][atime i64][cksum_type lp][cksum_value lp][version lp]
//! [object bytes: size bytes]
//! ```
//!
//! All integers are big-endian; `lp` fields are length-prefixed with a u64.
//! `hdr_len` counts everything between the 16-byte prefix and the object
//! bytes. The prefix checksum is `mix64(hdr_len)`; a mismatch at the
//! receiver is a fatal framing error for the request.
//!
//! Two sentinel sizes: `i64::MAX` marks end-of-stream, `i64::MAX ^
//! 0xa5a5a5a5` is an idle tick the receiver ignores. Size 0 is a valid
//! header-only object.

use crate::{hrw, Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Serialized header ceiling; headers must fit
pub const MAX_HEADER_SIZE: usize = 1024;

/// End-of-stream sentinel (`ObjAttrs::size`)
pub const LAST_MARKER: i64 = i64::MAX;

/// Idle-tick sentinel (`ObjAttrs::size`); receivers skip it
pub const TICK_MARKER: i64 = i64::MAX ^ 0xa5a5_a5a5;

pub(crate) const PREFIX_LEN: usize = 16;

// =============================================================================
// Header types
// =============================================================================

/// Attributes of the object in flight
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjAttrs {
    pub size: i64,
    /// Access time, nanoseconds since the UNIX epoch
    pub atime: i64,
    pub cksum_type: String,
    pub cksum_value: String,
    pub version: String,
}

/// Object header: the uname at the destination plus attributes and an
/// optional opaque control blob
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjHdr {
    pub bucket: String,
    pub obj_name: String,
    pub bck_is_ais: bool,
    pub opaque: Vec<u8>,
    pub attrs: ObjAttrs,
}

impl ObjHdr {
    pub fn is_last(&self) -> bool {
        self.attrs.size == LAST_MARKER
    }

    pub fn is_idle_tick(&self) -> bool {
        self.attrs.size == TICK_MARKER
    }

    pub fn is_header_only(&self) -> bool {
        self.attrs.size == 0 || self.is_last()
    }

    pub(crate) fn last_marker() -> Self {
        ObjHdr {
            attrs: ObjAttrs {
                size: LAST_MARKER,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub(crate) fn tick_marker() -> Self {
        ObjHdr {
            attrs: ObjAttrs {
                size: TICK_MARKER,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

fn put_lp(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u64(b.len() as u64);
    buf.put_slice(b);
}

/// Serialize one record header, prefix included
pub fn insert_header(hdr: &ObjHdr) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + 64);
    buf.put_u64(0); // hdr_len, patched below
    buf.put_u64(0); // checksum, patched below
    put_lp(&mut buf, hdr.bucket.as_bytes());
    put_lp(&mut buf, hdr.obj_name.as_bytes());
    put_lp(&mut buf, &[hdr.bck_is_ais as u8]);
    put_lp(&mut buf, &hdr.opaque);
    buf.put_i64(hdr.attrs.size);
    buf.put_i64(hdr.attrs.atime);
    put_lp(&mut buf, hdr.attrs.cksum_type.as_bytes());
    put_lp(&mut buf, hdr.attrs.cksum_value.as_bytes());
    put_lp(&mut buf, hdr.attrs.version.as_bytes());

    let hdr_len = buf.len() - PREFIX_LEN;
    if hdr_len > MAX_HEADER_SIZE {
        return Err(Error::Framing(format!(
            "header for {}/{} too large: {hdr_len} > {MAX_HEADER_SIZE}",
            hdr.bucket, hdr.obj_name
        )));
    }
    buf[0..8].copy_from_slice(&(hdr_len as u64).to_be_bytes());
    buf[8..16].copy_from_slice(&hrw::mix64(hdr_len as u64).to_be_bytes());
    Ok(buf.freeze())
}

// =============================================================================
// Decoding
// =============================================================================

struct Cursor<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.off + n > self.buf.len() {
            return Err(Error::Framing(format!(
                "header underflow at offset {} (+{n} of {})",
                self.off,
                self.buf.len()
            )));
        }
        let out = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(out)
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn lp_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u64()? as usize;
        self.take(len)
    }

    fn lp_string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.lp_bytes()?).into_owned())
    }

    fn lp_bool(&mut self) -> Result<bool> {
        let b = self.lp_bytes()?;
        if b.len() != 1 {
            return Err(Error::Framing(format!("bool field of {} bytes", b.len())));
        }
        Ok(b[0] != 0)
    }
}

/// Validate a 16-byte record prefix; returns the header length
pub fn parse_prefix(prefix: &[u8; PREFIX_LEN]) -> Result<usize> {
    let hdr_len = u64::from_be_bytes(prefix[0..8].try_into().unwrap());
    let checksum = u64::from_be_bytes(prefix[8..16].try_into().unwrap());
    if checksum != hrw::mix64(hdr_len) {
        return Err(Error::Framing(format!(
            "bad header checksum for hdr_len {hdr_len}"
        )));
    }
    let hdr_len = hdr_len as usize;
    if hdr_len == 0 || hdr_len > MAX_HEADER_SIZE {
        return Err(Error::Framing(format!("bad header length {hdr_len}")));
    }
    Ok(hdr_len)
}

/// Deserialize the header fields (the bytes after the prefix)
pub fn parse_header(body: &[u8]) -> Result<ObjHdr> {
    let mut cur = Cursor { buf: body, off: 0 };
    let bucket = cur.lp_string()?;
    let obj_name = cur.lp_string()?;
    let bck_is_ais = cur.lp_bool()?;
    let opaque = cur.lp_bytes()?.to_vec();
    let size = cur.i64()?;
    let atime = cur.i64()?;
    let cksum_type = cur.lp_string()?;
    let cksum_value = cur.lp_string()?;
    let version = cur.lp_string()?;
    if cur.off != body.len() {
        return Err(Error::Framing(format!(
            "trailing {} header bytes",
            body.len() - cur.off
        )));
    }
    Ok(ObjHdr {
        bucket,
        obj_name,
        bck_is_ais,
        opaque,
        attrs: ObjAttrs {
            size,
            atime,
            cksum_type,
            cksum_value,
            version,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_hdr() -> ObjHdr {
        ObjHdr {
            bucket: "images".into(),
            obj_name: "cats/001.jpg".into(),
            bck_is_ais: true,
            opaque: vec![1, 2, 3],
            attrs: ObjAttrs {
                size: 4096,
                atime: 1_700_000_000_000_000_000,
                cksum_type: "blake3".into(),
                cksum_value: "abcd".into(),
                version: "3".into(),
            },
        }
    }

    fn roundtrip(hdr: &ObjHdr) -> ObjHdr {
        let encoded = insert_header(hdr).unwrap();
        let hdr_len = parse_prefix(encoded[..PREFIX_LEN].try_into().unwrap()).unwrap();
        assert_eq!(hdr_len, encoded.len() - PREFIX_LEN);
        parse_header(&encoded[PREFIX_LEN..]).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let hdr = sample_hdr();
        assert_eq!(roundtrip(&hdr), hdr);
    }

    #[test]
    fn test_markers() {
        assert!(ObjHdr::last_marker().is_last());
        assert!(ObjHdr::last_marker().is_header_only());
        assert!(ObjHdr::tick_marker().is_idle_tick());
        assert!(!ObjHdr::tick_marker().is_last());
        assert_eq!(roundtrip(&ObjHdr::last_marker()), ObjHdr::last_marker());
    }

    #[test]
    fn test_prefix_checksum_rejected() {
        let encoded = insert_header(&sample_hdr()).unwrap();
        let mut prefix: [u8; PREFIX_LEN] = encoded[..PREFIX_LEN].try_into().unwrap();
        prefix[9] ^= 0xff;
        assert!(matches!(parse_prefix(&prefix), Err(Error::Framing(_))));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let hdr = ObjHdr {
            obj_name: "x".repeat(MAX_HEADER_SIZE),
            ..sample_hdr()
        };
        assert!(insert_header(&hdr).is_err());
    }

    #[test]
    fn test_truncated_header_rejected() {
        let encoded = insert_header(&sample_hdr()).unwrap();
        let body = &encoded[PREFIX_LEN..];
        assert!(parse_header(&body[..body.len() - 1]).is_err());
        assert!(parse_header(&[]).is_err());
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            bucket in "[a-z0-9-]{1,40}",
            obj in "[a-zA-Z0-9/._-]{0,100}",
            ais in proptest::bool::ANY,
            opaque in proptest::collection::vec(proptest::num::u8::ANY, 0..64),
            size in 0i64..i64::MAX / 2,
            atime in proptest::num::i64::ANY,
        ) {
            let hdr = ObjHdr {
                bucket,
                obj_name: obj,
                bck_is_ais: ais,
                opaque,
                attrs: ObjAttrs { size, atime, ..Default::default() },
            };
            prop_assert_eq!(roundtrip(&hdr), hdr);
        }
    }
}
