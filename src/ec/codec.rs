//! Reed-Solomon slice codec
//!
//! Splits an object into `data` equally-sized slices (last one
//! zero-padded), computes `parity` parity slices, and reconstructs the
//! original from any `data` survivors.

use crate::{Error, Result};
use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;

/// Per-bucket slice codec; cheap to construct, reusable across objects
pub struct Codec {
    rs: ReedSolomon,
    data: usize,
    parity: usize,
}

impl Codec {
    pub fn new(data: usize, parity: usize) -> Result<Self> {
        if data == 0 || parity == 0 {
            return Err(Error::Ec(format!(
                "invalid slice counts: data {data}, parity {parity}"
            )));
        }
        let rs = ReedSolomon::new(data, parity)
            .map_err(|e| Error::Ec(format!("codec construction: {e}")))?;
        Ok(Self { rs, data, parity })
    }

    pub fn data(&self) -> usize {
        self.data
    }

    pub fn parity(&self) -> usize {
        self.parity
    }

    pub fn total(&self) -> usize {
        self.data + self.parity
    }

    /// Encode an object into `data + parity` equal-size slices
    pub fn encode(&self, obj: &[u8]) -> Result<Vec<Bytes>> {
        if obj.is_empty() {
            return Err(Error::Ec("cannot encode an empty object".into()));
        }
        let slice_size = super::slice_size(obj.len() as i64, self.data) as usize;

        let mut slices: Vec<Vec<u8>> = Vec::with_capacity(self.total());
        for i in 0..self.data {
            let start = (i * slice_size).min(obj.len());
            let end = (start + slice_size).min(obj.len());
            let mut slice = obj[start..end].to_vec();
            slice.resize(slice_size, 0); // zero-pad the tail slice
            slices.push(slice);
        }
        for _ in 0..self.parity {
            slices.push(vec![0u8; slice_size]);
        }

        self.rs
            .encode(&mut slices)
            .map_err(|e| Error::Ec(format!("encode: {e}")))?;
        Ok(slices.into_iter().map(Bytes::from).collect())
    }

    /// Verify parity consistency
    pub fn verify(&self, slices: &[Vec<u8>]) -> Result<bool> {
        self.check_count(slices.len())?;
        self.rs
            .verify(slices)
            .map_err(|e| Error::Ec(format!("verify: {e}")))
    }

    /// Fill in missing slices (`None` entries) from any `data` survivors
    pub fn reconstruct(&self, slices: &mut [Option<Vec<u8>>]) -> Result<()> {
        self.check_count(slices.len())?;
        let available = slices.iter().filter(|s| s.is_some()).count();
        if available < self.data {
            return Err(Error::InsufficientTargets {
                have: available,
                need: self.data,
            });
        }
        self.rs
            .reconstruct(slices)
            .map_err(|e| Error::Ec(format!("reconstruct: {e}")))
    }

    /// Reconstruct and reassemble the original object of `size` bytes
    pub fn decode(&self, slices: &mut [Option<Vec<u8>>], size: i64) -> Result<Bytes> {
        self.reconstruct(slices)?;
        let mut obj = Vec::with_capacity(size as usize);
        for slice in slices.iter().take(self.data).flatten() {
            obj.extend_from_slice(slice);
        }
        obj.truncate(size as usize); // drop the padding
        Ok(Bytes::from(obj))
    }

    fn check_count(&self, n: usize) -> Result<()> {
        if n != self.total() {
            return Err(Error::Ec(format!(
                "expected {} slices, got {n}",
                self.total()
            )));
        }
        Ok(())
    }
}
