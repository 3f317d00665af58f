//! Significance maps: the set of coefficient indices retained for one
//! level of detail within a block.
//!
//! Encoded form, all integers big-endian:
//!
//! ```text
//! [space size: u64][entry count: u64][entries packed MSB-first, bits_for(space - 1) bits each]
//! ```

use crate::error::{Result, VdcError};

const HEADER_BYTES: usize = 16;

/// Number of bits needed to store indices below `space`
fn bits_for(space: usize) -> usize {
    let max = space.saturating_sub(1) as u64;
    (u64::BITS - max.leading_zeros()).max(1) as usize
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignificanceMap {
    space: usize,
    indices: Vec<usize>,
}

impl SignificanceMap {
    /// Empty map over the index space `[0, space)`
    pub fn new(space: usize) -> Self {
        Self {
            space,
            indices: Vec::new(),
        }
    }

    /// Encoded size in bytes of a map with `count` entries
    pub fn encoded_size(space: usize, count: usize) -> usize {
        HEADER_BYTES + (count * bits_for(space)).div_ceil(8)
    }

    pub fn space(&self) -> usize {
        self.space
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn clear(&mut self) {
        self.indices.clear();
    }

    /// Reset to an empty map over a new index space
    pub fn reset(&mut self, space: usize) {
        self.space = space;
        self.indices.clear();
    }

    /// Mark one index significant
    pub fn set(&mut self, index: usize) -> Result<()> {
        if index >= self.space {
            return Err(VdcError::InvalidArgument(format!(
                "significance index {} outside space {}",
                index, self.space
            )));
        }
        self.indices.push(index);
        Ok(())
    }

    /// Add every entry of `other`
    pub fn append(&mut self, other: &SignificanceMap) -> Result<()> {
        if other.space != self.space {
            return Err(VdcError::InvalidArgument(format!(
                "cannot merge significance maps over {} and {} indices",
                self.space, other.space
            )));
        }
        self.indices.extend_from_slice(&other.indices);
        Ok(())
    }

    pub fn sort(&mut self) {
        self.indices.sort_unstable();
    }

    /// Replace the entries with their complement in the index space.
    /// The result is sorted.
    pub fn invert(&mut self) {
        let mut present = vec![false; self.space];
        for &i in &self.indices {
            present[i] = true;
        }
        self.indices = present
            .iter()
            .enumerate()
            .filter(|(_, &p)| !p)
            .map(|(i, _)| i)
            .collect();
    }

    /// Serialize into `out`, returning the number of bytes written
    pub fn write_bytes(&self, out: &mut Vec<u8>) -> usize {
        let before = out.len();
        out.extend_from_slice(&(self.space as u64).to_be_bytes());
        out.extend_from_slice(&(self.indices.len() as u64).to_be_bytes());

        let bits = bits_for(self.space);
        let mut acc: u128 = 0;
        let mut nacc = 0usize;
        for &index in &self.indices {
            acc = (acc << bits) | index as u128;
            nacc += bits;
            while nacc >= 8 {
                nacc -= 8;
                out.push((acc >> nacc) as u8);
            }
            acc &= (1u128 << nacc) - 1;
        }
        if nacc > 0 {
            out.push((acc << (8 - nacc)) as u8);
        }
        out.len() - before
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_size(self.space, self.len()));
        self.write_bytes(&mut out);
        out
    }

    /// Decode a map. Trailing bytes past the encoded length are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_BYTES {
            return Err(VdcError::Decompression(
                "significance map shorter than its header".to_string(),
            ));
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&data[0..8]);
        let space = u64::from_be_bytes(word) as usize;
        word.copy_from_slice(&data[8..16]);
        let count = u64::from_be_bytes(word) as usize;

        if count > space || data.len() < Self::encoded_size(space, count) {
            return Err(VdcError::Decompression(format!(
                "corrupt significance map: {} entries over {} indices in {} bytes",
                count,
                space,
                data.len()
            )));
        }

        let bits = bits_for(space);
        let mask = (1u128 << bits) - 1;
        let mut indices = Vec::with_capacity(count);
        let mut acc: u128 = 0;
        let mut nacc = 0usize;
        let mut bytes = data[HEADER_BYTES..].iter();
        while indices.len() < count {
            while nacc < bits {
                let byte = bytes.next().copied().unwrap_or(0);
                acc = (acc << 8) | byte as u128;
                nacc += 8;
            }
            nacc -= bits;
            let index = ((acc >> nacc) & mask) as usize;
            if index >= space {
                return Err(VdcError::Decompression(format!(
                    "significance index {} outside space {}",
                    index, space
                )));
            }
            indices.push(index);
            acc &= (1u128 << nacc) - 1;
        }

        Ok(Self { space, indices })
    }
}
