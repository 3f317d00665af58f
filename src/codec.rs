//! Per-block wavelet codec: splits the coefficients of one block into
//! level-of-detail slots, each holding coefficient values followed by the
//! significance map that places them.

use crate::error::{Result, VdcError};
use crate::sigmap::SignificanceMap;
use crate::wavelet::{BlockTransform, Wavelet};

/// Number of coefficients and stored slot length for every level of detail
pub fn encoding_vectors(
    transform: &BlockTransform,
    cratios: &[usize],
) -> Result<(Vec<usize>, Vec<usize>)> {
    let ntotal = transform.num_coeffs();
    let min_coeffs = transform.num_approx();

    let mut ncoeffs = Vec::with_capacity(cratios.len());
    let mut encoded_dims = Vec::with_capacity(cratios.len());
    let mut naccum = 0usize;

    for (i, &cratio) in cratios.iter().enumerate() {
        let n = (ntotal / cratio)
            .max(min_coeffs)
            .saturating_sub(naccum)
            .max(1);
        naccum += n;
        if naccum > ntotal {
            return Err(VdcError::InvalidCompression(format!(
                "compression ratios {:?} need more than the {} coefficients of a block",
                cratios, ntotal
            )));
        }
        ncoeffs.push(n);

        if map_is_implicit(cratios, i) {
            encoded_dims.push(n);
        } else {
            let map_bytes = SignificanceMap::encoded_size(ntotal, n);
            encoded_dims.push(n + map_bytes.div_ceil(4));
        }
    }

    if cratios.last() == Some(&1) && naccum != ntotal {
        return Err(VdcError::InvalidCompression(format!(
            "lossless level keeps {} of {} coefficients",
            naccum, ntotal
        )));
    }

    Ok((ncoeffs, encoded_dims))
}

/// The final lossless level's map is never stored: it is the complement of
/// every coarser map.
fn map_is_implicit(cratios: &[usize], lod: usize) -> bool {
    lod + 1 == cratios.len() && cratios[lod] == 1
}

/// `(number of refinement levels, maximum compression ratio)` for a block
/// shape and wavelet, or `None` if the pair cannot be compressed
pub fn compression_info(bs: &[usize], wname: &str) -> Option<(usize, usize)> {
    let wavelet = Wavelet::from_name(wname)?;
    let transform = BlockTransform::new(wavelet, bs).ok()?;
    if transform.num_levels() < 1 {
        return None;
    }
    Some((
        transform.num_levels() + 1,
        transform.num_coeffs() / transform.num_approx(),
    ))
}

/// Check a compression ratio table against a block shape and wavelet
pub fn validate_cratios(bs: &[usize], wname: &str, cratios: &[usize]) -> Result<()> {
    if cratios.is_empty() {
        return Err(VdcError::InvalidCompression(
            "empty compression ratio table".to_string(),
        ));
    }
    if cratios.iter().any(|&c| c == 0) {
        return Err(VdcError::InvalidCompression(format!(
            "zero compression ratio in {:?}",
            cratios
        )));
    }
    if cratios.windows(2).any(|w| w[0] <= w[1]) {
        return Err(VdcError::InvalidCompression(format!(
            "compression ratios {:?} must be unique and decreasing",
            cratios
        )));
    }
    if Wavelet::from_name(wname).is_none() {
        return Err(VdcError::InvalidCompression(format!(
            "unsupported wavelet {}",
            wname
        )));
    }
    let (_, max_cratio) = compression_info(bs, wname).ok_or_else(|| {
        VdcError::InvalidCompression(format!(
            "block shape {:?} too small for wavelet {}",
            bs, wname
        ))
    })?;
    if cratios[0] > max_cratio {
        return Err(VdcError::InvalidCompression(format!(
            "compression ratio {} exceeds maximum {} for block {:?}",
            cratios[0], max_cratio, bs
        )));
    }
    Ok(())
}

/// Reusable buffers for one codec user
#[derive(Debug, Default)]
pub struct CodecScratch {
    order: Vec<usize>,
    work: (Vec<f64>, Vec<f64>),
    bytes: Vec<u8>,
    maps: Vec<SignificanceMap>,
}

#[derive(Debug, Clone)]
pub struct BlockCodec {
    transform: BlockTransform,
    cratios: Vec<usize>,
    ncoeffs: Vec<usize>,
    encoded_dims: Vec<usize>,
}

impl BlockCodec {
    pub fn new(wname: &str, bs: &[usize], cratios: &[usize]) -> Result<Self> {
        validate_cratios(bs, wname, cratios)?;
        let wavelet = Wavelet::from_name(wname).ok_or_else(|| {
            VdcError::InvalidCompression(format!("unsupported wavelet {}", wname))
        })?;
        let transform = BlockTransform::new(wavelet, bs)?;
        let (ncoeffs, encoded_dims) = encoding_vectors(&transform, cratios)?;
        Ok(Self {
            transform,
            cratios: cratios.to_vec(),
            ncoeffs,
            encoded_dims,
        })
    }

    pub fn transform(&self) -> &BlockTransform {
        &self.transform
    }

    pub fn num_levels(&self) -> usize {
        self.transform.num_levels()
    }

    pub fn cratios(&self) -> &[usize] {
        &self.cratios
    }

    /// Coefficients added by each level of detail
    pub fn ncoeffs(&self) -> &[usize] {
        &self.ncoeffs
    }

    /// Stored slot length of each level of detail
    pub fn encoded_dims(&self) -> &[usize] {
        &self.encoded_dims
    }

    /// Transform `block` in place and fill one slot per level of detail
    pub fn decompose(
        &self,
        block: &mut [f32],
        slots: &mut [Vec<f32>],
        scratch: &mut CodecScratch,
    ) -> Result<()> {
        let ntotal = self.transform.num_coeffs();
        self.transform.forward(block, &mut scratch.work)?;
        let coeffs = &block[..ntotal];

        // approximation band first, then details by decreasing magnitude
        let order = &mut scratch.order;
        order.clear();
        order.extend((0..ntotal).filter(|&i| self.transform.is_approx(i)));
        let napprox = order.len();
        order.extend((0..ntotal).filter(|&i| !self.transform.is_approx(i)));
        order[napprox..].sort_unstable_by(|&a, &b| {
            coeffs[b]
                .abs()
                .total_cmp(&coeffs[a].abs())
                .then(a.cmp(&b))
        });

        let mut map = scratch.maps.pop().unwrap_or_default();
        let mut offset = 0;
        for (lod, slot) in slots.iter_mut().enumerate().take(self.ncoeffs.len()) {
            let n = self.ncoeffs[lod];
            let chosen = &mut order[offset..offset + n];
            chosen.sort_unstable();
            offset += n;

            slot.clear();
            slot.extend(chosen.iter().map(|&i| coeffs[i]));

            if !map_is_implicit(&self.cratios, lod) {
                map.reset(ntotal);
                for &i in chosen.iter() {
                    map.set(i)?;
                }
                scratch.bytes.clear();
                map.write_bytes(&mut scratch.bytes);
                slot.extend(
                    scratch
                        .bytes
                        .chunks(4)
                        .map(|c| {
                            let mut word = [0u8; 4];
                            word[..c.len()].copy_from_slice(c);
                            f32::from_bits(u32::from_be_bytes(word))
                        }),
                );
            }
            slot.resize(self.encoded_dims[lod], 0.0);
        }
        scratch.maps.push(map);
        Ok(())
    }

    /// Rebuild a block from the slots of levels of detail `0..slots.len()`,
    /// reconstructed at refinement `level`. The result occupies the leading
    /// corner of `block` with shape `transform().shape_at_level(level)`.
    pub fn reconstruct(
        &self,
        slots: &[Vec<f32>],
        level: usize,
        block: &mut [f32],
        scratch: &mut CodecScratch,
    ) -> Result<()> {
        let ntotal = self.transform.num_coeffs();
        let nlod = slots.len().min(self.ncoeffs.len());
        if nlod == 0 {
            return Err(VdcError::InvalidArgument(
                "no level of detail to reconstruct from".to_string(),
            ));
        }
        block[..ntotal].fill(0.0);

        while scratch.maps.len() < nlod {
            scratch.maps.push(SignificanceMap::default());
        }

        for lod in 0..nlod {
            let n = self.ncoeffs[lod];
            let slot = &slots[lod];
            if slot.len() < self.encoded_dims[lod] {
                return Err(VdcError::Decompression(format!(
                    "slot for level of detail {} holds {} values, expected {}",
                    lod,
                    slot.len(),
                    self.encoded_dims[lod]
                )));
            }

            if map_is_implicit(&self.cratios, lod) {
                let (coarser, rest) = scratch.maps.split_at_mut(lod);
                let map = &mut rest[0];
                map.reset(ntotal);
                for m in coarser.iter() {
                    map.append(m)?;
                }
                map.invert();
            } else {
                scratch.bytes.clear();
                for w in &slot[n..self.encoded_dims[lod]] {
                    scratch.bytes.extend_from_slice(&w.to_bits().to_be_bytes());
                }
                scratch.maps[lod] = SignificanceMap::from_bytes(&scratch.bytes)?;
            }

            let map = &scratch.maps[lod];
            if map.len() != n || map.space() != ntotal {
                return Err(VdcError::Decompression(format!(
                    "significance map for level of detail {} places {} of {} coefficients",
                    lod,
                    map.len(),
                    n
                )));
            }
            for (&index, &value) in map.indices().iter().zip(&slot[..n]) {
                block[index] = value;
            }
        }

        self.transform.inverse(block, level, &mut scratch.work)
    }
}
