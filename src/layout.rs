//! Block geometry: alignment, block iteration, boundary extension and
//! copying between hyperslabs and fixed-size blocks.
//!
//! All shapes here are in storage order, slowest-varying dimension first.

use crate::error::{Result, VdcError};
use ndarray::{ArrayView, ArrayViewMut, ArrayViewMut1, Axis as ArrayAxis, IxDyn, Slice, Zip};

/// Product of a shape
pub fn vproduct(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Row-major offset of `coords` within an array of shape `dims`
pub fn linearize(coords: &[usize], dims: &[usize]) -> usize {
    coords
        .iter()
        .zip(dims)
        .fold(0, |offset, (&c, &d)| offset * d + c)
}

/// Expand `start`/`count` outward to block boundaries. The aligned count is
/// clipped to `dims` so the result always stays inside the array.
pub fn block_align(
    start: &[usize],
    count: &[usize],
    bs: &[usize],
    dims: &[usize],
) -> (Vec<usize>, Vec<usize>) {
    let mut astart = Vec::with_capacity(start.len());
    let mut acount = Vec::with_capacity(start.len());
    for i in 0..start.len() {
        let stop = start[i] + count[i];
        let s = start[i] / bs[i] * bs[i];
        let e = (stop.div_ceil(bs[i]) * bs[i]).min(dims[i]);
        astart.push(s);
        acount.push(e - s);
    }
    (astart, acount)
}

/// Number of blocks needed to cover each dimension
pub fn block_counts(dims: &[usize], bs: &[usize]) -> Vec<usize> {
    dims.iter().zip(bs).map(|(&d, &b)| d.div_ceil(b)).collect()
}

/// Block coordinates of a block-aligned array coordinate
pub fn to_block_coords(start: &[usize], bs: &[usize]) -> Vec<usize> {
    start.iter().zip(bs).map(|(&s, &b)| s / b).collect()
}

/// Visit every contiguous run of a hyperslab. The callback receives the
/// run's offset in the full array, its offset in the packed slab buffer and
/// its length.
pub fn for_each_run<F>(dims: &[usize], start: &[usize], count: &[usize], mut f: F)
where
    F: FnMut(usize, usize, usize),
{
    if count.iter().any(|&c| c == 0) {
        return;
    }
    let rank = dims.len();
    if rank == 0 {
        f(0, 0, 1);
        return;
    }

    let inner = count[rank - 1];
    let nruns = vproduct(&count[..rank - 1]);
    let mut idx = vec![0usize; rank - 1];
    let mut coords = start.to_vec();

    for run in 0..nruns {
        for d in 0..rank - 1 {
            coords[d] = start[d] + idx[d];
        }
        f(linearize(&coords, dims), run * inner, inner);

        // odometer increment over the outer dimensions
        for d in (0..rank - 1).rev() {
            idx[d] += 1;
            if idx[d] < count[d] {
                break;
            }
            idx[d] = 0;
        }
    }
}

/// Iterates the blocks covering a block-aligned hyperslab
#[derive(Debug, Clone)]
pub struct StrideIter {
    start: Vec<usize>,
    count: Vec<usize>,
    bs: Vec<usize>,
    nblocks: Vec<usize>,
}

impl StrideIter {
    pub fn new(start: &[usize], count: &[usize], bs: &[usize]) -> Self {
        Self {
            start: start.to_vec(),
            count: count.to_vec(),
            bs: bs.to_vec(),
            nblocks: block_counts(count, bs),
        }
    }

    /// Total number of blocks
    pub fn num(&self) -> usize {
        vproduct(&self.nblocks)
    }

    /// Start and valid extent of the `i`th block, in row-major block order
    pub fn ith(&self, i: usize) -> (Vec<usize>, Vec<usize>) {
        let rank = self.nblocks.len();
        let mut bstart = vec![0; rank];
        let mut bcount = vec![0; rank];
        let mut remaining = i;

        for d in (0..rank).rev() {
            let coord = remaining % self.nblocks[d];
            remaining /= self.nblocks[d];

            let offset = coord * self.bs[d];
            bstart[d] = self.start[d] + offset;
            bcount[d] = self.bs[d].min(self.count[d] - offset);
        }

        (bstart, bcount)
    }
}

/// Boundary extension used to pad partial blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionMode {
    /// Half-point symmetric: `ABCDE` extends as `ABCDEEDCBAA`
    Symh,
    /// Whole-point symmetric: `ABCDE` extends as `ABCDEDCBAB`
    Symw,
    /// Periodic: `ABCDE` extends as `ABCDEABCDA`
    Per,
    /// Edge replication: `ABCDE` extends as `ABCDEEEEE`
    Sp0,
}

impl ExtensionMode {
    /// Parse a mode name. Unrecognized names fall back to edge replication.
    pub fn from_name(name: &str) -> Self {
        match name {
            "symh" => ExtensionMode::Symh,
            "symw" => ExtensionMode::Symw,
            "per" => ExtensionMode::Per,
            _ => ExtensionMode::Sp0,
        }
    }
}

/// Fill `line[valid..]` from `line[..valid]`
pub fn pad_line(mode: ExtensionMode, line: &mut ArrayViewMut1<f32>, valid: usize) {
    let len = line.len();
    if valid == 0 || valid >= len {
        return;
    }

    if valid == 1 {
        let v = line[0];
        for i in 1..len {
            line[i] = v;
        }
        return;
    }

    for i in valid..len {
        let src = match mode {
            ExtensionMode::Symh => {
                let j = i % (2 * valid);
                if j < valid {
                    j
                } else {
                    2 * valid - 1 - j
                }
            }
            ExtensionMode::Symw => {
                let period = 2 * (valid - 1);
                let j = i % period;
                if j < valid {
                    j
                } else {
                    period - j
                }
            }
            ExtensionMode::Per => i % valid,
            ExtensionMode::Sp0 => valid - 1,
        };
        line[i] = line[src];
    }
}

fn shape_error(e: ndarray::ShapeError) -> VdcError {
    VdcError::InvalidHyperslab(e.to_string())
}

/// Copy one block out of a packed slab and pad it to the full block shape.
///
/// `offset` is the block's origin within the slab and `valid` its extent
/// there. Where `mask` is false the value is replaced by the mean of the
/// unmasked values inside the block.
#[allow(clippy::too_many_arguments)]
pub fn block_into(
    slab: &[f32],
    slab_dims: &[usize],
    offset: &[usize],
    valid: &[usize],
    mask: Option<&[bool]>,
    block: &mut [f32],
    bs: &[usize],
    mode: ExtensionMode,
) -> Result<()> {
    let src = ArrayView::from_shape(IxDyn(slab_dims), slab).map_err(shape_error)?;
    let region = src.slice_each_axis(|ax| {
        let i = ax.axis.index();
        Slice::from(offset[i]..offset[i] + valid[i])
    });

    let mut dst = ArrayViewMut::from_shape(IxDyn(bs), block).map_err(shape_error)?;
    {
        let mut dst_valid =
            dst.slice_each_axis_mut(|ax| Slice::from(0..valid[ax.axis.index()]));

        match mask {
            None => dst_valid.assign(&region),
            Some(mask) => {
                let mask = ArrayView::from_shape(IxDyn(slab_dims), mask).map_err(shape_error)?;
                let mregion = mask.slice_each_axis(|ax| {
                    let i = ax.axis.index();
                    Slice::from(offset[i]..offset[i] + valid[i])
                });

                let (total, n) = Zip::from(&region).and(&mregion).fold(
                    (0.0f64, 0usize),
                    |(total, n), &v, &m| if m { (total + v as f64, n + 1) } else { (total, n) },
                );
                let ave = if n > 0 { (total / n as f64) as f32 } else { 0.0 };

                Zip::from(&mut dst_valid)
                    .and(&region)
                    .and(&mregion)
                    .for_each(|d, &v, &m| *d = if m { v } else { ave });
            }
        }
    }

    for axis in (0..bs.len()).rev() {
        if valid[axis] < bs[axis] {
            for mut lane in dst.lanes_mut(ArrayAxis(axis)) {
                pad_line(mode, &mut lane, valid[axis]);
            }
        }
    }

    Ok(())
}

/// Copy the valid portion of a block into a packed output slab at `offset`
pub fn unblock_into(
    block: &[f32],
    bs: &[usize],
    valid: &[usize],
    out: &mut [f32],
    out_dims: &[usize],
    offset: &[usize],
) -> Result<()> {
    let src = ArrayView::from_shape(IxDyn(bs), block).map_err(shape_error)?;
    let src = src.slice_each_axis(|ax| Slice::from(0..valid[ax.axis.index()]));

    let mut dst = ArrayViewMut::from_shape(IxDyn(out_dims), out).map_err(shape_error)?;
    dst.slice_each_axis_mut(|ax| {
        let i = ax.axis.index();
        Slice::from(offset[i]..offset[i] + valid[i])
    })
    .assign(&src);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn padded(mode: ExtensionMode, valid: &[f32], total: usize) -> Vec<f32> {
        let mut line = Array1::<f32>::zeros(total);
        for (i, &v) in valid.iter().enumerate() {
            line[i] = v;
        }
        pad_line(mode, &mut line.view_mut(), valid.len());
        line.to_vec()
    }

    #[test]
    fn test_pad_line_modes() {
        let abcde = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(
            padded(ExtensionMode::Symh, &abcde, 12),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 5.0, 4.0, 3.0, 2.0, 1.0, 1.0, 2.0]
        );
        assert_eq!(
            padded(ExtensionMode::Symw, &abcde, 12),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0, 2.0, 1.0, 2.0, 3.0, 4.0]
        );
        assert_eq!(
            padded(ExtensionMode::Per, &abcde, 12),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 1.0, 2.0, 3.0, 4.0, 5.0, 1.0, 2.0]
        );
        assert_eq!(
            padded(ExtensionMode::Sp0, &abcde, 8),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 5.0, 5.0, 5.0]
        );
    }

    #[test]
    fn test_pad_line_properties() {
        let valid: Vec<f32> = (0..7).map(|v| v as f32 * 1.5).collect();
        let l1 = valid.len();

        let per = padded(ExtensionMode::Per, &valid, 16);
        for i in l1..16 {
            assert_eq!(per[i], per[(i - l1) % l1]);
        }

        let sp0 = padded(ExtensionMode::Sp0, &valid, 16);
        for i in l1..16 {
            assert_eq!(sp0[i], sp0[l1 - 1]);
        }
    }

    #[test]
    fn test_pad_line_single_value_replicates() {
        assert_eq!(padded(ExtensionMode::Symw, &[7.0], 4), vec![7.0; 4]);
        assert_eq!(ExtensionMode::from_name("zpd"), ExtensionMode::Sp0);
    }

    #[test]
    fn test_partial_boundary_block() {
        // 100 samples in blocks of 16
        let iter = StrideIter::new(&[0], &[100], &[16]);
        assert_eq!(iter.num(), 7);

        let (bstart, bcount) = iter.ith(6);
        assert_eq!(bstart, vec![96]);
        assert_eq!(bcount, vec![4]);
        assert_eq!(16 - bcount[0], 12);
    }

    #[test]
    fn test_stride_iter_order() {
        let iter = StrideIter::new(&[0, 8], &[8, 12], &[4, 8]);
        assert_eq!(iter.num(), 4);
        assert_eq!(iter.ith(0), (vec![0, 8], vec![4, 8]));
        assert_eq!(iter.ith(1), (vec![0, 16], vec![4, 4]));
        assert_eq!(iter.ith(2), (vec![4, 8], vec![4, 8]));
        assert_eq!(to_block_coords(&iter.ith(3).0, &[4, 8]), vec![1, 2]);
    }

    #[test]
    fn test_block_align() {
        let (s, c) = block_align(&[5, 0], &[10, 3], &[4, 4], &[18, 10]);
        assert_eq!(s, vec![4, 0]);
        assert_eq!(c, vec![12, 4]);

        let (s, c) = block_align(&[13], &[5], &[4], &[18]);
        assert_eq!(s, vec![12]);
        assert_eq!(c, vec![6]);
    }

    #[test]
    fn test_for_each_run() {
        let mut runs = Vec::new();
        for_each_run(&[4, 5], &[1, 2], &[2, 3], |a, b, n| runs.push((a, b, n)));
        assert_eq!(runs, vec![(7, 0, 3), (12, 3, 3)]);
    }

    #[test]
    fn test_block_and_unblock() {
        // 2 x 3 slab copied into a 4 x 4 block
        let slab: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let mut block = vec![0.0; 16];
        block_into(
            &slab,
            &[2, 3],
            &[0, 0],
            &[2, 3],
            None,
            &mut block,
            &[4, 4],
            ExtensionMode::Sp0,
        )
        .unwrap();
        assert_eq!(&block[0..4], &[0.0, 1.0, 2.0, 2.0]);
        assert_eq!(&block[4..8], &[3.0, 4.0, 5.0, 5.0]);
        assert_eq!(&block[8..12], &[3.0, 4.0, 5.0, 5.0]);

        let mut out = vec![-1.0; 6];
        unblock_into(&block, &[4, 4], &[2, 3], &mut out, &[2, 3], &[0, 0]).unwrap();
        assert_eq!(out, slab);
    }

    #[test]
    fn test_block_mask_uses_valid_mean() {
        let slab = vec![1.0, 100.0, 3.0, 5.0];
        let mask = vec![true, false, true, true];
        let mut block = vec![0.0; 4];
        block_into(
            &slab,
            &[4],
            &[0],
            &[4],
            Some(&mask),
            &mut block,
            &[4],
            ExtensionMode::Symh,
        )
        .unwrap();
        assert_eq!(block, vec![1.0, 3.0, 3.0, 5.0]);
    }
}
