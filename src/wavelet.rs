//! Biorthogonal wavelets implemented by lifting, and the separable
//! multi-level transform applied to a whole block.
//!
//! Transforms are non-expansive: a line of `n` samples yields `ceil(n/2)`
//! approximation and `floor(n/2)` detail coefficients, with whole-point
//! symmetric extension at both ends. Coefficients are scaled so the
//! approximation band of every level has a gain of `sqrt(2)` per axis.

use crate::error::{Result, VdcError};
use ndarray::{ArrayViewMut, ArrayViewMut1, Axis as ArrayAxis, IxDyn, Slice};
use std::f64::consts::SQRT_2;
use std::fmt;

/// Supported wavelet families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wavelet {
    /// Haar
    Bior11,
    /// CDF 5/3
    Bior22,
    /// CDF 9/7
    Bior44,
}

#[derive(Debug, Clone, Copy)]
enum Step {
    /// d[i] += c * (s[i] + s[i + 1])
    Predict(f64),
    /// s[i] += c * (d[i - 1] + d[i])
    Update(f64),
    /// Haar only: d[i] -= s[i]; s[i] += d[i] / 2
    HaarPair,
}

const CDF97_GAIN: f64 = 1.230_174_104_914_001;

impl Wavelet {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bior1.1" | "haar" => Some(Wavelet::Bior11),
            "bior2.2" => Some(Wavelet::Bior22),
            "bior4.4" => Some(Wavelet::Bior44),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Wavelet::Bior11 => "bior1.1",
            Wavelet::Bior22 => "bior2.2",
            Wavelet::Bior44 => "bior4.4",
        }
    }

    /// Shortest approximation band a decomposition may leave behind
    pub fn min_band_len(&self) -> usize {
        match self {
            Wavelet::Bior11 => 1,
            Wavelet::Bior22 => 2,
            Wavelet::Bior44 => 4,
        }
    }

    /// Maximum number of decomposition levels for a line of `n`
    pub fn max_level(&self, n: usize) -> usize {
        let band = self.min_band_len();
        if n < band * 2 {
            return 0;
        }
        let ratio = n / band;
        (usize::BITS - 1 - ratio.leading_zeros()) as usize
    }

    fn steps(&self) -> &'static [Step] {
        match self {
            Wavelet::Bior11 => &[Step::HaarPair],
            Wavelet::Bior22 => &[Step::Predict(-0.5), Step::Update(0.25)],
            Wavelet::Bior44 => &[
                Step::Predict(-1.586_134_342_059_924),
                Step::Update(-0.052_980_118_572_961),
                Step::Predict(0.882_911_075_530_934),
                Step::Update(0.443_506_852_043_971),
            ],
        }
    }

    /// Gain of the approximation band before normalization
    fn raw_gain(&self) -> f64 {
        match self {
            Wavelet::Bior11 | Wavelet::Bior22 => 1.0,
            Wavelet::Bior44 => CDF97_GAIN,
        }
    }

    /// One analysis step over `line`. `s` and `d` are work buffers.
    fn forward_line(&self, line: &mut ArrayViewMut1<f32>, s: &mut Vec<f64>, d: &mut Vec<f64>) {
        let n = line.len();
        if n < 2 {
            return;
        }
        let ns = n.div_ceil(2);
        let nd = n / 2;
        s.clear();
        d.clear();
        for i in 0..ns {
            s.push(line[2 * i] as f64);
        }
        for i in 0..nd {
            d.push(line[2 * i + 1] as f64);
        }

        for step in self.steps() {
            apply_step(*step, s, d, false);
        }

        let s_scale = SQRT_2 / self.raw_gain();
        for i in 0..ns {
            line[i] = (s[i] * s_scale) as f32;
        }
        for i in 0..nd {
            line[ns + i] = (d[i] / s_scale) as f32;
        }
    }

    /// Exact inverse of [`Wavelet::forward_line`]
    fn inverse_line(&self, line: &mut ArrayViewMut1<f32>, s: &mut Vec<f64>, d: &mut Vec<f64>) {
        let n = line.len();
        if n < 2 {
            return;
        }
        let ns = n.div_ceil(2);
        let nd = n / 2;
        let s_scale = SQRT_2 / self.raw_gain();
        s.clear();
        d.clear();
        for i in 0..ns {
            s.push(line[i] as f64 / s_scale);
        }
        for i in 0..nd {
            d.push(line[ns + i] as f64 * s_scale);
        }

        for step in self.steps().iter().rev() {
            apply_step(*step, s, d, true);
        }

        for i in 0..ns {
            line[2 * i] = s[i] as f32;
        }
        for i in 0..nd {
            line[2 * i + 1] = d[i] as f32;
        }
    }
}

impl fmt::Display for Wavelet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn apply_step(step: Step, s: &mut [f64], d: &mut [f64], inverse: bool) {
    let ns = s.len();
    let nd = d.len();
    let sign = if inverse { -1.0 } else { 1.0 };
    match step {
        Step::Predict(c) => {
            for i in 0..nd {
                let right = s[(i + 1).min(ns - 1)];
                d[i] += sign * c * (s[i] + right);
            }
        }
        Step::Update(c) => {
            if nd == 0 {
                return;
            }
            for i in 0..ns {
                let left = d[i.saturating_sub(1).min(nd - 1)];
                let right = d[i.min(nd - 1)];
                s[i] += sign * c * (left + right);
            }
        }
        Step::HaarPair => {
            if inverse {
                for i in 0..nd {
                    s[i] -= d[i] / 2.0;
                    d[i] += s[i];
                }
            } else {
                for i in 0..nd {
                    d[i] -= s[i];
                    s[i] += d[i] / 2.0;
                }
            }
        }
    }
}

/// Separable multi-level transform of an N-dimensional block.
///
/// Axes whose extent is 1 are left untouched. Each level transforms every
/// active axis over the current approximation corner, then halves it.
#[derive(Debug, Clone)]
pub struct BlockTransform {
    wavelet: Wavelet,
    bs: Vec<usize>,
    nlevels: usize,
    /// Corner extents before level `j` is applied; `extents[nlevels]` is the
    /// final approximation band.
    extents: Vec<Vec<usize>>,
}

impl BlockTransform {
    pub fn new(wavelet: Wavelet, bs: &[usize]) -> Result<Self> {
        if bs.is_empty() || bs.iter().any(|&b| b == 0) {
            return Err(VdcError::InvalidCompression(format!(
                "invalid block shape {:?}",
                bs
            )));
        }
        let nlevels = bs
            .iter()
            .filter(|&&b| b > 1)
            .map(|&b| wavelet.max_level(b))
            .min()
            .unwrap_or(0);

        let mut extents = Vec::with_capacity(nlevels + 1);
        let mut current = bs.to_vec();
        extents.push(current.clone());
        for _ in 0..nlevels {
            current = current.iter().map(|&e| e.div_ceil(2)).collect();
            extents.push(current.clone());
        }

        Ok(Self {
            wavelet,
            bs: bs.to_vec(),
            nlevels,
            extents,
        })
    }

    pub fn wavelet(&self) -> Wavelet {
        self.wavelet
    }

    pub fn block_shape(&self) -> &[usize] {
        &self.bs
    }

    /// Number of decomposition levels
    pub fn num_levels(&self) -> usize {
        self.nlevels
    }

    /// Total number of coefficients, equal to the block size
    pub fn num_coeffs(&self) -> usize {
        self.bs.iter().product()
    }

    /// Number of coefficients in the coarsest approximation band
    pub fn num_approx(&self) -> usize {
        self.extents[self.nlevels].iter().product()
    }

    /// Number of transformed axes
    pub fn num_active_axes(&self) -> usize {
        self.bs.iter().filter(|&&b| b > 1).count()
    }

    /// Block shape when reconstructed at refinement `level` (0 = coarsest)
    pub fn shape_at_level(&self, level: usize) -> &[usize] {
        let level = level.min(self.nlevels);
        &self.extents[self.nlevels - level]
    }

    /// Whether the flat block index lies in the coarsest approximation band
    pub fn is_approx(&self, mut index: usize) -> bool {
        let band = &self.extents[self.nlevels];
        for d in (0..self.bs.len()).rev() {
            if index % self.bs[d] >= band[d] {
                return false;
            }
            index /= self.bs[d];
        }
        true
    }

    /// Forward transform in place
    pub fn forward(&self, block: &mut [f32], work: &mut (Vec<f64>, Vec<f64>)) -> Result<()> {
        let mut view = block_view(block, &self.bs)?;
        for level in 0..self.nlevels {
            let ext = &self.extents[level];
            let mut corner = view.slice_each_axis_mut(|ax| Slice::from(0..ext[ax.axis.index()]));
            for axis in 0..self.bs.len() {
                if self.bs[axis] == 1 {
                    continue;
                }
                for mut lane in corner.lanes_mut(ArrayAxis(axis)) {
                    self.wavelet.forward_line(&mut lane, &mut work.0, &mut work.1);
                }
            }
        }
        Ok(())
    }

    /// Inverse transform in place, stopping at refinement `level`. The
    /// reconstruction occupies the leading corner of shape
    /// [`BlockTransform::shape_at_level`] and is rescaled to sample units.
    pub fn inverse(
        &self,
        block: &mut [f32],
        level: usize,
        work: &mut (Vec<f64>, Vec<f64>),
    ) -> Result<()> {
        let level = level.min(self.nlevels);
        let mut view = block_view(block, &self.bs)?;
        let stop = self.nlevels - level;
        for j in (stop..self.nlevels).rev() {
            let ext = &self.extents[j];
            let mut corner = view.slice_each_axis_mut(|ax| Slice::from(0..ext[ax.axis.index()]));
            for axis in (0..self.bs.len()).rev() {
                if self.bs[axis] == 1 {
                    continue;
                }
                for mut lane in corner.lanes_mut(ArrayAxis(axis)) {
                    self.wavelet.inverse_line(&mut lane, &mut work.0, &mut work.1);
                }
            }
        }

        if stop > 0 {
            let ext = &self.extents[stop];
            let gain = SQRT_2.powi((self.num_active_axes() * stop) as i32);
            let scale = (1.0 / gain) as f32;
            view.slice_each_axis_mut(|ax| Slice::from(0..ext[ax.axis.index()]))
                .mapv_inplace(|v| v * scale);
        }
        Ok(())
    }
}

fn block_view<'a>(block: &'a mut [f32], bs: &[usize]) -> Result<ArrayViewMut<'a, f32, IxDyn>> {
    let n: usize = bs.iter().product();
    if block.len() < n {
        return Err(VdcError::InvalidArgument(format!(
            "block buffer holds {} values, block needs {}",
            block.len(),
            n
        )));
    }
    ArrayViewMut::from_shape(IxDyn(bs), &mut block[..n])
        .map_err(|e| VdcError::InvalidArgument(e.to_string()))
}
