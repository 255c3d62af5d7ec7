//! Square grids of 4-lane scalar pixels.

use std::sync::atomic::{AtomicU64, Ordering};

use half::f16;
use ndarray::{s, Array3, Axis, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// One pixel: four packed scalar lanes.
pub type Texel = [f32; 4];

/// Number of lanes packed into every pixel.
pub const LANES: usize = 4;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Storage precision of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Precision {
    /// Single precision.
    #[default]
    Full,
    /// Every written value is rounded to IEEE binary16.
    Reduced,
}

impl Precision {
    #[inline]
    pub fn quantize(self, value: f32) -> f32 {
        match self {
            Precision::Full => value,
            Precision::Reduced => f16::from_f32(value).to_f32(),
        }
    }
}

/// Filtering used by [`Buffer::sample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Filtering {
    #[default]
    Nearest,
    Linear,
}

/// Allocation request for a [`Buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    pub side: usize,
    pub precision: Precision,
    pub filtering: Filtering,
    pub mipmap: bool,
}

impl BufferSpec {
    pub fn new(side: usize) -> Self {
        Self {
            side,
            precision: Precision::Full,
            filtering: Filtering::Nearest,
            mipmap: false,
        }
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn interpolated(mut self) -> Self {
        self.filtering = Filtering::Linear;
        self
    }

    pub fn mipmapped(mut self) -> Self {
        self.mipmap = true;
        self
    }

    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.side == 0 {
            return Err(DeviceError::InvalidBuffer("side must be positive".into()));
        }
        if self.mipmap && !self.side.is_power_of_two() {
            return Err(DeviceError::InvalidBuffer(format!(
                "mip chain requires a power-of-two side, got {}",
                self.side
            )));
        }
        Ok(())
    }
}

/// A W×W grid of 4-lane pixels stored as `[y, x, lane]`.
///
/// Buffers are owned by exactly one component. Kernels bind them read-only
/// through `&Buffer` and render into them through `&mut Buffer`, so a buffer
/// can never be both the target and a source of the same draw.
#[derive(Debug)]
pub struct Buffer {
    id: u64,
    spec: BufferSpec,
    pub(crate) data: Array3<f32>,
    mips: Vec<Array3<f32>>,
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            spec: self.spec,
            data: self.data.clone(),
            mips: self.mips.clone(),
        }
    }
}

impl Buffer {
    pub(crate) fn zeroed(spec: BufferSpec) -> Self {
        let mut buffer = Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            spec,
            data: Array3::zeros((spec.side, spec.side, LANES)),
            mips: Vec::new(),
        };
        buffer.rebuild_mips();
        buffer
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn spec(&self) -> BufferSpec {
        self.spec
    }

    pub fn side(&self) -> usize {
        self.spec.side
    }

    /// Number of scalar slots (`side² · 4`).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Texel at integer coordinates.
    #[inline]
    pub fn texel(&self, x: usize, y: usize) -> Texel {
        let row = self.data.slice(s![y, x, ..]);
        [row[0], row[1], row[2], row[3]]
    }

    /// Texel at signed coordinates, zero outside the grid.
    #[inline]
    pub fn texel_or_zero(&self, x: i64, y: i64) -> Texel {
        let side = self.spec.side as i64;
        if x < 0 || y < 0 || x >= side || y >= side {
            return [0.0; LANES];
        }
        self.texel(x as usize, y as usize)
    }

    /// Texel at signed coordinates, clamped to the edge.
    #[inline]
    pub fn texel_clamped(&self, x: i64, y: i64) -> Texel {
        let max = self.spec.side as i64 - 1;
        self.texel(x.clamp(0, max) as usize, y.clamp(0, max) as usize)
    }

    /// Samples at normalized coordinates with the buffer's filtering.
    /// Coordinates outside `[0, 1]` clamp to the edge.
    pub fn sample(&self, u: f32, v: f32) -> Texel {
        let side = self.spec.side as f32;
        match self.spec.filtering {
            Filtering::Nearest => {
                let x = (u * side).floor() as i64;
                let y = (v * side).floor() as i64;
                self.texel_clamped(x, y)
            }
            Filtering::Linear => {
                let fx = u * side - 0.5;
                let fy = v * side - 0.5;
                let x0 = fx.floor();
                let y0 = fy.floor();
                let tx = fx - x0;
                let ty = fy - y0;
                let (x0, y0) = (x0 as i64, y0 as i64);
                let a = self.texel_clamped(x0, y0);
                let b = self.texel_clamped(x0 + 1, y0);
                let c = self.texel_clamped(x0, y0 + 1);
                let d = self.texel_clamped(x0 + 1, y0 + 1);
                let mut out = [0.0; LANES];
                for lane in 0..LANES {
                    let top = a[lane] + (b[lane] - a[lane]) * tx;
                    let bottom = c[lane] + (d[lane] - c[lane]) * tx;
                    out[lane] = top + (bottom - top) * ty;
                }
                out
            }
        }
    }

    /// Scalar at packed slot `index` (`pixel * 4 + lane`).
    pub fn get(&self, index: usize) -> f32 {
        let (x, y, lane) = slot_position(index, self.spec.side);
        self.data[[y, x, lane]]
    }

    /// Host-side upload of packed slots. Missing trailing slots are zeroed.
    pub fn upload(&mut self, values: &[f32]) -> Result<(), DeviceError> {
        if values.len() > self.len() {
            return Err(DeviceError::InvalidBuffer(format!(
                "{} values do not fit a buffer of {} slots",
                values.len(),
                self.len()
            )));
        }
        let precision = self.spec.precision;
        let slice = self
            .data
            .as_slice_mut()
            .ok_or_else(|| DeviceError::InvalidBuffer("non-contiguous storage".into()))?;
        for (index, slot) in slice.iter_mut().enumerate() {
            *slot = precision.quantize(values.get(index).copied().unwrap_or(0.0));
        }
        self.rebuild_mips();
        Ok(())
    }

    /// Host-side write of a single texel.
    pub fn set_texel(&mut self, x: usize, y: usize, texel: Texel) {
        let precision = self.spec.precision;
        for (lane, value) in texel.iter().enumerate() {
            self.data[[y, x, lane]] = precision.quantize(*value);
        }
        self.rebuild_mips();
    }

    /// Packed slots in row-major order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    /// Index of the first non-finite slot, if any.
    pub fn first_non_finite(&self) -> Option<usize> {
        match self.data.as_slice() {
            Some(slice) => slice.par_iter().position_first(|value| !value.is_finite()),
            None => self.data.iter().position(|value| !value.is_finite()),
        }
    }

    /// Per-lane sums over the whole grid.
    ///
    /// Mipmapped buffers read the top of their box-filtered chain (mean of
    /// every pixel) and scale it by the pixel count.
    pub fn lane_sums(&self) -> Texel {
        let mut sums = [0.0; LANES];
        if let Some(top) = self.mips.last() {
            let area = (self.spec.side * self.spec.side) as f32;
            for (lane, sum) in sums.iter_mut().enumerate() {
                *sum = top[[0, 0, lane]] * area;
            }
            return sums;
        }
        for (lane, sum) in sums.iter_mut().enumerate() {
            *sum = self.data.index_axis(Axis(2), lane).sum();
        }
        sums
    }

    /// Box-filtered mip levels below the base level, smallest last.
    pub fn mip_levels(&self) -> &[Array3<f32>] {
        &self.mips
    }

    pub(crate) fn finish_write(&mut self) {
        if self.spec.precision == Precision::Reduced {
            self.data
                .par_mapv_inplace(|value| Precision::Reduced.quantize(value));
        }
        self.rebuild_mips();
    }

    fn rebuild_mips(&mut self) {
        if !self.spec.mipmap {
            return;
        }
        self.mips.clear();
        let mut side = self.spec.side;
        while side > 1 {
            let half = side / 2;
            let parent = self.mips.last().unwrap_or(&self.data);
            let mut level = Array3::<f32>::zeros((half, half, LANES));
            Zip::indexed(&mut level).par_for_each(|(y, x, lane), out| {
                let (px, py) = (2 * x, 2 * y);
                *out = 0.25
                    * (parent[[py, px, lane]]
                        + parent[[py, px + 1, lane]]
                        + parent[[py + 1, px, lane]]
                        + parent[[py + 1, px + 1, lane]]);
            });
            self.mips.push(level);
            side = half;
        }
    }
}

/// `(x, y, lane)` of packed slot `index` in a grid of `side`.
#[inline]
pub fn slot_position(index: usize, side: usize) -> (usize, usize, usize) {
    let pixel = index / LANES;
    (pixel % side, pixel / side, index % LANES)
}

/// Packed slot of `(x, y, lane)` in a grid of `side`.
#[inline]
pub fn slot_index(x: usize, y: usize, lane: usize, side: usize) -> usize {
    (y * side + x) * LANES + lane
}
