//! Address tables for windowed connectivities.
//!
//! Tables are derived purely from geometry at construction and then bound
//! read-only. Integer coordinates are stored as floats, exact up to 2^24.

use crate::error::DeviceError;
use crate::substrate::{Buffer, BufferSpec, Device, Texel};

/// Top-left source pixel of the window read by destination pixel `(x, y)`.
pub type OriginFn = dyn Fn(usize, usize) -> (i64, i64) + Send + Sync;

/// Decodes an integer stored in a table lane.
#[inline]
pub fn index(value: f32) -> usize {
    value as usize
}

/// Decodes a signed integer stored in a table lane.
#[inline]
pub fn signed(value: f32) -> i64 {
    value.round() as i64
}

/// Linear pixel `p` of a buffer of `side` as `(x, y)`.
#[inline]
pub fn pixel_xy(p: usize, side: usize) -> (usize, usize) {
    (p % side, p / side)
}

/// Texel at linear pixel `p`.
#[inline]
pub fn texel_at(buffer: &Buffer, p: usize) -> Texel {
    let (x, y) = pixel_xy(p, buffer.side());
    buffer.texel(x, y)
}

/// Dot product of two texels.
#[inline]
pub fn dot(a: Texel, b: Texel) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2] + a[3] * b[3]
}

/// Smallest side whose grid holds `count` texels.
pub fn table_side(count: usize) -> usize {
    let mut side = (count as f64).sqrt().ceil() as usize;
    while side * side < count {
        side += 1;
    }
    side.max(1)
}

/// Uploads one texel per destination pixel holding its window origin.
pub fn origin_table(device: &Device, to: usize, origin: &OriginFn) -> Result<Buffer, DeviceError> {
    let mut values = Vec::with_capacity(to * to * 4);
    for y in 0..to {
        for x in 0..to {
            let (ox, oy) = origin(x, y);
            values.extend_from_slice(&[ox as f32, oy as f32, 0.0, 0.0]);
        }
    }
    let mut table = device.allocate(BufferSpec::new(to))?;
    table.upload(&values)?;
    Ok(table)
}

/// One window tap reaching a source pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransposeEntry {
    pub dest_pixel: u32,
    pub tap: u32,
}

/// Compressed source-pixel → (destination pixel, tap) index: the transpose
/// of a windowed forward mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransposeIndex {
    offsets: Vec<u32>,
    entries: Vec<TransposeEntry>,
}

impl TransposeIndex {
    /// Walks every tap of every destination window of side `sparsity` and
    /// files it under the source pixel it reads. Taps outside the source
    /// grid are dropped.
    pub fn build(from: usize, to: usize, sparsity: usize, origin: &OriginFn) -> Self {
        let mut buckets: Vec<Vec<TransposeEntry>> = vec![Vec::new(); from * from];
        for y in 0..to {
            for x in 0..to {
                let (ox, oy) = origin(x, y);
                for wy in 0..sparsity {
                    for wx in 0..sparsity {
                        let (sx, sy) = (ox + wx as i64, oy + wy as i64);
                        if sx < 0 || sy < 0 || sx >= from as i64 || sy >= from as i64 {
                            continue;
                        }
                        buckets[sy as usize * from + sx as usize].push(TransposeEntry {
                            dest_pixel: (y * to + x) as u32,
                            tap: (wy * sparsity + wx) as u32,
                        });
                    }
                }
            }
        }

        let mut offsets = Vec::with_capacity(buckets.len() + 1);
        let mut entries = Vec::new();
        offsets.push(0);
        for bucket in buckets {
            entries.extend(bucket);
            offsets.push(entries.len() as u32);
        }
        Self { offsets, entries }
    }

    pub fn entries_for(&self, source_pixel: usize) -> &[TransposeEntry] {
        let start = self.offsets[source_pixel] as usize;
        let end = self.offsets[source_pixel + 1] as usize;
        &self.entries[start..end]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Uploads the index as two tables: per source pixel `(start, count)`,
    /// and per entry `(dest x, dest y, tap)`.
    pub fn upload(&self, device: &Device, from: usize, to: usize) -> Result<(Buffer, Buffer), DeviceError> {
        let mut ranges = Vec::with_capacity(from * from * 4);
        for pixel in 0..from * from {
            let start = self.offsets[pixel];
            let count = self.offsets[pixel + 1] - start;
            ranges.extend_from_slice(&[start as f32, count as f32, 0.0, 0.0]);
        }
        let mut offsets = device.allocate(BufferSpec::new(from))?;
        offsets.upload(&ranges)?;

        let mut packed = Vec::with_capacity(self.entries.len() * 4);
        for entry in &self.entries {
            let (dx, dy) = pixel_xy(entry.dest_pixel as usize, to);
            packed.extend_from_slice(&[dx as f32, dy as f32, entry.tap as f32, 0.0]);
        }
        let mut entries = device.allocate(BufferSpec::new(table_side(self.entries.len())))?;
        entries.upload(&packed)?;
        Ok((offsets, entries))
    }
}
