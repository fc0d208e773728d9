//! Read-only base label volumes.

use crate::error::{LabelError, Result};
use crate::label::{Coord, Extent, TRANSPARENT, is_regular};

/// Chunked, read-only label volume underneath the painted canvas.
pub trait LabelSource: Send + Sync {
    /// Fragment id at `c`. Callers only pass coordinates inside [`extent`](Self::extent).
    fn read_voxel(&self, c: Coord) -> u64;

    fn extent(&self) -> Extent;

    fn chunk_shape(&self) -> [u32; 3];
}

/// Fully materialized volume, raster order with x fastest.
#[derive(Clone, Debug, PartialEq)]
pub struct DenseVolume {
    extent: Extent,
    chunk_shape: [u32; 3],
    data: Vec<u64>,
}

impl DenseVolume {
    /// Volume with every voxel set to `value`.
    pub fn filled(extent: Extent, chunk_shape: [u32; 3], value: u64) -> Self {
        Self {
            extent,
            chunk_shape,
            data: vec![value; extent.voxel_count() as usize],
        }
    }

    pub fn from_data(extent: Extent, chunk_shape: [u32; 3], data: Vec<u64>) -> Result<Self> {
        if data.len() as u64 != extent.voxel_count() {
            return Err(LabelError::InvalidFormat(format!(
                "volume {:?} needs {} voxels, got {}",
                extent.dims,
                extent.voxel_count(),
                data.len()
            )));
        }
        if chunk_shape.contains(&0) {
            return Err(LabelError::InvalidFormat(format!(
                "chunk shape {:?} has a zero edge",
                chunk_shape
            )));
        }
        Ok(Self {
            extent,
            chunk_shape,
            data,
        })
    }

    pub fn data(&self) -> &[u64] {
        &self.data
    }

    pub fn set(&mut self, c: Coord, value: u64) -> Result<()> {
        self.extent.check(c)?;
        let idx = self.extent.linear_index(c) as usize;
        self.data[idx] = value;
        Ok(())
    }

    /// Largest regular id present, or `0` when there is none.
    pub fn max_regular_id(&self) -> u64 {
        self.data
            .iter()
            .copied()
            .filter(|&v| is_regular(v))
            .max()
            .unwrap_or(0)
    }

    /// True when every voxel is `TRANSPARENT`.
    pub fn is_all_transparent(&self) -> bool {
        self.data.iter().all(|&v| v == TRANSPARENT)
    }

    /// Copy a block of voxels starting at `origin` with `dims` into `out`
    /// (x fastest). Used when streaming chunks to storage.
    pub fn copy_block(&self, origin: [u64; 3], dims: [u64; 3], out: &mut Vec<u64>) {
        out.clear();
        out.reserve((dims[0] * dims[1] * dims[2]) as usize);
        for z in origin[2]..origin[2] + dims[2] {
            for y in origin[1]..origin[1] + dims[1] {
                let row = ((z * self.extent.dims[1] + y) * self.extent.dims[0] + origin[0]) as usize;
                out.extend_from_slice(&self.data[row..row + dims[0] as usize]);
            }
        }
    }

    /// Inverse of [`copy_block`](Self::copy_block).
    pub fn write_block(&mut self, origin: [u64; 3], dims: [u64; 3], block: &[u64]) {
        let row_len = dims[0] as usize;
        let mut src = 0usize;
        for z in origin[2]..origin[2] + dims[2] {
            for y in origin[1]..origin[1] + dims[1] {
                let row = ((z * self.extent.dims[1] + y) * self.extent.dims[0] + origin[0]) as usize;
                self.data[row..row + row_len].copy_from_slice(&block[src..src + row_len]);
                src += row_len;
            }
        }
    }
}

impl LabelSource for DenseVolume {
    #[inline]
    fn read_voxel(&self, c: Coord) -> u64 {
        self.data[self.extent.linear_index(c) as usize]
    }

    fn extent(&self) -> Extent {
        self.extent
    }

    fn chunk_shape(&self) -> [u32; 3] {
        self.chunk_shape
    }
}
