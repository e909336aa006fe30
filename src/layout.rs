//! Volume layout - how a volume is partitioned into fixed-size blocks

use crate::error::{Error, Result};
use crate::types::{BlockCoord, DataType, RawBlock};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Immutable global parameters of a volume.
///
/// The voxel extent is `(X, Y, Z)`, the block extent `(bx, by, bz)`.
/// The derived grid extent is `ceil(extent / block)` per axis; blocks on
/// the high edge may cover fewer voxels than the nominal shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeLayout {
    extent: [u64; 3],
    block_size: [u32; 3],
    dtype: DataType,
}

impl VolumeLayout {
    /// Create a layout from voxel extent `(X, Y, Z)`, block extent
    /// `(bx, by, bz)` and element type.
    pub fn new(extent: [u64; 3], block_size: [u32; 3], dtype: DataType) -> Result<Self> {
        if extent.iter().any(|&e| e == 0) {
            return Err(Error::Format("volume extent must be non-zero".into()));
        }
        if block_size.iter().any(|&b| b == 0) {
            return Err(Error::Format("block extent must be non-zero".into()));
        }
        let layout = Self {
            extent,
            block_size,
            dtype,
        };
        // Grid coordinates travel as u32 triples; reject degenerate grids
        // that would not fit.
        for axis in 0..3 {
            if layout.grid_axis(axis) > u32::MAX as u64 {
                return Err(Error::Format(format!(
                    "grid extent along axis {} exceeds u32",
                    axis
                )));
            }
        }
        layout
            .grid_axis(0)
            .checked_mul(layout.grid_axis(1))
            .and_then(|cells| cells.checked_mul(layout.grid_axis(2)))
            .ok_or_else(|| Error::Format("grid cell count overflows u64".into()))?;
        Ok(layout)
    }

    /// Voxel extent `(X, Y, Z)`
    pub fn extent(&self) -> [u64; 3] {
        self.extent
    }

    /// Block extent `(bx, by, bz)`
    pub fn block_size(&self) -> [u32; 3] {
        self.block_size
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    fn grid_axis(&self, axis: usize) -> u64 {
        let block = self.block_size[axis] as u64;
        (self.extent[axis] + block - 1) / block
    }

    /// Number of blocks along each axis, `(Nx, Ny, Nz)`
    pub fn grid_extent(&self) -> [u32; 3] {
        [
            self.grid_axis(0) as u32,
            self.grid_axis(1) as u32,
            self.grid_axis(2) as u32,
        ]
    }

    /// Total number of grid cells, `Nx * Ny * Nz`
    pub fn cell_count(&self) -> u64 {
        let [nx, ny, nz] = self.grid_extent();
        nx as u64 * ny as u64 * nz as u64
    }

    /// Check a grid coordinate against the grid extent
    pub fn in_bounds(&self, coord: BlockCoord) -> bool {
        let [nx, ny, nz] = self.grid_extent();
        coord.x < nx && coord.y < ny && coord.z < nz
    }

    /// Linearised index of a grid coordinate, x fastest
    pub fn linear_index(&self, coord: BlockCoord) -> u64 {
        let [nx, ny, _] = self.grid_extent();
        ((coord.z as u64 * ny as u64) + coord.y as u64) * nx as u64 + coord.x as u64
    }

    /// Nominal block shape as `(bz, by, bx)` element counts
    pub fn nominal_shape(&self) -> [u32; 3] {
        let [bx, by, bz] = self.block_size;
        [bz, by, bx]
    }

    /// Shape of the block at `coord` clipped to the volume extent,
    /// as `(z, y, x)` element counts. Interior blocks have the nominal
    /// shape; high-edge blocks are smaller.
    pub fn clipped_shape(&self, coord: BlockCoord) -> [u32; 3] {
        let clip = |axis: usize, g: u32| -> u32 {
            let block = self.block_size[axis] as u64;
            let start = g as u64 * block;
            (self.extent[axis] - start).min(block) as u32
        };
        [clip(2, coord.z), clip(1, coord.y), clip(0, coord.x)]
    }

    /// Bytes in one nominal, uncompressed block
    pub fn block_bytes(&self) -> usize {
        self.block_size.iter().map(|&b| b as usize).product::<usize>()
            * self.dtype.size_in_bytes()
    }

    /// Pad a block to the nominal shape, zero-filling out-of-extent voxels.
    ///
    /// `raw` must already match either the nominal shape or the clipped
    /// shape of an edge block; nominal blocks pass through unchanged.
    pub fn pad_to_nominal(&self, raw: &RawBlock) -> Bytes {
        let nominal = self.nominal_shape();
        if raw.shape() == nominal {
            return raw.data().clone();
        }

        let [cz, cy, cx] = raw.shape();
        let [bz, by, bx] = nominal;
        debug_assert!(cz <= bz && cy <= by && cx <= bx, "shape exceeds nominal");

        let elem = self.dtype.size_in_bytes();
        let src = raw.data();
        let row = cx as usize * elem;
        let mut padded = vec![0u8; self.block_bytes()];
        for z in 0..cz as usize {
            for y in 0..cy as usize {
                let src_off = ((z * cy as usize) + y) * row;
                let dst_off = ((z * by as usize) + y) * bx as usize * elem;
                padded[dst_off..dst_off + row].copy_from_slice(&src[src_off..src_off + row]);
            }
        }
        Bytes::from(padded)
    }
}
