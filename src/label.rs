use serde::{Deserialize, Serialize};

use crate::error::{LabelError, Result};

// ============================================================================
// LABEL SENTINELS
// ============================================================================

/// Background / unlabeled voxel.
pub const BACKGROUND: u64 = 0;

/// Unset: no assignment, no paint.
pub const TRANSPARENT: u64 = u64::MAX;

/// Every id other than the two sentinels.
#[inline]
pub fn is_regular(id: u64) -> bool {
    id != BACKGROUND && id != TRANSPARENT
}

pub fn ensure_regular(id: u64) -> Result<u64> {
    if is_regular(id) {
        Ok(id)
    } else {
        Err(LabelError::IrregularId(id))
    }
}

// ============================================================================
// COORDINATES
// ============================================================================

/// Voxel coordinate `[x, y, z]`. Signed so neighbour offsets can step off the
/// volume and be rejected by [`Extent::contains`].
pub type Coord = [i64; 3];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "x" => Some(Axis::X),
            "y" => Some(Axis::Y),
            "z" => Some(Axis::Z),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }

    /// The two axes spanning the plane normal to `self`.
    pub fn plane(self) -> (usize, usize) {
        match self {
            Axis::X => (1, 2),
            Axis::Y => (0, 2),
            Axis::Z => (0, 1),
        }
    }
}

/// Volume dimensions; valid coordinates are `0 <= c[i] < dims[i]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub dims: [u64; 3],
}

impl Extent {
    pub fn new(dims: [u64; 3]) -> Self {
        Self { dims }
    }

    #[inline]
    pub fn contains(&self, c: Coord) -> bool {
        (0..3).all(|i| c[i] >= 0 && (c[i] as u64) < self.dims[i])
    }

    pub fn check(&self, c: Coord) -> Result<()> {
        if self.contains(c) {
            Ok(())
        } else {
            Err(LabelError::OutOfBounds {
                coord: c,
                extent: self.dims,
            })
        }
    }

    pub fn voxel_count(&self) -> u64 {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// Raster index (x fastest). Caller guarantees `contains(c)`.
    #[inline]
    pub fn linear_index(&self, c: Coord) -> u64 {
        (c[2] as u64 * self.dims[1] + c[1] as u64) * self.dims[0] + c[0] as u64
    }

    /// Number of chunks along each axis for the given chunk shape.
    pub fn chunk_grid(&self, chunk_shape: [u32; 3]) -> [u64; 3] {
        let mut grid = [0u64; 3];
        for i in 0..3 {
            let cs = chunk_shape[i] as u64;
            grid[i] = self.dims[i].div_ceil(cs);
        }
        grid
    }

    /// Every chunk key covering the extent, raster order (x fastest).
    pub fn chunk_keys(&self, chunk_shape: [u32; 3]) -> Vec<[u64; 3]> {
        let grid = self.chunk_grid(chunk_shape);
        let mut keys = Vec::with_capacity((grid[0] * grid[1] * grid[2]) as usize);
        for cz in 0..grid[2] {
            for cy in 0..grid[1] {
                for cx in 0..grid[0] {
                    keys.push([cx, cy, cz]);
                }
            }
        }
        keys
    }

    /// Voxel origin and in-extent dimensions of the chunk at `key`.
    pub fn chunk_bounds(&self, key: [u64; 3], chunk_shape: [u32; 3]) -> ([u64; 3], [u64; 3]) {
        let mut origin = [0u64; 3];
        let mut dims = [0u64; 3];
        for i in 0..3 {
            let cs = chunk_shape[i] as u64;
            origin[i] = key[i] * cs;
            dims[i] = cs.min(self.dims[i].saturating_sub(origin[i]));
        }
        (origin, dims)
    }
}

/// Parse `"x,y,z"` into three integers.
pub fn parse_triple<T: std::str::FromStr>(s: &str) -> Option<[T; 3]> {
    let mut parts = s.split(',').map(|p| p.trim().parse::<T>());
    let a = parts.next()?.ok()?;
    let b = parts.next()?.ok()?;
    let c = parts.next()?.ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some([a, b, c])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_not_regular() {
        assert!(!is_regular(BACKGROUND));
        assert!(!is_regular(TRANSPARENT));
        assert!(is_regular(1));
        assert!(is_regular(TRANSPARENT - 1));
    }

    #[test]
    fn extent_bounds() {
        let e = Extent::new([4, 3, 2]);
        assert!(e.contains([0, 0, 0]));
        assert!(e.contains([3, 2, 1]));
        assert!(!e.contains([4, 0, 0]));
        assert!(!e.contains([-1, 0, 0]));
        assert!(matches!(
            e.check([0, 3, 0]),
            Err(LabelError::OutOfBounds { .. })
        ));
        assert_eq!(e.linear_index([1, 2, 1]), 12 + 2 * 4 + 1);
        assert_eq!(e.chunk_grid([2, 2, 2]), [2, 2, 1]);
        let keys = e.chunk_keys([2, 2, 2]);
        assert_eq!(keys.len(), 4);
        assert_eq!(keys[1], [1, 0, 0]);
        assert_eq!(e.chunk_bounds([1, 1, 0], [2, 2, 2]), ([2, 2, 0], [2, 1, 2]));
    }

    #[test]
    fn triples() {
        assert_eq!(parse_triple::<u32>("64, 64,8"), Some([64, 64, 8]));
        assert_eq!(parse_triple::<i64>("1,2"), None);
        assert_eq!(parse_triple::<i64>("1,2,3,4"), None);
    }
}
