use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{LabelError, Result};
use crate::label::{Axis, Coord, Extent, TRANSPARENT};
use crate::volume::{DenseVolume, LabelSource};

// ============================================================================
// PAINTED CANVAS – sparse chunk overlay composited over the base labels
// ============================================================================

pub const DEFAULT_CHUNK_SHAPE: [u32; 3] = [64, 64, 8];

/// Chunk grid coordinate (not voxel coordinate).
pub type ChunkKey = [u64; 3];

type ChunkBuf = Arc<Mutex<Box<[u64]>>>;

/// What a paint operation touched. `chunks` lets the viewer drop cached tiles.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaintChange {
    /// Voxels visited or written by the operation.
    pub affected: u64,
    pub chunks: BTreeSet<ChunkKey>,
}

impl PaintChange {
    pub fn is_empty(&self) -> bool {
        self.affected == 0
    }

    pub fn absorb(&mut self, other: PaintChange) {
        self.affected += other.affected;
        self.chunks.extend(other.chunks);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrushShape {
    /// Flat disc in the plane normal to the axis.
    Disc(Axis),
    Sphere,
}

impl BrushShape {
    pub fn parse(shape: &str, axis: Axis) -> Option<Self> {
        match shape.trim().to_lowercase().as_str() {
            "disc" | "disk" | "circle" => Some(BrushShape::Disc(axis)),
            "sphere" | "ball" => Some(BrushShape::Sphere),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BrushShape::Disc(_) => "disc",
            BrushShape::Sphere => "sphere",
        }
    }

    /// Per-axis reach of a brush of `radius`; zero along a disc's normal.
    fn reach(&self, radius: f64) -> [i64; 3] {
        let r = radius.max(0.0).floor() as i64;
        let mut reach = [r; 3];
        if let BrushShape::Disc(axis) = self {
            reach[axis.index()] = 0;
        }
        reach
    }
}

/// Mutable overlay of user-painted labels over a read-only [`LabelSource`].
///
/// Chunks live in a map keyed by chunk coordinate and are created the first
/// time a voxel inside them is painted. Each chunk buffer has its own lock;
/// materialization happens under the map's write lock so two painters racing
/// into the same empty chunk end up sharing one buffer. The canvas never
/// evicts chunks.
pub struct PaintedCanvas {
    base: Arc<dyn LabelSource>,
    extent: Extent,
    chunk_shape: [u32; 3],
    chunks: RwLock<HashMap<ChunkKey, ChunkBuf>>,
}

impl PaintedCanvas {
    // ---- construction -------------------------------------------------------

    /// Empty (fully transparent) canvas over `base`.
    pub fn new(base: Arc<dyn LabelSource>, chunk_shape: [u32; 3]) -> Self {
        let chunk_shape = if chunk_shape.contains(&0) {
            DEFAULT_CHUNK_SHAPE
        } else {
            chunk_shape
        };
        let extent = base.extent();
        Self {
            base,
            extent,
            chunk_shape,
            chunks: RwLock::new(HashMap::new()),
        }
    }

    /// Canvas materialized from a previously persisted painted volume. Only
    /// chunks holding at least one non-transparent voxel are kept.
    pub fn from_painted(
        base: Arc<dyn LabelSource>,
        chunk_shape: [u32; 3],
        painted: &DenseVolume,
    ) -> Self {
        let canvas = Self::new(base, chunk_shape);
        let mut block = Vec::new();
        for key in canvas.all_chunk_keys() {
            let (origin, dims) = canvas.chunk_bounds(key);
            painted.copy_block(origin, dims, &mut block);
            if block.iter().all(|&v| v == TRANSPARENT) {
                continue;
            }
            let mut buf = canvas.empty_chunk();
            let mut src = 0usize;
            for lz in 0..dims[2] {
                for ly in 0..dims[1] {
                    for lx in 0..dims[0] {
                        let idx = canvas.local_index([lx, ly, lz]);
                        buf[idx] = block[src];
                        src += 1;
                    }
                }
            }
            canvas.set_chunk(key, buf);
        }
        canvas
    }

    // ---- indexing helpers ----------------------------------------------------

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn chunk_shape(&self) -> [u32; 3] {
        self.chunk_shape
    }

    pub fn base(&self) -> &Arc<dyn LabelSource> {
        &self.base
    }

    #[inline(always)]
    fn chunk_key(&self, c: Coord) -> ChunkKey {
        [
            c[0] as u64 / self.chunk_shape[0] as u64,
            c[1] as u64 / self.chunk_shape[1] as u64,
            c[2] as u64 / self.chunk_shape[2] as u64,
        ]
    }

    #[inline(always)]
    fn local_index(&self, l: [u64; 3]) -> usize {
        let [sx, sy, _] = self.chunk_shape;
        ((l[2] * sy as u64 + l[1]) * sx as u64 + l[0]) as usize
    }

    #[inline(always)]
    fn local_of(&self, c: Coord) -> usize {
        self.local_index([
            c[0] as u64 % self.chunk_shape[0] as u64,
            c[1] as u64 % self.chunk_shape[1] as u64,
            c[2] as u64 % self.chunk_shape[2] as u64,
        ])
    }

    fn empty_chunk(&self) -> Box<[u64]> {
        let len = self.chunk_shape.iter().map(|&s| s as usize).product();
        vec![TRANSPARENT; len].into_boxed_slice()
    }

    /// Voxel origin and in-extent dimensions of a chunk.
    pub fn chunk_bounds(&self, key: ChunkKey) -> ([u64; 3], [u64; 3]) {
        self.extent.chunk_bounds(key, self.chunk_shape)
    }

    /// Every chunk key covering the extent, raster order (x fastest).
    pub fn all_chunk_keys(&self) -> Vec<ChunkKey> {
        self.extent.chunk_keys(self.chunk_shape)
    }

    fn get_chunk(&self, key: ChunkKey) -> Option<ChunkBuf> {
        self.chunks.read().get(&key).cloned()
    }

    /// Get or create a chunk; at most one buffer is ever created per key.
    fn ensure_chunk(&self, key: ChunkKey) -> ChunkBuf {
        if let Some(chunk) = self.get_chunk(key) {
            return chunk;
        }
        let mut map = self.chunks.write();
        map.entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(self.empty_chunk())))
            .clone()
    }

    /// Place a fully built chunk, replacing any existing one.
    fn set_chunk(&self, key: ChunkKey, buf: Box<[u64]>) {
        self.chunks.write().insert(key, Arc::new(Mutex::new(buf)));
    }

    /// Populated chunk keys, sorted.
    pub fn chunk_keys(&self) -> Vec<ChunkKey> {
        let mut keys: Vec<ChunkKey> = self.chunks.read().keys().copied().collect();
        keys.sort_unstable_by_key(|k| [k[2], k[1], k[0]]);
        keys
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    /// Approximate bytes held by materialized chunks.
    pub fn memory_bytes(&self) -> usize {
        let per_chunk: usize = self.chunk_shape.iter().map(|&s| s as usize).product::<usize>()
            * std::mem::size_of::<u64>();
        self.chunk_count() * per_chunk
    }

    // ---- voxel access -------------------------------------------------------

    /// Raw painted value (`TRANSPARENT` when unpainted).
    pub fn painted_value(&self, c: Coord) -> Result<u64> {
        self.extent.check(c)?;
        Ok(self.painted_unchecked(c))
    }

    #[inline]
    pub(crate) fn painted_unchecked(&self, c: Coord) -> u64 {
        match self.get_chunk(self.chunk_key(c)) {
            Some(chunk) => chunk.lock()[self.local_of(c)],
            None => TRANSPARENT,
        }
    }

    /// Composited value: painted label when set, otherwise the base label.
    pub fn read_voxel(&self, c: Coord) -> Result<u64> {
        self.extent.check(c)?;
        Ok(self.composite_unchecked(c))
    }

    #[inline]
    pub(crate) fn composite_unchecked(&self, c: Coord) -> u64 {
        let painted = self.painted_unchecked(c);
        if painted != TRANSPARENT {
            painted
        } else {
            self.base.read_voxel(c)
        }
    }

    /// Write one voxel. Returns the chunk key when the stored value changed.
    /// Writing `TRANSPARENT` into a chunk that was never materialized is a
    /// no-op since the voxel is already unset.
    pub(crate) fn put_unchecked(&self, c: Coord, label: u64) -> Option<ChunkKey> {
        let key = self.chunk_key(c);
        let chunk = if label == TRANSPARENT {
            self.get_chunk(key)?
        } else {
            self.ensure_chunk(key)
        };
        let idx = self.local_of(c);
        let mut buf = chunk.lock();
        if buf[idx] == label {
            return None;
        }
        buf[idx] = label;
        Some(key)
    }

    pub(crate) fn chunk_key_of(&self, c: Coord) -> ChunkKey {
        self.chunk_key(c)
    }

    // ---- painting -------------------------------------------------------------

    pub fn paint_voxel(&self, c: Coord, label: u64) -> Result<PaintChange> {
        self.extent.check(c)?;
        let mut change = PaintChange::default();
        if let Some(key) = self.put_unchecked(c, label) {
            change.affected = 1;
            change.chunks.insert(key);
        }
        Ok(change)
    }

    /// Eraser: make the voxel show the base label again.
    pub fn clear_voxel(&self, c: Coord) -> Result<PaintChange> {
        self.paint_voxel(c, TRANSPARENT)
    }

    /// Paint every in-extent voxel within `radius` of `center` under `shape`.
    /// `affected` counts voxels whose painted value actually changed, so a
    /// repeated stroke reports zero. The scanned box is clipped to the extent
    /// first, so the cost is bounded by the volume, not by the radius.
    pub fn paint_brush(
        &self,
        center: Coord,
        radius: f64,
        label: u64,
        shape: BrushShape,
    ) -> Result<PaintChange> {
        if !radius.is_finite() || radius < 0.0 {
            return Err(LabelError::InvalidRadius(radius));
        }
        self.extent.check(center)?;
        let reach = shape.reach(radius);
        let mut lo = [0i64; 3];
        let mut hi = [0i64; 3];
        for i in 0..3 {
            lo[i] = center[i].saturating_sub(reach[i]).max(0);
            hi[i] = center[i]
                .saturating_add(reach[i])
                .min(self.extent.dims[i] as i64 - 1);
        }

        let r2 = radius * radius;
        let mut change = PaintChange::default();
        for z in lo[2]..=hi[2] {
            for y in lo[1]..=hi[1] {
                for x in lo[0]..=hi[0] {
                    let d2: f64 = [x - center[0], y - center[1], z - center[2]]
                        .iter()
                        .map(|&d| (d as f64) * (d as f64))
                        .sum();
                    if d2 > r2 {
                        continue;
                    }
                    if let Some(key) = self.put_unchecked([x, y, z], label) {
                        change.affected += 1;
                        change.chunks.insert(key);
                    }
                }
            }
        }
        Ok(change)
    }

    // ---- bulk reads -----------------------------------------------------------

    /// Composited and painted voxels of one chunk, x fastest, clipped to the
    /// extent. Both come from a single lock of the chunk so they agree voxel
    /// for voxel.
    pub fn block_pair(&self, key: ChunkKey) -> (Vec<u64>, Vec<u64>) {
        let (origin, dims) = self.chunk_bounds(key);
        let len = (dims[0] * dims[1] * dims[2]) as usize;
        let mut composite = Vec::with_capacity(len);
        let mut painted = Vec::with_capacity(len);
        let chunk = self.get_chunk(key);
        let guard = chunk.as_ref().map(|c| c.lock());
        for lz in 0..dims[2] {
            for ly in 0..dims[1] {
                for lx in 0..dims[0] {
                    let p = guard
                        .as_ref()
                        .map(|buf| buf[self.local_index([lx, ly, lz])])
                        .unwrap_or(TRANSPARENT);
                    let c = if p == TRANSPARENT {
                        self.base.read_voxel([
                            (origin[0] + lx) as i64,
                            (origin[1] + ly) as i64,
                            (origin[2] + lz) as i64,
                        ])
                    } else {
                        p
                    };
                    composite.push(c);
                    painted.push(p);
                }
            }
        }
        (composite, painted)
    }

    /// Largest regular painted id, or `0`.
    pub fn max_painted_id(&self) -> u64 {
        let chunks: Vec<ChunkBuf> = self.chunks.read().values().cloned().collect();
        chunks
            .iter()
            .filter_map(|c| {
                c.lock()
                    .iter()
                    .copied()
                    .filter(|&v| crate::label::is_regular(v))
                    .max()
            })
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(dims: [u64; 3], value: u64) -> Arc<dyn LabelSource> {
        Arc::new(DenseVolume::filled(Extent::new(dims), [8, 8, 1], value))
    }

    #[test]
    fn brush_scenario() {
        let canvas = PaintedCanvas::new(base([128, 128, 1], 3), [16, 16, 1]);
        let change = canvas
            .paint_brush([5, 5, 0], 2.0, 7, BrushShape::Disc(Axis::Z))
            .unwrap();
        assert_eq!(change.affected, 13);
        assert_eq!(canvas.read_voxel([5, 5, 0]).unwrap(), 7);
        assert_eq!(canvas.read_voxel([7, 5, 0]).unwrap(), 7);
        assert_eq!(canvas.read_voxel([7, 7, 0]).unwrap(), 3);
        assert_eq!(canvas.read_voxel([100, 100, 0]).unwrap(), 3);
        assert_eq!(canvas.chunk_count(), 1);
    }

    #[test]
    fn painting_is_idempotent() {
        let canvas = PaintedCanvas::new(base([32, 32, 4], 1), [8, 8, 2]);
        canvas
            .paint_brush([10, 10, 1], 3.0, 9, BrushShape::Sphere)
            .unwrap();
        let before: Vec<Vec<u64>> = canvas
            .chunk_keys()
            .into_iter()
            .map(|k| canvas.block_pair(k).1)
            .collect();
        let again = canvas
            .paint_brush([10, 10, 1], 3.0, 9, BrushShape::Sphere)
            .unwrap();
        assert!(again.is_empty());
        let after: Vec<Vec<u64>> = canvas
            .chunk_keys()
            .into_iter()
            .map(|k| canvas.block_pair(k).1)
            .collect();
        assert_eq!(before, after);
        assert!(canvas.paint_voxel([0, 0, 0], 4).unwrap().affected == 1);
        assert!(canvas.paint_voxel([0, 0, 0], 4).unwrap().is_empty());
    }

    #[test]
    fn brush_clips_at_edges() {
        let canvas = PaintedCanvas::new(base([4, 4, 1], 0), [4, 4, 1]);
        let change = canvas
            .paint_brush([0, 0, 0], 1.0, 2, BrushShape::Disc(Axis::Z))
            .unwrap();
        assert_eq!(change.affected, 3);
        assert!(canvas.paint_brush([4, 0, 0], 1.0, 2, BrushShape::Sphere).is_err());
    }

    #[test]
    fn oversized_and_invalid_radii() {
        let canvas = PaintedCanvas::new(base([8, 8, 1], 0), [4, 4, 1]);
        for bad in [f64::INFINITY, f64::NAN, -1.0] {
            assert!(matches!(
                canvas.paint_brush([4, 4, 0], bad, 2, BrushShape::Sphere),
                Err(LabelError::InvalidRadius(_))
            ));
        }
        assert_eq!(canvas.chunk_count(), 0);

        // A radius far beyond the volume covers it once and returns promptly.
        let change = canvas
            .paint_brush([4, 4, 0], 1.0e12, 2, BrushShape::Sphere)
            .unwrap();
        assert_eq!(change.affected, 64);
        assert_eq!(change.chunks.len(), 4);
        let change = canvas
            .paint_brush([0, 0, 0], f64::MAX, 3, BrushShape::Disc(Axis::Z))
            .unwrap();
        assert_eq!(change.affected, 64);
    }

    #[test]
    fn clear_reveals_base() {
        let canvas = PaintedCanvas::new(base([8, 8, 1], 5), [4, 4, 1]);
        canvas.paint_voxel([1, 1, 0], 6).unwrap();
        assert_eq!(canvas.read_voxel([1, 1, 0]).unwrap(), 6);
        canvas.clear_voxel([1, 1, 0]).unwrap();
        assert_eq!(canvas.read_voxel([1, 1, 0]).unwrap(), 5);
        assert_eq!(canvas.painted_value([1, 1, 0]).unwrap(), TRANSPARENT);
        // Erasing an untouched chunk does not materialize it.
        assert!(canvas.clear_voxel([6, 6, 0]).unwrap().is_empty());
        assert_eq!(canvas.chunk_count(), 1);
    }

    #[test]
    fn out_of_bounds_is_reported() {
        let canvas = PaintedCanvas::new(base([8, 8, 1], 5), [4, 4, 1]);
        assert!(canvas.read_voxel([8, 0, 0]).is_err());
        assert!(canvas.paint_voxel([0, -1, 0], 1).is_err());
        assert_eq!(canvas.chunk_count(), 0);
    }

    #[test]
    fn concurrent_paints_share_one_chunk() {
        use rayon::prelude::*;
        let canvas = PaintedCanvas::new(base([64, 64, 1], 0), [64, 64, 1]);
        (0..64i64).into_par_iter().for_each(|x| {
            for y in 0..64 {
                canvas.paint_voxel([x, y, 0], (x * 64 + y + 1) as u64).unwrap();
            }
        });
        assert_eq!(canvas.chunk_count(), 1);
        for x in 0..64i64 {
            for y in 0..64 {
                assert_eq!(canvas.read_voxel([x, y, 0]).unwrap(), (x * 64 + y + 1) as u64);
            }
        }
    }

    #[test]
    fn blocks_and_reload() {
        let canvas = PaintedCanvas::new(base([10, 6, 1], 2), [4, 4, 1]);
        canvas.paint_voxel([9, 5, 0], 11).unwrap();
        let key = [2, 1, 0];
        let (origin, dims) = canvas.chunk_bounds(key);
        assert_eq!(origin, [8, 4, 0]);
        assert_eq!(dims, [2, 2, 1]);
        assert_eq!(
            canvas.block_pair(key),
            (vec![2, 2, 2, 11], vec![TRANSPARENT, TRANSPARENT, TRANSPARENT, 11])
        );
        assert_eq!(canvas.block_pair([0, 0, 0]), (vec![2; 16], vec![TRANSPARENT; 16]));

        let mut painted = DenseVolume::filled(Extent::new([10, 6, 1]), [4, 4, 1], TRANSPARENT);
        painted.set([9, 5, 0], 11).unwrap();
        let reloaded = PaintedCanvas::from_painted(base([10, 6, 1], 2), [4, 4, 1], &painted);
        assert_eq!(reloaded.chunk_keys(), vec![key]);
        assert_eq!(reloaded.read_voxel([9, 5, 0]).unwrap(), 11);
        assert_eq!(reloaded.max_painted_id(), 11);
    }
}
