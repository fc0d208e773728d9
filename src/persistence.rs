//! Flattening the session back into the project store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::{error, info};

use crate::assignment::{AssignmentGraph, LookupTable};
use crate::canvas::{ChunkKey, PaintedCanvas};
use crate::error::{LabelError, Result};
use crate::id_service::IdService;
use crate::io::{Attributes, ProjectStore};

/// Dataset names derived from the labels dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetNames {
    pub labels: String,
    pub merged: String,
    pub painted: String,
    pub lut: String,
}

impl DatasetNames {
    pub fn new(labels: &str, lut: &str) -> Self {
        Self {
            labels: labels.to_string(),
            merged: format!("merged_{}", labels),
            painted: format!("painted_{}", labels),
            lut: lut.to_string(),
        }
    }
}

// ============================================================================
// FLATTENED VIEW
// ============================================================================

/// The session as it will be written: lookup table and allocator state are
/// captured eagerly, voxel data is produced lazily chunk batch by chunk batch.
pub struct Flattened<'a> {
    canvas: &'a PaintedCanvas,
    batch_chunks: usize,
    pub lut: LookupTable,
    pub next_id: u64,
}

impl<'a> Flattened<'a> {
    /// `(composited, painted)` block pairs in raster chunk order. Both halves
    /// of a pair come from one read of the chunk.
    pub fn blocks(&self) -> BlockStream<'a> {
        BlockStream::new(self.canvas, self.batch_chunks)
    }
}

/// Yields block pairs, computing `batch` chunks at a time on the rayon pool.
/// Peak memory is bounded by one batch.
pub struct BlockStream<'a> {
    canvas: &'a PaintedCanvas,
    keys: Vec<ChunkKey>,
    cursor: usize,
    batch: usize,
    ready: std::vec::IntoIter<(Vec<u64>, Vec<u64>)>,
}

impl<'a> BlockStream<'a> {
    fn new(canvas: &'a PaintedCanvas, batch: usize) -> Self {
        Self {
            canvas,
            keys: canvas.all_chunk_keys(),
            cursor: 0,
            batch: batch.max(1),
            ready: Vec::new().into_iter(),
        }
    }
}

impl Iterator for BlockStream<'_> {
    type Item = (Vec<u64>, Vec<u64>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.ready.next() {
                return Some(pair);
            }
            if self.cursor >= self.keys.len() {
                return None;
            }
            let end = (self.cursor + self.batch).min(self.keys.len());
            let canvas = self.canvas;
            let pairs: Vec<(Vec<u64>, Vec<u64>)> = self.keys[self.cursor..end]
                .par_iter()
                .map(|&key| canvas.block_pair(key))
                .collect();
            self.cursor = end;
            self.ready = pairs.into_iter();
        }
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Result of one successful persist.
#[derive(Clone, Debug)]
pub struct PersistSummary {
    pub snapshot: String,
    pub lut_entries: usize,
    pub next_id: u64,
    pub elapsed: Duration,
}

/// Clears the in-flight slot however `persist` exits.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PersistenceController {
    store: ProjectStore,
    canvas: Arc<PaintedCanvas>,
    assignment: Arc<RwLock<AssignmentGraph>>,
    ids: Arc<IdService>,
    names: DatasetNames,
    batch_chunks: usize,
    in_flight: AtomicBool,
}

impl PersistenceController {
    pub fn new(
        store: ProjectStore,
        canvas: Arc<PaintedCanvas>,
        assignment: Arc<RwLock<AssignmentGraph>>,
        ids: Arc<IdService>,
        names: DatasetNames,
        batch_chunks: usize,
    ) -> Self {
        Self {
            store,
            canvas,
            assignment,
            ids,
            names,
            batch_chunks: batch_chunks.max(1),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    pub fn names(&self) -> &DatasetNames {
        &self.names
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Capture the lookup table and allocator state under the assignment
    /// read lock, so no merge or detach can interleave with the export.
    pub fn flatten(&self) -> Flattened<'_> {
        let graph = self.assignment.read();
        Flattened {
            canvas: self.canvas.as_ref(),
            batch_chunks: self.batch_chunks,
            lut: graph.export_lookup_table(),
            next_id: self.ids.peek(),
        }
    }

    /// Write merged volume, painted volume, lookup table and `next_id` into a
    /// fresh snapshot and swap it in. Only one persist runs at a time; a
    /// concurrent call gets [`LabelError::Busy`]. On failure the previous
    /// snapshot and all in-memory state are untouched.
    pub fn persist(&self) -> Result<PersistSummary> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LabelError::Busy);
        }
        let _slot = InFlight(&self.in_flight);

        let started = Instant::now();
        info!(root = %self.store.root().display(), "persisting project");
        match self.write_snapshot(started) {
            Ok(summary) => {
                info!(
                    snapshot = %summary.snapshot,
                    lut_entries = summary.lut_entries,
                    next_id = summary.next_id,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "persist complete"
                );
                Ok(summary)
            }
            Err(e) => {
                error!(error = %e, "persist failed");
                Err(e)
            }
        }
    }

    fn write_snapshot(&self, started: Instant) -> Result<PersistSummary> {
        let flat = self.flatten();
        let extent = self.canvas.extent();
        let chunk_shape = self.canvas.chunk_shape();

        let mut snap = self.store.begin_snapshot()?;
        // Both datasets in one pass so they agree voxel for voxel.
        snap.write_volume_pair(
            &self.names.merged,
            &self.names.painted,
            extent,
            chunk_shape,
            flat.blocks(),
        )?;
        snap.write_lut(&self.names.lut, &flat.lut)?;
        snap.write_attributes(&Attributes {
            next_id: Some(flat.next_id),
        })?;
        let snapshot = snap.id().to_string();
        snap.commit()?;

        Ok(PersistSummary {
            snapshot,
            lut_entries: flat.lut.len(),
            next_id: flat.next_id,
            elapsed: started.elapsed(),
        })
    }
}
