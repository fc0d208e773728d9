use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::assignment::AssignmentGraph;
use crate::canvas::PaintedCanvas;
use crate::error::Result;
use crate::label::{Coord, TRANSPARENT};
use crate::ops::{Connectivity, FillOutcome, step};

/// Carve paint bleed away from the segment under `seed`.
///
/// Grows the region of voxels whose composited id resolves to the seed's
/// segment. Every neighbour outside that segment which carries paint is reset
/// to `TRANSPARENT`; if the base label revealed underneath belongs to the
/// segment, the voxel joins the region and growth continues through it.
/// Interior voxels are never written. `outcome.change.affected` counts carved
/// voxels.
pub fn restrict_to_segment(
    canvas: &PaintedCanvas,
    assignment: &AssignmentGraph,
    seed: Coord,
    connectivity: Connectivity,
    cancel: &AtomicBool,
) -> Result<FillOutcome> {
    let members = assignment.fragments_of(canvas.read_voxel(seed)?);
    restrict_to_fragments(canvas, &members, seed, connectivity, cancel)
}

/// [`restrict_to_segment`] against a fixed fragment set. The set is usually
/// the seed segment's members, captured once so the traversal needs no
/// access to the assignment graph.
pub fn restrict_to_fragments(
    canvas: &PaintedCanvas,
    members: &HashSet<u64>,
    seed: Coord,
    connectivity: Connectivity,
    cancel: &AtomicBool,
) -> Result<FillOutcome> {
    let extent = canvas.extent();
    extent.check(seed)?;
    let offsets = connectivity.offsets();

    let mut outcome = FillOutcome::default();
    let mut visited: HashSet<u64> = HashSet::new();
    let mut queue: VecDeque<Coord> = VecDeque::with_capacity(4096);
    visited.insert(extent.linear_index(seed));
    queue.push_back(seed);

    while let Some(c) = queue.pop_front() {
        if cancel.load(Ordering::Relaxed) {
            outcome.cancelled = true;
            break;
        }
        outcome.region += 1;

        for &off in &offsets {
            let n = step(c, off);
            if !extent.contains(n) || !visited.insert(extent.linear_index(n)) {
                continue;
            }
            if members.contains(&canvas.composite_unchecked(n)) {
                queue.push_back(n);
                continue;
            }
            if canvas.painted_unchecked(n) == TRANSPARENT {
                continue;
            }
            if let Some(key) = canvas.put_unchecked(n, TRANSPARENT) {
                outcome.change.affected += 1;
                outcome.change.chunks.insert(key);
            }
            if members.contains(&canvas.base().read_voxel(n)) {
                queue.push_back(n);
            }
        }
    }

    Ok(outcome)
}
