use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::canvas::PaintedCanvas;
use crate::error::Result;
use crate::label::Coord;
use crate::ops::{Connectivity, FillOutcome, step};

/// Flood fill from `seed` with `new_label` over the composited view.
///
/// A neighbour joins the region when its composited fragment id equals the
/// seed's. Segment assignment is never consulted, so the fill stops at every
/// fragment boundary even inside one merged segment. A transparent or
/// background seed fills that region like any other.
///
/// Breadth-first with a visited set of raster indices owned by this call;
/// voxels are marked when queued and painted when dequeued. There is no area
/// limit. `cancel` is polled before every dequeue and leaves already painted
/// voxels in place.
pub fn flood_fill(
    canvas: &PaintedCanvas,
    seed: Coord,
    new_label: u64,
    connectivity: Connectivity,
    cancel: &AtomicBool,
) -> Result<FillOutcome> {
    let extent = canvas.extent();
    extent.check(seed)?;

    let target = canvas.composite_unchecked(seed);
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
        outcome.change.affected += 1;
        canvas.put_unchecked(c, new_label);
        outcome.change.chunks.insert(canvas.chunk_key_of(c));

        for &off in &offsets {
            let n = step(c, off);
            if !extent.contains(n) || !visited.insert(extent.linear_index(n)) {
                continue;
            }
            if canvas.composite_unchecked(n) == target {
                queue.push_back(n);
            }
        }
    }

    Ok(outcome)
}
