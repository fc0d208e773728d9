// ============================================================================
// REGION OPERATIONS — flood fill and restrict-to-segment over the canvas
// ============================================================================

pub mod flood_fill;
pub mod restrict;

use crate::canvas::PaintChange;
use crate::label::{Axis, Coord};

/// Neighbourhood used when growing a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectivity {
    /// 6 face neighbours in 3D.
    Faces,
    /// 4-neighbour cross in the plane normal to the axis.
    Plane(Axis),
    /// 8 neighbours (cross + diagonals) in the plane normal to the axis.
    PlaneDiagonal(Axis),
}

impl Connectivity {
    pub fn parse(s: &str, axis: Axis) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "faces" | "6" | "3d" => Some(Connectivity::Faces),
            "plane" | "4" | "2d" => Some(Connectivity::Plane(axis)),
            "plane_diagonal" | "8" => Some(Connectivity::PlaneDiagonal(axis)),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Connectivity::Faces => "faces",
            Connectivity::Plane(_) => "plane",
            Connectivity::PlaneDiagonal(_) => "plane_diagonal",
        }
    }

    pub fn offsets(&self) -> Vec<Coord> {
        match *self {
            Connectivity::Faces => vec![
                [-1, 0, 0],
                [1, 0, 0],
                [0, -1, 0],
                [0, 1, 0],
                [0, 0, -1],
                [0, 0, 1],
            ],
            Connectivity::Plane(axis) => {
                let (a, b) = axis.plane();
                let mut out = Vec::with_capacity(4);
                for (i, d) in [(a, -1), (a, 1), (b, -1), (b, 1)] {
                    let mut off = [0i64; 3];
                    off[i] = d;
                    out.push(off);
                }
                out
            }
            Connectivity::PlaneDiagonal(axis) => {
                let (a, b) = axis.plane();
                let mut out = Vec::with_capacity(8);
                for da in -1..=1i64 {
                    for db in -1..=1i64 {
                        if da == 0 && db == 0 {
                            continue;
                        }
                        let mut off = [0i64; 3];
                        off[a] = da;
                        off[b] = db;
                        out.push(off);
                    }
                }
                out
            }
        }
    }
}

#[inline]
pub(crate) fn step(c: Coord, off: Coord) -> Coord {
    [c[0] + off[0], c[1] + off[1], c[2] + off[2]]
}

/// Result of a fill or restrict run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FillOutcome {
    /// Voxels painted (fill) or carved back to transparent (restrict).
    pub change: PaintChange,
    /// Voxels that belonged to the grown region.
    pub region: u64,
    /// True when the run stopped early on request; painted voxels stay.
    pub cancelled: bool,
}

impl FillOutcome {
    pub fn affected(&self) -> u64 {
        self.change.affected
    }
}
