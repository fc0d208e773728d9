//! Fragment/segment proofreading engine: an assignment graph mapping
//! fragment ids to segment ids, a chunked paint canvas over a read-only label
//! volume, region operations on the composited view, and snapshot
//! persistence of both.

pub mod assignment;
pub mod canvas;
pub mod cli;
pub mod error;
pub mod id_service;
pub mod io;
pub mod label;
pub mod logger;
pub mod ops;
pub mod persistence;
pub mod project;
pub mod settings;
pub mod volume;

pub mod prelude {
    pub use crate::assignment::{AssignmentChange, AssignmentGraph, LookupTable};
    pub use crate::canvas::{BrushShape, PaintChange, PaintedCanvas};
    pub use crate::error::{LabelError, Result};
    pub use crate::id_service::IdService;
    pub use crate::label::{BACKGROUND, Coord, Extent, TRANSPARENT, is_regular};
    pub use crate::ops::{Connectivity, FillOutcome};
    pub use crate::project::{Change, JobHandle, PaintMode, Project};
    pub use crate::settings::Settings;
    pub use crate::volume::{DenseVolume, LabelSource};
}
