use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::assignment::{AssignmentChange, AssignmentGraph, LookupTable};
use crate::canvas::{PaintChange, PaintedCanvas};
use crate::error::{LabelError, Result};
use crate::id_service::IdService;
use crate::io::ProjectStore;
use crate::label::{BACKGROUND, Coord, Extent, TRANSPARENT, ensure_regular};
use crate::ops::flood_fill::flood_fill;
use crate::ops::restrict::restrict_to_fragments;
use crate::ops::{Connectivity, FillOutcome};
use crate::persistence::{DatasetNames, PersistSummary, PersistenceController};
use crate::settings::Settings;
use crate::volume::{DenseVolume, LabelSource};

// ============================================================================
// CHANGE NOTIFICATION
// ============================================================================

/// What a mutation touched, handed to subscribers so views can drop stale
/// tiles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Assignment(AssignmentChange),
    Paint(PaintChange),
}

type Listener = Arc<dyn Fn(&Change) + Send + Sync>;

/// What a paint gesture writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaintMode {
    /// Paint a regular id.
    Label(u64),
    /// Clear the canvas, revealing the base labels.
    Erase,
    /// Paint background (`0`).
    Background,
}

impl PaintMode {
    fn value(self) -> Result<u64> {
        match self {
            PaintMode::Label(id) => ensure_regular(id),
            PaintMode::Erase => Ok(TRANSPARENT),
            PaintMode::Background => Ok(BACKGROUND),
        }
    }
}

// ============================================================================
// SHARED SESSION STATE
// ============================================================================

/// State shared between the project and its background jobs.
struct Session {
    ids: Arc<IdService>,
    assignment: Arc<RwLock<AssignmentGraph>>,
    canvas: Arc<PaintedCanvas>,
    persistence: PersistenceController,
    /// Bumped by every successful mutation.
    edits: AtomicU64,
    /// Value of `edits` captured by the last successful persist.
    saved_edits: AtomicU64,
    halted: AtomicBool,
    last_persist: Mutex<Instant>,
    listeners: RwLock<Vec<Listener>>,
}

impl Session {
    fn new(
        store: ProjectStore,
        canvas: Arc<PaintedCanvas>,
        graph: AssignmentGraph,
        ids: Arc<IdService>,
        names: DatasetNames,
        batch_chunks: usize,
    ) -> Self {
        let assignment = Arc::new(RwLock::new(graph));
        let persistence = PersistenceController::new(
            store,
            canvas.clone(),
            assignment.clone(),
            ids.clone(),
            names,
            batch_chunks,
        );
        Self {
            ids,
            assignment,
            canvas,
            persistence,
            edits: AtomicU64::new(0),
            saved_edits: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            last_persist: Mutex::new(Instant::now()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.halted.load(Ordering::Acquire) {
            Err(LabelError::Halted)
        } else {
            Ok(())
        }
    }

    /// Id exhaustion leaves the session read-only.
    fn check_exhaustion<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(LabelError::IdSpaceExhausted) = &result {
            self.halted.store(true, Ordering::Release);
            error!("id space exhausted, project is now read-only");
        }
        result
    }

    fn notify(&self, change: Change) {
        self.edits.fetch_add(1, Ordering::AcqRel);
        // Called without the lock held so a listener may subscribe.
        let listeners: Vec<Listener> = self.listeners.read().clone();
        for listener in &listeners {
            listener(&change);
        }
    }

    fn notify_paint(&self, change: &PaintChange) {
        if !change.is_empty() {
            self.notify(Change::Paint(change.clone()));
        }
    }

    fn persist(&self) -> Result<PersistSummary> {
        let edits = self.edits.load(Ordering::Acquire);
        let summary = self.persistence.persist()?;
        self.saved_edits.fetch_max(edits, Ordering::AcqRel);
        *self.last_persist.lock() = Instant::now();
        Ok(summary)
    }

    fn fill(
        &self,
        seed: Coord,
        label: u64,
        connectivity: Connectivity,
        cancel: &AtomicBool,
    ) -> Result<FillOutcome> {
        self.ensure_writable()?;
        let started = Instant::now();
        let outcome = flood_fill(&self.canvas, seed, label, connectivity, cancel)?;
        info!(
            seed = ?seed,
            label,
            affected = outcome.affected(),
            cancelled = outcome.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "flood fill finished"
        );
        self.notify_paint(&outcome.change);
        Ok(outcome)
    }

    fn restrict(
        &self,
        seed: Coord,
        connectivity: Connectivity,
        cancel: &AtomicBool,
    ) -> Result<FillOutcome> {
        self.ensure_writable()?;
        let started = Instant::now();
        // Members are captured up front; the traversal runs without the graph lock.
        let fragment = self.canvas.read_voxel(seed)?;
        let members = self.assignment.read().fragments_of(fragment);
        let outcome = restrict_to_fragments(&self.canvas, &members, seed, connectivity, cancel)?;
        info!(
            seed = ?seed,
            carved = outcome.affected(),
            region = outcome.region,
            cancelled = outcome.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "restrict to segment finished"
        );
        self.notify_paint(&outcome.change);
        Ok(outcome)
    }
}

// ============================================================================
// BACKGROUND JOBS
// ============================================================================

/// Handle to work running on the rayon pool.
pub struct JobHandle<T> {
    cancel: Arc<AtomicBool>,
    rx: mpsc::Receiver<Result<T>>,
}

impl<T> JobHandle<T> {
    /// Ask the job to stop at its next frontier step. Work already done stays.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Non-blocking poll. Yields the result once; later polls after that
    /// report a disconnected worker.
    pub fn try_result(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => {
                Some(Err(LabelError::JobFailed("worker exited without a result".into())))
            }
        }
    }

    /// Block until the job finishes.
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(LabelError::JobFailed("worker exited without a result".into())))
    }
}

/// Completion callback, invoked on the worker thread.
pub type OnDone<T> = Box<dyn FnOnce(&Result<T>) + Send>;

fn spawn_job<T, F>(work: F, on_done: Option<OnDone<T>>) -> JobHandle<T>
where
    T: Send + 'static,
    F: FnOnce(&AtomicBool) -> Result<T> + Send + 'static,
{
    let cancel = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let flag = cancel.clone();
    rayon::spawn(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| work(&flag)))
            .unwrap_or_else(|panic| {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(panic = %msg, "background job panicked");
                Err(LabelError::JobFailed(msg))
            });
        if let Some(cb) = on_done {
            cb(&result);
        }
        let _ = tx.send(result);
    });
    JobHandle { cancel, rx }
}

// ============================================================================
// PROJECT
// ============================================================================

/// Summary of an open project, for status displays.
#[derive(Clone, Debug)]
pub struct ProjectInfo {
    pub extent: Extent,
    pub chunk_shape: [u32; 3],
    pub materialized_chunks: usize,
    pub canvas_bytes: usize,
    pub lut_entries: usize,
    pub merged_segments: usize,
    pub next_id: u64,
    pub snapshot: Option<String>,
}

/// One open proofreading project.
pub struct Project {
    pub id: Uuid,
    /// Display name (directory name).
    pub name: String,
    pub path: PathBuf,
    pub settings: Settings,
    session: Arc<Session>,
}

impl Project {
    /// Create a project directory around `labels` and open it.
    pub fn create(path: &Path, labels: &DenseVolume, settings: Settings) -> Result<Self> {
        ProjectStore::create(path, &settings.labels_dataset, labels)?;
        info!(path = %path.display(), dims = ?labels.extent().dims, "created project");
        Self::open(path, settings)
    }

    /// Open a project directory: base volume (merged dataset preferred),
    /// painted canvas, lookup table and allocator state.
    pub fn open(path: &Path, settings: Settings) -> Result<Self> {
        let started = Instant::now();
        let store = ProjectStore::open(path)?;
        let names = DatasetNames::new(&settings.labels_dataset, &settings.lut_dataset);

        let base = match store.read_volume(&names.merged)? {
            Some(merged) => merged,
            None => store.read_volume(&names.labels)?.ok_or_else(|| {
                LabelError::InvalidFormat(format!("missing labels dataset '{}'", names.labels))
            })?,
        };
        let painted = store.read_volume(&names.painted)?;
        if let Some(p) = &painted
            && p.extent() != base.extent()
        {
            return Err(LabelError::InvalidFormat(format!(
                "painted dataset {:?} does not match labels {:?}",
                p.extent().dims,
                base.extent().dims
            )));
        }

        let ids = Arc::new(IdService::new());
        match store.read_attributes()?.next_id {
            Some(next) if next > 0 => ids.invalidate(next - 1),
            _ => {
                let painted_max = painted.as_ref().map_or(0, |p| p.max_regular_id());
                ids.invalidate(base.max_regular_id().max(painted_max));
            }
        }

        let base: Arc<dyn LabelSource> = Arc::new(base);
        let canvas = Arc::new(match &painted {
            Some(p) => PaintedCanvas::from_painted(base, settings.chunk_shape, p),
            None => PaintedCanvas::new(base, settings.chunk_shape),
        });

        let mut graph = AssignmentGraph::new(ids.clone());
        if let Some(lut) = store.read_lut(&names.lut)? {
            graph.init_from_lookup_table(&lut.keys, &lut.values)?;
        }
        let session = Session::new(store, canvas, graph, ids, names, settings.flatten_batch_chunks);

        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        info!(
            project = %name,
            chunks = session.canvas.chunk_count(),
            lut_entries = session.assignment.read().len(),
            next_id = session.ids.peek(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "opened project"
        );

        Ok(Self {
            id: Uuid::new_v4(),
            name,
            path: path.to_path_buf(),
            settings,
            session: Arc::new(session),
        })
    }

    // ---- reads ----------------------------------------------------------------

    pub fn extent(&self) -> Extent {
        self.session.canvas.extent()
    }

    pub fn canvas(&self) -> &PaintedCanvas {
        &self.session.canvas
    }

    pub fn segment(&self, fragment: u64) -> u64 {
        self.session.assignment.read().segment(fragment)
    }

    pub fn fragments_of(&self, fragment: u64) -> Vec<u64> {
        let mut out: Vec<u64> = self
            .session
            .assignment
            .read()
            .fragments_of(fragment)
            .into_iter()
            .collect();
        out.sort_unstable();
        out
    }

    /// Composited fragment id at `c`.
    pub fn read_voxel(&self, c: Coord) -> Result<u64> {
        self.session.canvas.read_voxel(c)
    }

    /// Segment of the composited fragment at `c`.
    pub fn read_segment(&self, c: Coord) -> Result<u64> {
        let fragment = self.read_voxel(c)?;
        Ok(self.segment(fragment))
    }

    pub fn export_lookup_table(&self) -> LookupTable {
        self.session.assignment.read().export_lookup_table()
    }

    pub fn info(&self) -> Result<ProjectInfo> {
        let s = &self.session;
        let graph = s.assignment.read();
        Ok(ProjectInfo {
            extent: s.canvas.extent(),
            chunk_shape: s.canvas.chunk_shape(),
            materialized_chunks: s.canvas.chunk_count(),
            canvas_bytes: s.canvas.memory_bytes(),
            lut_entries: graph.len(),
            merged_segments: graph.merged_segment_count(),
            next_id: s.ids.peek(),
            snapshot: s.persistence.store().current_snapshot()?,
        })
    }

    // ---- assignment edits ------------------------------------------------------

    /// Merge the segments of `a` and `b`. Returns `None` when they already
    /// share a segment.
    pub fn merge(&self, a: u64, b: u64, merge_into: Option<u64>) -> Result<Option<AssignmentChange>> {
        self.session.ensure_writable()?;
        let change = self.session.assignment.write().merge(a, b, merge_into)?;
        if let Some(c) = &change {
            info!(a, b, segment = c.segment, moved = c.fragments.len(), "merged");
            self.session.notify(Change::Assignment(c.clone()));
        }
        Ok(change)
    }

    /// Peel `fragment` out of its segment into a fresh id.
    pub fn detach(&self, fragment: u64) -> Result<Option<AssignmentChange>> {
        self.session.ensure_writable()?;
        let result = self.session.assignment.write().detach(fragment);
        let change = self.session.check_exhaustion(result)?;
        if let Some(c) = &change {
            info!(fragment, segment = c.segment, "detached");
            self.session.notify(Change::Assignment(c.clone()));
        }
        Ok(change)
    }

    /// Fresh id for use as a new paint label.
    pub fn next_paint_id(&self) -> Result<u64> {
        self.session.ensure_writable()?;
        let id = self.session.check_exhaustion(self.session.ids.next())?;
        debug!(id, "allocated paint id");
        Ok(id)
    }

    // ---- painting -----------------------------------------------------------

    pub fn paint_voxel(&self, c: Coord, mode: PaintMode) -> Result<PaintChange> {
        self.session.ensure_writable()?;
        let change = self.session.canvas.paint_voxel(c, mode.value()?)?;
        self.session.notify_paint(&change);
        Ok(change)
    }

    pub fn clear_voxel(&self, c: Coord) -> Result<PaintChange> {
        self.paint_voxel(c, PaintMode::Erase)
    }

    pub fn paint_background(&self, c: Coord) -> Result<PaintChange> {
        self.paint_voxel(c, PaintMode::Background)
    }

    /// Brush stroke with the configured radius and shape.
    pub fn paint_brush(&self, center: Coord, mode: PaintMode) -> Result<PaintChange> {
        self.session.ensure_writable()?;
        let change = self.session.canvas.paint_brush(
            center,
            self.settings.brush_radius,
            mode.value()?,
            self.settings.brush_shape,
        )?;
        self.session.notify_paint(&change);
        Ok(change)
    }

    pub fn grow_brush(&mut self) {
        self.settings.grow_brush();
    }

    pub fn shrink_brush(&mut self) {
        self.settings.shrink_brush();
    }

    // ---- region operations ---------------------------------------------------

    /// Flood fill on the calling thread with the configured connectivity.
    pub fn fill(&self, seed: Coord, mode: PaintMode) -> Result<FillOutcome> {
        let never = AtomicBool::new(false);
        self.session
            .fill(seed, mode.value()?, self.settings.connectivity, &never)
    }

    pub fn spawn_fill(
        &self,
        seed: Coord,
        mode: PaintMode,
        on_done: Option<OnDone<FillOutcome>>,
    ) -> JobHandle<FillOutcome> {
        let session = self.session.clone();
        let connectivity = self.settings.connectivity;
        spawn_job(
            move |cancel| session.fill(seed, mode.value()?, connectivity, cancel),
            on_done,
        )
    }

    /// Carve paint that bled out of the segment under `seed`.
    pub fn restrict(&self, seed: Coord) -> Result<FillOutcome> {
        let never = AtomicBool::new(false);
        self.session
            .restrict(seed, self.settings.connectivity, &never)
    }

    pub fn spawn_restrict(
        &self,
        seed: Coord,
        on_done: Option<OnDone<FillOutcome>>,
    ) -> JobHandle<FillOutcome> {
        let session = self.session.clone();
        let connectivity = self.settings.connectivity;
        spawn_job(move |cancel| session.restrict(seed, connectivity, cancel), on_done)
    }

    // ---- persistence ------------------------------------------------------------

    pub fn persist(&self) -> Result<PersistSummary> {
        self.session.persist()
    }

    pub fn spawn_persist(&self, on_done: Option<OnDone<PersistSummary>>) -> JobHandle<PersistSummary> {
        let session = self.session.clone();
        spawn_job(move |_| session.persist(), on_done)
    }

    /// Persist if auto-persist is enabled, there are unsaved edits and the
    /// interval has elapsed since the last persist.
    pub fn autosave_tick(&self) -> Option<Result<PersistSummary>> {
        self.autosave_tick_at(Instant::now())
    }

    pub fn autosave_tick_at(&self, now: Instant) -> Option<Result<PersistSummary>> {
        let minutes = self.settings.auto_persist_minutes;
        if minutes == 0 || !self.is_dirty() {
            return None;
        }
        let interval = Duration::from_secs(u64::from(minutes) * 60);
        let last = *self.session.last_persist.lock();
        if now.saturating_duration_since(last) < interval {
            return None;
        }
        let result = self.persist();
        if let Err(e) = &result {
            warn!(error = %e, "auto-persist failed");
        }
        Some(result)
    }

    // ---- state ------------------------------------------------------------------

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.session.listeners.write().push(Arc::new(listener));
    }

    pub fn is_dirty(&self) -> bool {
        self.session.edits.load(Ordering::Acquire) > self.session.saved_edits.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.session.edits.fetch_add(1, Ordering::AcqRel);
    }

    /// True once the id space ran out; reads still work.
    pub fn is_halted(&self) -> bool {
        self.session.halted.load(Ordering::Acquire)
    }

    /// Name with dirty indicator.
    pub fn display_title(&self) -> String {
        if self.is_dirty() {
            format!("{}*", self.name)
        } else {
            self.name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::Axis;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// 8×8×2 volume: fragment 1 for x < 4, fragment 2 for x >= 4, one voxel
    /// of fragment 3 at (7,7,1).
    fn labels() -> DenseVolume {
        let extent = Extent::new([8, 8, 2]);
        let mut vol = DenseVolume::filled(extent, [4, 4, 1], 1);
        for z in 0..2 {
            for y in 0..8 {
                for x in 4..8 {
                    vol.set([x, y, z], 2).unwrap();
                }
            }
        }
        vol.set([7, 7, 1], 3).unwrap();
        vol
    }

    fn settings() -> Settings {
        Settings {
            chunk_shape: [4, 4, 1],
            brush_radius: 1.0,
            brush_axis: Axis::Z,
            brush_shape: crate::canvas::BrushShape::Disc(Axis::Z),
            connectivity: Connectivity::Plane(Axis::Z),
            flatten_batch_chunks: 3,
            ..Settings::default()
        }
    }

    fn project() -> (TempDir, Project) {
        let dir = TempDir::new().unwrap();
        let p = Project::create(&dir.path().join("proj"), &labels(), settings()).unwrap();
        (dir, p)
    }

    #[test]
    fn allocator_seeded_from_labels() {
        let (_d, p) = project();
        assert_eq!(p.next_paint_id().unwrap(), 4);
        assert_eq!(p.name, "proj");
        assert!(!p.is_dirty());
    }

    #[test]
    fn edits_mark_dirty_until_persisted() {
        let (_d, p) = project();
        p.merge(1, 2, None).unwrap();
        assert!(p.is_dirty());
        assert_eq!(p.display_title(), "proj*");
        p.persist().unwrap();
        assert!(!p.is_dirty());
        assert_eq!(p.display_title(), "proj");
        // No-op merge does not dirty.
        assert!(p.merge(1, 2, None).unwrap().is_none());
        assert!(!p.is_dirty());
    }

    #[test]
    fn paint_modes() {
        let (_d, p) = project();
        p.paint_voxel([0, 0, 0], PaintMode::Label(9)).unwrap();
        assert_eq!(p.read_voxel([0, 0, 0]).unwrap(), 9);
        p.paint_background([0, 0, 0]).unwrap();
        assert_eq!(p.read_voxel([0, 0, 0]).unwrap(), BACKGROUND);
        p.clear_voxel([0, 0, 0]).unwrap();
        assert_eq!(p.read_voxel([0, 0, 0]).unwrap(), 1);
        assert!(matches!(
            p.paint_voxel([0, 0, 0], PaintMode::Label(TRANSPARENT)),
            Err(LabelError::IrregularId(_))
        ));
        let change = p.paint_brush([3, 3, 0], PaintMode::Label(5)).unwrap();
        assert_eq!(change.affected, 5);
    }

    #[test]
    fn subscribers_see_changes() {
        let (_d, p) = project();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        p.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        p.merge(1, 2, None).unwrap();
        p.paint_voxel([1, 1, 0], PaintMode::Label(7)).unwrap();
        // Repainting the same value changes nothing.
        p.paint_voxel([1, 1, 0], PaintMode::Label(7)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn background_fill_and_restrict() {
        let (_d, p) = project();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let job = p.spawn_fill(
            [0, 0, 0],
            PaintMode::Label(9),
            Some(Box::new(move |r: &Result<FillOutcome>| {
                flag.store(r.is_ok(), Ordering::SeqCst);
            })),
        );
        let outcome = job.wait().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(outcome.affected(), 32);
        assert_eq!(p.read_voxel([3, 7, 0]).unwrap(), 9);
        assert_eq!(p.read_voxel([0, 0, 1]).unwrap(), 1);

        // Bleed a stroke into fragment 2, then restrict from inside 2: the
        // stroke and the filled column bordering segment 2 are carved.
        p.paint_voxel([4, 4, 0], PaintMode::Label(9)).unwrap();
        let carved = p.spawn_restrict([6, 4, 0], None).wait().unwrap();
        assert_eq!(carved.affected(), 9);
        assert_eq!(p.read_voxel([4, 4, 0]).unwrap(), 2);
        assert_eq!(p.read_voxel([3, 4, 0]).unwrap(), 1);
        assert_eq!(p.read_voxel([2, 4, 0]).unwrap(), 9);
    }

    #[test]
    fn cancelled_job_keeps_partial_paint() {
        let (_d, p) = project();
        let job = p.spawn_fill([0, 0, 0], PaintMode::Label(9), None);
        job.cancel();
        let outcome = job.wait().unwrap();
        if !outcome.cancelled {
            assert_eq!(outcome.affected(), 32);
        }
        let mut painted = 0;
        for y in 0..8 {
            for x in 0..4 {
                match p.read_voxel([x, y, 0]).unwrap() {
                    9 => painted += 1,
                    v => assert_eq!(v, 1),
                }
            }
        }
        assert_eq!(painted, outcome.affected());
    }

    #[test]
    fn id_exhaustion_halts_edits_but_not_reads() {
        let (_d, p) = project();
        p.session.ids.invalidate(TRANSPARENT - 2);
        assert_eq!(p.next_paint_id().unwrap(), TRANSPARENT - 1);
        assert!(!p.is_halted());
        assert!(matches!(p.next_paint_id(), Err(LabelError::IdSpaceExhausted)));
        assert!(p.is_halted());

        assert!(matches!(p.merge(1, 2, None), Err(LabelError::Halted)));
        assert!(matches!(
            p.paint_voxel([0, 0, 0], PaintMode::Label(5)),
            Err(LabelError::Halted)
        ));
        assert!(matches!(p.detach(1), Err(LabelError::Halted)));
        assert!(matches!(p.fill([0, 0, 0], PaintMode::Label(5)), Err(LabelError::Halted)));
        assert!(!p.is_dirty());

        assert_eq!(p.read_voxel([0, 0, 0]).unwrap(), 1);
        assert_eq!(p.read_segment([5, 0, 0]).unwrap(), 2);
        assert_eq!(p.segment(3), 3);
    }

    #[test]
    fn listener_may_subscribe_from_callback() {
        let (_d, p) = project();
        let p = Arc::new(p);
        let late = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&p);
        let counter = late.clone();
        p.subscribe(move |_| {
            if let Some(p) = weak.upgrade() {
                let counter = counter.clone();
                p.subscribe(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        p.merge(1, 2, None).unwrap();
        // The listener added during the first notification sees the second.
        assert_eq!(late.load(Ordering::SeqCst), 0);
        p.paint_voxel([0, 0, 0], PaintMode::Label(7)).unwrap();
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    /// Base that, a few reads into a traversal, merges fragments 1 and 2
    /// through the shared graph if the write lock is free.
    struct MergingBase {
        inner: DenseVolume,
        graph: std::sync::OnceLock<Arc<RwLock<AssignmentGraph>>>,
        reads: AtomicUsize,
        merged: AtomicBool,
    }

    impl LabelSource for MergingBase {
        fn read_voxel(&self, c: Coord) -> u64 {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 4
                && let Some(graph) = self.graph.get()
                && let Some(mut g) = graph.try_write()
            {
                g.merge(1, 2, None).unwrap();
                self.merged.store(true, Ordering::SeqCst);
            }
            self.inner.read_voxel(c)
        }

        fn extent(&self) -> Extent {
            self.inner.extent()
        }

        fn chunk_shape(&self) -> [u32; 3] {
            self.inner.chunk_shape()
        }
    }

    #[test]
    fn restrict_does_not_hold_the_graph_during_traversal() {
        let dir = TempDir::new().unwrap();
        let store = ProjectStore::create(&dir.path().join("proj"), "labels", &labels()).unwrap();
        let base = Arc::new(MergingBase {
            inner: labels(),
            graph: std::sync::OnceLock::new(),
            reads: AtomicUsize::new(0),
            merged: AtomicBool::new(false),
        });
        let canvas = Arc::new(PaintedCanvas::new(base.clone(), [4, 4, 1]));
        let ids = Arc::new(IdService::new());
        ids.invalidate(3);
        let session = Session::new(
            store,
            canvas,
            AssignmentGraph::new(ids.clone()),
            ids,
            DatasetNames::new("labels", "lut"),
            1,
        );
        assert!(base.graph.set(session.assignment.clone()).is_ok());
        session.canvas.paint_voxel([4, 4, 0], 9).unwrap();

        let never = AtomicBool::new(false);
        let outcome = session
            .restrict([6, 4, 0], Connectivity::Plane(Axis::Z), &never)
            .unwrap();
        assert!(base.merged.load(Ordering::SeqCst));
        assert_eq!(session.assignment.read().segment(1), 2);
        // The run keeps the members it started with: fragment 1 stays outside.
        assert_eq!(outcome.affected(), 1);
        assert_eq!(outcome.region, 32);
        assert_eq!(session.canvas.read_voxel([4, 4, 0]).unwrap(), 2);
    }

    #[test]
    fn reopen_restores_session() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("proj");
        {
            let p = Project::create(&path, &labels(), settings()).unwrap();
            p.merge(1, 3, None).unwrap();
            p.detach(1).unwrap();
            let fresh = p.segment(1);
            assert_eq!(fresh, 4);
            p.paint_voxel([5, 5, 1], PaintMode::Label(fresh)).unwrap();
            p.spawn_persist(None).wait().unwrap();
        }
        let p = Project::open(&path, settings()).unwrap();
        assert_eq!(p.segment(1), 4);
        assert_eq!(p.segment(3), 3);
        assert_eq!(p.read_voxel([5, 5, 1]).unwrap(), 4);
        assert_eq!(p.canvas().chunk_count(), 1);
        // next_id comes from the persisted attribute.
        assert_eq!(p.next_paint_id().unwrap(), 5);
        assert!(!p.is_dirty());
    }

    #[test]
    fn autosave_waits_for_interval() {
        let dir = TempDir::new().unwrap();
        let mut s = settings();
        s.auto_persist_minutes = 1;
        let p = Project::create(&dir.path().join("proj"), &labels(), s).unwrap();
        let t0 = Instant::now();
        assert!(p.autosave_tick_at(t0 + Duration::from_secs(120)).is_none());
        p.merge(1, 2, None).unwrap();
        assert!(p.autosave_tick_at(t0).is_none());
        let saved = p.autosave_tick_at(t0 + Duration::from_secs(120)).unwrap();
        assert!(saved.is_ok());
        assert!(!p.is_dirty());
    }

    #[test]
    fn out_of_bounds_is_reported() {
        let (_d, p) = project();
        assert!(matches!(
            p.paint_voxel([8, 0, 0], PaintMode::Label(5)),
            Err(LabelError::OutOfBounds { .. })
        ));
        assert!(p.fill([0, 0, 9], PaintMode::Label(5)).is_err());
        assert!(!p.is_dirty());
    }
}
