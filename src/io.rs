use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::assignment::LookupTable;
use crate::error::{LabelError, Result};
use crate::label::Extent;
use crate::volume::DenseVolume;

// ============================================================================
// DATASET FILE FORMATS
// ============================================================================

/// Magic header for chunk-streamed label volumes.
const VOLUME_MAGIC: &str = "LFV1";
/// Magic header for 2×N lookup-table blocks.
const LUT_MAGIC: &str = "LFL1";
/// Magic header for the project attribute file.
const ATTR_MAGIC: &str = "LFA1";

/// Per-axis limit; rejects crafted headers before allocating.
const MAX_VOLUME_DIM: u64 = 1 << 20;
/// Dense volumes are held in memory, so cap the voxel count too.
const MAX_VOXELS: u64 = 1 << 32;

const VOLUME_EXT: &str = "vol";
const LUT_EXT: &str = "lut";
const ATTR_FILE: &str = "attributes.bin";
const CURRENT_FILE: &str = "CURRENT";
const BASE_DIR: &str = "base";
const SNAPSHOT_DIR: &str = "snapshots";

/// Volume header. One bincode-encoded `Vec<u64>` per chunk follows, in
/// raster chunk order, each clipped to the extent.
#[derive(Serialize, Deserialize)]
struct VolumeHeader {
    magic: String,
    dims: [u64; 3],
    chunk_shape: [u32; 3],
}

#[derive(Serialize, Deserialize)]
struct LutFile {
    magic: String,
    /// Row 0 keys, row 1 values.
    block: [Vec<u64>; 2],
}

/// Project-wide scalar attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    /// Smallest id not yet handed out.
    pub next_id: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct AttributesFile {
    magic: String,
    attributes: Attributes,
}

fn validate_header(header: &VolumeHeader) -> Result<Extent> {
    if header.magic != VOLUME_MAGIC {
        return Err(LabelError::InvalidFormat(format!(
            "Unknown volume magic '{}'",
            header.magic
        )));
    }
    if header.dims.contains(&0) || header.chunk_shape.contains(&0) {
        return Err(LabelError::InvalidFormat(
            "Volume dimensions and chunk shape cannot be zero".into(),
        ));
    }
    if header.dims.iter().any(|&d| d > MAX_VOLUME_DIM) {
        return Err(LabelError::InvalidFormat(format!(
            "Volume {:?} exceeds maximum edge length {}",
            header.dims, MAX_VOLUME_DIM
        )));
    }
    let extent = Extent::new(header.dims);
    if extent.voxel_count() > MAX_VOXELS {
        return Err(LabelError::InvalidFormat(format!(
            "Volume {:?} holds more than {} voxels",
            header.dims, MAX_VOXELS
        )));
    }
    Ok(extent)
}

fn volume_header(extent: Extent, chunk_shape: [u32; 3]) -> VolumeHeader {
    VolumeHeader {
        magic: VOLUME_MAGIC.to_string(),
        dims: extent.dims,
        chunk_shape,
    }
}

fn check_chunks_written(written: usize, extent: Extent, chunk_shape: [u32; 3]) -> Result<()> {
    let expected = extent.chunk_keys(chunk_shape).len();
    if written != expected {
        return Err(LabelError::Persistence(format!(
            "wrote {} chunks, volume needs {}",
            written, expected
        )));
    }
    Ok(())
}

/// Stream a volume chunk by chunk. `blocks` must yield one clipped block per
/// chunk of `extent.chunk_keys(chunk_shape)`, in that order.
pub fn write_volume<W: Write>(
    writer: &mut W,
    extent: Extent,
    chunk_shape: [u32; 3],
    blocks: impl Iterator<Item = Vec<u64>>,
) -> Result<()> {
    bincode::serialize_into(&mut *writer, &volume_header(extent, chunk_shape))?;
    let mut written = 0usize;
    for block in blocks {
        bincode::serialize_into(&mut *writer, &block)?;
        written += 1;
    }
    check_chunks_written(written, extent, chunk_shape)
}

/// Stream two volumes of the same geometry side by side from one sequence of
/// block pairs.
pub fn write_volume_pair<A: Write, B: Write>(
    first: &mut A,
    second: &mut B,
    extent: Extent,
    chunk_shape: [u32; 3],
    blocks: impl Iterator<Item = (Vec<u64>, Vec<u64>)>,
) -> Result<()> {
    let header = volume_header(extent, chunk_shape);
    bincode::serialize_into(&mut *first, &header)?;
    bincode::serialize_into(&mut *second, &header)?;
    let mut written = 0usize;
    for (a, b) in blocks {
        bincode::serialize_into(&mut *first, &a)?;
        bincode::serialize_into(&mut *second, &b)?;
        written += 1;
    }
    check_chunks_written(written, extent, chunk_shape)
}

/// Read a chunk-streamed volume into memory.
pub fn read_volume<R: Read>(reader: &mut R) -> Result<DenseVolume> {
    let header: VolumeHeader = bincode::deserialize_from(&mut *reader)?;
    let extent = validate_header(&header)?;
    let mut volume = DenseVolume::filled(extent, header.chunk_shape, 0);
    for key in extent.chunk_keys(header.chunk_shape) {
        let (origin, dims) = extent.chunk_bounds(key, header.chunk_shape);
        let block: Vec<u64> = bincode::deserialize_from(&mut *reader)?;
        let expected = (dims[0] * dims[1] * dims[2]) as usize;
        if block.len() != expected {
            return Err(LabelError::InvalidFormat(format!(
                "Chunk {:?} has {} voxels, expected {}",
                key,
                block.len(),
                expected
            )));
        }
        volume.write_block(origin, dims, &block);
    }
    Ok(volume)
}

/// Write a whole in-memory volume.
pub fn write_dense_volume<W: Write>(writer: &mut W, volume: &DenseVolume) -> Result<()> {
    use crate::volume::LabelSource;
    let extent = volume.extent();
    let chunk_shape = volume.chunk_shape();
    let blocks = extent.chunk_keys(chunk_shape).into_iter().map(|key| {
        let (origin, dims) = extent.chunk_bounds(key, chunk_shape);
        let mut block = Vec::new();
        volume.copy_block(origin, dims, &mut block);
        block
    });
    write_volume(writer, extent, chunk_shape, blocks)
}

fn read_lut<R: Read>(reader: &mut R) -> Result<LookupTable> {
    let file: LutFile = bincode::deserialize_from(reader)?;
    if file.magic != LUT_MAGIC {
        return Err(LabelError::InvalidFormat(format!(
            "Unknown lookup table magic '{}'",
            file.magic
        )));
    }
    if file.block[0].len() != file.block[1].len() {
        return Err(LabelError::MalformedTable(format!(
            "{} keys but {} values",
            file.block[0].len(),
            file.block[1].len()
        )));
    }
    Ok(LookupTable::from_block(file.block))
}

fn write_lut<W: Write>(writer: &mut W, lut: &LookupTable) -> Result<()> {
    let file = LutFile {
        magic: LUT_MAGIC.to_string(),
        block: lut.to_block(),
    };
    bincode::serialize_into(writer, &file)?;
    Ok(())
}

/// Dataset names become file names; reject anything that could escape the
/// project directory.
fn check_dataset_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if ok {
        Ok(())
    } else {
        Err(LabelError::InvalidFormat(format!(
            "Invalid dataset name '{}'",
            name
        )))
    }
}

/// Create + buffer + fsync a file, handing the buffered writer to `body`.
fn write_file_synced(path: &Path, body: impl FnOnce(&mut BufWriter<File>) -> Result<()>) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    body(&mut writer)?;
    sync_buffered(path, writer)
}

fn sync_buffered(path: &Path, writer: BufWriter<File>) -> Result<()> {
    let file = writer
        .into_inner()
        .map_err(|e| LabelError::Persistence(format!("flush {}: {}", path.display(), e)))?;
    file.sync_all()?;
    Ok(())
}

// ============================================================================
// PROJECT STORE – directory-backed datasets with snapshot swapping
// ============================================================================

/// On-disk layout:
///
/// ```text
/// <root>/base/<name>.vol            imported base labels, never rewritten
/// <root>/snapshots/<uuid>/...       one directory per successful persist
/// <root>/CURRENT                    uuid of the live snapshot
/// ```
///
/// A persist fills a fresh snapshot directory, then swaps `CURRENT` with a
/// rename. Until that rename the previous snapshot stays authoritative, so an
/// interrupted persist never damages it.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    root: PathBuf,
}

impl ProjectStore {
    /// Create a new project directory holding `labels` as its base dataset.
    pub fn create(root: &Path, labels_dataset: &str, labels: &DenseVolume) -> Result<Self> {
        check_dataset_name(labels_dataset)?;
        let store = Self {
            root: root.to_path_buf(),
        };
        fs::create_dir_all(store.base_dir())?;
        fs::create_dir_all(store.snapshots_dir())?;
        let path = store
            .base_dir()
            .join(format!("{}.{}", labels_dataset, VOLUME_EXT));
        write_file_synced(&path, |w| write_dense_volume(w, labels))?;
        debug!(root = %root.display(), dataset = labels_dataset, "created project store");
        Ok(store)
    }

    /// Open an existing project directory and drop snapshot directories left
    /// behind by interrupted persists.
    pub fn open(root: &Path) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
        };
        if !store.base_dir().is_dir() {
            return Err(LabelError::InvalidFormat(format!(
                "{} is not a project directory (missing '{}/')",
                root.display(),
                BASE_DIR
            )));
        }
        store.prune_stale_snapshots();
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn base_dir(&self) -> PathBuf {
        self.root.join(BASE_DIR)
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.root.join(SNAPSHOT_DIR)
    }

    /// Name of the live snapshot, if any persist has completed.
    pub fn current_snapshot(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.root.join(CURRENT_FILE)) {
            Ok(s) => {
                let id = s.trim().to_string();
                if id.is_empty() { Ok(None) } else { Ok(Some(id)) }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn prune_stale_snapshots(&self) {
        let current = self.current_snapshot().ok().flatten();
        let Ok(entries) = fs::read_dir(self.snapshots_dir()) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if Some(&name) == current.as_ref() {
                continue;
            }
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!(snapshot = %name, error = %e, "could not remove stale snapshot");
            } else {
                debug!(snapshot = %name, "removed stale snapshot");
            }
        }
    }

    /// Resolve a dataset file: live snapshot first, then `base/`.
    fn resolve(&self, file_name: &str) -> Result<Option<PathBuf>> {
        if let Some(id) = self.current_snapshot()? {
            let p = self.snapshots_dir().join(id).join(file_name);
            if p.is_file() {
                return Ok(Some(p));
            }
        }
        let p = self.base_dir().join(file_name);
        Ok(p.is_file().then_some(p))
    }

    pub fn has_volume(&self, dataset: &str) -> Result<bool> {
        check_dataset_name(dataset)?;
        Ok(self
            .resolve(&format!("{}.{}", dataset, VOLUME_EXT))?
            .is_some())
    }

    pub fn read_volume(&self, dataset: &str) -> Result<Option<DenseVolume>> {
        check_dataset_name(dataset)?;
        let Some(path) = self.resolve(&format!("{}.{}", dataset, VOLUME_EXT))? else {
            return Ok(None);
        };
        let mut reader = BufReader::new(File::open(&path)?);
        read_volume(&mut reader).map(Some)
    }

    /// Absence means identity assignment.
    pub fn read_lut(&self, dataset: &str) -> Result<Option<LookupTable>> {
        check_dataset_name(dataset)?;
        let Some(path) = self.resolve(&format!("{}.{}", dataset, LUT_EXT))? else {
            return Ok(None);
        };
        let mut reader = BufReader::new(File::open(&path)?);
        read_lut(&mut reader).map(Some)
    }

    pub fn read_attributes(&self) -> Result<Attributes> {
        let Some(path) = self.resolve(ATTR_FILE)? else {
            return Ok(Attributes::default());
        };
        let file: AttributesFile = bincode::deserialize_from(BufReader::new(File::open(&path)?))?;
        if file.magic != ATTR_MAGIC {
            return Err(LabelError::InvalidFormat(format!(
                "Unknown attribute magic '{}'",
                file.magic
            )));
        }
        Ok(file.attributes)
    }

    /// Start writing a new snapshot. Nothing becomes visible to readers until
    /// [`SnapshotWriter::commit`].
    pub fn begin_snapshot(&self) -> Result<SnapshotWriter> {
        let id = Uuid::new_v4().to_string();
        let dir = self.snapshots_dir().join(&id);
        fs::create_dir_all(&dir)?;
        Ok(SnapshotWriter {
            root: self.root.clone(),
            dir,
            id,
            committed: false,
        })
    }
}

/// A snapshot being written. Dropped without commit, its directory is removed.
pub struct SnapshotWriter {
    root: PathBuf,
    dir: PathBuf,
    id: String,
    committed: bool,
}

impl SnapshotWriter {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Write two volumes from one stream of `(first, second)` block pairs.
    pub fn write_volume_pair(
        &mut self,
        first: &str,
        second: &str,
        extent: Extent,
        chunk_shape: [u32; 3],
        blocks: impl Iterator<Item = (Vec<u64>, Vec<u64>)>,
    ) -> Result<()> {
        check_dataset_name(first)?;
        check_dataset_name(second)?;
        let first_path = self.dir.join(format!("{}.{}", first, VOLUME_EXT));
        let second_path = self.dir.join(format!("{}.{}", second, VOLUME_EXT));
        let mut a = BufWriter::new(File::create(&first_path)?);
        let mut b = BufWriter::new(File::create(&second_path)?);
        write_volume_pair(&mut a, &mut b, extent, chunk_shape, blocks)?;
        sync_buffered(&first_path, a)?;
        sync_buffered(&second_path, b)
    }

    pub fn write_lut(&mut self, dataset: &str, lut: &LookupTable) -> Result<()> {
        check_dataset_name(dataset)?;
        let path = self.dir.join(format!("{}.{}", dataset, LUT_EXT));
        write_file_synced(&path, |w| write_lut(w, lut))
    }

    pub fn write_attributes(&mut self, attributes: &Attributes) -> Result<()> {
        let path = self.dir.join(ATTR_FILE);
        let file = AttributesFile {
            magic: ATTR_MAGIC.to_string(),
            attributes: attributes.clone(),
        };
        write_file_synced(&path, |w| {
            bincode::serialize_into(w, &file)?;
            Ok(())
        })
    }

    /// Atomically make this snapshot the live one, then delete the previous.
    pub fn commit(mut self) -> Result<()> {
        let current = self.root.join(CURRENT_FILE);
        let previous = fs::read_to_string(&current)
            .ok()
            .map(|s| s.trim().to_string());
        let tmp = self.root.join(format!("{}.{}.tmp", CURRENT_FILE, self.id));
        write_file_synced(&tmp, |w| {
            w.write_all(self.id.as_bytes())?;
            Ok(())
        })?;
        if let Err(e) = fs::rename(&tmp, &current) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        self.committed = true;

        if let Some(prev) = previous.filter(|p| !p.is_empty() && *p != self.id) {
            let prev_dir = self.root.join(SNAPSHOT_DIR).join(&prev);
            if let Err(e) = fs::remove_dir_all(&prev_dir) {
                warn!(snapshot = %prev, error = %e, "could not remove superseded snapshot");
            }
        }
        Ok(())
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

/// Read a raw little-endian `u64` volume (x fastest) as produced by most
/// segmentation pipelines.
pub fn read_raw_u64(path: &Path, extent: Extent, chunk_shape: [u32; 3]) -> Result<DenseVolume> {
    let bytes = fs::read(path)?;
    if bytes.len() % 8 != 0 {
        return Err(LabelError::InvalidFormat(format!(
            "{} is {} bytes, not a whole number of u64 voxels",
            path.display(),
            bytes.len()
        )));
    }
    let data: Vec<u64> = bytes
        .chunks_exact(8)
        .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .collect();
    DenseVolume::from_data(extent, chunk_shape, data)
}
