// ============================================================================
// LabelFE CLI — headless proofreading edits on a project directory
// ============================================================================
//
// Usage examples:
//   labelfe import proj/ labels.raw --dims 512,512,64
//   labelfe merge proj/ 10 11
//   labelfe read proj/ 12,40,3
//   labelfe paint proj/ 5,5,0 7 --brush
//   labelfe fill proj/ 12,40,3 --label 7
//   labelfe restrict proj/ 12,40,3 --dry-run
//   labelfe export-lut proj/ --output lut.txt
//
// Mutating commands persist a new snapshot on success unless --dry-run is
// given. Everything runs on the calling thread.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};

use crate::error::{LabelError, Result};
use crate::io::read_raw_u64;
use crate::label::{Coord, Extent, parse_triple};
use crate::ops::Connectivity;
use crate::project::{PaintMode, Project};
use crate::settings::Settings;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// LabelFE headless segmentation proofreader.
#[derive(Parser, Debug)]
#[command(
    name = "labelfe",
    about = "LabelFE headless fragment/segment proofreading",
    long_about = "Merge and detach fragments, paint label corrections and persist them\n\
                  to a LabelFE project directory without opening a viewer.\n\n\
                  Example:\n  \
                  labelfe import proj/ labels.raw --dims 512,512,64\n  \
                  labelfe merge proj/ 10 11"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Settings file (defaults to the platform config location).
    #[arg(long, global = true, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Apply the edit in memory only; nothing is persisted.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Log debug events to the session log.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a project from a raw little-endian u64 label volume (x fastest).
    Import {
        project: PathBuf,
        raw: PathBuf,
        /// Volume dimensions as X,Y,Z.
        #[arg(long, value_parser = parse_dims)]
        dims: [u64; 3],
    },
    /// Print a project summary.
    Info { project: PathBuf },
    /// Print the segment of each fragment.
    Segment {
        project: PathBuf,
        #[arg(required = true)]
        fragments: Vec<u64>,
    },
    /// Print the fragment and segment under a voxel.
    Read {
        project: PathBuf,
        #[arg(value_parser = parse_coord)]
        at: Coord,
    },
    /// Merge the segments of two fragments.
    Merge {
        project: PathBuf,
        a: u64,
        b: u64,
        /// Representative to keep (must be one of the two segments).
        #[arg(long)]
        into: Option<u64>,
    },
    /// Move fragments out of their segments into fresh ids.
    Detach {
        project: PathBuf,
        #[arg(required = true)]
        fragments: Vec<u64>,
    },
    /// Paint a voxel (or a brush stroke) with a label.
    Paint {
        project: PathBuf,
        #[arg(value_parser = parse_coord)]
        at: Coord,
        /// Label to paint; omit with --background.
        #[arg(required_unless_present = "background")]
        label: Option<u64>,
        /// Paint background (0) instead of a label.
        #[arg(long, conflicts_with = "label")]
        background: bool,
        /// Use the brush instead of a single voxel.
        #[arg(long)]
        brush: bool,
        /// Brush radius override.
        #[arg(long)]
        radius: Option<f64>,
    },
    /// Clear painted voxels so the base labels show again.
    Erase {
        project: PathBuf,
        #[arg(value_parser = parse_coord)]
        at: Coord,
        #[arg(long)]
        brush: bool,
        #[arg(long)]
        radius: Option<f64>,
    },
    /// Flood fill the fragment under a seed voxel.
    Fill {
        project: PathBuf,
        #[arg(value_parser = parse_coord)]
        at: Coord,
        /// Label to fill with; omit with --background.
        #[arg(long, required_unless_present = "background")]
        label: Option<u64>,
        #[arg(long, conflicts_with = "label")]
        background: bool,
        /// faces | plane | plane_diagonal
        #[arg(long)]
        connectivity: Option<String>,
    },
    /// Carve paint that bled out of the segment under a seed voxel.
    Restrict {
        project: PathBuf,
        #[arg(value_parser = parse_coord)]
        at: Coord,
        #[arg(long)]
        connectivity: Option<String>,
    },
    /// Allocate a fresh id for painting.
    NextId { project: PathBuf },
    /// Print (or write) the fragment → segment lookup table.
    ExportLut {
        project: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Persist the project as-is.
    Persist { project: PathBuf },
}

fn parse_coord(s: &str) -> std::result::Result<Coord, String> {
    parse_triple::<i64>(s).ok_or_else(|| format!("expected X,Y,Z but got '{}'", s))
}

fn parse_dims(s: &str) -> std::result::Result<[u64; 3], String> {
    match parse_triple::<u64>(s) {
        Some(d) if !d.contains(&0) => Ok(d),
        _ => Err(format!("expected three non-zero dimensions X,Y,Z but got '{}'", s)),
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run one command and return an OS exit code (`0` success, `1` failure).
pub fn run(args: CliArgs) -> ExitCode {
    match execute(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            if e.is_retryable() {
                eprintln!("(retryable; no in-memory state was lost)");
            }
            ExitCode::FAILURE
        }
    }
}

fn execute(args: CliArgs) -> Result<()> {
    let mut settings = match &args.settings {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    let dry_run = args.dry_run;

    match args.command {
        Command::Import { project, raw, dims } => {
            let t0 = Instant::now();
            let volume = read_raw_u64(&raw, Extent::new(dims), settings.chunk_shape)?;
            let p = Project::create(&project, &volume, settings)?;
            println!(
                "imported {} ({}×{}×{}) in {:.1}s, next id {}",
                p.name,
                dims[0],
                dims[1],
                dims[2],
                t0.elapsed().as_secs_f64(),
                p.info()?.next_id
            );
            Ok(())
        }
        Command::Info { project } => {
            let p = Project::open(&project, settings)?;
            let info = p.info()?;
            println!("project:        {}", p.name);
            println!("extent:         {:?}", info.extent.dims);
            println!("chunk shape:    {:?}", info.chunk_shape);
            println!("painted chunks: {} ({} bytes)", info.materialized_chunks, info.canvas_bytes);
            println!("lut entries:    {}", info.lut_entries);
            println!("merged groups:  {}", info.merged_segments);
            println!("next id:        {}", info.next_id);
            println!("snapshot:       {}", info.snapshot.as_deref().unwrap_or("(none)"));
            Ok(())
        }
        Command::Segment { project, fragments } => {
            let p = Project::open(&project, settings)?;
            for f in fragments {
                println!("{} {}", f, p.segment(f));
            }
            Ok(())
        }
        Command::Read { project, at } => {
            let p = Project::open(&project, settings)?;
            let fragment = p.read_voxel(at)?;
            println!("fragment {} segment {}", fragment, p.read_segment(at)?);
            Ok(())
        }
        Command::Merge { project, a, b, into } => {
            let p = Project::open(&project, settings)?;
            match p.merge(a, b, into)? {
                Some(change) => println!(
                    "merged {} fragment(s) into segment {}",
                    change.fragments.len(),
                    change.segment
                ),
                None => println!("{} and {} already share segment {}", a, b, p.segment(a)),
            }
            finish(&p, dry_run)
        }
        Command::Detach { project, fragments } => {
            let p = Project::open(&project, settings)?;
            for f in fragments {
                match p.detach(f)? {
                    Some(change) => println!("{} -> {}", f, change.segment),
                    None => println!("{} is already its own segment", f),
                }
            }
            finish(&p, dry_run)
        }
        Command::Paint {
            project,
            at,
            label,
            background,
            brush,
            radius,
        } => {
            if let Some(r) = radius {
                settings.brush_radius = r;
            }
            let mode = match (background, label) {
                (true, _) => PaintMode::Background,
                (false, Some(l)) => PaintMode::Label(l),
                (false, None) => return Err(LabelError::IrregularId(0)),
            };
            let p = Project::open(&project, settings)?;
            let change = if brush {
                p.paint_brush(at, mode)?
            } else {
                p.paint_voxel(at, mode)?
            };
            println!("painted {} voxel(s) in {} chunk(s)", change.affected, change.chunks.len());
            finish(&p, dry_run)
        }
        Command::Erase {
            project,
            at,
            brush,
            radius,
        } => {
            if let Some(r) = radius {
                settings.brush_radius = r;
            }
            let p = Project::open(&project, settings)?;
            let change = if brush {
                p.paint_brush(at, PaintMode::Erase)?
            } else {
                p.clear_voxel(at)?
            };
            println!("erased {} voxel(s)", change.affected);
            finish(&p, dry_run)
        }
        Command::Fill {
            project,
            at,
            label,
            background,
            connectivity,
        } => {
            apply_connectivity(&mut settings, connectivity.as_deref())?;
            let mode = match (background, label) {
                (true, _) => PaintMode::Background,
                (false, Some(l)) => PaintMode::Label(l),
                (false, None) => return Err(LabelError::IrregularId(0)),
            };
            let p = Project::open(&project, settings)?;
            let outcome = p.fill(at, mode)?;
            println!(
                "filled {} voxel(s) across {} chunk(s)",
                outcome.affected(),
                outcome.change.chunks.len()
            );
            finish(&p, dry_run)
        }
        Command::Restrict {
            project,
            at,
            connectivity,
        } => {
            apply_connectivity(&mut settings, connectivity.as_deref())?;
            let p = Project::open(&project, settings)?;
            let outcome = p.restrict(at)?;
            println!(
                "carved {} voxel(s); segment region spans {} voxel(s)",
                outcome.affected(),
                outcome.region
            );
            finish(&p, dry_run)
        }
        Command::NextId { project } => {
            let p = Project::open(&project, settings)?;
            println!("{}", p.next_paint_id()?);
            // Persist so the allocated id stays reserved.
            finish(&p, dry_run)
        }
        Command::ExportLut { project, output } => {
            let p = Project::open(&project, settings)?;
            let lut = p.export_lookup_table();
            let mut text = String::new();
            for (k, v) in lut.keys.iter().zip(&lut.values) {
                let _ = writeln!(text, "{} {}", k, v);
            }
            match output {
                Some(path) => {
                    std::fs::write(&path, text)?;
                    println!("wrote {} entries to {}", lut.len(), path.display());
                }
                None => print!("{}", text),
            }
            Ok(())
        }
        Command::Persist { project } => {
            let p = Project::open(&project, settings)?;
            p.mark_dirty();
            finish(&p, false)
        }
    }
}

fn apply_connectivity(settings: &mut Settings, name: Option<&str>) -> Result<()> {
    if let Some(name) = name {
        settings.connectivity = Connectivity::parse(name, settings.brush_axis).ok_or_else(|| {
            LabelError::InvalidFormat(format!("unknown connectivity '{}'", name))
        })?;
    }
    Ok(())
}

/// Persist unsaved edits unless this is a dry run.
fn finish(p: &Project, dry_run: bool) -> Result<()> {
    if dry_run {
        println!("dry run: nothing persisted");
        return Ok(());
    }
    if !p.is_dirty() {
        return Ok(());
    }
    let summary = p.persist()?;
    println!(
        "persisted snapshot {} ({} lut entries) in {:.2}s",
        summary.snapshot,
        summary.lut_entries,
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run_args(args: &[&str]) -> ExitCode {
        run(CliArgs::try_parse_from(args).unwrap())
    }

    /// 4×4×1 volume with fragment id = x + 1.
    fn write_raw(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("labels.raw");
        let bytes: Vec<u8> = (0..16u64).flat_map(|i| ((i % 4) + 1).to_le_bytes()).collect();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn parses_coordinates_and_dims() {
        assert_eq!(parse_coord("1, 2,3"), Ok([1, 2, 3]));
        assert!(parse_coord("1,2").is_err());
        assert!(parse_dims("4,0,1").is_err());
        assert!(CliArgs::try_parse_from(["labelfe", "paint", "p", "1,2,3"]).is_err());
        assert!(CliArgs::try_parse_from(["labelfe", "paint", "p", "1,2,3", "--background"]).is_ok());
    }

    #[test]
    fn import_merge_and_reopen() {
        let dir = TempDir::new().unwrap();
        let raw = write_raw(&dir);
        let proj = dir.path().join("proj");
        let cfg = dir.path().join("settings.cfg");
        std::fs::write(&cfg, "chunk_shape=2,2,1\n").unwrap();
        let (proj_s, raw_s, cfg_s) = (
            proj.to_str().unwrap(),
            raw.to_str().unwrap(),
            cfg.to_str().unwrap(),
        );

        let ok = ExitCode::SUCCESS;
        assert_eq!(run_args(&["labelfe", "import", proj_s, raw_s, "--dims", "4,4,1", "--settings", cfg_s]), ok);
        assert_eq!(run_args(&["labelfe", "merge", proj_s, "1", "2", "--settings", cfg_s]), ok);
        assert_eq!(run_args(&["labelfe", "paint", proj_s, "3,3,0", "9", "--settings", cfg_s]), ok);
        assert_eq!(run_args(&["labelfe", "read", proj_s, "0,0,0", "--settings", cfg_s]), ok);
        assert_eq!(run_args(&["labelfe", "read", proj_s, "4,0,0", "--settings", cfg_s]), ExitCode::FAILURE);
        // A dry run leaves the stored project alone.
        assert_eq!(run_args(&["labelfe", "merge", proj_s, "3", "4", "--dry-run", "--settings", cfg_s]), ok);
        assert_eq!(run_args(&["labelfe", "paint", proj_s, "9,9,0", "5", "--settings", cfg_s]), ExitCode::FAILURE);
        assert_eq!(
            run_args(&["labelfe", "paint", proj_s, "1,1,0", "5", "--brush", "--radius", "inf", "--settings", cfg_s]),
            ExitCode::FAILURE
        );

        let settings = Settings::load_from(&cfg);
        let p = Project::open(&proj, settings).unwrap();
        assert_eq!(p.segment(1), 2);
        assert_eq!(p.segment(3), 3);
        assert_eq!(p.read_voxel([3, 3, 0]).unwrap(), 9);
    }
}
