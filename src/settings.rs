use std::path::{Path, PathBuf};

use crate::canvas::{BrushShape, DEFAULT_CHUNK_SHAPE};
use crate::error::Result;
use crate::label::{Axis, parse_triple};
use crate::ops::Connectivity;

const SETTINGS_FILE: &str = "labelfe_settings.cfg";

/// User preferences, stored as `key=value` lines.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Canvas chunk shape for new sessions.
    pub chunk_shape: [u32; 3],
    pub brush_radius: f64,
    pub brush_radius_increment: f64,
    /// Plane normal for disc brushes and 2D fills.
    pub brush_axis: Axis,
    pub brush_shape: BrushShape,
    pub connectivity: Connectivity,
    pub labels_dataset: String,
    pub lut_dataset: String,
    /// Chunks flattened per parallel batch while persisting.
    pub flatten_batch_chunks: usize,
    /// Auto-persist interval in minutes (0 = disabled).
    pub auto_persist_minutes: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_shape: DEFAULT_CHUNK_SHAPE,
            brush_radius: 5.0,
            brush_radius_increment: 1.0,
            brush_axis: Axis::Z,
            brush_shape: BrushShape::Disc(Axis::Z),
            connectivity: Connectivity::Faces,
            labels_dataset: "neuron_ids".to_string(),
            lut_dataset: "fragment_segment_lut".to_string(),
            flatten_batch_chunks: 64,
            auto_persist_minutes: 0,
        }
    }
}

impl Settings {
    /// Platform config location, e.g. `~/.config/labelfe/labelfe_settings.cfg`.
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA")
                .or_else(|_| std::env::var("USERPROFILE"))
                .ok()?;
            return Some(PathBuf::from(appdata).join("LabelFE").join(SETTINGS_FILE));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").ok()?;
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("LabelFE")
                    .join(SETTINGS_FILE),
            );
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
                .ok()?;
            Some(config_dir.join("labelfe").join(SETTINGS_FILE))
        }
    }

    /// Load from the platform location (defaults if missing or corrupt).
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        Self::parse(&content)
    }

    /// Unknown keys and unparsable values are ignored.
    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        let mut shape = s.brush_shape.name().to_string();
        let mut connectivity = s.connectivity.name().to_string();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let val = val.trim();
            match key.trim() {
                "chunk_shape" => {
                    if let Some(cs) = parse_triple::<u32>(val).filter(|cs| !cs.contains(&0)) {
                        s.chunk_shape = cs;
                    }
                }
                "brush_radius" => {
                    if let Ok(r) = val.parse::<f64>()
                        && r.is_finite()
                        && r >= 0.0
                    {
                        s.brush_radius = r;
                    }
                }
                "brush_radius_increment" => {
                    if let Ok(r) = val.parse::<f64>()
                        && r.is_finite()
                        && r > 0.0
                    {
                        s.brush_radius_increment = r;
                    }
                }
                "brush_axis" => {
                    if let Some(a) = Axis::parse(val) {
                        s.brush_axis = a;
                    }
                }
                "brush_shape" => shape = val.to_string(),
                "connectivity" => connectivity = val.to_string(),
                "labels_dataset" if !val.is_empty() => s.labels_dataset = val.to_string(),
                "lut_dataset" if !val.is_empty() => s.lut_dataset = val.to_string(),
                "flatten_batch_chunks" => {
                    s.flatten_batch_chunks = val.parse().ok().filter(|&n| n > 0).unwrap_or(64);
                }
                "auto_persist_minutes" => {
                    s.auto_persist_minutes = val.parse().unwrap_or(0);
                }
                _ => {}
            }
        }
        // Axis-dependent values resolve once the axis is known.
        s.brush_shape = BrushShape::parse(&shape, s.brush_axis).unwrap_or(BrushShape::Disc(s.brush_axis));
        s.connectivity = Connectivity::parse(&connectivity, s.brush_axis).unwrap_or(Connectivity::Faces);
        s
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "chunk_shape={},{},{}\n\
             brush_radius={}\n\
             brush_radius_increment={}\n\
             brush_shape={}\n\
             brush_axis={}\n\
             connectivity={}\n\
             labels_dataset={}\n\
             lut_dataset={}\n\
             flatten_batch_chunks={}\n\
             auto_persist_minutes={}\n",
            self.chunk_shape[0],
            self.chunk_shape[1],
            self.chunk_shape[2],
            self.brush_radius,
            self.brush_radius_increment,
            self.brush_shape.name(),
            self.brush_axis.name(),
            self.connectivity.name(),
            self.labels_dataset,
            self.lut_dataset,
            self.flatten_batch_chunks,
            self.auto_persist_minutes,
        )
    }

    /// Save to the platform location.
    pub fn save(&self) -> Result<()> {
        match Self::settings_path() {
            Some(path) => self.save_to(&path),
            None => Ok(()),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_config_string())?;
        Ok(())
    }

    pub fn grow_brush(&mut self) {
        self.brush_radius += self.brush_radius_increment;
    }

    pub fn shrink_brush(&mut self) {
        self.brush_radius = (self.brush_radius - self.brush_radius_increment).max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_the_proofreading_setup() {
        let s = Settings::default();
        assert_eq!(s.chunk_shape, [64, 64, 8]);
        assert_eq!(s.brush_radius, 5.0);
        assert_eq!(s.brush_radius_increment, 1.0);
        assert_eq!(s.labels_dataset, "neuron_ids");
        assert_eq!(s.lut_dataset, "fragment_segment_lut");
    }

    #[test]
    fn save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        let mut s = Settings::default();
        s.chunk_shape = [32, 32, 4];
        s.brush_axis = Axis::X;
        s.brush_shape = BrushShape::Sphere;
        s.connectivity = Connectivity::PlaneDiagonal(Axis::X);
        s.auto_persist_minutes = 10;
        s.save_to(&path).unwrap();
        assert_eq!(Settings::load_from(&path), s);
    }

    #[test]
    fn axis_applies_regardless_of_key_order() {
        let s = Settings::parse("brush_shape=disc\nconnectivity=plane\nbrush_axis=y\n");
        assert_eq!(s.brush_shape, BrushShape::Disc(Axis::Y));
        assert_eq!(s.connectivity, Connectivity::Plane(Axis::Y));
    }

    #[test]
    fn bad_values_fall_back() {
        let s = Settings::parse(
            "# comment\nchunk_shape=0,1,2\nbrush_radius=-3\nflatten_batch_chunks=0\nconnectivity=weird\nnonsense\nunknown=1\n",
        );
        assert_eq!(s, Settings::default());
        let missing = Settings::load_from(Path::new("/definitely/not/here.cfg"));
        assert_eq!(missing, Settings::default());
    }

    #[test]
    fn brush_steps() {
        let mut s = Settings::default();
        s.grow_brush();
        assert_eq!(s.brush_radius, 6.0);
        for _ in 0..10 {
            s.shrink_brush();
        }
        assert_eq!(s.brush_radius, 0.0);
    }
}
