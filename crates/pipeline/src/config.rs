//! Pipeline configuration
//!
//! One explicit configuration object, resolved before the pipeline is
//! constructed. Thread count, slicing geometry and table/checkpoint paths
//! all live here; there is no module-level mutable state.

use cereb_seg_common::{Result, SegError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Paths of the four label tables the mapper chains are built from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LutPaths {
    /// Native cerebellum color table (TSV with header): name -> native id
    pub native: PathBuf,
    /// Target color table (FreeSurfer style, no header): name -> target id
    pub target: PathBuf,
    /// JSON table: native name -> reduced sagittal class id
    pub sagittal: PathBuf,
    /// JSON table: native name -> target name
    pub target_names: PathBuf,
}

/// Per-plane checkpoint paths (file, or directory of exported checkpoints)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPaths {
    pub axial: PathBuf,
    pub coronal: PathBuf,
    pub sagittal: PathBuf,
}

/// Full pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker threads for I/O and deferred compute; 0 means all cores
    pub threads: usize,
    /// Whether I/O runs asynchronously on the pool (false: inline, strictly
    /// ordered, no lookahead)
    pub async_io: bool,
    /// Slabs per inference batch
    pub batch_size: usize,
    /// Crop size around the cerebellum
    pub patch_size: [usize; 3],
    /// Channels per slab (odd; neighborhood around the primary slice)
    pub slice_thickness: usize,
    /// Class count of the axial/coronal predictors
    pub num_classes: usize,
    /// Class count of the (reduced) sagittal predictor
    pub num_classes_sagittal: usize,
    /// Labels of the anatomical segmentation that localize the cerebellum
    pub localizer_labels: Vec<i64>,
    /// Label table paths
    pub lut: LutPaths,
    /// Predictor checkpoint paths
    pub checkpoints: CheckpointPaths,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            async_io: false,
            batch_size: 16,
            patch_size: [128, 128, 128],
            slice_thickness: 3,
            num_classes: 31,
            num_classes_sagittal: 20,
            localizer_labels: vec![7, 8, 46, 47],
            lut: LutPaths {
                native: PathBuf::from("config/cerebellum_lut.tsv"),
                target: PathBuf::from("config/target_lut.txt"),
                sagittal: PathBuf::from("config/native_to_sagittal.json"),
                target_names: PathBuf::from("config/native_to_target_names.json"),
            },
            checkpoints: CheckpointPaths {
                axial: PathBuf::from("checkpoints/axial"),
                coronal: PathBuf::from("checkpoints/coronal"),
                sagittal: PathBuf::from("checkpoints/sagittal"),
            },
        }
    }
}

impl PipelineConfig {
    /// Load a configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SegError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&text).map_err(|e| {
            SegError::Config(format!("invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject geometrically impossible settings early
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SegError::Config("batch_size must be positive".to_string()));
        }
        if self.slice_thickness == 0 || self.slice_thickness % 2 == 0 {
            return Err(SegError::Config(format!(
                "slice_thickness must be odd, got {}",
                self.slice_thickness
            )));
        }
        if self.patch_size.iter().any(|&extent| extent == 0) {
            return Err(SegError::Config("patch_size must be positive".to_string()));
        }
        if self.localizer_labels.is_empty() {
            return Err(SegError::Config(
                "localizer_labels must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
