//! Subject descriptors
//!
//! One descriptor per subject, resolved once at batch start. Optional
//! outputs are explicit `Option` fields, never queried ad hoc by name.

use std::path::{Path, PathBuf};

/// Input/output paths and requested outputs for one subject
#[derive(Debug, Clone)]
pub struct SubjectDescriptor {
    /// Per-subject identifier used in logs and progress reporting
    pub id: String,
    /// Existing anatomical (whole-brain) segmentation; required prerequisite
    pub brain_seg_path: PathBuf,
    /// Expected location of the conformed 1mm volume
    pub conformed_path: PathBuf,
    /// Best available original volume, preferred as conform source
    pub orig_path: Option<PathBuf>,
    /// Output path of the cerebellum segmentation
    pub seg_output_path: PathBuf,
    /// Bias-field-corrected intensity volume, required when statistics are
    /// requested
    pub intensity_path: Option<PathBuf>,
    /// Optional statistics output path; `Some` requests the stats stage
    pub stats_path: Option<PathBuf>,
}

impl SubjectDescriptor {
    /// Minimal descriptor; optional inputs and outputs default to absent
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        brain_seg_path: impl Into<PathBuf>,
        conformed_path: impl Into<PathBuf>,
        seg_output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            brain_seg_path: brain_seg_path.into(),
            conformed_path: conformed_path.into(),
            orig_path: None,
            seg_output_path: seg_output_path.into(),
            intensity_path: None,
            stats_path: None,
        }
    }

    #[must_use]
    pub fn wants_stats(&self) -> bool {
        self.stats_path.is_some()
    }
}

/// File extensions the conformed volume may use
pub const SUPPORTED_OUTPUT_EXTENSIONS: [&str; 3] = ["nii.gz", "nii", "mgz"];

/// Derive the on-disk path for a freshly conformed volume by inserting a
/// `.1mm` marker before the file extension.
///
/// An already-marked path is returned unchanged; an unrecognized extension
/// is a configuration error.
pub fn conformed_output_path(path: &Path) -> cereb_seg_common::Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let extension = SUPPORTED_OUTPUT_EXTENSIONS
        .iter()
        .find(|ext| name.len() > ext.len() + 1 && name.ends_with(&format!(".{ext}")))
        .ok_or_else(|| {
            cereb_seg_common::SegError::Config(format!(
                "invalid extension of conformed volume path {}, must be one of {:?}",
                path.display(),
                SUPPORTED_OUTPUT_EXTENSIONS
            ))
        })?;

    let stem = &name[..name.len() - extension.len() - 1];
    let marked = if stem.ends_with(".1mm") {
        name.to_string()
    } else {
        format!("{stem}.1mm.{extension}")
    };
    Ok(path.with_file_name(marked))
}
