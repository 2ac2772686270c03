//! Common types and utilities for the cerebellum segmentation pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum SegError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing prerequisite: {artifact} (run {upstream} first)")]
    MissingPrerequisite { artifact: String, upstream: String },

    #[error("Compute device out of memory during {stage}: {detail}. {remedy}")]
    ResourceExhausted {
        stage: String,
        detail: String,
        remedy: String,
    },

    #[error("Label space inconsistency: {0}")]
    LabelSpace(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, SegError>;

/// Anatomical viewing direction along which a separate predictor is trained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plane {
    Axial,
    Coronal,
    Sagittal,
}

/// All planes, in the order they are predicted and fused
pub const PLANES: [Plane; 3] = [Plane::Axial, Plane::Coronal, Plane::Sagittal];

impl Plane {
    /// Get human-readable plane name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Axial => "axial",
            Self::Coronal => "coronal",
            Self::Sagittal => "sagittal",
        }
    }
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Spatial metadata of a volume: voxel-to-world affine and voxel sizes.
///
/// Carried alongside the data so output files reproduce the input geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    /// Row-major 4x4 voxel-index to world-coordinate transform
    pub affine: [[f32; 4]; 4],
    /// Voxel edge lengths in mm
    pub voxel_sizes: [f32; 3],
}

impl VolumeGeometry {
    /// Identity affine scaled by the given voxel sizes
    #[must_use]
    pub fn with_voxel_sizes(voxel_sizes: [f32; 3]) -> Self {
        let mut affine = [[0.0f32; 4]; 4];
        for (i, row) in affine.iter_mut().enumerate() {
            row[i] = if i < 3 { voxel_sizes[i] } else { 1.0 };
        }
        Self {
            affine,
            voxel_sizes,
        }
    }

    /// Physical volume of one voxel in mm^3
    #[must_use]
    pub fn voxel_volume(&self) -> f64 {
        self.voxel_sizes.iter().map(|&s| f64::from(s)).product()
    }

    /// Whether all voxel edges are within `tol` of 1mm
    #[must_use]
    pub fn is_isotropic_1mm(&self, tol: f32) -> bool {
        self.voxel_sizes.iter().all(|&s| (s - 1.0).abs() <= tol)
    }
}

impl Default for VolumeGeometry {
    fn default() -> Self {
        Self::with_voxel_sizes([1.0, 1.0, 1.0])
    }
}
