//! Batch orchestration of cerebellum sub-segmentation inference
//!
//! This crate wires the orchestration core together: per-subject data
//! loading, the three-plane predictor pass, view fusion, result writing and
//! optional region statistics, all driven by a batch loop with one-subject
//! lookahead over the shared executor pool.

pub mod config;
pub mod dataset;
pub mod driver;
pub mod io;
pub mod loader;
pub mod nifti_io;
pub mod segstats;
pub mod subject;
pub mod writer;

pub use config::{CheckpointPaths, LutPaths, PipelineConfig};
pub use dataset::LocalizedDataset;
pub use driver::{LabelMaps, Pipeline, SubjectStage};
pub use io::{MemVolumeIo, VolumeIo};
pub use loader::{LoadedSubject, SubjectLoader};
pub use nifti_io::NiftiVolumeIo;
pub use segstats::{compute_region_stats, default_merge_rules, StatsRow, StatsTable};
pub use subject::{conformed_output_path, SubjectDescriptor};
pub use writer::ResultWriter;
