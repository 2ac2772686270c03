//! Core orchestration primitives for the segmentation pipeline
//!
//! This crate provides the building blocks the batch pipeline is assembled
//! from: a bounded worker pool with blocking futures and completion
//! continuations, immutable label-space mappings with composition and
//! inversion, lookup-table loaders, and the crop/re-expand volume transform
//! used for region-of-interest localization.

pub mod executor;
pub mod lut;
pub mod mapper;
pub mod volume;

pub use executor::{ExecutorPool, Parallelism, TaskHandle};
pub use lut::{load_json_id_lut, load_json_name_lut, load_tsv_lut};
pub use mapper::{ChannelMapDirection, LabelMap};
pub use volume::{crop_transform, localize_roi, RoiBounds};
