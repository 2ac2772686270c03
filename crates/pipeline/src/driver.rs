//! Batch pipeline driver
//!
//! Assembles the executor pool, label-map chains, predictors, loader and
//! writer, then iterates subjects with one-subject lookahead: the next
//! subject's load is already in flight on the pool while the current
//! subject runs through predict, fuse and write. The first failing subject
//! aborts the whole batch after the full error is logged.

use crate::config::{LutPaths, PipelineConfig};
use crate::io::VolumeIo;
use crate::loader::{LoadedSubject, SubjectLoader};
use crate::segstats::{self, default_merge_rules};
use crate::subject::SubjectDescriptor;
use crate::writer::ResultWriter;
use cereb_seg_common::{Plane, Result, SegError, PLANES};
use cereb_seg_core::{
    load_json_id_lut, load_json_name_lut, load_tsv_lut, ExecutorPool, LabelMap, Parallelism,
    TaskHandle,
};
use cereb_seg_fusion::{fuse, PlaneLogits};
use cereb_seg_inference::{OrtPredictor, PlanePredictor, PredictorSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Stage ladder of one subject's pipeline instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectStage {
    Loading,
    Predicting,
    Fusing,
    Writing,
    Stats,
    Done,
}

impl fmt::Display for SubjectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Loading => "loading",
            Self::Predicting => "predicting",
            Self::Fusing => "fusing",
            Self::Writing => "writing",
            Self::Stats => "stats",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// The precomposed label-map chains, built once at startup and shared
/// read-only across all subjects
pub struct LabelMaps {
    /// Native label space: name -> native id
    pub native: LabelMap<String, i64>,
    /// Native id -> target id (native⁻¹ ∘ native-name→target-name ∘ target LUT)
    pub to_target: LabelMap<i64, i64>,
    /// Native id -> reduced sagittal class id
    pub sagittal: LabelMap<i64, i64>,
    /// Native name -> target id
    pub target_names: LabelMap<String, i64>,
    /// Target id -> native name (for stats rows)
    pub target_id_names: LabelMap<i64, String>,
    /// Target color table path, recorded in stats files
    pub lut_path: PathBuf,
}

impl LabelMaps {
    /// Load the four source tables through the pool and compose the chains
    pub fn load(pool: &ExecutorPool, lut: &LutPaths) -> Result<Self> {
        let native_path = lut.native.clone();
        let native = pool.submit(move || load_tsv_lut(&native_path, true));
        let target_path = lut.target.clone();
        let target = pool.submit(move || load_tsv_lut(&target_path, false));
        let sagittal_path = lut.sagittal.clone();
        let sagittal = pool.submit(move || load_json_id_lut(&sagittal_path));
        let names_path = lut.target_names.clone();
        let names = pool.submit(move || load_json_name_lut(&names_path));

        let native = native.wait()?;
        let target_names = names.wait()?.chain(&target.wait()?)?;
        let to_target = native.invert()?.chain(&target_names)?;
        let sagittal = native.invert()?.chain(&sagittal.wait()?)?;
        let target_id_names = target_names.invert()?;

        Ok(Self {
            native,
            to_target,
            sagittal,
            target_names,
            target_id_names,
            lut_path: lut.target.clone(),
        })
    }
}

/// Batch inference pipeline for cerebellum sub-segmentation
pub struct Pipeline {
    pool: Arc<ExecutorPool>,
    maps: LabelMaps,
    predictors: PredictorSet,
    loader: SubjectLoader,
    writer: ResultWriter,
}

impl Pipeline {
    /// Build a pipeline with an explicit predictor factory (used by tests
    /// and by [`Pipeline::with_onnx_predictors`])
    pub fn new<F>(config: PipelineConfig, io: Arc<dyn VolumeIo>, load_predictor: F) -> Result<Self>
    where
        F: Fn(Plane) -> Result<Box<dyn PlanePredictor>> + Send + Sync + 'static,
    {
        config.validate()?;
        let parallelism = if config.async_io {
            // Up to two subject-load tasks are in flight (current subject
            // plus lookahead), each blocking a worker on its child loads; a
            // third worker must stay available to run those children.
            let threads = match config.threads {
                0 => num_cpus::get().max(3),
                configured => configured.max(3),
            };
            Parallelism::Threads(threads)
        } else {
            Parallelism::Inline
        };
        let pool = Arc::new(ExecutorPool::new(parallelism));
        info!(
            "pipeline executor: {} ({} threads)",
            if pool.is_parallel() { "pooled" } else { "inline" },
            pool.thread_count()
        );

        let maps = LabelMaps::load(&pool, &config.lut)?;
        let predictors = PredictorSet::load(&pool, load_predictor)?;

        let config = Arc::new(config);
        let loader = SubjectLoader::new(io.clone(), pool.clone(), config);
        let writer = ResultWriter::new(io, pool.clone());

        Ok(Self {
            pool,
            maps,
            predictors,
            loader,
            writer,
        })
    }

    /// Build a pipeline whose predictors come from the configured ONNX
    /// checkpoints
    pub fn with_onnx_predictors(config: PipelineConfig, io: Arc<dyn VolumeIo>) -> Result<Self> {
        let checkpoints = config.checkpoints.clone();
        let classes = config.num_classes;
        let sagittal_classes = config.num_classes_sagittal;
        Self::new(config, io, move |plane| {
            let (path, classes) = match plane {
                Plane::Axial => (&checkpoints.axial, classes),
                Plane::Coronal => (&checkpoints.coronal, classes),
                Plane::Sagittal => (&checkpoints.sagittal, sagittal_classes),
            };
            Ok(Box::new(OrtPredictor::load(path, classes)?) as Box<dyn PlanePredictor>)
        })
    }

    /// Label-map chains (read-only)
    #[must_use]
    pub fn maps(&self) -> &LabelMaps {
        &self.maps
    }

    /// Process a batch of subjects.
    ///
    /// The batch aborts on the first subject failure; the error carries the
    /// triggering failure text.
    pub fn run(&self, subjects: &[SubjectDescriptor]) -> Result<()> {
        let total = subjects.len();
        info!("processing {total} subjects");

        let mut pending = match subjects.first() {
            Some(first) => Some(self.submit_load(first)),
            None => return Ok(()),
        };
        let mut previous_done = Instant::now();

        for (index, subject) in subjects.iter().enumerate() {
            let Some(current) = pending.take() else {
                break;
            };
            // One-subject lookahead, bounded by the pool's parallelism. The
            // inline executor instead loads strictly in order, below.
            if self.pool.is_parallel() {
                pending = subjects.get(index + 1).map(|next| self.submit_load(next));
            }

            if let Err((stage, e)) = self.process_subject(subject, current) {
                error!("subject '{}' failed during {stage}: {e}", subject.id);
                return Err(e);
            }
            info!(
                "subject {}/{} with id '{}' processed in {:.2} sec",
                index + 1,
                total,
                subject.id,
                previous_done.elapsed().as_secs_f64()
            );
            previous_done = Instant::now();

            if !self.pool.is_parallel() {
                pending = subjects.get(index + 1).map(|next| self.submit_load(next));
            }
        }
        Ok(())
    }

    fn submit_load(&self, subject: &SubjectDescriptor) -> TaskHandle<Result<LoadedSubject>> {
        let loader = self.loader.clone();
        let subject = subject.clone();
        self.pool.submit(move || loader.load(&subject))
    }

    fn process_subject(
        &self,
        subject: &SubjectDescriptor,
        load: TaskHandle<Result<LoadedSubject>>,
    ) -> std::result::Result<(), (SubjectStage, SegError)> {
        let mut stage = SubjectStage::Loading;
        debug!("subject '{}' -> {stage}", subject.id);
        let loaded = load.wait().map_err(|e| (stage, e))?;

        stage = SubjectStage::Predicting;
        debug!("subject '{}' -> {stage}", subject.id);
        let mut logits = PlaneLogits {
            axial: Vec::new(),
            coronal: Vec::new(),
            sagittal: Vec::new(),
        };
        for plane in PLANES {
            let batches = loaded.dataset.plane_batches(plane);
            let stack = self
                .predictors
                .predict(plane, batches)
                .map_err(|e| (stage, e))?;
            match plane {
                Plane::Axial => logits.axial = stack,
                Plane::Coronal => logits.coronal = stack,
                Plane::Sagittal => logits.sagittal = stack,
            }
        }

        stage = SubjectStage::Fusing;
        debug!("subject '{}' -> {stage}", subject.id);
        let seg = fuse(logits, &self.maps.sagittal, &self.maps.to_target)
            .map_err(|e| (stage, e))?;

        stage = SubjectStage::Writing;
        debug!("subject '{}' -> {stage}", subject.id);
        let _save = self
            .writer
            .save_segmentation(
                &seg,
                &subject.seg_output_path,
                &loaded.dataset.bounds,
                &loaded.dataset.geometry,
            )
            .map_err(|e| (stage, e))?;

        if let Some(stats_path) = &subject.stats_path {
            stage = SubjectStage::Stats;
            debug!("subject '{}' -> {stage}", subject.id);
            let intensity_handle = loaded.intensity.ok_or_else(|| {
                (
                    stage,
                    SegError::Config(format!(
                        "subject '{}': statistics requested but no intensity volume was loaded",
                        subject.id
                    )),
                )
            })?;
            let (_, intensity) = intensity_handle.wait().map_err(|e| (stage, e))?;

            let full_seg = ResultWriter::expand_to_source(&seg, &loaded.dataset.bounds);
            if intensity.shape() != full_seg.shape() {
                return Err((
                    stage,
                    SegError::Config(format!(
                        "subject '{}': intensity volume shape {:?} does not match the \
                         segmentation geometry {:?}",
                        subject.id,
                        intensity.shape(),
                        full_seg.shape()
                    )),
                ));
            }

            let voxel_volume = loaded.dataset.geometry.voxel_volume();
            let merged =
                segstats::merged_label_specs(&self.maps.target_names, &default_merge_rules());
            // Background stays out of the report.
            let label_ids: Vec<i64> = self
                .maps
                .target_names
                .values()
                .copied()
                .filter(|&id| id != 0)
                .collect();
            let table = segstats::compute_region_stats(
                &full_seg,
                Some(&intensity),
                &label_ids,
                voxel_volume,
                &merged,
                &self.maps.target_id_names,
            );
            // Batch processing is finished with this subject; the actual
            // file write is outsourced to the pool.
            let _stats = self
                .writer
                .save_statistics(
                    table,
                    stats_path,
                    &subject.seg_output_path,
                    loaded.intensity_path.as_deref(),
                    &self.maps.lut_path,
                )
                .map_err(|e| (stage, e))?;
        }

        stage = SubjectStage::Done;
        debug!("subject '{}' -> {stage}", subject.id);
        Ok(())
    }
}
