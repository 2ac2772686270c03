//! Per-subject asynchronous data acquisition
//!
//! Loads the intensity volume (when statistics are requested) and the
//! anatomical segmentation through the executor pool, obtains a conformed
//! 1mm volume (conforming on the fly when needed, with a fire-and-forget
//! save of the conformed result), and produces the localized dataset.

use crate::config::PipelineConfig;
use crate::dataset::LocalizedDataset;
use crate::io::VolumeIo;
use crate::subject::{conformed_output_path, SubjectDescriptor};
use cereb_seg_common::{Result, SegError, VolumeGeometry};
use cereb_seg_core::{ExecutorPool, TaskHandle};
use ndarray::Array3;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A loaded scalar volume with its geometry
pub type LoadedVolume = (VolumeGeometry, Array3<f32>);

/// Everything the downstream stages need for one subject
#[derive(Debug)]
pub struct LoadedSubject {
    /// In-flight intensity load; present iff statistics were requested
    pub intensity: Option<TaskHandle<Result<LoadedVolume>>>,
    pub intensity_path: Option<PathBuf>,
    pub dataset: LocalizedDataset,
}

/// Loads and localizes subjects through the shared executor pool
#[derive(Clone)]
pub struct SubjectLoader {
    io: Arc<dyn VolumeIo>,
    pool: Arc<ExecutorPool>,
    config: Arc<PipelineConfig>,
}

impl SubjectLoader {
    pub fn new(io: Arc<dyn VolumeIo>, pool: Arc<ExecutorPool>, config: Arc<PipelineConfig>) -> Self {
        Self { io, pool, config }
    }

    /// Acquire one subject's inputs and build its localized dataset
    pub fn load(&self, subject: &SubjectDescriptor) -> Result<LoadedSubject> {
        let (intensity, intensity_path) = self.begin_intensity_load(subject)?;

        if !self.io.exists(&subject.brain_seg_path) {
            return Err(SegError::MissingPrerequisite {
                artifact: format!(
                    "anatomical segmentation {}",
                    subject.brain_seg_path.display()
                ),
                upstream: "the whole-brain segmentation".to_string(),
            });
        }
        let io = self.io.clone();
        let seg_path = subject.brain_seg_path.clone();
        let brain_seg = self.pool.submit(move || io.load(&seg_path));

        let (geometry, conformed) = self.obtain_conformed(subject)?;

        let (_, seg_data) = brain_seg.wait()?;
        let brain_labels = seg_data.mapv(|value| value.round() as i64);
        let dataset = LocalizedDataset::new(&conformed, geometry, &brain_labels, &self.config)?;

        Ok(LoadedSubject {
            intensity,
            intensity_path,
            dataset,
        })
    }

    /// When statistics are requested, the intensity volume must be
    /// resolvable up front; its load starts immediately.
    #[allow(clippy::type_complexity)]
    fn begin_intensity_load(
        &self,
        subject: &SubjectDescriptor,
    ) -> Result<(Option<TaskHandle<Result<LoadedVolume>>>, Option<PathBuf>)> {
        if !subject.wants_stats() {
            return Ok((None, None));
        }
        let path = subject.intensity_path.clone().ok_or_else(|| {
            SegError::Config(format!(
                "subject '{}': statistics were requested but no intensity volume is \
                 configured, specify one via --intensity-name",
                subject.id
            ))
        })?;
        if !self.io.exists(&path) {
            return Err(SegError::Config(format!(
                "subject '{}': intensity volume {} does not exist, specify an absolute \
                 path via --intensity-name",
                subject.id,
                path.display()
            )));
        }
        let io = self.io.clone();
        let load_path = path.clone();
        let handle = self.pool.submit(move || io.load(&load_path));
        Ok((Some(handle), Some(path)))
    }

    /// Obtain the conformed 1mm volume: load it directly when it already
    /// exists and its header says conformed, otherwise conform the best
    /// available source and schedule an asynchronous save of the result.
    fn obtain_conformed(&self, subject: &SubjectDescriptor) -> Result<LoadedVolume> {
        let conformed_path = &subject.conformed_path;
        if self.io.exists(conformed_path) && self.io.is_conformed(conformed_path)? {
            return self.io.load(conformed_path);
        }

        let output_path = conformed_output_path(conformed_path)?;
        let source = match &subject.orig_path {
            Some(orig) if self.io.exists(orig) => orig.clone(),
            _ if self.io.exists(conformed_path) => {
                warn!(
                    "subject '{}': no original volume available, conforming {} again \
                     (chained interpolation may lose quality)",
                    subject.id,
                    conformed_path.display()
                );
                conformed_path.clone()
            }
            _ => {
                return Err(SegError::MissingPrerequisite {
                    artifact: format!(
                        "a volume to conform for subject '{}' ({} is missing and no \
                         original volume was given)",
                        subject.id,
                        conformed_path.display()
                    ),
                    upstream: "the image import".to_string(),
                })
            }
        };

        let io = self.io.clone();
        let conform_source = source.clone();
        let conform = self
            .pool
            .submit(move || io.conform(&conform_source).map(Arc::new));

        // Persist the conformed volume as a continuation so the pipeline can
        // keep going; the save runs as its own pool task and its failure is
        // observable in the log, not silently lost.
        let save_io = self.io.clone();
        let save_pool = self.pool.clone();
        conform.on_done(move |outcome| {
            if let Ok(volume) = outcome {
                let volume = volume.clone();
                let io = save_io.clone();
                save_pool.submit(move || {
                    let (geometry, data) = volume.as_ref();
                    info!("Saving conformed volume at {}", output_path.display());
                    if let Err(e) = io.save(&output_path, geometry, data) {
                        error!(
                            "failed to save conformed volume {}: {e}",
                            output_path.display()
                        );
                    }
                });
            }
        });

        let conformed = conform.wait()?;
        let (geometry, data) = conformed.as_ref();
        Ok((geometry.clone(), data.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemVolumeIo;
    use cereb_seg_core::Parallelism;
    use ndarray::Array3;
    use std::path::Path;

    fn test_config() -> Arc<PipelineConfig> {
        Arc::new(PipelineConfig {
            batch_size: 2,
            patch_size: [4, 4, 4],
            slice_thickness: 3,
            localizer_labels: vec![7],
            ..PipelineConfig::default()
        })
    }

    fn seeded_io(conformed: bool) -> Arc<MemVolumeIo> {
        let io = Arc::new(MemVolumeIo::new());
        let voxel = if conformed { 1.0 } else { 2.0 };
        io.insert(
            Path::new("/s1/orig.nii"),
            VolumeGeometry::with_voxel_sizes([voxel; 3]),
            Array3::from_elem((8, 8, 8), 10.0),
        );
        // The anatomical segmentation matches the conformed grid.
        let seg_side = if conformed { 8 } else { 16 };
        let mut seg = Array3::<f32>::zeros((seg_side, seg_side, seg_side));
        seg[[seg_side / 2, seg_side / 2, seg_side / 2]] = 7.0;
        io.insert(Path::new("/s1/aseg.nii"), VolumeGeometry::default(), seg);
        io
    }

    fn subject() -> SubjectDescriptor {
        SubjectDescriptor::new("s1", "/s1/aseg.nii", "/s1/orig.nii", "/s1/cereb.nii")
    }

    fn loader(io: Arc<MemVolumeIo>) -> SubjectLoader {
        SubjectLoader::new(
            io,
            Arc::new(ExecutorPool::new(Parallelism::Inline)),
            test_config(),
        )
    }

    #[test]
    fn test_load_with_conformed_volume_present() {
        let io = seeded_io(true);
        let loaded = loader(io).load(&subject()).unwrap();
        assert!(loaded.intensity.is_none());
        assert_eq!(loaded.dataset.shape(), [4, 4, 4]);
    }

    #[test]
    fn test_unconformed_volume_is_conformed_and_saved() {
        let io = seeded_io(false);
        let loaded = loader(io.clone()).load(&subject()).unwrap();
        assert_eq!(loaded.dataset.bounds.source_shape, [16, 16, 16]);
        // The conformed result was persisted with the 1mm marker.
        let (geometry, data) = io.get_f32(Path::new("/s1/orig.1mm.nii")).unwrap();
        assert!(geometry.is_isotropic_1mm(1e-3));
        assert_eq!(data.shape(), &[16, 16, 16]);
    }

    #[test]
    fn test_missing_brain_seg_is_prerequisite_error() {
        let io = Arc::new(MemVolumeIo::new());
        io.insert(
            Path::new("/s1/orig.nii"),
            VolumeGeometry::default(),
            Array3::from_elem((8, 8, 8), 1.0),
        );
        let err = loader(io).load(&subject()).unwrap_err();
        assert!(matches!(err, SegError::MissingPrerequisite { .. }));
        assert!(err.to_string().contains("aseg.nii"));
    }

    #[test]
    fn test_stats_without_intensity_is_config_error() {
        let io = seeded_io(true);
        let mut subject = subject();
        subject.stats_path = Some(PathBuf::from("/s1/cereb.stats"));
        let err = loader(io).load(&subject).unwrap_err();
        assert!(err.to_string().contains("--intensity-name"));
    }

    #[test]
    fn test_stats_with_intensity_starts_load() {
        let io = seeded_io(true);
        io.insert(
            Path::new("/s1/norm.nii"),
            VolumeGeometry::default(),
            Array3::from_elem((8, 8, 8), 5.0),
        );
        let mut subject = subject();
        subject.stats_path = Some(PathBuf::from("/s1/cereb.stats"));
        subject.intensity_path = Some(PathBuf::from("/s1/norm.nii"));
        let loaded = loader(io).load(&subject).unwrap();
        let (_, intensity) = loaded.intensity.unwrap().wait().unwrap();
        assert_eq!(intensity[[0, 0, 0]], 5.0);
    }

    #[test]
    fn test_missing_everything_to_conform() {
        let io = Arc::new(MemVolumeIo::new());
        let mut seg = Array3::<f32>::zeros((8, 8, 8));
        seg[[4, 4, 4]] = 7.0;
        io.insert(Path::new("/s1/aseg.nii"), VolumeGeometry::default(), seg);
        let err = loader(io).load(&subject()).unwrap_err();
        assert!(matches!(err, SegError::MissingPrerequisite { .. }));
    }
}
