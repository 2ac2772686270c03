//! Asynchronous persistence of segmentation volumes and statistics

use crate::io::VolumeIo;
use crate::segstats::{self, StatsTable};
use cereb_seg_common::{Result, SegError, VolumeGeometry};
use cereb_seg_core::{crop_transform, ExecutorPool, RoiBounds, TaskHandle};
use ndarray::Array3;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Persists per-subject results through the executor pool
pub struct ResultWriter {
    io: Arc<dyn VolumeIo>,
    pool: Arc<ExecutorPool>,
}

impl ResultWriter {
    pub fn new(io: Arc<dyn VolumeIo>, pool: Arc<ExecutorPool>) -> Self {
        Self { io, pool }
    }

    /// Re-expand a cropped segmentation into source space
    pub fn expand_to_source(seg: &Array3<i64>, bounds: &RoiBounds) -> Array3<i64> {
        crop_transform(seg, bounds.inverse_offsets(), bounds.source_shape)
    }

    /// Re-expand the cropped segmentation into the original geometry and
    /// persist it asynchronously with 16-bit label encoding.
    ///
    /// The output directory is created by its own pool task, awaited before
    /// the save is dispatched.
    pub fn save_segmentation(
        &self,
        seg: &Array3<i64>,
        path: &Path,
        bounds: &RoiBounds,
        geometry: &VolumeGeometry,
    ) -> Result<TaskHandle<Result<()>>> {
        self.ensure_output_dir(path)?;

        let full = Self::expand_to_source(seg, bounds);
        let mut labels = Array3::<i16>::zeros(full.raw_dim());
        for (narrow, &wide) in labels.iter_mut().zip(full.iter()) {
            if wide < i64::from(i16::MIN) || wide > i64::from(i16::MAX) {
                return Err(SegError::LabelSpace(format!(
                    "label {wide} does not fit the 16-bit output encoding"
                )));
            }
            *narrow = wide as i16;
        }

        info!("Saving cerebellum segmentation at {}", path.display());
        let io = self.io.clone();
        let geometry = geometry.clone();
        let out = path.to_path_buf();
        Ok(self.pool.submit(move || {
            let outcome = io.save_labels(&out, &geometry, &labels);
            if let Err(e) = &outcome {
                // The driver does not block on this handle; the failure must
                // still reach the log.
                error!("failed to save segmentation {}: {e}", out.display());
            }
            outcome
        }))
    }

    /// Persist a statistics table asynchronously
    pub fn save_statistics(
        &self,
        table: StatsTable,
        path: &Path,
        seg_path: &Path,
        intensity_path: Option<&Path>,
        lut_path: &Path,
    ) -> Result<TaskHandle<Result<()>>> {
        self.ensure_output_dir(path)?;

        info!("Saving region statistics at {}", path.display());
        let out = path.to_path_buf();
        let seg_path = seg_path.to_path_buf();
        let intensity_path: Option<PathBuf> = intensity_path.map(Path::to_path_buf);
        let lut_path = lut_path.to_path_buf();
        Ok(self.pool.submit(move || {
            let outcome = segstats::write_stats_file(
                &out,
                &table,
                &seg_path,
                intensity_path.as_deref(),
                &lut_path,
            );
            if let Err(e) = &outcome {
                error!("failed to save statistics {}: {e}", out.display());
            }
            outcome
        }))
    }

    fn ensure_output_dir(&self, path: &Path) -> Result<()> {
        let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) else {
            return Ok(());
        };
        let io = self.io.clone();
        let dir = parent.to_path_buf();
        let mkdir = self.pool.submit(move || io.create_dir_all(&dir));
        mkdir.wait().map_err(|e| {
            SegError::Other(format!(
                "cannot create output directory {}: {e}",
                parent.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemVolumeIo;
    use cereb_seg_core::Parallelism;

    fn writer_with_io() -> (ResultWriter, Arc<MemVolumeIo>) {
        let io = Arc::new(MemVolumeIo::new());
        let pool = Arc::new(ExecutorPool::new(Parallelism::Inline));
        (ResultWriter::new(io.clone(), pool), io)
    }

    fn sample_bounds() -> RoiBounds {
        RoiBounds {
            offsets: [1, 2, 3],
            shape: [2, 2, 2],
            source_shape: [6, 6, 6],
        }
    }

    #[test]
    fn test_save_reexpands_into_source_geometry() {
        let (writer, io) = writer_with_io();
        let seg = Array3::from_elem((2, 2, 2), 601i64);
        let handle = writer
            .save_segmentation(
                &seg,
                Path::new("/out/sub-1/cereb.nii"),
                &sample_bounds(),
                &VolumeGeometry::default(),
            )
            .unwrap();
        handle.wait().unwrap();

        let (_, saved) = io.get_labels(Path::new("/out/sub-1/cereb.nii")).unwrap();
        assert_eq!(saved.shape(), &[6, 6, 6]);
        assert_eq!(saved[[1, 2, 3]], 601);
        assert_eq!(saved[[2, 3, 4]], 601);
        // Outside the crop region everything is background.
        assert_eq!(saved[[0, 0, 0]], 0);
        assert_eq!(saved[[5, 5, 5]], 0);
        assert!(io
            .created_dirs()
            .contains(&PathBuf::from("/out/sub-1")));
    }

    #[test]
    fn test_oversized_label_is_rejected() {
        let (writer, _) = writer_with_io();
        let seg = Array3::from_elem((2, 2, 2), 40_000i64);
        let err = writer
            .save_segmentation(
                &seg,
                Path::new("/out/cereb.nii"),
                &sample_bounds(),
                &VolumeGeometry::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SegError::LabelSpace(_)));
    }

    #[test]
    fn test_save_statistics_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let stats_path = dir.path().join("cereb.stats");
        let (writer, _) = writer_with_io();
        let table = StatsTable {
            rows: vec![],
            voxel_volume: 1.0,
        };
        let handle = writer
            .save_statistics(
                table,
                &stats_path,
                Path::new("/out/cereb.nii"),
                None,
                Path::new("/config/target_lut.txt"),
            )
            .unwrap();
        handle.wait().unwrap();
        let content = std::fs::read_to_string(&stats_path).unwrap();
        assert!(content.contains("# NRows 0"));
    }
}
