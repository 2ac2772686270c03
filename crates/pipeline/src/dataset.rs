//! Localized dataset: the cropped region of interest plus everything needed
//! to place predictions back into full-volume space

use crate::config::PipelineConfig;
use cereb_seg_common::{Plane, Result, SegError, VolumeGeometry};
use cereb_seg_core::{crop_transform, localize_roi, RoiBounds};
use ndarray::{s, Array3, Array4, Axis};

/// Cropped volume for one subject, in the canonical
/// (sagittal, coronal, axial) axis order
#[derive(Debug)]
pub struct LocalizedDataset {
    cropped: Array3<f32>,
    /// Crop placement inside the source volume
    pub bounds: RoiBounds,
    /// Geometry of the source volume, reused for output files
    pub geometry: VolumeGeometry,
    batch_size: usize,
    slice_thickness: usize,
}

impl LocalizedDataset {
    /// Crop `volume` around the cerebellum found in `brain_seg` and prepare
    /// it for slab batching.
    ///
    /// Intensities are scaled to [0, 1] by the crop maximum.
    pub fn new(
        volume: &Array3<f32>,
        geometry: VolumeGeometry,
        brain_seg: &Array3<i64>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        if volume.shape() != brain_seg.shape() {
            return Err(SegError::Config(format!(
                "conformed volume {:?} and anatomical segmentation {:?} disagree in shape",
                volume.shape(),
                brain_seg.shape()
            )));
        }
        let bounds = localize_roi(brain_seg, &config.localizer_labels, config.patch_size)?;
        let mut cropped = crop_transform(volume, bounds.offsets, bounds.shape);

        let max = cropped.fold(0.0f32, |acc, &value| acc.max(value));
        if max > 0.0 {
            cropped.mapv_inplace(|value| value / max);
        }

        Ok(Self {
            cropped,
            bounds,
            geometry,
            batch_size: config.batch_size,
            slice_thickness: config.slice_thickness,
        })
    }

    #[must_use]
    pub fn shape(&self) -> [usize; 3] {
        let shape = self.cropped.shape();
        [shape[0], shape[1], shape[2]]
    }

    /// Thick-slice batches along the given plane's primary axis.
    ///
    /// Each slab carries `slice_thickness` neighboring slices as channels,
    /// clamped at the volume border; slabs are chunked into `batch_size`
    /// groups. The spatial layout matches what the fusion permutation
    /// tables expect per plane.
    #[must_use]
    pub fn plane_batches(&self, plane: Plane) -> Vec<Array4<f32>> {
        let primary = match plane {
            Plane::Sagittal => 0,
            Plane::Coronal => 1,
            Plane::Axial => 2,
        };
        let shape = self.shape();
        let slabs = shape[primary];
        let (height, width) = match plane {
            Plane::Sagittal => (shape[1], shape[2]),
            Plane::Coronal => (shape[0], shape[2]),
            Plane::Axial => (shape[0], shape[1]),
        };
        let half = self.slice_thickness / 2;

        let mut batches = Vec::with_capacity(slabs.div_ceil(self.batch_size));
        let mut start = 0;
        while start < slabs {
            let len = (slabs - start).min(self.batch_size);
            let mut batch = Array4::zeros((len, self.slice_thickness, height, width));
            for slab in 0..len {
                for channel in 0..self.slice_thickness {
                    let source = (start + slab + channel)
                        .saturating_sub(half)
                        .min(slabs - 1);
                    batch
                        .slice_mut(s![slab, channel, .., ..])
                        .assign(&self.cropped.index_axis(Axis(primary), source));
                }
            }
            batches.push(batch);
            start += len;
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cereb_seg_common::PLANES;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            batch_size: 4,
            patch_size: [6, 8, 10],
            slice_thickness: 3,
            localizer_labels: vec![7],
            ..PipelineConfig::default()
        }
    }

    fn dataset() -> LocalizedDataset {
        let volume = Array3::from_shape_fn((16, 16, 16), |(i, j, k)| (i + j + k) as f32);
        let mut seg = Array3::<i64>::zeros((16, 16, 16));
        seg[[8, 8, 8]] = 7;
        LocalizedDataset::new(&volume, VolumeGeometry::default(), &seg, &test_config()).unwrap()
    }

    #[test]
    fn test_crop_has_patch_shape() {
        let dataset = dataset();
        assert_eq!(dataset.shape(), [6, 8, 10]);
    }

    #[test]
    fn test_intensities_scaled_to_unit_range() {
        let dataset = dataset();
        let max = dataset.cropped.fold(0.0f32, |acc, &v| acc.max(v));
        assert!((max - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_batch_shapes_per_plane() {
        let dataset = dataset();
        // Sagittal: 6 slabs of (c=8, a=10) -> two batches (4 + 2).
        let sagittal = dataset.plane_batches(Plane::Sagittal);
        assert_eq!(sagittal.len(), 2);
        assert_eq!(sagittal[0].shape(), &[4, 3, 8, 10]);
        assert_eq!(sagittal[1].shape(), &[2, 3, 8, 10]);

        // Coronal: 8 slabs of (s=6, a=10).
        let coronal = dataset.plane_batches(Plane::Coronal);
        assert_eq!(coronal.len(), 2);
        assert_eq!(coronal[0].shape(), &[4, 3, 6, 10]);

        // Axial: 10 slabs of (s=6, c=8).
        let axial = dataset.plane_batches(Plane::Axial);
        assert_eq!(axial.len(), 3);
        assert_eq!(axial[2].shape(), &[2, 3, 6, 8]);
    }

    #[test]
    fn test_slab_count_covers_primary_axis() {
        let dataset = dataset();
        for plane in PLANES {
            let total: usize = dataset
                .plane_batches(plane)
                .iter()
                .map(|batch| batch.shape()[0])
                .sum();
            let expected = match plane {
                Plane::Sagittal => 6,
                Plane::Coronal => 8,
                Plane::Axial => 10,
            };
            assert_eq!(total, expected);
        }
    }

    #[test]
    fn test_center_channel_matches_slice_and_border_clamps() {
        let dataset = dataset();
        let batches = dataset.plane_batches(Plane::Sagittal);
        let first = &batches[0];
        // Center channel of slab 2 is sagittal slice 2.
        let expected = dataset.cropped.index_axis(Axis(0), 2);
        assert_eq!(first.slice(s![2, 1, .., ..]), expected);
        // Leading channel of slab 0 clamps to slice 0.
        let clamped = dataset.cropped.index_axis(Axis(0), 0);
        assert_eq!(first.slice(s![0, 0, .., ..]), clamped);
    }

    #[test]
    fn test_shape_mismatch_is_config_error() {
        let volume = Array3::zeros((8, 8, 8));
        let seg = Array3::<i64>::zeros((9, 8, 8));
        let err = LocalizedDataset::new(
            &volume,
            VolumeGeometry::default(),
            &seg,
            &test_config(),
        )
        .unwrap_err();
        assert!(matches!(err, SegError::Config(_)));
    }
}
