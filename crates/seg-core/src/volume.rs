//! Crop/re-expand transform and region-of-interest localization

use cereb_seg_common::{Result, SegError};
use ndarray::{s, Array3};
use serde::{Deserialize, Serialize};

/// Placement of a cropped patch inside its source volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiBounds {
    /// Source index of the patch origin, per axis (may be negative)
    pub offsets: [isize; 3],
    /// Patch shape
    pub shape: [usize; 3],
    /// Shape of the source volume the patch was cut from
    pub source_shape: [usize; 3],
}

impl RoiBounds {
    /// Offsets that re-expand a patch back into source space
    #[must_use]
    pub fn inverse_offsets(&self) -> [isize; 3] {
        [-self.offsets[0], -self.offsets[1], -self.offsets[2]]
    }
}

/// Copy `src` into a new volume of `target_shape`, where target index `t`
/// reads source index `t + offset`.
///
/// Positive offsets crop, negated offsets re-expand; voxels with no source
/// counterpart stay at the element default (background). Cropping by
/// `offsets` to `shape` and re-expanding by the negated offsets to the
/// source shape restores the original placement.
pub fn crop_transform<T>(src: &Array3<T>, offsets: [isize; 3], target_shape: [usize; 3]) -> Array3<T>
where
    T: Copy + Default,
{
    let mut out = Array3::from_elem(target_shape, T::default());
    let src_shape = src.shape();

    let mut t_start = [0usize; 3];
    let mut s_start = [0usize; 3];
    let mut span = [0usize; 3];
    for axis in 0..3 {
        let offset = offsets[axis];
        t_start[axis] = (-offset).max(0) as usize;
        s_start[axis] = offset.max(0) as usize;
        span[axis] = target_shape[axis]
            .saturating_sub(t_start[axis])
            .min(src_shape[axis].saturating_sub(s_start[axis]));
    }
    if span.iter().any(|&extent| extent == 0) {
        return out;
    }

    out.slice_mut(s![
        t_start[0]..t_start[0] + span[0],
        t_start[1]..t_start[1] + span[1],
        t_start[2]..t_start[2] + span[2]
    ])
    .assign(&src.slice(s![
        s_start[0]..s_start[0] + span[0],
        s_start[1]..s_start[1] + span[1],
        s_start[2]..s_start[2] + span[2]
    ]));
    out
}

/// Find the patch of `patch_size` centered on the voxels carrying any of
/// `target_labels` in an anatomical segmentation.
///
/// The patch is clamped into the volume; a segmentation without any target
/// label is a missing prerequisite (the upstream segmentation did not cover
/// the region of interest).
pub fn localize_roi(
    seg: &Array3<i64>,
    target_labels: &[i64],
    patch_size: [usize; 3],
) -> Result<RoiBounds> {
    let mut lo = [usize::MAX; 3];
    let mut hi = [0usize; 3];
    let mut found = false;
    for ((i, j, k), &label) in seg.indexed_iter() {
        if target_labels.contains(&label) {
            found = true;
            let idx = [i, j, k];
            for axis in 0..3 {
                lo[axis] = lo[axis].min(idx[axis]);
                hi[axis] = hi[axis].max(idx[axis]);
            }
        }
    }
    if !found {
        return Err(SegError::MissingPrerequisite {
            artifact: format!("labels {target_labels:?} in the anatomical segmentation"),
            upstream: "the whole-brain segmentation".to_string(),
        });
    }

    let source_shape = [seg.shape()[0], seg.shape()[1], seg.shape()[2]];
    let mut offsets = [0isize; 3];
    for axis in 0..3 {
        let extent = hi[axis] - lo[axis] + 1;
        if extent > patch_size[axis] {
            tracing::warn!(
                "region of interest extent {} exceeds patch size {} on axis {}",
                extent,
                patch_size[axis],
                axis
            );
        }
        let center = (lo[axis] + hi[axis]) / 2;
        let wanted = center as isize - (patch_size[axis] / 2) as isize;
        let max_offset = source_shape[axis] as isize - patch_size[axis] as isize;
        offsets[axis] = if max_offset <= 0 {
            // Patch bigger than the volume: center it around the volume.
            max_offset / 2
        } else {
            wanted.clamp(0, max_offset)
        };
    }

    Ok(RoiBounds {
        offsets,
        shape: patch_size,
        source_shape,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_crop_then_expand_round_trip() {
        let mut src = Array3::<i64>::zeros((8, 8, 8));
        for i in 2..5 {
            for j in 3..6 {
                for k in 1..4 {
                    src[[i, j, k]] = (i * 100 + j * 10 + k) as i64;
                }
            }
        }
        let offsets = [1isize, 2, 0];
        let cropped = crop_transform(&src, offsets, [5, 5, 5]);
        let expanded = crop_transform(&cropped, [-1, -2, 0], [8, 8, 8]);

        assert_eq!(expanded.shape(), src.shape());
        for ((i, j, k), &value) in expanded.indexed_iter() {
            let inside = (1..6).contains(&i) && (2..7).contains(&j) && k < 5;
            if inside {
                assert_eq!(value, src[[i, j, k]]);
            } else {
                assert_eq!(value, 0, "voxel outside the crop must be background");
            }
        }
    }

    #[test]
    fn test_crop_with_negative_offsets_pads() {
        let src = Array3::<f32>::from_elem((4, 4, 4), 1.0);
        let out = crop_transform(&src, [-2, 0, 0], [4, 4, 4]);
        assert_eq!(out[[0, 0, 0]], 0.0);
        assert_eq!(out[[1, 0, 0]], 0.0);
        assert_eq!(out[[2, 0, 0]], 1.0);
    }

    #[test]
    fn test_localize_roi_centers_patch() {
        let mut seg = Array3::<i64>::zeros((32, 32, 32));
        seg[[16, 16, 16]] = 7;
        seg[[18, 17, 16]] = 47;
        let bounds = localize_roi(&seg, &[7, 8, 46, 47], [8, 8, 8]).unwrap();
        assert_eq!(bounds.shape, [8, 8, 8]);
        assert_eq!(bounds.source_shape, [32, 32, 32]);
        // Patch contains the ROI.
        for axis in 0..3 {
            assert!(bounds.offsets[axis] >= 0);
            assert!(bounds.offsets[axis] + 8 <= 32);
        }
        assert!(bounds.offsets[0] <= 16 && 16 < bounds.offsets[0] + 8);
        assert!(bounds.offsets[0] <= 18 && 18 < bounds.offsets[0] + 8);
    }

    #[test]
    fn test_localize_roi_clamps_to_volume() {
        let mut seg = Array3::<i64>::zeros((16, 16, 16));
        seg[[0, 0, 0]] = 7;
        let bounds = localize_roi(&seg, &[7], [8, 8, 8]).unwrap();
        assert_eq!(bounds.offsets, [0, 0, 0]);
    }

    #[test]
    fn test_localize_roi_without_labels_is_prerequisite_error() {
        let seg = Array3::<i64>::zeros((8, 8, 8));
        let err = localize_roi(&seg, &[7, 8], [4, 4, 4]).unwrap_err();
        assert!(matches!(err, SegError::MissingPrerequisite { .. }));
    }
}
