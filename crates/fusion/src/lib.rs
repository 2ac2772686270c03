//! View fusion and label remapping
//!
//! Reconciles the three per-plane prediction stacks into a single labeled
//! volume in the target nomenclature:
//!
//! 1. Each plane's batch stack is concatenated along the slab axis and
//!    permuted into the canonical (sagittal, coronal, axial, channel)
//!    layout.
//! 2. Sagittal logits are expanded from their reduced class set (left/right
//!    lateral symmetry) into the full class space.
//! 3. Per-voxel class scores are fused with the fixed view weighting and the
//!    winning channel index becomes the predicted class.
//! 4. Predicted ids are remapped into the target label space.

use cereb_seg_common::{Plane, Result, SegError};
use cereb_seg_core::{ChannelMapDirection, LabelMap};
use ndarray::{concatenate, Array3, Array4, ArrayView1, Axis};
use tracing::debug;

/// Weight applied to the axial and coronal views
pub const AXIAL_CORONAL_WEIGHT: f32 = 0.4;
/// Weight applied to the (less reliable) sagittal view
pub const SAGITTAL_WEIGHT: f32 = 0.2;

/// Per-plane prediction stacks, one logit tensor per processed batch
pub struct PlaneLogits {
    pub axial: Vec<Array4<f32>>,
    pub coronal: Vec<Array4<f32>>,
    pub sagittal: Vec<Array4<f32>>,
}

/// Slab-axis batches arrive as (N, C, H, W) with plane-specific spatial
/// meaning; this table permutes each into (sagittal, coronal, axial, C).
fn canonical_permutation(plane: Plane) -> [usize; 4] {
    match plane {
        // N = axial slab, H = sagittal, W = coronal
        Plane::Axial => [2, 3, 0, 1],
        // N = coronal slab, H = sagittal, W = axial
        Plane::Coronal => [2, 0, 3, 1],
        // N = sagittal slab, H = coronal, W = axial
        Plane::Sagittal => [0, 2, 3, 1],
    }
}

fn canonicalize(
    plane: Plane,
    stacks: Vec<Array4<f32>>,
    sagittal_map: Option<&LabelMap<i64, i64>>,
) -> Result<Array4<f32>> {
    if stacks.is_empty() {
        return Err(SegError::Inference(format!(
            "no prediction batches for the {plane} plane"
        )));
    }
    let views: Vec<_> = stacks.iter().map(|stack| stack.view()).collect();
    let mut volume = concatenate(Axis(0), &views).map_err(|e| {
        SegError::Inference(format!("cannot concatenate {plane} batches: {e}"))
    })?;

    if let Some(map) = sagittal_map {
        volume = map.map_logit_channels(&volume, 1, ChannelMapDirection::Expand)?;
    }

    let canonical = volume.permuted_axes(canonical_permutation(plane));
    Ok(canonical.as_standard_layout().to_owned())
}

/// Fuse per-voxel class scores across the three views:
/// `0.4 * (axial + coronal) + 0.2 * sagittal`.
///
/// The weighting reflects the relative reliability of each view and is a
/// fixed design constant; changing it breaks output parity.
#[must_use]
pub fn aggregate_views(
    axial: &Array4<f32>,
    coronal: &Array4<f32>,
    sagittal: &Array4<f32>,
) -> Array4<f32> {
    (axial + coronal) * AXIAL_CORONAL_WEIGHT + sagittal * SAGITTAL_WEIGHT
}

fn argmax_lowest(scores: ArrayView1<'_, f32>) -> i64 {
    let mut best = 0usize;
    let mut best_score = scores[0];
    for (idx, &score) in scores.iter().enumerate().skip(1) {
        // Strict comparison keeps the lowest index on exact ties.
        if score > best_score {
            best = idx;
            best_score = score;
        }
    }
    best as i64
}

/// Fuse the three per-plane prediction stacks into one labeled volume in the
/// target nomenclature.
///
/// `sagittal_map` carries full-class id -> reduced sagittal class id;
/// `to_target` is the precomposed native-id -> target-id chain.
pub fn fuse(
    logits: PlaneLogits,
    sagittal_map: &LabelMap<i64, i64>,
    to_target: &LabelMap<i64, i64>,
) -> Result<Array3<i64>> {
    let axial = canonicalize(Plane::Axial, logits.axial, None)?;
    let coronal = canonicalize(Plane::Coronal, logits.coronal, None)?;
    let sagittal = canonicalize(Plane::Sagittal, logits.sagittal, Some(sagittal_map))?;

    if axial.shape() != coronal.shape() || axial.shape() != sagittal.shape() {
        return Err(SegError::Inference(format!(
            "per-plane prediction volumes disagree: axial {:?}, coronal {:?}, sagittal {:?}",
            axial.shape(),
            coronal.shape(),
            sagittal.shape()
        )));
    }
    if axial.shape()[3] == 0 {
        return Err(SegError::Inference("empty class axis in fusion".to_string()));
    }
    debug!("fusing views of shape {:?}", axial.shape());

    let fused = aggregate_views(&axial, &coronal, &sagittal);
    let native_labels = fused.map_axis(Axis(3), argmax_lowest);
    to_target.apply_volume(&native_labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn identity_map(classes: i64) -> LabelMap<i64, i64> {
        LabelMap::from_pairs((0..classes).map(|id| (id, id))).unwrap()
    }

    /// One batch of shape (slabs, classes, h, w) filled with a constant per
    /// class.
    fn constant_logits(
        slabs: usize,
        per_class: &[f32],
        h: usize,
        w: usize,
    ) -> Vec<Array4<f32>> {
        let classes = per_class.len();
        vec![Array4::from_shape_fn(
            (slabs, classes, h, w),
            |(_, c, _, _)| per_class[c],
        )]
    }

    #[test]
    fn test_aggregate_views_is_exact() {
        let axial = Array4::from_elem((1, 2, 1, 1), 0.3f32);
        let coronal = Array4::from_elem((1, 2, 1, 1), 0.5f32);
        let sagittal = Array4::from_elem((1, 2, 1, 1), 0.7f32);
        let fused = aggregate_views(&axial, &coronal, &sagittal);
        let expected = 0.4f32 * (0.3 + 0.5) + 0.2 * 0.7;
        let got = fused[[0, 0, 0, 0]];
        assert!(
            (got - expected).abs() <= 1e-5 * expected.abs(),
            "got {got}, expected {expected}"
        );
    }

    #[test]
    fn test_argmax_prefers_lowest_index_on_ties() {
        let scores = ndarray::array![1.0f32, 3.0, 3.0, 2.0];
        assert_eq!(argmax_lowest(scores.view()), 1);
        let all_equal = ndarray::array![0.5f32, 0.5, 0.5];
        assert_eq!(argmax_lowest(all_equal.view()), 0);
    }

    #[test]
    fn test_fuse_picks_weighted_winner() {
        // Class 1 wins on axial+coronal, class 2 only on sagittal; the
        // sagittal view alone must not override the weighted sum.
        let logits = PlaneLogits {
            axial: constant_logits(2, &[0.0, 1.0, 0.0], 2, 2),
            coronal: constant_logits(2, &[0.0, 1.0, 0.0], 2, 2),
            sagittal: constant_logits(2, &[0.0, 0.0, 5.0], 2, 2),
        };
        let sagittal_map = identity_map(3);
        let to_target =
            LabelMap::from_pairs(vec![(0i64, 0i64), (1, 601), (2, 602)]).unwrap();
        let seg = fuse(logits, &sagittal_map, &to_target).unwrap();
        assert_eq!(seg.shape(), &[2, 2, 2]);
        // 0.4*(1+1) = 0.8 for class 1 vs 0.2*5 = 1.0 for class 2.
        assert!(seg.iter().all(|&label| label == 602));
    }

    #[test]
    fn test_fuse_expands_sagittal_classes() {
        // Sagittal predicts 2 reduced classes; full space has 3 where
        // classes 1 and 2 share sagittal class 1.
        let mut sagittal = Array4::zeros((2, 2, 2, 2));
        sagittal.index_axis_mut(Axis(1), 1).fill(9.0);
        let logits = PlaneLogits {
            axial: constant_logits(2, &[0.0, 0.4, 0.5], 2, 2),
            coronal: constant_logits(2, &[0.0, 0.4, 0.5], 2, 2),
            sagittal: vec![sagittal],
        };
        let sagittal_map =
            LabelMap::from_pairs(vec![(0i64, 0i64), (1, 1), (2, 1)]).unwrap();
        let to_target = identity_map(3);
        let seg = fuse(logits, &sagittal_map, &to_target).unwrap();
        // Classes 1 and 2 both receive the expanded sagittal boost; class 2
        // wins through its axial/coronal margin.
        assert!(seg.iter().all(|&label| label == 2));
    }

    #[test]
    fn test_fuse_permutes_each_plane_into_canonical_space() {
        // 3x4x5 volume (sagittal x coronal x axial), 2 classes. Mark one
        // canonical voxel (s=2, c=1, a=3) as class 1 in every plane's own
        // layout; fusion must agree on that voxel from all three views.
        let (s, c, a) = (3usize, 4usize, 5usize);
        let mark = (2usize, 1usize, 3usize);
        let mut axial = Array4::zeros((a, 2, s, c));
        axial[[mark.2, 1, mark.0, mark.1]] = 1.0;
        let mut coronal = Array4::zeros((c, 2, s, a));
        coronal[[mark.1, 1, mark.0, mark.2]] = 1.0;
        let mut sagittal = Array4::zeros((s, 2, c, a));
        sagittal[[mark.0, 1, mark.1, mark.2]] = 1.0;

        let logits = PlaneLogits {
            axial: vec![axial],
            coronal: vec![coronal],
            sagittal: vec![sagittal],
        };
        let seg = fuse(logits, &identity_map(2), &identity_map(2)).unwrap();
        assert_eq!(seg.shape(), &[s, c, a]);
        for ((i, j, k), &label) in seg.indexed_iter() {
            if (i, j, k) == mark {
                assert_eq!(label, 1);
            } else {
                assert_eq!(label, 0);
            }
        }
    }

    #[test]
    fn test_fuse_rejects_mismatched_plane_shapes() {
        let logits = PlaneLogits {
            axial: constant_logits(2, &[0.0, 1.0], 2, 2),
            coronal: constant_logits(3, &[0.0, 1.0], 2, 2),
            sagittal: constant_logits(2, &[0.0, 1.0], 2, 2),
        };
        let map = identity_map(2);
        assert!(fuse(logits, &map, &map).is_err());
    }
}
