//! Coordinate-convention adapter between native and predictor orientations
//!
//! Input volumes arrive in the LIA orientation of the upstream whole-brain
//! pipeline; the predictors are trained on RAS+ slices. Each plane needs a
//! fixed set of in-plane axis flips to move between the two conventions.
//! The flips are involutions, so the same table converts in both
//! directions; two named entry points are kept so call sites read as
//! intent.

use cereb_seg_common::Plane;
use ndarray::{Array4, Axis};

/// Spatial axes of an (N, C, H, W) slice batch flipped for each plane
fn flipped_axes(plane: Plane) -> &'static [usize] {
    match plane {
        Plane::Axial => &[2, 3],
        Plane::Coronal => &[2],
        Plane::Sagittal => &[3],
    }
}

fn flip(plane: Plane, batch: Array4<f32>) -> Array4<f32> {
    let mut batch = batch;
    for &axis in flipped_axes(plane) {
        batch.invert_axis(Axis(axis));
    }
    // The inference backend needs contiguous input.
    batch.as_standard_layout().to_owned()
}

/// Adapt a native-orientation slice batch to the predictor convention
pub fn slice_to_ras(plane: Plane, batch: Array4<f32>) -> Array4<f32> {
    flip(plane, batch)
}

/// Adapt predictor-convention logits back to the native orientation
pub fn slice_from_ras(plane: Plane, batch: Array4<f32>) -> Array4<f32> {
    flip(plane, batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cereb_seg_common::PLANES;
    use ndarray::Array4;

    #[test]
    fn test_round_trip_is_identity() {
        let batch = Array4::from_shape_fn((2, 3, 4, 5), |(n, c, h, w)| {
            (n * 1000 + c * 100 + h * 10 + w) as f32
        });
        for plane in PLANES {
            let there = slice_to_ras(plane, batch.clone());
            let back = slice_from_ras(plane, there);
            assert_eq!(back, batch, "{plane} adapter must be an involution");
        }
    }

    #[test]
    fn test_axial_flips_both_spatial_axes() {
        let batch = Array4::from_shape_fn((1, 1, 2, 2), |(_, _, h, w)| (h * 2 + w) as f32);
        let flipped = slice_to_ras(Plane::Axial, batch);
        assert_eq!(flipped[[0, 0, 0, 0]], 3.0);
        assert_eq!(flipped[[0, 0, 1, 1]], 0.0);
    }

    #[test]
    fn test_channel_axis_is_untouched() {
        let batch = Array4::from_shape_fn((1, 3, 2, 2), |(_, c, _, _)| c as f32);
        for plane in PLANES {
            let converted = slice_to_ras(plane, batch.clone());
            for c in 0..3 {
                assert_eq!(converted[[0, c, 0, 0]], c as f32);
            }
        }
    }
}
