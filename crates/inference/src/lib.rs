//! Plane predictor set for cerebellum sub-segmentation
//!
//! Three view-specific predictors (axial, coronal, sagittal) are loaded in
//! parallel at startup and then shared read-only across all subjects. Slice
//! batches pass through the orientation adapter before inference and the raw
//! logits are adapted back immediately after, so everything downstream stays
//! in the native convention. An out-of-memory condition on the compute
//! device is translated into an actionable error at the single dispatch
//! site and re-raised.

pub mod orientation;
pub mod ort_predictor;

use cereb_seg_common::{Plane, Result, SegError, PLANES};
use cereb_seg_core::{ExecutorPool, TaskHandle};
use ndarray::Array4;
use tracing::debug;

pub use ort_predictor::OrtPredictor;

/// A view-specific predictor: slice batches in, per-class logits out
///
/// Implementations must be shareable across subjects without locking from
/// the caller's perspective (interior synchronization is theirs to manage).
pub trait PlanePredictor: Send + Sync {
    /// Number of classes in this predictor's output channel axis
    fn num_classes(&self) -> usize;

    /// Run inference on an (N, C, H, W) batch, returning (N, classes, H, W)
    /// logits
    fn infer(&self, batch: &Array4<f32>) -> Result<Array4<f32>>;
}

/// The three per-plane predictors, loaded before the first subject
pub struct PredictorSet {
    axial: Box<dyn PlanePredictor>,
    coronal: Box<dyn PlanePredictor>,
    sagittal: Box<dyn PlanePredictor>,
}

impl PredictorSet {
    /// Load all three predictors, parallelized across planes via the pool
    pub fn load<F>(pool: &ExecutorPool, load_one: F) -> Result<Self>
    where
        F: Fn(Plane) -> Result<Box<dyn PlanePredictor>> + Send + Sync + 'static,
    {
        let handles = pool.map(load_one, PLANES);
        let mut loaded = handles
            .into_iter()
            .map(TaskHandle::wait)
            .collect::<Result<Vec<_>>>()?;
        // `map` preserves PLANES order: axial, coronal, sagittal.
        let sagittal = loaded.pop().ok_or_else(missing_predictor)?;
        let coronal = loaded.pop().ok_or_else(missing_predictor)?;
        let axial = loaded.pop().ok_or_else(missing_predictor)?;
        Ok(Self {
            axial,
            coronal,
            sagittal,
        })
    }

    #[must_use]
    pub fn get(&self, plane: Plane) -> &dyn PlanePredictor {
        match plane {
            Plane::Axial => self.axial.as_ref(),
            Plane::Coronal => self.coronal.as_ref(),
            Plane::Sagittal => self.sagittal.as_ref(),
        }
    }

    /// Predict one plane over a sequence of slice batches.
    ///
    /// Each output batch is moved into the returned stack as soon as it is
    /// produced; planes are processed one at a time by the caller, which
    /// bounds peak memory to one plane's logits plus one in-flight batch.
    pub fn predict(&self, plane: Plane, batches: Vec<Array4<f32>>) -> Result<Vec<Array4<f32>>> {
        let predictor = self.get(plane);
        let mut stacks = Vec::with_capacity(batches.len());
        for (batch_idx, batch) in batches.into_iter().enumerate() {
            let slabs = batch.shape()[0];
            let adapted = orientation::slice_to_ras(plane, batch);
            let logits = predictor
                .infer(&adapted)
                .map_err(|e| translate_resource_exhaustion(plane, e))?;
            if logits.shape()[1] != predictor.num_classes() {
                return Err(SegError::Inference(format!(
                    "{plane} predictor returned {} classes, expected {}",
                    logits.shape()[1],
                    predictor.num_classes()
                )));
            }
            debug!(
                "{} batch {}: {} slabs -> logits {:?}",
                plane,
                batch_idx,
                slabs,
                logits.shape()
            );
            stacks.push(orientation::slice_from_ras(plane, logits));
        }
        Ok(stacks)
    }
}

fn missing_predictor() -> SegError {
    SegError::Inference("predictor loading returned too few models".to_string())
}

/// Turn an allocation failure from the compute backend into a structured
/// resource-exhaustion error with remediation guidance; other errors pass
/// through unchanged.
fn translate_resource_exhaustion(plane: Plane, err: SegError) -> SegError {
    let detail = err.to_string();
    let lowered = detail.to_lowercase();
    let looks_like_oom = lowered.contains("out of memory")
        || lowered.contains("outofmemory")
        || lowered.contains("failed to allocate")
        || lowered.contains("cuda error 2");
    if looks_like_oom {
        SegError::ResourceExhausted {
            stage: format!("{plane} inference"),
            detail,
            remedy: "Reduce --batch-size or the patch size, or run on a device with more \
                     memory (e.g. --device cpu)"
                .to_string(),
        }
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cereb_seg_core::Parallelism;
    use ndarray::Array4;

    /// Deterministic predictor: logit of class c is c + mean(input)
    struct StubPredictor {
        classes: usize,
    }

    impl PlanePredictor for StubPredictor {
        fn num_classes(&self) -> usize {
            self.classes
        }

        fn infer(&self, batch: &Array4<f32>) -> Result<Array4<f32>> {
            let (n, _, h, w) = batch.dim();
            let mean = batch.mean().unwrap_or(0.0);
            Ok(Array4::from_shape_fn((n, self.classes, h, w), |(_, c, _, _)| {
                c as f32 + mean
            }))
        }
    }

    struct OomPredictor;

    impl PlanePredictor for OomPredictor {
        fn num_classes(&self) -> usize {
            4
        }

        fn infer(&self, _batch: &Array4<f32>) -> Result<Array4<f32>> {
            Err(SegError::Inference(
                "backend failed to allocate 2.0 GiB".to_string(),
            ))
        }
    }

    fn stub_set() -> PredictorSet {
        let pool = ExecutorPool::new(Parallelism::Inline);
        PredictorSet::load(&pool, |plane| {
            let classes = if plane == Plane::Sagittal { 3 } else { 4 };
            Ok(Box::new(StubPredictor { classes }) as Box<dyn PlanePredictor>)
        })
        .unwrap()
    }

    #[test]
    fn test_load_assigns_planes_in_order() {
        let set = stub_set();
        assert_eq!(set.get(Plane::Axial).num_classes(), 4);
        assert_eq!(set.get(Plane::Coronal).num_classes(), 4);
        assert_eq!(set.get(Plane::Sagittal).num_classes(), 3);
    }

    #[test]
    fn test_predict_keeps_batch_count_and_shape() {
        let set = stub_set();
        let batches = vec![Array4::zeros((2, 3, 6, 6)), Array4::zeros((1, 3, 6, 6))];
        let stacks = set.predict(Plane::Coronal, batches).unwrap();
        assert_eq!(stacks.len(), 2);
        assert_eq!(stacks[0].shape(), &[2, 4, 6, 6]);
        assert_eq!(stacks[1].shape(), &[1, 4, 6, 6]);
    }

    #[test]
    fn test_allocation_failure_becomes_resource_exhausted() {
        let pool = ExecutorPool::new(Parallelism::Inline);
        let set = PredictorSet::load(&pool, |_| {
            Ok(Box::new(OomPredictor) as Box<dyn PlanePredictor>)
        })
        .unwrap();
        let err = set
            .predict(Plane::Axial, vec![Array4::zeros((1, 3, 4, 4))])
            .unwrap_err();
        match err {
            SegError::ResourceExhausted { stage, remedy, .. } => {
                assert!(stage.contains("axial"));
                assert!(remedy.contains("batch-size"));
            }
            other => panic!("expected ResourceExhausted, got {other}"),
        }
    }
}
