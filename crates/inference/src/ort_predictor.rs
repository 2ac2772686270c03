//! ONNX Runtime backed plane predictor

use crate::PlanePredictor;
use cereb_seg_common::{Result, SegError};
use ndarray::Array4;
use ort::session::Session;
use ort::value::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::info;

/// Plane predictor running an ONNX checkpoint
///
/// The session is process-shared per plane; ONNX Runtime handles its own
/// intra-op threading, the mutex only satisfies the `run(&mut self)` API.
pub struct OrtPredictor {
    session: Mutex<Session>,
    output_name: String,
    num_classes: usize,
}

impl OrtPredictor {
    /// Load a predictor from a checkpoint file, or from the newest `.onnx`
    /// file when a directory is configured instead
    pub fn load(checkpoint: &Path, num_classes: usize) -> Result<Self> {
        let model_path = resolve_checkpoint(checkpoint)?;
        info!("Loading predictor checkpoint {}", model_path.display());

        let session = Session::builder()
            .map_err(|e| SegError::Inference(format!("ONNX session builder failed: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| {
                SegError::Inference(format!(
                    "failed to load checkpoint {}: {e}",
                    model_path.display()
                ))
            })?;

        let output_name = session
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .ok_or_else(|| {
                SegError::Inference(format!(
                    "checkpoint {} declares no outputs",
                    model_path.display()
                ))
            })?;

        Ok(Self {
            session: Mutex::new(session),
            output_name,
            num_classes,
        })
    }
}

impl PlanePredictor for OrtPredictor {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn infer(&self, batch: &Array4<f32>) -> Result<Array4<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|e| SegError::Inference(format!("failed to lock session mutex: {e}")))?;

        let input = Value::from_array(batch.clone())
            .map_err(|e| SegError::Inference(format!("failed to create input tensor: {e}")))?;

        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| SegError::Inference(format!("inference failed: {e}")))?;

        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| SegError::Inference(format!("failed to extract logits: {e}")))?;

        if shape.len() != 4 {
            return Err(SegError::Inference(format!(
                "unexpected logits rank {} (expected 4)",
                shape.len()
            )));
        }
        let dims = (
            shape[0] as usize,
            shape[1] as usize,
            shape[2] as usize,
            shape[3] as usize,
        );
        Array4::from_shape_vec(dims, data.to_vec())
            .map_err(|e| SegError::Inference(format!("logits shape mismatch: {e}")))
    }
}

/// A checkpoint path may be a file or a directory holding several exported
/// checkpoints; a directory resolves to its newest `.onnx` file.
fn resolve_checkpoint(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if path.is_dir() {
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let candidate = entry.path();
            if candidate.extension().and_then(|ext| ext.to_str()) != Some("onnx") {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if newest.as_ref().map_or(true, |(stamp, _)| modified > *stamp) {
                newest = Some((modified, candidate));
            }
        }
        return newest.map(|(_, candidate)| candidate).ok_or_else(|| {
            SegError::Config(format!(
                "no .onnx checkpoint found in directory {}",
                path.display()
            ))
        });
    }
    Err(SegError::Config(format!(
        "checkpoint path {} does not exist",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolve_checkpoint_prefers_newest_onnx() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("epoch_010.onnx");
        let newer = dir.path().join("epoch_020.onnx");
        let stray = dir.path().join("notes.txt");
        for path in [&older, &newer, &stray] {
            let mut file = fs::File::create(path).unwrap();
            file.write_all(b"x").unwrap();
        }
        // Ensure a strictly newer mtime on the second checkpoint.
        let later = SystemTime::now() + std::time::Duration::from_secs(60);
        let file = fs::File::options().write(true).open(&newer).unwrap();
        file.set_modified(later).unwrap();

        let resolved = resolve_checkpoint(dir.path()).unwrap();
        assert_eq!(resolved, newer);
    }

    #[test]
    fn test_resolve_checkpoint_missing_path_is_config_error() {
        let err = resolve_checkpoint(Path::new("/nonexistent/model.onnx")).unwrap_err();
        assert!(matches!(err, SegError::Config(_)));
    }

    #[test]
    fn test_resolve_checkpoint_empty_dir_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_checkpoint(dir.path()).unwrap_err();
        assert!(err.to_string().contains("no .onnx checkpoint"));
    }
}
