//! Volume I/O seam
//!
//! The pipeline consumes volumes through the [`VolumeIo`] trait so the
//! orchestration core stays independent of the on-disk format. Two backends
//! ship: [`crate::nifti_io::NiftiVolumeIo`] for real data and
//! [`MemVolumeIo`], an in-memory store used by the tests (notably the
//! pooled-vs-inline equivalence property, which compares whole runs without
//! touching the filesystem).

use cereb_seg_common::{Result, SegError, VolumeGeometry};
use ndarray::Array3;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Volume access used by the loader and the writer
pub trait VolumeIo: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// Load a scalar volume with its geometry
    fn load(&self, path: &Path) -> Result<(VolumeGeometry, Array3<f32>)>;

    /// Persist a scalar volume
    fn save(&self, path: &Path, geometry: &VolumeGeometry, data: &Array3<f32>) -> Result<()>;

    /// Persist a label volume with 16-bit integer encoding
    fn save_labels(&self, path: &Path, geometry: &VolumeGeometry, data: &Array3<i16>)
        -> Result<()>;

    /// Whether the file is already a 1mm-conformed volume. Header inspection
    /// only, the voxel data is not scanned.
    fn is_conformed(&self, path: &Path) -> Result<bool>;

    /// Load a volume and resample it to the conformed 1mm grid
    fn conform(&self, path: &Path) -> Result<(VolumeGeometry, Array3<f32>)>;

    /// Create a directory (and parents) for an output path
    fn create_dir_all(&self, path: &Path) -> Result<()>;
}

/// Nearest-neighbour resample onto an isotropic 1mm grid.
///
/// Already-conformed volumes are returned unchanged.
pub fn resample_nearest_1mm(
    geometry: &VolumeGeometry,
    data: &Array3<f32>,
) -> (VolumeGeometry, Array3<f32>) {
    if geometry.is_isotropic_1mm(1e-3) {
        return (geometry.clone(), data.clone());
    }

    let voxel = geometry.voxel_sizes;
    let shape = data.shape();
    let target = [
        ((shape[0] as f32) * voxel[0]).round().max(1.0) as usize,
        ((shape[1] as f32) * voxel[1]).round().max(1.0) as usize,
        ((shape[2] as f32) * voxel[2]).round().max(1.0) as usize,
    ];
    let resampled = Array3::from_shape_fn(target, |(i, j, k)| {
        let out_idx = [i, j, k];
        let mut src_idx = [0usize; 3];
        for axis in 0..3 {
            let source = ((out_idx[axis] as f32 + 0.5) / voxel[axis] - 0.5).round();
            src_idx[axis] = (source.max(0.0) as usize).min(shape[axis] - 1);
        }
        data[[src_idx[0], src_idx[1], src_idx[2]]]
    });

    let mut affine = geometry.affine;
    for row in &mut affine {
        for (column, row_value) in row.iter_mut().take(3).enumerate() {
            *row_value /= voxel[column];
        }
    }
    (
        VolumeGeometry {
            affine,
            voxel_sizes: [1.0, 1.0, 1.0],
        },
        resampled,
    )
}

enum StoredData {
    F32(Array3<f32>),
    I16(Array3<i16>),
}

struct StoredEntry {
    geometry: VolumeGeometry,
    data: StoredData,
}

/// In-memory volume store
#[derive(Default)]
pub struct MemVolumeIo {
    store: Mutex<HashMap<PathBuf, StoredEntry>>,
    dirs: Mutex<HashSet<PathBuf>>,
}

impl MemVolumeIo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a scalar volume
    pub fn insert(&self, path: &Path, geometry: VolumeGeometry, data: Array3<f32>) {
        self.store.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(
            path.to_path_buf(),
            StoredEntry {
                geometry,
                data: StoredData::F32(data),
            },
        );
    }

    /// Retrieve a stored scalar volume (label volumes are widened)
    #[must_use]
    pub fn get_f32(&self, path: &Path) -> Option<(VolumeGeometry, Array3<f32>)> {
        let store = self.store.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        store.get(path).map(|entry| {
            let data = match &entry.data {
                StoredData::F32(data) => data.clone(),
                StoredData::I16(data) => data.mapv(f32::from),
            };
            (entry.geometry.clone(), data)
        })
    }

    /// Retrieve a stored label volume, if one was saved at this path
    #[must_use]
    pub fn get_labels(&self, path: &Path) -> Option<(VolumeGeometry, Array3<i16>)> {
        let store = self.store.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        store.get(path).and_then(|entry| match &entry.data {
            StoredData::I16(data) => Some((entry.geometry.clone(), data.clone())),
            StoredData::F32(_) => None,
        })
    }

    /// Directories recorded by `create_dir_all`
    #[must_use]
    pub fn created_dirs(&self) -> Vec<PathBuf> {
        let dirs = self.dirs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        dirs.iter().cloned().collect()
    }
}

impl VolumeIo for MemVolumeIo {
    fn exists(&self, path: &Path) -> bool {
        self.store.lock().unwrap_or_else(std::sync::PoisonError::into_inner).contains_key(path)
    }

    fn load(&self, path: &Path) -> Result<(VolumeGeometry, Array3<f32>)> {
        self.get_f32(path).ok_or_else(|| {
            SegError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no volume stored at {}", path.display()),
            ))
        })
    }

    fn save(&self, path: &Path, geometry: &VolumeGeometry, data: &Array3<f32>) -> Result<()> {
        self.insert(path, geometry.clone(), data.clone());
        Ok(())
    }

    fn save_labels(
        &self,
        path: &Path,
        geometry: &VolumeGeometry,
        data: &Array3<i16>,
    ) -> Result<()> {
        self.store.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(
            path.to_path_buf(),
            StoredEntry {
                geometry: geometry.clone(),
                data: StoredData::I16(data.clone()),
            },
        );
        Ok(())
    }

    fn is_conformed(&self, path: &Path) -> Result<bool> {
        let store = self.store.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = store.get(path).ok_or_else(|| {
            SegError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no volume stored at {}", path.display()),
            ))
        })?;
        Ok(entry.geometry.is_isotropic_1mm(1e-3))
    }

    fn conform(&self, path: &Path) -> Result<(VolumeGeometry, Array3<f32>)> {
        let (geometry, data) = self.load(path)?;
        Ok(resample_nearest_1mm(&geometry, &data))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.dirs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(path.to_path_buf());
        Ok(())
    }
}
