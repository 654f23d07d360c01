// src/weight_io.rs

use crate::common::{sorted_keys, WeightSet};
use crate::keys;
use half::{bf16, f16};
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::{SafeTensorError, SafeTensors};
use std::path::Path;

#[derive(Debug)]
pub enum WeightIoError {
    Io(std::io::Error),
    SafeTensors(SafeTensorError),
    UnsupportedDtype(String),
    Shape(String),
}

impl std::fmt::Display for WeightIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WeightIoError::Io(e) => write!(f, "IO error: {}", e),
            WeightIoError::SafeTensors(e) => write!(f, "SafeTensors error: {}", e),
            WeightIoError::UnsupportedDtype(s) => write!(f, "Unsupported dtype: {}", s),
            WeightIoError::Shape(s) => write!(f, "Shape error: {}", s),
        }
    }
}

impl std::error::Error for WeightIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WeightIoError::Io(e) => Some(e),
            WeightIoError::SafeTensors(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WeightIoError {
    fn from(err: std::io::Error) -> Self { WeightIoError::Io(err) }
}

impl From<SafeTensorError> for WeightIoError {
    fn from(err: SafeTensorError) -> Self { WeightIoError::SafeTensors(err) }
}

/// Element type used when writing a converted archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StorageDtype {
    F64,
    F32,
    F16,
    Bf16,
}

impl StorageDtype {
    fn from_safetensors(dtype: Dtype) -> Option<Self> {
        match dtype {
            Dtype::F64 => Some(StorageDtype::F64),
            Dtype::F32 => Some(StorageDtype::F32),
            Dtype::F16 => Some(StorageDtype::F16),
            Dtype::BF16 => Some(StorageDtype::Bf16),
            _ => None,
        }
    }

    fn to_safetensors(self) -> Dtype {
        match self {
            StorageDtype::F64 => Dtype::F64,
            StorageDtype::F32 => Dtype::F32,
            StorageDtype::F16 => Dtype::F16,
            StorageDtype::Bf16 => Dtype::BF16,
        }
    }

    /// Bytes per element; used to pick the widest dtype of an archive.
    pub fn width(self) -> usize {
        match self {
            StorageDtype::F64 => 8,
            StorageDtype::F32 => 4,
            StorageDtype::F16 | StorageDtype::Bf16 => 2,
        }
    }

    fn encode(self, values: &[f32]) -> Vec<u8> {
        match self {
            StorageDtype::F64 => {
                let wide: Vec<f64> = values.iter().map(|&v| f64::from(v)).collect();
                bytemuck::cast_slice::<f64, u8>(&wide).to_vec()
            }
            StorageDtype::F32 => bytemuck::cast_slice::<f32, u8>(values).to_vec(),
            StorageDtype::F16 => {
                let halves: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
                bytemuck::cast_slice::<f16, u8>(&halves).to_vec()
            }
            StorageDtype::Bf16 => {
                let halves: Vec<bf16> = values.iter().map(|&v| bf16::from_f32(v)).collect();
                bytemuck::cast_slice::<bf16, u8>(&halves).to_vec()
            }
        }
    }
}

/// A loaded LoRA archive: its tensors widened to `f32`, plus the dtype they
/// were stored in.
#[derive(Debug)]
pub struct WeightArchive {
    pub tensors: WeightSet,
    pub dtype: StorageDtype,
}

// Tensor payloads are not guaranteed to be aligned inside the file buffer, so
// every decode copies through `pod_collect_to_vec`.
fn decode(name: &str, view: &TensorView<'_>) -> Result<(Vec<f32>, StorageDtype), WeightIoError> {
    let bytes = view.data();
    let values = match view.dtype() {
        Dtype::F32 => bytemuck::pod_collect_to_vec::<u8, f32>(bytes),
        Dtype::F64 => bytemuck::pod_collect_to_vec::<u8, f64>(bytes).into_iter().map(|v| v as f32).collect(),
        Dtype::F16 => bytemuck::pod_collect_to_vec::<u8, f16>(bytes).into_iter().map(f16::to_f32).collect(),
        Dtype::BF16 => bytemuck::pod_collect_to_vec::<u8, bf16>(bytes).into_iter().map(bf16::to_f32).collect(),
        other => {
            return Err(WeightIoError::UnsupportedDtype(format!(
                "tensor '{}' is stored as {:?}; only F32, F64, F16 and BF16 are supported",
                name, other
            )))
        }
    };
    let dtype = StorageDtype::from_safetensors(view.dtype()).unwrap_or(StorageDtype::F32);
    Ok((values, dtype))
}

/// Parses a safetensors buffer into a [`WeightArchive`].
pub fn deserialize_weights(buffer: &[u8]) -> Result<WeightArchive, WeightIoError> {
    let safetensors = SafeTensors::deserialize(buffer)?;
    let mut tensors = WeightSet::new();
    let mut dtype: Option<StorageDtype> = None;

    for (name, view) in safetensors.tensors() {
        let (values, stored) = decode(&name, &view)?;
        if !keys::is_alpha_key(&name) && dtype.map_or(true, |d| stored.width() > d.width()) {
            dtype = Some(stored);
        }
        let array = ArrayD::from_shape_vec(IxDyn(view.shape()), values)
            .map_err(|e| WeightIoError::Shape(format!("tensor '{}': {}", name, e)))?;
        tensors.insert(name, array);
    }

    Ok(WeightArchive {
        tensors,
        dtype: dtype.unwrap_or(StorageDtype::F32),
    })
}

pub fn load_weights(path: &Path) -> Result<WeightArchive, WeightIoError> {
    log::info!("Loading LoRA weights from: {}", path.display());
    let buffer = std::fs::read(path)?;
    let archive = deserialize_weights(&buffer)?;
    log::info!("Loaded {} tensors ({:?})", archive.tensors.len(), archive.dtype);
    Ok(archive)
}

/// Encodes `weights` as a safetensors buffer, keys in lexical order.
pub fn serialize_weights(weights: &WeightSet, dtype: StorageDtype) -> Result<Vec<u8>, WeightIoError> {
    let encoded: Vec<(&String, Vec<usize>, Vec<u8>)> = sorted_keys(weights)
        .into_iter()
        .map(|name| {
            let tensor = &weights[name];
            let values: Vec<f32> = tensor.iter().copied().collect();
            (name, tensor.shape().to_vec(), dtype.encode(&values))
        })
        .collect();

    let mut views = Vec::with_capacity(encoded.len());
    for (name, shape, bytes) in &encoded {
        views.push((name.as_str(), TensorView::new(dtype.to_safetensors(), shape.clone(), bytes)?));
    }
    Ok(safetensors::serialize(views.iter().map(|(name, view)| (*name, view)), &None)?)
}

/// Writes `weights` to `path`, creating missing parent directories.
pub fn save_weights(weights: &WeightSet, path: &Path, dtype: StorageDtype) -> Result<(), WeightIoError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let buffer = serialize_weights(weights, dtype)?;
    std::fs::write(path, buffer)?;
    log::info!("Saved {} tensors ({:?}) to: {}", weights.len(), dtype, path.display());
    Ok(())
}
