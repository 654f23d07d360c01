//! Converts Flux LoRA weights from kohya/ComfyUI naming
//! (`lora_unet_double_blocks_*`, `lora_down`/`lora_up`, `alpha`) into the
//! diffusers/PEFT layout (`transformer.transformer_blocks.*`, `lora_A`/`lora_B`).

use std::path::PathBuf;

pub mod common;
pub mod config;
pub mod error;
pub mod keys;
pub mod rank;
pub mod transcoder;
pub mod weight_io;

pub use common::WeightSet;
pub use config::FusedLayout;
pub use error::TranscodeError;
pub use transcoder::Transcoder;
pub use weight_io::StorageDtype;

/// Where the source LoRA comes from.
#[derive(Debug)]
pub enum WeightSource {
    Path(PathBuf),
    Memory(WeightSet),
}

#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Persist the converted set here when given.
    pub output_path: Option<PathBuf>,
    /// Zero-pad adapter pairs below this rank.
    pub min_rank: Option<usize>,
    /// Output storage dtype; defaults to the input archive's dtype.
    pub output_dtype: Option<StorageDtype>,
    pub layout: FusedLayout,
}

#[derive(Debug)]
pub enum ConvertError {
    Transcode(TranscodeError),
    WeightIo(weight_io::WeightIoError),
    Config(config::ConfigError),
}

impl std::fmt::Display for ConvertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConvertError::Transcode(e) => write!(f, "Transcode error: {}", e),
            ConvertError::WeightIo(e) => write!(f, "Weight I/O error: {}", e),
            ConvertError::Config(e) => write!(f, "Config error: {}", e),
        }
    }
}

impl std::error::Error for ConvertError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConvertError::Transcode(e) => Some(e),
            ConvertError::WeightIo(e) => Some(e),
            ConvertError::Config(e) => Some(e),
        }
    }
}

impl From<TranscodeError> for ConvertError {
    fn from(err: TranscodeError) -> Self { ConvertError::Transcode(err) }
}
impl From<weight_io::WeightIoError> for ConvertError {
    fn from(err: weight_io::WeightIoError) -> Self { ConvertError::WeightIo(err) }
}
impl From<config::ConfigError> for ConvertError {
    fn from(err: config::ConfigError) -> Self { ConvertError::Config(err) }
}

/// Converts a LoRA weight set and optionally writes it out.
///
/// Loads `source` if it is a path, remaps every entry, pads to
/// `options.min_rank` when set, and saves to `options.output_path` when set.
/// Nothing is written unless the whole conversion succeeds.
pub fn convert(source: WeightSource, options: &ConvertOptions) -> Result<WeightSet, ConvertError> {
    let (input, source_dtype) = match source {
        WeightSource::Path(path) => {
            let archive = weight_io::load_weights(&path)?;
            (archive.tensors, archive.dtype)
        }
        WeightSource::Memory(tensors) => (tensors, StorageDtype::F32),
    };

    let transcoder = Transcoder::new(options.layout);
    log::debug!("Using fused layout {:?}", transcoder.layout());
    let mut converted = transcoder.transcode(&input)?;
    drop(input);

    if let Some(min_rank) = options.min_rank {
        converted = rank::pad_to_min_rank(converted, min_rank)?;
    }

    if let Some(output_path) = &options.output_path {
        let dtype = options.output_dtype.unwrap_or(source_dtype);
        if dtype.width() < source_dtype.width() {
            log::warn!("Narrowing output from {:?} to {:?}", source_dtype, dtype);
        }
        weight_io::save_weights(&converted, output_path, dtype)?;
    }

    Ok(converted)
}
