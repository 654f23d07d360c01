// src/transcoder.rs

use crate::common::{sorted_keys, WeightSet};
use crate::config::FusedLayout;
use crate::error::TranscodeError;
use crate::keys::{self, BlockFamily, LoraSide, Projection, SourceKey};
use ndarray::{ArrayD, Axis, Slice};

/// Remaps a kohya-style Flux LoRA weight set into diffusers naming.
///
/// The transcoder is stateless apart from the fused layout; `transcode` reads
/// the whole input and builds a fresh output set, or fails without output.
#[derive(Debug, Clone, Default)]
pub struct Transcoder {
    layout: FusedLayout,
}

impl Transcoder {
    pub fn new(layout: FusedLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &FusedLayout {
        &self.layout
    }

    pub fn transcode(&self, input: &WeightSet) -> Result<WeightSet, TranscodeError> {
        let mut output = WeightSet::with_capacity(input.len() * 2);
        let mut alpha_entries = 0usize;
        let mut max_rank = 0usize;

        // Sorted walk so the first reported error does not depend on hash order.
        for key in sorted_keys(input) {
            if keys::is_alpha_key(key) {
                alpha_entries += 1;
                continue;
            }
            let tensor = &input[key];
            let source = keys::classify(key)?;

            if source.side == LoraSide::Down {
                max_rank = max_rank.max(leading_dim(key, tensor)?);
            }

            match source.projection {
                Projection::FusedQkv(_) => self.transcode_fused_qkv(&source, key, tensor, input, &mut output)?,
                Projection::FusedQkvMlp(_) => self.transcode_fused_qkv_mlp(&source, key, tensor, input, &mut output)?,
                Projection::Plain(target) => {
                    // Only single-block plain projections carry their alpha.
                    let scale_down = source.family == BlockFamily::Single;
                    let value = if scale_down && source.side == LoraSide::Down {
                        scale_by_alpha(&source, key, tensor, input)?
                    } else {
                        tensor.to_owned()
                    };
                    log::debug!("{} -> {}", key, source.target_key(target));
                    insert_unique(&mut output, source.target_key(target), value)?;
                }
            }
        }

        log::info!(
            "Transcoded {} entries into {} ({} alpha entries consumed, max rank {})",
            input.len() - alpha_entries,
            output.len(),
            alpha_entries,
            max_rank
        );
        Ok(output)
    }

    // Double-block img/txt QKV.
    fn transcode_fused_qkv(
        &self,
        source: &SourceKey,
        key: &str,
        tensor: &ArrayD<f32>,
        input: &WeightSet,
        output: &mut WeightSet,
    ) -> Result<(), TranscodeError> {
        match source.side {
            LoraSide::Down => fan_out_down(source, key, tensor, input, output),
            LoraSide::Up => {
                let rows = leading_dim(key, tensor)?;
                if rows % 3 != 0 {
                    return Err(TranscodeError::MalformedFusedDimension(format!(
                        "'{}' has leading dimension {}, which is not divisible by 3",
                        key, rows
                    )));
                }
                let chunk = rows / 3;
                split_up(source, key, tensor, &[chunk, chunk, chunk], output)
            }
        }
    }

    // Single-block linear1: q, k, v and the MLP expansion.
    fn transcode_fused_qkv_mlp(
        &self,
        source: &SourceKey,
        key: &str,
        tensor: &ArrayD<f32>,
        input: &WeightSet,
        output: &mut WeightSet,
    ) -> Result<(), TranscodeError> {
        match source.side {
            LoraSide::Down => fan_out_down(source, key, tensor, input, output),
            LoraSide::Up => {
                let rows = leading_dim(key, tensor)?;
                let expected = self.layout.linear1_rows();
                if rows != expected {
                    return Err(TranscodeError::MalformedFusedDimension(format!(
                        "'{}' has leading dimension {}, expected {} (q, k, v = {} each, mlp = {})",
                        key, rows, expected, self.layout.attention_width, self.layout.mlp_width
                    )));
                }
                split_up(source, key, tensor, &self.layout.linear1_chunks(), output)
            }
        }
    }
}

fn leading_dim(key: &str, tensor: &ArrayD<f32>) -> Result<usize, TranscodeError> {
    tensor.shape().first().copied().ok_or_else(|| {
        TranscodeError::InvalidAdapterShape(format!("'{}' is a scalar, expected a matrix", key))
    })
}

/// Returns `tensor * alpha / rank` for a down-projection.
fn scale_by_alpha(
    source: &SourceKey,
    key: &str,
    tensor: &ArrayD<f32>,
    input: &WeightSet,
) -> Result<ArrayD<f32>, TranscodeError> {
    let rank = leading_dim(key, tensor)?;
    if rank == 0 {
        return Err(TranscodeError::InvalidAdapterShape(format!("'{}' has rank 0", key)));
    }
    let alpha_key = source.alpha_key();
    let alpha = input
        .get(&alpha_key)
        .and_then(|a| a.iter().next().copied())
        .ok_or(TranscodeError::MissingAlphaEntry(alpha_key))?;
    let rank = rank as f32;
    Ok(tensor.mapv(|x| x * alpha / rank))
}

// One low-rank down-projection feeds every fused output, so each copy carries
// the full alpha / rank factor and the matching up chunks stay unscaled.
fn fan_out_down(
    source: &SourceKey,
    key: &str,
    tensor: &ArrayD<f32>,
    input: &WeightSet,
    output: &mut WeightSet,
) -> Result<(), TranscodeError> {
    let scaled = scale_by_alpha(source, key, tensor, input)?;
    for target in source.target_keys() {
        log::debug!("{} -> {} (scaled)", key, target);
        insert_unique(output, target, scaled.clone())?;
    }
    Ok(())
}

// Callers check that `chunks` sums to the leading dimension.
fn split_up(
    source: &SourceKey,
    key: &str,
    tensor: &ArrayD<f32>,
    chunks: &[usize],
    output: &mut WeightSet,
) -> Result<(), TranscodeError> {
    let mut start = 0;
    for (target, &rows) in source.target_keys().into_iter().zip(chunks) {
        let end = start + rows;
        log::debug!("{}[{}..{}] -> {}", key, start, end, target);
        insert_unique(output, target, tensor.slice_axis(Axis(0), Slice::from(start..end)).to_owned())?;
        start = end;
    }
    Ok(())
}

// Each output key is written once; a second write means two sources collided.
fn insert_unique(output: &mut WeightSet, key: String, value: ArrayD<f32>) -> Result<(), TranscodeError> {
    if output.contains_key(&key) {
        return Err(TranscodeError::DuplicateOutputKey(key));
    }
    output.insert(key, value);
    Ok(())
}
