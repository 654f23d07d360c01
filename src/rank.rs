// src/rank.rs

use crate::common::{sorted_keys, WeightSet};
use crate::error::TranscodeError;
use crate::keys::{A_TAG, B_TAG};
use ndarray::{s, Array2, ArrayD, ArrayView2, Ix2};

/// Zero-extends every adapter pair of `weights` whose rank is below `min_rank`.
///
/// `lora_A` tensors `[r, in]` gain zero rows and `lora_B` tensors `[out, r]`
/// gain zero columns, so `B · A` is unchanged. Tensors already at or above
/// `min_rank` are returned untouched. Fails on keys without an A/B tag and on
/// tensors that are not matrices.
pub fn pad_to_min_rank(mut weights: WeightSet, min_rank: usize) -> Result<WeightSet, TranscodeError> {
    let mut padded = Vec::new();

    for key in sorted_keys(&weights) {
        let tensor = &weights[key];
        let replacement = if key.contains(A_TAG) {
            let view = as_matrix(key, tensor)?;
            pad_rows(view, min_rank)
        } else if key.contains(B_TAG) {
            let view = as_matrix(key, tensor)?;
            pad_columns(view, min_rank)
        } else {
            return Err(TranscodeError::UnrecognizedKeyPattern(key.clone()));
        };
        if let Some(new_tensor) = replacement {
            padded.push((key.clone(), new_tensor.into_dyn()));
        }
    }

    if !padded.is_empty() {
        log::info!("Padded {} adapter tensors to rank {}", padded.len(), min_rank);
    }
    for (key, tensor) in padded {
        weights.insert(key, tensor);
    }
    Ok(weights)
}

fn as_matrix<'a>(key: &str, tensor: &'a ArrayD<f32>) -> Result<ArrayView2<'a, f32>, TranscodeError> {
    tensor.view().into_dimensionality::<Ix2>().map_err(|_| {
        TranscodeError::InvalidAdapterShape(format!(
            "'{}' has shape {:?}, rank padding needs a matrix",
            key,
            tensor.shape()
        ))
    })
}

fn pad_rows(down: ArrayView2<f32>, min_rank: usize) -> Option<Array2<f32>> {
    let (rank, in_features) = down.dim();
    if rank >= min_rank {
        return None;
    }
    let mut padded = Array2::zeros((min_rank, in_features));
    padded.slice_mut(s![..rank, ..]).assign(&down);
    Some(padded)
}

fn pad_columns(up: ArrayView2<f32>, min_rank: usize) -> Option<Array2<f32>> {
    let (out_features, rank) = up.dim();
    if rank >= min_rank {
        return None;
    }
    let mut padded = Array2::zeros((out_features, min_rank));
    padded.slice_mut(s![.., ..rank]).assign(&up);
    Some(padded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr0, Array};
    use proptest::prelude::*;

    const A_KEY: &str = "transformer.transformer_blocks.0.attn.to_q.lora_A.weight";
    const B_KEY: &str = "transformer.transformer_blocks.0.attn.to_q.lora_B.weight";

    fn pair(rank: usize, in_features: usize, out_features: usize) -> WeightSet {
        let a = Array::from_shape_fn((rank, in_features), |(i, j)| (i * in_features + j) as f32 * 0.5 + 1.0);
        let b = Array::from_shape_fn((out_features, rank), |(i, j)| (i + 2 * j) as f32 - 1.5);
        let mut set = WeightSet::new();
        set.insert(A_KEY.to_string(), a.into_dyn());
        set.insert(B_KEY.to_string(), b.into_dyn());
        set
    }

    fn matrix(set: &WeightSet, key: &str) -> Array2<f32> {
        set[key].clone().into_dimensionality::<Ix2>().expect("matrix")
    }

    #[test]
    fn test_pads_rank_8_pair_to_32() -> Result<(), TranscodeError> {
        let original = pair(8, 6, 5);
        let padded = pad_to_min_rank(original.clone(), 32)?;

        let a = matrix(&padded, A_KEY);
        assert_eq!(a.dim(), (32, 6));
        assert_eq!(a.slice(s![..8, ..]), matrix(&original, A_KEY));
        assert!(a.slice(s![8.., ..]).iter().all(|&v| v == 0.0));

        let b = matrix(&padded, B_KEY);
        assert_eq!(b.dim(), (5, 32));
        assert_eq!(b.slice(s![.., ..8]), matrix(&original, B_KEY));
        assert!(b.slice(s![.., 8..]).iter().all(|&v| v == 0.0));
        Ok(())
    }

    #[test]
    fn test_pair_at_or_above_min_rank_is_untouched() -> Result<(), TranscodeError> {
        let original = pair(16, 4, 4);
        assert_eq!(pad_to_min_rank(original.clone(), 16)?, original);
        assert_eq!(pad_to_min_rank(original.clone(), 4)?, original);
        Ok(())
    }

    #[test]
    fn test_untagged_or_non_matrix_keys_fail() {
        let mut set = WeightSet::new();
        set.insert("transformer.proj_out.weight".to_string(), Array2::<f32>::zeros((2, 2)).into_dyn());
        assert!(matches!(
            pad_to_min_rank(set, 4),
            Err(TranscodeError::UnrecognizedKeyPattern(k)) if k == "transformer.proj_out.weight"
        ));

        let mut set = WeightSet::new();
        set.insert(A_KEY.to_string(), arr0(1.0f32).into_dyn());
        assert!(matches!(pad_to_min_rank(set, 4), Err(TranscodeError::InvalidAdapterShape(_))));
    }

    proptest! {
        #[test]
        fn prop_padding_preserves_adapter_product(
            rank in 1usize..6,
            extra in 0usize..6,
            in_features in 1usize..5,
            out_features in 1usize..5,
            seed in -4.0f32..4.0,
        ) {
            let a = Array::from_shape_fn((rank, in_features), |(i, j)| seed + (i * 3 + j) as f32 * 0.25);
            let b = Array::from_shape_fn((out_features, rank), |(i, j)| seed * 0.5 - (i + j) as f32);
            let mut set = WeightSet::new();
            set.insert(A_KEY.to_string(), a.clone().into_dyn());
            set.insert(B_KEY.to_string(), b.clone().into_dyn());

            let min_rank = rank + extra;
            let padded = pad_to_min_rank(set, min_rank).expect("padding succeeds");
            let a_padded = matrix(&padded, A_KEY);
            let b_padded = matrix(&padded, B_KEY);
            prop_assert_eq!(a_padded.dim(), (min_rank, in_features));
            prop_assert_eq!(b_padded.dim(), (out_features, min_rank));

            let before = b.dot(&a);
            let after = b_padded.dot(&a_padded);
            for (x, y) in before.iter().zip(after.iter()) {
                assert_abs_diff_eq!(*x, *y, epsilon = 1e-4);
            }
        }
    }
}
