use ndarray::ArrayD;
use std::collections::HashMap;

/// Key → tensor mapping, used for both the source and the converted LoRA.
/// Alpha scalars live in the same map as 0-d (or single-element) tensors.
pub type WeightSet = HashMap<String, ArrayD<f32>>;

/// Keys of `set` in lexical order.
pub fn sorted_keys(set: &WeightSet) -> Vec<&String> {
    let mut keys: Vec<&String> = set.keys().collect();
    keys.sort();
    keys
}
