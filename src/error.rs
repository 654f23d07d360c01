// src/error.rs

/// Failures raised while remapping a LoRA weight set.
///
/// Every variant is fatal for the conversion run; callers must discard any
/// partially built output.
#[derive(Debug, PartialEq)]
pub enum TranscodeError {
    /// The key matches neither block family, or none of the family's roles.
    UnrecognizedKeyPattern(String),
    /// No alpha scalar was found under the contained key.
    MissingAlphaEntry(String),
    /// A fused tensor does not split into the expected sub-projections.
    MalformedFusedDimension(String),
    /// An adapter tensor has a shape the rank arithmetic cannot use.
    InvalidAdapterShape(String),
    /// Two source entries resolved to the same output key.
    DuplicateOutputKey(String),
}

impl std::fmt::Display for TranscodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscodeError::UnrecognizedKeyPattern(k) => write!(f, "Unrecognized key pattern: '{}'", k),
            TranscodeError::MissingAlphaEntry(k) => write!(f, "Missing alpha entry: '{}'", k),
            TranscodeError::MalformedFusedDimension(s) => write!(f, "Malformed fused dimension: {}", s),
            TranscodeError::InvalidAdapterShape(s) => write!(f, "Invalid adapter shape: {}", s),
            TranscodeError::DuplicateOutputKey(k) => write!(f, "Duplicate output key: '{}'", k),
        }
    }
}

impl std::error::Error for TranscodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_offending_key() {
        let err = TranscodeError::UnrecognizedKeyPattern("lora_te1_text_model.lora_up.weight".to_string());
        assert_eq!(
            err.to_string(),
            "Unrecognized key pattern: 'lora_te1_text_model.lora_up.weight'"
        );

        let err = TranscodeError::MissingAlphaEntry("lora_unet_single_blocks_3_linear2.alpha".to_string());
        assert!(err.to_string().contains("lora_unet_single_blocks_3_linear2.alpha"));
    }
}
