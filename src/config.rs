use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Width of one attention sub-projection (q, k or v) in Flux.1.
pub const FLUX_ATTENTION_WIDTH: usize = 3072;
/// Width of the MLP-expansion slice of a single block's fused `linear1`.
pub const FLUX_MLP_WIDTH: usize = 12288;

const DEFAULT_MLP_RATIO: f64 = 4.0;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Json(e) => write!(f, "JSON error: {}", e),
            ConfigError::Invalid(s) => write!(f, "Invalid layout config: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Json(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self { ConfigError::Io(err) }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self { ConfigError::Json(err) }
}

/// Chunk widths of the single-block fused `linear1` projection.
///
/// The up-projection of `linear1` stacks q, k, v (each `attention_width` rows)
/// and the MLP expansion (`mlp_width` rows) along axis 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusedLayout {
    pub attention_width: usize,
    pub mlp_width: usize,
}

impl Default for FusedLayout {
    fn default() -> Self {
        Self {
            attention_width: FLUX_ATTENTION_WIDTH,
            mlp_width: FLUX_MLP_WIDTH,
        }
    }
}

// Accepts either explicit widths or a diffusers transformer config.json.
#[derive(Deserialize, Debug, Default)]
struct RawLayoutConfig {
    #[serde(alias = "hidden_size")]
    attention_width: Option<usize>,
    #[serde(alias = "mlp_hidden_dim")]
    mlp_width: Option<usize>,
    num_attention_heads: Option<usize>,
    attention_head_dim: Option<usize>,
    mlp_ratio: Option<f64>,
}

impl FusedLayout {
    /// Rows of a fused `linear1` up-projection.
    pub fn linear1_rows(&self) -> usize {
        3 * self.attention_width + self.mlp_width
    }

    /// Row counts of the q, k, v and MLP chunks, in stacking order.
    pub fn linear1_chunks(&self) -> [usize; 4] {
        [self.attention_width, self.attention_width, self.attention_width, self.mlp_width]
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let raw: RawLayoutConfig = serde_json::from_str(json)?;
        Self::resolve(raw)
    }

    pub fn load(config_path: &str) -> Result<Self, ConfigError> {
        if !Path::new(config_path).exists() {
            return Err(ConfigError::Invalid(format!("Config file not found at: {}", config_path)));
        }

        let mut file = File::open(config_path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let layout = Self::from_json_str(&contents)?;
        log::debug!("Loaded fused layout {:?} from {}", layout, config_path);
        Ok(layout)
    }

    fn resolve(raw: RawLayoutConfig) -> Result<Self, ConfigError> {
        let attention_width = match (raw.attention_width, raw.num_attention_heads, raw.attention_head_dim) {
            (Some(width), _, _) => width,
            (None, Some(heads), Some(head_dim)) => heads * head_dim,
            _ => {
                return Err(ConfigError::Invalid(
                    "expected 'attention_width' (or 'hidden_size'), or both 'num_attention_heads' and 'attention_head_dim'"
                        .to_string(),
                ))
            }
        };
        if attention_width == 0 {
            return Err(ConfigError::Invalid("attention width must be non-zero".to_string()));
        }

        let mlp_width = match raw.mlp_width {
            Some(width) => width,
            None => {
                let ratio = raw.mlp_ratio.unwrap_or(DEFAULT_MLP_RATIO);
                if !ratio.is_finite() || ratio <= 0.0 {
                    return Err(ConfigError::Invalid(format!("mlp_ratio must be positive, got {}", ratio)));
                }
                (attention_width as f64 * ratio).round() as usize
            }
        };
        if mlp_width == 0 {
            return Err(ConfigError::Invalid("MLP width must be non-zero".to_string()));
        }

        Ok(Self { attention_width, mlp_width })
    }
}
