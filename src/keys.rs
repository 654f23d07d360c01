//! # Source key classification
//!
//! Parses kohya-style Flux LoRA keys such as
//! `lora_unet_double_blocks_7_txt_attn_qkv.lora_down.weight` into a
//! [`SourceKey`] and resolves the diffusers-side names they map to.
//!
//! Roles are matched exactly against the per-family tables below, so a role
//! like `img_attn_proj` can never be picked up by a `img_attn` prefix rule.

use crate::error::TranscodeError;

pub const DOUBLE_BLOCK_PREFIX: &str = "lora_unet_double_blocks_";
pub const SINGLE_BLOCK_PREFIX: &str = "lora_unet_single_blocks_";
pub const DOUBLE_BLOCK_TARGET: &str = "transformer.transformer_blocks";
pub const SINGLE_BLOCK_TARGET: &str = "transformer.single_transformer_blocks";

const DOWN_SUFFIX: &str = "lora_down.weight";
const UP_SUFFIX: &str = "lora_up.weight";
/// Alpha scalars sit under `<stem>.alpha`; any key containing it is an alpha.
const ALPHA: &str = "alpha";

/// Down-projection output tag (diffusers/PEFT `lora_A`).
pub const A_TAG: &str = "lora_A";
/// Up-projection output tag (diffusers/PEFT `lora_B`).
pub const B_TAG: &str = "lora_B";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFamily {
    Double,
    Single,
}

impl BlockFamily {
    pub fn target_prefix(&self) -> &'static str {
        match self {
            BlockFamily::Double => DOUBLE_BLOCK_TARGET,
            BlockFamily::Single => SINGLE_BLOCK_TARGET,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraSide {
    Down,
    Up,
}

impl LoraSide {
    pub fn target_suffix(&self) -> &'static str {
        match self {
            LoraSide::Down => "lora_A.weight",
            LoraSide::Up => "lora_B.weight",
        }
    }
}

/// How a source role fans out into target projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// One-to-one rename.
    Plain(&'static str),
    /// Double-block QKV: three equal row chunks.
    FusedQkv([&'static str; 3]),
    /// Single-block `linear1`: q, k, v and MLP-expansion chunks.
    FusedQkvMlp([&'static str; 4]),
}

impl Projection {
    pub fn targets(&self) -> &[&'static str] {
        match self {
            Projection::Plain(target) => std::slice::from_ref(target),
            Projection::FusedQkv(targets) => targets,
            Projection::FusedQkvMlp(targets) => targets,
        }
    }
}

pub const DOUBLE_BLOCK_ROLES: &[(&str, Projection)] = &[
    ("img_attn_qkv", Projection::FusedQkv(["attn.to_q", "attn.to_k", "attn.to_v"])),
    ("txt_attn_qkv", Projection::FusedQkv(["attn.add_q_proj", "attn.add_k_proj", "attn.add_v_proj"])),
    ("img_attn_proj", Projection::Plain("attn.to_out.0")),
    ("img_mlp_0", Projection::Plain("ff.net.0.proj")),
    ("img_mlp_2", Projection::Plain("ff.net.2")),
    ("img_mod_lin", Projection::Plain("norm1.linear")),
    ("txt_attn_proj", Projection::Plain("attn.to_add_out")),
    ("txt_mlp_0", Projection::Plain("ff_context.net.0.proj")),
    ("txt_mlp_2", Projection::Plain("ff_context.net.2")),
    ("txt_mod_lin", Projection::Plain("norm1_context.linear")),
];

pub const SINGLE_BLOCK_ROLES: &[(&str, Projection)] = &[
    ("linear1", Projection::FusedQkvMlp(["attn.to_q", "attn.to_k", "attn.to_v", "proj_mlp"])),
    ("linear2", Projection::Plain("proj_out")),
    ("modulation_lin", Projection::Plain("norm.linear")),
];

/// A classified LoRA weight key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceKey {
    pub family: BlockFamily,
    pub block_index: usize,
    pub role: &'static str,
    pub projection: Projection,
    pub side: LoraSide,
    stem: String,
}

impl SourceKey {
    /// Key of the alpha scalar paired with this entry's down-projection.
    pub fn alpha_key(&self) -> String {
        format!("{}.{}", self.stem, ALPHA)
    }

    /// Output key for one of this entry's target projections.
    pub fn target_key(&self, target: &str) -> String {
        format!(
            "{}.{}.{}.{}",
            self.family.target_prefix(),
            self.block_index,
            target,
            self.side.target_suffix()
        )
    }

    pub fn target_keys(&self) -> Vec<String> {
        self.projection.targets().iter().map(|t| self.target_key(t)).collect()
    }
}

/// True for alpha scalars, which never produce output entries.
pub fn is_alpha_key(key: &str) -> bool {
    key.contains(ALPHA)
}

/// Classifies a non-alpha source key.
pub fn classify(key: &str) -> Result<SourceKey, TranscodeError> {
    let unrecognized = || TranscodeError::UnrecognizedKeyPattern(key.to_string());

    let (stem, suffix) = key.split_once('.').ok_or_else(unrecognized)?;
    let side = match suffix {
        DOWN_SUFFIX => LoraSide::Down,
        UP_SUFFIX => LoraSide::Up,
        _ => return Err(unrecognized()),
    };

    let (family, rest, roles) = if let Some(rest) = stem.strip_prefix(DOUBLE_BLOCK_PREFIX) {
        (BlockFamily::Double, rest, DOUBLE_BLOCK_ROLES)
    } else if let Some(rest) = stem.strip_prefix(SINGLE_BLOCK_PREFIX) {
        (BlockFamily::Single, rest, SINGLE_BLOCK_ROLES)
    } else {
        return Err(unrecognized());
    };

    let (index, role) = rest.split_once('_').ok_or_else(unrecognized)?;
    // Canonical decimal only: "00" or "07" would collide with "0" or "7".
    let canonical = !index.is_empty()
        && index.bytes().all(|b| b.is_ascii_digit())
        && !(index.len() > 1 && index.starts_with('0'));
    if !canonical {
        return Err(unrecognized());
    }
    let block_index: usize = index.parse().map_err(|_| unrecognized())?;

    let (role, projection) = roles
        .iter()
        .find(|(name, _)| *name == role)
        .copied()
        .ok_or_else(unrecognized)?;

    Ok(SourceKey {
        family,
        block_index,
        role,
        projection,
        side,
        stem: stem.to_string(),
    })
}
