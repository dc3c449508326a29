use serde::{Deserialize, Serialize};

use crate::{Result, StrataError};

/// Longest sequence a single attention cache entry can hold.
pub const MAX_LENGTH: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }
}

/// Shape of a single transformer block, as read from `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_rms_eps")]
    pub rms_norm_eps: f32,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_dtype")]
    pub dtype: DType,
}

fn default_rms_eps() -> f32 {
    1e-5
}
fn default_rope_theta() -> f64 {
    10000.0
}
fn default_max_length() -> usize {
    MAX_LENGTH
}
fn default_dtype() -> DType {
    DType::F32
}

impl BlockConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.num_attention_heads == 0 || self.intermediate_size == 0 {
            return Err(StrataError::InvalidArgument(
                "block dimensions must be non-zero".into(),
            ));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(StrataError::InvalidArgument(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(StrataError::InvalidArgument(format!(
                "rotary embeddings require an even head_dim, got {}",
                self.head_dim()
            )));
        }
        if self.max_length == 0 {
            return Err(StrataError::InvalidArgument("max_length must be non-zero".into()));
        }
        Ok(())
    }
}
