use strata_core::{Backend, BlockConfig, Parameter, Result, StrataError, Tensor};

/// RMS normalization layer.
pub struct RMSNorm<B: Backend> {
    pub(crate) weight: Parameter<B::Tensor>,
    pub(crate) eps: f32,
}

impl<B: Backend> RMSNorm<B> {
    pub fn new(weight: B::Tensor, eps: f32) -> Self {
        Self {
            weight: Parameter::frozen(weight),
            eps,
        }
    }

    pub fn forward(&self, x: &B::Tensor, backend: &B) -> Result<B::Tensor> {
        backend.rms_norm(x, &self.weight.tensor, self.eps)
    }
}

/// Precomputed rotary tables, kept as (non-trainable) buffers.
pub struct RotaryEmbedding<B: Backend> {
    pub(crate) cos: Parameter<B::Tensor>,
    pub(crate) sin: Parameter<B::Tensor>,
}

impl<B: Backend> RotaryEmbedding<B> {
    /// Tables of shape `[max_length, head_dim / 2]`.
    pub fn precompute(config: &BlockConfig, backend: &B) -> Result<Self> {
        let head_dim = config.head_dim();
        let half_dim = head_dim / 2;
        let theta = config.rope_theta;
        let max_len = config.max_length;

        let mut cos_data = Vec::with_capacity(max_len * half_dim);
        let mut sin_data = Vec::with_capacity(max_len * half_dim);
        for pos in 0..max_len {
            for i in 0..half_dim {
                let freq = (pos as f64) / theta.powf(2.0 * (i as f64) / (head_dim as f64));
                cos_data.push(freq.cos() as f32);
                sin_data.push(freq.sin() as f32);
            }
        }

        Ok(Self {
            cos: Parameter::frozen(backend.copy_from_host_f32(&cos_data, &[max_len, half_dim])?),
            sin: Parameter::frozen(backend.copy_from_host_f32(&sin_data, &[max_len, half_dim])?),
        })
    }

    /// Rotate `[batch, seq_len, heads, head_dim]` starting at `position_offset`.
    pub fn apply(&self, x: &B::Tensor, position_offset: usize, backend: &B) -> Result<B::Tensor> {
        backend.rope(x, &self.cos.tensor, &self.sin.tensor, position_offset)
    }
}

/// SiLU-gated MLP (gate_proj, up_proj, down_proj).
pub struct GatedMlp<B: Backend> {
    pub(crate) gate_proj: Parameter<B::Tensor>,
    pub(crate) up_proj: Parameter<B::Tensor>,
    pub(crate) down_proj: Parameter<B::Tensor>,
}

impl<B: Backend> GatedMlp<B> {
    pub fn new(gate_proj: B::Tensor, up_proj: B::Tensor, down_proj: B::Tensor) -> Self {
        Self {
            gate_proj: Parameter::frozen(gate_proj),
            up_proj: Parameter::frozen(up_proj),
            down_proj: Parameter::frozen(down_proj),
        }
    }

    pub fn forward(&self, x: &B::Tensor, backend: &B) -> Result<B::Tensor> {
        let gate = backend.matmul(x, &self.gate_proj.tensor)?;
        let up = backend.matmul(x, &self.up_proj.tensor)?;
        let fused = backend.fused_silu_mul(&gate, &up)?;
        backend.matmul(&fused, &self.down_proj.tensor)
    }
}

/// Multi-head causal self-attention with rotary position embeddings.
pub struct SelfAttention<B: Backend> {
    pub(crate) query: Parameter<B::Tensor>,
    pub(crate) key: Parameter<B::Tensor>,
    pub(crate) value: Parameter<B::Tensor>,
    pub(crate) dense: Parameter<B::Tensor>,
    pub(crate) num_heads: usize,
    pub(crate) head_dim: usize,
    pub(crate) max_length: usize,
}

impl<B: Backend> SelfAttention<B> {
    pub fn new(
        query: B::Tensor,
        key: B::Tensor,
        value: B::Tensor,
        dense: B::Tensor,
        config: &BlockConfig,
    ) -> Self {
        Self {
            query: Parameter::frozen(query),
            key: Parameter::frozen(key),
            value: Parameter::frozen(value),
            dense: Parameter::frozen(dense),
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
            max_length: config.max_length,
        }
    }

    fn scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }

    /// Project `x: [seq_len, hidden]` into rotated Q, K (4D) and V (2D).
    fn project(
        &self,
        x: &B::Tensor,
        rotary: &RotaryEmbedding<B>,
        position_offset: usize,
        backend: &B,
    ) -> Result<(B::Tensor, B::Tensor, B::Tensor)> {
        let seq_len = x.shape()[0];
        let q = backend.matmul(x, &self.query.tensor)?;
        let k = backend.matmul(x, &self.key.tensor)?;
        let v = backend.matmul(x, &self.value.tensor)?;

        let q = backend.reshape(&q, &[1, seq_len, self.num_heads, self.head_dim])?;
        let k = backend.reshape(&k, &[1, seq_len, self.num_heads, self.head_dim])?;
        let q = rotary.apply(&q, position_offset, backend)?;
        let k = rotary.apply(&k, position_offset, backend)?;
        Ok((q, k, v))
    }

    /// Full causal attention over `x: [seq_len, hidden]`.
    pub fn forward(&self, x: &B::Tensor, rotary: &RotaryEmbedding<B>, backend: &B) -> Result<B::Tensor> {
        let seq_len = x.shape()[0];
        let (q, k, v) = self.project(x, rotary, 0, backend)?;
        let v = backend.reshape(&v, &[1, seq_len, self.num_heads, self.head_dim])?;
        let attn = backend.multi_head_attention(
            &q,
            &k,
            &v,
            self.num_heads,
            self.num_heads,
            self.head_dim,
            self.scale(),
            true,
        )?;
        backend.matmul(&attn, &self.dense.tensor)
    }

    /// Attention for `x: [n, hidden]` following `prefix_length` cached positions.
    ///
    /// `cache` is `[2 * max_length, hidden]`: keys in the first half, values in
    /// the second. The new keys and values are written into it in place.
    pub fn forward_incremental(
        &self,
        x: &B::Tensor,
        rotary: &RotaryEmbedding<B>,
        cache: &mut B::Tensor,
        prefix_length: usize,
        backend: &B,
    ) -> Result<B::Tensor> {
        let new_len = x.shape()[0];
        let hidden = self.num_heads * self.head_dim;
        let expected = [2 * self.max_length, hidden];
        if cache.shape() != expected {
            return Err(StrataError::ShapeMismatch {
                expected: expected.to_vec(),
                got: cache.shape().to_vec(),
            });
        }
        let kv_len = prefix_length + new_len;
        if kv_len > self.max_length {
            return Err(StrataError::InvalidArgument(format!(
                "sequence length {kv_len} exceeds the cache capacity of {} tokens",
                self.max_length
            )));
        }

        let (q, k, v) = self.project(x, rotary, prefix_length, backend)?;
        let k = backend.reshape(&k, &[new_len, hidden])?;
        backend.write_rows(cache, prefix_length, &k)?;
        backend.write_rows(cache, self.max_length + prefix_length, &v)?;

        let k_all = backend.slice_rows(cache, 0, kv_len)?;
        let v_all = backend.slice_rows(cache, self.max_length, kv_len)?;
        let k_all = backend.reshape(&k_all, &[1, kv_len, self.num_heads, self.head_dim])?;
        let v_all = backend.reshape(&v_all, &[1, kv_len, self.num_heads, self.head_dim])?;

        let attn = backend.multi_head_attention(
            &q,
            &k_all,
            &v_all,
            self.num_heads,
            self.num_heads,
            self.head_dim,
            self.scale(),
            true,
        )?;
        backend.matmul(&attn, &self.dense.tensor)
    }
}
