use crate::tensor::Tensor;
use crate::{DType, Result, StrataError};

pub trait Backend: Send + Sync + 'static {
    type Tensor: Tensor;

    fn name(&self) -> &str;

    // Allocation
    fn allocate_zeros(&self, shape: &[usize], dtype: DType) -> Result<Self::Tensor>;

    /// Element type actually stored for a tensor allocated as `requested`.
    fn storage_dtype(&self, requested: DType) -> DType {
        requested
    }

    // Data transfer
    fn copy_from_host_f32(&self, data: &[f32], shape: &[usize]) -> Result<Self::Tensor>;
    fn copy_from_host_f16(&self, data: &[half::f16], shape: &[usize]) -> Result<Self::Tensor>;
    fn copy_from_host_bf16(&self, data: &[half::bf16], shape: &[usize]) -> Result<Self::Tensor>;
    fn copy_to_host_f32(&self, tensor: &Self::Tensor) -> Result<Vec<f32>>;

    // Synchronization
    fn synchronize(&self) -> Result<()>;

    // Core ops
    fn matmul(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;
    fn add(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;
    fn mul(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;
    fn mul_scalar(&self, a: &Self::Tensor, scalar: f32) -> Result<Self::Tensor>;
    fn silu(&self, a: &Self::Tensor) -> Result<Self::Tensor>;

    /// Fused SiLU activation and element-wise multiply: out = silu(gate) * up
    fn fused_silu_mul(&self, gate: &Self::Tensor, up: &Self::Tensor) -> Result<Self::Tensor> {
        let activated = self.silu(gate)?;
        self.mul(&activated, up)
    }

    fn rms_norm(
        &self,
        x: &Self::Tensor,
        weight: &Self::Tensor,
        eps: f32,
    ) -> Result<Self::Tensor>;

    /// Rotary embedding over `[batch, seq_len, heads, head_dim]`.
    ///
    /// Token `t` uses row `position_offset + t` of the `[max_len, head_dim / 2]`
    /// frequency tables.
    fn rope(
        &self,
        x: &Self::Tensor,
        freqs_cos: &Self::Tensor,
        freqs_sin: &Self::Tensor,
        position_offset: usize,
    ) -> Result<Self::Tensor>;

    fn softmax(&self, x: &Self::Tensor, dim: i32) -> Result<Self::Tensor>;
    fn reshape(&self, x: &Self::Tensor, shape: &[usize]) -> Result<Self::Tensor>;
    fn transpose(&self, x: &Self::Tensor, dim0: usize, dim1: usize) -> Result<Self::Tensor>;
    fn cat(&self, tensors: &[&Self::Tensor], dim: usize) -> Result<Self::Tensor>;

    /// Overwrite rows `[start_row..start_row + src_rows]` of `dst` with `src`, in place.
    fn write_rows(&self, dst: &mut Self::Tensor, start_row: usize, src: &Self::Tensor)
        -> Result<()>;

    /// Cast a tensor to a different dtype. Returns the input unchanged if already the target dtype.
    fn cast(&self, x: &Self::Tensor, dtype: DType) -> Result<Self::Tensor>;

    /// Multi-head scaled dot-product attention.
    ///
    /// Q: [1, seq_len, num_heads, head_dim]
    /// K: [1, kv_len, num_kv_heads, head_dim]
    /// V: [1, kv_len, num_kv_heads, head_dim]
    ///
    /// Returns: [seq_len, num_heads * head_dim]
    ///
    /// Queries are the last `seq_len` positions of the `kv_len` keys, so the
    /// causal mask is shifted by `kv_len - seq_len`.
    #[allow(clippy::too_many_arguments)]
    fn multi_head_attention(
        &self,
        q: &Self::Tensor,
        k: &Self::Tensor,
        v: &Self::Tensor,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        scale: f32,
        is_causal: bool,
    ) -> Result<Self::Tensor> {
        let seq_len = q.shape()[1];
        let kv_len = k.shape()[1];
        if kv_len < seq_len {
            return Err(StrataError::InvalidArgument(format!(
                "attention needs at least as many keys ({kv_len}) as queries ({seq_len})"
            )));
        }
        let heads_per_group = num_heads / num_kv_heads;

        // Strip batch dim (always 1)
        let q = self.reshape(q, &[seq_len, num_heads, head_dim])?;
        let k = self.reshape(k, &[kv_len, num_kv_heads, head_dim])?;
        let v = self.reshape(v, &[kv_len, num_kv_heads, head_dim])?;

        let mut head_outputs = Vec::with_capacity(num_heads);

        for h in 0..num_heads {
            let kv_h = h / heads_per_group;

            let q_head = self.extract_head(&q, seq_len, num_heads, head_dim, h)?;
            let k_head = self.extract_head(&k, kv_len, num_kv_heads, head_dim, kv_h)?;
            let v_head = self.extract_head(&v, kv_len, num_kv_heads, head_dim, kv_h)?;

            let k_t = self.transpose(&k_head, 0, 1)?;
            let scores = self.matmul(&q_head, &k_t)?;
            let scores = self.mul_scalar(&scores, scale)?;

            let scores = if is_causal && seq_len > 1 {
                self.apply_causal_mask(&scores, seq_len, kv_len)?
            } else {
                scores
            };

            let attn = self.softmax(&scores, -1)?;
            head_outputs.push(self.matmul(&attn, &v_head)?);
        }

        let refs: Vec<&Self::Tensor> = head_outputs.iter().collect();
        self.interleave_heads(&refs, seq_len, head_dim)
    }

    // ── Attention helpers ───────────────────────────────────────
    // Default impls go through host memory.

    /// Extract head `head` from `[seq_len, num_heads, head_dim]` layout → `[seq_len, head_dim]`.
    fn extract_head(
        &self,
        tensor: &Self::Tensor,
        seq_len: usize,
        num_heads: usize,
        head_dim: usize,
        head: usize,
    ) -> Result<Self::Tensor> {
        let data = self.copy_to_host_f32(tensor)?;
        let stride = num_heads * head_dim;
        let mut out = Vec::with_capacity(seq_len * head_dim);
        for t in 0..seq_len {
            let start = t * stride + head * head_dim;
            out.extend_from_slice(&data[start..start + head_dim]);
        }
        self.copy_from_host_f32(&out, &[seq_len, head_dim])
    }

    /// Apply causal mask: `scores[q][k] = -inf` for `k > kv_len - seq_len + q`.
    ///
    /// Input/output: `[seq_len, kv_len]`.
    fn apply_causal_mask(
        &self,
        scores: &Self::Tensor,
        seq_len: usize,
        kv_len: usize,
    ) -> Result<Self::Tensor> {
        let mut data = self.copy_to_host_f32(scores)?;
        for q_pos in 0..seq_len {
            let abs_pos = kv_len - seq_len + q_pos;
            for k_pos in (abs_pos + 1)..kv_len {
                data[q_pos * kv_len + k_pos] = f32::NEG_INFINITY;
            }
        }
        self.copy_from_host_f32(&data, scores.shape())
    }

    /// Extract rows `[start_row..start_row+num_rows]` from a tensor.
    /// Input: `[total_rows, cols...]`, Output: `[num_rows, cols...]`.
    fn slice_rows(
        &self,
        tensor: &Self::Tensor,
        start_row: usize,
        num_rows: usize,
    ) -> Result<Self::Tensor> {
        let shape = tensor.shape();
        if shape.is_empty() || start_row + num_rows > shape[0] {
            return Err(StrataError::InvalidArgument(format!(
                "rows {start_row}..{} out of range for shape {shape:?}",
                start_row + num_rows
            )));
        }
        let cols: usize = shape[1..].iter().product();
        let data = self.copy_to_host_f32(tensor)?;
        let offset = start_row * cols;
        let len = num_rows * cols;
        let mut out_shape = shape.to_vec();
        out_shape[0] = num_rows;
        self.copy_from_host_f32(&data[offset..offset + len], &out_shape)
    }

    /// Interleave per-head `[seq_len, head_dim]` outputs → `[seq_len, num_heads * head_dim]`.
    fn interleave_heads(
        &self,
        heads: &[&Self::Tensor],
        seq_len: usize,
        head_dim: usize,
    ) -> Result<Self::Tensor> {
        let num_heads = heads.len();
        let mut head_data: Vec<Vec<f32>> = Vec::with_capacity(num_heads);
        for h in heads {
            head_data.push(self.copy_to_host_f32(h)?);
        }
        let mut result = Vec::with_capacity(seq_len * num_heads * head_dim);
        for t in 0..seq_len {
            for data in &head_data {
                let offset = t * head_dim;
                result.extend_from_slice(&data[offset..offset + head_dim]);
            }
        }
        self.copy_from_host_f32(&result, &[seq_len, num_heads * head_dim])
    }
}
