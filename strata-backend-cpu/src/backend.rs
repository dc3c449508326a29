use strata_core::{Backend, DType, Result, StrataError, Tensor};

use crate::tensor::CpuTensor;

/// CPU backend for Strata block serving.
///
/// All data lives in host memory as `Vec<f32>` wrapped in `Arc`.
/// Every op is pure Rust.
#[derive(Clone)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_shape(data_len: usize, shape: &[usize]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if data_len != expected {
        return Err(StrataError::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![data_len],
        });
    }
    Ok(())
}

fn validate_same_shape(a: &CpuTensor, b: &CpuTensor) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(StrataError::ShapeMismatch {
            expected: a.shape().to_vec(),
            got: b.shape().to_vec(),
        });
    }
    Ok(())
}

fn last_dim(x: &CpuTensor) -> Result<usize> {
    match x.shape().last() {
        Some(&cols) if cols > 0 => Ok(cols),
        _ => Err(StrataError::InvalidArgument(format!(
            "expected a non-empty last dimension, got shape {:?}",
            x.shape()
        ))),
    }
}

impl Backend for CpuBackend {
    type Tensor = CpuTensor;

    fn name(&self) -> &str {
        "cpu"
    }

    // ── Allocation ──────────────────────────────────────────────

    fn allocate_zeros(&self, shape: &[usize], _dtype: DType) -> Result<CpuTensor> {
        // CPU backend stores everything as f32 internally, regardless of requested dtype.
        let numel: usize = shape.iter().product();
        Ok(CpuTensor::new(vec![0.0; numel], shape.to_vec()))
    }

    fn storage_dtype(&self, _requested: DType) -> DType {
        DType::F32
    }

    // ── Data transfer ───────────────────────────────────────────

    fn copy_from_host_f32(&self, data: &[f32], shape: &[usize]) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        Ok(CpuTensor::new(data.to_vec(), shape.to_vec()))
    }

    fn copy_from_host_f16(&self, data: &[half::f16], shape: &[usize]) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        let f32_data: Vec<f32> = data.iter().map(|x| x.to_f32()).collect();
        Ok(CpuTensor::new(f32_data, shape.to_vec()))
    }

    fn copy_from_host_bf16(&self, data: &[half::bf16], shape: &[usize]) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        let f32_data: Vec<f32> = data.iter().map(|x| x.to_f32()).collect();
        Ok(CpuTensor::new(f32_data, shape.to_vec()))
    }

    fn copy_to_host_f32(&self, tensor: &CpuTensor) -> Result<Vec<f32>> {
        Ok(tensor.data().to_vec())
    }

    // ── Synchronization ─────────────────────────────────────────

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    // ── Compute ops ────────────────────────────────────────────

    fn matmul(&self, a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        let a_shape = a.shape();
        let b_shape = b.shape();
        if a_shape.len() != 2 || b_shape.len() != 2 {
            return Err(StrataError::InvalidArgument(
                "matmul requires 2D tensors".into(),
            ));
        }
        let m = a_shape[0];
        let k = a_shape[1];
        let n = b_shape[1];
        if b_shape[0] != k {
            return Err(StrataError::ShapeMismatch {
                expected: vec![k, n],
                got: b_shape.to_vec(),
            });
        }
        let a_data = a.data();
        let b_data = b.data();
        let mut c = vec![0.0f32; m * n];
        // i-k-j order keeps the inner loop contiguous in both b and c.
        for i in 0..m {
            let c_row = &mut c[i * n..(i + 1) * n];
            for p in 0..k {
                let a_ip = a_data[i * k + p];
                if a_ip == 0.0 {
                    continue;
                }
                let b_row = &b_data[p * n..(p + 1) * n];
                for (c_ij, &b_pj) in c_row.iter_mut().zip(b_row) {
                    *c_ij += a_ip * b_pj;
                }
            }
        }
        Ok(CpuTensor::new(c, vec![m, n]))
    }

    fn add(&self, a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        validate_same_shape(a, b)?;
        let data: Vec<f32> = a
            .data()
            .iter()
            .zip(b.data().iter())
            .map(|(x, y)| x + y)
            .collect();
        Ok(CpuTensor::new(data, a.shape().to_vec()))
    }

    fn mul(&self, a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        validate_same_shape(a, b)?;
        let data: Vec<f32> = a
            .data()
            .iter()
            .zip(b.data().iter())
            .map(|(x, y)| x * y)
            .collect();
        Ok(CpuTensor::new(data, a.shape().to_vec()))
    }

    fn mul_scalar(&self, a: &CpuTensor, scalar: f32) -> Result<CpuTensor> {
        let data: Vec<f32> = a.data().iter().map(|x| x * scalar).collect();
        Ok(CpuTensor::new(data, a.shape().to_vec()))
    }

    fn silu(&self, a: &CpuTensor) -> Result<CpuTensor> {
        let data: Vec<f32> = a.data().iter().map(|&x| x / (1.0 + (-x).exp())).collect();
        Ok(CpuTensor::new(data, a.shape().to_vec()))
    }

    fn fused_silu_mul(&self, gate: &CpuTensor, up: &CpuTensor) -> Result<CpuTensor> {
        validate_same_shape(gate, up)?;
        let data: Vec<f32> = gate
            .data()
            .iter()
            .zip(up.data().iter())
            .map(|(&g, &u)| (g / (1.0 + (-g).exp())) * u)
            .collect();
        Ok(CpuTensor::new(data, gate.shape().to_vec()))
    }

    fn rms_norm(&self, x: &CpuTensor, weight: &CpuTensor, eps: f32) -> Result<CpuTensor> {
        let cols = last_dim(x)?;
        if weight.len() != cols {
            return Err(StrataError::ShapeMismatch {
                expected: vec![cols],
                got: weight.shape().to_vec(),
            });
        }
        let rows = x.len() / cols;
        let src = x.data();
        let w = weight.data();
        let mut out = vec![0.0f32; rows * cols];
        for row in 0..rows {
            let row_data = &src[row * cols..(row + 1) * cols];
            let ss: f32 = row_data.iter().map(|v| v * v).sum();
            let rms = (ss / cols as f32 + eps).sqrt().recip();
            for col in 0..cols {
                out[row * cols + col] = row_data[col] * rms * w[col];
            }
        }
        Ok(CpuTensor::new(out, x.shape().to_vec()))
    }

    fn rope(
        &self,
        x: &CpuTensor,
        freqs_cos: &CpuTensor,
        freqs_sin: &CpuTensor,
        position_offset: usize,
    ) -> Result<CpuTensor> {
        let shape = x.shape();
        if shape.len() != 4 {
            return Err(StrataError::InvalidArgument(
                "rope expects 4D tensor [batch, seq_len, heads, head_dim]".into(),
            ));
        }
        let batch = shape[0];
        let seq_len = shape[1];
        let num_heads = shape[2];
        let head_dim = shape[3];
        if head_dim % 2 != 0 {
            return Err(StrataError::InvalidArgument(
                "rope requires even head_dim".into(),
            ));
        }
        let half_dim = head_dim / 2;
        let expected_freq_len = (position_offset + seq_len) * half_dim;
        if freqs_cos.len() < expected_freq_len || freqs_sin.len() < expected_freq_len {
            return Err(StrataError::InvalidArgument(format!(
                "positions up to {} exceed the rotary tables ({} rows)",
                position_offset + seq_len,
                freqs_cos.len() / half_dim.max(1)
            )));
        }
        let src = x.data();
        let cos = freqs_cos.data();
        let sin = freqs_sin.data();
        let mut out = vec![0.0f32; src.len()];
        for b in 0..batch {
            for t in 0..seq_len {
                let pos = position_offset + t;
                for head in 0..num_heads {
                    let base = b * seq_len * num_heads * head_dim
                        + t * num_heads * head_dim
                        + head * head_dim;
                    for h in 0..half_dim {
                        let x0 = src[base + h];
                        let x1 = src[base + h + half_dim];
                        let cos_val = cos[pos * half_dim + h];
                        let sin_val = sin[pos * half_dim + h];
                        out[base + h] = x0 * cos_val - x1 * sin_val;
                        out[base + h + half_dim] = x0 * sin_val + x1 * cos_val;
                    }
                }
            }
        }
        Ok(CpuTensor::new(out, shape.to_vec()))
    }

    fn softmax(&self, x: &CpuTensor, dim: i32) -> Result<CpuTensor> {
        let shape = x.shape();
        let ndim = shape.len() as i32;
        let normalized_dim = if dim < 0 { ndim + dim } else { dim };
        if normalized_dim != ndim - 1 {
            return Err(StrataError::InvalidArgument(format!(
                "softmax only supports last dimension (got dim={dim}, ndim={ndim})"
            )));
        }
        let cols = last_dim(x)?;
        let rows = x.len() / cols;
        let src = x.data();
        let mut out = vec![0.0f32; rows * cols];
        for row in 0..rows {
            let row_data = &src[row * cols..(row + 1) * cols];
            let max_val = row_data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for col in 0..cols {
                let v = (row_data[col] - max_val).exp();
                out[row * cols + col] = v;
                sum += v;
            }
            for col in 0..cols {
                out[row * cols + col] /= sum;
            }
        }
        Ok(CpuTensor::new(out, shape.to_vec()))
    }

    fn reshape(&self, x: &CpuTensor, shape: &[usize]) -> Result<CpuTensor> {
        let numel: usize = shape.iter().product();
        if numel != x.len() {
            return Err(StrataError::ShapeMismatch {
                expected: shape.to_vec(),
                got: x.shape().to_vec(),
            });
        }
        Ok(CpuTensor {
            data: x.data.clone(),
            shape: shape.to_vec(),
            dtype: x.dtype,
        })
    }

    fn transpose(&self, x: &CpuTensor, dim0: usize, dim1: usize) -> Result<CpuTensor> {
        let shape = x.shape();
        if shape.len() != 2 || !((dim0 == 0 && dim1 == 1) || (dim0 == 1 && dim1 == 0)) {
            return Err(StrataError::InvalidArgument(
                "transpose currently only supports 2D tensors with dims (0,1)".into(),
            ));
        }
        let rows = shape[0];
        let cols = shape[1];
        let src = x.data();
        let mut out = vec![0.0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = src[r * cols + c];
            }
        }
        Ok(CpuTensor::new(out, vec![cols, rows]))
    }

    fn cat(&self, tensors: &[&CpuTensor], dim: usize) -> Result<CpuTensor> {
        if tensors.is_empty() {
            return Err(StrataError::InvalidArgument("empty tensor list".into()));
        }
        if dim != 0 {
            return Err(StrataError::InvalidArgument(
                "cat currently only supports dim=0".into(),
            ));
        }
        let first = tensors[0].shape();
        for t in tensors.iter().skip(1) {
            if t.shape().len() != first.len() || t.shape()[1..] != first[1..] {
                return Err(StrataError::ShapeMismatch {
                    expected: first.to_vec(),
                    got: t.shape().to_vec(),
                });
            }
        }
        let total_len: usize = tensors.iter().map(|t| t.len()).sum();
        let mut all_data = Vec::with_capacity(total_len);
        let mut total_first_dim = 0;
        for t in tensors {
            total_first_dim += t.shape()[0];
            all_data.extend_from_slice(t.data());
        }
        let mut out_shape = first.to_vec();
        out_shape[0] = total_first_dim;
        Ok(CpuTensor::new(all_data, out_shape))
    }

    fn write_rows(&self, dst: &mut CpuTensor, start_row: usize, src: &CpuTensor) -> Result<()> {
        let dst_shape = dst.shape().to_vec();
        let src_shape = src.shape();
        if dst_shape.is_empty() || src_shape.is_empty() || dst_shape[1..] != src_shape[1..] {
            return Err(StrataError::ShapeMismatch {
                expected: dst_shape,
                got: src_shape.to_vec(),
            });
        }
        let num_rows = src_shape[0];
        if start_row + num_rows > dst_shape[0] {
            return Err(StrataError::InvalidArgument(format!(
                "writing rows {start_row}..{} into a tensor with {} rows",
                start_row + num_rows,
                dst_shape[0]
            )));
        }
        let cols: usize = dst_shape[1..].iter().product();
        let offset = start_row * cols;
        dst.data_mut()[offset..offset + src.len()].copy_from_slice(src.data());
        Ok(())
    }

    fn slice_rows(
        &self,
        tensor: &CpuTensor,
        start_row: usize,
        num_rows: usize,
    ) -> Result<CpuTensor> {
        let shape = tensor.shape();
        if shape.is_empty() || start_row + num_rows > shape[0] {
            return Err(StrataError::InvalidArgument(format!(
                "rows {start_row}..{} out of range for shape {shape:?}",
                start_row + num_rows
            )));
        }
        let cols: usize = shape[1..].iter().product();
        let offset = start_row * cols;
        let len = num_rows * cols;
        let data = tensor.data()[offset..offset + len].to_vec();
        let mut out_shape = shape.to_vec();
        out_shape[0] = num_rows;
        Ok(CpuTensor::new(data, out_shape))
    }

    fn cast(&self, x: &CpuTensor, _dtype: DType) -> Result<CpuTensor> {
        // CPU backend stores everything as f32 internally, so cast is a no-op.
        Ok(x.clone())
    }
}
