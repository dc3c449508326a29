//! Input gradients of a frozen transformer block.
//!
//! Parameters never accumulate gradients here, so only the gradient with
//! respect to the block input is produced. The forward pass is recomputed on
//! the host per sequence and every intermediate needed by the chain rule is
//! kept in row-major `Vec<f32>` buffers.

use strata_core::{Backend, Result, Tensor};

use crate::block::TransformerBlock;

/// Host copies of the block weights, fetched once per backward call.
struct HostWeights {
    ln1: Vec<f32>,
    wq: Vec<f32>,
    wk: Vec<f32>,
    wv: Vec<f32>,
    wo: Vec<f32>,
    ln2: Vec<f32>,
    w_gate: Vec<f32>,
    w_up: Vec<f32>,
    w_down: Vec<f32>,
    cos: Vec<f32>,
    sin: Vec<f32>,
}

struct Dims {
    hidden: usize,
    inter: usize,
    heads: usize,
    head_dim: usize,
    eps: f32,
}

pub(crate) fn input_gradient<B: Backend>(
    block: &TransformerBlock<B>,
    hidden: &B::Tensor,
    grad_output: &B::Tensor,
    backend: &B,
) -> Result<B::Tensor> {
    let (batch, seq_len) = block.check_hidden(hidden)?;
    let config = block.config();
    let dims = Dims {
        hidden: config.hidden_size,
        inter: config.intermediate_size,
        heads: config.num_attention_heads,
        head_dim: config.head_dim(),
        eps: config.rms_norm_eps,
    };
    let host = |t: &B::Tensor| backend.copy_to_host_f32(t);
    let weights = HostWeights {
        ln1: host(&block.input_layernorm.weight.tensor)?,
        wq: host(&block.self_attention.query.tensor)?,
        wk: host(&block.self_attention.key.tensor)?,
        wv: host(&block.self_attention.value.tensor)?,
        wo: host(&block.self_attention.dense.tensor)?,
        ln2: host(&block.post_attention_layernorm.weight.tensor)?,
        w_gate: host(&block.mlp.gate_proj.tensor)?,
        w_up: host(&block.mlp.up_proj.tensor)?,
        w_down: host(&block.mlp.down_proj.tensor)?,
        cos: host(&block.rotary.cos.tensor)?,
        sin: host(&block.rotary.sin.tensor)?,
    };

    let x_all = host(hidden)?;
    let dy_all = host(grad_output)?;
    let stride = seq_len * dims.hidden;
    let mut dx_all = Vec::with_capacity(x_all.len());
    for b in 0..batch {
        let range = b * stride..(b + 1) * stride;
        dx_all.extend(sequence_gradient(
            &weights,
            &dims,
            &x_all[range.clone()],
            &dy_all[range],
            seq_len,
        ));
    }
    backend.copy_from_host_f32(&dx_all, hidden.shape())
}

fn sequence_gradient(w: &HostWeights, d: &Dims, x: &[f32], dy: &[f32], s: usize) -> Vec<f32> {
    let h = d.hidden;
    let hd = d.head_dim;
    let scale = 1.0 / (hd as f32).sqrt();

    // ── Forward ────────────────────────────────────────────────
    let (n1, r1) = rms_norm(x, &w.ln1, h, d.eps);
    let q = matmul(&n1, s, h, &w.wq, h);
    let k = matmul(&n1, s, h, &w.wk, h);
    let v = matmul(&n1, s, h, &w.wv, h);
    let qr = rope(&q, s, d.heads, hd, &w.cos, &w.sin, false);
    let kr = rope(&k, s, d.heads, hd, &w.cos, &w.sin, false);

    let mut probs = Vec::with_capacity(d.heads);
    let mut attn = vec![0.0f32; s * h];
    for head in 0..d.heads {
        let qh = head_cols(&qr, s, h, head, hd);
        let kh = head_cols(&kr, s, h, head, hd);
        let vh = head_cols(&v, s, h, head, hd);
        let mut p = matmul_bt(&qh, s, hd, &kh, s);
        for i in 0..s {
            let row = &mut p[i * s..(i + 1) * s];
            for (j, score) in row.iter_mut().enumerate() {
                *score = if j > i { f32::NEG_INFINITY } else { *score * scale };
            }
            softmax_in_place(row);
        }
        let oh = matmul(&p, s, s, &vh, hd);
        scatter_head(&mut attn, &oh, s, h, head, hd);
        probs.push(p);
    }

    let a = matmul(&attn, s, h, &w.wo, h);
    let x2: Vec<f32> = x.iter().zip(&a).map(|(xi, ai)| xi + ai).collect();
    let (n2, r2) = rms_norm(&x2, &w.ln2, h, d.eps);
    let g = matmul(&n2, s, h, &w.w_gate, d.inter);
    let u = matmul(&n2, s, h, &w.w_up, d.inter);

    // ── MLP ────────────────────────────────────────────────────
    let dm = matmul_bt(dy, s, h, &w.w_down, d.inter);
    let mut dg = vec![0.0f32; dm.len()];
    let mut du = vec![0.0f32; dm.len()];
    for i in 0..dm.len() {
        let sig = 1.0 / (1.0 + (-g[i]).exp());
        let silu = g[i] * sig;
        dg[i] = dm[i] * u[i] * sig * (1.0 + g[i] * (1.0 - sig));
        du[i] = dm[i] * silu;
    }
    let mut dn2 = matmul_bt(&dg, s, d.inter, &w.w_gate, h);
    add_assign(&mut dn2, &matmul_bt(&du, s, d.inter, &w.w_up, h));
    let mut dx2 = rms_norm_backward(&x2, &w.ln2, &r2, &dn2, h);
    add_assign(&mut dx2, dy);

    // ── Attention ──────────────────────────────────────────────
    let dattn = matmul_bt(&dx2, s, h, &w.wo, h);
    let mut dqr = vec![0.0f32; s * h];
    let mut dkr = vec![0.0f32; s * h];
    let mut dv = vec![0.0f32; s * h];
    for (head, p) in probs.iter().enumerate() {
        let qh = head_cols(&qr, s, h, head, hd);
        let kh = head_cols(&kr, s, h, head, hd);
        let vh = head_cols(&v, s, h, head, hd);
        let doh = head_cols(&dattn, s, h, head, hd);

        let dp = matmul_bt(&doh, s, hd, &vh, s);
        let dvh = matmul_at(p, s, s, &doh, hd);
        let mut ds = vec![0.0f32; s * s];
        for i in 0..s {
            let row = i * s..(i + 1) * s;
            let dot: f32 = p[row.clone()].iter().zip(&dp[row.clone()]).map(|(a, b)| a * b).sum();
            for j in row {
                ds[j] = p[j] * (dp[j] - dot) * scale;
            }
        }
        let dqh = matmul(&ds, s, s, &kh, hd);
        let dkh = matmul_at(&ds, s, s, &qh, hd);
        scatter_head(&mut dqr, &dqh, s, h, head, hd);
        scatter_head(&mut dkr, &dkh, s, h, head, hd);
        scatter_head(&mut dv, &dvh, s, h, head, hd);
    }
    let dq = rope(&dqr, s, d.heads, hd, &w.cos, &w.sin, true);
    let dk = rope(&dkr, s, d.heads, hd, &w.cos, &w.sin, true);

    let mut dn1 = matmul_bt(&dq, s, h, &w.wq, h);
    add_assign(&mut dn1, &matmul_bt(&dk, s, h, &w.wk, h));
    add_assign(&mut dn1, &matmul_bt(&dv, s, h, &w.wv, h));
    let mut dx = rms_norm_backward(x, &w.ln1, &r1, &dn1, h);
    add_assign(&mut dx, &dx2);
    dx
}

/// `a: [m, k] @ b: [k, n]`.
fn matmul(a: &[f32], m: usize, k: usize, b: &[f32], n: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; m * n];
    for i in 0..m {
        for p in 0..k {
            let a_ip = a[i * k + p];
            for j in 0..n {
                c[i * n + j] += a_ip * b[p * n + j];
            }
        }
    }
    c
}

/// `a: [m, n] @ b^T` where `b: [k, n]`.
fn matmul_bt(a: &[f32], m: usize, n: usize, b: &[f32], k: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; m * k];
    for i in 0..m {
        for j in 0..k {
            c[i * k + j] = (0..n).map(|p| a[i * n + p] * b[j * n + p]).sum();
        }
    }
    c
}

/// `a^T @ b` where `a: [m, k]`, `b: [m, n]`.
fn matmul_at(a: &[f32], m: usize, k: usize, b: &[f32], n: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; k * n];
    for i in 0..m {
        for p in 0..k {
            let a_ip = a[i * k + p];
            for j in 0..n {
                c[p * n + j] += a_ip * b[i * n + j];
            }
        }
    }
    c
}

fn add_assign(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

/// Returns the normalized rows and each row's reciprocal RMS.
fn rms_norm(x: &[f32], weight: &[f32], cols: usize, eps: f32) -> (Vec<f32>, Vec<f32>) {
    let rows = x.len() / cols;
    let mut out = vec![0.0f32; x.len()];
    let mut recips = Vec::with_capacity(rows);
    for row in 0..rows {
        let data = &x[row * cols..(row + 1) * cols];
        let ss: f32 = data.iter().map(|v| v * v).sum();
        let r = (ss / cols as f32 + eps).sqrt().recip();
        for col in 0..cols {
            out[row * cols + col] = data[col] * r * weight[col];
        }
        recips.push(r);
    }
    (out, recips)
}

fn rms_norm_backward(x: &[f32], weight: &[f32], recips: &[f32], dy: &[f32], cols: usize) -> Vec<f32> {
    let mut dx = vec![0.0f32; x.len()];
    for (row, &r) in recips.iter().enumerate() {
        let span = row * cols..(row + 1) * cols;
        let xs = &x[span.clone()];
        let dys = &dy[span.clone()];
        let dot: f32 = (0..cols).map(|c| dys[c] * weight[c] * xs[c]).sum();
        let coeff = r * r * r * dot / cols as f32;
        for c in 0..cols {
            dx[span.start + c] = r * weight[c] * dys[c] - coeff * xs[c];
        }
    }
    dx
}

/// Rotary embedding over `[seq, heads * head_dim]`; `inverse` applies the
/// transposed rotation, which is its gradient.
fn rope(
    x: &[f32],
    seq_len: usize,
    heads: usize,
    head_dim: usize,
    cos: &[f32],
    sin: &[f32],
    inverse: bool,
) -> Vec<f32> {
    let half = head_dim / 2;
    let sign = if inverse { -1.0 } else { 1.0 };
    let mut out = vec![0.0f32; x.len()];
    for t in 0..seq_len {
        for head in 0..heads {
            let base = t * heads * head_dim + head * head_dim;
            for i in 0..half {
                let c = cos[t * half + i];
                let s = sign * sin[t * half + i];
                let x0 = x[base + i];
                let x1 = x[base + i + half];
                out[base + i] = x0 * c - x1 * s;
                out[base + i + half] = x0 * s + x1 * c;
            }
        }
    }
    out
}

fn softmax_in_place(row: &mut [f32]) {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
}

/// Columns of `head` from `[seq, hidden]` → `[seq, head_dim]`.
fn head_cols(x: &[f32], seq_len: usize, hidden: usize, head: usize, head_dim: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(seq_len * head_dim);
    for t in 0..seq_len {
        let start = t * hidden + head * head_dim;
        out.extend_from_slice(&x[start..start + head_dim]);
    }
    out
}

fn scatter_head(dst: &mut [f32], src: &[f32], seq_len: usize, hidden: usize, head: usize, head_dim: usize) {
    for t in 0..seq_len {
        let start = t * hidden + head * head_dim;
        dst[start..start + head_dim].copy_from_slice(&src[t * head_dim..(t + 1) * head_dim]);
    }
}
