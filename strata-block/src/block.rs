use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use strata_core::{Backend, BlockConfig, Module, Parameter, Result, StrataError, Tensor};

use crate::backward;
use crate::layers::{GatedMlp, RMSNorm, RotaryEmbedding, SelfAttention};

/// A single pre-norm decoder block (attention + MLP with residual connections).
pub struct TransformerBlock<B: Backend> {
    pub(crate) config: BlockConfig,
    pub(crate) input_layernorm: RMSNorm<B>,
    pub(crate) self_attention: SelfAttention<B>,
    pub(crate) post_attention_layernorm: RMSNorm<B>,
    pub(crate) mlp: GatedMlp<B>,
    pub(crate) rotary: RotaryEmbedding<B>,
}

impl<B: Backend> TransformerBlock<B> {
    pub fn new(
        config: BlockConfig,
        input_layernorm: RMSNorm<B>,
        self_attention: SelfAttention<B>,
        post_attention_layernorm: RMSNorm<B>,
        mlp: GatedMlp<B>,
        backend: &B,
    ) -> Result<Self> {
        config.validate()?;
        let rotary = RotaryEmbedding::precompute(&config, backend)?;
        let block = Self {
            config,
            input_layernorm,
            self_attention,
            post_attention_layernorm,
            mlp,
            rotary,
        };
        block.check_shapes()?;
        Ok(block)
    }

    /// Block with weights drawn uniformly from `±1/sqrt(fan_in)`, reproducible per seed.
    pub fn random(config: BlockConfig, seed: u64, backend: &B) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let h = config.hidden_size;
        let inter = config.intermediate_size;

        let mut linear = |fan_in: usize, fan_out: usize| -> Result<B::Tensor> {
            let bound = 1.0 / (fan_in as f32).sqrt();
            let data: Vec<f32> = (0..fan_in * fan_out)
                .map(|_| rng.gen_range(-bound..bound))
                .collect();
            backend.copy_from_host_f32(&data, &[fan_in, fan_out])
        };

        let self_attention =
            SelfAttention::new(linear(h, h)?, linear(h, h)?, linear(h, h)?, linear(h, h)?, &config);
        let mlp = GatedMlp::new(linear(h, inter)?, linear(h, inter)?, linear(inter, h)?);
        let ones = vec![1.0f32; h];
        let input_layernorm =
            RMSNorm::new(backend.copy_from_host_f32(&ones, &[h])?, config.rms_norm_eps);
        let post_attention_layernorm =
            RMSNorm::new(backend.copy_from_host_f32(&ones, &[h])?, config.rms_norm_eps);

        Self::new(
            config,
            input_layernorm,
            self_attention,
            post_attention_layernorm,
            mlp,
            backend,
        )
    }

    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    /// Shape of one attention cache entry: keys then values, `[2 * max_length, hidden]`.
    pub fn attention_cache_shape(&self) -> Vec<usize> {
        vec![2 * self.config.max_length, self.config.hidden_size]
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut Parameter<B::Tensor>> {
        let param = match name {
            "input_layernorm.weight" => &mut self.input_layernorm.weight,
            "self_attention.query.weight" => &mut self.self_attention.query,
            "self_attention.key.weight" => &mut self.self_attention.key,
            "self_attention.value.weight" => &mut self.self_attention.value,
            "self_attention.dense.weight" => &mut self.self_attention.dense,
            "post_attention_layernorm.weight" => &mut self.post_attention_layernorm.weight,
            "mlp.gate_proj.weight" => &mut self.mlp.gate_proj,
            "mlp.up_proj.weight" => &mut self.mlp.up_proj,
            "mlp.down_proj.weight" => &mut self.mlp.down_proj,
            _ => return None,
        };
        Some(param)
    }

    pub fn buffer_mut(&mut self, name: &str) -> Option<&mut Parameter<B::Tensor>> {
        match name {
            "self_attention.rotary.cos" => Some(&mut self.rotary.cos),
            "self_attention.rotary.sin" => Some(&mut self.rotary.sin),
            _ => None,
        }
    }

    /// Run one sequence `x: [seq_len, hidden]` through the block.
    pub fn forward_sequence(&self, x: &B::Tensor, backend: &B) -> Result<B::Tensor> {
        let normed = self.input_layernorm.forward(x, backend)?;
        let attn_out = self.self_attention.forward(&normed, &self.rotary, backend)?;
        let x = backend.add(x, &attn_out)?;

        let normed = self.post_attention_layernorm.forward(&x, backend)?;
        let mlp_out = self.mlp.forward(&normed, backend)?;
        backend.add(&x, &mlp_out)
    }

    /// Batched forward over `hidden: [batch, seq_len, hidden]`.
    pub fn forward_hidden(&self, hidden: &B::Tensor, backend: &B) -> Result<B::Tensor> {
        let (batch, seq_len) = self.check_hidden(hidden)?;
        let h = self.config.hidden_size;
        let mut outputs = Vec::with_capacity(batch);
        for i in 0..batch {
            let row = backend.slice_rows(hidden, i, 1)?;
            let x = backend.reshape(&row, &[seq_len, h])?;
            let y = self.forward_sequence(&x, backend)?;
            outputs.push(backend.reshape(&y, &[1, seq_len, h])?);
        }
        let refs: Vec<&B::Tensor> = outputs.iter().collect();
        backend.cat(&refs, 0)
    }

    /// One incremental step: `hidden: [1, n, hidden]` continues a sequence
    /// whose first `prefix_length` positions are already in `cache`.
    ///
    /// The cache is updated in place; the output equals the matching rows
    /// of a full forward over the whole sequence.
    pub fn forward_incremental(
        &self,
        hidden: &B::Tensor,
        cache: &mut B::Tensor,
        prefix_length: usize,
        backend: &B,
    ) -> Result<B::Tensor> {
        let (batch, new_len) = self.check_hidden(hidden)?;
        if batch != 1 {
            return Err(StrataError::InvalidArgument(format!(
                "incremental inference takes one sequence at a time, got batch {batch}"
            )));
        }
        let h = self.config.hidden_size;
        let x = backend.reshape(hidden, &[new_len, h])?;

        let normed = self.input_layernorm.forward(&x, backend)?;
        let attn_out = self.self_attention.forward_incremental(
            &normed,
            &self.rotary,
            cache,
            prefix_length,
            backend,
        )?;
        let x = backend.add(&x, &attn_out)?;

        let normed = self.post_attention_layernorm.forward(&x, backend)?;
        let mlp_out = self.mlp.forward(&normed, backend)?;
        let y = backend.add(&x, &mlp_out)?;
        backend.reshape(&y, &[1, new_len, h])
    }

    /// Validate `[batch, seq_len, hidden]` and return `(batch, seq_len)`.
    pub(crate) fn check_hidden(&self, hidden: &B::Tensor) -> Result<(usize, usize)> {
        let shape = hidden.shape();
        if shape.len() != 3 || shape[2] != self.config.hidden_size {
            return Err(StrataError::ShapeMismatch {
                expected: vec![0, 0, self.config.hidden_size],
                got: shape.to_vec(),
            });
        }
        if shape[1] > self.config.max_length {
            return Err(StrataError::InvalidArgument(format!(
                "sequence length {} exceeds max_length {}",
                shape[1], self.config.max_length
            )));
        }
        Ok((shape[0], shape[1]))
    }

    fn check_shapes(&self) -> Result<()> {
        let h = self.config.hidden_size;
        let inter = self.config.intermediate_size;
        let expected: [(&str, &Parameter<B::Tensor>, Vec<usize>); 9] = [
            ("input_layernorm.weight", &self.input_layernorm.weight, vec![h]),
            ("self_attention.query.weight", &self.self_attention.query, vec![h, h]),
            ("self_attention.key.weight", &self.self_attention.key, vec![h, h]),
            ("self_attention.value.weight", &self.self_attention.value, vec![h, h]),
            ("self_attention.dense.weight", &self.self_attention.dense, vec![h, h]),
            ("post_attention_layernorm.weight", &self.post_attention_layernorm.weight, vec![h]),
            ("mlp.gate_proj.weight", &self.mlp.gate_proj, vec![h, inter]),
            ("mlp.up_proj.weight", &self.mlp.up_proj, vec![h, inter]),
            ("mlp.down_proj.weight", &self.mlp.down_proj, vec![inter, h]),
        ];
        for (name, param, shape) in expected {
            if param.tensor.shape() != shape.as_slice() {
                return Err(StrataError::ModelLoad(format!(
                    "{name}: expected shape {shape:?}, got {:?}",
                    param.tensor.shape()
                )));
            }
        }
        Ok(())
    }
}

impl<B: Backend> Module<B> for TransformerBlock<B> {
    fn forward(&self, inputs: &[B::Tensor], backend: &B) -> Result<Vec<B::Tensor>> {
        let hidden = inputs.first().ok_or_else(|| {
            StrataError::InvalidArgument("forward expects hidden states".into())
        })?;
        Ok(vec![self.forward_hidden(hidden, backend)?])
    }

    fn backward(
        &self,
        inputs: &[B::Tensor],
        grad_outputs: &[B::Tensor],
        backend: &B,
    ) -> Result<Vec<B::Tensor>> {
        let (hidden, grad_output) = match (inputs.first(), grad_outputs.first()) {
            (Some(h), Some(g)) => (h, g),
            _ => {
                return Err(StrataError::InvalidArgument(
                    "backward expects hidden states and output gradients".into(),
                ))
            }
        };
        if hidden.shape() != grad_output.shape() {
            return Err(StrataError::ShapeMismatch {
                expected: hidden.shape().to_vec(),
                got: grad_output.shape().to_vec(),
            });
        }
        Ok(vec![backward::input_gradient(self, hidden, grad_output, backend)?])
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter<B::Tensor>)> {
        vec![
            ("input_layernorm.weight".into(), &self.input_layernorm.weight),
            ("self_attention.query.weight".into(), &self.self_attention.query),
            ("self_attention.key.weight".into(), &self.self_attention.key),
            ("self_attention.value.weight".into(), &self.self_attention.value),
            ("self_attention.dense.weight".into(), &self.self_attention.dense),
            ("post_attention_layernorm.weight".into(), &self.post_attention_layernorm.weight),
            ("mlp.gate_proj.weight".into(), &self.mlp.gate_proj),
            ("mlp.up_proj.weight".into(), &self.mlp.up_proj),
            ("mlp.down_proj.weight".into(), &self.mlp.down_proj),
        ]
    }

    fn named_buffers(&self) -> Vec<(String, &Parameter<B::Tensor>)> {
        vec![
            ("self_attention.rotary.cos".into(), &self.rotary.cos),
            ("self_attention.rotary.sin".into(), &self.rotary.sin),
        ]
    }
}
