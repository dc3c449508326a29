use std::collections::HashMap;
use std::path::Path;

use memmap2::Mmap;
use safetensors::SafeTensors;
use tracing::debug;

use strata_core::{Backend, BlockConfig, Result, StrataError};

use crate::block::TransformerBlock;
use crate::layers::{GatedMlp, RMSNorm, SelfAttention};

pub struct SafeTensorsLoader {
    mmaps: Vec<Mmap>,
    /// Maps tensor name -> mmap index for O(1) lookup.
    tensor_index: HashMap<String, usize>,
}

impl SafeTensorsLoader {
    pub fn new(model_dir: &Path) -> Result<Self> {
        let mut files: Vec<_> = std::fs::read_dir(model_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .is_some_and(|ext| ext == "safetensors")
            })
            .map(|e| e.path())
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(StrataError::ModelLoad(format!(
                "No .safetensors files found in {:?}",
                model_dir
            )));
        }

        let mmaps = files
            .iter()
            .map(|path| {
                let file = std::fs::File::open(path)?;
                Ok(unsafe { Mmap::map(&file) }?)
            })
            .collect::<std::result::Result<Vec<_>, std::io::Error>>()?;

        let mut tensor_index = HashMap::new();
        for (idx, mmap) in mmaps.iter().enumerate() {
            let tensors = SafeTensors::deserialize(mmap)
                .map_err(|e| StrataError::ModelLoad(e.to_string()))?;
            for name in tensors.names() {
                tensor_index.insert(name.to_string(), idx);
            }
        }
        debug!(files = files.len(), tensors = tensor_index.len(), "indexed safetensors");

        Ok(Self {
            mmaps,
            tensor_index,
        })
    }

    /// Load a specific tensor by name.
    pub fn load_tensor<B: Backend>(&self, name: &str, backend: &B) -> Result<B::Tensor> {
        let idx = self.tensor_index.get(name).ok_or_else(|| {
            StrataError::ModelLoad(format!("Tensor '{}' not found", name))
        })?;
        let tensors = SafeTensors::deserialize(&self.mmaps[*idx])
            .map_err(|e| StrataError::ModelLoad(e.to_string()))?;
        let view = tensors
            .tensor(name)
            .map_err(|e| StrataError::ModelLoad(e.to_string()))?;
        let shape: Vec<usize> = view.shape().to_vec();
        view_to_tensor(view, &shape, backend)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensor_index.contains_key(name)
    }
}

fn view_to_tensor<B: Backend>(
    view: safetensors::tensor::TensorView<'_>,
    shape: &[usize],
    backend: &B,
) -> Result<B::Tensor> {
    let data = view.data();
    match view.dtype() {
        safetensors::Dtype::F16 => {
            let f16_data: &[half::f16] = bytemuck::try_cast_slice(data)
                .map_err(|e| StrataError::ModelLoad(format!("F16 alignment error: {e}")))?;
            backend.copy_from_host_f16(f16_data, shape)
        }
        safetensors::Dtype::BF16 => {
            let bf16_data: &[half::bf16] = bytemuck::try_cast_slice(data)
                .map_err(|e| StrataError::ModelLoad(format!("BF16 alignment error: {e}")))?;
            backend.copy_from_host_bf16(bf16_data, shape)
        }
        safetensors::Dtype::F32 => {
            let f32_data: &[f32] = bytemuck::try_cast_slice(data)
                .map_err(|e| StrataError::ModelLoad(format!("F32 alignment error: {e}")))?;
            backend.copy_from_host_f32(f32_data, shape)
        }
        other => Err(StrataError::ModelLoad(format!(
            "Unsupported safetensors dtype: {:?}",
            other
        ))),
    }
}

/// Load and transpose a linear weight: [out, in] -> [in, out].
fn load_linear<B: Backend>(
    loader: &SafeTensorsLoader,
    name: &str,
    backend: &B,
) -> Result<B::Tensor> {
    let raw = loader.load_tensor(name, backend)?;
    backend.transpose(&raw, 0, 1)
}

/// Load one block whose tensors are stored under `prefix` (e.g. `"h.3."`).
///
/// Linear weights are stored `[out_features, in_features]` and transposed at
/// load time so the forward pass can use `matmul(x, W)`.
pub fn load_block<B: Backend>(
    loader: &SafeTensorsLoader,
    prefix: &str,
    config: BlockConfig,
    backend: &B,
) -> Result<TransformerBlock<B>> {
    let linear = |name: &str| load_linear(loader, &format!("{prefix}{name}"), backend);

    let self_attention = SelfAttention::new(
        linear("self_attention.query.weight")?,
        linear("self_attention.key.weight")?,
        linear("self_attention.value.weight")?,
        linear("self_attention.dense.weight")?,
        &config,
    );
    let mlp = GatedMlp::new(
        linear("mlp.gate_proj.weight")?,
        linear("mlp.up_proj.weight")?,
        linear("mlp.down_proj.weight")?,
    );

    let input_layernorm = RMSNorm::new(
        loader.load_tensor(&format!("{prefix}input_layernorm.weight"), backend)?,
        config.rms_norm_eps,
    );
    let post_attention_layernorm = RMSNorm::new(
        loader.load_tensor(&format!("{prefix}post_attention_layernorm.weight"), backend)?,
        config.rms_norm_eps,
    );

    TransformerBlock::new(
        config,
        input_layernorm,
        self_attention,
        post_attention_layernorm,
        mlp,
        backend,
    )
}
