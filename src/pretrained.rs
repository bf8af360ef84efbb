use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use bytemuck::cast_slice;
use half::f16;
use safetensors::{tensor::Dtype, SafeTensors};
use tch::{nn, Tensor};

// =============== SAFETENSORS READER ===============

fn load_safetensors_to_map(path: &Path) -> Result<HashMap<String, Tensor>> {
    let bytes = fs::read(path).with_context(|| format!("read file {}", path.display()))?;
    let st = SafeTensors::deserialize(&bytes).context("deserialize safetensors")?;
    let mut map: HashMap<String, Tensor> = HashMap::new();

    for name in st.names() {
        let tv = st.tensor(name).with_context(|| format!("get tensor {name}"))?;
        let shape_i64: Vec<i64> = tv.shape().iter().map(|&d| d as i64).collect();
        let data = tv.data();

        let t = match tv.dtype() {
            Dtype::F32 => {
                let slice: &[f32] = cast_slice(data);
                Tensor::from_slice(slice).reshape(&shape_i64)
            }
            Dtype::F16 => {
                // f16 bits -> f32 via the `half` crate
                let slice_u16: &[u16] = cast_slice(data);
                let vec_f32: Vec<f32> =
                    slice_u16.iter().map(|&h| f16::from_bits(h).to_f32()).collect();
                Tensor::from_slice(&vec_f32).reshape(&shape_i64)
            }
            other => {
                eprintln!("Skipping tensor {name} with unsupported dtype {other:?}");
                continue;
            }
        };

        map.insert(name.to_string(), t);
    }
    Ok(map)
}

// =============== KEY MAPPING ===============

/// Rewrite a checkpoint key to this crate's variable naming.
///
/// Torchvision DenseNet checkpoints store the feature extractor under
/// `features.*` with the same layer names used here, so the rewrite is a
/// prefix swap. Batch-norm step counters and the ImageNet classifier head
/// have no destination and are dropped.
pub fn map_weight_key(key: &str) -> Option<String> {
    if key.ends_with("num_batches_tracked") {
        return None;
    }
    if key.starts_with("base.") {
        // already in our naming (e.g. a re-exported dump), pass through
        return Some(key.to_string());
    }
    key.strip_prefix("features.").map(|rest| format!("base.{rest}"))
}

// copy util: try copy if exists & shape match
fn try_copy(dst: &mut HashMap<String, Tensor>, name: &str, src: &Tensor) -> bool {
    if let Some(d) = dst.get_mut(name) {
        if d.size() == src.size() {
            // weight injection must not be tracked by autograd
            tch::no_grad(|| {
                d.copy_(src);
            });
            return true;
        }
    }
    false
}

/// Copy every mappable, shape-matching tensor from a pretrained checkpoint
/// into the backbone variables of `target_vs`. Returns the number of tensors
/// copied; it is an error if nothing matched.
pub fn load_pretrained_base(target_vs: &mut nn::VarStore, path: &Path) -> Result<usize> {
    let src = load_safetensors_to_map(path)?;
    let mut tgt_vars = target_vs.variables();

    let mut copied = 0usize;
    for (key, tensor) in src.iter() {
        if let Some(dst_name) = map_weight_key(key) {
            if try_copy(&mut tgt_vars, &dst_name, tensor) {
                copied += 1;
            }
        }
    }

    if copied == 0 {
        bail!("no tensors copied from '{}'", path.display());
    }
    Ok(copied)
}

/// Turn off gradients for every backbone variable. Must run before the
/// optimizer is built so the head is the only thing trained.
pub fn freeze_base(vs: &nn::VarStore) -> usize {
    let mut frozen = 0usize;
    for (name, var) in vs.variables().iter() {
        if name.starts_with("base.") {
            let _ = var.set_requires_grad(false);
            frozen += 1;
        }
    }
    frozen
}
