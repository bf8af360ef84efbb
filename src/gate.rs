use std::fs;
use std::path::Path;

use anyhow::Result;
use tch::Device;

use crate::config::PRETRAIN_PATH;
use crate::data::Cifar10;
use crate::model::Classifier;
use crate::pretrained;
use crate::train::{self, TrainConfig};

// =============== MODEL CACHE GATE ===============

/// Where the returned model came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    Cached,
    Trained,
}

/// Return a ready-to-evaluate model for `path`.
///
/// If `cache_exists` reports a file at `path`, the full trained model is
/// deserialized from it and training is skipped entirely. Otherwise a fresh
/// model is assembled (pretrained backbone weights injected when available,
/// backbone frozen), trained, and persisted to `path` before returning.
///
/// The existence check is passed in rather than hard-coded so callers can
/// substitute it; the real pipeline uses `Path::is_file`.
pub fn load_or_train<F>(
    path: &Path,
    cache_exists: F,
    data: &Cifar10,
    cfg: &TrainConfig,
    device: Device,
) -> Result<(Classifier, ModelSource)>
where
    F: Fn(&Path) -> bool,
{
    if cache_exists(path) {
        println!("✓ Found trained model at {}, loading.", path.display());
        let clf = Classifier::load(path, device)?;
        return Ok((clf, ModelSource::Cached));
    }

    println!("⚠ No trained model at {}, building it from scratch.", path.display());
    let mut clf = Classifier::new(device);

    if Path::new(PRETRAIN_PATH).is_file() {
        let copied = pretrained::load_pretrained_base(&mut clf.vs, Path::new(PRETRAIN_PATH))?;
        println!("✓ Loaded pretrained backbone ({copied} tensors) from {PRETRAIN_PATH}");
    } else {
        println!("⚠ Pretrained backbone weights not found at {PRETRAIN_PATH}, starting from random init.");
    }

    let frozen = pretrained::freeze_base(&clf.vs);
    println!("✓ Frozen backbone params: {frozen}");

    train::fit(&clf, data, cfg)?;

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    clf.save(path)?;
    println!("✓ Saved trained model to {}", path.display());

    Ok((clf, ModelSource::Trained))
}
