use std::path::Path;

use anyhow::{Context, Result};
use tch::{nn, nn::ModuleT, Device, Kind, Tensor};

use crate::config::{BLOCK_CONFIG, BN_SIZE, DROPOUT, GROWTH_RATE, INIT_FEATURES, NUM_CLASSES};

// =============== MODEL ===============

/// One bottleneck layer of a dense block: BN → ReLU → 1x1 conv → BN → ReLU →
/// 3x3 conv, output concatenated onto the input along the channel axis.
#[derive(Debug)]
struct DenseLayer {
    norm1: nn::BatchNorm,
    conv1: nn::Conv2D,
    norm2: nn::BatchNorm,
    conv2: nn::Conv2D,
}

impl DenseLayer {
    fn new(vs: &nn::Path, in_c: i64, growth: i64) -> Self {
        let bottleneck = BN_SIZE * growth;
        let norm1 = nn::batch_norm2d(&vs.sub("norm1"), in_c, Default::default());
        let conv1 = nn::conv2d(
            &vs.sub("conv1"),
            in_c,
            bottleneck,
            1,
            nn::ConvConfig { bias: false, ..Default::default() },
        );
        let norm2 = nn::batch_norm2d(&vs.sub("norm2"), bottleneck, Default::default());
        let conv2 = nn::conv2d(
            &vs.sub("conv2"),
            bottleneck,
            growth,
            3,
            nn::ConvConfig { padding: 1, bias: false, ..Default::default() },
        );
        Self { norm1, conv1, norm2, conv2 }
    }
}

impl nn::ModuleT for DenseLayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let y = self.norm1.forward_t(xs, train).relu();
        let y = self.conv1.forward_t(&y, train);
        let y = self.norm2.forward_t(&y, train).relu();
        let y = self.conv2.forward_t(&y, train);
        Tensor::cat(&[xs.shallow_clone(), y], 1)
    }
}

/// Transition between dense blocks: BN → ReLU → 1x1 conv halving the channel
/// count → 2x2 average pool.
#[derive(Debug)]
struct Transition {
    norm: nn::BatchNorm,
    conv: nn::Conv2D,
}

impl Transition {
    fn new(vs: &nn::Path, in_c: i64, out_c: i64) -> Self {
        let norm = nn::batch_norm2d(&vs.sub("norm"), in_c, Default::default());
        let conv = nn::conv2d(
            &vs.sub("conv"),
            in_c,
            out_c,
            1,
            nn::ConvConfig { bias: false, ..Default::default() },
        );
        Self { norm, conv }
    }
}

impl nn::ModuleT for Transition {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let y = self.norm.forward_t(xs, train).relu();
        let y = self.conv.forward_t(&y, train);
        y.avg_pool2d_default(2)
    }
}

// base (features) & head (classifier)

/// DenseNet-201 feature extractor. Variable paths mirror torchvision's
/// `features.*` checkpoint naming (minus the prefix) so pretrained weights
/// map over by a string rewrite.
///
/// For 32x32 inputs the spatial extent collapses to 1x1, so the returned
/// width (1920) is also the flattened feature size.
pub fn densenet201_base(vs: &nn::Path) -> (nn::SequentialT, i64) {
    let mut seq = nn::seq_t()
        .add(nn::conv2d(
            &vs.sub("conv0"),
            3,
            INIT_FEATURES,
            7,
            nn::ConvConfig { stride: 2, padding: 3, bias: false, ..Default::default() },
        ))
        .add(nn::batch_norm2d(&vs.sub("norm0"), INIT_FEATURES, Default::default()))
        .add_fn(|x| x.relu())
        .add_fn(|x| x.max_pool2d(&[3, 3], &[2, 2], &[1, 1], &[1, 1], false));

    let mut channels = INIT_FEATURES;
    for (b, &layers) in BLOCK_CONFIG.iter().enumerate() {
        let block_vs = vs.sub(&format!("denseblock{}", b + 1));
        for l in 0..layers {
            let layer_vs = block_vs.sub(&format!("denselayer{}", l + 1));
            seq = seq.add(DenseLayer::new(&layer_vs, channels, GROWTH_RATE));
            channels += GROWTH_RATE;
        }
        if b + 1 < BLOCK_CONFIG.len() {
            let trans_vs = vs.sub(&format!("transition{}", b + 1));
            seq = seq.add(Transition::new(&trans_vs, channels, channels / 2));
            channels /= 2;
        }
    }

    seq = seq
        .add(nn::batch_norm2d(&vs.sub("norm5"), channels, Default::default()))
        .add_fn(|x| x.relu());

    (seq, channels)
}

/// Classification head: flatten → three dropout-guarded dense layers →
/// 10-way softmax.
pub fn classifier_head(vs: &nn::Path, in_features: i64, num_classes: i64) -> nn::SequentialT {
    nn::seq_t()
        .add_fn(|x| x.flat_view())
        .add(nn::linear(&vs.sub("fc1"), in_features, 512, Default::default()))
        .add_fn(|x| x.relu())
        .add_fn_t(|x, train| x.dropout(DROPOUT, train))
        .add(nn::linear(&vs.sub("fc2"), 512, 256, Default::default()))
        .add_fn(|x| x.relu())
        .add_fn_t(|x, train| x.dropout(DROPOUT, train))
        .add(nn::linear(&vs.sub("fc3"), 256, 128, Default::default()))
        .add_fn(|x| x.relu())
        .add_fn_t(|x, train| x.dropout(DROPOUT, train))
        .add(nn::linear(&vs.sub("fc4"), 128, num_classes, Default::default()))
        .add_fn(|x| x.softmax(-1, Kind::Float))
}

#[derive(Debug)]
pub struct DenseNetSplit {
    base: nn::SequentialT,
    head: nn::SequentialT,
}

impl nn::ModuleT for DenseNetSplit {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        // The backbone is frozen; keep its batch norm in inference mode so the
        // running statistics are never touched during head training.
        let features = self.base.forward_t(xs, false);
        self.head.forward_t(&features, train)
    }
}

/// A model handle: the var store owning the weights plus the network built
/// on top of it.
#[derive(Debug)]
pub struct Classifier {
    pub vs: nn::VarStore,
    net: DenseNetSplit,
}

impl Classifier {
    pub fn new(device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let net = {
            let root = vs.root();
            let (base, width) = densenet201_base(&root.sub("base"));
            let head = classifier_head(&root.sub("head"), width, NUM_CLASSES);
            DenseNetSplit { base, head }
        };
        Self { vs, net }
    }

    /// Deserialize a full set of trained weights from `path`. Any mismatch
    /// between the file and the architecture is a fatal, propagated error.
    pub fn load(path: &Path, device: Device) -> Result<Self> {
        let mut clf = Self::new(device);
        clf.vs
            .load(path)
            .with_context(|| format!("load model from {}", path.display()))?;
        Ok(clf)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.vs
            .save(path)
            .with_context(|| format!("save model to {}", path.display()))?;
        Ok(())
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }
}

impl nn::ModuleT for Classifier {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.net.forward_t(xs, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IMG_SIZE;

    #[test]
    fn base_produces_1920_feature_channels() {
        let vs = nn::VarStore::new(Device::Cpu);
        let (base, width) = densenet201_base(&vs.root().sub("base"));
        assert_eq!(width, 1920);

        let xs = Tensor::rand(&[2, 3, IMG_SIZE, IMG_SIZE], (Kind::Float, Device::Cpu));
        let features = tch::no_grad(|| base.forward_t(&xs, false));
        assert_eq!(features.size(), &[2, 1920, 1, 1]);
    }

    #[test]
    fn classifier_outputs_probability_distribution() {
        tch::manual_seed(0);
        let clf = Classifier::new(Device::Cpu);
        let xs = Tensor::rand(&[4, 3, IMG_SIZE, IMG_SIZE], (Kind::Float, Device::Cpu));
        let probs = tch::no_grad(|| clf.forward_t(&xs, false));

        assert_eq!(probs.size(), &[4, NUM_CLASSES]);
        let sums = probs.sum_dim_intlist(&[-1i64][..], false, Kind::Float);
        let ones = Tensor::ones(&[4], (Kind::Float, Device::Cpu));
        assert!(sums.allclose(&ones, 1e-5, 1e-5, false));
        assert!(probs.min().double_value(&[]) >= 0.0);
        assert!(probs.max().double_value(&[]) <= 1.0);
    }

    #[test]
    fn same_seed_gives_identical_initialization() {
        let xs = Tensor::rand(&[1, 3, IMG_SIZE, IMG_SIZE], (Kind::Float, Device::Cpu));

        tch::manual_seed(42);
        let a = Classifier::new(Device::Cpu);
        tch::manual_seed(42);
        let b = Classifier::new(Device::Cpu);

        let pa = tch::no_grad(|| a.forward_t(&xs, false));
        let pb = tch::no_grad(|| b.forward_t(&xs, false));
        assert!(pa.allclose(&pb, 0.0, 0.0, false));
    }
}
