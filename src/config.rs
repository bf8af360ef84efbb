// =============== HYPERPARAM & PATH ===============

pub const IMG_SIZE: i64 = 32;
pub const NUM_CLASSES: i64 = 10;

/// CIFAR-10 class names, index-aligned with the dataset labels.
pub const CLASSES: [&str; 10] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

pub const SEED: i64 = 2023;

pub const EPOCHS: usize = 35;
pub const BATCH_SIZE: i64 = 64;
pub const VALIDATION_SPLIT: f64 = 0.1;
pub const LEARNING_RATE: f64 = 1e-3;
pub const DROPOUT: f64 = 0.5;

// Data & model
pub const DATA_DIR: &str = "data/cifar-10-batches-bin";
pub const MODEL_PATH: &str = "mydensenet.safetensors";
pub const PRETRAIN_PATH: &str = "weights/densenet201_imagenet.safetensors";

// Output rendering
pub const PREVIEW_PATH: &str = "preview.png";
pub const SAMPLES_DIR: &str = "samples";
pub const SAMPLE_INDICES: [i64; 5] = [100, 200, 300, 400, 500];

// DenseNet-201 shape: growth rate, bottleneck multiplier, stem width,
// layers per dense block
pub const GROWTH_RATE: i64 = 32;
pub const BN_SIZE: i64 = 4;
pub const INIT_FEATURES: i64 = 64;
pub const BLOCK_CONFIG: [i64; 4] = [6, 12, 48, 32];
