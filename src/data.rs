use std::path::Path;

use anyhow::{Context, Result};
use tch::{Kind, Tensor};

use crate::config::{CLASSES, IMG_SIZE, NUM_CLASSES};

// =============== DATA LOADING ===============

/// Channel statistics used by the ImageNet-pretrained backbone.
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// The full dataset, immutable once loaded: preprocessed NCHW float images and
/// one-hot label rows.
pub struct Cifar10 {
    pub train_images: Tensor,
    pub train_labels: Tensor,
    pub test_images: Tensor,
    pub test_labels: Tensor,
}

/// Read the CIFAR-10 binary batches from `dir`, normalize the images and
/// one-hot encode the labels.
pub fn load(dir: &str) -> Result<Cifar10> {
    let ds = tch::vision::cifar::load_dir(dir)
        .with_context(|| format!("load CIFAR-10 batches from {dir}"))?;

    println!(" Dataset summary:");
    println!("  Train: {} images", ds.train_images.size()[0]);
    println!("  Test:  {} images", ds.test_images.size()[0]);
    println!("  Classes ({}): {:?}\n", NUM_CLASSES, CLASSES);

    Ok(Cifar10 {
        train_images: preprocess_input(&ds.train_images),
        train_labels: one_hot(&ds.train_labels),
        test_images: preprocess_input(&ds.test_images),
        test_labels: one_hot(&ds.test_labels),
    })
}

/// Normalize loader output ([0,1] floats, NCHW) per channel with the ImageNet
/// mean and standard deviation.
pub fn preprocess_input(images: &Tensor) -> Tensor {
    let mean = Tensor::from_slice(&IMAGENET_MEAN).view([1, 3, 1, 1]);
    let std = Tensor::from_slice(&IMAGENET_STD).view([1, 3, 1, 1]);
    (images - mean) / std
}

/// Expand integer class labels to one-hot float rows.
pub fn one_hot(labels: &Tensor) -> Tensor {
    labels.one_hot(NUM_CLASSES).to_kind(Kind::Float)
}

// =============== RENDERING ===============

/// Undo the normalization of a single [3, H, W] image tensor and convert it
/// to an RGB buffer.
pub fn to_rgb(img: &Tensor) -> Result<image::RgbImage> {
    let mean = Tensor::from_slice(&IMAGENET_MEAN).view([3, 1, 1]);
    let std = Tensor::from_slice(&IMAGENET_STD).view([3, 1, 1]);
    let px = ((img * std + mean).clamp(0.0, 1.0) * 255.0).to_kind(Kind::Uint8);
    // CHW -> HWC for the raw buffer
    let px = px.permute(&[1, 2, 0]).contiguous();
    let (h, w) = (px.size()[0] as u32, px.size()[1] as u32);
    let raw = Vec::<u8>::try_from(&px.flatten(0, -1)).context("read image tensor")?;
    image::RgbImage::from_raw(w, h, raw).context("image buffer size mismatch")
}

/// Save one image tensor as a PNG.
pub fn save_png(img: &Tensor, path: &Path) -> Result<()> {
    to_rgb(img)?
        .save(path)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Save a 5x10 grid of images starting at `offset` (a quick visual check of
/// the training data).
pub fn save_preview_grid(images: &Tensor, offset: i64, path: &Path) -> Result<()> {
    const ROWS: u32 = 5;
    const COLS: u32 = 10;
    let tile = IMG_SIZE as u32;

    let mut grid = image::RgbImage::new(COLS * tile, ROWS * tile);
    for row in 0..ROWS {
        for col in 0..COLS {
            let idx = offset + i64::from(row * COLS + col);
            let rgb = to_rgb(&images.get(idx))?;
            image::imageops::replace(
                &mut grid,
                &rgb,
                i64::from(col * tile),
                i64::from(row * tile),
            );
        }
    }
    grid.save(path)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn one_hot_rows_are_unit_vectors() {
        let labels = Tensor::from_slice(&[3i64, 0, 9]);
        let encoded = one_hot(&labels);
        assert_eq!(encoded.size(), &[3, NUM_CLASSES]);
        assert_eq!(encoded.kind(), Kind::Float);
        assert_eq!(encoded.get(0).argmax(-1, false).int64_value(&[]), 3);
        assert_eq!(encoded.get(2).argmax(-1, false).int64_value(&[]), 9);
        let sums = encoded.sum_dim_intlist(&[-1i64][..], false, Kind::Float);
        let ones = Tensor::ones(&[3], (Kind::Float, Device::Cpu));
        assert!(sums.allclose(&ones, 0.0, 0.0, false));
    }

    #[test]
    fn preprocess_centers_channels() {
        let zeros = Tensor::zeros(&[1, 3, 2, 2], (Kind::Float, Device::Cpu));
        let out = preprocess_input(&zeros);
        // A zero pixel maps to -mean/std per channel.
        let red = out.double_value(&[0, 0, 0, 0]);
        assert!((red - (-0.485f64 / 0.229)).abs() < 1e-5);
        let blue = out.double_value(&[0, 2, 0, 0]);
        assert!((blue - (-0.406f64 / 0.225)).abs() < 1e-5);
    }

    #[test]
    fn to_rgb_inverts_preprocessing() {
        // A mid-gray image should survive the normalize/denormalize round trip.
        let img = Tensor::full(
            &[1, 3, IMG_SIZE, IMG_SIZE],
            0.5f64,
            (Kind::Float, Device::Cpu),
        );
        let rgb = to_rgb(&preprocess_input(&img).get(0)).unwrap();
        let px = rgb.get_pixel(0, 0);
        for c in 0..3usize {
            assert!((i32::from(px[c]) - 127).abs() <= 1);
        }
    }
}
