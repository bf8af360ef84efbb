mod config;
mod data;
mod gate;
mod model;
mod pretrained;
mod train;

use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use tch::Device;

use crate::config::{
    BATCH_SIZE, CLASSES, DATA_DIR, MODEL_PATH, PREVIEW_PATH, SAMPLES_DIR, SAMPLE_INDICES, SEED,
};
use crate::gate::ModelSource;
use crate::train::TrainConfig;

// =============== MAIN ===============

fn main() -> Result<()> {
    let start_time = Instant::now();
    tch::set_num_threads(num_cpus::get() as i32);
    tch::set_num_interop_threads(1);
    tch::manual_seed(SEED);
    let device = Device::cuda_if_available();
    println!("Using device: {:?} | threads: {}", device, num_cpus::get());

    let data = data::load(DATA_DIR)?;
    data::save_preview_grid(&data.train_images, 100, Path::new(PREVIEW_PATH))?;
    println!("✓ Wrote training-data preview to {PREVIEW_PATH}\n");

    let (clf, source) = gate::load_or_train(
        Path::new(MODEL_PATH),
        |p| p.is_file(),
        &data,
        &TrainConfig::default(),
        device,
    )?;
    if source == ModelSource::Cached {
        println!("Skipped training, reusing the cached model.\n");
    }

    println!("\nEvaluating on test data...");
    let (test_loss, test_acc) =
        train::evaluate(&clf, &data.test_images, &data.test_labels, BATCH_SIZE);
    println!(
        "✓ Test loss: {:.4} | accuracy: {:.4}%",
        test_loss,
        test_acc * 100.0
    );

    // run the network over the test split and inspect a few fixed positions
    let results = train::predict(&clf, &data.test_images, BATCH_SIZE);
    fs::create_dir_all(SAMPLES_DIR)?;
    println!("\nSample predictions:");
    for &n in SAMPLE_INDICES.iter() {
        let predicted = CLASSES[results.get(n).argmax(-1, false).int64_value(&[]) as usize];
        let actual = CLASSES[data.test_labels.get(n).argmax(-1, false).int64_value(&[]) as usize];
        let out = format!("{SAMPLES_DIR}/test_{n:04}.png");
        data::save_png(&data.test_images.get(n), Path::new(&out))?;
        println!("  #{n}: predicted '{predicted}' | actual '{actual}' → {out}");
    }

    println!("\n⏱ Total time: {:.2}s", start_time.elapsed().as_secs_f64());
    Ok(())
}
