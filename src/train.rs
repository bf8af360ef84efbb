use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tch::{nn, nn::ModuleT, nn::OptimizerConfig, Device, Kind, Tensor};

use crate::config;
use crate::data::Cifar10;
use crate::model::Classifier;

// =============== TRAIN/EVAL ===============

/// Fixed training knobs, defaulting to the values used for the real run.
/// Tests substitute tiny values.
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: i64,
    pub validation_split: f64,
    pub learning_rate: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: config::EPOCHS,
            batch_size: config::BATCH_SIZE,
            validation_split: config::VALIDATION_SPLIT,
            learning_rate: config::LEARNING_RATE,
        }
    }
}

/// Mean categorical cross-entropy between predicted distributions and one-hot
/// targets. The clamp mirrors the usual epsilon guard against log(0).
pub fn categorical_cross_entropy(probs: &Tensor, targets: &Tensor) -> Tensor {
    let log_p = probs.clamp_min(1e-7).log();
    -(targets * log_p)
        .sum_dim_intlist(&[-1i64][..], false, Kind::Float)
        .mean(Kind::Float)
}

fn correct_count(probs: &Tensor, targets: &Tensor) -> i64 {
    let preds = probs.argmax(-1, false);
    let truth = targets.argmax(-1, false);
    preds.eq_tensor(&truth).sum(Kind::Int64).int64_value(&[])
}

/// Fraction of rows where the argmax prediction matches the one-hot target.
pub fn accuracy(probs: &Tensor, targets: &Tensor) -> f64 {
    let n = probs.size()[0];
    if n == 0 {
        return 0.0;
    }
    correct_count(probs, targets) as f64 / n as f64
}

/// Hold out the last `split` fraction of rows, unshuffled, for validation.
/// The count floors, so a fraction that does not divide evenly loses the
/// remainder to the fit portion.
fn split_holdout(
    images: &Tensor,
    labels: &Tensor,
    split: f64,
) -> (Tensor, Tensor, Tensor, Tensor) {
    let n = images.size()[0];
    let n_val = (n as f64 * split) as i64;
    let n_fit = n - n_val;
    (
        images.narrow(0, 0, n_fit),
        labels.narrow(0, 0, n_fit),
        images.narrow(0, n_fit, n_val),
        labels.narrow(0, n_fit, n_val),
    )
}

/// Train the classification head against the training split, holding out the
/// last `validation_split` fraction for per-epoch validation metrics.
pub fn fit(clf: &Classifier, data: &Cifar10, cfg: &TrainConfig) -> Result<()> {
    let device = clf.device();
    let (fit_images, fit_labels, val_images, val_labels) = split_holdout(
        &data.train_images,
        &data.train_labels,
        cfg.validation_split,
    );
    let n_fit = fit_images.size()[0];
    let n_val = val_images.size()[0];

    let mut opt = nn::Adam::default().build(&clf.vs, cfg.learning_rate)?;
    let mut rng = StdRng::seed_from_u64(config::SEED as u64);

    println!(
        "Starting training... ({} train / {} validation)\n",
        n_fit, n_val
    );
    let epoch_pb = ProgressBar::new(cfg.epochs as u64);
    epoch_pb.set_style(
        ProgressStyle::with_template(" {spinner:.yellow} [Epoch {pos}/{len}] {wide_msg}")
            .unwrap()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );

    for epoch in 1..=cfg.epochs {
        let mut indices: Vec<i64> = (0..n_fit).collect();
        indices.shuffle(&mut rng);

        let batch_pb = ProgressBar::new(n_fit as u64);
        batch_pb.set_style(
            ProgressStyle::with_template(
                "  [ep {prefix}] {elapsed_precise} │{bar:48.magenta/blue}│ {percent:>3}% {pos}/{len} • {per_sec} it/s • eta {eta_precise} • {msg}"
            )
            .unwrap()
            .progress_chars("█▓░"),
        );
        batch_pb.set_prefix(epoch.to_string());

        let mut loss_sum = 0.0;
        let mut correct = 0i64;
        let mut seen = 0i64;

        for chunk in indices.chunks(cfg.batch_size as usize) {
            let idx = Tensor::from_slice(chunk);
            let bxs = fit_images.index_select(0, &idx).to(device);
            let bys = fit_labels.index_select(0, &idx).to(device);

            let probs = clf.forward_t(&bxs, true);
            let loss = categorical_cross_entropy(&probs, &bys);
            opt.backward_step(&loss);

            let bs = chunk.len() as i64;
            loss_sum += loss.double_value(&[]) * bs as f64;
            correct += correct_count(&probs, &bys);
            seen += bs;

            let running_acc = correct as f64 / seen as f64 * 100.0;
            let running_loss = loss_sum / seen as f64;
            batch_pb.set_message(format!("loss {running_loss:.4} • acc {running_acc:.2}%"));
            batch_pb.inc(bs as u64);
        }
        batch_pb.finish_and_clear();

        if n_val > 0 {
            let (val_loss, val_acc) = evaluate(clf, &val_images, &val_labels, cfg.batch_size);
            epoch_pb.set_message(format!(
                "val_loss {val_loss:.4} • val_acc {:.2}%",
                val_acc * 100.0
            ));
        }
        epoch_pb.inc(1);
    }
    epoch_pb.finish_with_message("training done");
    Ok(())
}

/// Streamed evaluation: mean loss and accuracy over the given split.
pub fn evaluate(clf: &Classifier, images: &Tensor, labels: &Tensor, batch_size: i64) -> (f64, f64) {
    let device = clf.device();
    let n = images.size()[0];
    let mut loss_sum = 0.0;
    let mut correct = 0i64;

    let mut start = 0i64;
    while start < n {
        let len = batch_size.min(n - start);
        let bxs = images.narrow(0, start, len).to(device);
        let bys = labels.narrow(0, start, len).to(device);
        let probs = tch::no_grad(|| clf.forward_t(&bxs, false));
        loss_sum += categorical_cross_entropy(&probs, &bys).double_value(&[]) * len as f64;
        correct += correct_count(&probs, &bys);
        start += len;
    }

    if n == 0 {
        return (0.0, 0.0);
    }
    (loss_sum / n as f64, correct as f64 / n as f64)
}

/// Run the model over `images` in batches and gather the predicted
/// distributions on the CPU.
pub fn predict(clf: &Classifier, images: &Tensor, batch_size: i64) -> Tensor {
    let device = clf.device();
    let n = images.size()[0];
    if n == 0 {
        return Tensor::zeros(&[0, config::NUM_CLASSES], (Kind::Float, Device::Cpu));
    }
    let mut chunks = Vec::new();

    let mut start = 0i64;
    while start < n {
        let len = batch_size.min(n - start);
        let bxs = images.narrow(0, start, len).to(device);
        let probs = tch::no_grad(|| clf.forward_t(&bxs, false));
        chunks.push(probs.to(Device::Cpu));
        start += len;
    }
    Tensor::cat(&chunks, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CLASSES, IMG_SIZE, NUM_CLASSES};
    use crate::data::one_hot;

    #[test]
    fn holdout_floors_and_takes_the_trailing_rows() {
        // 25 rows at a 0.1 split: floor(2.5) = 2 validation rows, 23 fit rows.
        let images = Tensor::arange(25, (Kind::Float, Device::Cpu)).view([25, 1]);
        let labels = one_hot(&Tensor::arange(25, (Kind::Int64, Device::Cpu)).remainder(10));

        let (fit_i, fit_l, val_i, val_l) = split_holdout(&images, &labels, 0.1);
        assert_eq!(fit_i.size(), &[23, 1]);
        assert_eq!(fit_l.size(), &[23, NUM_CLASSES]);
        assert_eq!(val_i.size(), &[2, 1]);
        assert_eq!(val_l.size(), &[2, NUM_CLASSES]);

        // The holdout is the unshuffled tail of the split.
        assert_eq!(fit_i.get(0).double_value(&[0]), 0.0);
        assert_eq!(val_i.get(0).double_value(&[0]), 23.0);
        assert_eq!(val_i.get(1).double_value(&[0]), 24.0);
        assert_eq!(val_l.get(1).argmax(-1, false).int64_value(&[]), 4);
    }

    #[test]
    fn predicted_labels_come_from_the_class_table() {
        tch::manual_seed(13);
        let clf = Classifier::new(Device::Cpu);
        let images = Tensor::rand(&[6, 3, IMG_SIZE, IMG_SIZE], (Kind::Float, Device::Cpu));

        let results = predict(&clf, &images, 4);
        assert_eq!(results.size(), &[6, NUM_CLASSES]);
        for n in 0..6 {
            let idx = results.get(n).argmax(-1, false).int64_value(&[]) as usize;
            assert!(idx < CLASSES.len());
            assert!(!CLASSES[idx].is_empty());
        }
    }

    #[test]
    fn predict_handles_an_empty_batch() {
        tch::manual_seed(1);
        let clf = Classifier::new(Device::Cpu);
        let images = Tensor::zeros(&[0, 3, IMG_SIZE, IMG_SIZE], (Kind::Float, Device::Cpu));
        let results = predict(&clf, &images, 4);
        assert_eq!(results.size(), &[0, NUM_CLASSES]);
    }

    #[test]
    fn cross_entropy_of_perfect_prediction_is_zero() {
        let targets = one_hot(&Tensor::from_slice(&[1i64, 4]));
        let loss = categorical_cross_entropy(&targets, &targets).double_value(&[]);
        assert!(loss.abs() < 1e-5);
    }

    #[test]
    fn cross_entropy_of_uniform_prediction_is_ln_classes() {
        let targets = one_hot(&Tensor::from_slice(&[0i64, 7, 3]));
        let uniform = Tensor::full(
            &[3, NUM_CLASSES],
            1.0 / NUM_CLASSES as f64,
            (Kind::Float, Device::Cpu),
        );
        let loss = categorical_cross_entropy(&uniform, &targets).double_value(&[]);
        assert!((loss - (NUM_CLASSES as f64).ln()).abs() < 1e-4);
    }

    #[test]
    fn accuracy_stays_in_unit_interval() {
        tch::manual_seed(7);
        let probs = Tensor::rand(&[32, NUM_CLASSES], (Kind::Float, Device::Cpu))
            .softmax(-1, Kind::Float);
        let targets = one_hot(&Tensor::randint(NUM_CLASSES, &[32], (Kind::Int64, Device::Cpu)));
        let acc = accuracy(&probs, &targets);
        assert!((0.0..=1.0).contains(&acc));
    }

    #[test]
    fn accuracy_of_matching_argmax_is_one() {
        let targets = one_hot(&Tensor::from_slice(&[2i64, 5, 8, 0]));
        assert!((accuracy(&targets, &targets) - 1.0).abs() < 1e-9);
    }
}
