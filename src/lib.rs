pub mod checkpoint;
pub mod config;
pub mod data_loader;
pub mod history;
pub mod logging;
pub mod model;
pub mod plot;
pub mod scheduler;
pub mod transforms;

use std::{fmt, time::Duration, time::Instant};

use anyhow::Result;
use data_loader::{BatchSource, ToDevice};
use history::{BestTracker, History, PhaseMeter, PhaseMetrics};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use model::WeightSnapshot;
use scheduler::StepLr;
use tch::{
    nn::{self, ModuleT},
    Device, Kind, Tensor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Validation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Train => write!(f, "train"),
            Phase::Validation => write!(f, "val"),
        }
    }
}

/// `12m 5s`
pub fn format_min_sec(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}m {}s", secs / 60, secs % 60)
}

/// `1:02:03`, whole seconds only.
pub fn format_hms(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

fn batch_bar(len: u64, phase: Phase) -> ProgressBar {
    let pb = logging::progress().add(ProgressBar::new(len));
    if let Ok(style) = ProgressStyle::with_template(
        "  [{prefix}] {elapsed_precise} {bar:40.cyan/blue} {pos}/{len} {msg}",
    ) {
        pb.set_style(style);
    }
    pb.set_prefix(phase.to_string());
    pb
}

fn count_correct(logits: &Tensor, labels: &Tensor) -> i64 {
    logits
        .argmax(-1, false)
        .eq_tensor(labels)
        .sum(Kind::Int64)
        .int64_value(&[])
}

/// One pass over `source`. Parameters are only updated in the train phase;
/// the validation phase runs in eval mode without gradient tracking.
pub fn run_phase<M: ModuleT>(
    model: &M,
    opt: &mut nn::Optimizer,
    source: &mut dyn BatchSource,
    phase: Phase,
    device: Device,
) -> Result<PhaseMetrics> {
    let pb = batch_bar(source.num_samples() as u64, phase);
    let mut meter = PhaseMeter::default();
    for batch in source.batches() {
        let batch = batch?.to_device(device);
        let (loss, correct) = match phase {
            Phase::Train => {
                let logits = model.forward_t(&batch.images, true);
                let loss = logits.cross_entropy_for_logits(&batch.labels);
                opt.backward_step(&loss);
                (loss.double_value(&[]), count_correct(&logits, &batch.labels))
            }
            Phase::Validation => tch::no_grad(|| {
                let logits = model.forward_t(&batch.images, false);
                let loss = logits.cross_entropy_for_logits(&batch.labels);
                (loss.double_value(&[]), count_correct(&logits, &batch.labels))
            }),
        };
        meter.update(loss, correct, batch.len() as i64);
        pb.inc(batch.len() as u64);
        pb.set_message(format!("loss {:.4}", loss));
    }
    pb.finish_and_clear();
    Ok(meter.finish())
}

#[derive(Debug)]
pub struct TrainingOutcome {
    pub best_epoch: Option<usize>,
    pub best_accuracy: f64,
    pub history: History,
    pub elapsed: Duration,
}

/// Alternates train and validation phases for `num_epochs`, stepping the
/// scheduler after each train phase, and leaves `vs` holding the weights of the
/// epoch with the highest validation accuracy.
#[allow(clippy::too_many_arguments)]
pub fn train_model<M: ModuleT>(
    model: &M,
    vs: &nn::VarStore,
    opt: &mut nn::Optimizer,
    scheduler: &mut StepLr,
    train: &mut dyn BatchSource,
    validation: &mut dyn BatchSource,
    num_epochs: usize,
    device: Device,
) -> Result<TrainingOutcome> {
    let since = Instant::now();
    let mut best = BestTracker::new(WeightSnapshot::capture(vs));
    let mut history = History::default();

    let epoch_pb = logging::progress().add(ProgressBar::new(num_epochs as u64));
    if let Ok(style) = ProgressStyle::with_template("[Epoch {pos}/{len}] {wide_msg}") {
        epoch_pb.set_style(style);
    }

    for epoch in 0..num_epochs {
        info!("Epoch {}/{}", epoch, num_epochs.saturating_sub(1));
        info!("{}", "-".repeat(10));
        let epoch_start = Instant::now();

        let lr = scheduler.lr();
        let train_metrics = run_phase(model, opt, train, Phase::Train, device)?;
        scheduler.step(opt);
        info!(
            "{} Loss: {:.4} Acc: {:.4}",
            Phase::Train,
            train_metrics.loss,
            train_metrics.accuracy
        );

        let val_metrics = run_phase(model, opt, validation, Phase::Validation, device)?;
        info!(
            "{} Loss: {:.4} Acc: {:.4}",
            Phase::Validation,
            val_metrics.loss,
            val_metrics.accuracy
        );
        history.push(lr, train_metrics, val_metrics);

        if best.observe(epoch, val_metrics.accuracy, || WeightSnapshot::capture(vs)) {
            info!("==> best model saved - {} / {:.1}", epoch, val_metrics.accuracy);
        }

        info!(
            "Training epochs {} in {}",
            epoch,
            format_min_sec(epoch_start.elapsed())
        );
        info!("");
        epoch_pb.set_message(format!("val acc {:.2}%", val_metrics.accuracy));
        epoch_pb.inc(1);
    }
    epoch_pb.finish_and_clear();

    let elapsed = since.elapsed();
    info!("Training complete in {}", format_min_sec(elapsed));
    match best.epoch() {
        Some(epoch) => info!("Best valid Acc: {} - {:.1}", epoch, best.accuracy()),
        None => warn!("validation accuracy never rose above 0, keeping the initial weights"),
    }
    best.payload().restore(vs)?;

    Ok(TrainingOutcome {
        best_epoch: best.epoch(),
        best_accuracy: best.accuracy(),
        history,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use tch::{
        nn::{self, ModuleT, OptimizerConfig},
        Device, Kind, Tensor,
    };

    use super::{format_hms, format_min_sec, run_phase, train_model, Phase};
    use crate::{
        data_loader::{Batch, BatchSource, TensorLoader},
        scheduler::StepLr,
    };

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Always predicts class 0 but still receives gradients.
    #[derive(Debug)]
    struct Biased {
        w: Tensor,
        offset: Tensor,
    }

    impl Biased {
        fn new(vs: &nn::Path) -> Biased {
            Biased {
                w: vs.randn_standard("w", &[2, 2]),
                offset: Tensor::of_slice(&[1000.0f32, 0.0]),
            }
        }
    }

    impl ModuleT for Biased {
        fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
            xs.matmul(&self.w) + &self.offset
        }
    }

    /// Yields one validation batch per epoch with scripted labels and records
    /// the watched weights each time an epoch starts.
    struct Scripted {
        labels: Vec<Vec<i64>>,
        epoch: usize,
        watched: Tensor,
        seen: Vec<Tensor>,
    }

    impl BatchSource for Scripted {
        fn num_samples(&self) -> usize {
            4
        }

        fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
            self.seen.push(self.watched.detach().copy());
            let labels = Tensor::of_slice(&self.labels[self.epoch]);
            self.epoch += 1;
            let batch = Batch {
                images: Tensor::ones(&[4, 2], (Kind::Float, Device::Cpu)),
                labels,
            };
            Box::new(std::iter::once(Ok(batch)))
        }
    }

    fn gen_train_loader() -> TensorLoader {
        TensorLoader::new(
            Tensor::ones(&[4, 2], (Kind::Float, Device::Cpu)),
            Tensor::of_slice(&[1i64, 1, 1, 1]),
            2,
        )
    }

    #[test]
    fn test_train_phase_updates_and_validation_does_not() -> Result<()> {
        init();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = nn::linear(vs.root(), 2, 2, Default::default());
        let mut opt = nn::Adam::default().build(&vs, 1e-2)?;
        let weight = || vs.variables()["weight"].detach().copy();

        let before = weight();
        let metrics = run_phase(&model, &mut opt, &mut gen_train_loader(), Phase::Validation, Device::Cpu)?;
        assert_eq!(weight(), before);
        assert!(metrics.loss > 0.0);

        run_phase(&model, &mut opt, &mut gen_train_loader(), Phase::Train, Device::Cpu)?;
        assert!(weight() != before);
        Ok(())
    }

    #[test]
    fn test_phase_accuracy_is_percentage() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = Biased::new(&vs.root());
        let mut opt = nn::Sgd::default().build(&vs, 0.0)?;
        let mut loader = TensorLoader::new(
            Tensor::ones(&[6, 2], (Kind::Float, Device::Cpu)),
            Tensor::of_slice(&[0i64, 0, 0, 1, 1, 0]),
            4,
        );
        let metrics = run_phase(&model, &mut opt, &mut loader, Phase::Validation, Device::Cpu)?;
        assert!((metrics.accuracy - 4.0 / 6.0 * 100.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_train_model_restores_best_weights() -> Result<()> {
        init();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = Biased::new(&vs.root());
        let mut opt = nn::Adam::default().build(&vs, 1e-2)?;
        let mut scheduler = StepLr::new(1e-2, 2, 0.1);
        let mut validation = Scripted {
            labels: vec![vec![0, 1, 1, 1], vec![0, 0, 0, 1], vec![0, 0, 1, 1]],
            epoch: 0,
            watched: vs.variables()["w"].shallow_clone(),
            seen: vec![],
        };

        let outcome = train_model(
            &model,
            &vs,
            &mut opt,
            &mut scheduler,
            &mut gen_train_loader(),
            &mut validation,
            3,
            Device::Cpu,
        )?;

        assert_eq!(outcome.best_epoch, Some(1));
        assert_eq!(outcome.best_accuracy, 75.0);
        assert_eq!(outcome.history.val_acc, vec![25.0, 75.0, 50.0]);
        assert_eq!(outcome.history.len(), 3);
        assert_eq!(scheduler.epoch(), 3);
        assert!((outcome.history.learning_rate[2] - 1e-3).abs() < 1e-12);

        let restored = vs.variables()["w"].detach().copy();
        assert!(validation.seen[1] != validation.seen[2]);
        assert_eq!(restored, validation.seen[1]);
        Ok(())
    }

    #[test]
    fn test_train_model_without_improvement_keeps_initial_weights() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = Biased::new(&vs.root());
        let initial = vs.variables()["w"].detach().copy();
        let mut opt = nn::Adam::default().build(&vs, 1e-2)?;
        let mut scheduler = StepLr::new(1e-2, 7, 0.1);
        let mut validation = Scripted {
            labels: vec![vec![1, 1, 1, 1], vec![1, 1, 1, 1]],
            epoch: 0,
            watched: vs.variables()["w"].shallow_clone(),
            seen: vec![],
        };
        let outcome = train_model(
            &model,
            &vs,
            &mut opt,
            &mut scheduler,
            &mut gen_train_loader(),
            &mut validation,
            2,
            Device::Cpu,
        )?;
        assert_eq!(outcome.best_epoch, None);
        assert_eq!(vs.variables()["w"], initial);
        Ok(())
    }

    #[test]
    fn test_duration_formats() {
        assert_eq!(format_min_sec(Duration::from_secs(725)), "12m 5s");
        assert_eq!(format_hms(Duration::from_secs(3723)), "1:02:03");
        assert_eq!(format_hms(Duration::from_millis(59_900)), "0:00:59");
    }
}
