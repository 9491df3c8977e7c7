use anyhow::{Context, Result};
use log::info;
use scalp_classifier::{
    checkpoint::{self, ModelCard},
    config::{self, TrainConfig},
    data_loader::{DataLoader, ImageFolder},
    format_hms,
    logging,
    model::{load_pretrained, Classifier},
    plot::{self, AccuracyPlot},
    scheduler::StepLr,
    train_model,
    transforms::Compose,
};
use tch::nn::{self, OptimizerConfig};

fn main() -> Result<()> {
    config::export_device_env();
    run(&TrainConfig::default())
}

fn run(config: &TrainConfig) -> Result<()> {
    logging::init(config.log_path())?;
    let start_time = std::time::Instant::now();
    tch::manual_seed(config.seed as i64);
    let device = config::device();
    info!("device: {:?}", device);

    let image_size = config.backbone.image_size();
    info!("{} image size: {}", config.backbone.name(), image_size);

    let vs = nn::VarStore::new(device);
    let model = Classifier::new(&vs.root(), config.backbone, config.num_classes);
    load_pretrained(&vs, config.pretrained_path())?;

    let train_set = ImageFolder::open(config.train_dir())
        .with_context(|| format!("failed to load {}", config.train_dir().display()))?;
    let val_set = ImageFolder::open(config.validation_dir())
        .with_context(|| format!("failed to load {}", config.validation_dir().display()))?;
    train_set.ensure_same_classes(&val_set)?;
    anyhow::ensure!(
        train_set.classes().len() as i64 == config.num_classes,
        "expected {} classes, found {:?}",
        config.num_classes,
        train_set.classes()
    );
    if !config.test_dir().is_dir() {
        info!("no test split at {}", config.test_dir().display());
    }

    info!(
        "batch_size : {},  train/val : {} / {}",
        config.batch_size,
        train_set.len(),
        val_set.len()
    );
    let class_names = train_set.classes().to_vec();
    info!("{:?}", class_names);

    let mut train_loader = DataLoader::new(
        train_set,
        Compose::train(image_size),
        config.batch_size,
        true,
        config.num_workers,
        config.seed,
    )?;
    let mut val_loader = DataLoader::new(
        val_set,
        Compose::validation(image_size),
        config.batch_size,
        false,
        config.num_workers,
        config.seed,
    )?;

    let mut opt = nn::Adam::default().build(&vs, config.learning_rate)?;
    let mut scheduler = StepLr::new(config.learning_rate, config.lr_step_size, config.lr_gamma);

    let outcome = train_model(
        &model,
        &vs,
        &mut opt,
        &mut scheduler,
        &mut train_loader,
        &mut val_loader,
        config.num_epochs,
        device,
    )?;

    let card = ModelCard {
        backbone: config.backbone.name().to_string(),
        num_classes: config.num_classes,
        image_size,
        class_names,
        run_name: config.train_name.clone(),
        best_epoch: outcome.best_epoch,
        best_accuracy: outcome.best_accuracy,
    };
    checkpoint::save_best(
        &vs,
        &card,
        config.full_checkpoint_path(),
        config.weights_checkpoint_path(),
    )?;
    info!("end time : {}", format_hms(start_time.elapsed()));

    let history = &outcome.history;
    if let Some(best) = outcome.best_epoch {
        info!(
            "best model : {} - {:.0} / {:.1}",
            best, history.val_acc[best], history.val_loss[best]
        );
    }
    AccuracyPlot {
        train_acc: &history.train_acc,
        val_acc: &history.val_acc,
        best_epoch: outcome.best_epoch,
    }
    .save(config.plot_path())?;
    plot::show(config.plot_path());
    history.write_csv(config.history_path())?;
    info!(
        "plot saved to {}, history saved to {}",
        config.plot_path().display(),
        config.history_path().display()
    );
    Ok(())
}
