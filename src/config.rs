use std::path::PathBuf;

use tch::Device;

use crate::model::Backbone;

pub const CUDA_DEVICE_ORDER: &str = "PCI_BUS_ID";
pub const CUDA_VISIBLE_DEVICES: &str = "3";

pub const BATCH_SIZE: usize = 6;
pub const RANDOM_SEED: u64 = 100;
pub const NUM_CLASSES: i64 = 4;
pub const BACKBONE: Backbone = Backbone::B7;

pub const TRAIN_NAME: &str = "model6";
pub const CHECKPOINT_PREFIX: &str = "aram";
pub const WEIGHTS_DIR: &str = "./scalp_weights/";
pub const PRETRAINED_DIR: &str = "./pretrained/";

pub const NUM_EPOCHS: usize = 15;
pub const LEARNING_RATE: f64 = 1e-4;
pub const LR_STEP_SIZE: usize = 7;
pub const LR_GAMMA: f64 = 0.1;

pub const NUM_WORKERS: usize = 4;

/// Exports the device visibility variables. Must run before libtorch touches CUDA.
pub fn export_device_env() {
    std::env::set_var("CUDA_DEVICE_ORDER", CUDA_DEVICE_ORDER);
    std::env::set_var("CUDA_VISIBLE_DEVICES", CUDA_VISIBLE_DEVICES);
}

pub fn device() -> Device {
    Device::cuda_if_available()
}

/// Every knob of a training run, with paths derived from the run name.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub seed: u64,
    pub num_classes: i64,
    pub backbone: Backbone,
    pub train_name: String,
    pub checkpoint_prefix: String,
    pub data_root: PathBuf,
    pub weights_dir: PathBuf,
    pub pretrained_dir: PathBuf,
    pub output_dir: PathBuf,
    pub num_epochs: usize,
    pub learning_rate: f64,
    pub lr_step_size: usize,
    pub lr_gamma: f64,
    pub num_workers: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            seed: RANDOM_SEED,
            num_classes: NUM_CLASSES,
            backbone: BACKBONE,
            train_name: TRAIN_NAME.to_string(),
            checkpoint_prefix: CHECKPOINT_PREFIX.to_string(),
            data_root: PathBuf::from("."),
            weights_dir: PathBuf::from(WEIGHTS_DIR),
            pretrained_dir: PathBuf::from(PRETRAINED_DIR),
            output_dir: PathBuf::from("."),
            num_epochs: NUM_EPOCHS,
            learning_rate: LEARNING_RATE,
            lr_step_size: LR_STEP_SIZE,
            lr_gamma: LR_GAMMA,
            num_workers: NUM_WORKERS,
        }
    }
}

impl TrainConfig {
    fn split_dir(&self, split: &str) -> PathBuf {
        self.data_root.join(&self.train_name).join(split)
    }

    pub fn train_dir(&self) -> PathBuf {
        self.split_dir("train")
    }

    pub fn validation_dir(&self) -> PathBuf {
        self.split_dir("validation")
    }

    // never read, only reported at startup
    pub fn test_dir(&self) -> PathBuf {
        self.split_dir("test")
    }

    pub fn log_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}predictions.log", self.train_name))
    }

    pub fn plot_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}output_graph.png", self.train_name))
    }

    pub fn history_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}history.csv", self.train_name))
    }

    pub fn full_checkpoint_path(&self) -> PathBuf {
        self.weights_dir.join(format!(
            "{}_{}.pt",
            self.checkpoint_prefix, self.train_name
        ))
    }

    pub fn weights_checkpoint_path(&self) -> PathBuf {
        self.weights_dir.join(format!(
            "president_{}_{}.pt",
            self.checkpoint_prefix, self.train_name
        ))
    }

    pub fn pretrained_path(&self) -> PathBuf {
        self.pretrained_dir
            .join(format!("{}.ot", self.backbone.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::TrainConfig;
    use std::path::Path;

    #[test]
    fn test_default_paths() {
        let config = TrainConfig::default();
        assert_eq!(config.train_dir(), Path::new("./model6/train"));
        assert_eq!(config.validation_dir(), Path::new("./model6/validation"));
        assert_eq!(config.test_dir(), Path::new("./model6/test"));
        assert_eq!(config.log_path(), Path::new("./model6predictions.log"));
        assert_eq!(config.plot_path(), Path::new("./model6output_graph.png"));
        assert_eq!(
            config.full_checkpoint_path(),
            Path::new("./scalp_weights/aram_model6.pt")
        );
        assert_eq!(
            config.weights_checkpoint_path(),
            Path::new("./scalp_weights/president_aram_model6.pt")
        );
        assert_eq!(
            config.pretrained_path(),
            Path::new("./pretrained/efficientnet-b7.ot")
        );
    }

    #[test]
    fn test_default_hyper_params() {
        let config = TrainConfig::default();
        assert_eq!(config.batch_size, 6);
        assert_eq!(config.num_classes, 4);
        assert_eq!(config.num_epochs, 15);
        assert_eq!(config.lr_step_size, 7);
        assert!((config.learning_rate - 1e-4).abs() < f64::EPSILON);
        assert_eq!(config.backbone.image_size(), 600);
    }
}
