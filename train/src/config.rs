//! Training program configuration format.

use crate::common::*;

pub use dataset::*;
pub use model::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub dataset: DatasetConfig,
    pub logging: LoggingConfig,
    pub training: TrainingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let HW { h, w } = self.model.input_size;
        ensure!(
            h > 0 && w > 0 && h % 32 == 0 && w % 32 == 0,
            "input size {}x{} must be a positive multiple of 32",
            h,
            w
        );
        let val_split = self.dataset.val_split.raw();
        ensure!(
            (0.0..1.0).contains(&val_split),
            "val_split must be in range [0, 1), but get {}",
            val_split
        );
        let TrainingConfig {
            ref fine_tune,
            ref reduce_lr,
            ref checkpoint,
            ..
        } = self.training;
        ensure!(
            fine_tune.initial_epoch <= fine_tune.epochs,
            "fine_tune.initial_epoch ({}) must not exceed fine_tune.epochs ({})",
            fine_tune.initial_epoch,
            fine_tune.epochs
        );
        ensure!(
            reduce_lr.factor.raw() > 0.0 && reduce_lr.factor.raw() < 1.0,
            "reduce_lr.factor must be in range (0, 1)"
        );
        ensure!(checkpoint.period > 0, "checkpoint.period must be positive");
        Ok(())
    }
}

mod model {
    use super::*;

    /// The network options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelConfig {
        /// The anchor file. Its first line lists 9 `w,h` pairs, coarse scale first.
        pub anchors_file: PathBuf,
        /// Pretrained weights, loaded by variable name before training.
        pub weights_file: Option<PathBuf>,
        /// The network input size. Both sides must be multiples of 32.
        #[serde(default = "default_input_size")]
        pub input_size: HW<usize>,
        /// The channel count of the first backbone layer.
        #[serde(default = "default_base_channels")]
        pub base_channels: NonZeroUsize,
    }

    fn default_input_size() -> HW<usize> {
        HW::new(416, 416)
    }

    fn default_base_channels() -> NonZeroUsize {
        NonZeroUsize::new(16).unwrap()
    }
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Every run creates a timestamped directory here.
    pub dir: PathBuf,
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        /// Lines of `image x_min,y_min,x_max,y_max,class ...`.
        pub annotation_file: PathBuf,
        /// One class name per line.
        pub classes_file: PathBuf,
        /// The fraction of records held out for validation.
        #[serde(default = "default_val_split")]
        pub val_split: R64,
        /// The seed of the train/validation split shuffle.
        #[serde(default = "default_split_seed")]
        pub split_seed: u64,
        /// The seed of the augmentation streams. Random if unset.
        #[serde(default)]
        pub shuffle_seed: Option<u64>,
        /// Letterbox and augmentation options.
        #[serde(default)]
        pub preprocessor: LetterboxProducer,
    }

    fn default_val_split() -> R64 {
        r64(0.1)
    }

    fn default_split_seed() -> u64 {
        10101
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        /// The training device.
        #[serde(with = "tch_serde::serde_device", default = "default_device")]
        pub device: Device,
        /// Bottleneck feature cache options.
        #[serde(default)]
        pub bottleneck: BottleneckConfig,
        /// Head training on cached features.
        #[serde(default = "default_head_on_bottlenecks")]
        pub head_on_bottlenecks: StageConfig,
        /// Head training on augmented images.
        #[serde(default = "default_head_on_images")]
        pub head_on_images: StageConfig,
        /// Training of all layers.
        #[serde(default)]
        pub fine_tune: FineTuneConfig,
        #[serde(default)]
        pub checkpoint: CheckpointConfig,
        #[serde(default)]
        pub reduce_lr: ReduceLrConfig,
        #[serde(default)]
        pub early_stopping: EarlyStoppingConfig,
        /// Checkpoint file loading method.
        #[serde(default)]
        pub load_checkpoint: LoadCheckpoint,
        /// If set, batches are produced on a worker thread one step ahead.
        #[serde(default = "default_prefetch")]
        pub prefetch: bool,
    }

    fn default_device() -> Device {
        Device::cuda_if_available()
    }

    fn default_prefetch() -> bool {
        true
    }

    fn default_head_on_bottlenecks() -> StageConfig {
        StageConfig {
            epochs: 10,
            lr: r64(1e-3),
            batch_size: NonZeroUsize::new(8).unwrap(),
        }
    }

    fn default_head_on_images() -> StageConfig {
        StageConfig {
            epochs: 20,
            lr: r64(1e-3),
            batch_size: NonZeroUsize::new(16).unwrap(),
        }
    }

    /// Options of a stage that starts from epoch zero.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct StageConfig {
        pub epochs: usize,
        pub lr: R64,
        pub batch_size: NonZeroUsize,
    }

    /// Fine-tuning options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FineTuneConfig {
        pub initial_epoch: usize,
        /// The exclusive end of the epoch range.
        pub epochs: usize,
        pub lr: R64,
        pub batch_size: NonZeroUsize,
    }

    impl Default for FineTuneConfig {
        fn default() -> Self {
            Self {
                initial_epoch: 30,
                epochs: 45,
                lr: r64(1e-4),
                batch_size: NonZeroUsize::new(4).unwrap(),
            }
        }
    }

    /// Bottleneck feature cache options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct BottleneckConfig {
        /// The tensor file. The fingerprint is stored next to it with a `.json` suffix.
        pub cache_file: PathBuf,
        /// The batch size used to compute the features.
        pub batch_size: NonZeroUsize,
    }

    impl Default for BottleneckConfig {
        fn default() -> Self {
            Self {
                cache_file: PathBuf::from("bottlenecks.pt"),
                batch_size: NonZeroUsize::new(8).unwrap(),
            }
        }
    }

    /// Saves weights when the monitored loss improves.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CheckpointConfig {
        /// Check every this many epochs.
        pub period: usize,
        /// Save only if the monitored loss improves on the best seen.
        pub save_best_only: bool,
    }

    impl Default for CheckpointConfig {
        fn default() -> Self {
            Self {
                period: 3,
                save_best_only: true,
            }
        }
    }

    /// Lowers the learning rate when the monitored loss stops improving.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ReduceLrConfig {
        pub factor: R64,
        pub patience: usize,
        pub min_delta: R64,
        pub cooldown: usize,
        pub min_lr: R64,
    }

    impl Default for ReduceLrConfig {
        fn default() -> Self {
            Self {
                factor: r64(0.1),
                patience: 3,
                min_delta: r64(1e-4),
                cooldown: 0,
                min_lr: r64(0.0),
            }
        }
    }

    /// Stops fine-tuning when the monitored loss stops improving.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EarlyStoppingConfig {
        pub patience: usize,
        pub min_delta: R64,
    }

    impl Default for EarlyStoppingConfig {
        fn default() -> Self {
            Self {
                patience: 10,
                min_delta: r64(0.0),
            }
        }
    }

    /// Checkpoint file loading method.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadCheckpoint {
        /// Disable checkpoint file loading.
        Disabled,
        /// Load the most recent checkpoint file.
        FromRecent,
        /// Load the checkpoint file at specified path.
        FromFile { file: PathBuf },
    }

    impl Default for LoadCheckpoint {
        fn default() -> Self {
            Self::Disabled
        }
    }
}
