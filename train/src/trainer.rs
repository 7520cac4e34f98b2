//! The training step interface and its libtorch implementation.

use crate::{
    common::*,
    loss::{YoloLoss, YoloLossInit},
    model::{DarknetLite, DetectionOutput},
    phase::{OptimizerSettings, TrainableMask},
};

/// One optimization or evaluation step over a batch.
pub trait TrainingStep {
    /// Applies a trainable mask and starts a fresh optimizer.
    fn configure(&mut self, mask: &TrainableMask, optimizer: &OptimizerSettings) -> Result<()>;

    /// Runs forward and backward passes, updates the trainable parameters and
    /// returns the loss.
    fn train_step(&mut self, batch: &Batch) -> Result<f64>;

    /// Computes the loss without gradients.
    fn eval_step(&mut self, batch: &Batch) -> Result<f64>;

    fn lr(&self) -> f64;

    fn set_lr(&mut self, lr: f64);

    /// Writes every model variable to a file.
    fn save(&self, path: &Path) -> Result<()>;
}

/// Trains [DarknetLite] with Adam on a single device.
pub struct TchTrainer {
    vs: nn::VarStore,
    model: DarknetLite,
    loss_fn: YoloLoss,
    optimizer: nn::Optimizer,
    /// Names of the variables that can ever receive gradients.
    parameters: Vec<String>,
    mask: TrainableMask,
    lr: f64,
}

impl TchTrainer {
    pub fn new(
        device: Device,
        anchors: AnchorSet,
        base_channels: usize,
        num_classes: usize,
    ) -> Result<Self> {
        const DUMMY_LR: f64 = 1.0;

        let vs = nn::VarStore::new(device);
        let model = DarknetLite::new(&vs.root(), base_channels, num_classes);
        let loss_fn = YoloLossInit::new(anchors).build();
        let optimizer = nn::Adam::default().build(&vs, DUMMY_LR)?;
        let parameters: Vec<_> = vs
            .variables()
            .into_iter()
            .filter(|(_, tensor)| tensor.requires_grad())
            .map(|(name, _)| name)
            .sorted()
            .collect();

        Ok(Self {
            vs,
            model,
            loss_fn,
            optimizer,
            parameters,
            mask: TrainableMask::all(),
            lr: DUMMY_LR,
        })
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn mask(&self) -> &TrainableMask {
        &self.mask
    }

    /// Loads the variables found in a weights file by name and keeps the
    /// rest as they are.
    pub fn load_weights<P>(&mut self, path: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let missing = self
            .vs
            .load_partial(path)
            .with_context(|| format!("failed to load weights '{}'", path.display()))?;
        if missing.is_empty() {
            info!("loaded weights '{}'", path.display());
        } else {
            warn!(
                "loaded weights '{}', {} variables are not in the file",
                path.display(),
                missing.len()
            );
            debug!("variables not in '{}': {:?}", path.display(), missing);
        }
        Ok(())
    }

    fn forward(&self, inputs: &BatchInputs, train: bool) -> Result<DetectionOutput> {
        match inputs {
            BatchInputs::Images(images) => {
                let features = if self.mask.backbone {
                    self.model.backbone().forward_t(images, train)?
                } else {
                    tch::no_grad(|| self.model.backbone().forward_t(images, false))?
                };
                Ok(self.model.heads().forward(&features))
            }
            BatchInputs::Features(features) => Ok(self.model.heads().forward(features)),
        }
    }
}

impl TrainingStep for TchTrainer {
    fn configure(&mut self, mask: &TrainableMask, optimizer: &OptimizerSettings) -> Result<()> {
        let variables = self.vs.variables();
        let mut num_trainable = 0;

        for name in &self.parameters {
            let trainable = mask.is_trainable_variable(name);
            if let Some(tensor) = variables.get(name) {
                let _ = tensor.set_requires_grad(trainable);
            }
            if trainable {
                num_trainable += 1;
            }
        }

        self.optimizer = nn::Adam::default().build(&self.vs, optimizer.lr)?;
        self.mask = *mask;
        self.lr = optimizer.lr;

        info!(
            "{} of {} parameters are trainable, lr {:e}",
            num_trainable,
            self.parameters.len(),
            optimizer.lr
        );
        Ok(())
    }

    fn train_step(&mut self, batch: &Batch) -> Result<f64> {
        ensure!(
            self.mask.backbone || self.mask.head,
            "no parameter is trainable"
        );
        let batch = batch.to_device(self.device());
        let output = self.forward(&batch.inputs, true)?;
        let loss = self.loss_fn.forward(&output, &batch.targets)?;
        self.optimizer.backward_step(&loss);
        Ok(f64::from(&loss))
    }

    fn eval_step(&mut self, batch: &Batch) -> Result<f64> {
        tch::no_grad(|| -> Result<f64> {
            let batch = batch.to_device(self.device());
            let output = self.forward(&batch.inputs, false)?;
            let loss = self.loss_fn.forward(&output, &batch.targets)?;
            Ok(f64::from(&loss))
        })
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.optimizer.set_lr(lr);
        self.lr = lr;
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        self.vs
            .save(path)
            .with_context(|| format!("failed to save weights '{}'", path.display()))?;
        Ok(())
    }
}

impl FeatureExtractor for TchTrainer {
    fn extract(&mut self, images: &Tensor) -> Result<BottleneckFeatures> {
        let device = self.device();
        tch::no_grad(|| {
            let images = images.to_device(device);
            self.model.backbone().forward_t(&images, false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use label::{BoxLabel, Label};

    const ANCHORS: &str = "40,40, 50,50, 60,60, 20,20, 25,25, 30,30, 8,8, 10,10, 12,12";

    fn new_trainer() -> TchTrainer {
        tch::manual_seed(1);
        TchTrainer::new(Device::Cpu, AnchorSet::parse(ANCHORS).unwrap(), 2, 2).unwrap()
    }

    fn image_batch() -> Batch {
        let encoder =
            AnchorTargetEncoder::new(HW::new(64, 64), AnchorSet::parse(ANCHORS).unwrap(), 2)
                .unwrap();
        let boxes: Vec<Vec<BoxLabel>> = vec![
            vec![Label {
                rect: TLBR::try_from_corners(16.0, 16.0, 36.0, 36.0).unwrap(),
                class: 1,
            }],
            vec![Label {
                rect: TLBR::try_from_corners(2.0, 4.0, 10.0, 12.0).unwrap(),
                class: 0,
            }],
        ];
        Batch {
            inputs: BatchInputs::Images(Tensor::rand(&[2, 3, 64, 64], FLOAT_CPU)),
            targets: encoder.encode(&boxes).unwrap(),
            placeholder: Tensor::zeros(&[2], FLOAT_CPU),
            sample_ids: vec![0, 1],
        }
    }

    fn snapshot(trainer: &TchTrainer, prefix: &str) -> Vec<(String, Tensor)> {
        trainer
            .var_store()
            .variables()
            .into_iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, tensor)| (name, tensor.detach().copy()))
            .collect()
    }

    fn unchanged(trainer: &TchTrainer, before: &[(String, Tensor)]) -> bool {
        let variables = trainer.var_store().variables();
        before
            .iter()
            .all(|(name, tensor)| variables[name].equal(tensor))
    }

    #[test]
    fn frozen_backbone_is_not_updated() -> Result<()> {
        let mut trainer = new_trainer();
        trainer.configure(&TrainableMask::head_only(), &OptimizerSettings { lr: 1e-2 })?;
        let batch = image_batch();

        let backbone = snapshot(&trainer, "backbone.");
        let head = snapshot(&trainer, "head.");
        for _ in 0..2 {
            let loss = trainer.train_step(&batch)?;
            assert!(loss.is_finite());
        }

        // includes the batch norm running statistics
        assert!(unchanged(&trainer, &backbone));
        assert!(!unchanged(&trainer, &head));
        Ok(())
    }

    #[test]
    fn unfrozen_backbone_is_updated() -> Result<()> {
        let mut trainer = new_trainer();
        trainer.configure(&TrainableMask::head_only(), &OptimizerSettings { lr: 1e-2 })?;
        trainer.configure(&TrainableMask::all(), &OptimizerSettings { lr: 1e-3 })?;
        assert_eq!(trainer.lr(), 1e-3);

        let backbone = snapshot(&trainer, "backbone.");
        trainer.train_step(&image_batch())?;
        assert!(!unchanged(&trainer, &backbone));
        Ok(())
    }

    #[test]
    fn evaluation_changes_nothing() -> Result<()> {
        let mut trainer = new_trainer();
        trainer.configure(&TrainableMask::all(), &OptimizerSettings { lr: 1e-2 })?;
        let batch = image_batch();

        let all = snapshot(&trainer, "");
        let first = trainer.eval_step(&batch)?;
        let second = trainer.eval_step(&batch)?;
        assert_eq!(first, second);
        assert!(unchanged(&trainer, &all));
        Ok(())
    }

    #[test]
    fn cached_features_give_the_same_loss() -> Result<()> {
        let mut trainer = new_trainer();
        trainer.configure(&TrainableMask::head_only(), &OptimizerSettings { lr: 1e-2 })?;
        let batch = image_batch();

        let features = match &batch.inputs {
            BatchInputs::Images(images) => trainer.extract(images)?,
            BatchInputs::Features(_) => unreachable!(),
        };
        let feature_batch = Batch {
            inputs: BatchInputs::Features(features),
            targets: batch.targets.shallow_clone(),
            placeholder: batch.placeholder.shallow_clone(),
            sample_ids: batch.sample_ids.clone(),
        };

        let from_images = trainer.eval_step(&batch)?;
        let from_features = trainer.eval_step(&feature_batch)?;
        assert!((from_images - from_features).abs() <= 1e-4 * from_images.abs().max(1.0));
        Ok(())
    }

    #[test]
    fn saved_weights_load_back() -> Result<()> {
        let dir =
            std::env::temp_dir().join(format!("yolo-finetune-trainer-{}", std::process::id()));
        let path = dir.join("weights.ckpt");

        let mut trainer = new_trainer();
        trainer.configure(&TrainableMask::all(), &OptimizerSettings { lr: 1e-2 })?;
        trainer.train_step(&image_batch())?;
        trainer.save(&path)?;
        let saved = snapshot(&trainer, "");

        let mut other = new_trainer();
        assert!(!unchanged(&other, &saved));
        other.load_weights(&path)?;
        assert!(unchanged(&other, &saved));

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
