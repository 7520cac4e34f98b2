//! Sequencing of the training stages.

use crate::{
    common::*,
    config::TrainingConfig,
    phase::{plan, steps_per_epoch, DataSource, Stage, StagePlan},
    policy::{CheckpointPolicy, EarlyStopping, EpochMetrics, ReduceLrOnPlateau},
    trainer::TrainingStep,
    utils::{RateCounter, CHECKPOINT_DIR},
};

/// Inputs of a [TrainingOrchestrator].
pub struct OrchestratorInit {
    pub split: DatasetSplit,
    pub encoder: Arc<AnchorTargetEncoder>,
    pub producer: Arc<dyn SampleProducer>,
    pub training: TrainingConfig,
    /// Stage snapshots go here and epoch checkpoints into its `checkpoints`
    /// sub-directory.
    pub output_dir: PathBuf,
    /// The file the backbone weights were loaded from, part of the cache
    /// fingerprint.
    pub weights_file: Option<PathBuf>,
    /// Seeds the generator that draws a fresh seed for every image stream.
    pub seed: u64,
}

impl OrchestratorInit {
    pub fn build<T>(self, trainer: T) -> Result<TrainingOrchestrator<T>>
    where
        T: TrainingStep + FeatureExtractor,
    {
        let Self {
            split,
            encoder,
            producer,
            training,
            output_dir,
            weights_file,
            seed,
        } = self;

        ensure!(
            split.num_train() > 0,
            "there are no training samples after the split"
        );
        split.check_classes(encoder.num_classes())?;

        let fingerprint =
            CacheFingerprint::new(encoder.input_size(), &split.ordered(), weights_file)?;
        let cache = BottleneckCache::new(&training.bottleneck.cache_file);
        let checkpoint_dir = output_dir.join(CHECKPOINT_DIR);
        std::fs::create_dir_all(&checkpoint_dir).with_context(|| {
            format!(
                "failed to create checkpoint directory '{}'",
                checkpoint_dir.display()
            )
        })?;

        Ok(TrainingOrchestrator {
            checkpoint: CheckpointPolicy::new(&training.checkpoint),
            split,
            encoder,
            producer,
            training,
            output_dir,
            checkpoint_dir,
            cache,
            fingerprint,
            rng: StdRng::seed_from_u64(seed),
            trainer,
            next_stage: Some(Stage::Precompute),
        })
    }
}

/// The outcome of a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    /// Set if the stage had nothing to do.
    pub skipped: bool,
    pub epochs: Vec<EpochMetrics>,
    pub stopped_early: bool,
    pub lr: f64,
    /// The stage weights file.
    pub snapshot: Option<PathBuf>,
}

/// Runs the stages in order: feature caching, head training on cached
/// features, head training on images and fine-tuning of every layer.
pub struct TrainingOrchestrator<T>
where
    T: TrainingStep + FeatureExtractor,
{
    split: DatasetSplit,
    encoder: Arc<AnchorTargetEncoder>,
    producer: Arc<dyn SampleProducer>,
    training: TrainingConfig,
    output_dir: PathBuf,
    checkpoint_dir: PathBuf,
    cache: BottleneckCache,
    fingerprint: CacheFingerprint,
    /// Advances across stages so that every stage sees new augmentations.
    rng: StdRng,
    trainer: T,
    /// Shared by the stages that save checkpoints.
    checkpoint: CheckpointPolicy,
    next_stage: Option<Stage>,
}

impl<T> Debug for TrainingOrchestrator<T>
where
    T: TrainingStep + FeatureExtractor,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingOrchestrator")
            .field("num_train", &self.split.num_train())
            .field("num_val", &self.split.num_val())
            .field("output_dir", &self.output_dir)
            .field("cache", &self.cache)
            .field("next_stage", &self.next_stage)
            .finish()
    }
}

impl<T> TrainingOrchestrator<T>
where
    T: TrainingStep + FeatureExtractor,
{
    pub fn trainer(&self) -> &T {
        &self.trainer
    }

    pub fn into_trainer(self) -> T {
        self.trainer
    }

    /// The stage `run_stage` accepts next, or `None` when training is done.
    pub fn next_stage(&self) -> Option<Stage> {
        self.next_stage
    }

    /// Runs every remaining stage.
    pub fn run(&mut self) -> Result<Vec<StageReport>> {
        let mut reports = vec![];
        while let Some(stage) = self.next_stage {
            reports.push(self.run_stage(stage)?);
        }
        Ok(reports)
    }

    /// Runs a stage. Only the stage right after the last completed one is
    /// accepted.
    pub fn run_stage(&mut self, stage: Stage) -> Result<StageReport> {
        match self.next_stage {
            Some(next) if next == stage => (),
            Some(next) => bail!(
                "cannot run stage {} while stage {} is pending",
                stage,
                next
            ),
            None => bail!("cannot run stage {} after training has finished", stage),
        }

        let plan = plan(stage, &self.training);
        info!(
            "enter stage {} ({:?}), epochs {}..{}, batch size {}, lr {:e}",
            stage,
            stage.phase(),
            plan.epochs.start,
            plan.epochs.end,
            plan.batch_size,
            plan.optimizer.lr
        );
        self.trainer.configure(&plan.mask, &plan.optimizer)?;

        let report = match plan.data {
            DataSource::OrderedImages => self.precompute(&plan)?,
            DataSource::Bottlenecks => {
                let (train, val) = self.bottleneck_streams(&plan)?;
                self.run_epochs(&plan, train, val)?
            }
            DataSource::AugmentedImages => {
                let (train, val) = self.image_streams(&plan)?;
                self.run_epochs(&plan, train, val)?
            }
        };

        self.next_stage = stage.next();
        Ok(report)
    }

    fn precompute(&mut self, plan: &StagePlan) -> Result<StageReport> {
        let skipped = self.cache.is_valid(&self.fingerprint);
        if skipped {
            info!(
                "reuse bottleneck cache '{}'",
                self.cache.handle().path().display()
            );
        } else {
            info!(
                "compute bottleneck features of {} samples",
                self.fingerprint.records.len()
            );
            let features = BottleneckCache::compute(
                &mut self.trainer,
                &self.split.ordered(),
                plan.batch_size,
                &*self.producer,
                self.encoder.input_size(),
            )?;
            self.cache.persist(&features, &self.fingerprint)?;
        }

        Ok(StageReport {
            stage: plan.stage,
            skipped,
            epochs: vec![],
            stopped_early: false,
            lr: self.trainer.lr(),
            snapshot: None,
        })
    }

    fn bottleneck_streams(
        &self,
        plan: &StagePlan,
    ) -> Result<(Box<dyn BatchSource>, Option<Box<dyn BatchSource>>)> {
        let features = BottleneckCache::load(self.cache.handle())?;
        ensure!(
            features.len() == self.fingerprint.records.len(),
            "the bottleneck cache '{}' holds {} samples, but expect {}",
            self.cache.handle().path().display(),
            features.len(),
            self.fingerprint.records.len()
        );
        let (train_features, val_features) = features.split_at(self.split.num_train())?;

        let train = BottleneckBatchStream::new(
            self.split.train().to_vec(),
            train_features,
            plan.batch_size,
            self.encoder.clone(),
            self.producer.clone(),
        )?
        .ok_or_else(|| format_err!("no training batches for stage {}", plan.stage))?;
        let val = BottleneckBatchStream::new(
            self.split.val().to_vec(),
            val_features,
            plan.batch_size,
            self.encoder.clone(),
            self.producer.clone(),
        )?;

        Ok((
            Box::new(train),
            val.map(|val| Box::new(val) as Box<dyn BatchSource>),
        ))
    }

    fn image_streams(
        &mut self,
        plan: &StagePlan,
    ) -> Result<(Box<dyn BatchSource>, Option<Box<dyn BatchSource>>)> {
        let train = BatchStream::new(
            self.split.train().to_vec(),
            plan.batch_size,
            self.encoder.clone(),
            self.producer.clone(),
            true,
            self.rng.gen(),
        )
        .ok_or_else(|| format_err!("no training batches for stage {}", plan.stage))?;
        let val = BatchStream::new(
            self.split.val().to_vec(),
            plan.batch_size,
            self.encoder.clone(),
            self.producer.clone(),
            false,
            self.rng.gen(),
        );

        Ok((
            Box::new(train),
            val.map(|val| Box::new(val) as Box<dyn BatchSource>),
        ))
    }

    fn run_epochs(
        &mut self,
        plan: &StagePlan,
        train: Box<dyn BatchSource>,
        val: Option<Box<dyn BatchSource>>,
    ) -> Result<StageReport> {
        let prefetch = self.training.prefetch;
        let train_steps = steps_per_epoch(train.num_samples(), plan.batch_size);
        let val_steps = val
            .as_ref()
            .map(|val| steps_per_epoch(val.num_samples(), plan.batch_size));
        if val.is_none() {
            warn!(
                "no validation samples, stage {} monitors the training loss",
                plan.stage
            );
        }
        let mut train = Feed::new(train, prefetch);
        let mut val = val.map(|val| Feed::new(val, prefetch));

        let mut reduce_lr = plan
            .policies
            .reduce_lr
            .then(|| ReduceLrOnPlateau::new(&self.training.reduce_lr));
        let mut early_stopping = plan
            .policies
            .early_stopping
            .then(|| EarlyStopping::new(&self.training.early_stopping));
        let mut history = vec![];
        let mut stopped_early = false;

        for epoch in plan.epochs.clone() {
            let mut rate_counter = RateCounter::with_second_interval();
            let mut loss_sum = 0.0;

            for step in 0..train_steps {
                let batch = train.next_batch()?;
                let loss = self.trainer.train_step(&batch)?;
                loss_sum += loss;

                rate_counter.add(1.0);
                if let Some(batch_rate) = rate_counter.rate() {
                    info!(
                        "stage: {}\tepoch: {}\tstep: {}/{}\tlr: {:.5}\tloss: {:.4}\t{:.2} batches/s",
                        plan.stage,
                        epoch + 1,
                        step + 1,
                        train_steps,
                        self.trainer.lr(),
                        loss,
                        batch_rate
                    );
                }
            }

            let val_loss = match (&mut val, val_steps) {
                (Some(val), Some(val_steps)) => {
                    let mut val_loss_sum = 0.0;
                    for _ in 0..val_steps {
                        let batch = val.next_batch()?;
                        val_loss_sum += self.trainer.eval_step(&batch)?;
                    }
                    Some(val_loss_sum / val_steps as f64)
                }
                _ => None,
            };

            let metrics = EpochMetrics {
                epoch,
                loss: loss_sum / train_steps as f64,
                val_loss,
            };
            match metrics.val_loss {
                Some(val_loss) => info!(
                    "stage: {}\tepoch: {}/{}\tloss: {:.4}\tval_loss: {:.4}",
                    plan.stage,
                    epoch + 1,
                    plan.epochs.end,
                    metrics.loss,
                    val_loss
                ),
                None => info!(
                    "stage: {}\tepoch: {}/{}\tloss: {:.4}",
                    plan.stage,
                    epoch + 1,
                    plan.epochs.end,
                    metrics.loss
                ),
            }
            history.push(metrics);

            if plan.policies.checkpoint {
                if let Some(file_name) = self.checkpoint.on_epoch_end(&metrics) {
                    let path = self.checkpoint_dir.join(file_name);
                    info!("save checkpoint '{}'", path.display());
                    self.trainer.save(&path)?;
                }
            }

            if let Some(reduce_lr) = &mut reduce_lr {
                if let Some(lr) = reduce_lr.on_epoch_end(metrics.monitored(), self.trainer.lr()) {
                    info!("epoch {}: reduce learning rate to {:e}", epoch + 1, lr);
                    self.trainer.set_lr(lr);
                }
            }

            if let Some(early_stopping) = &mut early_stopping {
                if early_stopping.on_epoch_end(metrics.monitored()) {
                    info!("epoch {}: early stopping", epoch + 1);
                    stopped_early = true;
                    break;
                }
            }
        }

        let snapshot = match plan.snapshot {
            Some(file_name) => {
                let path = self.output_dir.join(file_name);
                self.trainer.save(&path)?;
                info!("stage {} weights saved to '{}'", plan.stage, path.display());
                Some(path)
            }
            None => None,
        };

        Ok(StageReport {
            stage: plan.stage,
            skipped: false,
            epochs: history,
            stopped_early,
            lr: self.trainer.lr(),
            snapshot,
        })
    }
}

/// A batch source consumed directly or through a worker thread.
enum Feed {
    Direct(Box<dyn BatchSource>),
    Prefetched(Prefetcher),
}

impl Feed {
    fn new(source: Box<dyn BatchSource>, prefetch: bool) -> Self {
        if prefetch {
            Self::Prefetched(Prefetcher::new(source))
        } else {
            Self::Direct(source)
        }
    }

    fn next_batch(&mut self) -> Result<Batch> {
        match self {
            Self::Direct(source) => source.next_batch(),
            Self::Prefetched(prefetcher) => prefetcher.next_batch(),
        }
    }
}
