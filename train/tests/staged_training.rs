use anyhow::Result;
use approx::assert_abs_diff_eq;
use bbox::HW;
use rand::rngs::StdRng;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tch::{kind::FLOAT_CPU, Tensor};
use yolo_data::{
    AnchorSet, AnchorTargetEncoder, AnnotationRecord, Batch, BatchInputs, BottleneckFeatures,
    DatasetSplit, FeatureExtractor, Sample, SampleProducer,
};
use yolo_finetune::{
    config::Config,
    orchestrator::{OrchestratorInit, TrainingOrchestrator},
    phase::{OptimizerSettings, Stage, TrainableMask},
    trainer::TrainingStep,
};

const INPUT_SIZE: usize = 128;
const ANCHORS: &str = "116,90, 156,198, 373,326, 30,61, 62,45, 59,119, 10,13, 16,30, 33,23";

/// Records every call and returns fixed losses.
#[derive(Debug, Default)]
struct RecordingTrainer {
    configured: Vec<(TrainableMask, f64)>,
    feature_batches: usize,
    image_batches: usize,
    /// Sample ids of the training image batches, one list per configured stage.
    image_ids: Vec<Vec<usize>>,
    eval_batches: usize,
    extract_calls: usize,
    lr: f64,
}

impl TrainingStep for RecordingTrainer {
    fn configure(&mut self, mask: &TrainableMask, optimizer: &OptimizerSettings) -> Result<()> {
        self.configured.push((*mask, optimizer.lr));
        self.image_ids.push(vec![]);
        self.lr = optimizer.lr;
        Ok(())
    }

    fn train_step(&mut self, batch: &Batch) -> Result<f64> {
        match batch.inputs {
            BatchInputs::Features(_) => self.feature_batches += 1,
            BatchInputs::Images(_) => {
                self.image_batches += 1;
                if let Some(ids) = self.image_ids.last_mut() {
                    ids.extend_from_slice(&batch.sample_ids);
                }
            }
        }
        Ok(1.0)
    }

    fn eval_step(&mut self, _batch: &Batch) -> Result<f64> {
        self.eval_batches += 1;
        Ok(5.0)
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, b"")?;
        Ok(())
    }
}

impl FeatureExtractor for RecordingTrainer {
    fn extract(&mut self, images: &Tensor) -> Result<BottleneckFeatures> {
        self.extract_calls += 1;
        let pool = |stride: i64| {
            images.avg_pool2d(
                &[stride, stride],
                &[stride, stride],
                &[0, 0],
                false,
                true,
                None,
            )
        };
        BottleneckFeatures::new(pool(32), pool(16), pool(8))
    }
}

/// Blank images, boxes as annotated.
struct BlankProducer;

impl SampleProducer for BlankProducer {
    fn produce(
        &self,
        record: &AnnotationRecord,
        input_size: HW<usize>,
        _augment: bool,
        proc_img: bool,
        _rng: &mut StdRng,
    ) -> Result<Sample> {
        let image = proc_img
            .then(|| Tensor::zeros(&[3, input_size.h as i64, input_size.w as i64], FLOAT_CPU));
        Ok(Sample {
            image,
            boxes: record.boxes.clone(),
        })
    }
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("yolo-finetune-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn make_split(n: usize) -> DatasetSplit {
    let records: Vec<_> = (0..n)
        .map(|index| {
            let line = format!(
                "img_{}.jpg {},{},{},{},{}",
                index,
                8 + index,
                16,
                48 + 4 * index,
                100,
                index % 2
            );
            AnnotationRecord::parse_line(&line).unwrap()
        })
        .collect();
    DatasetSplit::new(records, 0.2, 10101).unwrap()
}

/// Options the tests vary.
#[derive(Debug, Clone, Copy)]
struct Options {
    prefetch: bool,
    reduce_lr_patience: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            prefetch: false,
            reduce_lr_patience: 5,
        }
    }
}

fn make_config(dir: &Path, options: Options) -> Config {
    let text = format!(
        r#"{{
            model: {{ anchors_file: "anchors.txt", input_size: {{ h: {size}, w: {size} }} }},
            dataset: {{ annotation_file: "train.txt", classes_file: "classes.txt" }},
            logging: {{ dir: "{dir}" }},
            training: {{
                device: "cpu",
                bottleneck: {{ cache_file: "{cache}", batch_size: 4 }},
                head_on_bottlenecks: {{ epochs: 2, lr: 1e-3, batch_size: 2 }},
                head_on_images: {{ epochs: 3, lr: 1e-3, batch_size: 2 }},
                fine_tune: {{ initial_epoch: 3, epochs: 10, lr: 1e-4, batch_size: 2 }},
                checkpoint: {{ period: 1, save_best_only: true }},
                reduce_lr: {{
                    factor: 0.1,
                    patience: {patience},
                    min_delta: 1e-4,
                    cooldown: 0,
                    min_lr: 0.0,
                }},
                early_stopping: {{ patience: 2, min_delta: 0.0 }},
                prefetch: {prefetch},
            }},
        }}"#,
        size = INPUT_SIZE,
        dir = dir.display(),
        cache = dir.join("bottlenecks.pt").display(),
        patience = options.reduce_lr_patience,
        prefetch = options.prefetch,
    );
    let config: Config = json5::from_str(&text).unwrap();
    config.validate().unwrap();
    config
}

fn make_orchestrator(dir: &Path, run_name: &str) -> Result<TrainingOrchestrator<RecordingTrainer>> {
    make_orchestrator_with(dir, run_name, Options::default())
}

fn make_orchestrator_with(
    dir: &Path,
    run_name: &str,
    options: Options,
) -> Result<TrainingOrchestrator<RecordingTrainer>> {
    let config = make_config(dir, options);
    let encoder = AnchorTargetEncoder::new(
        HW::new(INPUT_SIZE, INPUT_SIZE),
        AnchorSet::parse(ANCHORS)?,
        2,
    )?;

    OrchestratorInit {
        split: make_split(10),
        encoder: Arc::new(encoder),
        producer: Arc::new(BlankProducer),
        training: config.training,
        output_dir: dir.join(run_name),
        weights_file: None,
        seed: 7,
    }
    .build(RecordingTrainer::default())
}

#[test]
fn stages_run_in_order() -> Result<()> {
    let dir = temp_dir("stages");
    let mut orchestrator = make_orchestrator(&dir, "run")?;
    let reports = orchestrator.run()?;
    assert_eq!(orchestrator.next_stage(), None);

    let stages: Vec<_> = reports.iter().map(|report| report.stage).collect();
    assert_eq!(stages, Stage::ALL.to_vec());

    let trainer = orchestrator.into_trainer();
    assert_eq!(
        trainer.configured,
        vec![
            (TrainableMask::frozen(), 1e-3),
            (TrainableMask::head_only(), 1e-3),
            (TrainableMask::head_only(), 1e-3),
            (TrainableMask::all(), 1e-4),
        ]
    );

    // 10 samples in chunks of 4
    assert_eq!(trainer.extract_calls, 3);
    assert!(!reports[0].skipped);

    // 8 training samples in batches of 2 make 4 steps per epoch
    assert_eq!(trainer.feature_batches, 2 * 4);
    assert_eq!(reports[1].epochs.len(), 2);
    assert_eq!(reports[2].epochs.len(), 3);

    // the validation loss never improves after the first epoch of stage 1
    let fine_tune = &reports[3];
    assert!(fine_tune.stopped_early);
    let epochs: Vec<_> = fine_tune.epochs.iter().map(|metrics| metrics.epoch).collect();
    assert_eq!(epochs, vec![3, 4, 5]);
    assert_eq!(trainer.image_batches, (3 + 3) * 4);
    assert_eq!(trainer.eval_batches, 2 + 3 + 3);

    let checkpoints: Vec<_> = fs::read_dir(dir.join("run").join("checkpoints"))?
        .map(|entry| entry.map(|entry| entry.file_name().into_string().unwrap()))
        .collect::<Result<_, _>>()?;
    assert_eq!(
        checkpoints,
        vec!["ep001-loss1.000-val_loss5.000.ckpt".to_string()]
    );

    for (report, file_name) in reports[1..].iter().zip([
        "trained_weights_stage_0.ckpt",
        "trained_weights_stage_1.ckpt",
        "trained_weights_final.ckpt",
    ]) {
        let snapshot = report.snapshot.as_ref().unwrap();
        assert_eq!(*snapshot, dir.join("run").join(file_name));
        assert!(snapshot.is_file());
    }

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn image_stages_draw_new_augmentations() -> Result<()> {
    let dir = temp_dir("augmentation-seeds");
    let mut orchestrator = make_orchestrator(&dir, "run")?;
    orchestrator.run()?;
    let trainer = orchestrator.into_trainer();

    // configured stages: precompute, head on bottlenecks, head on images, fine tune
    let head_on_images = &trainer.image_ids[2];
    let fine_tune = &trainer.image_ids[3];
    assert!(trainer.image_ids[..2].iter().all(|ids| ids.is_empty()));

    // the first pass visits each of the 8 training samples once
    let first_pass = |ids: &[usize]| ids[..8].to_vec();
    let mut sorted = first_pass(head_on_images);
    sorted.sort_unstable();
    assert_eq!(sorted, (0..8).collect::<Vec<_>>());
    assert_ne!(first_pass(head_on_images), first_pass(fine_tune));

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn prefetched_fine_tuning_reduces_lr() -> Result<()> {
    let dir = temp_dir("prefetch-plateau");
    let options = Options {
        prefetch: true,
        reduce_lr_patience: 1,
    };
    let mut orchestrator = make_orchestrator_with(&dir, "run", options)?;
    let reports = orchestrator.run()?;
    let trainer = orchestrator.trainer();

    assert_eq!(trainer.feature_batches, 2 * 4);
    assert_eq!(trainer.image_batches, (3 + 3) * 4);

    // epoch 3 sets the best value, epochs 4 and 5 each cut the lr by 10
    let fine_tune = &reports[3];
    assert!(fine_tune.stopped_early);
    assert_eq!(fine_tune.epochs.len(), 3);
    assert_abs_diff_eq!(fine_tune.lr, 1e-6, epsilon = 1e-12);
    assert_abs_diff_eq!(trainer.lr(), 1e-6, epsilon = 1e-12);

    // the stages before fine-tuning keep their lr
    assert_abs_diff_eq!(reports[2].lr, 1e-3, epsilon = 1e-12);

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn valid_cache_skips_precompute() -> Result<()> {
    let dir = temp_dir("cache-reuse");

    let mut first = make_orchestrator(&dir, "first")?;
    let report = first.run_stage(Stage::Precompute)?;
    assert!(!report.skipped);
    assert_eq!(first.trainer().extract_calls, 3);

    let mut second = make_orchestrator(&dir, "second")?;
    let report = second.run_stage(Stage::Precompute)?;
    assert!(report.skipped);
    assert_eq!(second.trainer().extract_calls, 0);

    let report = second.run_stage(Stage::HeadOnBottlenecks)?;
    assert_eq!(report.epochs.len(), 2);
    assert_eq!(second.trainer().feature_batches, 8);

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn stages_cannot_be_skipped_or_repeated() -> Result<()> {
    let dir = temp_dir("order");
    let mut orchestrator = make_orchestrator(&dir, "run")?;

    assert!(orchestrator.run_stage(Stage::HeadOnImages).is_err());
    assert_eq!(orchestrator.next_stage(), Some(Stage::Precompute));

    orchestrator.run_stage(Stage::Precompute)?;
    assert!(orchestrator.run_stage(Stage::Precompute).is_err());
    assert_eq!(orchestrator.next_stage(), Some(Stage::HeadOnBottlenecks));

    // a rejected stage leaves the trainer untouched
    assert_eq!(orchestrator.trainer().configured.len(), 1);

    fs::remove_dir_all(&dir)?;
    Ok(())
}
