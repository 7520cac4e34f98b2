//! Staged transfer-learning fine-tuning of a YOLOv3-style detector.

pub mod common;
pub mod config;
pub mod loss;
pub mod model;
pub mod orchestrator;
pub mod phase;
pub mod policy;
pub mod trainer;
pub mod utils;

use crate::{
    common::*,
    config::Config,
    orchestrator::{OrchestratorInit, StageReport},
    trainer::TchTrainer,
};
use yolo_data::{load_annotation_file, load_classes_file, split_records};

/// The entry of training program.
pub async fn start(config: Arc<Config>) -> Result<()> {
    let logging_dir = config.logging.dir.join(utils::run_dir_name());

    // create dirs and save config
    {
        tokio::fs::create_dir_all(&logging_dir).await?;
        let path = logging_dir.join("config.json5");
        let text = serde_json::to_string_pretty(&*config)?;
        tokio::fs::write(&path, text).await?;
    }

    let reports = tokio::task::spawn_blocking(move || training_worker(config, logging_dir)).await??;
    for report in &reports {
        match report.epochs.last() {
            Some(last) => info!(
                "stage {}: {} epochs, last loss {:.4}, monitored {:.4}{}",
                report.stage,
                report.epochs.len(),
                last.loss,
                last.monitored(),
                if report.stopped_early {
                    ", stopped early"
                } else {
                    ""
                }
            ),
            None if report.skipped => info!("stage {}: skipped", report.stage),
            None => info!("stage {}: done", report.stage),
        }
    }

    Ok(())
}

/// Loads the data and the model, then runs every training stage.
pub fn training_worker(config: Arc<Config>, logging_dir: PathBuf) -> Result<Vec<StageReport>> {
    let Config {
        model: ref model_config,
        dataset: ref dataset_config,
        logging: ref logging_config,
        training: ref training_config,
    } = *config;

    // load dataset
    info!("loading dataset");
    let classes = load_classes_file(&dataset_config.classes_file)?;
    let anchors = AnchorSet::load(&model_config.anchors_file)?;
    let records = load_annotation_file(&dataset_config.annotation_file)?;
    let split = split_records(
        records,
        dataset_config.val_split.raw(),
        dataset_config.split_seed,
    )?;
    info!(
        "{} classes, {} training and {} validation samples",
        classes.len(),
        split.num_train(),
        split.num_val()
    );

    let encoder = Arc::new(AnchorTargetEncoder::new(
        model_config.input_size,
        anchors.clone(),
        classes.len(),
    )?);
    let producer: Arc<dyn SampleProducer> = Arc::new(dataset_config.preprocessor.clone());

    // init model
    info!("initializing model");
    let mut trainer = TchTrainer::new(
        training_config.device,
        anchors,
        model_config.base_channels.get(),
        classes.len(),
    )?;

    // load weights, a resumed checkpoint overrides the pretrained weights
    let mut weights_file = None;
    if let Some(file) = &model_config.weights_file {
        trainer.load_weights(file)?;
        weights_file = Some(file.to_owned());
    }
    if let Some(file) =
        utils::resolve_checkpoint(&logging_config.dir, &training_config.load_checkpoint)?
    {
        info!("resume from checkpoint '{}'", file.display());
        trainer.load_weights(&file)?;
        weights_file = Some(file);
    }

    let seed = dataset_config
        .shuffle_seed
        .unwrap_or_else(rand::random::<u64>);
    let mut orchestrator = OrchestratorInit {
        split,
        encoder,
        producer,
        training: training_config.clone(),
        output_dir: logging_dir,
        weights_file,
        seed,
    }
    .build(trainer)?;

    info!("start training");
    orchestrator.run()
}
