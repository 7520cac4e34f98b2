//! The training schedule: phases, stages and per-stage plans.

use crate::{common::*, config::TrainingConfig};

/// Coarse training phase. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    BottleneckPrecompute,
    FrozenBackboneTrain,
    FineTune,
}

/// A step of the training schedule, visited strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Compute the backbone features of every sample.
    Precompute,
    /// Train the heads on cached backbone features.
    HeadOnBottlenecks,
    /// Train the heads on augmented images with the backbone frozen.
    HeadOnImages,
    /// Train every layer.
    FineTune,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Self::Precompute,
        Self::HeadOnBottlenecks,
        Self::HeadOnImages,
        Self::FineTune,
    ];

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Precompute => Some(Self::HeadOnBottlenecks),
            Self::HeadOnBottlenecks => Some(Self::HeadOnImages),
            Self::HeadOnImages => Some(Self::FineTune),
            Self::FineTune => None,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::Precompute => Phase::BottleneckPrecompute,
            Self::HeadOnBottlenecks | Self::HeadOnImages => Phase::FrozenBackboneTrain,
            Self::FineTune => Phase::FineTune,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Precompute => "precompute",
            Self::HeadOnBottlenecks => "head_on_bottlenecks",
            Self::HeadOnImages => "head_on_images",
            Self::FineTune => "fine_tune",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Named parameter groups of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterGroup {
    Backbone,
    Head,
}

impl ParameterGroup {
    pub const ALL: [ParameterGroup; 2] = [Self::Backbone, Self::Head];

    /// The variable name prefix of the group in the var store.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Backbone => "backbone",
            Self::Head => "head",
        }
    }

    /// Finds the group a variable belongs to by its name.
    pub fn of_variable(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|group| {
            let prefix = group.prefix();
            name == prefix
                || name
                    .strip_prefix(prefix)
                    .map(|rest| rest.starts_with('.'))
                    .unwrap_or(false)
        })
    }
}

/// Which parameter groups receive gradient updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainableMask {
    pub backbone: bool,
    pub head: bool,
}

impl TrainableMask {
    pub fn frozen() -> Self {
        Self {
            backbone: false,
            head: false,
        }
    }

    pub fn head_only() -> Self {
        Self {
            backbone: false,
            head: true,
        }
    }

    pub fn all() -> Self {
        Self {
            backbone: true,
            head: true,
        }
    }

    pub fn is_trainable(&self, group: ParameterGroup) -> bool {
        match group {
            ParameterGroup::Backbone => self.backbone,
            ParameterGroup::Head => self.head,
        }
    }

    /// Variables outside the named groups are never trained.
    pub fn is_trainable_variable(&self, name: &str) -> bool {
        ParameterGroup::of_variable(name)
            .map(|group| self.is_trainable(group))
            .unwrap_or(false)
    }
}

/// Optimizer settings applied when a stage starts. The optimizer state is
/// reset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerSettings {
    pub lr: f64,
}

/// Where the batches of a stage come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// Every sample once in the cached order, without augmentation.
    OrderedImages,
    /// Cached backbone features.
    Bottlenecks,
    /// Augmented images for training and plain images for validation.
    AugmentedImages,
}

/// The policies evaluated at the end of every epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitPolicies {
    pub checkpoint: bool,
    pub reduce_lr: bool,
    pub early_stopping: bool,
}

impl ExitPolicies {
    pub fn none() -> Self {
        Self {
            checkpoint: false,
            reduce_lr: false,
            early_stopping: false,
        }
    }
}

/// Everything the orchestrator needs to run a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    pub stage: Stage,
    pub mask: TrainableMask,
    pub optimizer: OptimizerSettings,
    pub data: DataSource,
    pub batch_size: usize,
    pub epochs: Range<usize>,
    pub policies: ExitPolicies,
    /// The weights file written when the stage finishes.
    pub snapshot: Option<&'static str>,
}

impl StagePlan {
    pub fn num_epochs(&self) -> usize {
        self.epochs.len()
    }
}

/// Derives the plan of a stage from the configuration.
pub fn plan(stage: Stage, config: &TrainingConfig) -> StagePlan {
    match stage {
        Stage::Precompute => StagePlan {
            stage,
            mask: TrainableMask::frozen(),
            optimizer: OptimizerSettings {
                lr: config.head_on_bottlenecks.lr.raw(),
            },
            data: DataSource::OrderedImages,
            batch_size: config.bottleneck.batch_size.get(),
            epochs: 0..0,
            policies: ExitPolicies::none(),
            snapshot: None,
        },
        Stage::HeadOnBottlenecks => {
            let stage_config = &config.head_on_bottlenecks;
            StagePlan {
                stage,
                mask: TrainableMask::head_only(),
                optimizer: OptimizerSettings {
                    lr: stage_config.lr.raw(),
                },
                data: DataSource::Bottlenecks,
                batch_size: stage_config.batch_size.get(),
                epochs: 0..stage_config.epochs,
                policies: ExitPolicies::none(),
                snapshot: Some("trained_weights_stage_0.ckpt"),
            }
        }
        Stage::HeadOnImages => {
            let stage_config = &config.head_on_images;
            StagePlan {
                stage,
                mask: TrainableMask::head_only(),
                optimizer: OptimizerSettings {
                    lr: stage_config.lr.raw(),
                },
                data: DataSource::AugmentedImages,
                batch_size: stage_config.batch_size.get(),
                epochs: 0..stage_config.epochs,
                policies: ExitPolicies {
                    checkpoint: true,
                    reduce_lr: false,
                    early_stopping: false,
                },
                snapshot: Some("trained_weights_stage_1.ckpt"),
            }
        }
        Stage::FineTune => {
            let stage_config = &config.fine_tune;
            StagePlan {
                stage,
                mask: TrainableMask::all(),
                optimizer: OptimizerSettings {
                    lr: stage_config.lr.raw(),
                },
                data: DataSource::AugmentedImages,
                batch_size: stage_config.batch_size.get(),
                epochs: stage_config.initial_epoch..stage_config.epochs,
                policies: ExitPolicies {
                    checkpoint: true,
                    reduce_lr: true,
                    early_stopping: true,
                },
                snapshot: Some("trained_weights_final.ckpt"),
            }
        }
    }
}

/// Number of steps that visit each of `num_samples` samples about once.
pub fn steps_per_epoch(num_samples: usize, batch_size: usize) -> usize {
    (num_samples / batch_size.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use approx::assert_abs_diff_eq;

    fn training_config() -> TrainingConfig {
        let config: Config = json5::from_str(
            r#"{
                model: { anchors_file: "anchors.txt" },
                dataset: { annotation_file: "train.txt", classes_file: "classes.txt" },
                logging: { dir: "logs" },
                training: { device: "cpu" },
            }"#,
        )
        .unwrap();
        config.training
    }

    #[test]
    fn stages_move_forward() {
        let visited: Vec<_> =
            std::iter::successors(Some(Stage::Precompute), |stage| stage.next()).collect();
        assert_eq!(visited, Stage::ALL.to_vec());
        assert!(visited.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(visited
            .windows(2)
            .all(|pair| pair[0].phase() <= pair[1].phase()));
    }

    #[test]
    fn backbone_frozen_until_fine_tuning() {
        let config = training_config();
        let plans: Vec<_> = Stage::ALL
            .iter()
            .map(|&stage| plan(stage, &config))
            .collect();

        for plan in &plans {
            let frozen = plan.stage.phase() != Phase::FineTune;
            assert_eq!(plan.mask.backbone, !frozen);
        }
        assert!(plans[1].mask.head && plans[2].mask.head && plans[3].mask.head);

        let fine_tune = &plans[3];
        assert_eq!(fine_tune.mask, TrainableMask::all());
        assert_abs_diff_eq!(fine_tune.optimizer.lr, plans[2].optimizer.lr / 10.0);
        assert_eq!(fine_tune.epochs, 30..45);
        assert!(fine_tune.policies.early_stopping && fine_tune.policies.reduce_lr);
    }

    #[test]
    fn stage_schedule() {
        let config = training_config();

        let head_on_bottlenecks = plan(Stage::HeadOnBottlenecks, &config);
        assert_eq!(head_on_bottlenecks.data, DataSource::Bottlenecks);
        assert_eq!(head_on_bottlenecks.batch_size, 8);
        assert_eq!(head_on_bottlenecks.epochs, 0..10);
        assert_eq!(head_on_bottlenecks.policies, ExitPolicies::none());
        assert_eq!(
            head_on_bottlenecks.snapshot,
            Some("trained_weights_stage_0.ckpt")
        );

        let head_on_images = plan(Stage::HeadOnImages, &config);
        assert_eq!(head_on_images.data, DataSource::AugmentedImages);
        assert_eq!(head_on_images.batch_size, 16);
        assert_eq!(head_on_images.num_epochs(), 20);
        assert!(head_on_images.policies.checkpoint);
        assert!(!head_on_images.policies.early_stopping);

        let precompute = plan(Stage::Precompute, &config);
        assert_eq!(precompute.mask, TrainableMask::frozen());
        assert_eq!(precompute.num_epochs(), 0);
    }

    #[test]
    fn variables_map_to_groups() {
        let mask = TrainableMask::head_only();
        assert!(mask.is_trainable_variable("head.coarse.weight"));
        assert!(!mask.is_trainable_variable("backbone.stem.conv.weight"));
        assert!(!mask.is_trainable_variable("headless.weight"));
        assert!(!mask.is_trainable_variable("other"));
        assert_eq!(
            ParameterGroup::of_variable("backbone.down_8.bn.running_mean"),
            Some(ParameterGroup::Backbone)
        );
    }

    #[test]
    fn steps_are_at_least_one() {
        assert_eq!(steps_per_epoch(90, 8), 11);
        assert_eq!(steps_per_epoch(3, 8), 1);
        assert_eq!(steps_per_epoch(0, 4), 1);
    }
}
