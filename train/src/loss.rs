//! The YOLOv3 detection loss over encoded anchor targets.

use crate::{common::*, model::DetectionOutput};
use yolo_data::encoder::{CHANNEL_CLASS, CHANNEL_CX, CHANNEL_OBJECTNESS, CHANNEL_W};

/// Predictions whose best IoU with any ground truth of the image reaches this
/// threshold are not penalized as background.
pub const DEFAULT_IGNORE_THRESH: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct YoloLossInit {
    pub anchors: AnchorSet,
    pub ignore_thresh: f64,
}

impl YoloLossInit {
    pub fn new(anchors: AnchorSet) -> Self {
        Self {
            anchors,
            ignore_thresh: DEFAULT_IGNORE_THRESH,
        }
    }

    pub fn build(self) -> YoloLoss {
        let Self {
            anchors,
            ignore_thresh,
        } = self;
        YoloLoss {
            anchors,
            ignore_thresh,
        }
    }
}

/// Sums the box, objectness and class terms of every scale and divides by the
/// batch size.
#[derive(Debug, Clone)]
pub struct YoloLoss {
    anchors: AnchorSet,
    ignore_thresh: f64,
}

impl YoloLoss {
    pub fn forward(&self, output: &DetectionOutput, targets: &ScaleTargets) -> Result<Tensor> {
        let batch_size = output.coarse.size()[0];
        ensure!(batch_size > 0, "cannot compute the loss of an empty batch");

        let losses: Vec<_> = Scale::ALL
            .iter()
            .map(|&scale| self.scale_loss(scale, output.get(scale), targets.get(scale)))
            .try_collect()?;
        Ok(Tensor::stack(&losses, 0).sum(Kind::Float) / batch_size as f64)
    }

    fn scale_loss(&self, scale: Scale, prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
        ensure!(
            prediction.size() == target.size(),
            "the {} prediction shape {:?} differs from the target shape {:?}",
            scale.name(),
            prediction.size(),
            target.size()
        );
        let num_channels = target.size()[4];
        ensure!(
            num_channels > CHANNEL_CLASS as i64,
            "expect more than {} channels, but get {}",
            CHANNEL_CLASS,
            num_channels
        );

        let stride = scale.stride() as f64;
        let grid = self.grid_offsets(prediction);
        let anchors = self.anchor_sizes(scale, prediction.device());
        let channels = |xs: &Tensor, start: usize, len: i64| xs.narrow(4, start as i64, len);

        let objectness = channels(target, CHANNEL_OBJECTNESS, 1);
        let positive = objectness.gt(0.5);
        let true_xy = channels(target, CHANNEL_CX, 2) - &grid;
        let true_wh = channels(target, CHANNEL_W, 2);
        let raw_true_wh = (&true_wh * stride / &anchors).log();
        let raw_true_wh = raw_true_wh.where_self(&positive, &raw_true_wh.zeros_like());

        // small boxes weigh more
        let grid_h = target.size()[1] as f64;
        let grid_w = target.size()[2] as f64;
        let box_scale =
            -(true_wh.narrow(4, 0, 1) / grid_w * true_wh.narrow(4, 1, 1) / grid_h) + 2.0;

        let raw_xy = channels(prediction, CHANNEL_CX, 2);
        let raw_wh = channels(prediction, CHANNEL_W, 2);
        let raw_objectness = channels(prediction, CHANNEL_OBJECTNESS, 1);
        let raw_class = channels(prediction, CHANNEL_CLASS, num_channels - CHANNEL_CLASS as i64);
        let true_class = channels(target, CHANNEL_CLASS, num_channels - CHANNEL_CLASS as i64);

        let ignore = {
            let pred_xy = raw_xy.sigmoid() + &grid;
            let pred_wh = raw_wh.exp() * &anchors / stride;
            let pred_boxes = Tensor::cat(&[pred_xy, pred_wh], 4);
            self.ignore_mask(&pred_boxes, target)
        };

        let xy_loss = &objectness * &box_scale * bce_with_logits(&raw_xy, &true_xy);
        let wh_loss = &objectness * &box_scale * 0.5 * (&raw_true_wh - &raw_wh).square();
        let objectness_bce = bce_with_logits(&raw_objectness, &objectness);
        let objectness_loss = &objectness * &objectness_bce
            + (-&objectness + 1.0) * &objectness_bce * &ignore;
        let class_loss = &objectness * bce_with_logits(&raw_class, &true_class);

        Ok(xy_loss.sum(Kind::Float)
            + wh_loss.sum(Kind::Float)
            + objectness_loss.sum(Kind::Float)
            + class_loss.sum(Kind::Float))
    }

    /// Cell offsets `[1, h, w, 1, 2]` in `(x, y)` order.
    fn grid_offsets(&self, prediction: &Tensor) -> Tensor {
        let size = prediction.size();
        let (grid_h, grid_w) = (size[1], size[2]);
        let options = (Kind::Float, prediction.device());
        let grid_x = Tensor::arange(grid_w, options)
            .view([1, 1, grid_w, 1, 1])
            .expand(&[1, grid_h, grid_w, 1, 1], false);
        let grid_y = Tensor::arange(grid_h, options)
            .view([1, grid_h, 1, 1, 1])
            .expand(&[1, grid_h, grid_w, 1, 1], false);
        Tensor::cat(&[grid_x, grid_y], 4)
    }

    /// Anchor sizes `[1, 1, 1, anchors, 2]` in `(w, h)` input pixels.
    fn anchor_sizes(&self, scale: Scale, device: Device) -> Tensor {
        let group = self.anchors.group(scale);
        let values: Vec<f32> = group
            .iter()
            .flat_map(|anchor| [anchor.w as f32, anchor.h as f32])
            .collect();
        Tensor::of_slice(&values)
            .view([1, 1, 1, group.len() as i64, 2])
            .to_device(device)
    }

    /// Returns 1 where the predicted box `[b, h, w, a, 4]` in `(cx, cy, w, h)`
    /// grid units overlaps no ground truth of its image by the threshold, and
    /// 0 elsewhere. The result is shaped `[b, h, w, a, 1]`.
    pub(crate) fn ignore_mask(&self, pred_boxes: &Tensor, target: &Tensor) -> Tensor {
        tch::no_grad(|| {
            let size = pred_boxes.size();
            let (batch_size, grid_h, grid_w, num_anchors) = (size[0], size[1], size[2], size[3]);
            let num_channels = target.size()[4];

            let masks: Vec<_> = (0..batch_size)
                .map(|index| {
                    let pred = pred_boxes.i(index).reshape(&[-1, 4]);
                    let truth = target.i(index).reshape(&[-1, num_channels]);
                    let positive = truth
                        .select(1, CHANNEL_OBJECTNESS as i64)
                        .gt(0.5)
                        .nonzero()
                        .view([-1]);
                    let truth = truth
                        .index_select(0, &positive)
                        .narrow(1, CHANNEL_CX as i64, 4);

                    let best_iou = if truth.size()[0] == 0 {
                        pred.select(1, 0).zeros_like()
                    } else {
                        pairwise_iou(&pred, &truth).max_dim(1, false).0
                    };
                    best_iou
                        .lt(self.ignore_thresh)
                        .to_kind(Kind::Float)
                        .view([grid_h, grid_w, num_anchors, 1])
                })
                .collect();
            Tensor::stack(&masks, 0)
        })
    }
}

fn bce_with_logits(input: &Tensor, target: &Tensor) -> Tensor {
    input.binary_cross_entropy_with_logits(
        target,
        None::<&Tensor>,
        None::<&Tensor>,
        Reduction::None,
    )
}

/// IoU matrix `[m, n]` of `(cx, cy, w, h)` boxes `[m, 4]` and `[n, 4]`.
fn pairwise_iou(lhs: &Tensor, rhs: &Tensor) -> Tensor {
    let corners = |boxes: &Tensor| {
        let center = boxes.narrow(1, 0, 2);
        let half = boxes.narrow(1, 2, 2) / 2.0;
        (&center - &half, &center + &half)
    };
    let area = |boxes: &Tensor| boxes.select(1, 2) * boxes.select(1, 3);

    let (lhs_tl, lhs_br) = corners(lhs);
    let (rhs_tl, rhs_br) = corners(rhs);
    let tl = lhs_tl.unsqueeze(1).maximum(&rhs_tl.unsqueeze(0));
    let br = lhs_br.unsqueeze(1).minimum(&rhs_br.unsqueeze(0));
    let inter_wh = (br - tl).clamp_min(0.0);
    let inter = inter_wh.select(2, 0) * inter_wh.select(2, 1);
    let union = area(lhs).unsqueeze(1) + area(rhs).unsqueeze(0) - &inter;
    inter / union.clamp_min(1e-9)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use label::{BoxLabel, Label};

    const SMALL_ANCHORS: &str = "40,40, 50,50, 60,60, 20,20, 25,25, 30,30, 8,8, 10,10, 12,12";

    fn encode_one_box() -> (AnchorSet, ScaleTargets) {
        let anchors = AnchorSet::parse(SMALL_ANCHORS).unwrap();
        let encoder = AnchorTargetEncoder::new(HW::new(64, 64), anchors.clone(), 2).unwrap();
        let bbox: BoxLabel = Label {
            rect: TLBR::try_from_corners(16.0, 16.0, 36.0, 36.0).unwrap(),
            class: 1,
        };
        let targets = encoder.encode(&[vec![bbox]]).unwrap();
        (anchors, targets)
    }

    fn zero_output(targets: &ScaleTargets) -> DetectionOutput {
        DetectionOutput {
            coarse: targets.coarse.zeros_like(),
            medium: targets.medium.zeros_like(),
            fine: targets.fine.zeros_like(),
        }
    }

    #[test]
    fn pairwise_iou_values() {
        let lhs = Tensor::of_slice(&[1.0f32, 1.0, 2.0, 2.0, 10.0, 10.0, 1.0, 1.0]).view([2, 4]);
        let rhs = Tensor::of_slice(&[2.0f32, 1.0, 2.0, 2.0]).view([1, 4]);
        let iou = pairwise_iou(&lhs, &rhs);
        assert_eq!(iou.size(), vec![2, 1]);
        assert_abs_diff_eq!(iou.double_value(&[0, 0]), 2.0 / 6.0, epsilon = 1e-6);
        assert_abs_diff_eq!(iou.double_value(&[1, 0]), 0.0);
    }

    #[test]
    fn overlapping_predictions_are_ignored() {
        let (anchors, targets) = encode_one_box();
        let loss = YoloLossInit::new(anchors).build();

        // the box lands on the medium scale, cell (1, 1), first anchor
        assert_abs_diff_eq!(targets.medium.double_value(&[0, 1, 1, 0, 4]), 1.0);

        // zero logits put every prediction at its cell center with its anchor size
        let stride = 16.0;
        let grid = loss.grid_offsets(&targets.medium);
        let anchor_sizes = loss.anchor_sizes(Scale::Medium, Device::Cpu);
        let pred_xy = (targets.medium.narrow(4, 0, 2).zeros_like() + 0.5) + &grid;
        let pred_wh = (targets.medium.narrow(4, 2, 2).zeros_like() + 1.0) * &anchor_sizes / stride;
        let pred_boxes = Tensor::cat(&[pred_xy, pred_wh], 4);

        let mask = loss.ignore_mask(&pred_boxes, &targets.medium);
        assert_eq!(mask.size(), vec![1, 4, 4, 3, 1]);
        assert_abs_diff_eq!(mask.double_value(&[0, 1, 1, 0, 0]), 0.0);
        assert_abs_diff_eq!(mask.double_value(&[0, 1, 1, 1, 0]), 0.0);
        assert_abs_diff_eq!(mask.double_value(&[0, 1, 1, 2, 0]), 1.0);
        assert_abs_diff_eq!(mask.double_value(&[0, 3, 3, 0, 0]), 1.0);
    }

    #[test]
    fn background_only_loss() -> Result<()> {
        let anchors = AnchorSet::parse(SMALL_ANCHORS)?;
        let encoder = AnchorTargetEncoder::new(HW::new(64, 64), anchors.clone(), 2)?;
        let targets = encoder.encode::<BoxLabel>(&[vec![], vec![]])?;
        let loss = YoloLossInit::new(anchors).build();

        // every slot is background with a zero logit
        let value = f64::from(&loss.forward(&zero_output(&targets), &targets)?);
        let num_slots = (2 * 2 + 4 * 4 + 8 * 8) * 3;
        assert_abs_diff_eq!(value, num_slots as f64 * 2f64.ln(), epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn loss_decreases_with_training() -> Result<()> {
        let (anchors, targets) = encode_one_box();
        let loss_fn = YoloLossInit::new(anchors).build();

        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let output = DetectionOutput {
            coarse: root.zeros("coarse", &targets.coarse.size()),
            medium: root.zeros("medium", &targets.medium.size()),
            fine: root.zeros("fine", &targets.fine.size()),
        };
        let mut optimizer = nn::Adam::default().build(&vs, 0.1)?;

        let initial = f64::from(&loss_fn.forward(&output, &targets)?);
        for _ in 0..200 {
            let loss = loss_fn.forward(&output, &targets)?;
            optimizer.backward_step(&loss);
        }
        let last = f64::from(&loss_fn.forward(&output, &targets)?);

        assert!(last.is_finite());
        assert!(last < initial / 2.0, "{} is not below {} / 2", last, initial);
        Ok(())
    }
}
