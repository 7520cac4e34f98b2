//! Conversion of ground-truth boxes into dense per-scale anchor targets.

use crate::{
    anchors::{AnchorSet, Scale, ANCHORS_PER_SCALE},
    common::*,
};

/// Channel offsets within the last target dimension.
pub const CHANNEL_CX: usize = 0;
pub const CHANNEL_CY: usize = 1;
pub const CHANNEL_W: usize = 2;
pub const CHANNEL_H: usize = 3;
pub const CHANNEL_OBJECTNESS: usize = 4;
pub const CHANNEL_CLASS: usize = 5;

/// Dense targets for the three scales, each shaped
/// `[batch, grid_h, grid_w, anchors, 5 + classes]`.
#[derive(Debug)]
pub struct ScaleTargets {
    pub coarse: Tensor,
    pub medium: Tensor,
    pub fine: Tensor,
}

impl ScaleTargets {
    pub fn get(&self, scale: Scale) -> &Tensor {
        match scale {
            Scale::Coarse => &self.coarse,
            Scale::Medium => &self.medium,
            Scale::Fine => &self.fine,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Scale, &Tensor)> {
        Scale::ALL.into_iter().map(move |scale| (scale, self.get(scale)))
    }

    pub fn shallow_clone(&self) -> Self {
        Self {
            coarse: self.coarse.shallow_clone(),
            medium: self.medium.shallow_clone(),
            fine: self.fine.shallow_clone(),
        }
    }

    pub fn to_device(&self, device: Device) -> Self {
        Self {
            coarse: self.coarse.to_device(device),
            medium: self.medium.to_device(device),
            fine: self.fine.to_device(device),
        }
    }

    /// Number of positive slots summed over all scales.
    pub fn num_positives(&self) -> usize {
        self.iter()
            .map(|(_, tensor)| {
                let count = tensor
                    .i((.., .., .., .., CHANNEL_OBJECTNESS as i64))
                    .sum(Kind::Float);
                f64::from(&count) as usize
            })
            .sum()
    }

    pub fn equal(&self, other: &Self) -> bool {
        self.coarse.equal(&other.coarse)
            && self.medium.equal(&other.medium)
            && self.fine.equal(&other.fine)
    }
}

/// Where a ground-truth box lands in the target tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub anchor_index: usize,
    pub scale: Scale,
    pub anchor_slot: usize,
    pub grid_row: usize,
    pub grid_col: usize,
    /// Center and size in grid units of the selected scale, ordered `[cx, cy, w, h]`.
    pub xywh: [f64; 4],
    pub class: usize,
}

/// Encodes box lists into anchor-grid targets.
///
/// The encoder has no state besides its configuration; the same input
/// always produces bit-identical tensors.
#[derive(Debug, Clone)]
pub struct AnchorTargetEncoder {
    input_size: HW<usize>,
    anchors: AnchorSet,
    num_classes: usize,
}

impl AnchorTargetEncoder {
    pub fn new(input_size: HW<usize>, anchors: AnchorSet, num_classes: usize) -> Result<Self> {
        let max_stride = Scale::Coarse.stride();
        ensure!(
            input_size.h > 0 && input_size.w > 0,
            "input size must be positive"
        );
        ensure!(
            input_size.h % max_stride == 0 && input_size.w % max_stride == 0,
            "input size {}x{} must be a multiple of {}",
            input_size.h,
            input_size.w,
            max_stride
        );
        ensure!(num_classes > 0, "the number of classes must be positive");

        Ok(Self {
            input_size,
            anchors,
            num_classes,
        })
    }

    pub fn input_size(&self) -> HW<usize> {
        self.input_size
    }

    pub fn anchors(&self) -> &AnchorSet {
        &self.anchors
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_channels(&self) -> usize {
        CHANNEL_CLASS + self.num_classes
    }

    /// The target tensor shape of a scale for a batch.
    pub fn target_shape(&self, scale: Scale, batch_size: usize) -> [i64; 5] {
        let grid = scale.grid_size(&self.input_size);
        [
            batch_size as i64,
            grid.h as i64,
            grid.w as i64,
            ANCHORS_PER_SCALE as i64,
            self.num_channels() as i64,
        ]
    }

    /// Finds the responsible anchor and grid cell of a box given in input
    /// pixel coordinates.
    ///
    /// Returns `None` for boxes without positive width and height.
    pub fn assign(&self, bbox: &BoxLabel) -> Result<Option<Assignment>> {
        ensure!(
            bbox.class < self.num_classes,
            "class id {} is out of range, there are {} classes",
            bbox.class,
            self.num_classes
        );

        if bbox.is_degenerate() {
            return Ok(None);
        }

        let input_size: HW<f64> = HW::new(self.input_size.h as f64, self.input_size.w as f64);
        let pixel = bbox.to_cycxhw();
        let ratio = pixel.normalize(&input_size);

        let (anchor_index, _iou) = self.anchors.best_match(&pixel.size());
        let (scale, anchor_slot) = self.anchors.locate(anchor_index);

        let grid_size = scale.grid_size(&self.input_size);
        let grid: HW<f64> = HW::new(grid_size.h as f64, grid_size.w as f64);
        let grid_box = ratio.denormalize(&grid);

        let cell = |pos: f64, len: usize| (pos.floor().max(0.0) as usize).min(len - 1);
        let grid_row = cell(grid_box.cy(), grid_size.h);
        let grid_col = cell(grid_box.cx(), grid_size.w);

        Ok(Some(Assignment {
            anchor_index,
            scale,
            anchor_slot,
            grid_row,
            grid_col,
            xywh: [grid_box.cx(), grid_box.cy(), grid_box.w(), grid_box.h()],
            class: bbox.class,
        }))
    }

    /// Encodes a batch of per-image box lists.
    ///
    /// A box that claims an already occupied slot of the same image replaces
    /// the earlier box entirely.
    pub fn encode<B>(&self, batch: &[Vec<B>]) -> Result<ScaleTargets>
    where
        B: Borrow<BoxLabel>,
    {
        let batch_size = batch.len();
        let num_channels = self.num_channels();
        let shapes: Vec<_> = Scale::ALL
            .iter()
            .map(|&scale| self.target_shape(scale, batch_size))
            .collect();
        let mut buffers: Vec<Vec<f32>> = shapes
            .iter()
            .map(|shape| vec![0f32; shape.iter().product::<i64>() as usize])
            .collect();

        for (batch_index, bboxes) in batch.iter().enumerate() {
            for bbox in bboxes {
                let assignment = match self.assign(bbox.borrow())? {
                    Some(assignment) => assignment,
                    None => continue,
                };
                let Assignment {
                    scale,
                    anchor_slot,
                    grid_row,
                    grid_col,
                    xywh,
                    class,
                    ..
                } = assignment;

                let [_, grid_h, grid_w, _, _] = shapes[scale.index()];
                let offset = (((batch_index * grid_h as usize + grid_row) * grid_w as usize
                    + grid_col)
                    * ANCHORS_PER_SCALE
                    + anchor_slot)
                    * num_channels;
                let slot = &mut buffers[scale.index()][offset..(offset + num_channels)];

                slot.iter_mut().for_each(|value| *value = 0.0);
                slot[CHANNEL_CX] = xywh[0] as f32;
                slot[CHANNEL_CY] = xywh[1] as f32;
                slot[CHANNEL_W] = xywh[2] as f32;
                slot[CHANNEL_H] = xywh[3] as f32;
                slot[CHANNEL_OBJECTNESS] = 1.0;
                slot[CHANNEL_CLASS + class] = 1.0;
            }
        }

        let to_tensor =
            |scale: Scale| Tensor::of_slice(&buffers[scale.index()]).view(shapes[scale.index()]);

        Ok(ScaleTargets {
            coarse: to_tensor(Scale::Coarse),
            medium: to_tensor(Scale::Medium),
            fine: to_tensor(Scale::Fine),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YOLO_ANCHORS: &str =
        "116,90, 156,198, 373,326, 30,61, 62,45, 59,119, 10,13, 16,30, 33,23";

    fn encoder(num_classes: usize) -> AnchorTargetEncoder {
        AnchorTargetEncoder::new(
            HW::new(416, 416),
            AnchorSet::parse(YOLO_ANCHORS).unwrap(),
            num_classes,
        )
        .unwrap()
    }

    fn label(x_min: f64, y_min: f64, x_max: f64, y_max: f64, class: usize) -> BoxLabel {
        Label {
            rect: TLBR::try_from_corners(x_min, y_min, x_max, y_max).unwrap(),
            class,
        }
    }

    #[test]
    fn target_shapes_for_416() {
        let targets = encoder(4).encode::<BoxLabel>(&[vec![], vec![]]).unwrap();
        assert_eq!(targets.coarse.size(), vec![2, 13, 13, 3, 9]);
        assert_eq!(targets.medium.size(), vec![2, 26, 26, 3, 9]);
        assert_eq!(targets.fine.size(), vec![2, 52, 52, 3, 9]);
        assert_eq!(targets.num_positives(), 0);
    }

    #[test]
    fn reject_misaligned_input_size() {
        let anchors = AnchorSet::parse(YOLO_ANCHORS).unwrap();
        assert!(AnchorTargetEncoder::new(HW::new(400, 416), anchors, 1).is_err());
    }

    #[test]
    fn small_box_goes_to_fine_scale() {
        let encoder = encoder(2);
        let bbox = label(100.0, 200.0, 110.0, 213.0, 1);
        let assignment = encoder.assign(&bbox).unwrap().unwrap();
        assert_eq!(assignment.anchor_index, 6);
        assert_eq!((assignment.scale, assignment.anchor_slot), (Scale::Fine, 0));
        // center (105, 206.5) on a 52x52 grid with stride 8
        assert_eq!((assignment.grid_row, assignment.grid_col), (25, 13));

        let targets = encoder.encode(&[vec![bbox]]).unwrap();
        let slot = targets.fine.i((0, 25, 13, 0));
        let values = Vec::<f32>::from(&slot);
        assert_eq!(values, vec![13.125, 25.8125, 1.25, 1.625, 1.0, 0.0, 1.0]);
        assert_eq!(targets.num_positives(), 1);
    }

    #[test]
    fn degenerate_boxes_are_dropped() {
        let encoder = encoder(1);
        let boxes = vec![label(5.0, 5.0, 5.0, 50.0, 0), label(5.0, 5.0, 50.0, 5.0, 0)];
        let targets = encoder.encode(&[boxes]).unwrap();
        assert_eq!(targets.num_positives(), 0);
    }

    #[test]
    fn later_box_overwrites_same_slot() {
        let encoder = encoder(3);
        let first = label(100.0, 100.0, 110.0, 113.0, 0);
        let second = label(101.0, 101.0, 111.0, 114.0, 2);
        let targets = encoder.encode(&[vec![first, second.clone()]]).unwrap();
        assert_eq!(targets.num_positives(), 1);

        let assignment = encoder.assign(&second).unwrap().unwrap();
        let slot = targets.fine.i((
            0,
            assignment.grid_row as i64,
            assignment.grid_col as i64,
            assignment.anchor_slot as i64,
        ));
        let values = Vec::<f32>::from(&slot);
        assert_eq!(&values[CHANNEL_CLASS..], &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn center_on_far_edge_stays_in_grid() {
        let encoder = encoder(1);
        let assignment = encoder
            .assign(&label(300.0, 300.0, 532.0, 532.0, 0))
            .unwrap()
            .unwrap();
        let grid = assignment.scale.grid_size(&encoder.input_size());
        assert!(assignment.grid_row < grid.h && assignment.grid_col < grid.w);
    }

    #[test]
    fn out_of_range_class_fails() {
        let encoder = encoder(2);
        assert!(encoder.encode(&[vec![label(1.0, 1.0, 9.0, 9.0, 2)]]).is_err());
    }
}
