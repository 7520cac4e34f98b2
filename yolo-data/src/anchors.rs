//! Anchor shapes grouped by detection scale.

use crate::common::*;

pub const NUM_SCALES: usize = 3;
pub const ANCHORS_PER_SCALE: usize = 3;

/// One of the three detection resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scale {
    Coarse,
    Medium,
    Fine,
}

impl Scale {
    pub const ALL: [Scale; NUM_SCALES] = [Scale::Coarse, Scale::Medium, Scale::Fine];

    pub fn index(&self) -> usize {
        match self {
            Self::Coarse => 0,
            Self::Medium => 1,
            Self::Fine => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Input pixels per grid cell.
    pub fn stride(&self) -> usize {
        match self {
            Self::Coarse => 32,
            Self::Medium => 16,
            Self::Fine => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Coarse => "coarse",
            Self::Medium => "medium",
            Self::Fine => "fine",
        }
    }

    /// The grid size for an input resolution.
    pub fn grid_size(&self, input_size: &HW<usize>) -> HW<usize> {
        let stride = self.stride();
        HW::new(input_size.h / stride, input_size.w / stride)
    }
}

/// The ordered anchor list, three consecutive anchors per scale from coarse
/// to fine.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorSet {
    anchors: Vec<HW<f64>>,
}

impl AnchorSet {
    pub fn new(anchors: Vec<HW<f64>>) -> Result<Self> {
        ensure!(
            anchors.len() == NUM_SCALES * ANCHORS_PER_SCALE,
            "expect {} anchors, but get {}",
            NUM_SCALES * ANCHORS_PER_SCALE,
            anchors.len()
        );
        ensure!(
            anchors
                .iter()
                .all(|anchor| anchor.h.is_finite()
                    && anchor.w.is_finite()
                    && anchor.h > 0.0
                    && anchor.w > 0.0),
            "anchor sizes must be positive"
        );
        Ok(Self { anchors })
    }

    /// Builds the set from a flat `w0, h0, w1, h1, ...` list.
    pub fn from_wh_values(values: &[f64]) -> Result<Self> {
        ensure!(
            values.len() % 2 == 0,
            "anchor values must come in (w, h) pairs, but get {} values",
            values.len()
        );
        let anchors = values
            .chunks(2)
            .map(|pair| HW::new(pair[1], pair[0]))
            .collect();
        Self::new(anchors)
    }

    /// Parses the first line of an anchor file.
    pub fn parse(text: &str) -> Result<Self> {
        let line = text
            .lines()
            .next()
            .ok_or_else(|| format_err!("the anchor text is empty"))?;
        let values: Vec<f64> = line
            .split(',')
            .map(|value| {
                let value = value.trim();
                value
                    .parse()
                    .with_context(|| format!("invalid anchor value '{}'", value))
            })
            .try_collect()?;
        Self::from_wh_values(&values)
    }

    pub fn load<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read anchors file '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid anchors file '{}'", path.display()))
    }

    pub fn anchors(&self) -> &[HW<f64>] {
        &self.anchors
    }

    /// The anchor triple of a scale.
    pub fn group(&self, scale: Scale) -> &[HW<f64>] {
        let start = scale.index() * ANCHORS_PER_SCALE;
        &self.anchors[start..(start + ANCHORS_PER_SCALE)]
    }

    /// Maps a flat anchor index to its scale and slot within that scale.
    pub fn locate(&self, index: usize) -> (Scale, usize) {
        let scale = Scale::ALL[index / ANCHORS_PER_SCALE];
        (scale, index % ANCHORS_PER_SCALE)
    }

    /// The index and IoU of the anchor whose shape overlaps `shape` most.
    ///
    /// Ties go to the anchor listed first.
    pub fn best_match(&self, shape: &HW<f64>) -> (usize, f64) {
        self.anchors
            .iter()
            .map(|anchor| anchor.shape_iou(shape))
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(best_index, best_iou), (index, iou)| {
                if iou > best_iou {
                    (index, iou)
                } else {
                    (best_index, best_iou)
                }
            })
    }
}
