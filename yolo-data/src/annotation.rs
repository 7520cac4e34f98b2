//! The line-oriented annotation list and the train/validation split.

use crate::common::*;

/// One training sample: an image reference and its labeled boxes.
///
/// Boxes are kept in the pixel coordinates of the original image.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationRecord {
    pub image: PathBuf,
    pub boxes: Vec<BoxLabel>,
    line: String,
}

impl AnnotationRecord {
    /// Parses `image x_min,y_min,x_max,y_max,class ...`.
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let image = fields
            .next()
            .ok_or_else(|| format_err!("the annotation line is empty"))?;
        let boxes: Vec<_> = fields.map(parse_box).try_collect()?;

        Ok(Self {
            image: PathBuf::from(image),
            boxes,
            line: line.trim().to_owned(),
        })
    }

    /// The normalized source line this record was parsed from.
    pub fn line(&self) -> &str {
        &self.line
    }
}

fn parse_box(field: &str) -> Result<BoxLabel> {
    let values: Vec<_> = field.split(',').collect();
    ensure!(
        values.len() == 5,
        "expect 5 comma-separated values in box '{}', but get {}",
        field,
        values.len()
    );

    let coords: Vec<f64> = values[0..4]
        .iter()
        .map(|value| {
            value
                .parse::<f64>()
                .with_context(|| format!("invalid coordinate '{}' in box '{}'", value, field))
        })
        .try_collect()?;
    let class: usize = values[4]
        .parse()
        .with_context(|| format!("invalid class id '{}' in box '{}'", values[4], field))?;

    let rect = TLBR::try_from_corners(coords[0], coords[1], coords[2], coords[3])
        .with_context(|| format!("malformed box '{}'", field))?;
    Ok(Label { rect, class })
}

/// Loads every non-blank line of an annotation file in file order.
pub fn load_annotation_file<P>(path: P) -> Result<Vec<AnnotationRecord>>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read annotation file '{}'", path.display()))?;

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            AnnotationRecord::parse_line(line).with_context(|| {
                format!("failed to parse line {} of '{}'", index + 1, path.display())
            })
        })
        .try_collect()
}

/// Loads the class list. The line order defines the class ids.
pub fn load_classes_file<P>(path: P) -> Result<IndexSet<String>>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read classes file '{}'", path.display()))?;
    let lines: Vec<_> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let classes: IndexSet<_> = lines.iter().cloned().map(ToOwned::to_owned).collect();
    ensure!(
        lines.len() == classes.len(),
        "duplicated class names found in '{}'",
        path.display()
    );
    ensure!(
        !classes.is_empty(),
        "no classes found in '{}'",
        path.display()
    );
    Ok(classes)
}

/// Splits the records into training and validation partitions.
pub fn split_records(
    records: Vec<AnnotationRecord>,
    val_split: f64,
    seed: u64,
) -> Result<DatasetSplit> {
    DatasetSplit::new(records, val_split, seed)
}

/// The train/validation partition, fixed once before training starts.
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    train: Vec<Arc<AnnotationRecord>>,
    val: Vec<Arc<AnnotationRecord>>,
}

impl DatasetSplit {
    /// Shuffles the records with a seeded generator and cuts off the last
    /// `floor(val_split * N)` records as the validation partition.
    pub fn new(records: Vec<AnnotationRecord>, val_split: f64, seed: u64) -> Result<Self> {
        ensure!(
            (0.0..1.0).contains(&val_split),
            "val_split must be in range [0, 1), but get {}",
            val_split
        );

        let mut records: Vec<_> = records.into_iter().map(Arc::new).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        records.shuffle(&mut rng);

        let num_val = (records.len() as f64 * val_split).floor() as usize;
        let num_train = records.len() - num_val;
        let val = records.split_off(num_train);

        Ok(Self {
            train: records,
            val,
        })
    }

    pub fn train(&self) -> &[Arc<AnnotationRecord>] {
        &self.train
    }

    pub fn val(&self) -> &[Arc<AnnotationRecord>] {
        &self.val
    }

    pub fn num_train(&self) -> usize {
        self.train.len()
    }

    pub fn num_val(&self) -> usize {
        self.val.len()
    }

    /// The full shuffled sequence, training records first.
    ///
    /// Index `i < num_train()` is the i-th training record and the rest follow
    /// the validation order, which is the layout the bottleneck cache uses.
    pub fn ordered(&self) -> Vec<Arc<AnnotationRecord>> {
        self.train.iter().chain(self.val.iter()).cloned().collect()
    }

    /// Checks every class id against the class list size.
    pub fn check_classes(&self, num_classes: usize) -> Result<()> {
        self.train
            .iter()
            .chain(self.val.iter())
            .flat_map(|record| record.boxes.iter().map(move |bbox| (record, bbox)))
            .try_for_each(|(record, bbox)| {
                ensure!(
                    bbox.class < num_classes,
                    "class id {} in '{}' is out of range, there are {} classes",
                    bbox.class,
                    record.image.display(),
                    num_classes
                );
                Ok(())
            })
    }
}
