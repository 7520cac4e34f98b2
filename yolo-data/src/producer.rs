//! Turning annotation records into letterboxed image tensors and boxes.

use crate::{annotation::AnnotationRecord, color::ColorJitter, common::*};
use image::{imageops::FilterType, io::Reader as ImageReader, DynamicImage, GenericImageView};

const CANVAS_FILL: f64 = 128.0 / 255.0;

/// A produced sample.
#[derive(Debug)]
pub struct Sample {
    /// `[3, H, W]` RGB in range `[0, 1]`, or `None` when image processing was
    /// not requested.
    pub image: Option<Tensor>,
    /// Boxes in input-pixel TLBR coordinates.
    pub boxes: Vec<BoxLabel>,
}

/// Produces one training sample from an annotation record.
pub trait SampleProducer
where
    Self: Send + Sync,
{
    /// With `proc_img = false` only the box geometry is computed and the
    /// image itself is neither decoded nor returned.
    fn produce(
        &self,
        record: &AnnotationRecord,
        input_size: HW<usize>,
        augment: bool,
        proc_img: bool,
        rng: &mut StdRng,
    ) -> Result<Sample>;
}

/// Resizes the image into the input canvas keeping the aspect ratio and pads
/// the rest with grey.
///
/// With augmentation the image is randomly rescaled, stretched, placed,
/// flipped and color distorted, and the boxes follow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LetterboxProducer {
    pub max_boxes: usize,
    /// Aspect ratio jitter.
    pub jitter: f64,
    pub min_scale: f64,
    pub max_scale: f64,
    pub flip_prob: f64,
    pub color_jitter: ColorJitter,
}

impl Default for LetterboxProducer {
    fn default() -> Self {
        Self {
            max_boxes: 20,
            jitter: 0.3,
            min_scale: 0.25,
            max_scale: 2.0,
            flip_prob: 0.5,
            color_jitter: ColorJitter::default(),
        }
    }
}

impl SampleProducer for LetterboxProducer {
    fn produce(
        &self,
        record: &AnnotationRecord,
        input_size: HW<usize>,
        augment: bool,
        proc_img: bool,
        rng: &mut StdRng,
    ) -> Result<Sample> {
        let path = &record.image;
        let image = if proc_img {
            Some(open_image(path)?)
        } else {
            None
        };
        let image_size = match &image {
            Some(image) => {
                let (width, height) = image.dimensions();
                HW::new(height as usize, width as usize)
            }
            None => {
                let (width, height) = image::image_dimensions(path).with_context(|| {
                    format!("failed to read image size of '{}'", path.display())
                })?;
                HW::new(height as usize, width as usize)
            }
        };
        ensure!(
            image_size.h > 0 && image_size.w > 0,
            "image '{}' is empty",
            path.display()
        );

        let sample = if augment {
            self.produce_augmented(record, image_size, image, input_size, proc_img, rng)?
        } else {
            self.produce_plain(record, image_size, image, input_size)?
        };
        Ok(sample)
    }
}

impl LetterboxProducer {
    fn produce_plain(
        &self,
        record: &AnnotationRecord,
        image_size: HW<usize>,
        image: Option<DynamicImage>,
        input_size: HW<usize>,
    ) -> Result<Sample> {
        let src_size = to_f64(image_size);
        let transform = Transform::from_sizes_letterbox(src_size, to_f64(input_size));
        let placed = transform.scaled_size(src_size);

        let image = image
            .map(|image| -> Result<_> {
                let resized = resize(&image, placed)?;
                Ok(paste(
                    &resized,
                    input_size,
                    transform.ty as i64,
                    transform.tx as i64,
                ))
            })
            .transpose()?;

        let boxes: Vec<_> = record
            .boxes
            .iter()
            .take(self.max_boxes)
            .map(|bbox| &transform * bbox)
            .collect();

        Ok(Sample { image, boxes })
    }

    fn produce_augmented(
        &self,
        record: &AnnotationRecord,
        image_size: HW<usize>,
        image: Option<DynamicImage>,
        input_size: HW<usize>,
        proc_img: bool,
        rng: &mut StdRng,
    ) -> Result<Sample> {
        let src_size = to_f64(image_size);
        let canvas_size = to_f64(input_size);

        // random scaling and aspect ratio
        let aspect = {
            let lower = 1.0 - self.jitter;
            let upper = 1.0 + self.jitter;
            canvas_size.w / canvas_size.h * random_range(rng, lower, upper)
                / random_range(rng, lower, upper)
        };
        let scale = random_range(rng, self.min_scale, self.max_scale);
        let (placed_h, placed_w) = if aspect < 1.0 {
            let h = (scale * canvas_size.h).floor();
            (h, (h * aspect).floor())
        } else {
            let w = (scale * canvas_size.w).floor();
            ((w / aspect).floor(), w)
        };
        let placed = HW::new(placed_h.max(1.0), placed_w.max(1.0));

        // random placement
        let dy = random_range(rng, 0.0, canvas_size.h - placed.h).floor();
        let dx = random_range(rng, 0.0, canvas_size.w - placed.w).floor();
        let flip = rng.gen_bool(self.flip_prob.clamp(0.0, 1.0));

        let transform = Transform::from_placement(src_size, placed, HW::new(dy, dx));

        let image = match image {
            Some(image) if proc_img => {
                let resized = resize(&image, placed)?;
                let canvas = paste(&resized, input_size, dy as i64, dx as i64);
                let canvas = if flip { canvas.flip(&[2]) } else { canvas };
                Some(self.color_jitter.forward(&canvas, rng)?)
            }
            _ => None,
        };

        let mut boxes: Vec<BoxLabel> = record
            .boxes
            .iter()
            .map(|bbox| {
                let bbox = &transform * bbox;
                let bbox = if flip {
                    bbox.flip_horizontal(canvas_size.w)
                } else {
                    bbox
                };
                bbox.clip(&canvas_size)
            })
            .filter(|bbox| bbox.w() > 1.0 && bbox.h() > 1.0)
            .collect();
        boxes.shuffle(rng);
        boxes.truncate(self.max_boxes);

        Ok(Sample { image, boxes })
    }
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    let image = ImageReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .with_guessed_format()
        .with_context(|| {
            format!(
                "failed to determine the image file format: {}",
                path.display()
            )
        })?
        .decode()
        .with_context(|| format!("failed to decode image file: {}", path.display()))?;
    Ok(image)
}

fn to_f64(size: HW<usize>) -> HW<f64> {
    HW::new(size.h as f64, size.w as f64)
}

/// Samples between two bounds given in either order.
fn random_range(rng: &mut StdRng, from: f64, to: f64) -> f64 {
    let (lower, upper) = if from <= to { (from, to) } else { (to, from) };
    if upper > lower {
        rng.gen_range(lower..upper)
    } else {
        lower
    }
}

/// Resizes the image and converts it to a `[3, h, w]` float tensor.
fn resize(image: &DynamicImage, size: HW<f64>) -> Result<Tensor> {
    let height = size.h as u32;
    let width = size.w as u32;
    ensure!(height > 0 && width > 0, "invalid resize target {:?}", size);

    let rgb = image
        .resize_exact(width, height, FilterType::CatmullRom)
        .to_rgb8();
    let tensor = tch::no_grad(|| {
        (Tensor::of_slice(rgb.as_raw()).to_kind(Kind::Float) / 255.0)
            .view([height as i64, width as i64, 3])
            .permute(&[2, 0, 1])
    });
    Ok(tensor)
}

/// Pastes `image` on a grey canvas with its top-left corner at `(dy, dx)`.
///
/// Parts falling outside of the canvas are cropped.
fn paste(image: &Tensor, canvas_size: HW<usize>, dy: i64, dx: i64) -> Tensor {
    let canvas_h = canvas_size.h as i64;
    let canvas_w = canvas_size.w as i64;
    let image_size = image.size();
    let (image_h, image_w) = (image_size[1], image_size[2]);

    tch::no_grad(|| {
        let canvas = Tensor::full(&[3, canvas_h, canvas_w], CANVAS_FILL, FLOAT_CPU);

        let top = dy.max(0);
        let left = dx.max(0);
        let bottom = (dy + image_h).min(canvas_h);
        let right = (dx + image_w).min(canvas_w);

        if bottom > top && right > left {
            let mut region = canvas.i((.., top..bottom, left..right));
            region.copy_(&image.i((.., (top - dy)..(bottom - dy), (left - dx)..(right - dx))));
        }
        canvas
    })
}
