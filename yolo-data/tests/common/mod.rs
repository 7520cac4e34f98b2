#![allow(dead_code)]

use anyhow::Result;
use bbox::HW;
use rand::rngs::StdRng;
use std::sync::Arc;
use tch::{kind::FLOAT_CPU, Tensor};
use yolo_data::{
    AnchorSet, AnchorTargetEncoder, AnnotationRecord, BottleneckFeatures, FeatureExtractor,
    Sample, SampleProducer,
};

pub const YOLO_ANCHORS: &str =
    "116,90, 156,198, 373,326, 30,61, 62,45, 59,119, 10,13, 16,30, 33,23";

/// Produces images filled with the sample number parsed from `img_<n>.jpg`,
/// and passes the boxes through unchanged.
pub struct IndexedProducer;

impl SampleProducer for IndexedProducer {
    fn produce(
        &self,
        record: &AnnotationRecord,
        input_size: HW<usize>,
        _augment: bool,
        proc_img: bool,
        _rng: &mut StdRng,
    ) -> Result<Sample> {
        let image = proc_img.then(|| {
            Tensor::full(
                &[3, input_size.h as i64, input_size.w as i64],
                sample_number(record) as f64,
                FLOAT_CPU,
            )
        });
        Ok(Sample {
            image,
            boxes: record.boxes.clone(),
        })
    }
}

/// Emits features whose values are the input pixel value.
pub struct PoolingExtractor;

impl FeatureExtractor for PoolingExtractor {
    fn extract(&mut self, images: &Tensor) -> Result<BottleneckFeatures> {
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

pub fn sample_number(record: &AnnotationRecord) -> usize {
    let name = record.image.file_stem().unwrap().to_str().unwrap();
    name.trim_start_matches("img_").parse().unwrap()
}

pub fn make_records(n: usize) -> Vec<Arc<AnnotationRecord>> {
    (0..n)
        .map(|index| {
            let line = format!(
                "img_{}.jpg {},{},{},{},{}",
                index,
                10 + index,
                20,
                60 + 3 * index,
                90,
                index % 3
            );
            Arc::new(AnnotationRecord::parse_line(&line).unwrap())
        })
        .collect()
}

pub fn make_encoder(input_size: usize, num_classes: usize) -> Arc<AnchorTargetEncoder> {
    let encoder = AnchorTargetEncoder::new(
        HW::new(input_size, input_size),
        AnchorSet::parse(YOLO_ANCHORS).unwrap(),
        num_classes,
    )
    .unwrap();
    Arc::new(encoder)
}
