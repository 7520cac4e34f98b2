//! The reference detection network.
//!
//! The backbone produces the three per-scale bottleneck features and the heads
//! are single 1x1 convolutions on top of them, so training the heads on cached
//! features is equivalent to training them on images with a frozen backbone.

use crate::{common::*, phase::ParameterGroup};

/// Per-scale raw predictions shaped `[b, h, w, anchors, 5 + classes]`, the
/// layout of the encoded targets.
#[derive(Debug)]
pub struct DetectionOutput {
    pub coarse: Tensor,
    pub medium: Tensor,
    pub fine: Tensor,
}

impl DetectionOutput {
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
}

#[derive(Debug, Clone)]
struct ConvBnInit {
    in_c: i64,
    out_c: i64,
    k: i64,
    s: i64,
}

impl ConvBnInit {
    fn new(in_c: i64, out_c: i64, k: i64) -> Self {
        Self {
            in_c,
            out_c,
            k,
            s: 1,
        }
    }

    fn stride(self, s: i64) -> Self {
        Self { s, ..self }
    }

    fn build<'p, P>(self, path: P) -> ConvBn
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self { in_c, out_c, k, s } = self;

        let conv = nn::conv2d(
            path / "conv",
            in_c,
            out_c,
            k,
            nn::ConvConfig {
                stride: s,
                padding: k / 2,
                bias: false,
                ..Default::default()
            },
        );
        let bn = nn::batch_norm2d(path / "bn", out_c, Default::default());

        ConvBn { conv, bn }
    }
}

/// Convolution, batch normalization and leaky ReLU with slope 0.1.
#[derive(Debug)]
struct ConvBn {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
}

impl nn::ModuleT for ConvBn {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = xs.apply(&self.conv).apply_t(&self.bn, train);
        xs.maximum(&(&xs * 0.1))
    }
}

/// A small Darknet-style backbone with a top-down feature pyramid.
#[derive(Debug)]
pub struct Backbone {
    stem: ConvBn,
    down_2: ConvBn,
    down_4: ConvBn,
    down_8: ConvBn,
    down_16: ConvBn,
    down_32: ConvBn,
    lateral_32: ConvBn,
    out_coarse: ConvBn,
    reduce_32: ConvBn,
    lateral_16: ConvBn,
    out_medium: ConvBn,
    reduce_16: ConvBn,
    lateral_8: ConvBn,
    out_fine: ConvBn,
    channels: [i64; 3],
}

impl Backbone {
    fn new<'p, P>(path: P, base_channels: i64) -> Self
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let c = base_channels;

        Self {
            stem: ConvBnInit::new(3, c, 3).build(path / "stem"),
            down_2: ConvBnInit::new(c, c * 2, 3).stride(2).build(path / "down_2"),
            down_4: ConvBnInit::new(c * 2, c * 4, 3)
                .stride(2)
                .build(path / "down_4"),
            down_8: ConvBnInit::new(c * 4, c * 8, 3)
                .stride(2)
                .build(path / "down_8"),
            down_16: ConvBnInit::new(c * 8, c * 16, 3)
                .stride(2)
                .build(path / "down_16"),
            down_32: ConvBnInit::new(c * 16, c * 32, 3)
                .stride(2)
                .build(path / "down_32"),
            lateral_32: ConvBnInit::new(c * 32, c * 16, 1).build(path / "lateral_32"),
            out_coarse: ConvBnInit::new(c * 16, c * 32, 3).build(path / "out_coarse"),
            reduce_32: ConvBnInit::new(c * 16, c * 8, 1).build(path / "reduce_32"),
            lateral_16: ConvBnInit::new(c * 24, c * 8, 1).build(path / "lateral_16"),
            out_medium: ConvBnInit::new(c * 8, c * 16, 3).build(path / "out_medium"),
            reduce_16: ConvBnInit::new(c * 8, c * 4, 1).build(path / "reduce_16"),
            lateral_8: ConvBnInit::new(c * 12, c * 4, 1).build(path / "lateral_8"),
            out_fine: ConvBnInit::new(c * 4, c * 8, 3).build(path / "out_fine"),
            channels: [c * 32, c * 16, c * 8],
        }
    }

    /// Feature channels of the coarse, medium and fine outputs.
    pub fn channels(&self) -> [i64; 3] {
        self.channels
    }

    pub fn forward_t(&self, images: &Tensor, train: bool) -> Result<BottleneckFeatures> {
        let x8 = images
            .apply_t(&self.stem, train)
            .apply_t(&self.down_2, train)
            .apply_t(&self.down_4, train)
            .apply_t(&self.down_8, train);
        let x16 = x8.apply_t(&self.down_16, train);
        let x32 = x16.apply_t(&self.down_32, train);

        let p32 = x32.apply_t(&self.lateral_32, train);
        let coarse = p32.apply_t(&self.out_coarse, train);

        let up = upsample_2x(&p32.apply_t(&self.reduce_32, train));
        let p16 = Tensor::cat(&[up, x16], 1).apply_t(&self.lateral_16, train);
        let medium = p16.apply_t(&self.out_medium, train);

        let up = upsample_2x(&p16.apply_t(&self.reduce_16, train));
        let p8 = Tensor::cat(&[up, x8], 1).apply_t(&self.lateral_8, train);
        let fine = p8.apply_t(&self.out_fine, train);

        BottleneckFeatures::new(coarse, medium, fine)
    }
}

fn upsample_2x(xs: &Tensor) -> Tensor {
    let (height, width) = match xs.size().as_slice() {
        &[_b, _c, h, w] => (h, w),
        _ => unreachable!(),
    };
    xs.upsample_nearest2d(&[height * 2, width * 2], Some(2.0), Some(2.0))
}

/// The per-scale 1x1 detection convolutions.
#[derive(Debug)]
pub struct Heads {
    coarse: nn::Conv2D,
    medium: nn::Conv2D,
    fine: nn::Conv2D,
    num_anchors: i64,
    num_channels: i64,
}

impl Heads {
    fn new<'p, P>(path: P, in_channels: [i64; 3], num_anchors: i64, num_classes: i64) -> Self
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let num_channels = num_classes + 5;
        let out_c = num_anchors * num_channels;
        let [coarse_c, medium_c, fine_c] = in_channels;
        let conv = |name: &str, in_c: i64| {
            nn::conv2d(path / name, in_c, out_c, 1, Default::default())
        };

        Self {
            coarse: conv("coarse", coarse_c),
            medium: conv("medium", medium_c),
            fine: conv("fine", fine_c),
            num_anchors,
            num_channels,
        }
    }

    pub fn forward(&self, features: &BottleneckFeatures) -> DetectionOutput {
        let reshape = |xs: Tensor| {
            let (b, h, w) = match xs.size().as_slice() {
                &[b, _c, h, w] => (b, h, w),
                _ => unreachable!(),
            };
            xs.view([b, self.num_anchors, self.num_channels, h, w])
                .permute(&[0, 3, 4, 1, 2])
                .contiguous()
        };

        DetectionOutput {
            coarse: reshape(features.coarse.apply(&self.coarse)),
            medium: reshape(features.medium.apply(&self.medium)),
            fine: reshape(features.fine.apply(&self.fine)),
        }
    }
}

/// Backbone and detection heads, with variables under the `backbone` and
/// `head` prefixes.
#[derive(Debug)]
pub struct DarknetLite {
    backbone: Backbone,
    heads: Heads,
}

impl DarknetLite {
    pub fn new<'p, P>(path: P, base_channels: usize, num_classes: usize) -> Self
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let backbone = Backbone::new(
            path / ParameterGroup::Backbone.prefix(),
            base_channels as i64,
        );
        let heads = Heads::new(
            path / ParameterGroup::Head.prefix(),
            backbone.channels(),
            ANCHORS_PER_SCALE as i64,
            num_classes as i64,
        );
        Self { backbone, heads }
    }

    pub fn backbone(&self) -> &Backbone {
        &self.backbone
    }

    pub fn heads(&self) -> &Heads {
        &self.heads
    }

    pub fn forward_t(&self, images: &Tensor, train: bool) -> Result<DetectionOutput> {
        let features = self.backbone.forward_t(images, train)?;
        Ok(self.heads.forward(&features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_layout_matches_targets() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = DarknetLite::new(&vs.root(), 2, 3);
        let images = Tensor::rand(&[2, 3, 64, 96], FLOAT_CPU);

        let features = model.backbone().forward_t(&images, false)?;
        assert_eq!(features.coarse.size(), vec![2, 64, 2, 3]);
        assert_eq!(features.medium.size(), vec![2, 32, 4, 6]);
        assert_eq!(features.fine.size(), vec![2, 16, 8, 12]);

        let output = model.forward_t(&images, true)?;
        assert_eq!(output.coarse.size(), vec![2, 2, 3, 3, 8]);
        assert_eq!(output.medium.size(), vec![2, 4, 6, 3, 8]);
        assert_eq!(output.fine.size(), vec![2, 8, 12, 3, 8]);

        // running statistics changed in the training pass above
        let features = model.backbone().forward_t(&images, false)?;
        let from_features = model.heads().forward(&features);
        let from_images = model.forward_t(&images, false)?;
        assert!(from_features.fine.allclose(&from_images.fine, 1e-5, 1e-6, false));
        Ok(())
    }

    #[test]
    fn variables_are_grouped() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _model = DarknetLite::new(&vs.root(), 2, 1);
        let variables = vs.variables();
        assert!(!variables.is_empty());
        assert!(variables
            .keys()
            .all(|name| ParameterGroup::of_variable(name).is_some()));
        assert!(variables.contains_key("head.fine.weight"));
        assert!(variables.contains_key("backbone.stem.bn.running_mean"));
    }
}
