//! HSV color distortion on `[3, H, W]` RGB tensors in range `[0, 1]`.

use crate::common::*;

/// Random hue shift plus saturation and value scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorJitter {
    /// Maximum absolute hue shift, as a fraction of the color wheel.
    pub hue: f64,
    /// Saturation is scaled by a factor in `[1/saturation, saturation]`.
    pub saturation: f64,
    /// Value is scaled by a factor in `[1/value, value]`.
    pub value: f64,
}

impl Default for ColorJitter {
    fn default() -> Self {
        Self {
            hue: 0.1,
            saturation: 1.5,
            value: 1.5,
        }
    }
}

impl ColorJitter {
    pub fn forward(&self, rgb: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
        let hue_shift = if self.hue > 0.0 {
            rng.gen_range(-self.hue..self.hue)
        } else {
            0.0
        };
        let saturation_scale = random_scale(self.saturation, rng);
        let value_scale = random_scale(self.value, rng);

        tch::no_grad(|| -> Result<_> {
            let hsv = rgb_to_hsv(rgb)?;
            let hue = (hsv.select(0, 0) + hue_shift + 1.0).fmod(1.0);
            let saturation = (hsv.select(0, 1) * saturation_scale).clamp(0.0, 1.0);
            let value = (hsv.select(0, 2) * value_scale).clamp(0.0, 1.0);
            hsv_to_rgb(&Tensor::stack(&[hue, saturation, value], 0))
        })
    }
}

fn random_scale(max: f64, rng: &mut StdRng) -> f64 {
    if max <= 1.0 {
        return 1.0;
    }
    let scale = rng.gen_range(1.0..max);
    if rng.gen_bool(0.5) {
        scale
    } else {
        1.0 / scale
    }
}

pub fn rgb_to_hsv(rgb: &Tensor) -> Result<Tensor> {
    let eps = 1e-4;
    let (channels, _height, _width) = rgb.size3()?;
    ensure!(
        channels == 3,
        "channel size must be 3, but get {}",
        channels
    );

    let red = rgb.select(0, 0);
    let green = rgb.select(0, 1);
    let blue = rgb.select(0, 2);

    let (max, argmax) = rgb.max_dim(0, false);
    let (min, _argmin) = rgb.min_dim(0, false);
    let diff = &max - &min;

    let value = max;
    let saturation = (&diff / &value).where_self(&value.gt(eps), &value.zeros_like());

    let case_red = (&green - &blue) / &diff;
    let case_green = (&blue - &red) / &diff + 2.0;
    let case_blue = (&red - &green) / &diff + 4.0;

    let hue = value.zeros_like().where_self(
        &diff.le(eps),
        &case_red.where_self(
            &argmax.eq(0),
            &case_green.where_self(&argmax.eq(1), &case_blue),
        ),
    );
    let hue = hue.where_self(&hue.ge(0.0), &(&hue + 6.0)) / 6.0;

    Ok(Tensor::stack(&[hue, saturation, value], 0))
}

pub fn hsv_to_rgb(hsv: &Tensor) -> Result<Tensor> {
    let (channels, _height, _width) = hsv.size3()?;
    ensure!(
        channels == 3,
        "channel size must be 3, but get {}",
        channels
    );

    let hue = hsv.select(0, 0);
    let saturation = hsv.select(0, 1);
    let value = hsv.select(0, 2);

    let component = |n: f64| {
        let k = (&hue * 6.0 + n).fmod(6.0);
        let weight = k.minimum(&(-&k + 4.0)).clamp(0.0, 1.0);
        &value - &value * &saturation * weight
    };

    Ok(Tensor::stack(
        &[component(5.0), component(3.0), component(1.0)],
        0,
    ))
}
