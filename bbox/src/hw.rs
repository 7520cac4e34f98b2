use crate::common::*;

/// A height/width pair, used both for image sizes and anchor shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HW<T> {
    pub h: T,
    pub w: T,
}

impl<T> HW<T> {
    pub fn new(h: T, w: T) -> Self {
        Self { h, w }
    }

    pub fn try_cast<U>(self) -> Option<HW<U>>
    where
        T: ToPrimitive,
        U: NumCast,
    {
        Some(HW {
            h: U::from(self.h)?,
            w: U::from(self.w)?,
        })
    }
}

impl<T> HW<T>
where
    T: Num + PartialOrd + Copy,
{
    pub fn try_from_hw(hw: [T; 2]) -> Result<Self> {
        let [h, w] = hw;
        let zero = T::zero();
        ensure!(
            h >= zero && w >= zero,
            "height and width parameters must be non-negative"
        );
        Ok(Self { h, w })
    }

    pub fn area(&self) -> T {
        self.w * self.h
    }
}

impl<T> HW<T>
where
    T: Float,
{
    /// IoU of two shapes placed on the same center.
    ///
    /// Position is ignored, only the width and height compatibility counts.
    pub fn shape_iou(&self, other: &Self) -> T {
        let zero = T::zero();
        let inter = self.h.min(other.h).max(zero) * self.w.min(other.w).max(zero);
        let union = self.area() + other.area() - inter;
        if union > zero {
            inter / union
        } else {
            zero
        }
    }
}
