use super::{CyCxHW, Rect, HW};
use crate::common::*;

/// Bounding box in TLBR format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TLBR<T> {
    pub(crate) t: T,
    pub(crate) l: T,
    pub(crate) b: T,
    pub(crate) r: T,
}

impl<T> TLBR<T>
where
    T: Copy + Num + PartialOrd,
{
    pub fn try_from_tlbr(tlbr: [T; 4]) -> Result<Self> {
        let [t, l, b, r] = tlbr;
        ensure!(b >= t && r >= l, "b >= t and r >= l must hold");
        Ok(Self { t, l, b, r })
    }

    /// Builds a box from image-style corners, x before y.
    pub fn try_from_corners(x_min: T, y_min: T, x_max: T, y_max: T) -> Result<Self> {
        Self::try_from_tlbr([y_min, x_min, y_max, x_max])
    }

    /// Mirrors the box along the vertical axis of an image of `width`.
    pub fn flip_horizontal(&self, width: T) -> Self {
        Self {
            t: self.t,
            l: width - self.r,
            b: self.b,
            r: width - self.l,
        }
    }

    /// Clips the box to the `[0, h] x [0, w]` canvas.
    ///
    /// Boxes entirely outside the canvas collapse to zero area.
    pub fn clip(&self, size: &HW<T>) -> Self {
        let zero = T::zero();
        let clamp = |value: T, max: T| {
            if value < zero {
                zero
            } else if value > max {
                max
            } else {
                value
            }
        };
        let t = clamp(self.t, size.h);
        let l = clamp(self.l, size.w);
        let b = clamp(self.b, size.h);
        let r = clamp(self.r, size.w);
        Self {
            t,
            l,
            b: if b < t { t } else { b },
            r: if r < l { l } else { r },
        }
    }
}

impl<T> TLBR<T> {
    pub fn try_cast<V>(self) -> Option<TLBR<V>>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        Some(TLBR {
            t: V::from(self.t)?,
            l: V::from(self.l)?,
            b: V::from(self.b)?,
            r: V::from(self.r)?,
        })
    }
}

impl<T> Rect for TLBR<T>
where
    T: Copy + Num,
{
    type Type = T;

    fn t(&self) -> T {
        self.t
    }

    fn l(&self) -> T {
        self.l
    }

    fn b(&self) -> T {
        self.b
    }

    fn r(&self) -> T {
        self.r
    }

    fn cy(&self) -> T {
        let two = T::one() + T::one();
        self.t + self.h() / two
    }

    fn cx(&self) -> T {
        let two = T::one() + T::one();
        self.l + self.w() / two
    }

    fn h(&self) -> T {
        self.b - self.t
    }

    fn w(&self) -> T {
        self.r - self.l
    }
}

impl<T> From<&CyCxHW<T>> for TLBR<T>
where
    T: Copy + Num,
{
    fn from(from: &CyCxHW<T>) -> Self {
        let two = T::one() + T::one();
        let CyCxHW { cy, cx, h, w } = *from;
        Self {
            t: cy - h / two,
            l: cx - w / two,
            b: cy + h / two,
            r: cx + w / two,
        }
    }
}
