use super::{Rect, HW, TLBR};
use crate::common::*;

/// Bounding box in CyCxHW format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CyCxHW<T> {
    pub(crate) cy: T,
    pub(crate) cx: T,
    pub(crate) h: T,
    pub(crate) w: T,
}

impl<T> CyCxHW<T>
where
    T: Copy + Num + PartialOrd,
{
    pub fn try_from_cycxhw(cycxhw: [T; 4]) -> Result<Self> {
        let [cy, cx, h, w] = cycxhw;
        let zero = T::zero();
        ensure!(
            h >= zero && w >= zero,
            "box height and width must be non-negative"
        );
        Ok(Self { cy, cx, h, w })
    }

    /// Divides every component by the matching extent of `size`.
    ///
    /// A box inside a `size` canvas maps to the unit square.
    pub fn normalize(&self, size: &HW<T>) -> Self {
        Self {
            cy: self.cy / size.h,
            cx: self.cx / size.w,
            h: self.h / size.h,
            w: self.w / size.w,
        }
    }

    /// Multiplies every component by the matching extent of `size`.
    pub fn denormalize(&self, size: &HW<T>) -> Self {
        Self {
            cy: self.cy * size.h,
            cx: self.cx * size.w,
            h: self.h * size.h,
            w: self.w * size.w,
        }
    }
}

impl<T> Rect for CyCxHW<T>
where
    T: Copy + Num,
{
    type Type = T;

    fn t(&self) -> T {
        let two = T::one() + T::one();
        self.cy - self.h / two
    }

    fn l(&self) -> T {
        let two = T::one() + T::one();
        self.cx - self.w / two
    }

    fn b(&self) -> T {
        let two = T::one() + T::one();
        self.cy + self.h / two
    }

    fn r(&self) -> T {
        let two = T::one() + T::one();
        self.cx + self.w / two
    }

    fn cy(&self) -> T {
        self.cy
    }

    fn cx(&self) -> T {
        self.cx
    }

    fn h(&self) -> T {
        self.h
    }

    fn w(&self) -> T {
        self.w
    }
}

impl<T> From<&TLBR<T>> for CyCxHW<T>
where
    T: Copy + Num,
{
    fn from(from: &TLBR<T>) -> Self {
        Self {
            cy: from.cy(),
            cx: from.cx(),
            h: from.h(),
            w: from.w(),
        }
    }
}

impl<T> From<TLBR<T>> for CyCxHW<T>
where
    T: Copy + Num,
{
    fn from(from: TLBR<T>) -> Self {
        Self::from(&from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn normalize_to_unit_square() {
        let bbox = CyCxHW::from(TLBR::try_from_corners(100.0, 50.0, 300.0, 150.0).unwrap());
        let norm = bbox.normalize(&HW::new(200.0, 400.0));
        assert_abs_diff_eq!(norm.cy(), 0.5);
        assert_abs_diff_eq!(norm.cx(), 0.5);
        assert_abs_diff_eq!(norm.h(), 0.5);
        assert_abs_diff_eq!(norm.w(), 0.5);
        assert_eq!(norm.denormalize(&HW::new(200.0, 400.0)), bbox);
    }
}
