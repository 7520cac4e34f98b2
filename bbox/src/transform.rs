use super::{Rect, HW, TLBR};
use crate::common::*;

/// Per-axis scaling followed by translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform<T> {
    pub sy: T,
    pub sx: T,
    pub ty: T,
    pub tx: T,
}

impl<T> Transform<T>
where
    T: Float,
{
    /// Places a `src_size` image inside a `tgt_size` canvas with the given
    /// scaled size and top-left offset.
    pub fn from_placement(src_size: HW<T>, placed_size: HW<T>, offset: HW<T>) -> Self {
        Self {
            sy: placed_size.h / src_size.h,
            sx: placed_size.w / src_size.w,
            ty: offset.h,
            tx: offset.w,
        }
    }

    /// Resizes `src_size` to fit in `tgt_size` keeping its aspect ratio,
    /// centered on the canvas.
    pub fn from_sizes_letterbox(src_size: HW<T>, tgt_size: HW<T>) -> Self {
        let scale = (tgt_size.h / src_size.h).min(tgt_size.w / src_size.w);
        let new_h = (src_size.h * scale).floor();
        let new_w = (src_size.w * scale).floor();
        let two = T::one() + T::one();
        let off_y = ((tgt_size.h - new_h) / two).floor();
        let off_x = ((tgt_size.w - new_w) / two).floor();
        Self::from_placement(src_size, HW::new(new_h, new_w), HW::new(off_y, off_x))
    }

    /// The size of a `src_size` image after the transform.
    pub fn scaled_size(&self, src_size: HW<T>) -> HW<T> {
        HW::new(src_size.h * self.sy, src_size.w * self.sx)
    }

    pub fn inverse(&self) -> Self {
        Self {
            sy: T::one() / self.sy,
            sx: T::one() / self.sx,
            ty: -self.ty / self.sy,
            tx: -self.tx / self.sx,
        }
    }
}

impl<T> Mul<&TLBR<T>> for &Transform<T>
where
    T: Float,
{
    type Output = TLBR<T>;

    fn mul(self, rhs: &TLBR<T>) -> Self::Output {
        TLBR {
            t: rhs.t() * self.sy + self.ty,
            l: rhs.l() * self.sx + self.tx,
            b: rhs.b() * self.sy + self.ty,
            r: rhs.r() * self.sx + self.tx,
        }
    }
}
