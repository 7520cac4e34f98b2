//! Class-labeled rectangles.

use bbox::{Rect, Transform, TLBR, HW};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::ops::Mul;

/// A rectangle tagged with a class index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label<R> {
    pub rect: R,
    pub class: usize,
}

/// A labeled box in pixel TLBR coordinates.
pub type BoxLabel = Label<TLBR<f64>>;

impl<R> Rect for Label<R>
where
    R: Rect,
{
    type Type = R::Type;

    fn t(&self) -> Self::Type {
        self.rect.t()
    }

    fn l(&self) -> Self::Type {
        self.rect.l()
    }

    fn b(&self) -> Self::Type {
        self.rect.b()
    }

    fn r(&self) -> Self::Type {
        self.rect.r()
    }

    fn cy(&self) -> Self::Type {
        self.rect.cy()
    }

    fn cx(&self) -> Self::Type {
        self.rect.cx()
    }

    fn h(&self) -> Self::Type {
        self.rect.h()
    }

    fn w(&self) -> Self::Type {
        self.rect.w()
    }
}

impl<T> Label<TLBR<T>>
where
    T: Float,
{
    pub fn flip_horizontal(&self, width: T) -> Self {
        Self {
            rect: self.rect.flip_horizontal(width),
            class: self.class,
        }
    }

    pub fn clip(&self, size: &HW<T>) -> Self {
        Self {
            rect: self.rect.clip(size),
            class: self.class,
        }
    }
}

impl<'a, T> Mul<&'a Label<TLBR<T>>> for &'a Transform<T>
where
    T: Float,
{
    type Output = Label<TLBR<T>>;

    fn mul(self, rhs: &'a Label<TLBR<T>>) -> Self::Output {
        Label {
            rect: self * &rhs.rect,
            class: rhs.class,
        }
    }
}
