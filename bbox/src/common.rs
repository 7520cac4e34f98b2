pub use anyhow::{ensure, Result};
pub use num_traits::{Float, Num, NumCast, ToPrimitive, Zero};
pub use serde::{Deserialize, Serialize};
pub use std::ops::Mul;
