pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use bbox::{prelude::*, CyCxHW, Transform, HW, TLBR};
pub use indexmap::IndexSet;
pub use itertools::{izip, Itertools as _};
pub use label::{BoxLabel, Label};
pub use log::{debug, info, warn};
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    fmt::Debug,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::UNIX_EPOCH,
};
pub use tch::{kind::FLOAT_CPU, Device, IndexOp, Kind, Tensor};
