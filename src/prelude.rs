//! Prelude module for `pcmflow`. Use as a star-import.

pub use crate::backend::file::FilePcm;
pub use crate::backend::null::NullPcm;
pub use crate::backend::share::{ShareHub, ShareRegistry};
pub use crate::format::SampleFormat;
pub use crate::params::{Access, HwConfig, HwParams, Interval, SwParams};
pub use crate::pcm::{Direction, Pcm, State, Status};
pub use crate::plugin::PlugPcm;
pub use crate::{Error, Result};
