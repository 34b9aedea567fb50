//! Byte-exact pass-through stage, used when only the memory-access style
//! differs between the two sides of a chain.

use crate::area::{copy_areas, Area};
use crate::plugin::{Shape, Stage};
use crate::Result;

/// Identity stage.
pub struct CopyStage {
    shape: Shape,
}

impl CopyStage {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }
}

impl Stage for CopyStage {
    fn src_shape(&self) -> Shape {
        self.shape
    }

    fn dst_shape(&self) -> Shape {
        self.shape
    }

    fn transfer(
        &mut self,
        src: &[Area],
        src_offset: usize,
        src_frames: usize,
        dst: &[Area],
        dst_offset: usize,
        dst_max: usize,
    ) -> Result<(usize, usize)> {
        let frames = src_frames.min(dst_max);
        copy_areas(dst, dst_offset, src, src_offset, frames, self.shape.format)?;
        Ok((frames, frames))
    }
}
