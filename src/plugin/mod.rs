//! The conversion-stage framework.
//!
//! A stage converts frames between two declared shapes; a chain is a list
//! of stages whose adjacent shapes match exactly, checked at construction.
//! Stages may process fewer frames than offered (the resampler's
//! throughput is fractional), so the chain loops each stage until its
//! input is consumed.

pub mod alaw;
pub mod copy;
pub mod linear;
pub mod mulaw;
pub mod plug;
pub mod rate;
pub mod route;

pub use plug::PlugPcm;

use crate::area::Area;
use crate::format::SampleFormat;
use crate::{Error, Result};

/// The frame layout on one side of a conversion stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    /// Sample format.
    pub format: SampleFormat,
    /// Channel count.
    pub channels: usize,
    /// Sample rate in Hz.
    pub rate: u64,
}

impl Shape {
    /// Bytes per frame in this shape.
    pub fn frame_bytes(&self) -> usize {
        self.channels * self.format.physical_width() / 8
    }
}

/// One conversion step.
pub trait Stage: Send {
    /// Shape consumed.
    fn src_shape(&self) -> Shape;

    /// Shape produced.
    fn dst_shape(&self) -> Shape;

    /// Steady-state frames produced for `src` frames consumed, rounded
    /// down. The actual count of a single call may exceed this by at most
    /// [`Stage::dst_margin`].
    fn dst_frames(&self, src: u64) -> u64 {
        src
    }

    /// Steady-state frames consumed to produce `dst` frames, rounded down.
    fn src_frames(&self, dst: u64) -> u64 {
        dst
    }

    /// Upper bound on the per-call overshoot of [`Stage::dst_frames`].
    fn dst_margin(&self) -> u64 {
        0
    }

    /// Convert up to `src_frames` frames into at most `dst_max` frames.
    /// Returns `(consumed, produced)`; either may be short of the request.
    fn transfer(
        &mut self,
        src: &[Area],
        src_offset: usize,
        src_frames: usize,
        dst: &[Area],
        dst_offset: usize,
        dst_max: usize,
    ) -> Result<(usize, usize)>;

    /// Discard any carried inter-call state.
    fn reset(&mut self) {}
}

/// A validated sequence of stages.
pub struct Chain {
    stages: Vec<Box<dyn Stage>>,
    // Ping-pong staging buffers for the inter-stage hops.
    work: [Vec<u8>; 2],
}

impl Chain {
    /// Build a chain, rejecting adjacent shape mismatches.
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Result<Self> {
        if stages.is_empty() {
            return Err(Error::InvalidArgument("conversion chain is empty"));
        }
        for pair in stages.windows(2) {
            if pair[0].dst_shape() != pair[1].src_shape() {
                return Err(Error::InvalidArgument(
                    "adjacent stage shapes do not match",
                ));
            }
        }
        Ok(Self {
            stages,
            work: [Vec::new(), Vec::new()],
        })
    }

    /// Shape consumed by the first stage.
    pub fn src_shape(&self) -> Shape {
        self.stages[0].src_shape()
    }

    /// Shape produced by the last stage.
    pub fn dst_shape(&self) -> Shape {
        self.stages.last().unwrap().dst_shape()
    }

    /// Steady-state output frames for `src` input frames.
    pub fn dst_frames(&self, src: u64) -> u64 {
        self.stages.iter().fold(src, |n, s| s.dst_frames(n))
    }

    /// Steady-state input frames needed for `dst` output frames.
    pub fn src_frames(&self, dst: u64) -> u64 {
        self.stages.iter().rev().fold(dst, |n, s| s.src_frames(n))
    }

    /// Worst-case overshoot of [`Chain::dst_frames`] in one conversion.
    pub fn dst_margin(&self) -> u64 {
        self.stages.iter().map(|s| s.dst_margin() + 1).sum()
    }

    /// Clear carried state in every stage.
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
    }

    /// Convert `frames` frames from `src` into `dst`, which must have room
    /// for `dst_frames(frames) + dst_margin()` frames. Returns the frames
    /// produced.
    pub fn convert(
        &mut self,
        src: &[Area],
        src_offset: usize,
        frames: usize,
        dst: &[Area],
        dst_offset: usize,
        dst_max: usize,
    ) -> Result<usize> {
        let last = self.stages.len() - 1;
        let mut in_offset = src_offset;
        let mut in_frames = frames;
        for (i, stage) in self.stages.iter_mut().enumerate() {
            let out_shape = stage.dst_shape();
            let in_shape = stage.src_shape();
            let capacity = if i == last {
                dst_max
            } else {
                (stage.dst_frames(in_frames as u64) + stage.dst_margin() + 1) as usize
            };
            // Staging buffers alternate so a stage never reads the buffer
            // it writes.
            let (head, tail) = self.work.split_at_mut(1);
            let (out_vec, in_vec) = if i % 2 == 0 {
                (&mut head[0], &tail[0])
            } else {
                (&mut tail[0], &head[0])
            };
            if i != last {
                let need = capacity * out_shape.frame_bytes();
                if out_vec.len() < need {
                    out_vec.resize(need, 0);
                }
            }
            let out_areas;
            let out: &[Area] = if i == last {
                dst
            } else {
                out_areas = Area::interleaved(out_vec, out_shape.channels, out_shape.format);
                &out_areas
            };
            let out_offset = if i == last { dst_offset } else { 0 };
            let in_areas;
            let input: &[Area] = if i == 0 {
                src
            } else {
                in_areas = const_areas(in_vec, in_shape);
                &in_areas
            };
            let mut consumed = 0;
            let mut produced = 0;
            while consumed < in_frames {
                let (c, p) = stage.transfer(
                    input,
                    in_offset + consumed,
                    in_frames - consumed,
                    out,
                    out_offset + produced,
                    capacity - produced,
                )?;
                if c == 0 && p == 0 {
                    return Err(Error::InvalidArgument("conversion stage stalled"));
                }
                consumed += c;
                produced += p;
            }
            in_offset = 0;
            in_frames = produced;
        }
        Ok(in_frames)
    }
}

/// Read-only interleaved areas over a staging buffer.
pub(crate) fn const_areas(buf: &[u8], shape: Shape) -> Vec<Area<'_>> {
    let width = shape.format.physical_width();
    (0..shape.channels)
        .map(|ch| unsafe {
            Area::from_raw(
                buf.as_ptr() as *mut u8,
                buf.len(),
                ch * width,
                shape.channels * width,
            )
        })
        .collect()
}
