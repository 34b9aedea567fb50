//! Linear-interpolation resampler over 16-bit samples.
//!
//! A 16-bit fixed-point phase accumulator drives the conversion; each
//! channel carries its last sample, phase, and (when reducing the rate) a
//! partial weighted sum across calls, so output is bit-identical no matter
//! how the input is chunked.

use crate::area::Area;
use crate::format::SampleFormat;
use crate::plugin::{Shape, Stage};
use crate::{Error, Result};

const DIV: u32 = 1 << 16;

fn muldiv_down(frames: u64, mul: u32, div: u32) -> u64 {
    ((frames as u128 * mul as u128) / div as u128) as u64
}

#[derive(Clone, Copy)]
struct ChannelState {
    sample: i16,
    sum: i32,
    pos: u32,
}

/// Rate conversion between two S16 shapes of the same channel count.
pub struct RateStage {
    src: Shape,
    dst: Shape,
    /// `dst_rate / src_rate` in 16-bit fixed point, rounded to nearest.
    pitch: u32,
    expand: bool,
    states: Vec<ChannelState>,
}

impl RateStage {
    pub fn new(src: Shape, dst: Shape) -> Result<Self> {
        if src.channels != dst.channels {
            return Err(Error::InvalidArgument(
                "rate stage cannot change channels",
            ));
        }
        if src.format != SampleFormat::S16Le || dst.format != SampleFormat::S16Le {
            return Err(Error::Unsupported("rate stage operates on s16"));
        }
        if src.rate == dst.rate || src.rate == 0 {
            return Err(Error::InvalidArgument("rate stage needs distinct rates"));
        }
        let pitch = ((dst.rate as u128 * DIV as u128 + src.rate as u128 / 2)
            / src.rate as u128) as u32;
        let mut stage = Self {
            src,
            dst,
            pitch,
            expand: dst.rate > src.rate,
            states: vec![
                ChannelState {
                    sample: 0,
                    sum: 0,
                    pos: 0,
                };
                src.channels
            ],
        };
        stage.reset();
        Ok(stage)
    }

    fn expand_channel(
        &self,
        state: &mut ChannelState,
        src: &Area,
        src_offset: usize,
        src_frames: usize,
        dst: &Area,
        dst_offset: usize,
        dst_max: usize,
    ) -> (usize, usize) {
        let pitch = self.pitch;
        let mut old_sample = state.sample;
        let mut pos = state.pos;
        let mut s = 0;
        let mut d = 0;
        while d < dst_max {
            let value = if pos >= pitch {
                if s == src_frames {
                    break;
                }
                pos -= pitch;
                let new_sample = i16::from_le(src.load(src_offset + s));
                s += 1;
                let value = (old_sample as i32 * (DIV - pos) as i32
                    + new_sample as i32 * pos as i32)
                    / DIV as i32;
                old_sample = new_sample;
                value as i16
            } else {
                old_sample
            };
            dst.store(dst_offset + d, value.to_le());
            d += 1;
            pos += DIV;
        }
        state.sample = old_sample;
        state.pos = pos;
        (s, d)
    }

    fn shrink_channel(
        &self,
        state: &mut ChannelState,
        src: &Area,
        src_offset: usize,
        src_frames: usize,
        dst: &Area,
        dst_offset: usize,
        dst_max: usize,
    ) -> (usize, usize) {
        let pitch = self.pitch;
        let mut sum = state.sum;
        let mut pos = state.pos;
        let mut s = 0;
        let mut d = 0;
        while s < src_frames {
            let sample = i16::from_le(src.load(src_offset + s)) as i32;
            s += 1;
            pos += pitch;
            if pos >= DIV {
                pos -= DIV;
                sum += sample * (pitch - pos) as i32;
                sum /= DIV as i32;
                dst.store(dst_offset + d, (sum as i16).to_le());
                d += 1;
                sum = sample * pos as i32;
                if d == dst_max {
                    break;
                }
            } else {
                sum += sample * pitch as i32;
            }
        }
        state.sum = sum;
        state.pos = pos;
        (s, d)
    }
}

impl Stage for RateStage {
    fn src_shape(&self) -> Shape {
        self.src
    }

    fn dst_shape(&self) -> Shape {
        self.dst
    }

    fn dst_frames(&self, src: u64) -> u64 {
        muldiv_down(src, self.pitch, DIV)
    }

    fn src_frames(&self, dst: u64) -> u64 {
        muldiv_down(dst, DIV, self.pitch)
    }

    fn dst_margin(&self) -> u64 {
        (self.pitch / DIV) as u64 + 2
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
        let mut states = std::mem::take(&mut self.states);
        let mut done = (0, 0);
        for (ch, state) in states.iter_mut().enumerate() {
            // Every channel follows the same phase sequence, so the counts
            // agree across channels.
            done = if self.expand {
                self.expand_channel(
                    state,
                    &src[ch],
                    src_offset,
                    src_frames,
                    &dst[ch],
                    dst_offset,
                    dst_max,
                )
            } else {
                self.shrink_channel(
                    state,
                    &src[ch],
                    src_offset,
                    src_frames,
                    &dst[ch],
                    dst_offset,
                    dst_max,
                )
            };
        }
        self.states = states;
        Ok(done)
    }

    fn reset(&mut self) {
        // The expand loop wants a sample in hand on entry.
        let pos = if self.expand { self.pitch + DIV } else { 0 };
        for state in &mut self.states {
            *state = ChannelState {
                sample: 0,
                sum: 0,
                pos,
            };
        }
    }
}
