//! Channel routing: an N×M fixed-point gain matrix over S16 frames, used
//! for channel-count conversion and volume/balance.
//!
//! Gains are expressed in 1/16 steps; 16 is unity. Each output channel is
//! the weighted sum of its inputs, divided back and saturated, so a merge
//! built from equal gains is an unbiased average.

use crate::area::Area;
use crate::format::SampleFormat;
use crate::plugin::{Shape, Stage};
use crate::{Error, Result};

/// Gain resolution: 1/16 steps, 16 is unity.
pub const RESOLUTION: u32 = 16;

/// Matrix routing stage over S16 frames.
pub struct RouteStage {
    src: Shape,
    dst: Shape,
    /// `ttable[dst_channel][src_channel]` in 1/16 steps.
    ttable: Vec<Vec<u32>>,
    identity: bool,
}

impl RouteStage {
    /// Route with an explicit gain matrix: one row per destination
    /// channel, one gain per source channel.
    pub fn with_table(src: Shape, dst: Shape, ttable: Vec<Vec<u32>>) -> Result<Self> {
        if src.rate != dst.rate {
            return Err(Error::InvalidArgument("route stage cannot change rate"));
        }
        if src.format != SampleFormat::S16Le || dst.format != SampleFormat::S16Le {
            return Err(Error::Unsupported("route stage operates on s16"));
        }
        if ttable.len() != dst.channels || ttable.iter().any(|row| row.len() != src.channels) {
            return Err(Error::InvalidArgument("route table shape mismatch"));
        }
        let identity = src.channels == dst.channels
            && ttable.iter().enumerate().all(|(d, row)| {
                row.iter()
                    .enumerate()
                    .all(|(s, &g)| g == if s == d { RESOLUTION } else { 0 })
            });
        Ok(Self {
            src,
            dst,
            ttable,
            identity,
        })
    }

    /// The default conversion table: duplicate a mono source, average down
    /// to mono, otherwise map channels pairwise and wrap the remainder.
    pub fn new(src: Shape, dst: Shape) -> Result<Self> {
        let ttable = default_table(src.channels, dst.channels);
        Self::with_table(src, dst, ttable)
    }
}

fn default_table(src_channels: usize, dst_channels: usize) -> Vec<Vec<u32>> {
    (0..dst_channels)
        .map(|d| {
            let mut row = vec![0; src_channels];
            if src_channels == 1 {
                row[0] = RESOLUTION;
            } else if dst_channels == 1 {
                // Unbiased merge: equal weight per source.
                let gain = RESOLUTION / src_channels as u32;
                for g in &mut row {
                    *g = gain.max(1);
                }
            } else {
                row[d % src_channels] = RESOLUTION;
            }
            row
        })
        .collect()
}

impl Stage for RouteStage {
    fn src_shape(&self) -> Shape {
        self.src
    }

    fn dst_shape(&self) -> Shape {
        self.dst
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
        if self.identity {
            crate::area::copy_areas(
                dst,
                dst_offset,
                src,
                src_offset,
                frames,
                SampleFormat::S16Le,
            )?;
            return Ok((frames, frames));
        }
        for (row, d) in self.ttable.iter().zip(dst) {
            // Zero row: the output channel is silent.
            if row.iter().all(|&g| g == 0) {
                crate::area::silence_area(d, dst_offset, frames, SampleFormat::S16Le)?;
                continue;
            }
            // Single unity source: plain copy.
            if let Some(lone) = single_unity(row) {
                crate::area::copy_area(
                    d,
                    dst_offset,
                    &src[lone],
                    src_offset,
                    frames,
                    SampleFormat::S16Le,
                )?;
                continue;
            }
            for i in 0..frames {
                let mut acc: i32 = 0;
                for (s, &gain) in src.iter().zip(row) {
                    if gain == 0 {
                        continue;
                    }
                    let sample = i16::from_le(s.load::<i16>(src_offset + i)) as i32;
                    acc += sample * gain as i32;
                }
                let value = (acc / RESOLUTION as i32).clamp(i16::MIN as i32, i16::MAX as i32);
                d.store(dst_offset + i, (value as i16).to_le());
            }
        }
        Ok((frames, frames))
    }
}

fn single_unity(row: &[u32]) -> Option<usize> {
    let mut lone = None;
    for (i, &g) in row.iter().enumerate() {
        match g {
            0 => {}
            RESOLUTION if lone.is_none() => lone = Some(i),
            _ => return None,
        }
    }
    lone
}
