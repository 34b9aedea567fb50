//! Linear-format conversion: width, signedness and endianness changes
//! through a sign-corrected, left-justified 32-bit intermediate. Float
//! formats ride the same intermediate with a fixed scale.

use crate::area::Area;
use crate::format::SampleFormat;
use crate::plugin::{Shape, Stage};
use crate::{Error, Result};

const FLOAT_SCALE: f64 = 2_147_483_648.0;

/// Decode one sample to a left-justified signed 32-bit value.
pub(crate) fn load_s32(area: &Area, idx: usize, format: SampleFormat) -> i32 {
    use SampleFormat::*;
    match format {
        S8 => (area.load::<i8>(idx) as i32) << 24,
        U8 => ((area.load::<u8>(idx) ^ 0x80) as i8 as i32) << 24,
        S16Le => (i16::from_le(area.load(idx)) as i32) << 16,
        S16Be => (i16::from_be(area.load(idx)) as i32) << 16,
        U16Le => ((u16::from_le(area.load(idx)) ^ 0x8000) as i16 as i32) << 16,
        U16Be => ((u16::from_be(area.load(idx)) ^ 0x8000) as i16 as i32) << 16,
        // 24-bit values sit LSB-justified in a 32-bit container; shifting
        // them up by 8 puts the sign bit in place.
        S24Le => (u32::from_le(area.load(idx)) << 8) as i32,
        S24Be => (u32::from_be(area.load(idx)) << 8) as i32,
        U24Le => ((u32::from_le(area.load::<u32>(idx)) ^ 0x80_0000) << 8) as i32,
        U24Be => ((u32::from_be(area.load::<u32>(idx)) ^ 0x80_0000) << 8) as i32,
        S32Le => u32::from_le(area.load(idx)) as i32,
        S32Be => u32::from_be(area.load(idx)) as i32,
        U32Le => (u32::from_le(area.load::<u32>(idx)) ^ 0x8000_0000) as i32,
        U32Be => (u32::from_be(area.load::<u32>(idx)) ^ 0x8000_0000) as i32,
        F32Le => clamp_float(f32::from_bits(u32::from_le(area.load(idx))) as f64),
        F32Be => clamp_float(f32::from_bits(u32::from_be(area.load(idx))) as f64),
        F64Le => clamp_float(f64::from_bits(u64::from_le(area.load(idx)))),
        F64Be => clamp_float(f64::from_bits(u64::from_be(area.load(idx)))),
        MuLaw | ALaw | ImaAdpcm => unreachable!("not a linear format"),
    }
}

/// Encode a left-justified signed 32-bit value into the format's storage.
pub(crate) fn store_s32(area: &Area, idx: usize, format: SampleFormat, value: i32) {
    use SampleFormat::*;
    match format {
        S8 => area.store(idx, (value >> 24) as i8),
        U8 => area.store(idx, ((value >> 24) as u8) ^ 0x80),
        S16Le => area.store(idx, ((value >> 16) as i16).to_le()),
        S16Be => area.store(idx, ((value >> 16) as i16).to_be()),
        U16Le => area.store(idx, (((value >> 16) as u16) ^ 0x8000).to_le()),
        U16Be => area.store(idx, (((value >> 16) as u16) ^ 0x8000).to_be()),
        S24Le => area.store(idx, (((value >> 8) as u32) & 0x00ff_ffff).to_le()),
        S24Be => area.store(idx, (((value >> 8) as u32) & 0x00ff_ffff).to_be()),
        U24Le => area.store(idx, ((((value >> 8) as u32) ^ 0x80_0000) & 0x00ff_ffff).to_le()),
        U24Be => area.store(idx, ((((value >> 8) as u32) ^ 0x80_0000) & 0x00ff_ffff).to_be()),
        S32Le => area.store(idx, (value as u32).to_le()),
        S32Be => area.store(idx, (value as u32).to_be()),
        U32Le => area.store(idx, ((value as u32) ^ 0x8000_0000).to_le()),
        U32Be => area.store(idx, ((value as u32) ^ 0x8000_0000).to_be()),
        F32Le => area.store(idx, ((value as f64 / FLOAT_SCALE) as f32).to_bits().to_le()),
        F32Be => area.store(idx, ((value as f64 / FLOAT_SCALE) as f32).to_bits().to_be()),
        F64Le => area.store(idx, (value as f64 / FLOAT_SCALE).to_bits().to_le()),
        F64Be => area.store(idx, (value as f64 / FLOAT_SCALE).to_bits().to_be()),
        MuLaw | ALaw | ImaAdpcm => unreachable!("not a linear format"),
    }
}

fn clamp_float(value: f64) -> i32 {
    let scaled = value * FLOAT_SCALE;
    if scaled >= i32::MAX as f64 {
        i32::MAX
    } else if scaled <= i32::MIN as f64 {
        i32::MIN
    } else {
        scaled as i32
    }
}

/// Load a sample of any linear format as a 16-bit value.
pub(crate) fn load_s16(area: &Area, idx: usize, format: SampleFormat) -> i16 {
    (load_s32(area, idx, format) >> 16) as i16
}

/// Store a 16-bit value into any linear format.
pub(crate) fn store_s16(area: &Area, idx: usize, format: SampleFormat, value: i16) {
    store_s32(area, idx, format, (value as i32) << 16)
}

/// Per-sample conversion between two linear (or float) formats.
pub struct LinearStage {
    src: Shape,
    dst: Shape,
}

impl LinearStage {
    /// Both shapes must agree on channels and rate and carry linear or
    /// float formats.
    pub fn new(src: Shape, dst: Shape) -> Result<Self> {
        if src.channels != dst.channels || src.rate != dst.rate {
            return Err(Error::InvalidArgument(
                "format stage cannot change channels or rate",
            ));
        }
        for format in [src.format, dst.format] {
            if !format.is_linear() && !format.is_float() {
                return Err(Error::Unsupported("non-linear format in linear stage"));
            }
        }
        Ok(Self { src, dst })
    }
}

impl Stage for LinearStage {
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
        for (s, d) in src.iter().zip(dst) {
            for i in 0..frames {
                let value = load_s32(s, src_offset + i, self.src.format);
                store_s32(d, dst_offset + i, self.dst.format, value);
            }
        }
        Ok((frames, frames))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::SampleFormat::*;

    fn one_sample(format: SampleFormat, bytes: &[u8]) -> i32 {
        let mut buf = bytes.to_vec();
        let area = Area::contiguous(&mut buf, format);
        load_s32(&area, 0, format)
    }

    fn round_trip(format: SampleFormat, value: i32) -> i32 {
        let mut buf = vec![0u8; 8];
        let area = Area::contiguous(&mut buf, format);
        store_s32(&area, 0, format, value);
        load_s32(&area, 0, format)
    }

    #[test]
    fn sign_and_endian_decoding() {
        assert_eq!(one_sample(S8, &[0x80]), i32::MIN);
        assert_eq!(one_sample(U8, &[0x00]), i32::MIN);
        assert_eq!(one_sample(U8, &[0x80]), 0);
        assert_eq!(one_sample(S16Le, &[0x34, 0x12]), 0x1234 << 16);
        assert_eq!(one_sample(S16Be, &[0x12, 0x34]), 0x1234 << 16);
        assert_eq!(one_sample(U16Le, &[0x00, 0x80]), 0);
        assert_eq!(one_sample(S24Le, &[0x00, 0x00, 0x80, 0x00]), i32::MIN);
        assert_eq!(one_sample(S32Be, &[0x7f, 0xff, 0xff, 0xff]), i32::MAX);
    }

    #[test]
    fn lossless_pairs_round_trip() {
        for format in [S8, U8, S16Le, S16Be, U16Le, U16Be] {
            let width = format.width();
            for value in [i32::MIN, -(1 << 24), 0, 1 << 24, i32::MAX & !0xff_ffff] {
                let back = round_trip(format, value);
                // Truncation only below the format's width.
                let mask = !0i32 << (32 - width);
                assert_eq!(back, value & mask, "{format:?} {value}");
            }
        }
    }

    #[test]
    fn float_encoding_is_invertible_at_full_scale() {
        assert_eq!(round_trip(F32Le, i32::MIN), i32::MIN);
        assert_eq!(round_trip(F64Le, 1 << 16), 1 << 16);
        let back = round_trip(F32Be, 0x1234_5600);
        assert!((back - 0x1234_5600).abs() <= 0x100);
    }

    #[test]
    fn stage_converts_interleaved_frames() {
        let src_shape = Shape {
            format: U8,
            channels: 2,
            rate: 8_000,
        };
        let dst_shape = Shape {
            format: S16Le,
            channels: 2,
            rate: 8_000,
        };
        let mut stage = LinearStage::new(src_shape, dst_shape).unwrap();
        let mut src = [0x80u8, 0x00, 0xff, 0x81];
        let mut dst = [0u8; 8];
        let sa = Area::interleaved(&mut src, 2, U8);
        let da = Area::interleaved(&mut dst, 2, S16Le);
        assert_eq!(stage.transfer(&sa, 0, 2, &da, 0, 2).unwrap(), (2, 2));
        let out: Vec<i16> = dst
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(out, [0, -32768, 32512, 256]);
    }
}
