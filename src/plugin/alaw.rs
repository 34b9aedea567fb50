//! G.711 A-law companding. Same segment scheme as mu-law but with no
//! bias, a smaller first segment, and alternate-bit inversion (0x55) on
//! the wire.

use crate::area::Area;
use crate::plugin::linear::{load_s16, store_s16};
use crate::plugin::{Shape, Stage};
use crate::{Error, Result};

fn val_seg(val: i32) -> i32 {
    let mut val = val >> 8;
    let mut r = 1;
    if val & 0xf0 != 0 {
        val >>= 4;
        r += 4;
    }
    if val & 0x0c != 0 {
        val >>= 2;
        r += 2;
    }
    if val & 0x02 != 0 {
        r += 1;
    }
    r
}

/// Linear 16-bit to A-law.
pub fn s16_to_alaw(pcm_val: i16) -> u8 {
    let mut val = pcm_val as i32;
    let mask = if val >= 0 {
        0xd5
    } else {
        val = -val;
        if val > 0x7fff {
            val = 0x7fff;
        }
        0x55
    };
    let aval = if val < 256 {
        (val >> 4) as u8
    } else {
        let seg = val_seg(val);
        ((seg << 4) | ((val >> (seg + 3)) & 0x0f)) as u8
    };
    aval ^ mask
}

/// A-law to linear 16-bit.
pub fn alaw_to_s16(a_val: u8) -> i16 {
    let a_val = (a_val ^ 0x55) as i32;
    let mut t = a_val & 0x7f;
    if t < 16 {
        t = (t << 4) + 8;
    } else {
        let seg = (t >> 4) & 0x07;
        t = ((t & 0x0f) << 4) + 0x108;
        t <<= seg - 1;
    }
    (if a_val & 0x80 != 0 { t } else { -t }) as i16
}

/// Conversion stage between A-law and any linear format.
pub struct AlawStage {
    src: Shape,
    dst: Shape,
    encode: bool,
}

impl AlawStage {
    /// Exactly one side must be A-law; the other linear. Channels and
    /// rate must agree.
    pub fn new(src: Shape, dst: Shape) -> Result<Self> {
        if src.channels != dst.channels || src.rate != dst.rate {
            return Err(Error::InvalidArgument(
                "codec stage cannot change channels or rate",
            ));
        }
        use crate::format::SampleFormat::ALaw;
        let encode = match (src.format == ALaw, dst.format == ALaw) {
            (false, true) if src.format.is_linear() => true,
            (true, false) if dst.format.is_linear() => false,
            _ => return Err(Error::Unsupported("a-law stage needs one linear side")),
        };
        Ok(Self { src, dst, encode })
    }
}

impl Stage for AlawStage {
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
                if self.encode {
                    let sample = load_s16(s, src_offset + i, self.src.format);
                    d.store(dst_offset + i, s16_to_alaw(sample));
                } else {
                    let sample = alaw_to_s16(s.load(src_offset + i));
                    store_s16(d, dst_offset + i, self.dst.format, sample);
                }
            }
        }
        Ok((frames, frames))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_code_words() {
        // The quiet codes around zero.
        assert_eq!(s16_to_alaw(0), 0xd5);
        assert_eq!(alaw_to_s16(0xd5), 8);
        assert_eq!(alaw_to_s16(0x55), -8);
        // Full scale.
        assert_eq!(s16_to_alaw(i16::MAX), 0xaa);
        assert_eq!(s16_to_alaw(i16::MIN), 0x2a);
        assert_eq!(alaw_to_s16(0xaa), 32256);
    }

    #[test]
    fn every_code_word_survives_a_round_trip() {
        for code in 0..=0xffu8 {
            let linear = alaw_to_s16(code);
            assert_eq!(s16_to_alaw(linear), code, "code {code:#04x}");
        }
    }
}
