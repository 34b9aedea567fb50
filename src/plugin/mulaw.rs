//! G.711 mu-law companding.
//!
//! The encoder biases the linear magnitude by 33, locates the segment from
//! the leading one bit, and complements the code word for transmission;
//! the decoder inverts that exactly. See Bellamy, Digital Telephony,
//! pp. 98-111.

use crate::area::Area;
use crate::plugin::linear::{load_s16, store_s16};
use crate::plugin::{Shape, Stage};
use crate::{Error, Result};

const BIAS: i32 = 0x84;

fn val_seg(val: i32) -> i32 {
    let mut val = val >> 7;
    let mut r = 0;
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

/// Linear 16-bit to mu-law.
pub fn s16_to_ulaw(pcm_val: i16) -> u8 {
    let mut val = pcm_val as i32;
    let mask = if val < 0 {
        val = BIAS - val;
        0x7f
    } else {
        val += BIAS;
        0xff
    };
    if val > 0x7fff {
        val = 0x7fff;
    }
    let seg = val_seg(val);
    let uval = ((seg << 4) | ((val >> (seg + 3)) & 0x0f)) as u8;
    uval ^ mask
}

/// Mu-law to linear 16-bit. Expects the complemented (wire) code word.
pub fn ulaw_to_s16(u_val: u8) -> i16 {
    let u_val = !u_val as i32;
    let mut t = ((u_val & 0x0f) << 3) + BIAS;
    t <<= (u_val & 0x70) >> 4;
    (if u_val & 0x80 != 0 { BIAS - t } else { t - BIAS }) as i16
}

/// Conversion stage between mu-law and any linear format.
pub struct MulawStage {
    src: Shape,
    dst: Shape,
    encode: bool,
}

impl MulawStage {
    /// Exactly one side must be mu-law; the other linear. Channels and
    /// rate must agree.
    pub fn new(src: Shape, dst: Shape) -> Result<Self> {
        if src.channels != dst.channels || src.rate != dst.rate {
            return Err(Error::InvalidArgument(
                "codec stage cannot change channels or rate",
            ));
        }
        use crate::format::SampleFormat::MuLaw;
        let encode = match (src.format == MuLaw, dst.format == MuLaw) {
            (false, true) if src.format.is_linear() => true,
            (true, false) if dst.format.is_linear() => false,
            _ => return Err(Error::Unsupported("mu-law stage needs one linear side")),
        };
        Ok(Self { src, dst, encode })
    }
}

impl Stage for MulawStage {
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
                    d.store(dst_offset + i, s16_to_ulaw(sample));
                } else {
                    let sample = ulaw_to_s16(s.load(src_offset + i));
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
        // Positive and negative zero both decode to silence.
        assert_eq!(ulaw_to_s16(0xff), 0);
        assert_eq!(s16_to_ulaw(0), 0xff);
        // Full-scale values land in the top segment.
        assert_eq!(s16_to_ulaw(i16::MAX), 0x80);
        assert_eq!(s16_to_ulaw(i16::MIN), 0x00);
        assert_eq!(ulaw_to_s16(0x80), 0x7d7c);
    }

    #[test]
    fn every_code_word_survives_a_round_trip() {
        for code in 0..=0xffu8 {
            let linear = ulaw_to_s16(code);
            let back = s16_to_ulaw(linear);
            // 0x7f and 0xff both mean zero; everything else is exact.
            if code == 0x7f {
                assert_eq!(back, 0xff);
            } else {
                assert_eq!(back, code, "code {code:#04x}");
            }
        }
    }

    #[test]
    fn quantization_error_stays_within_the_segment_step() {
        let mut x: u32 = 0x2464_2a15;
        for _ in 0..2000 {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            let sample = x as u16 as i16;
            let decoded = ulaw_to_s16(s16_to_ulaw(sample)) as i32;
            let sample = sample as i32;
            let mag = sample.unsigned_abs().min(0x7fff) as i32;
            // Segment k quantizes in steps of 2^(k+3).
            let seg = if mag + 0x84 > 0x7fff {
                7
            } else {
                super::val_seg(mag + 0x84)
            };
            let step = 1 << (seg + 3);
            assert!(
                (decoded - sample).abs() <= step,
                "sample {sample} decoded {decoded} step {step}"
            );
        }
    }
}
