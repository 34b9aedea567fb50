//! Sample format descriptions.
//!
//! A [`SampleFormat`] pins down how one sample is stored in memory: its
//! significant width, its storage width, signedness, endianness, and whether
//! it is a linear integer, a float, or a companded telephony code. Every
//! per-byte computation in the crate (area strides, silence fills, codec
//! stages) starts from this metadata.

use crate::{Error, Result};

/// Enumeration of the sample formats understood by the pipeline.
///
/// Linear integer formats exist in both signed/unsigned and both endiannesses.
/// The 24-bit formats use a 32-bit storage container with the sample in the
/// low 24 bits. `ImaAdpcm` is carried only for its 4-bit storage math (two
/// samples per byte); there is no ADPCM conversion stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum SampleFormat {
    S8,
    U8,
    S16Le,
    S16Be,
    U16Le,
    U16Be,
    S24Le,
    S24Be,
    U24Le,
    U24Be,
    S32Le,
    S32Be,
    U32Le,
    U32Be,
    F32Le,
    F32Be,
    F64Le,
    F64Be,
    MuLaw,
    ALaw,
    ImaAdpcm,
}

/// All formats, in mask-bit order.
pub const ALL_FORMATS: &[SampleFormat] = &[
    SampleFormat::S8,
    SampleFormat::U8,
    SampleFormat::S16Le,
    SampleFormat::S16Be,
    SampleFormat::U16Le,
    SampleFormat::U16Be,
    SampleFormat::S24Le,
    SampleFormat::S24Be,
    SampleFormat::U24Le,
    SampleFormat::U24Be,
    SampleFormat::S32Le,
    SampleFormat::S32Be,
    SampleFormat::U32Le,
    SampleFormat::U32Be,
    SampleFormat::F32Le,
    SampleFormat::F32Be,
    SampleFormat::F64Le,
    SampleFormat::F64Be,
    SampleFormat::MuLaw,
    SampleFormat::ALaw,
    SampleFormat::ImaAdpcm,
];

impl SampleFormat {
    /// Number of significant bits in one sample.
    pub fn width(self) -> usize {
        use SampleFormat::*;
        match self {
            S8 | U8 | MuLaw | ALaw => 8,
            S16Le | S16Be | U16Le | U16Be => 16,
            S24Le | S24Be | U24Le | U24Be => 24,
            S32Le | S32Be | U32Le | U32Be | F32Le | F32Be => 32,
            F64Le | F64Be => 64,
            ImaAdpcm => 4,
        }
    }

    /// Number of bits one sample occupies in storage. Differs from
    /// [`width`](Self::width) for the 24-in-32 formats.
    pub fn physical_width(self) -> usize {
        use SampleFormat::*;
        match self {
            S24Le | S24Be | U24Le | U24Be => 32,
            other => other.width(),
        }
    }

    /// Whether the format stores signed integer samples.
    pub fn is_signed(self) -> bool {
        use SampleFormat::*;
        matches!(
            self,
            S8 | S16Le | S16Be | S24Le | S24Be | S32Le | S32Be
        )
    }

    /// Whether multi-byte samples are stored little-endian. Single-byte
    /// formats report `true`.
    pub fn is_little_endian(self) -> bool {
        use SampleFormat::*;
        !matches!(
            self,
            S16Be | U16Be | S24Be | U24Be | S32Be | U32Be | F32Be | F64Be
        )
    }

    /// Whether the format is a linear integer encoding.
    pub fn is_linear(self) -> bool {
        use SampleFormat::*;
        !matches!(self, F32Le | F32Be | F64Le | F64Be | MuLaw | ALaw | ImaAdpcm)
    }

    /// Whether the format stores IEEE floats.
    pub fn is_float(self) -> bool {
        use SampleFormat::*;
        matches!(self, F32Le | F32Be | F64Le | F64Be)
    }

    /// Position of this format within [`ALL_FORMATS`], used as its mask bit.
    pub fn mask_bit(self) -> usize {
        ALL_FORMATS
            .iter()
            .position(|f| *f == self)
            .unwrap_or_default()
    }

    /// Look up the linear integer format with the given significant width,
    /// signedness and endianness.
    pub fn linear(width: usize, signed: bool, little_endian: bool) -> Result<Self> {
        use SampleFormat::*;
        let format = match (width, signed, little_endian) {
            (8, true, _) => S8,
            (8, false, _) => U8,
            (16, true, true) => S16Le,
            (16, true, false) => S16Be,
            (16, false, true) => U16Le,
            (16, false, false) => U16Be,
            (24, true, true) => S24Le,
            (24, true, false) => S24Be,
            (24, false, true) => U24Le,
            (24, false, false) => U24Be,
            (32, true, true) => S32Le,
            (32, true, false) => S32Be,
            (32, false, true) => U32Le,
            (32, false, false) => U32Be,
            _ => return Err(Error::InvalidArgument("no linear format with that width")),
        };
        Ok(format)
    }

    /// Byte pattern that represents silence for this format, to be tiled
    /// over sample storage. Unsigned formats silence at their bias midpoint,
    /// floats at 0.0, and the companded formats at their zero code words.
    pub fn silence_pattern(self) -> [u8; 8] {
        use SampleFormat::*;
        match self {
            U8 => [0x80; 8],
            U16Le => [0x00, 0x80, 0x00, 0x80, 0x00, 0x80, 0x00, 0x80],
            U16Be => [0x80, 0x00, 0x80, 0x00, 0x80, 0x00, 0x80, 0x00],
            U24Le => [0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x80, 0x00],
            U24Be => [0x00, 0x80, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00],
            U32Le => [0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x80],
            U32Be => [0x80, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00],
            MuLaw => [0x7f; 8],
            ALaw => [0xd5; 8],
            _ => [0x00; 8],
        }
    }

    /// Convert a frame count to bytes for the given channel count.
    ///
    /// Fails for sub-byte formats when the total does not land on a byte
    /// boundary.
    pub fn frames_to_bytes(self, frames: u64, channels: usize) -> Result<usize> {
        let bits = frames as usize * channels * self.physical_width();
        if bits % 8 != 0 {
            return Err(Error::InvalidArgument(
                "frame count not addressable in bytes for sub-byte format",
            ));
        }
        Ok(bits / 8)
    }

    /// Convert a byte count to whole frames for the given channel count.
    pub fn bytes_to_frames(self, bytes: usize, channels: usize) -> u64 {
        let frame_bits = channels * self.physical_width();
        if frame_bits == 0 {
            return 0;
        }
        (bytes * 8 / frame_bits) as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn widths_are_consistent() {
        for &format in ALL_FORMATS {
            assert!(format.width() <= format.physical_width(), "{format:?}");
            if format != SampleFormat::ImaAdpcm {
                assert_eq!(format.physical_width() % 8, 0, "{format:?}");
            }
        }
    }

    #[test]
    fn linear_lookup_round_trips() {
        for &format in ALL_FORMATS {
            if !format.is_linear() {
                continue;
            }
            let again = SampleFormat::linear(
                format.width(),
                format.is_signed(),
                format.is_little_endian(),
            )
            .unwrap();
            assert_eq!(format, again);
        }
        assert!(SampleFormat::linear(20, true, true).is_err());
    }

    #[test]
    fn silence_is_bias_midpoint_for_unsigned() {
        let pat = SampleFormat::U16Le.silence_pattern();
        let value = u16::from_le_bytes([pat[0], pat[1]]);
        assert_eq!(value, 0x8000);
        let pat = SampleFormat::U32Be.silence_pattern();
        let value = u32::from_be_bytes([pat[0], pat[1], pat[2], pat[3]]);
        assert_eq!(value, 0x8000_0000);
        assert_eq!(SampleFormat::S16Le.silence_pattern(), [0; 8]);
    }

    #[test]
    fn frame_byte_conversions() {
        let f = SampleFormat::S16Le;
        assert_eq!(f.frames_to_bytes(128, 2).unwrap(), 512);
        assert_eq!(f.bytes_to_frames(512, 2), 128);
        // Two 4-bit mono samples pack into one byte.
        let f = SampleFormat::ImaAdpcm;
        assert_eq!(f.frames_to_bytes(2, 1).unwrap(), 1);
        assert!(f.frames_to_bytes(1, 1).is_err());
    }
}
