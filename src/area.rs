//! Channel areas: strided views over sample memory.
//!
//! An [`Area`] describes where one channel's samples live inside a buffer,
//! as a base pointer plus a first-sample offset and an inter-sample step,
//! both in bits. Interleaved, planar, and arbitrarily strided layouts are
//! all expressed by the same three numbers. Offsets and steps stay in bits
//! because the 4-bit ADPCM format packs two samples per byte.
//!
//! Areas never own the memory they describe. The constructors borrow the
//! backing buffer so a view cannot outlive it; writes go through raw
//! pointers internally because distinct areas of one interleaved buffer
//! alias the same allocation, exactly like the mmap'd ring they stand for.

use std::marker::PhantomData;

use crate::format::SampleFormat;
use crate::{Error, Result};

/// A non-owning view of one channel's samples inside a buffer.
#[derive(Debug, Clone, Copy)]
pub struct Area<'a> {
    base: *mut u8,
    /// Addressable bytes from `base`.
    bytes: usize,
    /// Offset of sample 0 from `base`, in bits.
    first: usize,
    /// Distance between consecutive samples, in bits.
    step: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

// Areas are plain descriptors of a caller-managed region; the share backend
// moves them across its mixer thread together with the region they view.
unsafe impl Send for Area<'_> {}

impl<'a> Area<'a> {
    /// Build one view per channel over an interleaved buffer.
    pub fn interleaved(
        buf: &'a mut [u8],
        channels: usize,
        format: SampleFormat,
    ) -> Vec<Area<'a>> {
        let width = format.physical_width();
        let base = buf.as_mut_ptr();
        let bytes = buf.len();
        (0..channels)
            .map(|ch| Area {
                base,
                bytes,
                first: ch * width,
                step: channels * width,
                _marker: PhantomData,
            })
            .collect()
    }

    /// Build one view per channel over a planar buffer holding `frames`
    /// frames: each channel occupies its own contiguous region.
    pub fn planar(
        buf: &'a mut [u8],
        channels: usize,
        frames: usize,
        format: SampleFormat,
    ) -> Vec<Area<'a>> {
        let width = format.physical_width();
        let channel_bytes = frames * width / 8;
        let base = buf.as_mut_ptr();
        let bytes = buf.len();
        (0..channels)
            .map(|ch| Area {
                base: unsafe { base.add(ch * channel_bytes) },
                bytes: bytes.saturating_sub(ch * channel_bytes),
                first: 0,
                step: width,
                _marker: PhantomData,
            })
            .collect()
    }

    /// Single view over a contiguous mono region.
    pub fn contiguous(buf: &'a mut [u8], format: SampleFormat) -> Area<'a> {
        Area {
            base: buf.as_mut_ptr(),
            bytes: buf.len(),
            first: 0,
            step: format.physical_width(),
            _marker: PhantomData,
        }
    }

    /// Build a view from raw parts.
    ///
    /// # Safety
    /// `base` must stay valid for reads and writes of `bytes` bytes for the
    /// lifetime the caller chooses, and no `&`/`&mut` references to that
    /// region may be formed while samples are accessed through the area.
    pub unsafe fn from_raw(base: *mut u8, bytes: usize, first: usize, step: usize) -> Area<'a> {
        Area {
            base,
            bytes,
            first,
            step,
            _marker: PhantomData,
        }
    }

    /// First-sample offset, in bits.
    pub fn first_bits(&self) -> usize {
        self.first
    }

    /// Inter-sample step, in bits.
    pub fn step_bits(&self) -> usize {
        self.step
    }

    /// Whether samples of the given format sit back to back in this view.
    pub fn is_contiguous(&self, format: SampleFormat) -> bool {
        self.step == format.physical_width()
    }

    fn bit_offset(&self, offset: usize) -> usize {
        self.first + self.step * offset
    }

    fn check(&self, offset: usize, samples: usize, width: usize) -> Result<()> {
        if samples == 0 {
            return Ok(());
        }
        let last = self.bit_offset(offset + samples - 1) + width;
        if last > self.bytes * 8 {
            return Err(Error::InvalidArgument("area access out of bounds"));
        }
        Ok(())
    }

    /// Address of the sample at `offset`. The sample must be byte-aligned.
    pub(crate) fn addr(&self, offset: usize) -> *mut u8 {
        debug_assert_eq!(self.bit_offset(offset) % 8, 0);
        unsafe { self.base.add(self.bit_offset(offset) / 8) }
    }

    /// Load the sample at `offset` as a raw fixed-width value.
    pub(crate) fn load<T: RawSample>(&self, offset: usize) -> T {
        debug_assert!(self
            .check(offset, 1, std::mem::size_of::<T>() * 8)
            .is_ok());
        unsafe { (self.addr(offset) as *const T).read_unaligned() }
    }

    /// Store a raw fixed-width value at `offset`.
    ///
    /// Takes `&self` deliberately: areas are raw views and several of them
    /// alias one buffer, so exclusive borrows cannot express per-channel
    /// mutation.
    pub(crate) fn store<T: RawSample>(&self, offset: usize, value: T) {
        debug_assert!(self
            .check(offset, 1, std::mem::size_of::<T>() * 8)
            .is_ok());
        unsafe { (self.addr(offset) as *mut T).write_unaligned(value) }
    }

    fn load_nibble(&self, offset: usize) -> u8 {
        let bit = self.bit_offset(offset);
        let byte = unsafe { self.base.add(bit / 8).read() };
        if bit % 8 == 0 {
            byte & 0x0f
        } else {
            byte >> 4
        }
    }

    fn store_nibble(&self, offset: usize, value: u8) {
        let bit = self.bit_offset(offset);
        let ptr = unsafe { self.base.add(bit / 8) };
        let old = unsafe { ptr.read() };
        let new = if bit % 8 == 0 {
            (old & 0xf0) | (value & 0x0f)
        } else {
            (old & 0x0f) | (value << 4)
        };
        unsafe { ptr.write(new) };
    }
}

/// Marker for plain fixed-width sample containers loadable from raw memory.
pub(crate) trait RawSample: Copy {}

#[duplicate::duplicate_item(
    ty;
    [u8];
    [i8];
    [u16];
    [i16];
    [u32];
    [i32];
    [u64];
    [f32];
    [f64];
)]
impl RawSample for ty {}

/// Copy `samples` samples of `format` from `src` (starting `src_offset`
/// samples in) to `dst` (starting `dst_offset` samples in), byte-exact.
///
/// Degenerates to a flat copy when both views are contiguous; otherwise
/// walks sample by sample. 4-bit formats take the nibble path.
pub fn copy_area(
    dst: &Area,
    dst_offset: usize,
    src: &Area,
    src_offset: usize,
    samples: usize,
    format: SampleFormat,
) -> Result<()> {
    let width = format.physical_width();
    if width == 4 {
        src.check(src_offset, samples, width)?;
        dst.check(dst_offset, samples, width)?;
        for i in 0..samples {
            dst.store_nibble(dst_offset + i, src.load_nibble(src_offset + i));
        }
        return Ok(());
    }
    let bytes = width / 8;
    src.check(src_offset, samples, width)?;
    dst.check(dst_offset, samples, width)?;
    if src.is_contiguous(format) && dst.is_contiguous(format) {
        unsafe {
            std::ptr::copy(
                src.addr(src_offset),
                dst.addr(dst_offset),
                samples * bytes,
            );
        }
        return Ok(());
    }
    for i in 0..samples {
        let from = src.addr(src_offset + i);
        let to = dst.addr(dst_offset + i);
        unsafe { std::ptr::copy_nonoverlapping(from, to, bytes) };
    }
    Ok(())
}

/// Write `samples` samples of the format's silence pattern into `dst`.
pub fn silence_area(
    dst: &Area,
    offset: usize,
    samples: usize,
    format: SampleFormat,
) -> Result<()> {
    let width = format.physical_width();
    let pattern = format.silence_pattern();
    dst.check(offset, samples, width)?;
    if width == 4 {
        for i in 0..samples {
            dst.store_nibble(offset + i, pattern[0] & 0x0f);
        }
        return Ok(());
    }
    let bytes = width / 8;
    for i in 0..samples {
        let to = dst.addr(offset + i);
        unsafe { std::ptr::copy_nonoverlapping(pattern.as_ptr(), to, bytes) };
    }
    Ok(())
}

/// Whether a set of per-channel areas is one interleaved run that can be
/// copied as a single flat region.
fn collapsible(areas: &[Area], offset_alignment_format: SampleFormat) -> bool {
    let width = offset_alignment_format.physical_width();
    if width % 8 != 0 || areas.is_empty() {
        return false;
    }
    let step = areas.len() * width;
    areas.iter().enumerate().all(|(ch, area)| {
        area.step == step && area.base == areas[0].base && area.first == areas[0].first + ch * width
    })
}

/// Multi-channel [`copy_area`]: copies `frames` frames across all channels.
///
/// When both sides are plain interleaved buffers the channels collapse into
/// one wide contiguous run and a single flat copy happens instead of a
/// per-channel strided walk. The output is identical either way.
pub fn copy_areas(
    dst: &[Area],
    dst_offset: usize,
    src: &[Area],
    src_offset: usize,
    frames: usize,
    format: SampleFormat,
) -> Result<()> {
    if dst.len() != src.len() {
        return Err(Error::InvalidArgument("channel count mismatch in area copy"));
    }
    if collapsible(dst, format) && collapsible(src, format) {
        let channels = dst.len();
        // One wide run: `frames * channels` samples starting at frame 0 of
        // channel 0, with a contiguous step.
        let wide_src = Area {
            base: src[0].base,
            bytes: src[0].bytes,
            first: src[0].first,
            step: format.physical_width(),
            _marker: PhantomData,
        };
        let wide_dst = Area {
            base: dst[0].base,
            bytes: dst[0].bytes,
            first: dst[0].first,
            step: format.physical_width(),
            _marker: PhantomData,
        };
        return copy_area(
            &wide_dst,
            dst_offset * channels,
            &wide_src,
            src_offset * channels,
            frames * channels,
            format,
        );
    }
    for (d, s) in dst.iter().zip(src) {
        copy_area(d, dst_offset, s, src_offset, frames, format)?;
    }
    Ok(())
}

/// Multi-channel [`silence_area`].
pub fn silence_areas(
    dst: &[Area],
    offset: usize,
    frames: usize,
    format: SampleFormat,
) -> Result<()> {
    if collapsible(dst, format) {
        let channels = dst.len();
        let wide = Area {
            base: dst[0].base,
            bytes: dst[0].bytes,
            first: dst[0].first,
            step: format.physical_width(),
            _marker: PhantomData,
        };
        return silence_area(&wide, offset * channels, frames * channels, format);
    }
    for d in dst {
        silence_area(d, offset, frames, format)?;
    }
    Ok(())
}
