//! Hardware and software parameter negotiation.
//!
//! Hardware parameters are negotiated through a configuration space: one
//! [`Interval`] per numeric axis and one mask per discrete axis. Refinement
//! only ever shrinks the space; when an interval or mask comes out empty the
//! negotiation fails, and when every axis has collapsed to a single value
//! the space turns into a concrete [`HwConfig`].

use bitflags::bitflags;

use crate::format::SampleFormat;
use crate::mask::FormatMask;
use crate::ring::boundary_for;
use crate::{Error, Result};

/// A min/max range with open/closed ends over `u64` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// Inclusive (or exclusive when `openmin`) lower end.
    pub min: u64,
    /// Inclusive (or exclusive when `openmax`) upper end.
    pub max: u64,
    /// Lower end excluded.
    pub openmin: bool,
    /// Upper end excluded.
    pub openmax: bool,
    /// No value can satisfy this interval.
    pub empty: bool,
}

impl Default for Interval {
    fn default() -> Self {
        Self::any()
    }
}

impl Interval {
    /// Unconstrained interval.
    pub fn any() -> Self {
        Self {
            min: 0,
            max: u64::MAX,
            openmin: false,
            openmax: false,
            empty: false,
        }
    }

    /// Interval holding exactly one value.
    pub fn value(v: u64) -> Self {
        Self {
            min: v,
            max: v,
            openmin: false,
            openmax: false,
            empty: false,
        }
    }

    /// Closed range `[min, max]`.
    pub fn range(min: u64, max: u64) -> Self {
        Self {
            min,
            max,
            openmin: false,
            openmax: false,
            empty: min > max,
        }
    }

    fn check_empty(&mut self) {
        if self.min > self.max || (self.min == self.max && (self.openmin || self.openmax)) {
            self.empty = true;
        }
    }

    /// Whether the interval has collapsed to a single value.
    pub fn single(&self) -> Option<u64> {
        (!self.empty && self.min == self.max && !self.openmin && !self.openmax)
            .then_some(self.min)
    }

    /// Smallest admissible value.
    pub fn lowest(&self) -> u64 {
        if self.openmin {
            self.min + 1
        } else {
            self.min
        }
    }

    /// Largest admissible value.
    pub fn highest(&self) -> u64 {
        if self.openmax {
            self.max - 1
        } else {
            self.max
        }
    }

    /// Raise the lower end. Returns whether the interval changed.
    pub fn refine_min(&mut self, min: u64, open: bool) -> Result<bool> {
        if self.empty {
            return Err(Error::Negotiation("interval already empty"));
        }
        let mut changed = false;
        if self.min < min {
            self.min = min;
            self.openmin = open;
            changed = true;
        } else if self.min == min && open && !self.openmin {
            self.openmin = true;
            changed = true;
        }
        self.check_empty();
        if self.empty {
            return Err(Error::Negotiation("interval refined to empty"));
        }
        Ok(changed)
    }

    /// Lower the upper end. Returns whether the interval changed.
    pub fn refine_max(&mut self, max: u64, open: bool) -> Result<bool> {
        if self.empty {
            return Err(Error::Negotiation("interval already empty"));
        }
        let mut changed = false;
        if self.max > max {
            self.max = max;
            self.openmax = open;
            changed = true;
        } else if self.max == max && open && !self.openmax {
            self.openmax = true;
            changed = true;
        }
        self.check_empty();
        if self.empty {
            return Err(Error::Negotiation("interval refined to empty"));
        }
        Ok(changed)
    }

    /// Intersect with another interval.
    pub fn refine(&mut self, other: &Interval) -> Result<bool> {
        if other.empty {
            return Err(Error::Negotiation("refining against empty interval"));
        }
        let a = self.refine_min(other.min, other.openmin)?;
        let b = self.refine_max(other.max, other.openmax)?;
        Ok(a || b)
    }

    /// Collapse to the smallest admissible value.
    pub fn set_first(&mut self) -> Result<u64> {
        if self.empty {
            return Err(Error::Negotiation("interval already empty"));
        }
        let v = self.lowest();
        *self = Self::value(v);
        Ok(v)
    }

    /// Collapse to the largest admissible value.
    pub fn set_last(&mut self) -> Result<u64> {
        if self.empty {
            return Err(Error::Negotiation("interval already empty"));
        }
        let v = self.highest();
        *self = Self::value(v);
        Ok(v)
    }

    /// Collapse to the admissible value nearest `target`.
    pub fn set_near(&mut self, target: u64) -> Result<u64> {
        if self.empty {
            return Err(Error::Negotiation("interval already empty"));
        }
        let v = target.clamp(self.lowest(), self.highest());
        *self = Self::value(v);
        Ok(v)
    }

    /// Interval product, saturating. Open flags carry through from either
    /// operand.
    pub fn mul(&self, other: &Interval) -> Interval {
        let mut out = Interval {
            min: self.min.saturating_mul(other.min),
            max: self.max.saturating_mul(other.max),
            openmin: self.openmin || other.openmin,
            openmax: self.openmax || other.openmax,
            empty: self.empty || other.empty,
        };
        out.check_empty();
        out
    }

    /// Interval quotient `self / other`, widened to whole values.
    pub fn div(&self, other: &Interval) -> Interval {
        let divisor_hi = other.max.max(1);
        let divisor_lo = other.min.max(1);
        let mut out = Interval {
            min: self.min / divisor_hi,
            max: if other.min == 0 {
                u64::MAX
            } else {
                // Round up so the quotient range stays a superset.
                self.max.saturating_add(divisor_lo - 1) / divisor_lo
            },
            openmin: false,
            openmax: false,
            empty: self.empty || other.empty,
        };
        out.check_empty();
        out
    }

    /// `self * numerator / denominator`, widened to whole values.
    pub fn muldiv(&self, numerator: u64, denominator: u64) -> Interval {
        let denominator = denominator.max(1);
        let mut out = Interval {
            min: (self.min as u128 * numerator as u128 / denominator as u128)
                .min(u64::MAX as u128) as u64,
            max: ((self.max as u128 * numerator as u128 + denominator as u128 - 1)
                / denominator as u128)
                .min(u64::MAX as u128) as u64,
            openmin: false,
            openmax: false,
            empty: self.empty,
        };
        out.check_empty();
        out
    }
}

bitflags! {
    /// Memory-access styles a stream can be opened with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMask: u8 {
        /// `read`/`write` calls with interleaved frames.
        const RW_INTERLEAVED = 1 << 0;
        /// `read`/`write` calls with one buffer per channel.
        const RW_NONINTERLEAVED = 1 << 1;
        /// Direct area access, interleaved layout.
        const MMAP_INTERLEAVED = 1 << 2;
        /// Direct area access, one region per channel.
        const MMAP_NONINTERLEAVED = 1 << 3;
    }
}

/// One concrete access style, picked out of an [`AccessMask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// `read`/`write` calls with interleaved frames.
    RwInterleaved,
    /// `read`/`write` calls with one buffer per channel.
    RwNonInterleaved,
    /// Direct area access, interleaved layout.
    MmapInterleaved,
    /// Direct area access, one region per channel.
    MmapNonInterleaved,
}

impl AccessMask {
    /// First access style present, in declaration order.
    pub fn first(&self) -> Option<Access> {
        if self.contains(Self::RW_INTERLEAVED) {
            Some(Access::RwInterleaved)
        } else if self.contains(Self::RW_NONINTERLEAVED) {
            Some(Access::RwNonInterleaved)
        } else if self.contains(Self::MMAP_INTERLEAVED) {
            Some(Access::MmapInterleaved)
        } else if self.contains(Self::MMAP_NONINTERLEAVED) {
            Some(Access::MmapNonInterleaved)
        } else {
            None
        }
    }

    /// Whether the access style addresses frames interleaved.
    pub fn is_interleaved(access: Access) -> bool {
        matches!(access, Access::RwInterleaved | Access::MmapInterleaved)
    }
}

/// The hardware-parameter configuration space under negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwParams {
    /// Access-style mask.
    pub access: AccessMask,
    /// Sample-format mask.
    pub format: FormatMask,
    /// Channel count.
    pub channels: Interval,
    /// Sample rate in Hz.
    pub rate: Interval,
    /// Period size in frames.
    pub period_size: Interval,
    /// Periods per buffer.
    pub periods: Interval,
    /// Buffer size in frames.
    pub buffer_size: Interval,
    /// Period duration in microseconds, derived from rate and period size.
    pub period_time: Interval,
    /// Buffer duration in microseconds, derived from rate and buffer size.
    pub buffer_time: Interval,
}

impl Default for HwParams {
    fn default() -> Self {
        Self::any()
    }
}

impl HwParams {
    /// The completely unconstrained space.
    pub fn any() -> Self {
        Self {
            access: AccessMask::all(),
            format: FormatMask::any(),
            channels: Interval::range(1, 1024),
            rate: Interval::range(1, 768_000),
            period_size: Interval::range(1, 1 << 30),
            periods: Interval::range(1, 1024),
            buffer_size: Interval::range(1, 1 << 32),
            period_time: Interval::any(),
            buffer_time: Interval::any(),
        }
    }

    /// Whether any axis is empty.
    pub fn is_empty(&self) -> bool {
        self.access.is_empty()
            || self.format.is_empty()
            || self.channels.empty
            || self.rate.empty
            || self.period_size.empty
            || self.periods.empty
            || self.buffer_size.empty
            || self.period_time.empty
            || self.buffer_time.empty
    }

    /// Propagate the dependency rules between axes once:
    /// `buffer_size = period_size * periods` and the time axes derived from
    /// the rate. Returns whether anything shrank.
    pub fn propagate(&mut self) -> Result<bool> {
        let mut changed = false;
        changed |= self
            .buffer_size
            .refine(&self.period_size.mul(&self.periods))?;
        changed |= self
            .period_size
            .refine(&self.buffer_size.div(&self.periods))?;
        changed |= self.periods.refine(&self.buffer_size.div(&self.period_size))?;
        if let Some(rate) = self.rate.single() {
            changed |= self
                .period_time
                .refine(&self.period_size.muldiv(1_000_000, rate))?;
            changed |= self
                .buffer_time
                .refine(&self.buffer_size.muldiv(1_000_000, rate))?;
        }
        Ok(changed)
    }

    /// Run `constrain` and the dependency rules to a fixed point. Fails when
    /// any axis becomes empty.
    pub fn refine_with(
        &mut self,
        mut constrain: impl FnMut(&mut HwParams) -> Result<()>,
    ) -> Result<()> {
        // The space only shrinks, so a fixed point is reached; the iteration
        // bound guards against a non-monotonic constraint callback.
        for _ in 0..64 {
            let before = self.clone();
            constrain(self)?;
            self.propagate()?;
            if self.is_empty() {
                return Err(Error::Negotiation("configuration space is empty"));
            }
            if *self == before {
                return Ok(());
            }
        }
        Err(Error::Negotiation("refinement did not converge"))
    }

    /// Collapse every axis to one value following the documented precedence:
    /// first access, first format, minimum channels, minimum rate, minimum
    /// period size, maximum buffer size.
    pub fn choose(&mut self) -> Result<HwConfig> {
        let access = self
            .access
            .first()
            .ok_or(Error::Negotiation("access mask is empty"))?;
        self.access = match access {
            Access::RwInterleaved => AccessMask::RW_INTERLEAVED,
            Access::RwNonInterleaved => AccessMask::RW_NONINTERLEAVED,
            Access::MmapInterleaved => AccessMask::MMAP_INTERLEAVED,
            Access::MmapNonInterleaved => AccessMask::MMAP_NONINTERLEAVED,
        };
        let format = self
            .format
            .first()
            .ok_or(Error::Negotiation("format mask is empty"))?;
        self.format = FormatMask::single(format);
        // Re-propagate between picks so each fixed axis narrows the ones
        // still open before they are collapsed in turn.
        let channels = self.channels.set_first()?;
        self.propagate()?;
        let rate = self.rate.set_first()?;
        self.propagate()?;
        let period_size = self.period_size.set_first()?;
        self.propagate()?;
        let buffer_size = self.buffer_size.set_last()?;
        self.propagate()?;
        Ok(HwConfig {
            access,
            format,
            channels: channels as usize,
            rate,
            period_size,
            buffer_size,
        })
    }
}

/// The concrete outcome of a successful negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwConfig {
    /// Access style in effect.
    pub access: Access,
    /// Sample format in effect.
    pub format: SampleFormat,
    /// Channel count.
    pub channels: usize,
    /// Sample rate in Hz.
    pub rate: u64,
    /// Period size in frames.
    pub period_size: u64,
    /// Ring size in frames.
    pub buffer_size: u64,
}

impl HwConfig {
    /// Bytes occupied by one frame.
    pub fn frame_bytes(&self) -> usize {
        self.channels * self.format.physical_width() / 8
    }
}

/// Software parameters steering the transfer engine's threshold policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwParams {
    /// Minimum available frames before a blocking wait returns.
    pub avail_min: u64,
    /// Queued frames at which a write from Prepared implicitly starts the
    /// stream.
    pub start_threshold: u64,
    /// Available frames beyond which the stream is declared in xrun. Setting
    /// this to the boundary disables xrun detection.
    pub stop_threshold: u64,
    /// Distance to underrun at which proactive silence filling kicks in.
    pub silence_threshold: u64,
    /// Frames of silence written ahead of the application pointer per fill.
    pub silence_size: u64,
    /// Transfers are truncated down to a multiple of this.
    pub xfer_align: u64,
    /// Wraparound modulus, fixed by the hardware configuration.
    pub boundary: u64,
}

impl SwParams {
    /// Defaults for a stream with the given ring size: wake per period-ish
    /// granule, start on full buffer, stop on empty.
    pub fn for_buffer(buffer_size: u64, period_size: u64) -> Self {
        Self {
            avail_min: period_size,
            start_threshold: 1,
            stop_threshold: buffer_size,
            silence_threshold: 0,
            silence_size: 0,
            xfer_align: 1,
            boundary: boundary_for(buffer_size),
        }
    }

    /// Validate the thresholds against the negotiated ring geometry.
    pub fn validate(&self, buffer_size: u64) -> Result<()> {
        let boundary = boundary_for(buffer_size);
        if self.boundary != boundary {
            return Err(Error::InvalidArgument("boundary does not match ring size"));
        }
        if self.avail_min == 0 || self.xfer_align == 0 {
            return Err(Error::InvalidArgument(
                "avail_min and xfer_align must be positive",
            ));
        }
        if self.stop_threshold > boundary {
            return Err(Error::InvalidArgument("stop_threshold beyond boundary"));
        }
        if self.silence_threshold > buffer_size {
            return Err(Error::InvalidArgument("silence_threshold beyond buffer"));
        }
        if self.silence_size > 0 && self.silence_threshold + self.silence_size > buffer_size {
            return Err(Error::InvalidArgument("silence fill larger than buffer"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn refinement_only_shrinks() {
        let mut iv = Interval::range(10, 100);
        assert!(iv.refine_min(20, false).unwrap());
        assert!(!iv.refine_min(5, false).unwrap());
        assert!(iv.refine_max(50, false).unwrap());
        assert_eq!((iv.min, iv.max), (20, 50));
        assert!(iv.refine(&Interval::range(30, 40)).unwrap());
        assert!(iv.refine_min(50, false).is_err());
    }

    #[test]
    fn open_ends_exclude_their_value() {
        let mut iv = Interval::range(10, 11);
        iv.refine_min(10, true).unwrap();
        assert_eq!(iv.lowest(), 11);
        assert!(iv.refine_max(11, true).is_err());
    }

    #[test]
    fn near_clamps_into_range() {
        let mut iv = Interval::range(100, 200);
        assert_eq!(iv.set_near(150).unwrap(), 150);
        let mut iv = Interval::range(100, 200);
        assert_eq!(iv.set_near(7).unwrap(), 100);
        let mut iv = Interval::range(100, 200);
        assert_eq!(iv.set_near(9999).unwrap(), 200);
    }

    #[test]
    fn propagation_links_period_and_buffer() {
        let mut params = HwParams::any();
        params.period_size = Interval::value(256);
        params.periods = Interval::value(4);
        params.propagate().unwrap();
        assert_eq!(params.buffer_size.single(), Some(1024));
    }

    #[test]
    fn refine_with_reaches_fixed_point_and_rejects_empty() {
        let mut params = HwParams::any();
        params
            .refine_with(|p| {
                p.rate.refine(&Interval::range(44_100, 48_000))?;
                p.channels.refine(&Interval::value(2))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(params.channels.single(), Some(2));

        let mut params = HwParams::any();
        let err = params.refine_with(|p| {
            p.rate.refine(&Interval::value(44_100))?;
            p.rate.refine(&Interval::value(48_000))?;
            Ok(())
        });
        assert!(err.is_err());
    }

    #[test]
    fn choose_follows_precedence() {
        let mut params = HwParams::any();
        params.rate = Interval::range(44_100, 96_000);
        params.channels = Interval::range(2, 6);
        params.period_size = Interval::range(64, 1024);
        params.buffer_size = Interval::range(128, 8192);
        params.periods = Interval::range(2, 16);
        let config = params.choose().unwrap();
        assert_eq!(config.access, Access::RwInterleaved);
        assert_eq!(config.format, SampleFormat::S8);
        assert_eq!(config.channels, 2);
        assert_eq!(config.rate, 44_100);
        assert_eq!(config.period_size, 64);
        assert!(config.buffer_size >= config.period_size);
    }

    #[test]
    fn sw_params_validation() {
        let sw = SwParams::for_buffer(8192, 1024);
        sw.validate(8192).unwrap();
        let mut bad = sw;
        bad.avail_min = 0;
        assert!(bad.validate(8192).is_err());
        let mut bad = sw;
        bad.boundary = 12345;
        assert!(bad.validate(8192).is_err());
    }
}
