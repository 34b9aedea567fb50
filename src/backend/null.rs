//! The null device: a sink that consumes playback instantly and a source
//! that delivers endless silence. Useful as the terminal slave under a
//! plugin chain and as the all-software stand-in for real hardware.

use std::time::Duration;

use crate::area::{silence_areas, Area};
use crate::params::{AccessMask, HwConfig, HwParams, Interval, SwParams};
use crate::pcm::{Direction, PcmOps};
use crate::ring::RingPointers;
use crate::{Error, Result};

/// A PCM backend with no device behind it.
pub struct NullPcm {
    direction: Direction,
    config: Option<HwConfig>,
    sw: Option<SwParams>,
    ring: Vec<u8>,
    ptr: RingPointers,
    running: bool,
}

impl NullPcm {
    /// A fresh unconfigured null backend.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            config: None,
            sw: None,
            ring: Vec::new(),
            ptr: RingPointers::new(0),
            running: false,
        }
    }

    fn config(&self) -> Result<&HwConfig> {
        self.config
            .as_ref()
            .ok_or(Error::InvalidArgument("backend not configured"))
    }

    fn areas_of<'a>(ring: &'a mut [u8], config: &HwConfig) -> Vec<Area<'a>> {
        if AccessMask::is_interleaved(config.access) {
            Area::interleaved(ring, config.channels, config.format)
        } else {
            Area::planar(ring, config.channels, config.buffer_size as usize, config.format)
        }
    }

    /// Instant production: a running capture stream always has a full ring
    /// of silence on offer.
    fn refill_capture(&mut self) {
        if self.direction == Direction::Capture && self.running {
            let avail = self.ptr.capture_avail();
            self.ptr.hw_forward(self.ptr.buffer_size - avail);
        }
    }
}

impl PcmOps for NullPcm {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn hw_refine(&self, params: &mut HwParams) -> Result<()> {
        // Any format and layout goes; only the geometry gets bounded so a
        // default negotiation picks an allocatable ring.
        params.channels.refine(&Interval::range(1, 64))?;
        params.rate.refine(&Interval::range(4_000, 384_000))?;
        params.period_size.refine(&Interval::range(16, 1 << 16))?;
        params.periods.refine(&Interval::range(2, 32))?;
        Ok(())
    }

    fn hw_params(&mut self, config: &HwConfig) -> Result<()> {
        let bytes = config.buffer_size as usize * config.frame_bytes();
        self.ring = vec![0; bytes];
        self.ptr = RingPointers::new(config.buffer_size);
        self.config = Some(*config);
        self.running = false;
        Ok(())
    }

    fn hw_free(&mut self) -> Result<()> {
        self.ring = Vec::new();
        self.config = None;
        self.sw = None;
        Ok(())
    }

    fn sw_params(&mut self, sw: &SwParams) -> Result<()> {
        self.sw = Some(*sw);
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        let config = *self.config()?;
        self.ptr.reset();
        self.running = false;
        let areas = Self::areas_of(&mut self.ring, &config);
        silence_areas(&areas, 0, config.buffer_size as usize, config.format)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.ptr.appl_ptr = self.ptr.hw_ptr;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.running = true;
        self.refill_capture();
        Ok(())
    }

    fn drop_frames(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn pause(&mut self, _enable: bool) -> Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn avail_update(&mut self) -> Result<u64> {
        self.refill_capture();
        Ok(match self.direction {
            Direction::Playback => self.ptr.playback_avail(),
            Direction::Capture => self.ptr.capture_avail(),
        })
    }

    fn pointers(&self) -> RingPointers {
        self.ptr
    }

    fn rewind(&mut self, frames: u64) -> Result<u64> {
        let limit = match self.direction {
            Direction::Playback => self.ptr.playback_hw_avail(),
            Direction::Capture => self.ptr.buffer_size - self.ptr.capture_avail(),
        };
        let frames = frames.min(limit);
        self.ptr.appl_backward(frames);
        Ok(frames)
    }

    fn forward(&mut self, frames: u64) -> Result<u64> {
        let limit = match self.direction {
            Direction::Playback => self.ptr.playback_avail(),
            Direction::Capture => self.ptr.capture_avail(),
        };
        let frames = frames.min(limit);
        self.ptr.appl_forward(frames);
        Ok(frames)
    }

    fn mmap_areas(&mut self) -> Result<Vec<Area<'_>>> {
        let config = *self.config()?;
        Ok(Self::areas_of(&mut self.ring, &config))
    }

    fn mmap_commit(&mut self, offset: u64, frames: u64) -> Result<u64> {
        if offset != self.ptr.appl_offset() {
            return Err(Error::InvalidArgument("commit offset out of sync"));
        }
        self.ptr.appl_forward(frames);
        // Instant consumption: the device edge tracks the application.
        if self.direction == Direction::Playback {
            self.ptr.hw_forward(frames);
        }
        Ok(frames)
    }

    fn wait(&mut self, _timeout: Option<Duration>) -> Result<bool> {
        // Never starved and never backed up.
        Ok(true)
    }

    fn delay(&mut self) -> Result<i64> {
        Ok(match self.direction {
            Direction::Playback => self.ptr.playback_hw_avail() as i64,
            Direction::Capture => self.ptr.capture_avail() as i64,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::HwParams;
    use crate::pcm::{Pcm, State};

    fn open(direction: Direction) -> Pcm {
        let mut pcm = Pcm::open("null", Box::new(NullPcm::new(direction)));
        let mut params = HwParams::any();
        params.format = crate::mask::FormatMask::single(crate::format::SampleFormat::S16Le);
        params.channels.refine(&Interval::value(2)).unwrap();
        params.rate.refine(&Interval::value(48_000)).unwrap();
        params.period_size.refine(&Interval::value(1024)).unwrap();
        params.periods.refine(&Interval::value(4)).unwrap();
        pcm.hw_params(&mut params).unwrap();
        pcm
    }

    #[test]
    fn playback_consumes_instantly() {
        let mut pcm = open(Direction::Playback);
        assert_eq!(pcm.config().unwrap().buffer_size, 4096);
        pcm.prepare().unwrap();
        pcm.start().unwrap();
        let frames = 1024;
        let buf = vec![0u8; frames * pcm.config().unwrap().frame_bytes()];
        assert_eq!(pcm.writei(&buf).unwrap(), frames as u64);
        // Everything was swallowed: the ring is empty again.
        assert_eq!(pcm.avail_update().unwrap(), 4096);
        assert_eq!(pcm.delay().unwrap(), 0);
    }

    #[test]
    fn capture_delivers_silence() {
        let mut pcm = open(Direction::Capture);
        pcm.prepare().unwrap();
        pcm.start().unwrap();
        let mut buf = vec![0xaau8; 256 * 4];
        assert_eq!(pcm.readi(&mut buf).unwrap(), 256);
        // S16 silence is all-zero.
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn drain_from_running_is_immediate() {
        let mut pcm = open(Direction::Playback);
        pcm.prepare().unwrap();
        pcm.start().unwrap();
        pcm.drain().unwrap();
        assert_eq!(pcm.state(), State::Setup);
    }
}
