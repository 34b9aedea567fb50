//! The automatic-conversion decorator: a PCM backend that owns a slave
//! [`Pcm`] and a [`Chain`] translating between what the application
//! negotiated and what the slave accepted.
//!
//! On playback every committed region of the client ring is converted and
//! pushed into the slave immediately, so the client ring never holds more
//! than one in-flight commit. On capture the slave is drained opportunistically
//! on every `avail_update`, with the slave handle switched to non-blocking so
//! a dry device reports zero instead of stalling the caller.

use std::time::Duration;

use crate::area::{silence_areas, Area};
use crate::format::SampleFormat;
use crate::mask::FormatMask;
use crate::params::{AccessMask, HwConfig, HwParams, Interval, SwParams};
use crate::pcm::{Direction, Pcm, PcmOps, State};
use crate::poll::PollDesc;
use crate::ring::RingPointers;
use crate::{Error, Result};

use super::alaw::AlawStage;
use super::linear::LinearStage;
use super::mulaw::MulawStage;
use super::rate::RateStage;
use super::route::RouteStage;
use super::{const_areas, Chain, Shape, Stage};

/// A PCM backend that converts between the client's format and a slave's.
pub struct PlugPcm {
    slave: Pcm,
    direction: Direction,
    chain: Option<Chain>,
    config: Option<HwConfig>,
    sw: Option<SwParams>,
    ring: Vec<u8>,
    ptr: RingPointers,
    running: bool,
    // Slave-shaped staging buffer for chain output (playback) or chain
    // input (capture).
    scratch: Vec<u8>,
}

impl PlugPcm {
    /// Wrap a slave handle. The slave should be freshly opened; its
    /// configuration is negotiated when the client commits one.
    pub fn new(slave: Pcm) -> Self {
        let direction = slave.direction();
        Self {
            slave,
            direction,
            chain: None,
            config: None,
            sw: None,
            ring: Vec::new(),
            ptr: RingPointers::new(0),
            running: false,
            scratch: Vec::new(),
        }
    }

    /// Convenience: wrap a slave and return the ready-to-configure handle.
    pub fn open(name: impl Into<String>, slave: Pcm) -> Pcm {
        Pcm::open(name, Box::new(Self::new(slave)))
    }

    fn config(&self) -> Result<&HwConfig> {
        self.config
            .as_ref()
            .ok_or(Error::InvalidArgument("backend not configured"))
    }

    /// Convert the just-committed client region and hand it to the slave.
    /// The transfer engine chunks at the ring edge, so the region never
    /// wraps.
    fn push_playback(&mut self, offset: usize, frames: usize) -> Result<()> {
        let config = *self.config()?;
        let frame_bytes = config.frame_bytes();
        match &mut self.chain {
            None => {
                let start = offset * frame_bytes;
                self.slave
                    .writei(&self.ring[start..start + frames * frame_bytes])?;
            }
            Some(chain) => {
                let slave_shape = chain.dst_shape();
                let slave_fb = slave_shape.frame_bytes();
                let bound = (chain.dst_frames(frames as u64) + chain.dst_margin()) as usize;
                if self.scratch.len() < bound * slave_fb {
                    self.scratch.resize(bound * slave_fb, 0);
                }
                let produced = {
                    let src = const_areas(&self.ring, client_shape(&config));
                    let dst = Area::interleaved(
                        &mut self.scratch,
                        slave_shape.channels,
                        slave_shape.format,
                    );
                    chain.convert(&src, offset, frames, &dst, 0, bound)?
                };
                if produced > 0 {
                    self.slave.writei(&self.scratch[..produced * slave_fb])?;
                }
            }
        }
        Ok(())
    }

    /// Move whatever the slave has ready into the client ring, converting
    /// on the way. Stops at the ring edge; the loop picks up the wrapped
    /// remainder on the next pass.
    fn pull_capture(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        let config = *self.config()?;
        let frame_bytes = config.frame_bytes();
        loop {
            let free = self.ptr.buffer_size - self.ptr.capture_avail();
            let run = free.min(self.ptr.buffer_size - self.ptr.hw_offset());
            if run == 0 {
                return Ok(());
            }
            match &mut self.chain {
                None => {
                    let start = self.ptr.hw_offset() as usize * frame_bytes;
                    let end = start + run as usize * frame_bytes;
                    let got = match self.slave.readi(&mut self.ring[start..end]) {
                        Ok(frames) => frames,
                        Err(Error::WouldBlock) => return Ok(()),
                        Err(e) => return Err(e),
                    };
                    if got == 0 {
                        return Ok(());
                    }
                    self.ptr.hw_forward(got);
                    if got < run {
                        return Ok(());
                    }
                }
                Some(chain) => {
                    // Ask for no more input than is guaranteed to fit after
                    // conversion, worst-case overshoot included.
                    let margin = chain.dst_margin();
                    if run <= margin {
                        return Ok(());
                    }
                    let ask = chain.src_frames(run - margin);
                    if ask == 0 {
                        return Ok(());
                    }
                    let slave_shape = chain.src_shape();
                    let slave_fb = slave_shape.frame_bytes();
                    let need = ask as usize * slave_fb;
                    if self.scratch.len() < need {
                        self.scratch.resize(need, 0);
                    }
                    let got = match self.slave.readi(&mut self.scratch[..need]) {
                        Ok(frames) => frames,
                        Err(Error::WouldBlock) => return Ok(()),
                        Err(e) => return Err(e),
                    };
                    if got == 0 {
                        return Ok(());
                    }
                    let produced = {
                        let src = const_areas(&self.scratch, slave_shape);
                        let dst =
                            Area::interleaved(&mut self.ring, config.channels, config.format);
                        chain.convert(
                            &src,
                            0,
                            got as usize,
                            &dst,
                            self.ptr.hw_offset() as usize,
                            run as usize,
                        )?
                    };
                    self.ptr.hw_forward(produced as u64);
                    if got < ask {
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn client_shape(config: &HwConfig) -> Shape {
    Shape {
        format: config.format,
        channels: config.channels,
        rate: config.rate,
    }
}

/// Negotiate the slave, falling from an exact match of the client's
/// configuration down to whatever the slave will take. A failed
/// negotiation leaves the slave untouched, so each rung can simply retry.
fn negotiate_slave(slave: &mut Pcm, want: &HwConfig) -> Result<HwConfig> {
    let mut exact = HwParams::any();
    exact.format = FormatMask::single(want.format);
    exact.channels = Interval::value(want.channels as u64);
    exact.rate = Interval::value(want.rate);
    exact.period_size = Interval::value(want.period_size);

    let mut pivot = HwParams::any();
    pivot.format = FormatMask::single(SampleFormat::S16Le);
    pivot.channels = Interval::value(want.channels as u64);
    pivot.rate = Interval::value(want.rate);

    let mut s16 = HwParams::any();
    s16.format = FormatMask::single(SampleFormat::S16Le);

    for mut params in [exact, pivot, s16, HwParams::any()] {
        match slave.hw_params(&mut params) {
            Ok(config) => return Ok(config),
            Err(Error::Negotiation(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::Negotiation("no slave configuration reachable"))
}

/// Build the stage sequence translating `src` frames into `dst` frames,
/// or `None` when the shapes already agree.
///
/// The resampler and the router only speak signed 16-bit, so any rate or
/// channel change pivots through it. Channel reduction runs before the
/// resampler so the rate stage touches fewer samples.
pub fn build_chain(src: Shape, dst: Shape) -> Result<Option<Chain>> {
    if src == dst {
        return Ok(None);
    }
    let mut stages: Vec<Box<dyn Stage>> = Vec::new();
    let mut cur = src;
    if cur.rate != dst.rate || cur.channels != dst.channels {
        push_format(&mut stages, &mut cur, SampleFormat::S16Le)?;
        if cur.channels > dst.channels {
            let next = Shape {
                channels: dst.channels,
                ..cur
            };
            stages.push(Box::new(RouteStage::new(cur, next)?));
            cur = next;
        }
        if cur.rate != dst.rate {
            let next = Shape {
                rate: dst.rate,
                ..cur
            };
            stages.push(Box::new(RateStage::new(cur, next)?));
            cur = next;
        }
        if cur.channels != dst.channels {
            let next = Shape {
                channels: dst.channels,
                ..cur
            };
            stages.push(Box::new(RouteStage::new(cur, next)?));
            cur = next;
        }
    }
    push_format(&mut stages, &mut cur, dst.format)?;
    Chain::new(stages).map(Some)
}

fn is_companded(format: SampleFormat) -> bool {
    matches!(format, SampleFormat::MuLaw | SampleFormat::ALaw)
}

/// Append the format stage(s) taking `cur` to `target`. The companding
/// codecs only pair with linear integer PCM, so a companded-to-companded
/// or companded-to-float change hops through signed 16-bit.
fn push_format(
    stages: &mut Vec<Box<dyn Stage>>,
    cur: &mut Shape,
    target: SampleFormat,
) -> Result<()> {
    if cur.format == target {
        return Ok(());
    }
    if cur.format == SampleFormat::ImaAdpcm || target == SampleFormat::ImaAdpcm {
        return Err(Error::Unsupported("adpcm conversion"));
    }
    if (is_companded(cur.format) && !target.is_linear())
        || (is_companded(target) && !cur.format.is_linear())
    {
        push_one_format(stages, cur, SampleFormat::S16Le)?;
    }
    push_one_format(stages, cur, target)
}

fn push_one_format(
    stages: &mut Vec<Box<dyn Stage>>,
    cur: &mut Shape,
    target: SampleFormat,
) -> Result<()> {
    if cur.format == target {
        return Ok(());
    }
    let next = Shape {
        format: target,
        ..*cur
    };
    let stage: Box<dyn Stage> = if cur.format == SampleFormat::MuLaw || target == SampleFormat::MuLaw
    {
        Box::new(MulawStage::new(*cur, next)?)
    } else if cur.format == SampleFormat::ALaw || target == SampleFormat::ALaw {
        Box::new(AlawStage::new(*cur, next)?)
    } else {
        Box::new(LinearStage::new(*cur, next)?)
    };
    stages.push(stage);
    *cur = next;
    Ok(())
}

impl PcmOps for PlugPcm {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn hw_refine(&self, params: &mut HwParams) -> Result<()> {
        // The chain can synthesize any client format except ADPCM, so only
        // the layout and geometry get bounded. The ring layout stays
        // interleaved because commits hand contiguous frame spans to the
        // slave.
        params.access &= AccessMask::RW_INTERLEAVED | AccessMask::MMAP_INTERLEAVED;
        if params.access.is_empty() {
            return Err(Error::Negotiation("access mask emptied"));
        }
        params.format.reset(SampleFormat::ImaAdpcm);
        if params.format.is_empty() {
            return Err(Error::Negotiation("format mask emptied"));
        }
        params.channels.refine(&Interval::range(1, 64))?;
        params.rate.refine(&Interval::range(4_000, 384_000))?;
        params.period_size.refine(&Interval::range(16, 1 << 16))?;
        params.periods.refine(&Interval::range(2, 32))?;
        Ok(())
    }

    fn hw_params(&mut self, config: &HwConfig) -> Result<()> {
        let client = client_shape(config);
        let slave_config = negotiate_slave(&mut self.slave, config)?;
        let slave = Shape {
            format: slave_config.format,
            channels: slave_config.channels,
            rate: slave_config.rate,
        };
        let chain = match self.direction {
            Direction::Playback => build_chain(client, slave)?,
            Direction::Capture => build_chain(slave, client)?,
        };
        log::debug!(
            client:? = client,
            slave:? = slave,
            direct = chain.is_none();
            "plug negotiated slave"
        );
        if self.direction == Direction::Capture {
            // The pull loop must never block on a dry slave, and it drains
            // partial periods, so the slave wakes per frame.
            self.slave.set_nonblock(true);
            let mut sw = SwParams::for_buffer(slave_config.buffer_size, slave_config.period_size);
            sw.avail_min = 1;
            self.slave.sw_params(&sw)?;
        }
        self.ring = vec![0; config.buffer_size as usize * config.frame_bytes()];
        self.ptr = RingPointers::new(config.buffer_size);
        self.config = Some(*config);
        self.chain = chain;
        self.running = false;
        self.scratch.clear();
        Ok(())
    }

    fn hw_free(&mut self) -> Result<()> {
        if self.slave.state() != State::Open {
            self.slave.hw_free()?;
        }
        self.ring = Vec::new();
        self.scratch = Vec::new();
        self.config = None;
        self.sw = None;
        self.chain = None;
        Ok(())
    }

    fn sw_params(&mut self, sw: &SwParams) -> Result<()> {
        self.sw = Some(*sw);
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        let config = *self.config()?;
        self.slave.prepare()?;
        self.ptr.reset();
        if let Some(chain) = &mut self.chain {
            chain.reset();
        }
        self.running = false;
        let areas = Area::interleaved(&mut self.ring, config.channels, config.format);
        silence_areas(&areas, 0, config.buffer_size as usize, config.format)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.ptr.appl_ptr = self.ptr.hw_ptr;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.running = true;
        // A playback slave may already be running from an implicit start on
        // an earlier push.
        if self.slave.state() == State::Prepared {
            self.slave.start()?;
        }
        Ok(())
    }

    fn drop_frames(&mut self) -> Result<()> {
        self.running = false;
        if self.slave.state() != State::Open {
            self.slave.drop_frames()?;
        }
        Ok(())
    }

    fn pause(&mut self, enable: bool) -> Result<()> {
        self.slave.pause(enable)
    }

    fn resume(&mut self) -> Result<()> {
        self.slave.resume()
    }

    fn avail_update(&mut self) -> Result<u64> {
        match self.direction {
            // Commits drain straight into the slave, so the client ring is
            // always as empty as it can be.
            Direction::Playback => Ok(self.ptr.playback_avail()),
            Direction::Capture => {
                self.pull_capture()?;
                Ok(self.ptr.capture_avail())
            }
        }
    }

    fn pointers(&self) -> RingPointers {
        self.ptr
    }

    fn rewind(&mut self, frames: u64) -> Result<u64> {
        // Pushed playback frames already live in the slave and cannot come
        // back, so the rewindable span is whatever has not been committed.
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
        Ok(Area::interleaved(
            &mut self.ring,
            config.channels,
            config.format,
        ))
    }

    fn mmap_commit(&mut self, offset: u64, frames: u64) -> Result<u64> {
        if offset != self.ptr.appl_offset() {
            return Err(Error::InvalidArgument("commit offset out of sync"));
        }
        if self.direction == Direction::Playback {
            self.push_playback(offset as usize, frames as usize)?;
        }
        self.ptr.appl_forward(frames);
        if self.direction == Direction::Playback {
            self.ptr.hw_forward(frames);
        }
        Ok(frames)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        match self.direction {
            // The client ring drains on commit, so playback is always ready.
            Direction::Playback => Ok(true),
            Direction::Capture => self.slave.wait(timeout),
        }
    }

    fn poll_descriptor(&self) -> Option<PollDesc> {
        self.slave.poll_descriptor()
    }

    fn delay(&mut self) -> Result<i64> {
        let slave_delay = self.slave.delay()?.max(0) as u64;
        let scaled = match &self.chain {
            None => slave_delay,
            Some(chain) => match self.direction {
                // Playback delay is measured in client frames still to be
                // heard, so slave frames scale back through the chain.
                Direction::Playback => chain.src_frames(slave_delay),
                Direction::Capture => chain.dst_frames(slave_delay),
            },
        };
        let own = match self.direction {
            Direction::Playback => self.ptr.playback_hw_avail(),
            Direction::Capture => self.ptr.capture_avail(),
        };
        Ok((scaled + own) as i64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::mock::{mock_capture, mock_playback, MockHandle};

    fn shape(format: SampleFormat, channels: usize, rate: u64) -> Shape {
        Shape {
            format,
            channels,
            rate,
        }
    }

    fn open_plug(
        direction: Direction,
        format: SampleFormat,
        channels: u64,
        rate: u64,
    ) -> (Pcm, MockHandle) {
        let (ops, handle) = match direction {
            Direction::Playback => mock_playback(),
            Direction::Capture => mock_capture(),
        };
        let slave = Pcm::open("mock", ops);
        let mut pcm = PlugPcm::open("plug", slave);
        let mut params = HwParams::any();
        params.format = FormatMask::single(format);
        params.channels.refine(&Interval::value(channels)).unwrap();
        params.rate.refine(&Interval::value(rate)).unwrap();
        params.period_size.refine(&Interval::value(1024)).unwrap();
        params.periods.refine(&Interval::value(4)).unwrap();
        pcm.hw_params(&mut params).unwrap();
        pcm.prepare().unwrap();
        (pcm, handle)
    }

    #[test]
    fn identity_shapes_need_no_chain() {
        let s = shape(SampleFormat::S16Le, 2, 48_000);
        assert!(build_chain(s, s).unwrap().is_none());
    }

    #[test]
    fn chain_pivots_through_s16_for_rate_and_channels() {
        let src = shape(SampleFormat::MuLaw, 1, 8_000);
        let dst = shape(SampleFormat::S16Le, 2, 48_000);
        let chain = build_chain(src, dst).unwrap().unwrap();
        // Decode, resample, then spread to stereo.
        assert_eq!(chain.src_shape(), src);
        assert_eq!(chain.dst_shape(), dst);
        assert_eq!(chain.dst_frames(8_000), 48_000);
    }

    #[test]
    fn companded_to_companded_hops_through_linear() {
        let src = shape(SampleFormat::MuLaw, 1, 8_000);
        let dst = shape(SampleFormat::ALaw, 1, 8_000);
        let chain = build_chain(src, dst).unwrap().unwrap();
        assert_eq!(chain.src_shape(), src);
        assert_eq!(chain.dst_shape(), dst);
    }

    #[test]
    fn adpcm_conversion_is_refused() {
        let src = shape(SampleFormat::ImaAdpcm, 1, 8_000);
        let dst = shape(SampleFormat::S16Le, 1, 8_000);
        assert!(build_chain(src, dst).is_err());
    }

    #[test]
    fn matching_client_passes_straight_through() {
        let (mut pcm, handle) = open_plug(Direction::Playback, SampleFormat::S16Le, 2, 48_000);
        pcm.start().unwrap();
        let frames = 1024usize;
        let buf: Vec<u8> = (0..frames * 4).map(|i| i as u8).collect();
        assert_eq!(pcm.writei(&buf).unwrap(), frames as u64);
        // The slave saw the identical bytes.
        assert_eq!(&handle.ring_snapshot()[..buf.len()], &buf[..]);
        assert_eq!(handle.pointers().appl_ptr, frames as u64);
        assert!(handle.is_running());
    }

    #[test]
    fn format_and_routing_convert_on_the_way_down() {
        // Client speaks unsigned 8-bit mono; the mock slave only takes
        // signed 16-bit stereo.
        let (mut pcm, handle) = open_plug(Direction::Playback, SampleFormat::U8, 1, 48_000);
        let config = *pcm.config().unwrap();
        assert_eq!(config.format, SampleFormat::U8);
        assert_eq!(config.channels, 1);
        pcm.start().unwrap();
        assert_eq!(pcm.writei(&[0x80, 0xff, 0x00, 0x40]).unwrap(), 4);
        let ring = handle.ring_snapshot();
        let samples: Vec<i16> = ring[..16]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        // Each mono sample lands on both slave channels.
        assert_eq!(
            samples,
            [0, 0, 32512, 32512, -32768, -32768, -16384, -16384]
        );
    }

    #[test]
    fn resampling_roughly_doubles_the_slave_throughput() {
        let (mut pcm, handle) = open_plug(Direction::Playback, SampleFormat::S16Le, 2, 24_000);
        pcm.start().unwrap();
        let frames = 256usize;
        let buf = vec![0u8; frames * 4];
        assert_eq!(pcm.writei(&buf).unwrap(), frames as u64);
        let pushed = handle.pointers().appl_ptr;
        // Interpolation may run a few frames short or long of the exact
        // ratio on a single burst.
        assert!((504..=520).contains(&pushed), "pushed {pushed}");
    }

    #[test]
    fn capture_pulls_fed_data_through_the_plug() {
        let (mut pcm, handle) = open_plug(Direction::Capture, SampleFormat::S16Le, 2, 48_000);
        pcm.start().unwrap();
        let fed: Vec<u8> = (0..256 * 4).map(|i| (i % 251) as u8).collect();
        handle.feed(&fed);
        let mut buf = vec![0u8; fed.len()];
        assert_eq!(pcm.readi(&mut buf).unwrap(), 256);
        assert_eq!(buf, fed);
    }

    #[test]
    fn capture_converts_the_slave_format_up() {
        // Mock always produces signed 16-bit stereo; client wants unsigned
        // 8-bit stereo.
        let (mut pcm, handle) = open_plug(Direction::Capture, SampleFormat::U8, 2, 48_000);
        pcm.start().unwrap();
        let mut fed = Vec::new();
        for sample in [0i16, 0x7f00, -0x8000, 0x0100] {
            fed.extend_from_slice(&sample.to_le_bytes());
        }
        handle.feed(&fed);
        let mut buf = [0u8; 4];
        assert_eq!(pcm.readi(&mut buf).unwrap(), 2);
        assert_eq!(buf, [0x80, 0xff, 0x00, 0x81]);
    }
}
