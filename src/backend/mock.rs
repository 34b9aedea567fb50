//! A scriptable backend for unit tests: the hardware pointer only moves
//! when the test says so, which makes xruns, implicit starts and blocking
//! waits reproducible.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::area::Area;
use crate::params::{HwConfig, HwParams, Interval, SwParams};
use crate::pcm::{Direction, PcmOps};
use crate::ring::RingPointers;
use crate::{Error, Result};

struct Inner {
    direction: Direction,
    config: Option<HwConfig>,
    sw: Option<SwParams>,
    ring: Vec<u8>,
    ptr: RingPointers,
    running: bool,
    suspended: bool,
    /// When set, playback commits are consumed on the spot, like a device
    /// that can never be starved.
    auto_consume: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
}

pub(crate) struct MockPcm(Arc<Shared>);

/// Test-side controls over the fake device clock.
#[derive(Clone)]
pub(crate) struct MockHandle(Arc<Shared>);

fn mock(direction: Direction) -> (Box<dyn PcmOps>, MockHandle) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            direction,
            config: None,
            sw: None,
            ring: Vec::new(),
            ptr: RingPointers::new(0),
            running: false,
            suspended: false,
            auto_consume: false,
        }),
        cond: Condvar::new(),
    });
    (Box::new(MockPcm(shared.clone())), MockHandle(shared))
}

pub(crate) fn mock_playback() -> (Box<dyn PcmOps>, MockHandle) {
    mock(Direction::Playback)
}

pub(crate) fn mock_capture() -> (Box<dyn PcmOps>, MockHandle) {
    mock(Direction::Capture)
}

impl Inner {
    fn avail(&self) -> u64 {
        match self.direction {
            Direction::Playback => self.ptr.playback_avail(),
            Direction::Capture => self.ptr.capture_avail(),
        }
    }
}

impl MockHandle {
    pub(crate) fn pointers(&self) -> RingPointers {
        self.0.inner.lock().unwrap().ptr
    }

    /// Advance the device clock by `frames` frames.
    pub(crate) fn hw_advance(&self, frames: u64) {
        let mut inner = self.0.inner.lock().unwrap();
        inner.ptr.hw_forward(frames);
        self.0.cond.notify_all();
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.0.inner.lock().unwrap().suspended = suspended;
        self.0.cond.notify_all();
    }

    pub(crate) fn set_auto_consume(&self, auto: bool) {
        self.0.inner.lock().unwrap().auto_consume = auto;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.0.inner.lock().unwrap().running
    }

    /// Capture-side: append device-produced bytes at the hardware offset.
    pub(crate) fn feed(&self, bytes: &[u8]) {
        let mut inner = self.0.inner.lock().unwrap();
        let config = inner.config.expect("mock not configured");
        let frame_bytes = config.frame_bytes();
        assert_eq!(bytes.len() % frame_bytes, 0);
        let mut written = 0;
        while written < bytes.len() {
            let offset = inner.ptr.hw_offset() as usize * frame_bytes;
            let run = inner.ring.len() - offset;
            let chunk = run.min(bytes.len() - written);
            inner.ring[offset..offset + chunk]
                .copy_from_slice(&bytes[written..written + chunk]);
            inner
                .ptr
                .hw_forward((chunk / frame_bytes) as u64);
            written += chunk;
        }
        assert!(inner.ptr.capture_avail() <= inner.ptr.buffer_size);
        self.0.cond.notify_all();
    }

    /// Bytes currently in the ring, for asserting what a transfer wrote.
    pub(crate) fn ring_snapshot(&self) -> Vec<u8> {
        self.0.inner.lock().unwrap().ring.clone()
    }
}

impl PcmOps for MockPcm {
    fn direction(&self) -> Direction {
        self.0.inner.lock().unwrap().direction
    }

    fn hw_refine(&self, params: &mut HwParams) -> Result<()> {
        params
            .format
            .intersect(&crate::mask::FormatMask::single(crate::format::SampleFormat::S16Le));
        if params.format.is_empty() {
            return Err(Error::Negotiation("mock only speaks s16le"));
        }
        params.channels.refine(&Interval::value(2))?;
        params.rate.refine(&Interval::value(48_000))?;
        params.period_size.refine(&Interval::value(1024))?;
        params.periods.refine(&Interval::range(2, 8))?;
        Ok(())
    }

    fn hw_params(&mut self, config: &HwConfig) -> Result<()> {
        let mut inner = self.0.inner.lock().unwrap();
        inner.ring = vec![0; config.buffer_size as usize * config.frame_bytes()];
        inner.ptr = RingPointers::new(config.buffer_size);
        inner.config = Some(*config);
        inner.running = false;
        Ok(())
    }

    fn hw_free(&mut self) -> Result<()> {
        let mut inner = self.0.inner.lock().unwrap();
        inner.ring = Vec::new();
        inner.config = None;
        Ok(())
    }

    fn sw_params(&mut self, sw: &SwParams) -> Result<()> {
        self.0.inner.lock().unwrap().sw = Some(*sw);
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        let mut inner = self.0.inner.lock().unwrap();
        inner.ptr.reset();
        inner.running = false;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let mut inner = self.0.inner.lock().unwrap();
        inner.ptr.appl_ptr = inner.ptr.hw_ptr;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.0.inner.lock().unwrap().running = true;
        Ok(())
    }

    fn drop_frames(&mut self) -> Result<()> {
        self.0.inner.lock().unwrap().running = false;
        Ok(())
    }

    fn pause(&mut self, _enable: bool) -> Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let inner = self.0.inner.lock().unwrap();
        if inner.suspended {
            return Err(Error::Suspended);
        }
        Ok(())
    }

    fn avail_update(&mut self) -> Result<u64> {
        let inner = self.0.inner.lock().unwrap();
        if inner.suspended {
            return Err(Error::Suspended);
        }
        Ok(inner.avail())
    }

    fn pointers(&self) -> RingPointers {
        self.0.inner.lock().unwrap().ptr
    }

    fn rewind(&mut self, frames: u64) -> Result<u64> {
        let mut inner = self.0.inner.lock().unwrap();
        let limit = match inner.direction {
            Direction::Playback => inner.ptr.playback_hw_avail(),
            Direction::Capture => inner.ptr.buffer_size - inner.ptr.capture_avail(),
        };
        let frames = frames.min(limit);
        inner.ptr.appl_backward(frames);
        Ok(frames)
    }

    fn forward(&mut self, frames: u64) -> Result<u64> {
        let mut inner = self.0.inner.lock().unwrap();
        let frames = frames.min(inner.avail());
        inner.ptr.appl_forward(frames);
        Ok(frames)
    }

    fn mmap_areas(&mut self) -> Result<Vec<Area<'_>>> {
        let mut inner = self.0.inner.lock().unwrap();
        let config = inner
            .config
            .ok_or(Error::InvalidArgument("mock not configured"))?;
        let base = inner.ring.as_mut_ptr();
        let bytes = inner.ring.len();
        drop(inner);
        let width = config.format.physical_width();
        // The ring vec is owned by the shared state and never reallocated
        // outside hw_params, so the raw views stay valid for this borrow.
        Ok((0..config.channels)
            .map(|ch| unsafe {
                Area::from_raw(base, bytes, ch * width, config.channels * width)
            })
            .collect())
    }

    fn mmap_commit(&mut self, offset: u64, frames: u64) -> Result<u64> {
        let mut inner = self.0.inner.lock().unwrap();
        if offset != inner.ptr.appl_offset() {
            return Err(Error::InvalidArgument("commit offset out of sync"));
        }
        inner.ptr.appl_forward(frames);
        if inner.auto_consume && inner.direction == Direction::Playback {
            inner.ptr.hw_forward(frames);
        }
        self.0.cond.notify_all();
        Ok(frames)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut inner = self.0.inner.lock().unwrap();
        loop {
            let avail_min = inner.sw.map(|sw| sw.avail_min).unwrap_or(1);
            if inner.suspended || inner.avail() >= avail_min {
                return Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    let (guard, result) = self
                        .0
                        .cond
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    inner = guard;
                    if result.timed_out() {
                        let avail_min = inner.sw.map(|sw| sw.avail_min).unwrap_or(1);
                        return Ok(inner.suspended || inner.avail() >= avail_min);
                    }
                }
                None => inner = self.0.cond.wait(inner).unwrap(),
            }
        }
    }

    fn delay(&mut self) -> Result<i64> {
        let inner = self.0.inner.lock().unwrap();
        Ok(match inner.direction {
            Direction::Playback => inner.ptr.playback_hw_avail() as i64,
            Direction::Capture => inner.ptr.capture_avail() as i64,
        })
    }
}
