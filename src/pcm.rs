//! The abstract PCM handle: state machine, backend dispatch, and the
//! operations every slave implements.
//!
//! A [`Pcm`] owns exactly one backend behind the [`PcmOps`] trait. The
//! backend may be a terminal device (null, file) or a decorator that owns a
//! slave [`Pcm`] of its own (plugin chain, share client); the handle cannot
//! tell the difference. All state-machine policy lives here so every
//! backend gets identical transition checking, and a rejected operation
//! returns [`Error::BadState`] without touching any negotiated field.

use std::time::Duration;

use crate::area::Area;
use crate::params::{HwConfig, HwParams, SwParams};
use crate::poll::PollDesc;
use crate::ring::RingPointers;
use crate::timestamp::Timestamp;
use crate::transfer;
use crate::{Error, Result};

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Application supplies frames, backend consumes them.
    Playback,
    /// Backend produces frames, application retrieves them.
    Capture,
}

/// Lifecycle states of a PCM handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Handle exists, no hardware parameters yet.
    Open,
    /// Hardware parameters negotiated.
    Setup,
    /// Buffers allocated and pointers reset; ready to start.
    Prepared,
    /// Stream is moving.
    Running,
    /// Underrun (playback) or overrun (capture) detected.
    Xrun,
    /// Playback flushing queued frames, or capture delivering its tail.
    Draining,
    /// Paused by the application.
    Paused,
    /// Backend suspended by power management.
    Suspended,
}

/// Point-in-time snapshot reported by [`Pcm::status`].
#[derive(Debug, Clone, Copy)]
pub struct Status {
    /// State at the time of the query.
    pub state: State,
    /// Frames available for transfer.
    pub avail: u64,
    /// Stream time accumulated since the trigger, if the stream started.
    pub trigger_time: Option<Timestamp>,
}

/// The operation set every backend (slave PCM) implements.
///
/// This is the crate's equivalent of a per-backend function-pointer table:
/// one trait, one implementation per backend kind, with decorators
/// delegating to an owned slave of the same trait.
pub trait PcmOps: Send {
    /// Stream direction this backend was opened for.
    fn direction(&self) -> Direction;

    /// Shrink the configuration space to what this backend (and everything
    /// below it) can satisfy. Must never grow any axis.
    fn hw_refine(&self, params: &mut HwParams) -> Result<()>;

    /// Commit a concrete configuration and allocate the ring.
    fn hw_params(&mut self, config: &HwConfig) -> Result<()>;

    /// Release the ring and return to the unconfigured state.
    fn hw_free(&mut self) -> Result<()>;

    /// Store software parameters relevant to the backend.
    fn sw_params(&mut self, sw: &SwParams) -> Result<()>;

    /// Reset pointers and make the stream startable.
    fn prepare(&mut self) -> Result<()>;

    /// Move the application pointer back onto the hardware pointer.
    fn reset(&mut self) -> Result<()>;

    /// Activate the stream.
    fn start(&mut self) -> Result<()>;

    /// Stop immediately, discarding queued frames.
    fn drop_frames(&mut self) -> Result<()>;

    /// Pause (`true`) or resume from pause (`false`).
    fn pause(&mut self, enable: bool) -> Result<()> {
        let _ = enable;
        Err(Error::Unsupported("pause"))
    }

    /// Resume from a power-management suspend.
    fn resume(&mut self) -> Result<()> {
        Err(Error::Unsupported("resume"))
    }

    /// Refresh the hardware pointer from the device position and return the
    /// frames available for transfer. Reports xrun/suspend conditions as
    /// errors.
    fn avail_update(&mut self) -> Result<u64>;

    /// Snapshot of the ring counters.
    fn pointers(&self) -> RingPointers;

    /// Move the application pointer backward without transferring data.
    /// Returns the frames actually rewound.
    fn rewind(&mut self, frames: u64) -> Result<u64>;

    /// Move the application pointer forward without transferring data.
    /// Returns the frames actually skipped.
    fn forward(&mut self, frames: u64) -> Result<u64>;

    /// Channel areas spanning the whole ring.
    fn mmap_areas(&mut self) -> Result<Vec<Area<'_>>>;

    /// Commit `frames` frames at ring offset `offset` (which must be the
    /// current application offset): advance the application pointer and let
    /// the backend consume/produce. Returns the frames committed.
    fn mmap_commit(&mut self, offset: u64, frames: u64) -> Result<u64>;

    /// Block until the stream is ready for at least `avail_min` frames or
    /// the timeout elapses. Returns whether readiness was signalled.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<bool>;

    /// The one OS-level readiness descriptor for this handle, if any.
    fn poll_descriptor(&self) -> Option<PollDesc> {
        None
    }

    /// Frames between the ring and the audible edge of the backend.
    fn delay(&mut self) -> Result<i64>;
}

/// An abstract PCM handle.
pub struct Pcm {
    name: String,
    ops: Box<dyn PcmOps>,
    direction: Direction,
    state: State,
    config: Option<HwConfig>,
    sw: Option<SwParams>,
    nonblock: bool,
    trigger_time: Option<Timestamp>,
}

impl std::fmt::Debug for Pcm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pcm")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pcm {
    /// Wrap a backend into a fresh handle in the `Open` state.
    pub fn open(name: impl Into<String>, ops: Box<dyn PcmOps>) -> Self {
        let name = name.into();
        let direction = ops.direction();
        log::info!(name = name.as_str(), direction:? = direction; "opening pcm");
        Self {
            name,
            ops,
            direction,
            state: State::Open,
            config: None,
            sw: None,
            nonblock: false,
            trigger_time: None,
        }
    }

    /// Handle name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Negotiated hardware configuration, once `hw_params` succeeded.
    pub fn config(&self) -> Option<&HwConfig> {
        self.config.as_ref()
    }

    /// Software parameters in effect.
    pub fn sw_config(&self) -> Option<&SwParams> {
        self.sw.as_ref()
    }

    /// Switch between blocking and non-blocking transfer semantics.
    pub fn set_nonblock(&mut self, nonblock: bool) {
        self.nonblock = nonblock;
    }

    /// Whether transfers are non-blocking.
    pub fn is_nonblock(&self) -> bool {
        self.nonblock
    }

    fn expect_state(&self, legal: &[State]) -> Result<()> {
        if legal.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::BadState(self.state))
        }
    }

    /// Negotiate hardware parameters.
    ///
    /// Refines `params` against the backend chain to a fixed point, picks
    /// one concrete value per axis, commits it, and enters `Setup`. On
    /// failure the space may be partially refined but the handle keeps its
    /// previous state and configuration.
    pub fn hw_params(&mut self, params: &mut HwParams) -> Result<HwConfig> {
        self.expect_state(&[State::Open, State::Setup, State::Prepared])?;
        params.refine_with(|p| self.ops.hw_refine(p))?;
        let config = params.choose()?;
        // Re-check: the chosen point must still satisfy the backend.
        self.ops.hw_params(&config)?;
        log::debug!(name = self.name.as_str(), format:? = config.format,
            channels = config.channels, rate = config.rate,
            buffer_size = config.buffer_size; "hw_params committed");
        self.config = Some(config);
        self.sw = Some(SwParams::for_buffer(config.buffer_size, config.period_size));
        self.ops.sw_params(self.sw.as_ref().unwrap())?;
        self.state = State::Setup;
        Ok(config)
    }

    /// Drop the hardware configuration, returning to `Open`.
    pub fn hw_free(&mut self) -> Result<()> {
        self.expect_state(&[State::Setup, State::Prepared])?;
        self.ops.hw_free()?;
        self.config = None;
        self.sw = None;
        self.state = State::Open;
        Ok(())
    }

    /// Install software parameters. Legal in any state once hardware
    /// parameters exist, including while running; does not change state.
    pub fn sw_params(&mut self, sw: &SwParams) -> Result<()> {
        let config = self.config.ok_or(Error::BadState(self.state))?;
        sw.validate(config.buffer_size)?;
        self.ops.sw_params(sw)?;
        self.sw = Some(*sw);
        Ok(())
    }

    /// Reset pointers and enter `Prepared`. Idempotent from `Prepared`;
    /// this is also the recovery call after an xrun or suspend.
    pub fn prepare(&mut self) -> Result<()> {
        self.expect_state(&[
            State::Setup,
            State::Prepared,
            State::Xrun,
            State::Paused,
            State::Suspended,
        ])?;
        self.ops.prepare()?;
        self.trigger_time = None;
        self.state = State::Prepared;
        Ok(())
    }

    /// Explicitly start the stream. Only legal from `Prepared`.
    pub fn start(&mut self) -> Result<()> {
        self.expect_state(&[State::Prepared])?;
        self.ops.start()?;
        let rate = self.config.map(|c| c.rate).unwrap_or(0);
        self.trigger_time = Some(Timestamp::new(rate as f64));
        self.state = State::Running;
        log::debug!(name = self.name.as_str(); "stream started");
        Ok(())
    }

    /// Stop immediately and discard queued frames. Safe from `Xrun`.
    pub fn drop_frames(&mut self) -> Result<()> {
        self.expect_state(&[
            State::Setup,
            State::Prepared,
            State::Running,
            State::Xrun,
            State::Draining,
            State::Paused,
            State::Suspended,
        ])?;
        self.ops.drop_frames()?;
        self.trigger_time = None;
        self.state = State::Setup;
        Ok(())
    }

    /// Drain the stream.
    ///
    /// Playback: blocks until every queued frame has been consumed, then
    /// stops into `Setup`; a non-blocking handle returns
    /// [`Error::WouldBlock`] and stays in `Draining` for the caller to
    /// poll. Capture: enters `Draining` so the remaining captured frames
    /// can be read out through normal reads.
    pub fn drain(&mut self) -> Result<()> {
        self.expect_state(&[State::Setup, State::Prepared, State::Running, State::Draining])?;
        if self.state == State::Setup {
            return Ok(());
        }
        if self.direction == Direction::Capture {
            self.state = State::Draining;
            return Ok(());
        }
        self.state = State::Draining;
        loop {
            match self.ops.avail_update() {
                Ok(_) => {}
                // The backend consuming the tail can legitimately trip the
                // stop threshold; the buffer is empty either way.
                Err(Error::Xrun) => break,
                Err(e) => return Err(e),
            }
            if self.ops.pointers().playback_hw_avail() == 0 {
                break;
            }
            if self.nonblock {
                return Err(Error::WouldBlock);
            }
            self.ops.wait(Some(Duration::from_millis(100)))?;
        }
        self.ops.drop_frames()?;
        self.trigger_time = None;
        self.state = State::Setup;
        Ok(())
    }

    /// Pause (`enable`) or resume (`!enable`) a running stream. Backends
    /// without pause support report [`Error::Unsupported`].
    pub fn pause(&mut self, enable: bool) -> Result<()> {
        match (self.state, enable) {
            (State::Running, true) => {
                self.ops.pause(true)?;
                self.state = State::Paused;
                Ok(())
            }
            (State::Paused, false) => {
                self.ops.pause(false)?;
                self.state = State::Running;
                Ok(())
            }
            _ => Err(Error::BadState(self.state)),
        }
    }

    /// Resume from a power-management suspend, if the backend supports it.
    pub fn resume(&mut self) -> Result<()> {
        self.expect_state(&[State::Suspended])?;
        self.ops.resume()?;
        self.state = State::Running;
        Ok(())
    }

    /// Move the application pointer back by up to `frames` without
    /// transferring data. Returns the frames actually rewound.
    pub fn rewind(&mut self, frames: u64) -> Result<u64> {
        self.expect_state(&[State::Prepared, State::Running])?;
        self.ops.rewind(frames)
    }

    /// Move the application pointer forward by up to `frames` without
    /// transferring data. Returns the frames actually skipped.
    pub fn forward(&mut self, frames: u64) -> Result<u64> {
        self.expect_state(&[State::Prepared, State::Running])?;
        self.ops.forward(frames)
    }

    /// Move the application pointer onto the hardware pointer, discarding
    /// queued-but-unplayed frames without stopping.
    pub fn reset(&mut self) -> Result<()> {
        self.expect_state(&[State::Prepared, State::Running, State::Xrun])?;
        self.ops.reset()
    }

    /// Refresh the hardware pointer and return the frames available for
    /// transfer right now. Detects threshold crossings: a running stream
    /// whose availability exceeds `stop_threshold` transitions to `Xrun`.
    pub fn avail_update(&mut self) -> Result<u64> {
        self.expect_state(&[
            State::Prepared,
            State::Running,
            State::Draining,
            State::Paused,
            State::Xrun,
        ])?;
        if self.state == State::Xrun {
            return Err(Error::Xrun);
        }
        let avail = match self.ops.avail_update() {
            Ok(avail) => avail,
            Err(Error::Suspended) => {
                self.state = State::Suspended;
                return Err(Error::Suspended);
            }
            // A decorated backend can see its slave xrun before our own
            // thresholds do.
            Err(Error::Xrun) => {
                self.state = State::Xrun;
                return Err(Error::Xrun);
            }
            Err(e) => return Err(e),
        };
        if let Some(sw) = &self.sw {
            // Strictly above: stop_threshold == buffer_size leaves an
            // exactly-empty ring legal, and stop_threshold == boundary
            // disables detection entirely.
            if matches!(self.state, State::Running | State::Draining) && avail > sw.stop_threshold
            {
                log::warn!(name = self.name.as_str(), avail,
                    stop_threshold = sw.stop_threshold; "xrun detected");
                self.state = State::Xrun;
                return Err(Error::Xrun);
            }
        }
        Ok(avail)
    }

    /// State, availability and trigger time in one call.
    pub fn status(&mut self) -> Result<Status> {
        let avail = match self.avail_update() {
            Ok(avail) => avail,
            Err(Error::Xrun) | Err(Error::Suspended) => {
                let ptr = self.ops.pointers();
                match self.direction {
                    Direction::Playback => ptr.playback_avail(),
                    Direction::Capture => ptr.capture_avail(),
                }
            }
            Err(e) => return Err(e),
        };
        Ok(Status {
            state: self.state,
            avail,
            trigger_time: self.trigger_time,
        })
    }

    /// Frames between the ring and the audible edge of the backend.
    pub fn delay(&mut self) -> Result<i64> {
        self.expect_state(&[State::Prepared, State::Running, State::Draining, State::Paused])?;
        self.ops.delay()
    }

    /// Block until at least `avail_min` frames are transferable or the
    /// timeout elapses. `None` waits forever, `Some(ZERO)` polls. A lapsed
    /// timeout is a normal `false` return, not an error.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.expect_state(&[State::Prepared, State::Running, State::Draining])?;
        self.ops.wait(timeout)
    }

    /// The handle's readiness descriptor for external event loops.
    pub fn poll_descriptor(&self) -> Option<PollDesc> {
        self.ops.poll_descriptor()
    }

    /// Write interleaved frames. See the transfer engine for the blocking
    /// and threshold semantics.
    pub fn writei(&mut self, buf: &[u8]) -> Result<u64> {
        transfer::writei(self, buf)
    }

    /// Write one buffer per channel.
    pub fn writen(&mut self, bufs: &[&[u8]]) -> Result<u64> {
        transfer::writen(self, bufs)
    }

    /// Read interleaved frames.
    pub fn readi(&mut self, buf: &mut [u8]) -> Result<u64> {
        transfer::readi(self, buf)
    }

    /// Read one buffer per channel.
    pub fn readn(&mut self, bufs: &mut [&mut [u8]]) -> Result<u64> {
        transfer::readn(self, bufs)
    }

    pub(crate) fn ops_mut(&mut self) -> &mut dyn PcmOps {
        self.ops.as_mut()
    }

    pub(crate) fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub(crate) fn note_frames_moved(&mut self, frames: u64) {
        if let Some(ts) = &mut self.trigger_time {
            *ts += frames;
        }
    }
}

impl Drop for Pcm {
    fn drop(&mut self) {
        // Force the stream to a stopped state before the backend goes away.
        if matches!(
            self.state,
            State::Running | State::Draining | State::Paused | State::Xrun
        ) {
            let _ = self.ops.drop_frames();
        }
    }
}

/// Grouped start/stop across several handles.
///
/// Linked handles share their trigger: validation runs over the whole
/// group before any member is touched, and the member calls are issued
/// back to back with no intervening wait point, so no observer sees a
/// half-started group.
pub struct SyncGroup<'a> {
    members: Vec<&'a mut Pcm>,
}

impl<'a> SyncGroup<'a> {
    /// Group the given handles.
    pub fn new(members: Vec<&'a mut Pcm>) -> Self {
        Self { members }
    }

    /// Start every member. Fails without side effects unless every member
    /// is `Prepared`.
    pub fn start(&mut self) -> Result<()> {
        for member in &self.members {
            if member.state() != State::Prepared {
                return Err(Error::BadState(member.state()));
            }
        }
        for member in &mut self.members {
            member.start()?;
        }
        Ok(())
    }

    /// Stop every member, discarding queued frames.
    pub fn drop_frames(&mut self) -> Result<()> {
        for member in &mut self.members {
            member.drop_frames()?;
        }
        Ok(())
    }

    /// Prepare every member.
    pub fn prepare(&mut self) -> Result<()> {
        for member in &mut self.members {
            member.prepare()?;
        }
        Ok(())
    }
}
