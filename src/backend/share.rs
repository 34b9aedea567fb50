//! Software mixing: many independent playback clients funnelled into one
//! slave PCM by a background mixer thread.
//!
//! A [`ShareHub`] owns the slave and the thread; each client it hands out
//! is an ordinary [`Pcm`] with its own ring, pointers and state machine.
//! The mixer repeatedly takes the frames every running client has queued,
//! sums them with saturation into signed 16-bit, writes the mix to the
//! slave, and advances the contributing clients' hardware pointers. A
//! running client with nothing queued is skipped rather than stalling the
//! others, so its later frames simply land later in the mix.
//!
//! The hub must outlive its clients' activity: dropping it stops the mixer
//! thread, after which queued client frames are never consumed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::area::Area;
use crate::format::SampleFormat;
use crate::mask::FormatMask;
use crate::params::{HwConfig, HwParams, Interval, SwParams};
use crate::pcm::{Direction, Pcm, PcmOps};
use crate::poll::{PollDesc, Waiter};
use crate::ring::RingPointers;
use crate::{Error, Result};

struct Slot {
    ring: Vec<u8>,
    ptr: RingPointers,
    sw: Option<SwParams>,
    running: bool,
    // Pipe pair signalling mixer-side consumption to external pollers.
    #[cfg(unix)]
    trigger: Option<(crate::poll::Sender, crate::poll::Receiver)>,
}

impl Slot {
    fn queued(&self) -> u64 {
        self.ptr.playback_hw_avail()
    }
}

struct HubState {
    clients: HashMap<usize, Slot>,
    next_id: usize,
    stop: bool,
}

struct Shared {
    state: Mutex<HubState>,
    waiter: Waiter,
    /// The slave's negotiated configuration; clients are pinned to its
    /// format, channel count and rate.
    config: HwConfig,
}

/// The owner of one shared slave and the mixer thread feeding it.
pub struct ShareHub {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl ShareHub {
    /// Negotiate the slave for signed 16-bit and spawn the mixer.
    pub fn new(mut slave: Pcm) -> Result<Self> {
        if slave.direction() != Direction::Playback {
            return Err(Error::Unsupported("share mixing of capture streams"));
        }
        let mut params = HwParams::any();
        params.format = FormatMask::single(SampleFormat::S16Le);
        let config = slave.hw_params(&mut params)?;
        slave.prepare()?;
        let shared = Arc::new(Shared {
            state: Mutex::new(HubState {
                clients: HashMap::new(),
                next_id: 0,
                stop: false,
            }),
            waiter: Waiter::default(),
            config,
        });
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("pcmflow-mixer".into())
            .spawn(move || mixer_loop(thread_shared, slave))
            .map_err(Error::Io)?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// The configuration every client is pinned to.
    pub fn config(&self) -> HwConfig {
        self.shared.config
    }

    /// Open a new client handle on this hub.
    pub fn client(&self, name: impl Into<String>) -> Pcm {
        self.client_inner(name, None)
    }

    fn client_inner(&self, name: impl Into<String>, keep: Option<Arc<ShareHub>>) -> Pcm {
        let id = {
            let mut state = self.shared.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.clients.insert(
                id,
                Slot {
                    ring: Vec::new(),
                    ptr: RingPointers::new(0),
                    sw: None,
                    running: false,
                    #[cfg(unix)]
                    trigger: None,
                },
            );
            id
        };
        Pcm::open(
            name,
            Box::new(SharePcm {
                shared: self.shared.clone(),
                id,
                config: None,
                _hub: keep,
            }),
        )
    }
}

/// Ownership of mixing hubs by slave identity: the first client open for a
/// name builds the hub, later opens join it, and the hub (with its mixer
/// thread) is torn down when the last client handle drops.
#[derive(Default)]
pub struct ShareRegistry {
    hubs: Mutex<HashMap<String, Weak<ShareHub>>>,
}

impl ShareRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a client on the hub for `slave_name`, calling `open_slave`
    /// only when no hub for that name is currently alive.
    pub fn client(
        &self,
        slave_name: &str,
        client_name: impl Into<String>,
        open_slave: impl FnOnce() -> Result<Pcm>,
    ) -> Result<Pcm> {
        let mut hubs = self.hubs.lock().unwrap();
        let hub = match hubs.get(slave_name).and_then(Weak::upgrade) {
            Some(hub) => hub,
            None => {
                let hub = Arc::new(ShareHub::new(open_slave()?)?);
                hubs.insert(slave_name.to_string(), Arc::downgrade(&hub));
                hub
            }
        };
        let keep = hub.clone();
        Ok(hub.client_inner(client_name, Some(keep)))
    }
}

impl Drop for ShareHub {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().stop = true;
        self.shared.waiter.notify();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Sum `samples` into the accumulator.
fn accumulate(acc: &mut [i32], samples: &[i16]) {
    for (a, &s) in acc.iter_mut().zip(samples) {
        *a += s as i32;
    }
}

/// Clamp the accumulator to the signed 16-bit rails and serialize it.
fn clamp_out(acc: &[i32], out: &mut Vec<u8>) {
    out.clear();
    for &a in acc {
        let s = a.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        out.extend_from_slice(&s.to_le_bytes());
    }
}

fn mixer_loop(shared: Arc<Shared>, mut slave: Pcm) {
    let channels = shared.config.channels;
    let period = shared.config.period_size as usize;
    let mut acc = vec![0i32; period * channels];
    let mut out = Vec::with_capacity(period * channels * 2);
    loop {
        shared.waiter.wait_until(None, || {
            let state = shared.state.lock().unwrap();
            state.stop
                || state
                    .clients
                    .values()
                    .any(|slot| slot.running && slot.queued() > 0)
        });
        let mixed = {
            let mut state = shared.state.lock().unwrap();
            if state.stop {
                return;
            }
            let ready = state
                .clients
                .values()
                .filter(|slot| slot.running && slot.queued() > 0)
                .map(|slot| slot.queued())
                .min();
            match ready {
                // The queued data went away (client dropped or stopped)
                // between the wakeup and the lock.
                None => false,
                Some(min_queued) => {
                    let frames = (min_queued as usize).min(period);
                    let acc = &mut acc[..frames * channels];
                    acc.fill(0);
                    let frame_bytes = channels * 2;
                    for slot in state
                        .clients
                        .values_mut()
                        .filter(|slot| slot.running && slot.queued() >= frames as u64)
                    {
                        let buffer = slot.ptr.buffer_size as usize;
                        for frame in 0..frames {
                            let at =
                                (slot.ptr.hw_offset() as usize + frame) % buffer * frame_bytes;
                            for ch in 0..channels {
                                let sample = i16::from_le_bytes([
                                    slot.ring[at + ch * 2],
                                    slot.ring[at + ch * 2 + 1],
                                ]);
                                acc[frame * channels + ch] += sample as i32;
                            }
                        }
                        slot.ptr.hw_forward(frames as u64);
                        #[cfg(unix)]
                        if let Some((sender, _)) = &slot.trigger {
                            let _ = sender.trigger();
                        }
                    }
                    clamp_out(acc, &mut out);
                    true
                }
            }
        };
        if mixed {
            shared.waiter.notify();
            // The slave paces the loop; its ring backpressure is the
            // mixer's clock.
            if let Err(e) = slave.writei(&out) {
                log::warn!(err:? = e; "mixer slave write failed, re-preparing");
                if slave.prepare().is_err() {
                    return;
                }
            }
        }
    }
}

/// One playback client of a [`ShareHub`].
pub struct SharePcm {
    shared: Arc<Shared>,
    id: usize,
    config: Option<HwConfig>,
    // Keeps a registry-owned hub (and its mixer thread) alive for as long
    // as any client handle exists.
    _hub: Option<Arc<ShareHub>>,
}

impl SharePcm {
    fn with_slot<T>(&self, f: impl FnOnce(&mut Slot) -> T) -> T {
        let mut state = self.shared.state.lock().unwrap();
        let slot = state.clients.get_mut(&self.id).expect("client slot missing");
        f(slot)
    }
}

impl Drop for SharePcm {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().clients.remove(&self.id);
        self.shared.waiter.notify();
    }
}

impl PcmOps for SharePcm {
    fn direction(&self) -> Direction {
        Direction::Playback
    }

    fn hw_refine(&self, params: &mut HwParams) -> Result<()> {
        // The mix happens in the slave's exact shape; a client wanting
        // something else stacks a plug on top.
        let config = self.shared.config;
        params.format.intersect(&FormatMask::single(config.format));
        if params.format.is_empty() {
            return Err(Error::Negotiation("share clients use the slave format"));
        }
        params.channels.refine(&Interval::value(config.channels as u64))?;
        params.rate.refine(&Interval::value(config.rate))?;
        params.period_size.refine(&Interval::range(16, 1 << 16))?;
        params.periods.refine(&Interval::range(2, 32))?;
        Ok(())
    }

    fn hw_params(&mut self, config: &HwConfig) -> Result<()> {
        self.with_slot(|slot| {
            slot.ring = vec![0; config.buffer_size as usize * config.frame_bytes()];
            slot.ptr = RingPointers::new(config.buffer_size);
            slot.running = false;
            #[cfg(unix)]
            {
                slot.trigger = crate::poll::trigger().ok();
            }
        });
        self.config = Some(*config);
        Ok(())
    }

    fn hw_free(&mut self) -> Result<()> {
        self.with_slot(|slot| {
            slot.ring = Vec::new();
            slot.sw = None;
        });
        self.config = None;
        Ok(())
    }

    fn sw_params(&mut self, sw: &SwParams) -> Result<()> {
        self.with_slot(|slot| slot.sw = Some(*sw));
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        self.with_slot(|slot| {
            slot.ptr.reset();
            slot.running = false;
            slot.ring.fill(0);
        });
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.with_slot(|slot| slot.ptr.appl_ptr = slot.ptr.hw_ptr);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.with_slot(|slot| slot.running = true);
        self.shared.waiter.notify();
        Ok(())
    }

    fn drop_frames(&mut self) -> Result<()> {
        self.with_slot(|slot| {
            slot.running = false;
            // Queued frames are discarded, not mixed.
            slot.ptr.appl_ptr = slot.ptr.hw_ptr;
        });
        Ok(())
    }

    fn avail_update(&mut self) -> Result<u64> {
        Ok(self.with_slot(|slot| {
            #[cfg(unix)]
            if let Some((_, receiver)) = &slot.trigger {
                // Drain any pending wakeups so the descriptor re-arms.
                while receiver.consume().unwrap_or(false) {}
            }
            slot.ptr.playback_avail()
        }))
    }

    fn pointers(&self) -> RingPointers {
        self.with_slot(|slot| slot.ptr)
    }

    fn rewind(&mut self, frames: u64) -> Result<u64> {
        Ok(self.with_slot(|slot| {
            let frames = frames.min(slot.ptr.playback_hw_avail());
            slot.ptr.appl_backward(frames);
            frames
        }))
    }

    fn forward(&mut self, frames: u64) -> Result<u64> {
        Ok(self.with_slot(|slot| {
            let frames = frames.min(slot.ptr.playback_avail());
            slot.ptr.appl_forward(frames);
            frames
        }))
    }

    fn mmap_areas(&mut self) -> Result<Vec<Area<'_>>> {
        let config = self
            .config
            .ok_or(Error::InvalidArgument("client not configured"))?;
        let (base, bytes) = self.with_slot(|slot| (slot.ring.as_mut_ptr(), slot.ring.len()));
        let width = config.format.physical_width();
        // The slot ring only reallocates in hw_params, so the raw views
        // stay valid for this borrow; the mixer reads the hardware side
        // while the application fills the other.
        Ok((0..config.channels)
            .map(|ch| unsafe {
                Area::from_raw(base, bytes, ch * width, config.channels * width)
            })
            .collect())
    }

    fn mmap_commit(&mut self, offset: u64, frames: u64) -> Result<u64> {
        self.with_slot(|slot| {
            if offset != slot.ptr.appl_offset() {
                return Err(Error::InvalidArgument("commit offset out of sync"));
            }
            slot.ptr.appl_forward(frames);
            Ok(())
        })?;
        self.shared.waiter.notify();
        Ok(frames)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let shared = &self.shared;
        let id = self.id;
        Ok(shared.waiter.wait_until(timeout, || {
            let state = shared.state.lock().unwrap();
            match state.clients.get(&id) {
                Some(slot) => {
                    let avail_min = slot.sw.map(|sw| sw.avail_min).unwrap_or(1);
                    slot.ptr.playback_avail() >= avail_min
                }
                None => true,
            }
        }))
    }

    fn poll_descriptor(&self) -> Option<PollDesc> {
        #[cfg(unix)]
        return self.with_slot(|slot| {
            slot.trigger.as_ref().map(|(_, receiver)| PollDesc {
                fd: receiver.as_raw_fd(),
                events: crate::poll::PollEvents::Out,
            })
        });
        #[cfg(not(unix))]
        None
    }

    fn delay(&mut self) -> Result<i64> {
        Ok(self.with_slot(|slot| slot.ptr.playback_hw_avail()) as i64)
    }
}
