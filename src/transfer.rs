//! The generic read/write engine shared by every backend.
//!
//! Transfers go through the backend's mmap protocol: look at the available
//! space, copy into (or out of) the ring areas at the application offset,
//! commit. The engine owns the policy knobs around that protocol: transfer
//! alignment, blocking, implicit start, partial counts on xrun, and the
//! proactive silence fill.

use crate::area::{copy_areas, silence_areas, Area};
use crate::format::SampleFormat;
use crate::params::{HwConfig, SwParams};
use crate::pcm::{Direction, Pcm, State};
use crate::{Error, Result};

/// Areas over a caller buffer the engine only reads from.
///
/// The pointer cast is sound because every access through the resulting
/// areas on the source side of a copy is a load.
fn const_interleaved(buf: &[u8], channels: usize, format: SampleFormat) -> Vec<Area<'_>> {
    let width = format.physical_width();
    (0..channels)
        .map(|ch| unsafe {
            Area::from_raw(buf.as_ptr() as *mut u8, buf.len(), ch * width, channels * width)
        })
        .collect()
}

fn const_channels<'a>(bufs: &'a [&'a [u8]], format: SampleFormat) -> Vec<Area<'a>> {
    let width = format.physical_width();
    bufs.iter()
        .map(|buf| unsafe { Area::from_raw(buf.as_ptr() as *mut u8, buf.len(), 0, width) })
        .collect()
}

fn mut_channels<'a>(bufs: &'a mut [&mut [u8]], format: SampleFormat) -> Vec<Area<'a>> {
    let width = format.physical_width();
    bufs.iter_mut()
        .map(|buf| unsafe { Area::from_raw(buf.as_mut_ptr(), buf.len(), 0, width) })
        .collect()
}

fn channel_frames(bufs: &[usize], frame_bytes: usize, channels: usize) -> Result<u64> {
    if bufs.len() != channels {
        return Err(Error::InvalidArgument("wrong number of channel buffers"));
    }
    let sample_bytes = frame_bytes / channels;
    let first = bufs[0];
    if bufs.iter().any(|&len| len != first) {
        return Err(Error::InvalidArgument("channel buffers differ in length"));
    }
    if first % sample_bytes != 0 {
        return Err(Error::InvalidArgument("buffer not a whole number of samples"));
    }
    Ok((first / sample_bytes) as u64)
}

fn setup(pcm: &mut Pcm, want: Direction) -> Result<(HwConfig, SwParams)> {
    if pcm.direction() != want {
        return Err(Error::InvalidArgument("transfer against stream direction"));
    }
    let config = *pcm.config().ok_or(Error::BadState(pcm.state()))?;
    let sw = *pcm.sw_config().ok_or(Error::BadState(pcm.state()))?;
    match pcm.state() {
        State::Prepared | State::Running => Ok((config, sw)),
        State::Draining if want == Direction::Capture => Ok((config, sw)),
        State::Xrun => Err(Error::Xrun),
        State::Suspended => Err(Error::Suspended),
        s => Err(Error::BadState(s)),
    }
}

/// On xrun or suspend mid-transfer the caller keeps what already moved.
fn partial(xfer: u64, err: Error) -> Result<u64> {
    match err {
        Error::Xrun | Error::Suspended if xfer > 0 => Ok(xfer),
        e => Err(e),
    }
}

fn maybe_start_playback(pcm: &mut Pcm, sw: &SwParams) -> Result<()> {
    if pcm.state() == State::Prepared
        && pcm.ops_mut().pointers().playback_hw_avail() >= sw.start_threshold
    {
        pcm.start()?;
    }
    Ok(())
}

/// Top up the silence run ahead of the application pointer once the queued
/// data drops to the threshold.
fn playback_silence(pcm: &mut Pcm, config: &HwConfig, sw: &SwParams) -> Result<()> {
    if sw.silence_size == 0 {
        return Ok(());
    }
    let ptr = pcm.ops_mut().pointers();
    if ptr.playback_hw_avail() > sw.silence_threshold {
        return Ok(());
    }
    let want = sw.silence_size.min(ptr.playback_avail());
    let mut filled = 0;
    let mut offset = ptr.appl_offset();
    while filled < want {
        let run = (ptr.buffer_size - offset).min(want - filled);
        let ring = pcm.ops_mut().mmap_areas()?;
        silence_areas(&ring, offset as usize, run as usize, config.format)?;
        filled += run;
        offset = (offset + run) % ptr.buffer_size;
    }
    Ok(())
}

fn write_areas(
    pcm: &mut Pcm,
    src: &[Area],
    frames: u64,
    config: &HwConfig,
    sw: &SwParams,
) -> Result<u64> {
    let frames = frames - frames % sw.xfer_align;
    let mut xfer: u64 = 0;
    while xfer < frames {
        let avail = match pcm.avail_update() {
            Ok(avail) => avail,
            Err(e) => return partial(xfer, e),
        };
        let remaining = frames - xfer;
        if avail == 0 || (avail < sw.avail_min && avail < remaining) {
            maybe_start_playback(pcm, sw)?;
            if pcm.state() == State::Prepared {
                // A full but unstarted ring cannot make progress by
                // waiting; hand the remainder back to the caller.
                return Ok(xfer);
            }
            if pcm.is_nonblock() {
                return if xfer > 0 { Ok(xfer) } else { Err(Error::WouldBlock) };
            }
            pcm.ops_mut().wait(None)?;
            continue;
        }
        let ptr = pcm.ops_mut().pointers();
        let offset = ptr.appl_offset();
        let chunk = remaining.min(avail).min(ptr.appl_run());
        {
            let ring = pcm.ops_mut().mmap_areas()?;
            copy_areas(
                &ring,
                offset as usize,
                src,
                xfer as usize,
                chunk as usize,
                config.format,
            )?;
        }
        let committed = pcm.ops_mut().mmap_commit(offset, chunk)?;
        pcm.note_frames_moved(committed);
        xfer += committed;
        maybe_start_playback(pcm, sw)?;
        playback_silence(pcm, config, sw)?;
    }
    Ok(xfer)
}

fn read_areas(
    pcm: &mut Pcm,
    dst: &[Area],
    frames: u64,
    config: &HwConfig,
    sw: &SwParams,
) -> Result<u64> {
    let frames = frames - frames % sw.xfer_align;
    if pcm.state() == State::Prepared && frames >= sw.start_threshold {
        pcm.start()?;
    }
    let mut xfer: u64 = 0;
    while xfer < frames {
        let avail = match pcm.avail_update() {
            Ok(avail) => avail,
            Err(e) => return partial(xfer, e),
        };
        let remaining = frames - xfer;
        let draining = pcm.state() == State::Draining;
        // A draining stream hands over whatever is left, below the wakeup
        // granule or not.
        if avail == 0 || (!draining && avail < sw.avail_min && avail < remaining) {
            if avail == 0 && draining {
                // The tail has been delivered; the drain completes here.
                pcm.ops_mut().drop_frames()?;
                *pcm.state_mut() = State::Setup;
                return Ok(xfer);
            }
            if pcm.state() == State::Prepared {
                return Ok(xfer);
            }
            if pcm.is_nonblock() {
                return if xfer > 0 { Ok(xfer) } else { Err(Error::WouldBlock) };
            }
            pcm.ops_mut().wait(None)?;
            continue;
        }
        let ptr = pcm.ops_mut().pointers();
        let offset = ptr.appl_offset();
        let chunk = remaining.min(avail).min(ptr.appl_run());
        {
            let ring = pcm.ops_mut().mmap_areas()?;
            copy_areas(
                dst,
                xfer as usize,
                &ring,
                offset as usize,
                chunk as usize,
                config.format,
            )?;
        }
        let committed = pcm.ops_mut().mmap_commit(offset, chunk)?;
        pcm.note_frames_moved(committed);
        xfer += committed;
    }
    Ok(xfer)
}

pub(crate) fn writei(pcm: &mut Pcm, buf: &[u8]) -> Result<u64> {
    let (config, sw) = setup(pcm, Direction::Playback)?;
    let frame_bytes = config.frame_bytes();
    if buf.len() % frame_bytes != 0 {
        return Err(Error::InvalidArgument("buffer not a whole number of frames"));
    }
    let frames = (buf.len() / frame_bytes) as u64;
    let src = const_interleaved(buf, config.channels, config.format);
    write_areas(pcm, &src, frames, &config, &sw)
}

pub(crate) fn writen(pcm: &mut Pcm, bufs: &[&[u8]]) -> Result<u64> {
    let (config, sw) = setup(pcm, Direction::Playback)?;
    let lens: Vec<usize> = bufs.iter().map(|b| b.len()).collect();
    let frames = channel_frames(&lens, config.frame_bytes(), config.channels)?;
    let src = const_channels(bufs, config.format);
    write_areas(pcm, &src, frames, &config, &sw)
}

pub(crate) fn readi(pcm: &mut Pcm, buf: &mut [u8]) -> Result<u64> {
    let (config, sw) = setup(pcm, Direction::Capture)?;
    let frame_bytes = config.frame_bytes();
    if buf.len() % frame_bytes != 0 {
        return Err(Error::InvalidArgument("buffer not a whole number of frames"));
    }
    let frames = (buf.len() / frame_bytes) as u64;
    let dst = Area::interleaved(buf, config.channels, config.format);
    read_areas(pcm, &dst, frames, &config, &sw)
}

pub(crate) fn readn(pcm: &mut Pcm, bufs: &mut [&mut [u8]]) -> Result<u64> {
    let (config, sw) = setup(pcm, Direction::Capture)?;
    let lens: Vec<usize> = bufs.iter().map(|b| b.len()).collect();
    let frames = channel_frames(&lens, config.frame_bytes(), config.channels)?;
    let dst = mut_channels(bufs, config.format);
    read_areas(pcm, &dst, frames, &config, &sw)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::mock::{mock_capture, mock_playback, MockHandle};
    use crate::params::HwParams;

    // The mock negotiates S16 stereo at 48 kHz with an 8192-frame ring.
    const FRAME_BYTES: usize = 4;
    const BUFFER: u64 = 8192;

    fn playback() -> (Pcm, MockHandle) {
        let (ops, handle) = mock_playback();
        let mut pcm = Pcm::open("mock", ops);
        pcm.hw_params(&mut HwParams::any()).unwrap();
        (pcm, handle)
    }

    fn capture() -> (Pcm, MockHandle) {
        let (ops, handle) = mock_capture();
        let mut pcm = Pcm::open("mock", ops);
        pcm.hw_params(&mut HwParams::any()).unwrap();
        (pcm, handle)
    }

    fn frames_of(frames: usize, fill: u8) -> Vec<u8> {
        vec![fill; frames * FRAME_BYTES]
    }

    #[test]
    fn implicit_start_at_threshold() {
        let (mut pcm, handle) = playback();
        assert_eq!(pcm.config().unwrap().buffer_size, BUFFER);
        let mut sw = *pcm.sw_config().unwrap();
        sw.start_threshold = 4096;
        pcm.sw_params(&sw).unwrap();
        pcm.prepare().unwrap();
        // Below the threshold nothing starts.
        assert_eq!(pcm.writei(&frames_of(4000, 1)).unwrap(), 4000);
        assert_eq!(pcm.state(), State::Prepared);
        assert!(!handle.is_running());
        // Crossing it triggers the stream mid-write.
        assert_eq!(pcm.writei(&frames_of(1000, 2)).unwrap(), 1000);
        assert_eq!(pcm.state(), State::Running);
        assert!(handle.is_running());
    }

    #[test]
    fn xfer_align_truncates() {
        let (mut pcm, _handle) = playback();
        let mut sw = *pcm.sw_config().unwrap();
        sw.xfer_align = 512;
        sw.start_threshold = sw.boundary;
        pcm.sw_params(&sw).unwrap();
        pcm.prepare().unwrap();
        assert_eq!(pcm.writei(&frames_of(1000, 1)).unwrap(), 512);
        assert_eq!(pcm.writei(&frames_of(511, 1)).unwrap(), 0);
    }

    #[test]
    fn full_unstarted_ring_returns_partial() {
        let (mut pcm, _handle) = playback();
        let mut sw = *pcm.sw_config().unwrap();
        sw.start_threshold = sw.boundary;
        pcm.sw_params(&sw).unwrap();
        pcm.prepare().unwrap();
        // More than the ring holds: the unstarted stream cannot drain it.
        assert_eq!(pcm.writei(&frames_of(10_000, 1)).unwrap(), BUFFER);
        assert_eq!(pcm.state(), State::Prepared);
    }

    #[test]
    fn nonblock_partial_then_would_block() {
        let (mut pcm, _handle) = playback();
        let mut sw = *pcm.sw_config().unwrap();
        sw.start_threshold = 1;
        sw.stop_threshold = sw.boundary;
        pcm.sw_params(&sw).unwrap();
        pcm.set_nonblock(true);
        pcm.prepare().unwrap();
        assert_eq!(pcm.writei(&frames_of(10_000, 1)).unwrap(), BUFFER);
        assert_eq!(pcm.state(), State::Running);
        assert!(matches!(
            pcm.writei(&frames_of(100, 1)),
            Err(Error::WouldBlock)
        ));
    }

    #[test]
    fn xrun_reported_before_any_transfer() {
        let (mut pcm, handle) = playback();
        let mut sw = *pcm.sw_config().unwrap();
        sw.start_threshold = sw.boundary;
        pcm.sw_params(&sw).unwrap();
        pcm.prepare().unwrap();
        pcm.writei(&frames_of(8192, 1)).unwrap();
        pcm.start().unwrap();
        // Device overruns the application pointer.
        handle.hw_advance(BUFFER + 1);
        assert!(matches!(pcm.writei(&frames_of(100, 1)), Err(Error::Xrun)));
        assert_eq!(pcm.state(), State::Xrun);
    }

    #[test]
    fn blocking_write_completes_when_space_appears() {
        let (mut pcm, handle) = playback();
        let mut sw = *pcm.sw_config().unwrap();
        sw.start_threshold = 1;
        sw.stop_threshold = sw.boundary;
        pcm.sw_params(&sw).unwrap();
        pcm.prepare().unwrap();
        assert_eq!(pcm.writei(&frames_of(8192, 1)).unwrap(), BUFFER);
        let feeder = {
            let handle = handle.clone();
            std::thread::spawn(move || {
                for _ in 0..4 {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    handle.hw_advance(1024);
                }
            })
        };
        // Needs 4096 frames of space that only the feeder thread creates.
        assert_eq!(pcm.writei(&frames_of(4096, 2)).unwrap(), 4096);
        feeder.join().unwrap();
        assert_eq!(pcm.state(), State::Running);
    }

    #[test]
    fn written_frames_land_at_the_application_offset() {
        let (mut pcm, handle) = playback();
        let mut sw = *pcm.sw_config().unwrap();
        sw.start_threshold = sw.boundary;
        pcm.sw_params(&sw).unwrap();
        pcm.prepare().unwrap();
        let data: Vec<u8> = (0..100 * FRAME_BYTES).map(|i| i as u8).collect();
        pcm.writei(&data).unwrap();
        let ring = handle.ring_snapshot();
        assert_eq!(&ring[..data.len()], &data[..]);
    }

    #[test]
    fn chunking_wraps_around_the_ring() {
        let (mut pcm, handle) = playback();
        let mut sw = *pcm.sw_config().unwrap();
        sw.start_threshold = sw.boundary;
        pcm.sw_params(&sw).unwrap();
        pcm.prepare().unwrap();
        // Park the application pointer 100 frames short of the wrap.
        pcm.writei(&frames_of((BUFFER - 100) as usize, 0)).unwrap();
        handle.hw_advance(BUFFER - 100);
        // This transfer spans the wrap: 100 frames at the tail, 150 at the
        // head.
        let data: Vec<u8> = (0..250 * FRAME_BYTES).map(|i| (i % 251) as u8).collect();
        assert_eq!(pcm.writei(&data).unwrap(), 250);
        let ring = handle.ring_snapshot();
        let tail_bytes = 100 * FRAME_BYTES;
        let split = (BUFFER as usize - 100) * FRAME_BYTES;
        assert_eq!(&ring[split..], &data[..tail_bytes]);
        assert_eq!(&ring[..150 * FRAME_BYTES], &data[tail_bytes..]);
    }

    #[test]
    fn silence_fill_runs_ahead_of_the_application_pointer() {
        let (mut pcm, handle) = playback();
        let mut sw = *pcm.sw_config().unwrap();
        sw.start_threshold = sw.boundary;
        sw.stop_threshold = sw.boundary;
        sw.silence_threshold = 4096;
        sw.silence_size = 1024;
        pcm.sw_params(&sw).unwrap();
        pcm.prepare().unwrap();
        // Dirty the whole ring, then rewind so it still holds the pattern.
        pcm.writei(&frames_of(BUFFER as usize, 0xff)).unwrap();
        assert_eq!(pcm.rewind(BUFFER).unwrap(), BUFFER);
        pcm.start().unwrap();
        pcm.writei(&frames_of(100, 0x11)).unwrap();
        let ring = handle.ring_snapshot();
        // Queued data, then the silence run, then untouched pattern.
        assert!(ring[..100 * FRAME_BYTES].iter().all(|&b| b == 0x11));
        assert!(ring[100 * FRAME_BYTES..1124 * FRAME_BYTES]
            .iter()
            .all(|&b| b == 0));
        assert!(ring[1124 * FRAME_BYTES..1200 * FRAME_BYTES]
            .iter()
            .all(|&b| b == 0xff));
    }

    #[test]
    fn capture_read_returns_fed_data() {
        let (mut pcm, handle) = capture();
        let mut sw = *pcm.sw_config().unwrap();
        sw.start_threshold = 512;
        pcm.sw_params(&sw).unwrap();
        pcm.prepare().unwrap();
        let data: Vec<u8> = (0..1024 * FRAME_BYTES).map(|i| (i % 256) as u8).collect();
        handle.feed(&data);
        let mut buf = vec![0u8; 1024 * FRAME_BYTES];
        // The request is past the start threshold: reading starts the
        // stream.
        assert_eq!(pcm.readi(&mut buf).unwrap(), 1024);
        assert_eq!(pcm.state(), State::Running);
        assert_eq!(buf, data);
    }

    #[test]
    fn capture_drain_delivers_the_tail() {
        let (mut pcm, handle) = capture();
        let mut sw = *pcm.sw_config().unwrap();
        sw.start_threshold = sw.boundary;
        pcm.sw_params(&sw).unwrap();
        pcm.prepare().unwrap();
        pcm.start().unwrap();
        handle.feed(&frames_of(1000, 7));
        pcm.drain().unwrap();
        assert_eq!(pcm.state(), State::Draining);
        let mut buf = vec![0u8; 2000 * FRAME_BYTES];
        assert_eq!(pcm.readi(&mut buf).unwrap(), 1000);
        assert_eq!(pcm.state(), State::Setup);
        assert!(buf[..1000 * FRAME_BYTES].iter().all(|&b| b == 7));
    }

    #[test]
    fn noninterleaved_write_interleaves_into_the_ring() {
        let (mut pcm, handle) = playback();
        let mut sw = *pcm.sw_config().unwrap();
        sw.start_threshold = sw.boundary;
        pcm.sw_params(&sw).unwrap();
        pcm.prepare().unwrap();
        let left = [0x01u8, 0x02, 0x03, 0x04]; // two s16 samples
        let right = [0x11u8, 0x12, 0x13, 0x14];
        assert_eq!(pcm.writen(&[&left, &right]).unwrap(), 2);
        let ring = handle.ring_snapshot();
        assert_eq!(
            &ring[..16],
            &[
                0x01, 0x02, 0x11, 0x12, // frame 0
                0x03, 0x04, 0x13, 0x14, // frame 1
                0, 0, 0, 0, 0, 0, 0, 0, // untouched
            ]
        );
    }
}
