//! The file tee: a transparent decorator that forwards every operation to
//! its slave and appends each committed span of frames to a byte sink.
//!
//! The written stream is raw interleaved frames in the negotiated format;
//! on capture the teed span is what the application consumed, so both
//! directions produce the same kind of file.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use crate::area::{copy_areas, Area};
use crate::params::{HwConfig, HwParams, SwParams};
use crate::pcm::{Direction, Pcm, PcmOps};
use crate::poll::PollDesc;
use crate::ring::RingPointers;
use crate::Result;

/// A PCM backend that records everything passing through it.
pub struct FilePcm {
    slave: Box<dyn PcmOps>,
    sink: Box<dyn Write + Send>,
    config: Option<HwConfig>,
}

impl FilePcm {
    /// Tee the given slave into an arbitrary sink.
    pub fn new(slave: Box<dyn PcmOps>, sink: Box<dyn Write + Send>) -> Self {
        Self {
            slave,
            sink,
            config: None,
        }
    }

    /// Tee into a newly created file at `path`.
    pub fn create(slave: Box<dyn PcmOps>, path: impl AsRef<Path>) -> io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(Self::new(slave, Box::new(file)))
    }

    /// Convenience: wrap and return the ready-to-configure handle.
    pub fn open(name: impl Into<String>, slave: Box<dyn PcmOps>, sink: Box<dyn Write + Send>) -> Pcm {
        Pcm::open(name, Box::new(Self::new(slave, sink)))
    }

    /// Append the span at `offset` of the slave ring to the sink,
    /// re-interleaving if the slave ring is planar.
    fn tee(&mut self, offset: u64, frames: u64) -> Result<()> {
        let config = match self.config {
            Some(config) => config,
            None => return Ok(()),
        };
        let mut tmp = vec![0u8; frames as usize * config.frame_bytes()];
        {
            let dst = Area::interleaved(&mut tmp, config.channels, config.format);
            let src = self.slave.mmap_areas()?;
            copy_areas(&dst, 0, &src, offset as usize, frames as usize, config.format)?;
        }
        self.sink.write_all(&tmp)?;
        Ok(())
    }
}

impl Drop for FilePcm {
    fn drop(&mut self) {
        let _ = self.sink.flush();
    }
}

impl PcmOps for FilePcm {
    fn direction(&self) -> Direction {
        self.slave.direction()
    }

    fn hw_refine(&self, params: &mut HwParams) -> Result<()> {
        self.slave.hw_refine(params)
    }

    fn hw_params(&mut self, config: &HwConfig) -> Result<()> {
        self.slave.hw_params(config)?;
        self.config = Some(*config);
        Ok(())
    }

    fn hw_free(&mut self) -> Result<()> {
        self.config = None;
        self.slave.hw_free()
    }

    fn sw_params(&mut self, sw: &SwParams) -> Result<()> {
        self.slave.sw_params(sw)
    }

    fn prepare(&mut self) -> Result<()> {
        self.slave.prepare()
    }

    fn reset(&mut self) -> Result<()> {
        self.slave.reset()
    }

    fn start(&mut self) -> Result<()> {
        self.slave.start()
    }

    fn drop_frames(&mut self) -> Result<()> {
        self.sink.flush()?;
        self.slave.drop_frames()
    }

    fn pause(&mut self, enable: bool) -> Result<()> {
        self.slave.pause(enable)
    }

    fn resume(&mut self) -> Result<()> {
        self.slave.resume()
    }

    fn avail_update(&mut self) -> Result<u64> {
        self.slave.avail_update()
    }

    fn pointers(&self) -> RingPointers {
        self.slave.pointers()
    }

    fn rewind(&mut self, frames: u64) -> Result<u64> {
        self.slave.rewind(frames)
    }

    fn forward(&mut self, frames: u64) -> Result<u64> {
        self.slave.forward(frames)
    }

    fn mmap_areas(&mut self) -> Result<Vec<Area<'_>>> {
        self.slave.mmap_areas()
    }

    fn mmap_commit(&mut self, offset: u64, frames: u64) -> Result<u64> {
        // Record before forwarding: a null-style slave consumes the span
        // the moment it commits.
        self.tee(offset, frames)?;
        self.slave.mmap_commit(offset, frames)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.slave.wait(timeout)
    }

    fn poll_descriptor(&self) -> Option<PollDesc> {
        self.slave.poll_descriptor()
    }

    fn delay(&mut self) -> Result<i64> {
        self.slave.delay()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::null::NullPcm;
    use crate::format::SampleFormat;
    use crate::mask::FormatMask;
    use crate::params::Interval;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn open_tee(direction: Direction) -> (Pcm, SharedSink) {
        let sink = SharedSink(Arc::new(Mutex::new(Vec::new())));
        let slave = Box::new(NullPcm::new(direction));
        let mut pcm = FilePcm::open("file", slave, Box::new(sink.clone()));
        let mut params = HwParams::any();
        params.format = FormatMask::single(SampleFormat::S16Le);
        params.channels.refine(&Interval::value(2)).unwrap();
        params.rate.refine(&Interval::value(48_000)).unwrap();
        params.period_size.refine(&Interval::value(1024)).unwrap();
        params.periods.refine(&Interval::value(4)).unwrap();
        pcm.hw_params(&mut params).unwrap();
        pcm.prepare().unwrap();
        (pcm, sink)
    }

    #[test]
    fn playback_bytes_land_in_the_sink() {
        let (mut pcm, sink) = open_tee(Direction::Playback);
        pcm.start().unwrap();
        let buf: Vec<u8> = (0..512 * 4).map(|i| (i % 241) as u8).collect();
        assert_eq!(pcm.writei(&buf).unwrap(), 512);
        assert_eq!(*sink.0.lock().unwrap(), buf);
    }

    #[test]
    fn wrapped_writes_are_recorded_in_order() {
        let (mut pcm, sink) = open_tee(Direction::Playback);
        pcm.start().unwrap();
        // 3000-frame writes leave the commit point mid-ring, so the second
        // write splits at the ring edge; the null slave consumes instantly
        // so nothing blocks.
        let mut expected = Vec::new();
        for round in 0u8..3 {
            let buf = vec![round + 1; 3000 * 4];
            assert_eq!(pcm.writei(&buf).unwrap(), 3000);
            expected.extend_from_slice(&buf);
        }
        assert_eq!(*sink.0.lock().unwrap(), expected);
    }

    #[test]
    fn consumed_capture_frames_are_recorded() {
        let (mut pcm, sink) = open_tee(Direction::Capture);
        pcm.start().unwrap();
        let mut buf = vec![0xaau8; 256 * 4];
        assert_eq!(pcm.readi(&mut buf).unwrap(), 256);
        let recorded = sink.0.lock().unwrap();
        // The null source delivers silence, and that is what was consumed.
        assert_eq!(recorded.len(), 256 * 4);
        assert!(recorded.iter().all(|&b| b == 0));
    }
}
