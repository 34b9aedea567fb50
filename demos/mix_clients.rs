use anyhow::Result;
use pcmflow::prelude::*;

/// A full buffer of a constant-amplitude square-ish tone, S16 interleaved.
fn burst(value: i16, frames: usize, channels: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frames * channels * 2);
    for frame in 0..frames {
        let sample = if frame % 64 < 32 { value } else { -value };
        for _ in 0..channels {
            buf.extend_from_slice(&sample.to_le_bytes());
        }
    }
    buf
}

fn main() -> Result<()> {
    env_logger::init();

    // Two independent clients mixed into one null sink by the share hub.
    let slave = Pcm::open("null", Box::new(NullPcm::new(Direction::Playback)));
    let hub = ShareHub::new(slave)?;
    let config = hub.config();
    println!(
        "hub mixing at {:?} {}ch {}Hz",
        config.format, config.channels, config.rate
    );

    let mut left = hub.client("tone-a");
    let mut right = hub.client("tone-b");
    for pcm in [&mut left, &mut right] {
        let mut params = HwParams::any();
        params.period_size.refine(&Interval::value(1024))?;
        params.periods.refine(&Interval::value(4))?;
        pcm.hw_params(&mut params)?;
        pcm.prepare()?;
        pcm.start()?;
    }

    for _ in 0..50 {
        left.writei(&burst(8_000, 1024, config.channels))?;
        right.writei(&burst(3_000, 1024, config.channels))?;
    }
    left.drain()?;
    right.drain()?;
    println!("both clients drained");
    Ok(())
}
