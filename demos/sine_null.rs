use anyhow::Result;
use pcmflow::mask::FormatMask;
use pcmflow::prelude::*;

fn main() -> Result<()> {
    env_logger::init();

    // A float sine source played onto a 16-bit null sink: the plug layer
    // inserts the format conversion.
    let slave = Pcm::open("null", Box::new(NullPcm::new(Direction::Playback)));
    let mut pcm = PlugPcm::open("plug:null", slave);

    let mut params = HwParams::any();
    params.format = FormatMask::single(SampleFormat::F32Le);
    params.channels.refine(&Interval::value(2))?;
    params.rate.refine(&Interval::value(48_000))?;
    params.period_size.refine(&Interval::value(1024))?;
    let config = pcm.hw_params(&mut params)?;
    println!(
        "negotiated {:?} {}ch {}Hz, buffer {} frames",
        config.format, config.channels, config.rate, config.buffer_size
    );

    pcm.prepare()?;
    pcm.start()?;

    let mut phase = 0.0f32;
    let step = 440.0 * std::f32::consts::TAU / config.rate as f32;
    for _ in 0..100 {
        let mut buf = Vec::with_capacity(1024 * config.frame_bytes());
        for _ in 0..1024 {
            let sample = (phase.sin() * 0.5).to_le_bytes();
            phase = (phase + step) % std::f32::consts::TAU;
            for _ in 0..config.channels {
                buf.extend_from_slice(&sample);
            }
        }
        pcm.writei(&buf)?;
    }
    println!("queued {} frames, draining", pcm.delay()?);
    pcm.drain()?;
    Ok(())
}
