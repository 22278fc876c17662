use crate::audio::{DecodedAudio, resample, shared_buffer};
use anyhow::Context;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Lets the device drain its last buffer after the ring runs dry.
const DRAIN_TAIL: Duration = Duration::from_millis(150);

/// Plays a clip on `device` and blocks until it ends or `stop` is raised.
///
/// cpal streams are not `Send`, so this is meant for a dedicated thread.
pub fn play_blocking(
    device: &Device,
    clip: &DecodedAudio,
    rate: f32,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    let output_config = device
        .default_output_config()
        .context("Failed to get default output config")?;
    let output_config = StreamConfig {
        channels: output_config.channels(),
        sample_rate: output_config.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };
    let output_channel_count = output_config.channels.max(1) as usize;
    let output_sample_rate = output_config.sample_rate.0 as f64;
    tracing::debug!("Output stream config: {:?}", &output_config);

    let samples = resample(
        &clip.samples,
        clip.sample_rate as f64 * rate as f64,
        output_sample_rate,
    )?;
    let (mut audio_out_tx, mut audio_out_rx) = shared_buffer(samples.len()).split();
    audio_out_tx.push_slice(&samples);

    let drained = Arc::new(AtomicBool::new(false));
    let drained_flag = drained.clone();
    let output_data_fn = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
        for frame in data.chunks_mut(output_channel_count) {
            let sample = audio_out_rx.try_pop().unwrap_or(0.0);
            frame.fill(sample);
        }
        if audio_out_rx.is_empty() {
            drained_flag.store(true, Ordering::SeqCst);
        }
    };

    let output_stream = device.build_output_stream(
        &output_config,
        output_data_fn,
        move |err| tracing::error!("An error occurred on output stream: {}", err),
        None,
    )?;
    output_stream.play()?;

    while !stop.load(Ordering::SeqCst) {
        if drained.load(Ordering::SeqCst) {
            std::thread::sleep(DRAIN_TAIL);
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    drop(output_stream);
    Ok(())
}
