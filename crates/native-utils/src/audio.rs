use hound::{SampleFormat, WavReader};
use ringbuf::HeapRb;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::io::Cursor;

/// Frames fed to the resampler per call.
pub const RESAMPLE_CHUNK_SIZE: usize = 1024;

/// A decoded clip, downmixed to mono.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Decodes a WAV file held in memory into mono f32 samples.
pub fn decode_wav(bytes: &[u8]) -> anyhow::Result<DecodedAudio> {
    let reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|sample| sample.map(|v| (v as f32 / scale).clamp(-1.0, 1.0)))
                .collect::<Result<_, _>>()?
        }
    };

    let samples = if channels > 1 {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    } else {
        interleaved
    };
    tracing::debug!(
        "Decoded {} samples at {}hz ({}ch)",
        samples.len(),
        spec.sample_rate,
        channels
    );

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Splits samples into fixed-size chunks, zero-padding the last one.
pub fn split_for_chunks(samples: &[f32], chunk_size: usize) -> Vec<Vec<f32>> {
    samples
        .chunks(chunk_size)
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            chunk.resize(chunk_size, 0.0);
            chunk
        })
        .collect()
}

/// Resamples a whole mono clip.
///
/// Playback speed is applied by claiming a higher or lower source rate, so a
/// clip played at 1.5x is resampled from `rate * 1.5`.
pub fn resample(samples: &[f32], from_rate: f64, to_rate: f64) -> anyhow::Result<Vec<f32>> {
    if (from_rate - to_rate).abs() < f64::EPSILON {
        return Ok(samples.to_vec());
    }
    let mut resampler = create_resampler(from_rate, to_rate, RESAMPLE_CHUNK_SIZE)?;
    let chunk_size = resampler.input_frames_next();

    let mut resampled = Vec::with_capacity((samples.len() as f64 * to_rate / from_rate) as usize);
    for chunk in split_for_chunks(samples, chunk_size) {
        let frames = resampler.process(&[chunk.as_slice()], None)?;
        if let Some(channel) = frames.into_iter().next() {
            resampled.extend(channel);
        }
    }
    Ok(resampled)
}

/// Creates a new ring buffer on the heap for shared audio data.
pub fn shared_buffer(size: usize) -> HeapRb<f32> {
    HeapRb::new(size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn wav_bytes(channels: u16, frames: &[[i16; 2]]) -> Vec<u8> {
        let spec = WavSpec {
            channels,
            sample_rate: 24_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for frame in frames {
                for sample in frame.iter().take(channels as usize) {
                    writer.write_sample(*sample).unwrap();
                }
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn mono_pcm16_is_normalized() {
        let bytes = wav_bytes(1, &[[16_384, 0], [-32_768, 0]]);

        let decoded = decode_wav(&bytes).unwrap();

        assert_eq!(decoded.sample_rate, 24_000);
        assert_eq!(decoded.samples, vec![0.5, -1.0]);
    }

    #[test]
    fn stereo_is_downmixed() {
        let bytes = wav_bytes(2, &[[16_384, 0], [8_192, 8_192]]);

        let decoded = decode_wav(&bytes).unwrap();

        assert_eq!(decoded.samples, vec![0.25, 0.25]);
    }

    #[test]
    fn garbage_is_not_a_wav() {
        assert!(decode_wav(b"definitely not audio").is_err());
    }

    #[test]
    fn chunks_are_zero_padded() {
        let chunks = split_for_chunks(&[1.0, 2.0, 3.0], 2);
        assert_eq!(chunks, vec![vec![1.0, 2.0], vec![3.0, 0.0]]);
    }

    #[test]
    fn doubling_the_rate_roughly_doubles_the_length() {
        let samples = vec![0.1; 4800];

        let resampled = resample(&samples, 24_000.0, 48_000.0).unwrap();

        assert!(resampled.len() >= 9600 && resampled.len() <= 10_400);
    }

    #[test]
    fn same_rate_is_a_copy() {
        let samples = vec![0.1, 0.2];
        assert_eq!(resample(&samples, 16_000.0, 16_000.0).unwrap(), samples);
    }
}
