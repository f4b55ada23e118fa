//! WAV file loading, writing and sample math for the pipeline.
//!
//! All stage code works on `f32` mono buffers; files on disk are 16-bit PCM.
//! Arbitrary sample rates and channel counts are accepted on load and
//! down-mixed/resampled as needed.

use crate::error::{RedubError, Result};
use std::path::Path;

/// A mono audio buffer together with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// An all-silence buffer of the given duration.
    pub fn silence(duration_s: f64, sample_rate: u32) -> Self {
        let len = (duration_s * sample_rate as f64).round() as usize;
        Self {
            samples: vec![0.0; len],
            sample_rate,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Slice of the buffer covering `[start_s, end_s)`, clamped to bounds.
    pub fn slice_seconds(&self, start_s: f64, end_s: f64) -> &[f32] {
        let start = ((start_s * self.sample_rate as f64) as usize).min(self.samples.len());
        let end = ((end_s * self.sample_rate as f64) as usize)
            .max(start)
            .min(self.samples.len());
        &self.samples[start..end]
    }

    /// Resample to `target_rate`, returning a new buffer if rates differ.
    pub fn resampled(&self, target_rate: u32) -> AudioBuffer {
        if self.sample_rate == target_rate {
            return self.clone();
        }
        AudioBuffer {
            samples: resample(&self.samples, self.sample_rate, target_rate),
            sample_rate: target_rate,
        }
    }
}

/// Load a WAV file as mono f32 at its native sample rate.
///
/// Stereo files are down-mixed by channel averaging; integer formats are
/// scaled into [-1.0, 1.0].
pub fn load(path: &Path) -> Result<AudioBuffer> {
    let mut reader = hound::WavReader::open(path).map_err(|e| match e {
        hound::Error::IoError(io) => RedubError::Io(io),
        other => RedubError::Wav(other),
    })?;
    let spec = reader.spec();
    let channels = spec.channels as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    let samples = if channels > 1 {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        interleaved
    };

    Ok(AudioBuffer {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Load a WAV file resampled to `target_rate` mono.
pub fn load_resampled(path: &Path, target_rate: u32) -> Result<AudioBuffer> {
    Ok(load(path)?.resampled(target_rate))
}

/// Write a mono f32 buffer as 16-bit PCM WAV.
pub fn save(path: &Path, buffer: &AudioBuffer) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in &buffer.samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer.write_sample((clamped * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Duration of a WAV file in seconds, read from the header.
pub fn duration_seconds(path: &Path) -> Result<f64> {
    let reader = hound::WavReader::open(path).map_err(|e| match e {
        hound::Error::IoError(io) => RedubError::Io(io),
        other => RedubError::Wav(other),
    })?;
    let spec = reader.spec();
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

/// Simple linear interpolation resampling.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let src_pos = i as f64 * ratio;
            let idx = src_pos as usize;
            let frac = (src_pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

/// Root-mean-square level of a sample slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Convert a decibel value to a linear gain factor.
pub fn db_to_gain(db: f64) -> f32 {
    10f64.powf(db / 20.0) as f32
}

/// Apply a linear fade-out over the final `fade_samples` samples.
pub fn apply_fade_out(samples: &mut [f32], fade_samples: usize) {
    let len = samples.len();
    if len == 0 || fade_samples == 0 {
        return;
    }
    let fade = fade_samples.min(len);
    let start = len - fade;
    for (i, sample) in samples[start..].iter_mut().enumerate() {
        let gain = 1.0 - (i as f32 + 1.0) / fade as f32;
        *sample *= gain;
    }
}
