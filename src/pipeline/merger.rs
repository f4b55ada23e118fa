//! Stage 8: deterministic placement of cloned segments into the final
//! voice track.
//!
//! The output track has exactly the length of the original vocals. Clones
//! are placed at their segment's start, compressed through the media tool
//! only when they exceed `target * max_stretch`, shifted forward to repair
//! overlap, level-matched against the original vocals and faded at the
//! tail. Identical inputs produce byte-identical output.

use crate::audio::wav::{self, AudioBuffer};
use crate::config::MergerConfig;
use crate::defaults;
use crate::engines::TimeStretcher;
use crate::error::Result;
use crate::segment::SegmentTable;
use std::sync::Arc;
use tracing::{debug, warn};

/// Output of a merge: the final track plus human-readable warnings that get
/// aggregated into the task message.
#[derive(Debug)]
pub struct MergeResult {
    pub track: AudioBuffer,
    pub warnings: Vec<String>,
}

pub struct Merger {
    config: MergerConfig,
    stretcher: Arc<dyn TimeStretcher>,
}

impl Merger {
    pub fn new(config: MergerConfig, stretcher: Arc<dyn TimeStretcher>) -> Self {
        Self { config, stretcher }
    }

    /// Build the final voice track for `table` over the original `vocals`.
    pub fn build(
        &self,
        table: &SegmentTable,
        vocals: &AudioBuffer,
        accompaniment: Option<&AudioBuffer>,
    ) -> Result<MergeResult> {
        let rate = vocals.sample_rate;
        let total_samples = vocals.samples.len();
        let mut track = vec![0.0f32; total_samples];
        let mut warnings = Vec::new();
        let fade_samples = (defaults::TAIL_FADE_MS as u64 * rate as u64 / 1000) as usize;

        let mut prev_end_sample = 0usize;
        for seg in &table.segments {
            let Some(clone_path) = seg.cloned_audio_path.as_deref() else {
                if let Some(err) = &seg.error {
                    warnings.push(format!("segment {}: silence substituted ({err})", seg.id));
                }
                continue;
            };
            let mut clone = match wav::load_resampled(clone_path, rate) {
                Ok(buf) => buf.samples,
                Err(e) => {
                    warnings.push(format!(
                        "segment {}: clone unreadable, silence substituted ({e})",
                        seg.id
                    ));
                    continue;
                }
            };

            let target = seg.end - seg.start;
            let actual = clone.len() as f64 / rate as f64;
            if actual > target * self.config.max_stretch {
                let factor = (actual / target).min(self.config.max_stretch);
                match self.compress_clone(clone_path, factor, rate) {
                    Ok(compressed) => {
                        warnings.push(format!(
                            "segment {}: clone {actual:.2}s compressed x{factor:.2} to fit {target:.2}s",
                            seg.id
                        ));
                        clone = compressed;
                    }
                    Err(e) => {
                        warnings.push(format!(
                            "segment {}: time compression failed, truncating ({e})",
                            seg.id
                        ));
                    }
                }
                // Still too long after the capped compression: cut the tail.
                let target_samples = (target * rate as f64).round() as usize;
                if clone.len() > target_samples {
                    clone.truncate(target_samples);
                }
            }

            let start_sample = (seg.start * rate as f64).round() as usize;
            // Overlap repair: never begin before the previous placement ends.
            let place_start = start_sample.max(prev_end_sample);
            if place_start >= total_samples {
                warnings.push(format!(
                    "segment {}: placement past end of track, dropped",
                    seg.id
                ));
                continue;
            }
            if place_start + clone.len() > total_samples {
                clone.truncate(total_samples - place_start);
            }
            if clone.is_empty() {
                continue;
            }

            self.level_match(&mut clone, vocals.slice_seconds(seg.start, seg.end));
            wav::apply_fade_out(&mut clone, fade_samples);

            let place_end = place_start + clone.len();
            track[place_start..place_end].copy_from_slice(&clone);
            debug!(
                segment = seg.id,
                place_start, place_end, "placed cloned segment"
            );
            prev_end_sample = place_end;
        }

        if let Some(acc) = accompaniment {
            mix_accompaniment(
                &mut track,
                acc,
                rate,
                self.config.accompaniment_gain_db,
            );
        }

        // Guard against clipping introduced by level matching or mixing.
        let peak = track.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        if peak > 1.0 {
            let scale = 0.99 / peak;
            for s in &mut track {
                *s *= scale;
            }
        }

        for w in &warnings {
            warn!("{w}");
        }

        Ok(MergeResult {
            track: AudioBuffer {
                samples: track,
                sample_rate: rate,
            },
            warnings,
        })
    }

    fn compress_clone(&self, src: &std::path::Path, factor: f64, rate: u32) -> Result<Vec<f32>> {
        let dir = tempfile::tempdir()?;
        let dst = dir.path().join("compressed.wav");
        self.stretcher.compress(src, factor, &dst)?;
        Ok(wav::load_resampled(&dst, rate)?.samples)
    }

    /// Scale the clone toward the RMS of the original vocals over the same
    /// interval, capped at +/- `LEVEL_MATCH_CAP_DB`.
    fn level_match(&self, clone: &mut [f32], original: &[f32]) {
        let orig_rms = wav::rms(original);
        let clone_rms = wav::rms(clone);
        if orig_rms < 1e-6 || clone_rms < 1e-6 {
            return;
        }
        let max_gain = wav::db_to_gain(defaults::LEVEL_MATCH_CAP_DB);
        let gain = (orig_rms / clone_rms).clamp(1.0 / max_gain, max_gain);
        for s in clone.iter_mut() {
            *s *= gain;
        }
    }
}

/// Mix the accompaniment under the voice at `gain_db` relative to the
/// voice track's peak. The accompaniment is padded or truncated to the
/// track length first.
fn mix_accompaniment(track: &mut [f32], accompaniment: &AudioBuffer, rate: u32, gain_db: f64) {
    let acc = accompaniment.resampled(rate);
    let voice_peak = track.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    let acc_peak = acc.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if acc_peak < 1e-6 {
        return;
    }
    let reference = if voice_peak > 1e-6 { voice_peak } else { 1.0 };
    let scale = reference * wav::db_to_gain(gain_db) / acc_peak;
    for (dst, src) in track.iter_mut().zip(acc.samples.iter()) {
        *dst += src * scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::mock::MockStretcher;
    use crate::segment::Segment;
    use tempfile::TempDir;

    fn merger() -> Merger {
        Merger::new(MergerConfig::default(), Arc::new(MockStretcher))
    }

    fn tone_file(dir: &TempDir, name: &str, duration: f64, amplitude: f32) -> std::path::PathBuf {
        let rate = defaults::SAMPLE_RATE;
        let len = (duration * rate as f64) as usize;
        let samples = (0..len)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * 110.0 * i as f32 / rate as f32).sin())
            .collect();
        let path = dir.path().join(name);
        wav::save(
            &path,
            &AudioBuffer {
                samples,
                sample_rate: rate,
            },
        )
        .unwrap();
        path
    }

    fn segment_with_clone(id: usize, start: f64, end: f64, clone: &std::path::Path) -> Segment {
        let mut seg = Segment::new(id, start, end, format!("seg {id}"));
        seg.cloned_audio_path = Some(clone.to_path_buf());
        seg
    }

    #[test]
    fn test_output_length_equals_vocals_exactly() {
        let dir = TempDir::new().unwrap();
        let clone = tone_file(&dir, "c0.wav", 1.0, 0.3);
        let vocals = AudioBuffer::silence(10.0, defaults::SAMPLE_RATE);
        let table = SegmentTable::new(vec![segment_with_clone(0, 1.0, 2.5, &clone)]);

        let result = merger().build(&table, &vocals, None).unwrap();
        assert_eq!(result.track.samples.len(), vocals.samples.len());
    }

    #[test]
    fn test_clone_placed_at_segment_start() {
        let dir = TempDir::new().unwrap();
        let clone = tone_file(&dir, "c0.wav", 1.0, 0.3);
        let vocals = AudioBuffer::silence(10.0, defaults::SAMPLE_RATE);
        let table = SegmentTable::new(vec![segment_with_clone(0, 2.0, 3.5, &clone)]);

        let result = merger().build(&table, &vocals, None).unwrap();
        let rate = defaults::SAMPLE_RATE as usize;
        // Silence before the placement, signal after it.
        assert!(result.track.samples[..2 * rate].iter().all(|&s| s == 0.0));
        let placed = &result.track.samples[2 * rate..3 * rate];
        assert!(placed.iter().any(|&s| s.abs() > 0.01));
    }

    #[test]
    fn test_overlong_clone_compressed_then_truncated() {
        // 5.0s clone into a 2.0s segment with max_stretch 2.0: compression
        // to 2.5s, truncation to 2.0s, and a warning.
        let dir = TempDir::new().unwrap();
        let clone = tone_file(&dir, "c0.wav", 5.0, 0.3);
        let vocals = AudioBuffer::silence(10.0, defaults::SAMPLE_RATE);
        let table = SegmentTable::new(vec![segment_with_clone(0, 0.0, 2.0, &clone)]);

        let result = merger().build(&table, &vocals, None).unwrap();
        assert!(!result.warnings.is_empty());

        let rate = defaults::SAMPLE_RATE as usize;
        let after = &result.track.samples[2 * rate + rate / 10..];
        assert!(after.iter().all(|&s| s == 0.0), "clone must end at 2.0s");
    }

    #[test]
    fn test_mild_overrun_is_not_compressed() {
        // 3.0s clone into a 2.0s segment stays under the 2x cap: placed
        // uncompressed, next placement shifts forward.
        let dir = TempDir::new().unwrap();
        let clone0 = tone_file(&dir, "c0.wav", 3.0, 0.3);
        let clone1 = tone_file(&dir, "c1.wav", 1.0, 0.3);
        let vocals = AudioBuffer::silence(10.0, defaults::SAMPLE_RATE);
        let table = SegmentTable::new(vec![
            segment_with_clone(0, 0.0, 2.0, &clone0),
            segment_with_clone(1, 2.5, 3.5, &clone1),
        ]);

        let result = merger().build(&table, &vocals, None).unwrap();
        let rate = defaults::SAMPLE_RATE as usize;
        // Segment 0 overruns its window; its tail is still audible at 2.7s.
        let tail0 = &result.track.samples[(2.5 * rate as f64) as usize..(2.9 * rate as f64) as usize];
        assert!(wav::rms(tail0) > 0.01);
        // Segment 1 would start at 2.5s but segment 0 runs to 3.0s, so its
        // placement begins at 3.0s (position >= previous end) and ends at 4.0s.
        let shifted = &result.track.samples[(3.2 * rate as f64) as usize..(3.8 * rate as f64) as usize];
        assert!(wav::rms(shifted) > 0.01);
        let after_4 = &result.track.samples[4 * rate + rate / 10..];
        assert!(after_4.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_segments_without_clones_become_silence() {
        let vocals = AudioBuffer::silence(5.0, defaults::SAMPLE_RATE);
        let mut seg = Segment::new(0, 0.0, 2.0, "no clone");
        seg.error = Some("clone failed".to_string());
        let table = SegmentTable::new(vec![seg]);

        let result = merger().build(&table, &vocals, None).unwrap();
        assert!(result.track.samples.iter().all(|&s| s == 0.0));
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("silence substituted"));
    }

    #[test]
    fn test_deterministic_output() {
        let dir = TempDir::new().unwrap();
        let clone = tone_file(&dir, "c0.wav", 1.5, 0.4);
        let vocals = AudioBuffer::silence(6.0, defaults::SAMPLE_RATE);
        let table = SegmentTable::new(vec![segment_with_clone(0, 0.5, 2.0, &clone)]);

        let a = merger().build(&table, &vocals, None).unwrap();
        let b = merger().build(&table, &vocals, None).unwrap();
        assert_eq!(a.track.samples, b.track.samples);
    }

    #[test]
    fn test_accompaniment_mixed_under_voice() {
        let dir = TempDir::new().unwrap();
        let clone = tone_file(&dir, "c0.wav", 1.0, 0.5);
        let vocals = AudioBuffer::silence(4.0, defaults::SAMPLE_RATE);
        let accompaniment = AudioBuffer {
            samples: vec![0.5; 4 * defaults::SAMPLE_RATE as usize],
            sample_rate: defaults::SAMPLE_RATE,
        };
        let table = SegmentTable::new(vec![segment_with_clone(0, 0.0, 1.0, &clone)]);

        let result = merger()
            .build(&table, &vocals, Some(&accompaniment))
            .unwrap();
        // Accompaniment audible in the otherwise-silent tail.
        let tail = &result.track.samples[3 * defaults::SAMPLE_RATE as usize..];
        assert!(tail.iter().any(|&s| s.abs() > 0.01));
        // And no clipping.
        assert!(result.track.samples.iter().all(|&s| s.abs() <= 1.0));
    }
}
