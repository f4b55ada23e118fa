//! Mock engines for testing.
//!
//! These allow swapping implementations (real backends vs mocks) so the
//! whole pipeline can run deterministically in tests without models or the
//! external media tool.

use super::{
    AudioExtractor, Muxer, Separation, SpeakerTracker, TimeStretcher, TranscribedSegment,
    Transcriber, Transcription, Translator, VocalSeparator, VoiceCloner,
};
use crate::audio::wav::{self, AudioBuffer};
use crate::defaults;
use crate::error::{RedubError, Result};
use crate::segment::Word;
use crate::speaker::{MappingEntry, SpeakerTrack};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Extractor that re-encodes WAV inputs or synthesizes silence for
/// non-WAV inputs.
#[derive(Debug, Clone)]
pub struct MockExtractor {
    fallback_duration: f64,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self {
            fallback_duration: 10.0,
        }
    }

    /// Duration used when the input is not a parseable WAV file.
    pub fn with_fallback_duration(mut self, seconds: f64) -> Self {
        self.fallback_duration = seconds;
        self
    }
}

impl Default for MockExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioExtractor for MockExtractor {
    fn extract(&self, src: &Path, dst: &Path) -> Result<()> {
        let buffer = match wav::load(src) {
            Ok(buf) => buf.resampled(defaults::SAMPLE_RATE),
            Err(_) => AudioBuffer::silence(self.fallback_duration, defaults::SAMPLE_RATE),
        };
        wav::save(dst, &buffer)
    }
}

/// Separator that passes vocals through; accompaniment is optional.
#[derive(Debug, Clone, Default)]
pub struct MockSeparator {
    with_accompaniment: bool,
}

impl MockSeparator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend music was detected and write a silent accompaniment track.
    pub fn with_accompaniment(mut self) -> Self {
        self.with_accompaniment = true;
        self
    }
}

impl VocalSeparator for MockSeparator {
    fn separate(
        &self,
        audio: &Path,
        vocals_dst: &Path,
        accompaniment_dst: &Path,
    ) -> Result<Separation> {
        let buffer = wav::load(audio)?;
        wav::save(vocals_dst, &buffer)?;
        if self.with_accompaniment {
            let silence = AudioBuffer::silence(buffer.duration_seconds(), buffer.sample_rate);
            wav::save(accompaniment_dst, &silence)?;
        }
        Ok(Separation {
            accompaniment: self.with_accompaniment,
        })
    }
}

/// Tracker that slices the vocals into `n` equal compact tracks.
#[derive(Debug, Clone)]
pub struct MockTracker {
    speakers: usize,
}

impl MockTracker {
    pub fn new() -> Self {
        Self { speakers: 2 }
    }

    pub fn with_speakers(mut self, n: usize) -> Self {
        self.speakers = n.max(1);
        self
    }
}

impl Default for MockTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeakerTracker for MockTracker {
    fn build(&self, vocals: &Path, speakers_dir: &Path) -> Result<Vec<SpeakerTrack>> {
        let buffer = wav::load(vocals)?;
        let total = buffer.duration_seconds();
        let span = total / self.speakers as f64;

        let mut tracks = Vec::with_capacity(self.speakers);
        for i in 0..self.speakers {
            let speaker_id = format!("spk{i}");
            let global_start = i as f64 * span;
            let global_end = ((i + 1) as f64 * span).min(total);

            let dir = speakers_dir.join(&speaker_id);
            std::fs::create_dir_all(&dir)?;
            let wav_path = dir.join(format!("{speaker_id}.wav"));
            let slice = buffer.slice_seconds(global_start, global_end).to_vec();
            wav::save(
                &wav_path,
                &AudioBuffer {
                    samples: slice,
                    sample_rate: buffer.sample_rate,
                },
            )?;

            tracks.push(SpeakerTrack {
                speaker_id,
                compact_audio_path: wav_path,
                mapping: vec![MappingEntry {
                    compact_start: 0.0,
                    compact_end: global_end - global_start,
                    global_start,
                    global_end,
                }],
            });
        }
        Ok(tracks)
    }
}

/// Transcriber returning a configured set of segments.
#[derive(Debug, Clone)]
pub struct MockTranscriber {
    language: String,
    segments: Vec<TranscribedSegment>,
}

impl MockTranscriber {
    pub fn new() -> Self {
        Self {
            language: "en".to_string(),
            segments: vec![transcribed("mock transcription", 0.0, 2.0)],
        }
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    pub fn with_segments(mut self, segments: Vec<TranscribedSegment>) -> Self {
        self.segments = segments;
        self
    }
}

impl Default for MockTranscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcriber for MockTranscriber {
    fn transcribe(&self, _audio: &Path, _lang_hint: &str) -> Result<Transcription> {
        Ok(Transcription {
            language: self.language.clone(),
            segments: self.segments.clone(),
        })
    }
}

/// Build a `TranscribedSegment` with evenly spread word timestamps.
pub fn transcribed(text: &str, start: f64, end: f64) -> TranscribedSegment {
    let words: Vec<&str> = text.split_whitespace().collect();
    let count = words.len().max(1);
    let span = (end - start) / count as f64;
    let words = words
        .iter()
        .enumerate()
        .map(|(i, w)| Word {
            word: (*w).to_string(),
            start: start + i as f64 * span,
            end: start + (i + 1) as f64 * span,
        })
        .collect();
    TranscribedSegment {
        start,
        end,
        text: text.to_string(),
        words,
    }
}

/// Translator that tags each text with the target language.
///
/// `with_fail_after(n)` makes every call after the first `n` fail, which is
/// how batch-retry exhaustion is simulated.
#[derive(Debug, Default)]
pub struct MockTranslator {
    fail_after: Option<usize>,
    calls: AtomicUsize,
}

impl MockTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fail_after(mut self, successful_calls: usize) -> Self {
        self.fail_after = Some(successful_calls);
        self
    }

    /// Number of translate calls observed (including failed ones).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Translator for MockTranslator {
    fn translate(
        &self,
        batch: &[String],
        _source_lang: &str,
        target_lang: &str,
    ) -> Result<Vec<String>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after {
            if call >= limit {
                return Err(RedubError::EngineFailure {
                    engine: "translator".to_string(),
                    message: "mock translator outage".to_string(),
                });
            }
        }
        Ok(batch
            .iter()
            .map(|text| format!("[{target_lang}] {text}"))
            .collect())
    }
}

/// Cloner writing a constant-amplitude tone whose duration is configurable
/// per translated text.
#[derive(Debug, Default)]
pub struct MockCloner {
    default_duration: f64,
    durations: HashMap<String, f64>,
    fail_on: Vec<String>,
    thread_safe: bool,
    calls: AtomicUsize,
}

impl MockCloner {
    pub fn new() -> Self {
        Self {
            default_duration: 1.0,
            durations: HashMap::new(),
            fail_on: Vec::new(),
            thread_safe: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_default_duration(mut self, seconds: f64) -> Self {
        self.default_duration = seconds;
        self
    }

    /// Override the clone duration for one exact text.
    pub fn with_duration_for(mut self, text: &str, seconds: f64) -> Self {
        self.durations.insert(text.to_string(), seconds);
        self
    }

    /// Fail cloning for one exact text.
    pub fn with_fail_on(mut self, text: &str) -> Self {
        self.fail_on.push(text.to_string());
        self
    }

    pub fn with_thread_safe(mut self) -> Self {
        self.thread_safe = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VoiceCloner for MockCloner {
    fn clone_voice(&self, _reference: &Path, text: &str, dst: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.iter().any(|t| t == text) {
            return Err(RedubError::EngineFailure {
                engine: "voice_cloner".to_string(),
                message: format!("mock clone failure for: {text}"),
            });
        }
        let duration = self
            .durations
            .get(text)
            .copied()
            .unwrap_or(self.default_duration);
        let rate = defaults::SAMPLE_RATE;
        let len = (duration * rate as f64).round() as usize;
        let samples = (0..len)
            .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 110.0 * i as f32 / rate as f32).sin())
            .collect();
        wav::save(
            dst,
            &AudioBuffer {
                samples,
                sample_rate: rate,
            },
        )
    }

    fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }
}

/// Deterministic pure-Rust stretcher: resamples to `len / factor`.
#[derive(Debug, Clone, Default)]
pub struct MockStretcher;

impl TimeStretcher for MockStretcher {
    fn compress(&self, src: &Path, factor: f64, dst: &Path) -> Result<()> {
        if factor <= 0.0 {
            return Err(RedubError::InvalidRequest {
                message: format!("compression factor must be positive, got {factor}"),
            });
        }
        let buffer = wav::load(src)?;
        let target_len = (buffer.samples.len() as f64 / factor).round() as usize;
        let samples = (0..target_len)
            .map(|i| {
                let pos = i as f64 * factor;
                buffer.samples[(pos as usize).min(buffer.samples.len().saturating_sub(1))]
            })
            .collect();
        wav::save(
            dst,
            &AudioBuffer {
                samples,
                sample_rate: buffer.sample_rate,
            },
        )
    }
}

/// Muxer that copies the voice track to the destination.
#[derive(Debug, Clone, Default)]
pub struct MockMuxer;

impl Muxer for MockMuxer {
    fn mux(
        &self,
        _video: &Path,
        voice: &Path,
        _accompaniment: Option<&Path>,
        dst: &Path,
    ) -> Result<()> {
        std::fs::copy(voice, dst)?;
        Ok(())
    }
}
