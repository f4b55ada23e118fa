//! Engine interfaces the pipeline consumes.
//!
//! Each engine is a synchronous blocking call exposing one method; any
//! backend satisfying the contract plugs in. Model code itself lives behind
//! these seams and is not part of this crate. Implementations here:
//! mocks (testing), the ffmpeg-backed media tool adapters, and adapters that
//! delegate to configured external commands.

pub mod command;
pub mod ffmpeg;
pub mod mock;

use crate::error::Result;
use crate::segment::Word;
use crate::speaker::SpeakerTrack;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// One transcribed interval as returned by the speech recognizer, before
/// segment ids are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribedSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub words: Vec<Word>,
}

/// Speech recognition output: detected language plus raw segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub language: String,
    pub segments: Vec<TranscribedSegment>,
}

/// Result of vocal separation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Separation {
    /// True when an accompaniment track was detected and written.
    pub accompaniment: bool,
}

/// Normalizes arbitrary media to 16 kHz mono PCM WAV.
pub trait AudioExtractor: Send + Sync {
    fn extract(&self, src: &Path, dst: &Path) -> Result<()>;
}

/// Splits speech from music. The accompaniment file is only written when
/// music is detected above the backend's threshold.
pub trait VocalSeparator: Send + Sync {
    fn separate(&self, audio: &Path, vocals_dst: &Path, accompaniment_dst: &Path)
        -> Result<Separation>;
}

/// Builds per-speaker compact tracks with silence removed.
///
/// Not called at all for single-speaker tasks; the executor skips stage 3
/// entirely in that case.
pub trait SpeakerTracker: Send + Sync {
    fn build(&self, vocals: &Path, speakers_dir: &Path) -> Result<Vec<SpeakerTrack>>;
}

/// Speech recognition with word-level timestamps.
pub trait Transcriber: Send + Sync {
    fn transcribe(&self, audio: &Path, lang_hint: &str) -> Result<Transcription>;
}

/// Batch text translation. Must return exactly one result per input; the
/// caller skips the call entirely when source and target languages match.
pub trait Translator: Send + Sync {
    fn translate(&self, batch: &[String], source_lang: &str, target_lang: &str)
        -> Result<Vec<String>>;
}

/// Voice cloning: reproduce the timbre of `reference` speaking `text`.
pub trait VoiceCloner: Send + Sync {
    fn clone_voice(&self, reference: &Path, text: &str, dst: &Path) -> Result<()>;

    /// Whether `clone_voice` may be called from multiple worker threads.
    /// Per-segment parallelism in stage 7 is only enabled when true.
    fn is_thread_safe(&self) -> bool {
        false
    }
}

/// Time-compresses audio by `factor` (the media tool's `atempo` contract).
pub trait TimeStretcher: Send + Sync {
    fn compress(&self, src: &Path, factor: f64, dst: &Path) -> Result<()>;
}

/// Copies the video stream and mixes voice (and optional accompaniment)
/// into a single audio stream.
pub trait Muxer: Send + Sync {
    fn mux(&self, video: &Path, voice: &Path, accompaniment: Option<&Path>, dst: &Path)
        -> Result<()>;
}

/// Separator fallback when no separation backend is configured: the whole
/// mix is treated as vocals and no accompaniment is produced.
#[derive(Debug, Clone, Default)]
pub struct PassthroughSeparator;

impl VocalSeparator for PassthroughSeparator {
    fn separate(
        &self,
        audio: &Path,
        vocals_dst: &Path,
        _accompaniment_dst: &Path,
    ) -> Result<Separation> {
        std::fs::copy(audio, vocals_dst)?;
        Ok(Separation {
            accompaniment: false,
        })
    }
}

/// Placeholder for an engine with no configured backend; fails with a
/// configuration error on first use instead of at startup.
#[derive(Debug, Clone)]
pub struct Unconfigured {
    key: &'static str,
}

impl Unconfigured {
    pub fn new(key: &'static str) -> Self {
        Self { key }
    }

    fn err<T>(&self) -> Result<T> {
        Err(crate::error::RedubError::ConfigInvalidValue {
            key: self.key.to_string(),
            message: "no backend command configured".to_string(),
        })
    }
}

impl SpeakerTracker for Unconfigured {
    fn build(&self, _vocals: &Path, _speakers_dir: &Path) -> Result<Vec<SpeakerTrack>> {
        self.err()
    }
}

impl Transcriber for Unconfigured {
    fn transcribe(&self, _audio: &Path, _lang_hint: &str) -> Result<Transcription> {
        self.err()
    }
}

impl Translator for Unconfigured {
    fn translate(
        &self,
        _batch: &[String],
        _source_lang: &str,
        _target_lang: &str,
    ) -> Result<Vec<String>> {
        self.err()
    }
}

impl VoiceCloner for Unconfigured {
    fn clone_voice(&self, _reference: &Path, _text: &str, _dst: &Path) -> Result<()> {
        self.err()
    }
}

/// The full set of engine handles an executor works with.
///
/// Handles are process-wide capabilities: heavyweight backends initialize
/// lazily behind their adapter and are shared across tasks.
#[derive(Clone)]
pub struct EngineSet {
    pub extractor: Arc<dyn AudioExtractor>,
    pub separator: Arc<dyn VocalSeparator>,
    pub tracker: Arc<dyn SpeakerTracker>,
    pub transcriber: Arc<dyn Transcriber>,
    pub translator: Arc<dyn Translator>,
    pub cloner: Arc<dyn VoiceCloner>,
    pub stretcher: Arc<dyn TimeStretcher>,
    pub muxer: Arc<dyn Muxer>,
}
