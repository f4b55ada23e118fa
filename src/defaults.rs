//! Default configuration constants for redub.
//!
//! This module provides shared constants used across different configuration
//! types to ensure consistency and eliminate duplication.

/// Sample rate for extracted speech audio in Hz.
///
/// 16kHz mono PCM is the normalization target of stage 1; every downstream
/// engine (separation, diarization, transcription) consumes this format.
pub const SAMPLE_RATE: u32 = 16_000;

/// Language value that triggers automatic language detection.
pub const AUTO_LANGUAGE: &str = "auto";

/// Maximum time-compression factor applied to an overlong clone.
///
/// A clone longer than `target * MAX_STRETCH` is compressed by at most this
/// factor and then truncated from the tail. 2.0 keeps compressed speech
/// intelligible.
pub const MAX_STRETCH: f64 = 2.0;

/// Accompaniment gain relative to peak voice when mixing, in dB.
pub const ACCOMPANIMENT_GAIN_DB: f64 = -6.0;

/// Cap on the per-segment level-matching gain, in dB.
///
/// Clones are scaled toward the RMS of the original vocals over the same
/// interval, clamped to +/- this value.
pub const LEVEL_MATCH_CAP_DB: f64 = 3.0;

/// Tail fade applied to every placed clone, in milliseconds.
///
/// Removes the digital click at hard sample boundaries.
pub const TAIL_FADE_MS: u32 = 20;

/// Permitted overlap between consecutive segments, in seconds.
///
/// Larger overlaps are rejected by segment-table validation; smaller ones
/// are repaired by the merger at placement time.
pub const OVERLAP_TOLERANCE_S: f64 = 0.1;

/// Number of segments sent to the translator per request.
pub const TRANSLATOR_BATCH_SIZE: usize = 20;

/// Retries per translation batch before the task fails.
pub const TRANSLATOR_MAX_RETRIES: u32 = 3;

/// Word gap, in seconds, at which stage 4 splits a transcribed segment.
pub const SILENCE_SPLIT_GAP_S: f64 = 1.5;

/// Per-subscriber event queue capacity.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Global limit on concurrently processing tasks.
///
/// The model workloads are GPU-heavy; one task at a time is the safe
/// default for a single-GPU process.
pub const MAX_CONCURRENT_TASKS: usize = 1;

/// Worker pool size for per-segment work inside stages 6 and 7.
///
/// Only used when the voice-cloning engine declares thread safety.
pub const PER_SEGMENT_PARALLELISM: usize = 2;

/// File extensions treated as video input.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "wmv", "flv"];

/// File extensions treated as audio-only input.
pub const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a", "flac", "aac", "ogg"];

/// Returns true when the path's extension marks a video container.
pub fn is_video_input(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            VIDEO_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}
