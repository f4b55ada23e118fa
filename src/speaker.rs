//! Per-speaker compact tracks and their time mappings.
//!
//! A speaker track concatenates one speaker's non-silent regions into a
//! compact WAV. The mapping records where each compact interval came from in
//! the global timeline so segment times can be converted in both directions.

use crate::error::{RedubError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One compact-to-global correspondence.
///
/// Invariant: `compact_end - compact_start == global_end - global_start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub compact_start: f64,
    pub compact_end: f64,
    pub global_start: f64,
    pub global_end: f64,
}

/// A speaker's compact audio and its mapping back to global time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerTrack {
    pub speaker_id: String,
    pub compact_audio_path: PathBuf,
    pub mapping: Vec<MappingEntry>,
}

impl SpeakerTrack {
    /// Validate: equal span lengths, global intervals disjoint and sorted.
    pub fn validate(&self) -> Result<()> {
        for (i, m) in self.mapping.iter().enumerate() {
            let compact_len = m.compact_end - m.compact_start;
            let global_len = m.global_end - m.global_start;
            if compact_len <= 0.0 || (compact_len - global_len).abs() > 1e-6 {
                return Err(RedubError::Corrupt {
                    path: self.compact_audio_path.display().to_string(),
                    message: format!(
                        "mapping entry {i} spans differ: compact {:.3}s vs global {:.3}s",
                        compact_len, global_len
                    ),
                });
            }
        }
        for pair in self.mapping.windows(2) {
            if pair[1].global_start < pair[0].global_end {
                return Err(RedubError::Corrupt {
                    path: self.compact_audio_path.display().to_string(),
                    message: "global intervals overlap or are unsorted".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Map a global interval into compact time.
    ///
    /// Returns the linearly mapped overlap with the first mapping entry the
    /// interval touches, or `None` when the interval lies entirely in
    /// removed silence.
    pub fn global_to_compact(&self, global_start: f64, global_end: f64) -> Option<(f64, f64)> {
        for m in &self.mapping {
            if global_end <= m.global_start || global_start >= m.global_end {
                continue;
            }
            let sub_start = global_start.max(m.global_start);
            let sub_end = global_end.min(m.global_end);
            if sub_end <= sub_start {
                continue;
            }
            let span = m.global_end - m.global_start;
            let ratio_start = (sub_start - m.global_start) / span;
            let ratio_end = (sub_end - m.global_start) / span;
            let compact_span = m.compact_end - m.compact_start;
            return Some((
                m.compact_start + ratio_start * compact_span,
                m.compact_start + ratio_end * compact_span,
            ));
        }
        None
    }

    /// Map a compact time point into global time, clamping to the nearest
    /// entry when the point falls outside every interval.
    pub fn compact_to_global(&self, compact_t: f64) -> f64 {
        for m in &self.mapping {
            if compact_t >= m.compact_start && compact_t <= m.compact_end {
                return m.global_start + (compact_t - m.compact_start);
            }
            if compact_t < m.compact_start {
                return m.global_start;
            }
        }
        self.mapping.last().map(|m| m.global_end).unwrap_or(compact_t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> SpeakerTrack {
        SpeakerTrack {
            speaker_id: "spk0".to_string(),
            compact_audio_path: PathBuf::from("/tmp/spk0.wav"),
            mapping: vec![
                MappingEntry {
                    compact_start: 0.0,
                    compact_end: 2.0,
                    global_start: 1.0,
                    global_end: 3.0,
                },
                MappingEntry {
                    compact_start: 2.0,
                    compact_end: 5.0,
                    global_start: 10.0,
                    global_end: 13.0,
                },
            ],
        }
    }

    #[test]
    fn test_validate_accepts_consistent_mapping() {
        assert!(track().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unequal_spans() {
        let mut t = track();
        t.mapping[0].compact_end = 2.5;
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overlapping_global() {
        let mut t = track();
        t.mapping[1].global_start = 2.0;
        t.mapping[1].global_end = 5.0;
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_global_to_compact_inside_entry() {
        let (cs, ce) = track().global_to_compact(1.5, 2.5).unwrap();
        assert!((cs - 0.5).abs() < 1e-9);
        assert!((ce - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_global_to_compact_clips_to_entry() {
        // Interval extends past the entry's global end; the overlap maps.
        let (cs, ce) = track().global_to_compact(2.5, 4.0).unwrap();
        assert!((cs - 1.5).abs() < 1e-9);
        assert!((ce - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_global_to_compact_in_silence_is_none() {
        assert!(track().global_to_compact(4.0, 9.0).is_none());
    }

    #[test]
    fn test_compact_to_global_roundtrip() {
        let t = track();
        assert!((t.compact_to_global(0.5) - 1.5).abs() < 1e-9);
        assert!((t.compact_to_global(3.0) - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_compact_to_global_clamps_past_end() {
        let t = track();
        assert!((t.compact_to_global(99.0) - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_mapping_json_shape() {
        let t = track();
        let json = serde_json::to_string(&t.mapping).unwrap();
        assert!(json.contains("\"compact_start\":0.0"));
        assert!(json.contains("\"global_end\":13.0"));
    }
}
