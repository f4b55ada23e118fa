//! The canonical segment table and its edit operations.
//!
//! One `Segment` is a contiguous interval of the source timeline with the
//! transcribed text, the optional translation and the optional cloned audio
//! produced for it. The table lives on disk as the stage-4/5 JSON; this
//! module owns its invariants and the split/merge/delete/update operations
//! exposed to editors.

use crate::defaults;
use crate::error::{RedubError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A single word with its timestamps, used to pick safe split points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One row of the segment table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: usize,
    /// Start in the global timeline, seconds.
    pub start: f64,
    /// End in the global timeline, seconds. Always > `start`.
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<Word>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloned_audio_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloned_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_multiplier: Option<f64>,
    /// Set when stage 7 failed for this segment; silence is substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when the segment changed since the final track was last built.
    #[serde(default, skip_serializing_if = "is_false")]
    pub dirty: bool,
}

impl Segment {
    pub fn new(id: usize, start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            id,
            start,
            end,
            text: text.into(),
            translated_text: None,
            speaker_id: None,
            words: None,
            cloned_audio_path: None,
            original_duration: None,
            cloned_duration: None,
            duration_multiplier: None,
            error: None,
            dirty: false,
        }
    }

    /// Drop derived artifacts that no longer match the segment content.
    fn invalidate_downstream(&mut self) {
        self.translated_text = None;
        self.clear_clone();
    }

    /// Drop the cloned audio reference and its derived duration fields.
    pub fn clear_clone(&mut self) {
        self.cloned_audio_path = None;
        self.cloned_duration = None;
        self.duration_multiplier = None;
        self.error = None;
        self.dirty = true;
    }
}

/// Patch applied by `SegmentTable::update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentPatch {
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub text: Option<String>,
    pub translated_text: Option<String>,
}

/// Ordered sequence of segments; serialized as a plain JSON array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentTable {
    pub segments: Vec<Segment>,
}

impl SegmentTable {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, id: usize) -> Result<&Segment> {
        self.segments
            .get(id)
            .filter(|s| s.id == id)
            .ok_or_else(|| RedubError::InvalidRequest {
                message: format!("segment id {id} out of range"),
            })
    }

    /// Validate the table invariants with the default overlap tolerance.
    pub fn validate(&self) -> Result<()> {
        self.validate_with_tolerance(defaults::OVERLAP_TOLERANCE_S)
    }

    /// Validate: dense 0-based ids, sorted by start, non-empty intervals,
    /// overlap bounded by `tolerance` seconds.
    pub fn validate_with_tolerance(&self, tolerance: f64) -> Result<()> {
        for (idx, seg) in self.segments.iter().enumerate() {
            if seg.id != idx {
                return Err(RedubError::InvalidSegments {
                    message: format!("ids not contiguous: position {idx} holds id {}", seg.id),
                });
            }
            if !(seg.start >= 0.0 && seg.end > seg.start) {
                return Err(RedubError::InvalidSegments {
                    message: format!(
                        "segment {idx} has empty interval: start={:.3} end={:.3}",
                        seg.start, seg.end
                    ),
                });
            }
        }
        for pair in self.segments.windows(2) {
            if pair[1].start < pair[0].start {
                return Err(RedubError::InvalidSegments {
                    message: format!(
                        "segments {} and {} not sorted by start",
                        pair[0].id, pair[1].id
                    ),
                });
            }
            if pair[1].start < pair[0].end - tolerance {
                return Err(RedubError::InvalidSegments {
                    message: format!(
                        "segments {} and {} overlap by more than {:.2}s",
                        pair[0].id,
                        pair[1].id,
                        pair[0].end - pair[1].start
                    ),
                });
            }
        }
        Ok(())
    }

    /// Split segment `id` at the word boundary nearest to the character
    /// offset `text_offset`.
    ///
    /// The left half keeps `[start, boundary_word.end]`, the right half
    /// takes `[boundary_word.end, end]`. Text is partitioned at the snapped
    /// boundary and trimmed; `translated_text` and the cloned audio of both
    /// halves are cleared since they no longer match. Trailing ids shift
    /// by +1.
    pub fn split(&self, id: usize, text_offset: usize) -> Result<SegmentTable> {
        let seg = self.get(id)?.clone();
        let words = seg.words.as_ref().ok_or_else(|| RedubError::InvalidRequest {
            message: format!("segment {id} has no word timestamps to split at"),
        })?;
        if words.len() < 2 {
            return Err(RedubError::InvalidRequest {
                message: format!("segment {id} has fewer than two words"),
            });
        }

        let byte_offset = char_to_byte_offset(&seg.text, text_offset);
        let spans = word_spans(&seg.text, words);
        let split_idx = snap_to_word_boundary(&spans, byte_offset, words.len());

        let boundary_byte = spans
            .get(split_idx)
            .and_then(|s| *s)
            .map(|(start, _)| start)
            .unwrap_or(byte_offset.min(seg.text.len()));
        let left_text = seg.text[..boundary_byte].trim().to_string();
        let right_text = seg.text[boundary_byte..].trim().to_string();

        let boundary_time = words[split_idx - 1].end;

        let mut left = Segment::new(seg.id, seg.start, boundary_time, left_text);
        left.speaker_id = seg.speaker_id.clone();
        left.words = Some(words[..split_idx].to_vec());
        left.dirty = true;

        let mut right = Segment::new(seg.id + 1, boundary_time, seg.end, right_text);
        right.speaker_id = seg.speaker_id;
        right.words = Some(words[split_idx..].to_vec());
        right.dirty = true;

        let mut segments = self.segments.clone();
        segments[id] = left;
        segments.insert(id + 1, right);
        let mut table = SegmentTable::new(segments);
        table.renumber();
        table.validate()?;
        Ok(table)
    }

    /// Merge the adjacent segments named by `ids` into one.
    ///
    /// The result spans `[first.start, last.end]`, concatenates the texts
    /// with a single space and clears translation and clone references.
    pub fn merge(&self, ids: &[usize]) -> Result<SegmentTable> {
        if ids.len() < 2 {
            return Err(RedubError::InvalidRequest {
                message: "merge requires at least two segment ids".to_string(),
            });
        }
        for pair in ids.windows(2) {
            if pair[1] != pair[0] + 1 {
                return Err(RedubError::InvalidRequest {
                    message: format!("merge ids must be adjacent, got {:?}", ids),
                });
            }
        }
        let rows: Vec<&Segment> = ids.iter().map(|&id| self.get(id)).collect::<Result<_>>()?;

        let text = rows
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let mut words: Vec<Word> = rows
            .iter()
            .filter_map(|s| s.words.as_ref())
            .flat_map(|w| w.iter().cloned())
            .collect();
        words.sort_by(|a, b| a.start.total_cmp(&b.start).then(a.end.total_cmp(&b.end)));

        // Keep the speaker only when every merged row agrees.
        let speakers: Vec<Option<&str>> = rows.iter().map(|s| s.speaker_id.as_deref()).collect();
        let speaker_id = if speakers.windows(2).all(|p| p[0] == p[1]) {
            speakers.first().copied().flatten().map(str::to_string)
        } else {
            None
        };

        let mut merged = Segment::new(ids[0], rows[0].start, rows[rows.len() - 1].end, text);
        merged.speaker_id = speaker_id;
        merged.words = if words.is_empty() { None } else { Some(words) };
        merged.dirty = true;

        let mut segments = self.segments.clone();
        segments.splice(ids[0]..=ids[ids.len() - 1], [merged]);
        let mut table = SegmentTable::new(segments);
        table.renumber();
        table.validate()?;
        Ok(table)
    }

    /// Remove the named segments and renumber the remainder.
    pub fn delete_ids(&self, ids: &[usize]) -> Result<SegmentTable> {
        for &id in ids {
            self.get(id)?;
        }
        let segments = self
            .segments
            .iter()
            .filter(|s| !ids.contains(&s.id))
            .cloned()
            .collect();
        let mut table = SegmentTable::new(segments);
        table.renumber();
        table.validate()?;
        Ok(table)
    }

    /// Patch one segment.
    ///
    /// A `text` change invalidates `translated_text` and the clone unless
    /// the patch itself supplies a new `translated_text`. A
    /// `translated_text` change invalidates the clone.
    pub fn update(&self, id: usize, patch: &SegmentPatch) -> Result<SegmentTable> {
        self.get(id)?;
        let mut segments = self.segments.clone();
        let seg = &mut segments[id];

        let mut changed = false;
        if let Some(start) = patch.start {
            if start != seg.start {
                seg.start = start;
                changed = true;
            }
        }
        if let Some(end) = patch.end {
            if end != seg.end {
                seg.end = end;
                changed = true;
            }
        }
        if let Some(text) = &patch.text {
            if *text != seg.text {
                seg.text = text.clone();
                seg.invalidate_downstream();
                changed = true;
            }
        }
        if let Some(translated) = &patch.translated_text {
            if Some(translated) != seg.translated_text.as_ref() {
                seg.translated_text = Some(translated.clone());
                seg.clear_clone();
                changed = true;
            }
        }
        if changed {
            seg.dirty = true;
            seg.original_duration = Some(seg.end - seg.start);
        }

        let table = SegmentTable::new(segments);
        table.validate()?;
        Ok(table)
    }

    /// Reassign dense 0-based ids following the current order.
    pub fn renumber(&mut self) {
        for (idx, seg) in self.segments.iter_mut().enumerate() {
            seg.id = idx;
        }
    }
}

/// Map a character offset into a byte offset, clamped to the text length.
fn char_to_byte_offset(text: &str, char_offset: usize) -> usize {
    text.char_indices()
        .nth(char_offset)
        .map(|(byte, _)| byte)
        .unwrap_or(text.len())
}

/// Locate each word's byte span inside the segment text.
///
/// Words whose text cannot be found (engine/text mismatch) yield `None`;
/// the search cursor only advances past located words.
fn word_spans(text: &str, words: &[Word]) -> Vec<Option<(usize, usize)>> {
    let mut spans = Vec::with_capacity(words.len());
    let mut cursor = 0usize;
    for word in words {
        let needle = word.word.trim();
        if needle.is_empty() {
            spans.push(None);
            continue;
        }
        match text[cursor.min(text.len())..].find(needle) {
            Some(rel) => {
                let start = cursor + rel;
                let end = start + needle.len();
                spans.push(Some((start, end)));
                cursor = end;
            }
            None => spans.push(None),
        }
    }
    spans
}

/// Choose the word index before which to split, snapping a mid-word offset
/// to the nearer word edge. The result is clamped so neither half is empty.
fn snap_to_word_boundary(
    spans: &[Option<(usize, usize)>],
    byte_offset: usize,
    word_count: usize,
) -> usize {
    let mut split_idx = word_count;
    for (i, span) in spans.iter().enumerate() {
        let Some((start, end)) = span else { continue };
        if byte_offset < *start {
            // In the whitespace run before this word.
            split_idx = i;
            break;
        }
        if byte_offset < *end {
            split_idx = if byte_offset - start < end - byte_offset {
                i
            } else {
                i + 1
            };
            break;
        }
    }
    split_idx.clamp(1, word_count - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_world_segment() -> Segment {
        let mut seg = Segment::new(0, 0.0, 2.4, "Hello world");
        seg.words = Some(vec![
            Word {
                word: "Hello".to_string(),
                start: 0.0,
                end: 1.1,
            },
            Word {
                word: "world".to_string(),
                start: 1.3,
                end: 2.4,
            },
        ]);
        seg
    }

    fn three_segments() -> SegmentTable {
        SegmentTable::new(vec![
            Segment::new(0, 0.0, 3.0, "Hello."),
            Segment::new(1, 3.5, 6.2, "Good day."),
            Segment::new(2, 7.0, 9.0, "Farewell."),
        ])
    }

    #[test]
    fn test_validate_accepts_sorted_dense_table() {
        assert!(three_segments().validate().is_ok());
        assert!(SegmentTable::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_gap_in_ids() {
        let mut table = three_segments();
        table.segments[1].id = 5;
        assert!(matches!(
            table.validate(),
            Err(RedubError::InvalidSegments { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_interval() {
        let mut table = three_segments();
        table.segments[0].end = 0.0;
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unsorted() {
        let table = SegmentTable::new(vec![
            Segment::new(0, 5.0, 6.0, "b"),
            Segment::new(1, 0.0, 1.0, "a"),
        ]);
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_validate_allows_tolerated_overlap() {
        let table = SegmentTable::new(vec![
            Segment::new(0, 0.0, 1.05, "a"),
            Segment::new(1, 1.0, 2.0, "b"),
        ]);
        assert!(table.validate().is_ok());

        let table = SegmentTable::new(vec![
            Segment::new(0, 0.0, 1.5, "a"),
            Segment::new(1, 1.0, 2.0, "b"),
        ]);
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_split_at_offset_inside_second_word() {
        // "Hello world", offset 7 sits inside "world" but nearer its start,
        // so the split lands on the boundary after "Hello".
        let table = SegmentTable::new(vec![hello_world_segment()]);
        let split = table.split(0, 7).unwrap();

        assert_eq!(split.len(), 2);
        let left = &split.segments[0];
        let right = &split.segments[1];
        assert_eq!(left.id, 0);
        assert_eq!(right.id, 1);
        assert_eq!(left.text, "Hello");
        assert_eq!(right.text, "world");
        assert_eq!(left.start, 0.0);
        assert_eq!(left.end, 1.1);
        assert_eq!(right.start, 1.1);
        assert_eq!(right.end, 2.4);
        assert!(left.translated_text.is_none());
        assert!(right.translated_text.is_none());
        assert!(left.cloned_audio_path.is_none());
        assert!(left.dirty && right.dirty);
    }

    #[test]
    fn test_split_clears_translation_and_clone() {
        let mut seg = hello_world_segment();
        seg.translated_text = Some("Hallo Welt".to_string());
        seg.cloned_audio_path = Some(PathBuf::from("/tmp/clone.wav"));
        let table = SegmentTable::new(vec![seg]);

        let split = table.split(0, 5).unwrap();
        for seg in &split.segments {
            assert!(seg.translated_text.is_none());
            assert!(seg.cloned_audio_path.is_none());
        }
    }

    #[test]
    fn test_split_renumbers_trailing_ids() {
        let mut segments = three_segments().segments;
        segments[1].words = Some(vec![
            Word {
                word: "Good".to_string(),
                start: 3.5,
                end: 4.5,
            },
            Word {
                word: "day.".to_string(),
                start: 4.8,
                end: 6.2,
            },
        ]);
        let table = SegmentTable::new(segments);

        let split = table.split(1, 5).unwrap();
        assert_eq!(split.len(), 4);
        let ids: Vec<usize> = split.segments.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(split.segments[3].text, "Farewell.");
    }

    #[test]
    fn test_split_without_words_is_rejected() {
        let table = three_segments();
        assert!(matches!(
            table.split(0, 3),
            Err(RedubError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_merge_of_split_restores_interval_and_text() {
        let table = SegmentTable::new(vec![hello_world_segment()]);
        let split = table.split(0, 5).unwrap();
        let merged = split.merge(&[0, 1]).unwrap();

        assert_eq!(merged.len(), 1);
        let seg = &merged.segments[0];
        assert_eq!(seg.start, 0.0);
        assert_eq!(seg.end, 2.4);
        assert_eq!(seg.text, "Hello world");
    }

    #[test]
    fn test_merge_requires_adjacent_ids() {
        let table = three_segments();
        assert!(table.merge(&[0, 2]).is_err());
        assert!(table.merge(&[1]).is_err());
    }

    #[test]
    fn test_merge_keeps_uniform_speaker_only() {
        let mut segments = three_segments().segments;
        segments[0].speaker_id = Some("spk0".to_string());
        segments[1].speaker_id = Some("spk0".to_string());
        let merged = SegmentTable::new(segments.clone()).merge(&[0, 1]).unwrap();
        assert_eq!(merged.segments[0].speaker_id.as_deref(), Some("spk0"));

        segments[1].speaker_id = Some("spk1".to_string());
        let merged = SegmentTable::new(segments).merge(&[0, 1]).unwrap();
        assert!(merged.segments[0].speaker_id.is_none());
    }

    #[test]
    fn test_delete_renumbers() {
        let table = three_segments();
        let rest = table.delete_ids(&[1]).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest.segments[0].text, "Hello.");
        assert_eq!(rest.segments[1].text, "Farewell.");
        assert_eq!(rest.segments[1].id, 1);
    }

    #[test]
    fn test_delete_unknown_id_is_rejected() {
        let table = three_segments();
        assert!(table.delete_ids(&[9]).is_err());
    }

    #[test]
    fn test_update_text_clears_translation() {
        let mut segments = three_segments().segments;
        segments[0].translated_text = Some("Hallo.".to_string());
        segments[0].cloned_audio_path = Some(PathBuf::from("/tmp/c.wav"));
        let table = SegmentTable::new(segments);

        let patch = SegmentPatch {
            text: Some("Hi.".to_string()),
            ..Default::default()
        };
        let updated = table.update(0, &patch).unwrap();
        let seg = &updated.segments[0];
        assert_eq!(seg.text, "Hi.");
        assert!(seg.translated_text.is_none());
        assert!(seg.cloned_audio_path.is_none());
        assert!(seg.dirty);
    }

    #[test]
    fn test_update_text_with_explicit_translation_keeps_it() {
        let table = three_segments();
        let patch = SegmentPatch {
            text: Some("Hi.".to_string()),
            translated_text: Some("Salut.".to_string()),
            ..Default::default()
        };
        let updated = table.update(0, &patch).unwrap();
        assert_eq!(
            updated.segments[0].translated_text.as_deref(),
            Some("Salut.")
        );
    }

    #[test]
    fn test_update_translation_clears_clone_only() {
        let mut segments = three_segments().segments;
        segments[1].translated_text = Some("old".to_string());
        segments[1].cloned_audio_path = Some(PathBuf::from("/tmp/c.wav"));
        let table = SegmentTable::new(segments);

        let patch = SegmentPatch {
            translated_text: Some("new".to_string()),
            ..Default::default()
        };
        let updated = table.update(1, &patch).unwrap();
        let seg = &updated.segments[1];
        assert_eq!(seg.translated_text.as_deref(), Some("new"));
        assert_eq!(seg.text, "Good day.");
        assert!(seg.cloned_audio_path.is_none());
        assert!(seg.dirty);
    }

    #[test]
    fn test_update_rejects_invalid_timing() {
        let table = three_segments();
        let patch = SegmentPatch {
            end: Some(0.0),
            ..Default::default()
        };
        assert!(table.update(0, &patch).is_err());
    }

    #[test]
    fn test_json_is_plain_array() {
        let table = three_segments();
        let json = serde_json::to_string(&table).unwrap();
        assert!(json.starts_with('['));
        let parsed: SegmentTable = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, table);
    }

    #[test]
    fn test_optional_fields_skipped_in_json() {
        let table = SegmentTable::new(vec![Segment::new(0, 0.0, 1.0, "hi")]);
        let json = serde_json::to_string(&table).unwrap();
        assert!(!json.contains("translated_text"));
        assert!(!json.contains("dirty"));
        assert!(!json.contains("cloned_audio_path"));
    }
}
