//! Stage artifact naming inside a task directory.
//!
//! Every stage output follows the `<base>_NN_name.ext` scheme with the
//! per-segment files under `ref_audio/` and `cloned_audio/` and the speaker
//! tracks under `speakers/<spk>/`.

use crate::error::{RedubError, Result};
use std::path::{Path, PathBuf};

/// Length of the `YYYY-MM-DD_HH-MM-SS` prefix of a task id.
const TIMESTAMP_LEN: usize = 19;

/// Resolved paths for one task directory.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPaths {
    dir: PathBuf,
    base: String,
}

impl TaskPaths {
    pub fn new(tasks_root: &Path, task_id: &str) -> Result<Self> {
        let base = base_from_task_id(task_id)?;
        Ok(Self {
            dir: tasks_root.join(task_id),
            base,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn stage_file(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}_{name}", self.base))
    }

    pub fn status_json(&self) -> PathBuf {
        self.dir.join("status.json")
    }

    pub fn processing_log(&self) -> PathBuf {
        self.dir.join("processing_log.txt")
    }

    /// Copy of the submitted media, keeping its original extension.
    pub fn source_input(&self, extension: &str) -> PathBuf {
        if extension.is_empty() {
            self.stage_file("00_input")
        } else {
            self.stage_file(&format!("00_input.{extension}"))
        }
    }

    /// Locate the stored input regardless of its extension.
    pub fn find_source_input(&self) -> Result<PathBuf> {
        let prefix = format!("{}_00_input", self.base);
        let entries = std::fs::read_dir(&self.dir)?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                return Ok(entry.path());
            }
        }
        Err(RedubError::Corrupt {
            path: self.dir.display().to_string(),
            message: "source input file missing".to_string(),
        })
    }

    pub fn audio_wav(&self) -> PathBuf {
        self.stage_file("01_audio.wav")
    }

    pub fn vocals_wav(&self) -> PathBuf {
        self.stage_file("02_vocals.wav")
    }

    pub fn accompaniment_wav(&self) -> PathBuf {
        self.stage_file("02_accompaniment.wav")
    }

    pub fn speakers_dir(&self) -> PathBuf {
        self.dir.join("speakers")
    }

    pub fn speaker_wav(&self, speaker_id: &str) -> PathBuf {
        self.speakers_dir().join(speaker_id).join(format!("{speaker_id}.wav"))
    }

    pub fn speaker_map(&self, speaker_id: &str) -> PathBuf {
        self.speakers_dir()
            .join(speaker_id)
            .join(format!("{speaker_id}.json"))
    }

    pub fn segments_json(&self) -> PathBuf {
        self.stage_file("04_segments.json")
    }

    pub fn transcriber_raw_json(&self) -> PathBuf {
        self.stage_file("04_whisper_raw.json")
    }

    pub fn translation_txt(&self) -> PathBuf {
        self.stage_file("05_translation.txt")
    }

    pub fn ref_audio_dir(&self) -> PathBuf {
        self.dir.join("ref_audio")
    }

    pub fn ref_segment(&self, id: usize) -> PathBuf {
        self.ref_audio_dir()
            .join(format!("{}_06_ref_segment_{id:03}.wav", self.base))
    }

    pub fn cloned_audio_dir(&self) -> PathBuf {
        self.dir.join("cloned_audio")
    }

    pub fn cloned_segment(&self, id: usize) -> PathBuf {
        self.cloned_audio_dir()
            .join(format!("{}_07_segment_{id:03}.wav", self.base))
    }

    pub fn final_voice_wav(&self) -> PathBuf {
        self.stage_file("08_final_voice.wav")
    }

    pub fn final_video(&self) -> PathBuf {
        self.stage_file("09_translated.mp4")
    }

    /// Final output when the input was audio-only.
    pub fn final_audio(&self) -> PathBuf {
        self.stage_file("09_translated.wav")
    }
}

/// Derive a task id from the submitted file name: a local timestamp plus
/// the sanitized basename, which doubles as the directory name.
pub fn make_task_id(input: &Path, now: chrono::DateTime<chrono::Local>) -> String {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("media");
    format!("{}_{}", now.format("%Y-%m-%d_%H-%M-%S"), sanitize(stem))
}

/// Recover the sanitized basename from a task id.
pub fn base_from_task_id(task_id: &str) -> Result<String> {
    if task_id.len() <= TIMESTAMP_LEN + 1
        || task_id.as_bytes().get(TIMESTAMP_LEN) != Some(&b'_')
        || task_id.contains(['/', '\\'])
    {
        return Err(RedubError::InvalidRequest {
            message: format!("malformed task id: {task_id}"),
        });
    }
    Ok(task_id[TIMESTAMP_LEN + 1..].to_string())
}

/// Replace everything but alphanumerics, dashes and underscores, and bound
/// the length so the directory name stays portable.
fn sanitize(stem: &str) -> String {
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let trimmed: String = cleaned.chars().take(64).collect();
    if trimmed.is_empty() {
        "media".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> TaskPaths {
        TaskPaths::new(Path::new("/tasks"), "2026-03-01_10-00-00_talk").unwrap()
    }

    #[test]
    fn test_make_task_id() {
        let now = chrono::Local::now();
        let id = make_task_id(Path::new("/media/My Talk (final).mp4"), now);
        assert!(id.ends_with("_My_Talk__final_"));
        assert_eq!(id.as_bytes()[TIMESTAMP_LEN], b'_');
    }

    #[test]
    fn test_base_roundtrip() {
        let now = chrono::Local::now();
        let id = make_task_id(Path::new("talk.mp4"), now);
        assert_eq!(base_from_task_id(&id).unwrap(), "talk");
    }

    #[test]
    fn test_base_rejects_malformed_ids() {
        assert!(base_from_task_id("short").is_err());
        assert!(base_from_task_id("2026-03-01_10-00-00_").is_err());
        assert!(base_from_task_id("2026-03-01_10-00-00_../evil").is_err());
    }

    #[test]
    fn test_stage_file_names() {
        let p = paths();
        assert_eq!(
            p.audio_wav(),
            Path::new("/tasks/2026-03-01_10-00-00_talk/talk_01_audio.wav")
        );
        assert_eq!(
            p.segments_json(),
            Path::new("/tasks/2026-03-01_10-00-00_talk/talk_04_segments.json")
        );
        assert_eq!(
            p.final_voice_wav(),
            Path::new("/tasks/2026-03-01_10-00-00_talk/talk_08_final_voice.wav")
        );
        assert_eq!(
            p.final_video(),
            Path::new("/tasks/2026-03-01_10-00-00_talk/talk_09_translated.mp4")
        );
        assert_eq!(
            p.status_json(),
            Path::new("/tasks/2026-03-01_10-00-00_talk/status.json")
        );
    }

    #[test]
    fn test_per_segment_names_are_zero_padded() {
        let p = paths();
        assert!(p
            .ref_segment(7)
            .ends_with("ref_audio/talk_06_ref_segment_007.wav"));
        assert!(p
            .cloned_segment(123)
            .ends_with("cloned_audio/talk_07_segment_123.wav"));
    }

    #[test]
    fn test_speaker_paths() {
        let p = paths();
        assert!(p.speaker_wav("spk0").ends_with("speakers/spk0/spk0.wav"));
        assert!(p.speaker_map("spk1").ends_with("speakers/spk1/spk1.json"));
    }

    #[test]
    fn test_sanitize_bounds_length() {
        let long = "x".repeat(100);
        assert_eq!(sanitize(&long).len(), 64);
        assert_eq!(sanitize(""), "media");
    }
}
