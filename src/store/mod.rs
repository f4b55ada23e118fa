//! Durable per-task workspace on disk.
//!
//! The TaskStore owns every byte of per-task state: the copied input, stage
//! artifacts, the segment table and the status manifest. Writes go through a
//! temp file plus rename so concurrent readers never observe a partial file;
//! status read-modify-write is serialized by an in-process per-task mutex.

pub mod artifacts;
pub mod status;

use crate::error::{RedubError, Result};
use crate::segment::SegmentTable;
use artifacts::TaskPaths;
use serde::Serialize;
use serde::de::DeserializeOwned;
use status::{PauseAfter, StatusPatch, TaskStatus};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct TaskMeta {
    pub source_lang: String,
    pub target_lang: String,
    pub single_speaker: bool,
    pub pause_after: Option<PauseAfter>,
}

pub struct TaskStore {
    root: PathBuf,
    status_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskStore {
    /// Open (and create if needed) the tasks root directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            status_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the task directory, copy the input into it and write the
    /// initial `status.json`. Fails with `Conflict` if the directory exists.
    pub fn create(&self, task_id: &str, input: &Path, meta: &TaskMeta) -> Result<TaskPaths> {
        let paths = TaskPaths::new(&self.root, task_id)?;
        if paths.dir().exists() {
            return Err(RedubError::Conflict {
                message: format!("task directory already exists: {task_id}"),
            });
        }
        std::fs::create_dir_all(paths.dir())?;

        let extension = input
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        std::fs::copy(input, paths.source_input(&extension))?;

        let status = TaskStatus::new(
            task_id.to_string(),
            meta.source_lang.clone(),
            meta.target_lang.clone(),
            meta.single_speaker,
            meta.pause_after,
        );
        write_json_atomic(&paths.status_json(), &status)?;
        Ok(paths)
    }

    /// Resolve paths for an existing task, failing with `TaskNotFound` for
    /// unknown ids.
    pub fn paths(&self, task_id: &str) -> Result<TaskPaths> {
        let paths = TaskPaths::new(&self.root, task_id)?;
        if !paths.dir().is_dir() {
            return Err(RedubError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        }
        Ok(paths)
    }

    /// Write an artifact under the task directory via temp file + rename.
    pub fn put_artifact(&self, task_id: &str, relative: &Path, bytes: &[u8]) -> Result<PathBuf> {
        let paths = self.paths(task_id)?;
        let dest = paths.dir().join(relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_bytes_atomic(&dest, bytes)?;
        Ok(dest)
    }

    pub fn read_status(&self, task_id: &str) -> Result<TaskStatus> {
        let paths = self.paths(task_id)?;
        read_json(&paths.status_json())
    }

    /// Read-modify-write of `status.json` under the task's mutex.
    pub fn patch_status(&self, task_id: &str, patch: &StatusPatch) -> Result<TaskStatus> {
        let lock = self.status_lock(task_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let paths = self.paths(task_id)?;
        let mut status: TaskStatus = read_json(&paths.status_json())?;
        patch.apply(&mut status);
        write_json_atomic(&paths.status_json(), &status)?;
        Ok(status)
    }

    /// Load the canonical segment table, validating its invariants.
    pub fn read_segment_table(&self, task_id: &str) -> Result<SegmentTable> {
        let paths = self.paths(task_id)?;
        let table: SegmentTable = read_json(&paths.segments_json())?;
        table.validate().map_err(|e| RedubError::Corrupt {
            path: paths.segments_json().display().to_string(),
            message: e.to_string(),
        })?;
        Ok(table)
    }

    /// Validate and persist the segment table, refreshing the diagnostic
    /// translation text file alongside it.
    pub fn write_segment_table(&self, task_id: &str, table: &SegmentTable) -> Result<()> {
        table.validate()?;
        let paths = self.paths(task_id)?;
        write_json_atomic(&paths.segments_json(), table)?;
        if table
            .segments
            .iter()
            .any(|s| s.translated_text.is_some())
        {
            self.write_translation_txt(&paths, table)?;
        }
        Ok(())
    }

    /// Append a timestamped line to the task's processing log.
    pub fn append_log(&self, task_id: &str, line: &str) -> Result<()> {
        let paths = self.paths(task_id)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.processing_log())?;
        writeln!(file, "[{}] {line}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))?;
        Ok(())
    }

    /// List task directory names under the root, newest last.
    pub fn list_tasks(&self) -> Result<Vec<String>> {
        let mut tasks: Vec<String> = std::fs::read_dir(&self.root)?
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        tasks.sort();
        Ok(tasks)
    }

    /// Human-readable per-segment translation dump (diagnostic).
    fn write_translation_txt(&self, paths: &TaskPaths, table: &SegmentTable) -> Result<()> {
        let mut out = String::new();
        for seg in &table.segments {
            out.push_str(&format!(
                "Segment {} ({:.3}s - {:.3}s)",
                seg.id + 1,
                seg.start,
                seg.end
            ));
            if let Some(spk) = &seg.speaker_id {
                out.push_str(&format!(" [speaker: {spk}]"));
            }
            out.push_str(":\n");
            out.push_str(&format!("source: {}\n", seg.text));
            out.push_str(&format!(
                "target: {}\n\n",
                seg.translated_text.as_deref().unwrap_or("")
            ));
        }
        write_bytes_atomic(&paths.translation_txt(), out.as_bytes())
    }

    fn status_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .status_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Parse a JSON file, mapping parse failures to `Corrupt`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RedubError::TaskNotFound {
                task_id: path.display().to_string(),
            }
        } else {
            RedubError::Io(e)
        }
    })?;
    serde_json::from_str(&contents).map_err(|e| RedubError::Corrupt {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Serialize JSON to a temp file in the destination directory and rename it
/// into place, so readers never observe a partial file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_bytes_atomic(path, json.as_bytes())
}

fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| RedubError::Other(format!("artifact path has no parent: {}", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| RedubError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{Segment, SegmentTable};
    use tempfile::TempDir;

    const TASK_ID: &str = "2026-03-01_10-00-00_talk";

    fn meta() -> TaskMeta {
        TaskMeta {
            source_lang: "en".to_string(),
            target_lang: "de".to_string(),
            single_speaker: false,
            pause_after: None,
        }
    }

    fn store_with_task() -> (TempDir, TaskStore) {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("talk.mp4");
        std::fs::write(&input, b"fake media").unwrap();
        let store = TaskStore::new(dir.path().join("tasks")).unwrap();
        store.create(TASK_ID, &input, &meta()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_writes_status_and_input_copy() {
        let (_dir, store) = store_with_task();
        let status = store.read_status(TASK_ID).unwrap();
        assert_eq!(status.id, TASK_ID);
        assert_eq!(status.status, status::TaskState::Pending);
        assert_eq!(status.source_lang, "en");

        let paths = store.paths(TASK_ID).unwrap();
        let input = paths.find_source_input().unwrap();
        assert!(input.ends_with("talk_00_input.mp4"));
        assert_eq!(std::fs::read(input).unwrap(), b"fake media");
    }

    #[test]
    fn test_create_duplicate_is_conflict() {
        let (dir, store) = store_with_task();
        let input = dir.path().join("talk.mp4");
        assert!(matches!(
            store.create(TASK_ID, &input, &meta()),
            Err(RedubError::Conflict { .. })
        ));
    }

    #[test]
    fn test_unknown_task_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.read_status("2026-03-01_10-00-00_ghost"),
            Err(RedubError::TaskNotFound { .. })
        ));
    }

    #[test]
    fn test_patch_status_read_modify_write() {
        let (_dir, store) = store_with_task();
        let patch = StatusPatch {
            status: Some(status::TaskState::Processing),
            current_step: Some(3),
            progress: Some(33.0),
            ..Default::default()
        };
        let updated = store.patch_status(TASK_ID, &patch).unwrap();
        assert_eq!(updated.current_step, 3);

        let reread = store.read_status(TASK_ID).unwrap();
        assert_eq!(reread.status, status::TaskState::Processing);
        assert_eq!(reread.progress, 33.0);
        // Untouched fields survive the patch
        assert_eq!(reread.target_lang, "de");
    }

    #[test]
    fn test_segment_table_roundtrip() {
        let (_dir, store) = store_with_task();
        let table = SegmentTable::new(vec![
            Segment::new(0, 0.0, 3.0, "Hello."),
            Segment::new(1, 3.5, 6.2, "Good day."),
        ]);
        store.write_segment_table(TASK_ID, &table).unwrap();
        let loaded = store.read_segment_table(TASK_ID).unwrap();
        assert_eq!(loaded, table);
    }

    #[test]
    fn test_write_rejects_invalid_table() {
        let (_dir, store) = store_with_task();
        let table = SegmentTable::new(vec![Segment::new(0, 3.0, 1.0, "backwards")]);
        assert!(matches!(
            store.write_segment_table(TASK_ID, &table),
            Err(RedubError::InvalidSegments { .. })
        ));
    }

    #[test]
    fn test_read_corrupt_table() {
        let (_dir, store) = store_with_task();
        let paths = store.paths(TASK_ID).unwrap();
        std::fs::write(paths.segments_json(), b"{not json").unwrap();
        assert!(matches!(
            store.read_segment_table(TASK_ID),
            Err(RedubError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_translation_txt_written_with_translations() {
        let (_dir, store) = store_with_task();
        let mut seg = Segment::new(0, 0.0, 1.0, "Hello.");
        seg.translated_text = Some("Hallo.".to_string());
        store
            .write_segment_table(TASK_ID, &SegmentTable::new(vec![seg]))
            .unwrap();

        let paths = store.paths(TASK_ID).unwrap();
        let txt = std::fs::read_to_string(paths.translation_txt()).unwrap();
        assert!(txt.contains("Segment 1 (0.000s - 1.000s)"));
        assert!(txt.contains("target: Hallo."));
    }

    #[test]
    fn test_put_artifact_creates_subdirs() {
        let (_dir, store) = store_with_task();
        let dest = store
            .put_artifact(TASK_ID, Path::new("ref_audio/x.wav"), b"wav")
            .unwrap();
        assert!(dest.exists());
        assert_eq!(std::fs::read(dest).unwrap(), b"wav");
    }

    #[test]
    fn test_append_log() {
        let (_dir, store) = store_with_task();
        store.append_log(TASK_ID, "step 1 done").unwrap();
        store.append_log(TASK_ID, "step 2 done").unwrap();
        let paths = store.paths(TASK_ID).unwrap();
        let log = std::fs::read_to_string(paths.processing_log()).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("step 1 done"));
    }

    #[test]
    fn test_list_tasks() {
        let (dir, store) = store_with_task();
        let input = dir.path().join("talk.mp4");
        store
            .create("2026-03-01_11-00-00_other", &input, &meta())
            .unwrap();
        let tasks = store.list_tasks().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0], TASK_ID);
    }
}
