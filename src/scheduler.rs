//! Task admission, concurrency bounding and operation routing.
//!
//! The scheduler keeps an in-process registry of running workers (for
//! cancellation) and serializes operations per task. The disk is the source
//! of truth for task state; the registry only tracks liveness. A global
//! semaphore bounds how many tasks process concurrently; queued tasks stay
//! `pending` until a permit frees up.

use crate::config::Config;
use crate::engines::EngineSet;
use crate::error::{RedubError, Result};
use crate::events::{EventBus, EventStream};
use crate::pipeline::executor::Executor;
use crate::pipeline::Stage;
use crate::segment::{Segment, SegmentPatch, SegmentTable};
use crate::store::artifacts::make_task_id;
use crate::store::status::{PauseAfter, TaskState, TaskStatus};
use crate::store::{TaskMeta, TaskStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::info;

/// Parameters of the `start` operation.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub input: PathBuf,
    pub source_lang: String,
    pub target_lang: String,
    pub single_speaker: bool,
    pub pause_after: Option<PauseAfter>,
}

enum WorkerJob {
    Pipeline(Stage),
    Resynthesize(usize),
    Regenerate,
}

pub struct Scheduler {
    store: Arc<TaskStore>,
    engines: EngineSet,
    config: Config,
    events: Arc<EventBus>,
    permits: Arc<Semaphore>,
    /// task id -> cancellation flag of the running worker.
    active: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        engines: EngineSet,
        config: Config,
        events: Arc<EventBus>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.scheduler.max_concurrent_tasks.max(1)));
        Self {
            store,
            engines,
            config,
            events,
            permits,
            active: Arc::new(Mutex::new(HashMap::new())),
            op_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Create the task workspace and queue the pipeline worker.
    pub async fn start(&self, req: StartRequest) -> Result<TaskStatus> {
        if !req.input.is_file() {
            return Err(RedubError::InvalidRequest {
                message: format!("input file does not exist: {}", req.input.display()),
            });
        }
        let task_id = make_task_id(&req.input, chrono::Local::now());
        let lock = self.op_lock(&task_id);
        let _guard = lock.lock().await;

        let meta = TaskMeta {
            source_lang: req.source_lang,
            target_lang: req.target_lang,
            single_speaker: req.single_speaker,
            pause_after: req.pause_after,
        };
        self.store.create(&task_id, &req.input, &meta)?;
        info!(task = %task_id, "task created");
        self.spawn_worker(task_id.clone(), WorkerJob::Pipeline(Stage::ExtractAudio))?;
        self.store.read_status(&task_id)
    }

    /// Resume a paused task, picking up any human edits from disk.
    pub async fn continue_task(&self, task_id: &str) -> Result<TaskStatus> {
        let lock = self.op_lock(task_id);
        let _guard = lock.lock().await;

        let status = self.store.read_status(task_id)?;
        let resume = match status.status {
            TaskState::PausedStep4 => Stage::resume_after(PauseAfter::Step4),
            TaskState::PausedStep5 => Stage::resume_after(PauseAfter::Step5),
            other => {
                return Err(RedubError::Conflict {
                    message: format!("continue requires a paused task, status is {other:?}"),
                })
            }
        };
        self.spawn_worker(task_id.to_string(), WorkerJob::Pipeline(resume))?;
        self.store.read_status(task_id)
    }

    /// Request cooperative cancellation of the running worker.
    pub async fn cancel(&self, task_id: &str) -> Result<TaskStatus> {
        let lock = self.op_lock(task_id);
        let _guard = lock.lock().await;

        let flag = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned();
        match flag {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(task = %task_id, "cancellation requested");
                self.store.read_status(task_id)
            }
            None => Err(RedubError::Conflict {
                message: format!("task {task_id} is not running"),
            }),
        }
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskStatus> {
        self.store.read_status(task_id)
    }

    pub async fn list_tasks(&self) -> Result<Vec<String>> {
        self.store.list_tasks()
    }

    /// Current segment table with durations refreshed from disk.
    pub async fn list_segments(&self, task_id: &str) -> Result<SegmentTable> {
        let lock = self.op_lock(task_id);
        let _guard = lock.lock().await;
        let mut table = self.read_table(task_id)?;
        for seg in &mut table.segments {
            refresh_clone_duration(seg);
        }
        Ok(table)
    }

    /// Full table replacement; invariants re-validated before the write.
    pub async fn update_segments(&self, task_id: &str, table: SegmentTable) -> Result<SegmentTable> {
        let lock = self.op_lock(task_id);
        let _guard = lock.lock().await;
        self.require_editable(task_id)?;

        // Guard against a truncated editor payload wiping the table.
        let existing = self.read_table(task_id)?;
        if !existing.is_empty() && table.len() * 2 < existing.len() {
            return Err(RedubError::InvalidRequest {
                message: format!(
                    "replacement drops too many segments ({} -> {})",
                    existing.len(),
                    table.len()
                ),
            });
        }
        self.store.write_segment_table(task_id, &table)?;
        Ok(table)
    }

    pub async fn split_segment(
        &self,
        task_id: &str,
        id: usize,
        text_offset: usize,
    ) -> Result<SegmentTable> {
        let lock = self.op_lock(task_id);
        let _guard = lock.lock().await;
        self.require_editable(task_id)?;
        let table = self.read_table(task_id)?.split(id, text_offset)?;
        self.store.write_segment_table(task_id, &table)?;
        Ok(table)
    }

    pub async fn merge_segments(&self, task_id: &str, ids: &[usize]) -> Result<SegmentTable> {
        let lock = self.op_lock(task_id);
        let _guard = lock.lock().await;
        self.require_editable(task_id)?;
        let table = self.read_table(task_id)?.merge(ids)?;
        self.store.write_segment_table(task_id, &table)?;
        Ok(table)
    }

    pub async fn delete_segments(&self, task_id: &str, ids: &[usize]) -> Result<SegmentTable> {
        let lock = self.op_lock(task_id);
        let _guard = lock.lock().await;
        self.require_editable(task_id)?;
        let table = self.read_table(task_id)?.delete_ids(ids)?;
        self.store.write_segment_table(task_id, &table)?;
        Ok(table)
    }

    /// Re-translate one segment, either with the supplied override or by
    /// calling the translator for just that text.
    pub async fn retranslate_segment(
        &self,
        task_id: &str,
        id: usize,
        override_text: Option<String>,
    ) -> Result<Segment> {
        let lock = self.op_lock(task_id);
        let _guard = lock.lock().await;
        self.require_editable(task_id)?;

        let table = self.read_table(task_id)?;
        let seg = table.get(id)?;
        let translated = match override_text {
            Some(text) => text,
            None => {
                let status = self.store.read_status(task_id)?;
                let batch = [seg.text.clone()];
                let out = self.engines.translator.translate(
                    &batch,
                    &status.source_lang,
                    &status.target_lang,
                )?;
                out.into_iter().next().ok_or_else(|| RedubError::EngineFailure {
                    engine: "translator".to_string(),
                    message: "empty result for single-segment request".to_string(),
                })?
            }
        };
        let table = table.update(
            id,
            &SegmentPatch {
                translated_text: Some(translated),
                ..Default::default()
            },
        )?;
        self.store.write_segment_table(task_id, &table)?;
        Ok(table.segments[id].clone())
    }

    /// Queue surgical re-synthesis of one segment (stages 6+7 only).
    /// Completion is signaled on the event bus.
    pub async fn resynthesize_segment(&self, task_id: &str, id: usize) -> Result<()> {
        let lock = self.op_lock(task_id);
        let _guard = lock.lock().await;
        self.require_editable(task_id)?;
        self.read_table(task_id)?.get(id)?;
        self.spawn_worker(task_id.to_string(), WorkerJob::Resynthesize(id))
    }

    /// Queue regeneration of the final voice track and container
    /// (stages 8+9). Completion is signaled on the event bus.
    pub async fn regenerate_final(&self, task_id: &str) -> Result<()> {
        let lock = self.op_lock(task_id);
        let _guard = lock.lock().await;
        self.require_editable(task_id)?;
        self.spawn_worker(task_id.to_string(), WorkerJob::Regenerate)
    }

    /// Snapshot plus live stream for one task.
    pub async fn subscribe(&self, task_id: &str) -> Result<(TaskStatus, EventStream)> {
        let status = self.store.read_status(task_id)?;
        Ok((status, self.events.subscribe(task_id)))
    }

    /// Register the worker and hand it to a dedicated thread once a permit
    /// frees up. The cancellation flag is visible immediately so queued
    /// tasks can be cancelled too.
    fn spawn_worker(&self, task_id: String, job: WorkerJob) -> Result<()> {
        let cancel = {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(&task_id) {
                return Err(RedubError::Conflict {
                    message: format!("task {task_id} already has a running worker"),
                });
            }
            let flag = Arc::new(AtomicBool::new(false));
            active.insert(task_id.clone(), Arc::clone(&flag));
            flag
        };

        let store = Arc::clone(&self.store);
        let engines = self.engines.clone();
        let config = self.config.clone();
        let events = Arc::clone(&self.events);
        let permits = Arc::clone(&self.permits);
        let active = Arc::clone(&self.active);

        tokio::spawn(async move {
            let Ok(permit) = permits.acquire_owned().await else {
                active
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&task_id);
                return;
            };
            std::thread::spawn(move || {
                let _permit = permit;
                let executor = Executor::new(
                    task_id.clone(),
                    store,
                    engines,
                    config,
                    events,
                    cancel,
                );
                match job {
                    WorkerJob::Pipeline(stage) => executor.drive(stage),
                    WorkerJob::Resynthesize(id) => {
                        // Failures touch only the segment; the task status
                        // is left alone.
                        if let Err(e) = executor.resynthesize(id) {
                            executor.publish_error(&e);
                        }
                    }
                    WorkerJob::Regenerate => {
                        if let Err(e) = executor.regenerate() {
                            executor.fail(&e);
                        }
                    }
                }
                active
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&task_id);
            });
        });
        Ok(())
    }

    fn require_editable(&self, task_id: &str) -> Result<()> {
        let status = self.store.read_status(task_id)?;
        if status.status.allows_editing() {
            Ok(())
        } else {
            Err(RedubError::Conflict {
                message: format!(
                    "segments are not editable while the task is {:?}",
                    status.status
                ),
            })
        }
    }

    fn read_table(&self, task_id: &str) -> Result<SegmentTable> {
        let paths = self.store.paths(task_id)?;
        if !paths.segments_json().exists() {
            return Err(RedubError::Conflict {
                message: "segment table not available before stage 4".to_string(),
            });
        }
        self.store.read_segment_table(task_id)
    }

    fn op_lock(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.op_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn refresh_clone_duration(seg: &mut Segment) {
    seg.original_duration = Some(seg.end - seg.start);
    if let Some(path) = &seg.cloned_audio_path {
        if let Ok(duration) = crate::audio::wav::duration_seconds(path) {
            seg.cloned_duration = Some(duration);
            if seg.end - seg.start > 0.0 {
                seg.duration_multiplier = Some(duration / (seg.end - seg.start));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::mock::{
        MockCloner, MockExtractor, MockMuxer, MockSeparator, MockStretcher, MockTracker,
        MockTranscriber, MockTranslator,
    };
    use tempfile::TempDir;

    fn mock_engines() -> EngineSet {
        EngineSet {
            extractor: Arc::new(MockExtractor::new()),
            separator: Arc::new(MockSeparator::new()),
            tracker: Arc::new(MockTracker::new()),
            transcriber: Arc::new(MockTranscriber::new()),
            translator: Arc::new(MockTranslator::new()),
            cloner: Arc::new(MockCloner::new()),
            stretcher: Arc::new(MockStretcher),
            muxer: Arc::new(MockMuxer),
        }
    }

    fn scheduler(dir: &TempDir) -> Scheduler {
        let store = Arc::new(TaskStore::new(dir.path().join("tasks")).unwrap());
        let config = Config::default();
        let events = Arc::new(EventBus::new(config.events.queue_capacity));
        Scheduler::new(store, mock_engines(), config, events)
    }

    #[tokio::test]
    async fn test_start_rejects_missing_input() {
        let dir = TempDir::new().unwrap();
        let sched = scheduler(&dir);
        let err = sched
            .start(StartRequest {
                input: dir.path().join("missing.mp4"),
                source_lang: "en".to_string(),
                target_lang: "de".to_string(),
                single_speaker: true,
                pause_after: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RedubError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_status_unknown_task() {
        let dir = TempDir::new().unwrap();
        let sched = scheduler(&dir);
        assert!(matches!(
            sched.status("2026-03-01_10-00-00_none").await,
            Err(RedubError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_requires_running_worker() {
        let dir = TempDir::new().unwrap();
        let sched = scheduler(&dir);
        assert!(matches!(
            sched.cancel("2026-03-01_10-00-00_idle").await,
            Err(RedubError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_continue_requires_paused_state() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.wav");
        crate::audio::wav::save(
            &input,
            &crate::audio::wav::AudioBuffer::silence(1.0, 16_000),
        )
        .unwrap();
        let sched = scheduler(&dir);
        let status = sched
            .start(StartRequest {
                input,
                source_lang: "en".to_string(),
                target_lang: "en".to_string(),
                single_speaker: true,
                pause_after: None,
            })
            .await
            .unwrap();

        // Wait for the worker to reach a terminal state.
        for _ in 0..200 {
            let s = sched.status(&status.id).await.unwrap();
            if s.status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let err = sched.continue_task(&status.id).await.unwrap_err();
        assert!(matches!(err, RedubError::Conflict { .. }));
    }
}
