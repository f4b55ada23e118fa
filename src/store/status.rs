//! The per-task status manifest (`status.json`).

use serde::{Deserialize, Serialize};

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Processing,
    PausedStep4,
    PausedStep5,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_paused(self) -> bool {
        matches!(self, TaskState::PausedStep4 | TaskState::PausedStep5)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// States in which human edits to the segment table are accepted.
    pub fn allows_editing(self) -> bool {
        self.is_paused() || self.is_terminal()
    }
}

/// Requested human-in-the-loop checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseAfter {
    Step4,
    Step5,
}

/// Contents of `status.json`. Persisted atomically after every stage
/// transition; the on-disk copy is the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub status: TaskState,
    /// Stage most recently completed or in progress, 0-9.
    pub current_step: u8,
    /// 0-100; monotonic within a stage.
    pub progress: f32,
    pub message: String,
    pub step_name: String,
    pub current_segment: usize,
    pub total_segments: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_after: Option<PauseAfter>,
    pub source_lang: String,
    pub target_lang: String,
    pub single_speaker: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskStatus {
    pub fn new(
        id: String,
        source_lang: String,
        target_lang: String,
        single_speaker: bool,
        pause_after: Option<PauseAfter>,
    ) -> Self {
        let now = chrono::Local::now().to_rfc3339();
        Self {
            id,
            status: TaskState::Pending,
            current_step: 0,
            progress: 0.0,
            message: "task created".to_string(),
            step_name: String::new(),
            current_segment: 0,
            total_segments: 0,
            error: None,
            pause_after,
            source_lang,
            target_lang,
            single_speaker,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Read-modify-write patch for `status.json`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub status: Option<TaskState>,
    pub current_step: Option<u8>,
    pub progress: Option<f32>,
    pub message: Option<String>,
    pub step_name: Option<String>,
    pub current_segment: Option<usize>,
    pub total_segments: Option<usize>,
    pub error: Option<Option<String>>,
    pub source_lang: Option<String>,
}

impl StatusPatch {
    pub fn apply(&self, status: &mut TaskStatus) {
        if let Some(s) = self.status {
            status.status = s;
        }
        if let Some(step) = self.current_step {
            status.current_step = step;
        }
        if let Some(p) = self.progress {
            status.progress = p;
        }
        if let Some(m) = &self.message {
            status.message = m.clone();
        }
        if let Some(n) = &self.step_name {
            status.step_name = n.clone();
        }
        if let Some(c) = self.current_segment {
            status.current_segment = c;
        }
        if let Some(t) = self.total_segments {
            status.total_segments = t;
        }
        if let Some(e) = &self.error {
            status.error = e.clone();
        }
        if let Some(l) = &self.source_lang {
            status.source_lang = l.clone();
        }
        status.updated_at = chrono::Local::now().to_rfc3339();
    }
}
