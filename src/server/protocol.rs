//! JSON message protocol between clients and the operation server.
//!
//! One request per connection, one JSON document per line. `subscribe` is
//! the exception: the connection stays open and the server streams `event`
//! responses until the client disconnects.

use crate::events::EventEnvelope;
use crate::segment::{Segment, SegmentTable};
use crate::store::status::{PauseAfter, TaskStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_lang() -> String {
    crate::defaults::AUTO_LANGUAGE.to_string()
}

/// Operations clients may invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Start a new translation task for an uploaded file.
    Start {
        input: PathBuf,
        #[serde(default = "default_lang")]
        source_lang: String,
        target_lang: String,
        #[serde(default)]
        single_speaker: bool,
        #[serde(default)]
        pause_after: Option<PauseAfter>,
    },
    /// Fetch the status manifest.
    Status { task_id: String },
    /// Resume a task paused at a checkpoint.
    Continue { task_id: String },
    /// Request cooperative cancellation.
    Cancel { task_id: String },
    /// List task ids under the tasks root.
    ListTasks,
    /// Fetch the segment table.
    ListSegments { task_id: String },
    /// Replace the segment table wholesale.
    UpdateSegments {
        task_id: String,
        segments: SegmentTable,
    },
    /// Split one segment at a character offset.
    SplitSegment {
        task_id: String,
        id: usize,
        text_offset: usize,
    },
    /// Merge adjacent segments.
    MergeSegments { task_id: String, ids: Vec<usize> },
    /// Delete segments.
    DeleteSegments { task_id: String, ids: Vec<usize> },
    /// Re-translate one segment, optionally with user-provided text.
    RetranslateSegment {
        task_id: String,
        id: usize,
        #[serde(default)]
        override_text: Option<String>,
    },
    /// Queue re-synthesis of one segment (async; completion via events).
    ResynthesizeSegment { task_id: String, id: usize },
    /// Queue regeneration of the final track (async; completion via events).
    RegenerateFinal { task_id: String },
    /// Stream this task's events; the current status arrives first.
    Subscribe { task_id: String },
}

impl Request {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Responses sent back to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Status { status: TaskStatus },
    Segments { segments: SegmentTable },
    Segment { segment: Segment },
    Tasks { tasks: Vec<String> },
    Ack { message: String },
    Event { event: EventEnvelope },
    Error { kind: String, message: String },
}

impl Response {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn error(e: &crate::error::RedubError) -> Self {
        Response::Error {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}
