//! Maps protocol requests onto scheduler operations.

use crate::error::Result;
use crate::events::EventStream;
use crate::scheduler::{Scheduler, StartRequest};
use crate::server::ipc::OperationHandler;
use crate::server::protocol::{Request, Response};
use crate::store::status::TaskStatus;
use std::sync::Arc;

pub struct SchedulerHandler {
    scheduler: Arc<Scheduler>,
}

impl SchedulerHandler {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    async fn dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::Start {
                input,
                source_lang,
                target_lang,
                single_speaker,
                pause_after,
            } => {
                let status = self
                    .scheduler
                    .start(StartRequest {
                        input,
                        source_lang,
                        target_lang,
                        single_speaker,
                        pause_after,
                    })
                    .await?;
                Ok(Response::Status { status })
            }
            Request::Status { task_id } => Ok(Response::Status {
                status: self.scheduler.status(&task_id).await?,
            }),
            Request::Continue { task_id } => Ok(Response::Status {
                status: self.scheduler.continue_task(&task_id).await?,
            }),
            Request::Cancel { task_id } => Ok(Response::Status {
                status: self.scheduler.cancel(&task_id).await?,
            }),
            Request::ListTasks => Ok(Response::Tasks {
                tasks: self.scheduler.list_tasks().await?,
            }),
            Request::ListSegments { task_id } => Ok(Response::Segments {
                segments: self.scheduler.list_segments(&task_id).await?,
            }),
            Request::UpdateSegments { task_id, segments } => Ok(Response::Segments {
                segments: self.scheduler.update_segments(&task_id, segments).await?,
            }),
            Request::SplitSegment {
                task_id,
                id,
                text_offset,
            } => Ok(Response::Segments {
                segments: self
                    .scheduler
                    .split_segment(&task_id, id, text_offset)
                    .await?,
            }),
            Request::MergeSegments { task_id, ids } => Ok(Response::Segments {
                segments: self.scheduler.merge_segments(&task_id, &ids).await?,
            }),
            Request::DeleteSegments { task_id, ids } => Ok(Response::Segments {
                segments: self.scheduler.delete_segments(&task_id, &ids).await?,
            }),
            Request::RetranslateSegment {
                task_id,
                id,
                override_text,
            } => Ok(Response::Segment {
                segment: self
                    .scheduler
                    .retranslate_segment(&task_id, id, override_text)
                    .await?,
            }),
            Request::ResynthesizeSegment { task_id, id } => {
                self.scheduler.resynthesize_segment(&task_id, id).await?;
                Ok(Response::Ack {
                    message: format!("resynthesis of segment {id} queued"),
                })
            }
            Request::RegenerateFinal { task_id } => {
                self.scheduler.regenerate_final(&task_id).await?;
                Ok(Response::Ack {
                    message: "final track regeneration queued".to_string(),
                })
            }
            Request::Subscribe { .. } => {
                // Streaming is handled by the connection loop, not here.
                Err(crate::error::RedubError::IpcProtocol {
                    message: "subscribe is a streaming request".to_string(),
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl OperationHandler for SchedulerHandler {
    async fn handle(&self, request: Request) -> Response {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => Response::error(&e),
        }
    }

    async fn open_subscription(&self, task_id: &str) -> Result<(TaskStatus, EventStream)> {
        self.scheduler.subscribe(task_id).await
    }
}
