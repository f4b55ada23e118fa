//! Command implementations for the redub binary.

use crate::config::Config;
use crate::error::{RedubError, Result};
use crate::scheduler::StartRequest;
use crate::server::{build_engines, build_scheduler, run_serve};
use crate::store::status::PauseAfter;
use crate::store::TaskStore;
use std::path::PathBuf;
use std::time::Duration;

/// Run the daemon until a shutdown signal arrives.
pub async fn serve(config: Config, socket: Option<PathBuf>) -> Result<()> {
    run_serve(config, socket).await
}

/// One-shot translation: start a task and follow it to a terminal or
/// paused state, echoing progress to stderr.
pub async fn translate(
    config: Config,
    input: PathBuf,
    source_lang: String,
    target_lang: String,
    single_speaker: bool,
    pause_after: Option<PauseAfter>,
) -> Result<()> {
    let engines = build_engines(&config)?;
    let scheduler = build_scheduler(&config, engines)?;

    let status = scheduler
        .start(StartRequest {
            input,
            source_lang,
            target_lang,
            single_speaker,
            pause_after,
        })
        .await?;
    eprintln!("task started: {}", status.id);

    let (_snapshot, mut stream) = scheduler.subscribe(&status.id).await?;
    let mut last_message = String::new();
    loop {
        // Follow events, but fall back to status polling so a quietly
        // finished worker still terminates the loop.
        match tokio::time::timeout(Duration::from_millis(500), stream.next()).await {
            Ok(Some(event)) => {
                if let Some(message) = event.payload.get("message").and_then(|m| m.as_str()) {
                    if message != last_message {
                        eprintln!("{message}");
                        last_message = message.to_string();
                    }
                }
            }
            Ok(None) => {}
            Err(_) => {}
        }

        let current = scheduler.status(&status.id).await?;
        if current.status.is_terminal() || current.status.is_paused() {
            let paths = scheduler.store().paths(&status.id)?;
            match current.status {
                crate::store::status::TaskState::Completed => {
                    println!("{}", paths.final_video().display());
                }
                crate::store::status::TaskState::Failed => {
                    return Err(RedubError::Other(
                        current.error.unwrap_or_else(|| "task failed".to_string()),
                    ));
                }
                _ => {
                    eprintln!(
                        "task paused; edit {} and continue via the server",
                        paths.segments_json().display()
                    );
                }
            }
            return Ok(());
        }
    }
}

/// List task directories under the configured root.
pub fn tasks(config: Config) -> Result<()> {
    let store = TaskStore::new(config.tasks.root)?;
    for task_id in store.list_tasks()? {
        match store.read_status(&task_id) {
            Ok(status) => println!("{task_id}  {:?}  {}", status.status, status.message),
            Err(_) => println!("{task_id}  <no status>"),
        }
    }
    Ok(())
}

/// Print one task's status manifest as JSON.
pub fn status(config: Config, task_id: &str) -> Result<()> {
    let store = TaskStore::new(config.tasks.root)?;
    let status = store.read_status(task_id)?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Parse the `--pause-after` argument.
pub fn parse_pause_after(value: &str) -> Result<PauseAfter> {
    match value {
        "step4" => Ok(PauseAfter::Step4),
        "step5" => Ok(PauseAfter::Step5),
        other => Err(RedubError::InvalidRequest {
            message: format!("pause_after must be step4 or step5, got {other}"),
        }),
    }
}
