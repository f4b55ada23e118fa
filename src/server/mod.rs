//! Operation server: socket boundary, request handler and daemon runner.

pub mod handler;
pub mod ipc;
pub mod protocol;

use crate::config::Config;
use crate::engines::command::{
    CommandCloner, CommandSeparator, CommandTracker, CommandTranscriber, CommandTranslator,
};
use crate::engines::ffmpeg::{FfmpegAudioExtractor, FfmpegMuxer, FfmpegTimeStretcher};
use crate::engines::{
    EngineSet, PassthroughSeparator, SpeakerTracker, Transcriber, Translator, Unconfigured,
    VocalSeparator, VoiceCloner,
};
use crate::error::{RedubError, Result};
use crate::events::EventBus;
use crate::scheduler::Scheduler;
use crate::store::TaskStore;
use handler::SchedulerHandler;
use ipc::IpcServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Build the engine set from configuration: ffmpeg for the media tool
/// concerns, configured command backends for the model concerns.
pub fn build_engines(config: &Config) -> Result<EngineSet> {
    let ffmpeg = config.engines.ffmpeg_path().to_string();

    let separator: Arc<dyn VocalSeparator> = match &config.engines.separate_command {
        Some(template) => Arc::new(CommandSeparator::new(template)?),
        None => Arc::new(PassthroughSeparator),
    };
    let tracker: Arc<dyn SpeakerTracker> = match &config.engines.diarize_command {
        Some(template) => Arc::new(CommandTracker::new(template)?),
        None => Arc::new(Unconfigured::new("engines.diarize_command")),
    };
    let transcriber: Arc<dyn Transcriber> = match &config.engines.transcribe_command {
        Some(template) => Arc::new(CommandTranscriber::new(template)?),
        None => Arc::new(Unconfigured::new("engines.transcribe_command")),
    };
    let translator: Arc<dyn Translator> = match &config.engines.translate_command {
        Some(template) => Arc::new(CommandTranslator::new(template)?),
        None => Arc::new(Unconfigured::new("engines.translate_command")),
    };
    let cloner: Arc<dyn VoiceCloner> = match &config.engines.clone_command {
        Some(template) => Arc::new(CommandCloner::new(template)?),
        None => Arc::new(Unconfigured::new("engines.clone_command")),
    };

    Ok(EngineSet {
        extractor: Arc::new(FfmpegAudioExtractor::new(ffmpeg.clone())),
        separator,
        tracker,
        transcriber,
        translator,
        cloner,
        stretcher: Arc::new(FfmpegTimeStretcher::new(ffmpeg.clone())),
        muxer: Arc::new(FfmpegMuxer::new(ffmpeg)),
    })
}

/// Build the scheduler over a fresh store and event bus.
pub fn build_scheduler(config: &Config, engines: EngineSet) -> Result<Arc<Scheduler>> {
    let store = Arc::new(TaskStore::new(config.tasks.root.clone())?);
    let events = Arc::new(EventBus::new(config.events.queue_capacity));
    Ok(Arc::new(Scheduler::new(
        store,
        engines,
        config.clone(),
        events,
    )))
}

/// Run the daemon: bind the socket, serve operations, wait for shutdown.
pub async fn run_serve(config: Config, socket_path: Option<PathBuf>) -> Result<()> {
    let engines = build_engines(&config)?;
    let scheduler = build_scheduler(&config, engines)?;

    let socket_path = socket_path
        .or_else(|| config.tasks.socket.clone())
        .unwrap_or_else(IpcServer::default_socket_path);
    let server = Arc::new(IpcServer::new(socket_path)?);

    info!(
        socket = %server.socket_path().display(),
        tasks_root = %config.tasks.root.display(),
        "operation server listening"
    );

    let handler = SchedulerHandler::new(scheduler);
    let server_clone = Arc::clone(&server);
    let server_handle = tokio::spawn(async move { server_clone.start(handler).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        res = wait_for_sigterm() => {
            if let Err(e) = res {
                tracing::error!(error = %e, "failed to set up signal handler");
            }
            info!("received SIGTERM, shutting down");
        }
    }

    server.stop().await?;
    if let Err(e) = server_handle.await {
        tracing::error!(error = %e, "server task failed");
    }
    Ok(())
}

/// Wait for SIGTERM (used under systemd).
#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| RedubError::Other(format!("Failed to register SIGTERM handler: {e}")))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await
}
