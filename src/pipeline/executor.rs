//! Per-task worker driving the pipeline.
//!
//! One executor owns one task workspace and runs stages sequentially on a
//! dedicated thread; engine calls block. The canonical segment table lives
//! on disk: the executor reads before each stage and writes atomically
//! after, so `continue` after a pause picks up human edits for free.
//! Cancellation is cooperative and observed at every stage boundary and
//! per-segment iteration.

use crate::audio::wav::{self, AudioBuffer};
use crate::config::Config;
use crate::defaults;
use crate::engines::{EngineSet, TranscribedSegment};
use crate::error::{RedubError, Result};
use crate::events::{EventBus, EventEnvelope, EventKind};
use crate::pipeline::merger::Merger;
use crate::pipeline::Stage;
use crate::segment::{Segment, SegmentTable, Word};
use crate::speaker::SpeakerTrack;
use crate::store::artifacts::TaskPaths;
use crate::store::status::{StatusPatch, TaskState};
use crate::store::{write_json_atomic, TaskStore};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct Executor {
    task_id: String,
    store: Arc<TaskStore>,
    engines: EngineSet,
    config: Config,
    events: Arc<EventBus>,
    cancel: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(
        task_id: String,
        store: Arc<TaskStore>,
        engines: EngineSet,
        config: Config,
        events: Arc<EventBus>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            task_id,
            store,
            engines,
            config,
            events,
            cancel,
        }
    }

    /// Run from `start` to completion, a pause checkpoint, or failure,
    /// always leaving a terminal state in `status.json`.
    pub fn drive(&self, start: Stage) {
        if let Err(e) = self.run_from(start) {
            self.fail(&e);
        }
    }

    /// Transition the task to `failed`, recording the error and notifying
    /// subscribers. Cancellation takes this path too.
    pub fn fail(&self, e: &RedubError) {
        let message = e.to_string();
        error!(task = %self.task_id, error = %message, "task failed");
        let _ = self.store.patch_status(
            &self.task_id,
            &StatusPatch {
                status: Some(TaskState::Failed),
                message: Some(message.clone()),
                error: Some(Some(format!("{}: {message}", e.kind()))),
                ..Default::default()
            },
        );
        let _ = self
            .store
            .append_log(&self.task_id, &format!("task failed: {message}"));
        self.events
            .publish(EventEnvelope::error(&self.task_id, e.kind(), &message));
        self.publish_status();
    }

    /// Emit an error event without touching the task status.
    pub fn publish_error(&self, e: &RedubError) {
        self.events
            .publish(EventEnvelope::error(&self.task_id, e.kind(), &e.to_string()));
    }

    /// Run stages from `start` onward; returns at completion or at a
    /// requested pause checkpoint.
    pub fn run_from(&self, start: Stage) -> Result<()> {
        let status = self.store.read_status(&self.task_id)?;
        self.store.patch_status(
            &self.task_id,
            &StatusPatch {
                status: Some(TaskState::Processing),
                error: Some(None),
                message: Some("processing".to_string()),
                ..Default::default()
            },
        )?;
        self.publish_status();

        let mut warnings = Vec::new();
        let mut stage = Some(start);
        while let Some(current) = stage {
            self.check_cancel()?;
            if current == Stage::SpeakerTracks && status.single_speaker {
                stage = current.next();
                continue;
            }

            self.report_progress(current, 0.0, None)?;
            info!(task = %self.task_id, stage = current.step_name(), "stage started");
            self.run_stage(current, &mut warnings)?;
            self.report_progress(current, 1.0, None)?;
            self.store
                .append_log(&self.task_id, &format!("{} completed", current.step_name()))?;

            if let Some(checkpoint) = current.checkpoint() {
                if status.pause_after == Some(checkpoint) {
                    let paused = match checkpoint {
                        crate::store::status::PauseAfter::Step4 => TaskState::PausedStep4,
                        crate::store::status::PauseAfter::Step5 => TaskState::PausedStep5,
                    };
                    self.store.patch_status(
                        &self.task_id,
                        &StatusPatch {
                            status: Some(paused),
                            message: Some(format!(
                                "{} complete, awaiting edits",
                                current.step_name()
                            )),
                            ..Default::default()
                        },
                    )?;
                    self.publish_status();
                    info!(task = %self.task_id, "paused at checkpoint");
                    return Ok(());
                }
            }
            stage = current.next();
        }

        let message = if warnings.is_empty() {
            "translation completed".to_string()
        } else {
            format!("translation completed with warnings: {}", warnings.join("; "))
        };
        self.store.patch_status(
            &self.task_id,
            &StatusPatch {
                status: Some(TaskState::Completed),
                current_step: Some(9),
                progress: Some(100.0),
                message: Some(message),
                current_segment: Some(0),
                total_segments: Some(0),
                ..Default::default()
            },
        )?;
        self.publish_status();
        info!(task = %self.task_id, "task completed");
        Ok(())
    }

    /// Re-run stages 6 and 7 for a single segment.
    ///
    /// A cloning failure updates only that segment and emits an error
    /// event; the task status is untouched either way.
    pub fn resynthesize(&self, seg_id: usize) -> Result<()> {
        let paths = self.store.paths(&self.task_id)?;
        let mut table = self.store.read_segment_table(&self.task_id)?;
        let seg = table.get(seg_id)?.clone();

        self.extract_reference(&paths, &seg)?;
        let text = seg
            .translated_text
            .clone()
            .unwrap_or_else(|| seg.text.clone());
        let clone_path = paths.cloned_segment(seg_id);

        match self
            .engines
            .cloner
            .clone_voice(&paths.ref_segment(seg_id), &text, &clone_path)
        {
            Ok(()) => {
                let seg = &mut table.segments[seg_id];
                seg.cloned_audio_path = Some(clone_path.clone());
                seg.error = None;
                refresh_durations(seg);
                // Still dirty: stage 8 has not seen the new clone yet.
                seg.dirty = true;
                self.store.write_segment_table(&self.task_id, &table)?;
                self.store.append_log(
                    &self.task_id,
                    &format!("segment {seg_id} resynthesized"),
                )?;
                self.events.publish(EventEnvelope::new(
                    &self.task_id,
                    EventKind::ResynthesizeComplete,
                    json!({
                        "segment_id": seg_id,
                        "audio_path": clone_path.display().to_string(),
                    }),
                ));
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                warn!(task = %self.task_id, segment = seg_id, error = %message, "resynthesis failed");
                let seg = &mut table.segments[seg_id];
                seg.error = Some(message.clone());
                self.store.write_segment_table(&self.task_id, &table)?;
                self.events
                    .publish(EventEnvelope::error(&self.task_id, e.kind(), &message));
                Ok(())
            }
        }
    }

    /// Re-run stages 8 and 9 from current on-disk state.
    pub fn regenerate(&self) -> Result<()> {
        let mut warnings = Vec::new();
        self.run_stage(Stage::MergeVoice, &mut warnings)?;
        self.run_stage(Stage::Mux, &mut warnings)?;

        let paths = self.store.paths(&self.task_id)?;
        if !warnings.is_empty() {
            self.store.patch_status(
                &self.task_id,
                &StatusPatch {
                    message: Some(format!("final track regenerated: {}", warnings.join("; "))),
                    ..Default::default()
                },
            )?;
        }
        self.store.append_log(&self.task_id, "final track regenerated")?;
        self.events.publish(EventEnvelope::new(
            &self.task_id,
            EventKind::RegenerateComplete,
            json!({
                "video_path": paths.final_video().display().to_string(),
                "voice_path": paths.final_voice_wav().display().to_string(),
            }),
        ));
        Ok(())
    }

    fn run_stage(&self, stage: Stage, warnings: &mut Vec<String>) -> Result<()> {
        let paths = self.store.paths(&self.task_id)?;
        match stage {
            Stage::ExtractAudio => {
                let input = paths.find_source_input()?;
                self.engines.extractor.extract(&input, &paths.audio_wav())
            }
            Stage::SeparateVocals => self
                .engines
                .separator
                .separate(
                    &paths.audio_wav(),
                    &paths.vocals_wav(),
                    &paths.accompaniment_wav(),
                )
                .map(|_| ()),
            Stage::SpeakerTracks => self.stage_speaker_tracks(&paths),
            Stage::Transcribe => self.stage_transcribe(&paths),
            Stage::Translate => self.stage_translate(),
            Stage::ExtractReferences => self.stage_extract_references(&paths),
            Stage::CloneVoices => self.stage_clone_voices(&paths, warnings),
            Stage::MergeVoice => self.stage_merge(&paths, warnings),
            Stage::Mux => self.stage_mux(&paths),
        }
    }

    fn stage_speaker_tracks(&self, paths: &TaskPaths) -> Result<()> {
        let tracks = self
            .engines
            .tracker
            .build(&paths.vocals_wav(), &paths.speakers_dir())?;
        for track in &tracks {
            track.validate()?;
            write_json_atomic(&paths.speaker_map(&track.speaker_id), &track.mapping)?;
        }
        info!(task = %self.task_id, speakers = tracks.len(), "speaker tracks built");
        Ok(())
    }

    fn stage_transcribe(&self, paths: &TaskPaths) -> Result<()> {
        let status = self.store.read_status(&self.task_id)?;
        let tracks = load_speaker_tracks(paths)?;

        let mut raw = Vec::new();
        let mut segments: Vec<Segment> = Vec::new();
        let mut detected: Option<String> = None;

        if tracks.is_empty() {
            let transcription = self
                .engines
                .transcriber
                .transcribe(&paths.vocals_wav(), &status.source_lang)?;
            detected = Some(transcription.language.clone());
            for raw_seg in &transcription.segments {
                segments.push(to_segment(raw_seg, None));
            }
            raw.push(transcription);
        } else {
            let total = tracks.len();
            for (i, track) in tracks.iter().enumerate() {
                self.check_cancel()?;
                self.report_progress(Stage::Transcribe, i as f64 / total as f64, Some((i, total)))?;
                let transcription = self
                    .engines
                    .transcriber
                    .transcribe(&track.compact_audio_path, &status.source_lang)?;
                detected.get_or_insert_with(|| transcription.language.clone());
                for raw_seg in &transcription.segments {
                    let mut seg = to_segment(raw_seg, Some(track.speaker_id.clone()));
                    map_to_global(&mut seg, track);
                    segments.push(seg);
                }
                raw.push(transcription);
            }
        }
        write_json_atomic(&paths.transcriber_raw_json(), &raw)?;

        segments.sort_by(|a, b| a.start.total_cmp(&b.start));
        let segments = split_on_silence(
            segments,
            self.config.transcriber.silence_split_gap_s,
        );
        let segments = repair_overlaps(segments, defaults::OVERLAP_TOLERANCE_S);

        let mut table = SegmentTable::new(segments);
        table.renumber();
        let total = table.len();
        self.store.write_segment_table(&self.task_id, &table)?;

        // Replace the auto sentinel with the detected language so later
        // per-segment retranslation uses the concrete pair.
        let source_lang = match (status.source_lang.as_str(), detected) {
            (defaults::AUTO_LANGUAGE, Some(lang)) => Some(lang),
            _ => None,
        };
        self.store.patch_status(
            &self.task_id,
            &StatusPatch {
                total_segments: Some(total),
                source_lang,
                ..Default::default()
            },
        )?;
        Ok(())
    }

    fn stage_translate(&self) -> Result<()> {
        let status = self.store.read_status(&self.task_id)?;
        let mut table = self.store.read_segment_table(&self.task_id)?;
        let source = status.source_lang.as_str();
        let target = status.target_lang.as_str();

        if source == target {
            // Same-language run: copy text without invoking the translator.
            for seg in &mut table.segments {
                if seg.translated_text.is_none() {
                    seg.translated_text = Some(seg.text.clone());
                }
            }
            self.store.write_segment_table(&self.task_id, &table)?;
            return Ok(());
        }

        let pending: Vec<usize> = table
            .segments
            .iter()
            .filter(|s| s.translated_text.is_none())
            .map(|s| s.id)
            .collect();
        let total = table.len();
        let batch_size = self.config.translator.batch_size.max(1);

        for (batch_idx, ids) in pending.chunks(batch_size).enumerate() {
            self.check_cancel()?;
            let done = batch_idx * batch_size;
            self.report_progress(
                Stage::Translate,
                done as f64 / pending.len().max(1) as f64,
                Some((done.min(total), total)),
            )?;

            let texts: Vec<String> = ids
                .iter()
                .map(|&id| table.segments[id].text.clone())
                .collect();
            let translated = self.translate_batch(&texts, source, target, batch_idx)?;
            for (&id, text) in ids.iter().zip(translated) {
                table.segments[id].translated_text = Some(text);
            }
        }
        self.store.write_segment_table(&self.task_id, &table)?;
        Ok(())
    }

    /// One batch with retries and adaptive backoff. A final failure fails
    /// the whole request.
    fn translate_batch(
        &self,
        texts: &[String],
        source: &str,
        target: &str,
        batch_idx: usize,
    ) -> Result<Vec<String>> {
        let max_retries = self.config.translator.max_retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_retries {
            self.check_cancel()?;
            match self.engines.translator.translate(texts, source, target) {
                Ok(out) if out.len() == texts.len() => return Ok(out),
                Ok(out) => {
                    last_error = format!(
                        "translator returned {} results for {} inputs",
                        out.len(),
                        texts.len()
                    );
                }
                Err(e) => last_error = e.to_string(),
            }
            warn!(
                task = %self.task_id,
                batch = batch_idx + 1,
                attempt,
                error = %last_error,
                "translation batch failed"
            );
            if attempt < max_retries {
                let backoff = std::time::Duration::from_millis(250u64 << (attempt - 1));
                std::thread::sleep(backoff);
            }
        }
        Err(RedubError::EngineFailure {
            engine: "translator".to_string(),
            message: format!(
                "batch {} failed after {max_retries} attempts: {last_error}",
                batch_idx + 1
            ),
        })
    }

    fn stage_extract_references(&self, paths: &TaskPaths) -> Result<()> {
        let table = self.store.read_segment_table(&self.task_id)?;
        let total = table.len();
        for (i, seg) in table.segments.iter().enumerate() {
            self.check_cancel()?;
            if i % 10 == 0 {
                self.report_progress(
                    Stage::ExtractReferences,
                    i as f64 / total.max(1) as f64,
                    Some((i, total)),
                )?;
            }
            self.extract_reference(paths, seg)?;
        }
        Ok(())
    }

    /// Cut the reference clip for one segment from the speaker's compact
    /// track when available, else from the full vocals.
    fn extract_reference(&self, paths: &TaskPaths, seg: &Segment) -> Result<()> {
        std::fs::create_dir_all(paths.ref_audio_dir())?;
        let tracks = load_speaker_tracks(paths)?;
        let track = seg
            .speaker_id
            .as_ref()
            .and_then(|id| tracks.iter().find(|t| &t.speaker_id == id));

        let (source, range) = match track {
            Some(track) => match track.global_to_compact(seg.start, seg.end) {
                Some(range) => (wav::load(&track.compact_audio_path)?, range),
                None => (wav::load(&paths.vocals_wav())?, (seg.start, seg.end)),
            },
            None => (wav::load(&paths.vocals_wav())?, (seg.start, seg.end)),
        };

        let mut slice = source.slice_seconds(range.0, range.1).to_vec();
        if slice.is_empty() {
            // Degenerate interval at the very end of the audio; fall back
            // to a minimal non-empty clip so the cloner has a reference.
            let start = source.samples.len().saturating_sub(source.sample_rate as usize);
            slice = source.samples[start..].to_vec();
        }
        wav::save(
            &paths.ref_segment(seg.id),
            &AudioBuffer {
                samples: slice,
                sample_rate: source.sample_rate,
            },
        )
    }

    fn stage_clone_voices(&self, paths: &TaskPaths, warnings: &mut Vec<String>) -> Result<()> {
        let mut table = self.store.read_segment_table(&self.task_id)?;
        std::fs::create_dir_all(paths.cloned_audio_dir())?;

        let jobs: Vec<(usize, String)> = table
            .segments
            .iter()
            .map(|seg| {
                (
                    seg.id,
                    seg.translated_text
                        .clone()
                        .unwrap_or_else(|| seg.text.clone()),
                )
            })
            .collect();
        let total = jobs.len();

        let pool_size = self.config.scheduler.per_segment_parallelism.max(1);
        let results = if pool_size > 1 && self.engines.cloner.is_thread_safe() {
            self.clone_parallel(paths, &jobs, pool_size)?
        } else {
            self.clone_serial(paths, &jobs)?
        };

        let mut failed = 0usize;
        let mut ordered: Vec<(usize, std::result::Result<(), String>)> = results;
        ordered.sort_by_key(|(id, _)| *id);
        for (id, outcome) in ordered {
            let seg = &mut table.segments[id];
            match outcome {
                Ok(()) => {
                    seg.cloned_audio_path = Some(paths.cloned_segment(id));
                    seg.error = None;
                    refresh_durations(seg);
                }
                Err(message) => {
                    // One bad segment never fails the task; stage 8 will
                    // substitute silence for it.
                    failed += 1;
                    seg.cloned_audio_path = None;
                    seg.error = Some(message.clone());
                    warnings.push(format!("segment {id}: cloning failed ({message})"));
                }
            }
        }
        self.store.write_segment_table(&self.task_id, &table)?;
        info!(
            task = %self.task_id,
            cloned = total - failed,
            failed,
            "voice cloning finished"
        );
        Ok(())
    }

    fn clone_serial(
        &self,
        paths: &TaskPaths,
        jobs: &[(usize, String)],
    ) -> Result<Vec<(usize, std::result::Result<(), String>)>> {
        let total = jobs.len();
        let mut results = Vec::with_capacity(total);
        for (done, (id, text)) in jobs.iter().enumerate() {
            self.check_cancel()?;
            self.report_progress(
                Stage::CloneVoices,
                done as f64 / total.max(1) as f64,
                Some((done, total)),
            )?;
            let outcome = self
                .engines
                .cloner
                .clone_voice(&paths.ref_segment(*id), text, &paths.cloned_segment(*id))
                .map_err(|e| e.to_string());
            results.push((*id, outcome));
        }
        Ok(results)
    }

    /// Bounded worker pool over the segment jobs. Workers observe the
    /// cancellation flag between jobs.
    fn clone_parallel(
        &self,
        paths: &TaskPaths,
        jobs: &[(usize, String)],
        pool_size: usize,
    ) -> Result<Vec<(usize, std::result::Result<(), String>)>> {
        let total = jobs.len();
        let (job_tx, job_rx) = crossbeam_channel::bounded::<(usize, String)>(total);
        let (result_tx, result_rx) =
            crossbeam_channel::bounded::<(usize, std::result::Result<(), String>)>(total);
        for job in jobs {
            let _ = job_tx.send(job.clone());
        }
        drop(job_tx);

        let mut results = Vec::with_capacity(total);
        std::thread::scope(|scope| {
            for _ in 0..pool_size.min(total.max(1)) {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let cancel = Arc::clone(&self.cancel);
                let cloner = Arc::clone(&self.engines.cloner);
                scope.spawn(move || {
                    while let Ok((id, text)) = job_rx.recv() {
                        if cancel.load(Ordering::SeqCst) {
                            break;
                        }
                        let outcome = cloner
                            .clone_voice(
                                &paths.ref_segment(id),
                                &text,
                                &paths.cloned_segment(id),
                            )
                            .map_err(|e| e.to_string());
                        let _ = result_tx.send((id, outcome));
                    }
                });
            }
            drop(result_tx);

            for done in 0..total {
                match result_rx.recv() {
                    Ok(result) => {
                        let _ = self.report_progress(
                            Stage::CloneVoices,
                            (done + 1) as f64 / total as f64,
                            Some((done + 1, total)),
                        );
                        results.push(result);
                    }
                    // Workers exited early: cancellation observed.
                    Err(_) => break,
                }
            }
        });
        self.check_cancel()?;
        Ok(results)
    }

    fn stage_merge(&self, paths: &TaskPaths, warnings: &mut Vec<String>) -> Result<()> {
        let mut table = self.store.read_segment_table(&self.task_id)?;
        let vocals = wav::load(&paths.vocals_wav())?;
        let accompaniment = if paths.accompaniment_wav().exists() {
            Some(wav::load(&paths.accompaniment_wav())?)
        } else {
            None
        };

        let merger = Merger::new(
            self.config.merger.clone(),
            Arc::clone(&self.engines.stretcher),
        );
        let result = merger.build(&table, &vocals, accompaniment.as_ref())?;
        wav::save(&paths.final_voice_wav(), &result.track)?;
        warnings.extend(result.warnings);

        // The final track now reflects every segment; clear the dirty bits.
        for seg in &mut table.segments {
            seg.dirty = false;
        }
        self.store.write_segment_table(&self.task_id, &table)?;
        Ok(())
    }

    fn stage_mux(&self, paths: &TaskPaths) -> Result<()> {
        let input = paths.find_source_input()?;
        if defaults::is_video_input(&input) {
            // Accompaniment was already mixed into the final voice track by
            // stage 8; muxing adds only the video stream.
            self.engines.muxer.mux(
                &input,
                &paths.final_voice_wav(),
                None,
                &paths.final_video(),
            )
        } else {
            std::fs::copy(paths.final_voice_wav(), paths.final_audio())?;
            Ok(())
        }
    }

    fn report_progress(
        &self,
        stage: Stage,
        fraction: f64,
        segment_counts: Option<(usize, usize)>,
    ) -> Result<()> {
        let message = match segment_counts {
            Some((current, total)) => format!("{} ({current}/{total})", stage.step_name()),
            None => stage.step_name().to_string(),
        };
        let status = self.store.patch_status(
            &self.task_id,
            &StatusPatch {
                current_step: Some(stage.number()),
                step_name: Some(stage.step_name().to_string()),
                progress: Some(stage.progress_at(fraction)),
                message: Some(message),
                current_segment: segment_counts.map(|(c, _)| c),
                total_segments: segment_counts.map(|(_, t)| t),
                ..Default::default()
            },
        )?;
        self.events.publish(EventEnvelope::progress(&status));
        Ok(())
    }

    fn publish_status(&self) {
        if let Ok(status) = self.store.read_status(&self.task_id) {
            self.events.publish(EventEnvelope::status(&status));
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(RedubError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Enumerate the persisted speaker tracks, if stage 3 ran.
pub fn load_speaker_tracks(paths: &TaskPaths) -> Result<Vec<SpeakerTrack>> {
    let dir = paths.speakers_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut tracks = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(&dir)?.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        if !entry.path().is_dir() {
            continue;
        }
        let speaker_id = entry.file_name().to_string_lossy().to_string();
        let map_path = paths.speaker_map(&speaker_id);
        if !map_path.exists() {
            continue;
        }
        let mapping = crate::store::read_json(&map_path)?;
        tracks.push(SpeakerTrack {
            speaker_id: speaker_id.clone(),
            compact_audio_path: paths.speaker_wav(&speaker_id),
            mapping,
        });
    }
    Ok(tracks)
}

fn to_segment(raw: &TranscribedSegment, speaker_id: Option<String>) -> Segment {
    let mut seg = Segment::new(0, raw.start, raw.end, raw.text.trim());
    seg.speaker_id = speaker_id;
    seg.words = if raw.words.is_empty() {
        None
    } else {
        Some(raw.words.clone())
    };
    seg.original_duration = Some(raw.end - raw.start);
    seg
}

/// Rewrite a compact-time segment (and its words) into global time.
fn map_to_global(seg: &mut Segment, track: &SpeakerTrack) {
    seg.start = track.compact_to_global(seg.start);
    seg.end = track.compact_to_global(seg.end);
    seg.original_duration = Some(seg.end - seg.start);
    if let Some(words) = &mut seg.words {
        for word in words {
            word.start = track.compact_to_global(word.start);
            word.end = track.compact_to_global(word.end);
        }
    }
}

/// Split segments at word gaps of at least `gap_s` seconds.
pub fn split_on_silence(segments: Vec<Segment>, gap_s: f64) -> Vec<Segment> {
    let mut out = Vec::with_capacity(segments.len());
    for seg in segments {
        let Some(words) = seg.words.clone().filter(|w| w.len() > 1) else {
            out.push(seg);
            continue;
        };

        let mut pieces: Vec<Vec<Word>> = vec![Vec::new()];
        for (i, word) in words.iter().enumerate() {
            if i > 0 && word.start - words[i - 1].end >= gap_s {
                pieces.push(Vec::new());
            }
            pieces.last_mut().expect("non-empty").push(word.clone());
        }
        if pieces.len() == 1 {
            out.push(seg);
            continue;
        }

        let last_piece = pieces.len() - 1;
        for (i, piece) in pieces.into_iter().enumerate() {
            let text = piece
                .iter()
                .map(|w| w.word.trim())
                .collect::<Vec<_>>()
                .join(" ");
            // The outer edges keep the original segment boundaries.
            let start = if i == 0 { seg.start } else { piece[0].start };
            let end = if i == last_piece {
                seg.end
            } else {
                piece[piece.len() - 1].end
            };
            let mut part = Segment::new(0, start, end, text);
            part.speaker_id = seg.speaker_id.clone();
            part.words = Some(piece);
            part.original_duration = Some(end - start);
            out.push(part);
        }
    }
    out
}

/// Push overlapping starts forward so consecutive segments respect the
/// overlap tolerance. Needed when independently transcribed speaker tracks
/// interleave. A segment swallowed whole by its predecessor keeps a
/// minimal interval right after it.
pub fn repair_overlaps(mut segments: Vec<Segment>, tolerance: f64) -> Vec<Segment> {
    for i in 1..segments.len() {
        let prev_end = segments[i - 1].end;
        let seg = &mut segments[i];
        if seg.start < prev_end - tolerance {
            seg.start = prev_end;
            if seg.end <= seg.start {
                seg.end = seg.start + 0.01;
            }
            seg.original_duration = Some(seg.end - seg.start);
        }
    }
    segments
}

fn refresh_durations(seg: &mut Segment) {
    seg.original_duration = Some(seg.end - seg.start);
    if let Some(path) = &seg.cloned_audio_path {
        if let Ok(duration) = wav::duration_seconds(path) {
            seg.cloned_duration = Some(duration);
            if seg.end - seg.start > 0.0 {
                seg.duration_multiplier = Some(duration / (seg.end - seg.start));
            }
        }
    }
}
