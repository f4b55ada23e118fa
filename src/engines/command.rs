//! Engine adapters that delegate to configured external commands.
//!
//! The model backends (separation, diarization, recognition, translation,
//! cloning) run out of process: each adapter renders a command template,
//! spawns one process per invocation and exchanges WAV/JSON files at the
//! substituted paths. Exit code 0 plus the expected output file is the
//! whole contract, so any backend can be plugged in from configuration.
//!
//! Template placeholders are written `{name}` and substituted per argument;
//! no shell is involved.

use super::{
    Separation, SpeakerTracker, Transcriber, Transcription, Translator, VocalSeparator,
    VoiceCloner,
};
use crate::error::{RedubError, Result};
use crate::speaker::SpeakerTrack;
use crate::store::read_json;
use std::io::Write;
use std::path::Path;
use std::process::Command;

/// A parsed command template: program plus arguments with placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| RedubError::ConfigInvalidValue {
            key: "engine command".to_string(),
            message: "empty command template".to_string(),
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    fn render(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                let mut rendered = arg.clone();
                for (key, value) in vars {
                    rendered = rendered.replace(&format!("{{{key}}}"), value);
                }
                rendered
            })
            .collect()
    }

    /// Spawn one invocation and wait for it.
    fn run(&self, engine: &str, vars: &[(&str, &str)]) -> Result<()> {
        let args = self.render(vars);
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| RedubError::EngineFailure {
                engine: engine.to_string(),
                message: format!("failed to spawn {}: {e}", self.program),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(RedubError::EngineFailure {
                engine: engine.to_string(),
                message: format!("command exited with {}: {tail}", output.status),
            });
        }
        Ok(())
    }
}

/// Vocal separation through `{input} {vocals} {accompaniment}`.
///
/// The backend writes the accompaniment file only when music was detected;
/// its absence after a successful run means none.
pub struct CommandSeparator {
    template: CommandTemplate,
}

impl CommandSeparator {
    pub fn new(template: &str) -> Result<Self> {
        Ok(Self {
            template: CommandTemplate::parse(template)?,
        })
    }
}

impl VocalSeparator for CommandSeparator {
    fn separate(
        &self,
        audio: &Path,
        vocals_dst: &Path,
        accompaniment_dst: &Path,
    ) -> Result<Separation> {
        self.template.run(
            "vocal_separator",
            &[
                ("input", &audio.display().to_string()),
                ("vocals", &vocals_dst.display().to_string()),
                ("accompaniment", &accompaniment_dst.display().to_string()),
            ],
        )?;
        if !vocals_dst.exists() {
            return Err(RedubError::EngineFailure {
                engine: "vocal_separator".to_string(),
                message: format!("backend produced no vocals at {}", vocals_dst.display()),
            });
        }
        Ok(Separation {
            accompaniment: accompaniment_dst.exists(),
        })
    }
}

/// Diarization through `{input} {output_dir}`; the backend writes the
/// compact WAVs plus a `tracks.json` index in `output_dir`.
pub struct CommandTracker {
    template: CommandTemplate,
}

impl CommandTracker {
    pub fn new(template: &str) -> Result<Self> {
        Ok(Self {
            template: CommandTemplate::parse(template)?,
        })
    }
}

impl SpeakerTracker for CommandTracker {
    fn build(&self, vocals: &Path, speakers_dir: &Path) -> Result<Vec<SpeakerTrack>> {
        std::fs::create_dir_all(speakers_dir)?;
        self.template.run(
            "speaker_tracker",
            &[
                ("input", &vocals.display().to_string()),
                ("output_dir", &speakers_dir.display().to_string()),
            ],
        )?;
        let tracks: Vec<SpeakerTrack> = read_json(&speakers_dir.join("tracks.json"))?;
        for track in &tracks {
            track.validate()?;
        }
        Ok(tracks)
    }
}

/// Speech recognition through `{input} {lang} {output}`; the backend writes
/// a `Transcription` JSON document at `{output}`.
pub struct CommandTranscriber {
    template: CommandTemplate,
}

impl CommandTranscriber {
    pub fn new(template: &str) -> Result<Self> {
        Ok(Self {
            template: CommandTemplate::parse(template)?,
        })
    }
}

impl Transcriber for CommandTranscriber {
    fn transcribe(&self, audio: &Path, lang_hint: &str) -> Result<Transcription> {
        let output = tempfile::Builder::new()
            .prefix("redub_transcribe_")
            .suffix(".json")
            .tempfile()?;
        self.template.run(
            "transcriber",
            &[
                ("input", &audio.display().to_string()),
                ("lang", lang_hint),
                ("output", &output.path().display().to_string()),
            ],
        )?;
        read_json(output.path())
    }
}

/// Translation through `{input} {source_lang} {target_lang} {output}`:
/// the batch goes in as a JSON array of strings and comes back the same
/// shape and length.
pub struct CommandTranslator {
    template: CommandTemplate,
}

impl CommandTranslator {
    pub fn new(template: &str) -> Result<Self> {
        Ok(Self {
            template: CommandTemplate::parse(template)?,
        })
    }
}

impl Translator for CommandTranslator {
    fn translate(
        &self,
        batch: &[String],
        source_lang: &str,
        target_lang: &str,
    ) -> Result<Vec<String>> {
        let mut input = tempfile::Builder::new()
            .prefix("redub_translate_in_")
            .suffix(".json")
            .tempfile()?;
        input.write_all(serde_json::to_string(batch)?.as_bytes())?;
        input.flush()?;

        let output = tempfile::Builder::new()
            .prefix("redub_translate_out_")
            .suffix(".json")
            .tempfile()?;
        self.template.run(
            "translator",
            &[
                ("input", &input.path().display().to_string()),
                ("source_lang", source_lang),
                ("target_lang", target_lang),
                ("output", &output.path().display().to_string()),
            ],
        )?;
        read_json(output.path())
    }
}

/// Voice cloning through `{reference} {text_file} {output}`; the target
/// text is passed via a temp file to sidestep argument quoting.
pub struct CommandCloner {
    template: CommandTemplate,
    thread_safe: bool,
}

impl CommandCloner {
    pub fn new(template: &str) -> Result<Self> {
        Ok(Self {
            template: CommandTemplate::parse(template)?,
            thread_safe: false,
        })
    }

    /// Declare that the backend tolerates concurrent invocations.
    pub fn with_thread_safe(mut self) -> Self {
        self.thread_safe = true;
        self
    }
}

impl VoiceCloner for CommandCloner {
    fn clone_voice(&self, reference: &Path, text: &str, dst: &Path) -> Result<()> {
        let mut text_file = tempfile::Builder::new()
            .prefix("redub_clone_text_")
            .suffix(".txt")
            .tempfile()?;
        text_file.write_all(text.as_bytes())?;
        text_file.flush()?;

        self.template.run(
            "voice_cloner",
            &[
                ("reference", &reference.display().to_string()),
                ("text_file", &text_file.path().display().to_string()),
                ("output", &dst.display().to_string()),
            ],
        )?;
        if !dst.exists() {
            return Err(RedubError::EngineFailure {
                engine: "voice_cloner".to_string(),
                message: format!("backend produced no clone at {}", dst.display()),
            });
        }
        Ok(())
    }

    fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_empty_template() {
        assert!(CommandTemplate::parse("   ").is_err());
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let template = CommandTemplate::parse("tool --in {input} --out {output}").unwrap();
        let args = template.render(&[("input", "/a.wav"), ("output", "/b.json")]);
        assert_eq!(args, vec!["--in", "/a.wav", "--out", "/b.json"]);
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let template = CommandTemplate::parse("tool {mystery}").unwrap();
        let args = template.render(&[("input", "/a")]);
        assert_eq!(args, vec!["{mystery}"]);
    }

    #[test]
    fn test_run_success_with_true() {
        let template = CommandTemplate::parse("true {input}").unwrap();
        assert!(template.run("test", &[("input", "x")]).is_ok());
    }

    #[test]
    fn test_run_failure_with_false() {
        let template = CommandTemplate::parse("false").unwrap();
        let err = template.run("test", &[]).unwrap_err();
        assert!(matches!(err, RedubError::EngineFailure { .. }));
    }

    #[test]
    fn test_run_missing_program() {
        let template = CommandTemplate::parse("/no/such/program").unwrap();
        assert!(template.run("test", &[]).is_err());
    }
}
