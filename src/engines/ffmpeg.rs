//! ffmpeg-backed media tool adapters.
//!
//! The core depends on the external media tool only through three command
//! shapes: normalize-to-WAV extraction, the atempo time-compression chain,
//! and the video-copy mux. Exit code 0 plus the produced output path is the
//! whole contract.

use super::{AudioExtractor, Muxer, TimeStretcher};
use crate::defaults;
use crate::error::{RedubError, Result};
use std::path::Path;
use std::process::Command;

/// Extracts and normalizes audio: 16 kHz mono signed 16-bit PCM.
#[derive(Debug, Clone)]
pub struct FfmpegAudioExtractor {
    ffmpeg: String,
}

impl FfmpegAudioExtractor {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

impl AudioExtractor for FfmpegAudioExtractor {
    fn extract(&self, src: &Path, dst: &Path) -> Result<()> {
        if !src.exists() {
            return Err(RedubError::InputUnsupported {
                message: format!("input does not exist: {}", src.display()),
            });
        }
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-i")
            .arg(src)
            .args(["-vn", "-acodec", "pcm_s16le"])
            .args(["-ar", &defaults::SAMPLE_RATE.to_string()])
            .args(["-ac", "1", "-y"])
            .arg(dst);
        run(cmd, "audio_extractor")
    }
}

/// Time compression via an `atempo` filter chain.
#[derive(Debug, Clone)]
pub struct FfmpegTimeStretcher {
    ffmpeg: String,
}

impl FfmpegTimeStretcher {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

impl TimeStretcher for FfmpegTimeStretcher {
    fn compress(&self, src: &Path, factor: f64, dst: &Path) -> Result<()> {
        if factor <= 0.0 {
            return Err(RedubError::InvalidRequest {
                message: format!("compression factor must be positive, got {factor}"),
            });
        }
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-i")
            .arg(src)
            .args(["-af", &atempo_chain(factor), "-y"])
            .arg(dst);
        run(cmd, "time_stretcher")
    }
}

/// A single atempo filter only accepts factors up to 2.0; larger factors
/// are expressed as a chain.
pub fn atempo_chain(factor: f64) -> String {
    let mut parts = Vec::new();
    let mut remaining = factor;
    while remaining > 2.0 {
        parts.push("atempo=2.0".to_string());
        remaining /= 2.0;
    }
    parts.push(format!("atempo={remaining:.6}"));
    parts.join(",")
}

/// Copies the video stream and encodes the dubbed audio as AAC.
#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    ffmpeg: String,
}

impl FfmpegMuxer {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

impl Muxer for FfmpegMuxer {
    fn mux(
        &self,
        video: &Path,
        voice: &Path,
        accompaniment: Option<&Path>,
        dst: &Path,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-i").arg(video).arg("-i").arg(voice);
        match accompaniment {
            Some(acc) => {
                cmd.arg("-i").arg(acc);
                cmd.args(["-c:v", "copy", "-c:a", "aac"]);
                cmd.args([
                    "-filter_complex",
                    "[2:a]volume=0.3[bg];[1:a][bg]amix=inputs=2:duration=first[aout]",
                ]);
                cmd.args(["-map", "0:v:0", "-map", "[aout]"]);
            }
            None => {
                cmd.args(["-c:v", "copy", "-c:a", "aac"]);
                cmd.args(["-map", "0:v:0", "-map", "1:a:0"]);
            }
        }
        cmd.arg("-y").arg(dst);
        run(cmd, "muxer")
    }
}

/// Run one media tool invocation; non-zero exit is an engine failure
/// carrying the tail of stderr.
fn run(mut cmd: Command, engine: &str) -> Result<()> {
    let output = cmd.output().map_err(|e| RedubError::EngineFailure {
        engine: engine.to_string(),
        message: format!("failed to spawn media tool: {e}"),
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
            message: format!("media tool exited with {}: {tail}", output.status),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atempo_chain_small_factor() {
        assert_eq!(atempo_chain(1.5), "atempo=1.500000");
        assert_eq!(atempo_chain(2.0), "atempo=2.000000");
    }

    #[test]
    fn test_atempo_chain_large_factor() {
        assert_eq!(atempo_chain(2.5), "atempo=2.0,atempo=1.250000");
        assert_eq!(atempo_chain(5.0), "atempo=2.0,atempo=2.0,atempo=1.250000");
    }

    #[test]
    fn test_extract_missing_input_is_unsupported() {
        let extractor = FfmpegAudioExtractor::new("ffmpeg");
        let err = extractor
            .extract(Path::new("/nonexistent/in.mp4"), Path::new("/tmp/out.wav"))
            .unwrap_err();
        assert!(matches!(err, RedubError::InputUnsupported { .. }));
    }

    #[test]
    fn test_stretch_rejects_nonpositive_factor() {
        let stretcher = FfmpegTimeStretcher::new("ffmpeg");
        assert!(stretcher
            .compress(Path::new("/tmp/a.wav"), 0.0, Path::new("/tmp/b.wav"))
            .is_err());
    }

    #[test]
    fn test_missing_binary_is_engine_failure() {
        let extractor = FfmpegAudioExtractor::new("/definitely/not/ffmpeg");
        let src = std::env::temp_dir().join("redub_ffmpeg_test_input");
        std::fs::write(&src, b"x").unwrap();
        let err = extractor
            .extract(&src, Path::new("/tmp/out.wav"))
            .unwrap_err();
        assert!(matches!(err, RedubError::EngineFailure { .. }));
        let _ = std::fs::remove_file(&src);
    }
}
