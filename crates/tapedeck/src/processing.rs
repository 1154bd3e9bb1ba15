//! Post-capture processing: re-encode and tag the raw capture.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate};
use thiserror::Error;
use tokio::process::Command;

use crate::types::StreamConfig;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("captured file {0} is missing or empty")]
    MissingInput(PathBuf),

    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: PathBuf,
        source: std::io::Error,
    },

    #[error("processing exited with {status}: {stderr_tail}")]
    ToolFailed { status: String, stderr_tail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Tags written into the processed artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub track_number: u32,
    pub year: i32,
}

impl TrackMetadata {
    /// Title is `"YYYY-MM-DD <stream name>"`; track number counts days
    /// since 2020-01-01, starting at 1.
    pub fn for_recording(stream: &StreamConfig, recorded_at: &DateTime<FixedOffset>) -> Self {
        let date = recorded_at.date_naive();
        Self {
            title: format!("{} {}", date.format("%Y-%m-%d"), stream.name),
            artist: stream.artist.clone(),
            album: stream.album.clone(),
            album_artist: stream.album_artist.clone(),
            track_number: track_number(date),
            year: date.year(),
        }
    }
}

pub fn track_number(date: NaiveDate) -> u32 {
    let epoch = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or(NaiveDate::MIN);
    let days = (date - epoch).num_days() + 1;
    days.max(1) as u32
}

/// Turns a raw capture into the delivered artifact.
///
/// Implementations must leave `captured` untouched on failure.
#[async_trait]
pub trait AudioProcessor: Send + Sync {
    async fn process(
        &self,
        captured: &Path,
        output: &Path,
        metadata: &TrackMetadata,
        artwork: Option<&Path>,
    ) -> Result<(), ProcessingError>;
}

/// Re-encodes with ffmpeg and writes ID3 tags plus optional cover art.
pub struct FfmpegProcessor {
    ffmpeg: PathBuf,
}

impl FfmpegProcessor {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    fn args(
        &self,
        captured: &Path,
        output: &Path,
        metadata: &TrackMetadata,
        artwork: Option<&Path>,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let push_all = |args: &mut Vec<OsString>, items: &[&str]| {
            args.extend(items.iter().map(OsString::from));
        };

        push_all(&mut args, &["-y", "-i"]);
        args.push(captured.into());
        if let Some(art) = artwork {
            args.push("-i".into());
            args.push(art.into());
            push_all(&mut args, &["-map", "0:a", "-map", "1:v", "-c:v", "copy"]);
            push_all(
                &mut args,
                &["-metadata:s:v", "title=Album cover", "-metadata:s:v", "comment=Cover (front)"],
            );
        }
        push_all(
            &mut args,
            &["-codec:a", "libmp3lame", "-b:a", "192k", "-ar", "44100", "-ac", "2", "-id3v2_version", "3"],
        );

        let mut tag = |key: &str, value: &str| {
            args.push("-metadata".into());
            args.push(format!("{}={}", key, value).into());
        };
        tag("title", &metadata.title);
        if let Some(v) = &metadata.artist {
            tag("artist", v);
        }
        if let Some(v) = &metadata.album {
            tag("album", v);
        }
        if let Some(v) = &metadata.album_artist {
            tag("album_artist", v);
        }
        tag("track", &metadata.track_number.to_string());
        tag("date", &metadata.year.to_string());

        args.push("-f".into());
        args.push("mp3".into());
        args.push(output.into());
        args
    }
}

#[async_trait]
impl AudioProcessor for FfmpegProcessor {
    async fn process(
        &self,
        captured: &Path,
        output: &Path,
        metadata: &TrackMetadata,
        artwork: Option<&Path>,
    ) -> Result<(), ProcessingError> {
        match tokio::fs::metadata(captured).await {
            Ok(meta) if meta.len() > 0 => {}
            _ => return Err(ProcessingError::MissingInput(captured.to_path_buf())),
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let artwork = match artwork {
            Some(path) if tokio::fs::metadata(path).await.is_ok() => Some(path),
            Some(path) => {
                tracing::warn!(artwork = %path.display(), "Artwork file not found, skipping cover");
                None
            }
            None => None,
        };

        let output_result = Command::new(&self.ffmpeg)
            .args(self.args(captured, output, metadata, artwork))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProcessingError::Spawn {
                tool: self.ffmpeg.clone(),
                source: e,
            })?;

        if !output_result.status.success() {
            let stderr = String::from_utf8_lossy(&output_result.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(10).collect();
            let tail = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
            // never leave a half-written artifact behind
            let _ = tokio::fs::remove_file(output).await;
            return Err(ProcessingError::ToolFailed {
                status: output_result.status.to_string(),
                stderr_tail: tail,
            });
        }

        tracing::info!(
            input = %captured.display(),
            output = %output.display(),
            title = %metadata.title,
            track = metadata.track_number,
            "Processed recording"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fake_tool;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn metadata() -> TrackMetadata {
        let mut stream = StreamConfig::new("Night Owl", "http://s", "u@h:/p");
        stream.artist = Some("KXYZ".to_string());
        let at = FixedOffset::west_opt(6 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 1, 22, 0, 0)
            .unwrap();
        TrackMetadata::for_recording(&stream, &at)
    }

    #[test]
    fn test_track_number() {
        assert_eq!(track_number(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()), 1);
        assert_eq!(track_number(NaiveDate::from_ymd_opt(2021, 1, 1).unwrap()), 367);
        assert_eq!(track_number(NaiveDate::from_ymd_opt(2019, 6, 1).unwrap()), 1);
    }

    #[test]
    fn test_metadata_uses_local_date() {
        let meta = metadata();
        assert_eq!(meta.title, "2024-01-01 Night Owl");
        assert_eq!(meta.year, 2024);
        assert_eq!(meta.artist.as_deref(), Some("KXYZ"));
    }

    #[test]
    fn test_args_include_tags() {
        let processor = FfmpegProcessor::new("ffmpeg");
        let args: Vec<String> = processor
            .args(Path::new("in.mp3"), Path::new("out.mp3"), &metadata(), None)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"title=2024-01-01 Night Owl".to_string()));
        assert!(args.contains(&"artist=KXYZ".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("album=")));
        assert_eq!(args.last().map(String::as_str), Some("out.mp3"));
    }

    #[tokio::test]
    async fn test_failure_preserves_input() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(&dir, r#"echo "Invalid data found" >&2; exit 1"#);
        let input = dir.path().join("raw.mp3");
        std::fs::write(&input, b"raw").unwrap();

        let err = FfmpegProcessor::new(tool)
            .process(&input, &dir.path().join("final.mp3"), &metadata(), None)
            .await
            .unwrap_err();
        match err {
            ProcessingError::ToolFailed { stderr_tail, .. } => {
                assert!(stderr_tail.contains("Invalid data found"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(input.exists());
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("raw.mp3");
        std::fs::write(&input, b"").unwrap();
        let err = FfmpegProcessor::new("ffmpeg")
            .process(&input, &dir.path().join("final.mp3"), &metadata(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::MissingInput(_)));
    }
}
