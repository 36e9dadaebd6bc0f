//! Turns a chapter's cached chunks into one audio file.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::audio::concat_wav;
use crate::cache::write_atomic;
use crate::error::{PipelineError, Result};
use crate::job::ChapterPlan;
use crate::library::{Book, Chapter};
use crate::metrics::PipelineMetrics;

/// Tags written into the chapter file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackTags {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub album_artist: String,
    pub track: u32,
    pub track_total: u32,
}

impl TrackTags {
    pub fn for_chapter(book: &Book, chapter: &Chapter, track_total: usize) -> Self {
        let album = book.title();
        let artist = book.author().map(str::to_string).unwrap_or_else(|| album.clone());
        Self {
            title: chapter.title.clone(),
            album_artist: artist.clone(),
            artist,
            album,
            track: chapter.track_number,
            track_total: track_total as u32,
        }
    }

    /// `(key, value)` pairs in the order encoders write them.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("title", self.title.clone()),
            ("artist", self.artist.clone()),
            ("album", self.album.clone()),
            ("album_artist", self.album_artist.clone()),
        ];
        if self.track_total > 0 {
            pairs.push(("track", format!("{}/{}", self.track, self.track_total)));
            pairs.push(("tracktotal", self.track_total.to_string()));
        } else {
            pairs.push(("track", self.track.to_string()));
        }
        pairs
    }
}

/// Input handed to an [`Encoder`].
pub struct EncodeInput<'a> {
    /// Chunk WAV blobs in chapter order.
    pub chunks: &'a [Arc<Vec<u8>>],
    pub pause: f32,
    pub tags: &'a TrackTags,
    pub cover: Option<Vec<u8>>,
    pub output: &'a Path,
}

impl EncodeInput<'_> {
    /// All chunks as one WAV, with the pause between consecutive chunks.
    pub fn merged_wav(&self) -> Result<Vec<u8>> {
        let slices: Vec<&[u8]> = self.chunks.iter().map(|c| c.as_slice()).collect();
        concat_wav(&slices, self.pause)
    }
}

/// External encoder contract: ordered chunks plus metadata in, one
/// finished file at `output` out.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// File extension of the produced output, without the dot.
    fn extension(&self) -> &'static str;

    async fn encode(&self, input: EncodeInput<'_>) -> Result<()>;
}

/// Writes the merged WAV as-is. Tags and cover are not representable and
/// are dropped.
#[derive(Debug, Default, Clone)]
pub struct WavEncoder;

#[async_trait]
impl Encoder for WavEncoder {
    fn extension(&self) -> &'static str {
        "wav"
    }

    async fn encode(&self, input: EncodeInput<'_>) -> Result<()> {
        let merged = input.merged_wav()?;
        write_atomic(input.output, &merged).await
    }
}

/// MP3 through an `ffmpeg` executable (libmp3lame VBR q2), with ID3 tags
/// and an attached cover picture.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: String,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn arguments(&self, merged: &Path, cover: Option<&Path>, tags: &TrackTags, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into(), "-y".into()];
        args.extend(["-i".into(), merged.display().to_string()]);
        if let Some(cover) = cover {
            args.extend(["-i".into(), cover.display().to_string()]);
        }
        args.extend(["-map".into(), "0:a:0".into()]);
        if cover.is_some() {
            args.extend(
                [
                    "-map", "1:v:0", "-c:v", "copy", "-disposition:v", "attached_pic",
                    "-metadata:s:v", "title=Cover", "-metadata:s:v", "comment=Cover (front)",
                ]
                .map(String::from),
            );
        }
        args.extend(["-codec:a", "libmp3lame", "-qscale:a", "2"].map(String::from));
        for (key, value) in tags.pairs() {
            args.push("-metadata".into());
            args.push(format!("{key}={value}"));
        }
        args.extend(["-id3v2_version".into(), "3".into()]);
        args.push(output.display().to_string());
        args
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    fn extension(&self) -> &'static str {
        "mp3"
    }

    async fn encode(&self, input: EncodeInput<'_>) -> Result<()> {
        let dir = input.output.parent().unwrap_or_else(|| Path::new("."));
        let token = uuid::Uuid::new_v4();
        let merged_path = dir.join(format!(".nk-merge-{token}.wav"));
        let cover_path = dir.join(format!(".nk-cover-{token}.img"));
        let tmp_output = dir.join(format!(".nk-encode-{token}.tmp.mp3"));

        let merged = input.merged_wav()?;
        write_atomic(&merged_path, &merged).await?;
        let cover = match &input.cover {
            Some(bytes) => {
                write_atomic(&cover_path, bytes).await?;
                Some(cover_path.as_path())
            }
            None => None,
        };

        let result = Command::new(&self.program)
            .args(self.arguments(&merged_path, cover, input.tags, &tmp_output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;

        let _ = tokio::fs::remove_file(&merged_path).await;
        let _ = tokio::fs::remove_file(&cover_path).await;

        let output = result.map_err(|e| {
            PipelineError::Encoder(format!("could not run {}: {e}", self.program))
        })?;
        if !output.status.success() {
            let _ = tokio::fs::remove_file(&tmp_output).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Encoder(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        tokio::fs::rename(&tmp_output, input.output)
            .await
            .map_err(|e| PipelineError::storage(input.output, e))
    }
}

pub struct Assembler {
    encoder: Arc<dyn Encoder>,
    metrics: Arc<PipelineMetrics>,
}

impl Assembler {
    pub fn new(encoder: Arc<dyn Encoder>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { encoder, metrics }
    }

    pub fn extension(&self) -> &'static str {
        self.encoder.extension()
    }

    /// Concatenate the plan's chunks in order and encode them to the
    /// chapter output. With `allow_partial`, missing chunks are left out;
    /// otherwise any missing chunk is an error and nothing is written.
    pub async fn assemble(&self, plan: &ChapterPlan, allow_partial: bool) -> Result<PathBuf> {
        let mut chunks = Vec::with_capacity(plan.len());
        let mut missing = 0;
        for chunk in &plan.chunks {
            match plan.cache.fetch(&chunk.identity).await {
                Ok(bytes) => chunks.push(bytes),
                Err(PipelineError::NotFound(_)) => missing += 1,
                Err(err) => return Err(err),
            }
        }

        if chunks.is_empty() || (missing > 0 && !allow_partial) {
            return Err(PipelineError::AssemblyIncomplete {
                chapter: plan.chapter.id.clone(),
                missing,
                total: plan.len(),
            });
        }
        if missing > 0 {
            warn!(
                "Assembling {} without {} of {} chunks",
                plan.key(),
                missing,
                plan.len()
            );
        }

        let cover = match &plan.cover {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("Skipping cover {}: {}", path.display(), e);
                    None
                }
            },
            None => None,
        };

        self.encoder
            .encode(EncodeInput {
                chunks: &chunks,
                pause: plan.voice.pause,
                tags: &plan.tags,
                cover,
                output: &plan.output,
            })
            .await?;
        self.metrics.record_chapter_assembled();
        info!("Wrote {}", plan.output.display());
        Ok(plan.output.clone())
    }
}
