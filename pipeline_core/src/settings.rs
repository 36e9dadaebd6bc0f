// Pipeline configuration, read once and passed explicitly to every job.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use engine_core::{VoiceParams, DEFAULT_ENGINE_URL};
use serde::{Deserialize, Serialize};

use crate::chunker::DEFAULT_MAX_CHARS_PER_CHUNK;

/// Name of the per-book cache directory when no cache root is configured.
pub const DEFAULT_CACHE_DIR_NAME: &str = ".nk-tts-cache";

/// Voice used for a chapter. Every field takes part in chunk identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub speaker: u32,
    pub speed: Option<f32>,
    pub pitch: Option<f32>,
    pub intonation: Option<f32>,
    /// Seconds of silence between consecutive chunks.
    pub pause: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            speaker: 2,
            speed: None,
            pitch: None,
            intonation: None,
            pause: 0.4,
        }
    }
}

impl VoiceSettings {
    /// The subset of the voice the engine itself sees.
    pub fn engine_params(&self) -> VoiceParams {
        VoiceParams {
            speaker: self.speaker,
            speed: self.speed,
            pitch: self.pitch,
            intonation: self.intonation,
        }
    }

    /// Apply per-book overrides on top of the global voice.
    pub fn with_overrides(&self, overrides: &VoiceOverrides) -> Self {
        Self {
            speaker: overrides.speaker.unwrap_or(self.speaker),
            speed: overrides.speed.or(self.speed),
            pitch: overrides.pitch.or(self.pitch),
            intonation: overrides.intonation.or(self.intonation),
            pause: overrides.pause.unwrap_or(self.pause),
        }
    }
}

/// Optional voice fields a book may override in its `book.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceOverrides {
    pub speaker: Option<u32>,
    pub speed: Option<f32>,
    pub pitch: Option<f32>,
    pub intonation: Option<f32>,
    pub pause: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub engine_url: String,
    pub engine_timeout_secs: u64,
    pub engine_ready_timeout_secs: u64,
    pub voice: VoiceSettings,
    pub max_chars_per_chunk: usize,
    /// Worker count; 0 picks a value from the CPU count.
    pub jobs: usize,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Chunks synthesized ahead of the playback cursor.
    pub prebuffer: usize,
    /// Shared cache root. `None` keeps each book's cache inside its directory.
    pub cache_dir: Option<PathBuf>,
    pub keep_cache: bool,
    pub overwrite: bool,
    pub allow_partial: bool,
    pub ffmpeg_path: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            engine_url: DEFAULT_ENGINE_URL.to_string(),
            engine_timeout_secs: 120,
            engine_ready_timeout_secs: 30,
            voice: VoiceSettings::default(),
            max_chars_per_chunk: DEFAULT_MAX_CHARS_PER_CHUNK,
            jobs: 0,
            retry_attempts: 3,
            retry_backoff_ms: 500,
            prebuffer: 3,
            cache_dir: None,
            keep_cache: true,
            overwrite: false,
            allow_partial: false,
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| {
        matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}

impl PipelineSettings {
    /// Load settings from `NK_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let voice = VoiceSettings {
            speaker: env_parse("NK_SPEAKER").unwrap_or(defaults.voice.speaker),
            speed: env_parse("NK_SPEED"),
            pitch: env_parse("NK_PITCH"),
            intonation: env_parse("NK_INTONATION"),
            pause: env_parse("NK_PAUSE").unwrap_or(defaults.voice.pause),
        };

        Self {
            engine_url: std::env::var("NK_ENGINE_URL").unwrap_or(defaults.engine_url),
            engine_timeout_secs: env_parse("NK_ENGINE_TIMEOUT_SECS")
                .unwrap_or(defaults.engine_timeout_secs),
            engine_ready_timeout_secs: env_parse("NK_ENGINE_WAIT_SECS")
                .unwrap_or(defaults.engine_ready_timeout_secs),
            voice,
            max_chars_per_chunk: env_parse("NK_MAX_CHARS")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(defaults.max_chars_per_chunk),
            jobs: env_parse("NK_JOBS").unwrap_or(defaults.jobs),
            retry_attempts: env_parse("NK_RETRIES").unwrap_or(defaults.retry_attempts),
            retry_backoff_ms: env_parse("NK_RETRY_BACKOFF_MS").unwrap_or(defaults.retry_backoff_ms),
            prebuffer: env_parse("NK_PREBUFFER").unwrap_or(defaults.prebuffer),
            cache_dir: std::env::var("NK_CACHE_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            keep_cache: env_flag("NK_KEEP_CACHE").unwrap_or(defaults.keep_cache),
            overwrite: env_flag("NK_OVERWRITE").unwrap_or(defaults.overwrite),
            allow_partial: env_flag("NK_ALLOW_PARTIAL").unwrap_or(defaults.allow_partial),
            ffmpeg_path: std::env::var("NK_FFMPEG").unwrap_or(defaults.ffmpeg_path),
        }
    }

    pub fn with_voice(mut self, voice: VoiceSettings) -> Self {
        self.voice = voice;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars_per_chunk = max_chars;
        self
    }

    pub fn with_retry(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.retry_attempts = attempts;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_prebuffer(mut self, prebuffer: usize) -> Self {
        self.prebuffer = prebuffer;
        self
    }

    pub fn with_keep_cache(mut self, keep: bool) -> Self {
        self.keep_cache = keep;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_allow_partial(mut self, allow: bool) -> Self {
        self.allow_partial = allow;
        self
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    pub fn engine_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_ready_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Size of the worker pool: the configured job count, or half the
    /// available cores capped at 4.
    pub fn worker_limit(&self) -> usize {
        if self.jobs > 0 {
            return self.jobs;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cores / 2).clamp(1, 4)
    }

    /// Workers actually useful for a run over `chapters` chapters.
    pub fn effective_jobs(&self, chapters: usize) -> usize {
        self.worker_limit().min(chapters).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_jobs_caps_by_chapter_count() {
        let settings = PipelineSettings::default().with_jobs(6);
        assert_eq!(settings.effective_jobs(10), 6);
        assert_eq!(settings.effective_jobs(2), 2);
        assert_eq!(settings.effective_jobs(0), 1);
    }

    #[test]
    fn test_auto_worker_limit_is_bounded() {
        let limit = PipelineSettings::default().worker_limit();
        assert!((1..=4).contains(&limit));
    }

    #[test]
    fn test_voice_overrides_apply_only_set_fields() {
        let base = VoiceSettings {
            speaker: 2,
            speed: Some(1.1),
            pitch: None,
            intonation: None,
            pause: 0.4,
        };
        let overrides = VoiceOverrides {
            speaker: Some(13),
            pitch: Some(0.05),
            ..Default::default()
        };
        let voice = base.with_overrides(&overrides);
        assert_eq!(voice.speaker, 13);
        assert_eq!(voice.speed, Some(1.1));
        assert_eq!(voice.pitch, Some(0.05));
        assert_eq!(voice.pause, 0.4);
    }

    #[test]
    fn test_cache_dir_defaults_to_per_book() {
        assert_eq!(PipelineSettings::default().cache_dir, None);
        let shared = PipelineSettings::default().with_cache_dir("/var/cache/nk");
        assert_eq!(shared.cache_dir, Some(PathBuf::from("/var/cache/nk")));
    }
}
