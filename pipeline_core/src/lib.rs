//! Book-to-audio synthesis pipeline.
//!
//! Chapter text is split into chunks ([`chunker`]), each chunk gets a
//! content identity ([`identity`]) and is synthesized at most once into the
//! [`cache`] by the worker [`pool`]. A [`scheduler`] runs one [`job`] per
//! chapter, the [`assembler`] merges a chapter's chunks into its final
//! file, and [`playback`] consumes chunks in order while synthesis is
//! still going.

pub mod assembler;
pub mod audio;
pub mod cache;
pub mod chunker;
pub mod error;
pub mod identity;
pub mod job;
pub mod library;
pub mod metrics;
pub mod playback;
pub mod pool;
pub mod report;
pub mod scheduler;
pub mod settings;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use assembler::{Assembler, Encoder, FfmpegEncoder, TrackTags, WavEncoder};
pub use cache::{CacheScope, ChapterCache, ChunkCache};
pub use chunker::{split_text, TextChunk};
pub use error::{PipelineError, Result};
pub use identity::ChunkIdentity;
pub use job::{ChapterKey, ChapterPlan, ChunkState, JobHandle, JobProgress, JobState};
pub use library::{Book, BookMetadata, Chapter, Library};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use playback::{
    AudioSink, ChannelSink, MarkerStore, PlaybackControl, PlaybackController, PlaybackMarker,
    PlaybackState, PlayedChunk,
};
pub use report::{ChapterReport, RunReport};
pub use scheduler::{ChapterStatus, JobScheduler, JobStart, OutputState, PurgeReport};
pub use settings::{PipelineSettings, VoiceOverrides, VoiceSettings};
