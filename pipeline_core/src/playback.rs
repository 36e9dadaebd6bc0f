//! Live playback of a chapter while it is still being synthesized.
//!
//! The controller walks the chapter's chunks strictly in order, pulling the
//! next `prebuffer` chunks through the priority lane and suspending when
//! the chunk under the cursor is not cached yet. Before a chunk is handed
//! to the sink its index is persisted, so a restarted session replays the
//! chunk that was cut off and then continues.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::cache::write_atomic;
use crate::error::{PipelineError, Result};
use crate::library::{Book, Chapter};
use crate::scheduler::JobScheduler;

pub const MARKER_FILE: &str = ".nk-playback.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Prebuffering,
    Playing,
    Paused,
    Finished,
    Aborted,
}

/// Last chunk that began playing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackMarker {
    pub chapter: String,
    pub chunk: usize,
    pub updated_at: DateTime<Utc>,
}

/// The per-book marker file.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    path: PathBuf,
}

impl MarkerStore {
    pub fn for_book(book: &Book) -> Self {
        Self {
            path: book.dir.join(MARKER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Option<PlaybackMarker> {
        let bytes = tokio::fs::read(&self.path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!("Ignoring unreadable playback marker {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub async fn save(&self, chapter: &str, chunk: usize) -> Result<PlaybackMarker> {
        let marker = PlaybackMarker {
            chapter: chapter.to_string(),
            chunk,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&marker)
            .map_err(|e| PipelineError::InvalidInput(format!("playback marker: {e}")))?;
        write_atomic(&self.path, &json).await?;
        Ok(marker)
    }

    /// Returns whether a marker was removed.
    pub async fn clear(&self) -> Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PipelineError::storage(&self.path, e)),
        }
    }
}

/// A chunk handed to the sink.
#[derive(Debug, Clone)]
pub struct PlayedChunk {
    pub chapter: String,
    pub index: usize,
    pub total: usize,
    pub audio: Arc<Vec<u8>>,
}

/// Where played chunks go. `play` returns once the chunk has been
/// consumed; that is what paces the controller.
#[async_trait]
pub trait AudioSink: Send {
    async fn play(&mut self, chunk: PlayedChunk) -> Result<()>;
}

/// Forwards chunks to an mpsc receiver.
pub struct ChannelSink {
    tx: mpsc::Sender<PlayedChunk>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PlayedChunk>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AudioSink for ChannelSink {
    async fn play(&mut self, chunk: PlayedChunk) -> Result<()> {
        self.tx.send(chunk).await.map_err(|_| PipelineError::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Play,
    Pause,
    Abort,
}

/// Remote control for a running playback session. Cheap to clone.
#[derive(Clone)]
pub struct PlaybackControl {
    command: Arc<watch::Sender<Command>>,
    state: watch::Receiver<PlaybackState>,
}

impl PlaybackControl {
    /// Takes effect at the next chunk boundary.
    pub fn pause(&self) {
        self.command.send_if_modified(|c| {
            if *c == Command::Play {
                *c = Command::Pause;
                return true;
            }
            false
        });
    }

    pub fn resume(&self) {
        self.command.send_if_modified(|c| {
            if *c == Command::Pause {
                *c = Command::Play;
                return true;
            }
            false
        });
    }

    pub fn abort(&self) {
        self.command.send_replace(Command::Abort);
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state.clone()
    }
}

pub struct PlaybackController {
    scheduler: Arc<JobScheduler>,
    book: Book,
    prebuffer: usize,
    markers: MarkerStore,
    command: Arc<watch::Sender<Command>>,
    state: watch::Sender<PlaybackState>,
}

impl PlaybackController {
    pub fn new(scheduler: Arc<JobScheduler>, book: Book) -> Self {
        let prebuffer = scheduler.settings().prebuffer.max(1);
        let (command, _) = watch::channel(Command::Play);
        let (state, _) = watch::channel(PlaybackState::Idle);
        Self {
            markers: MarkerStore::for_book(&book),
            scheduler,
            book,
            prebuffer,
            command: Arc::new(command),
            state,
        }
    }

    pub fn with_prebuffer(mut self, prebuffer: usize) -> Self {
        self.prebuffer = prebuffer.max(1);
        self
    }

    pub fn control(&self) -> PlaybackControl {
        PlaybackControl {
            command: Arc::clone(&self.command),
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    /// Chapter and chunk a new session should start from, if a previous
    /// session left a marker.
    pub async fn resume_point(&self) -> Option<(Chapter, usize)> {
        let marker = self.markers.load().await?;
        match self.book.chapter(&marker.chapter) {
            Ok(chapter) => Some((chapter, marker.chunk)),
            Err(e) => {
                warn!("Playback marker points at a missing chapter: {}", e);
                None
            }
        }
    }

    /// Play `chapter` from chunk `from` to the end, or until aborted.
    ///
    /// A chunk that cannot be synthesized ends the session with an error;
    /// it is never skipped.
    pub async fn play<S>(&self, chapter: &Chapter, from: usize, sink: &mut S) -> Result<PlaybackState>
    where
        S: AudioSink + ?Sized,
    {
        self.command.send_replace(Command::Play);
        let mut commands = self.command.subscribe();

        let handle = self.scheduler.attach(&self.book, chapter).await?;
        let total = handle.len();
        if from >= total {
            return Err(PipelineError::InvalidInput(format!(
                "chunk {} is past the end of {} ({} chunks)",
                from, chapter.id, total
            )));
        }
        if let Some(previous) = self.markers.load().await {
            if previous.chapter != chapter.id {
                info!("Switching playback from {} to {}", previous.chapter, chapter.id);
                self.markers.clear().await?;
            }
        }

        info!("Playing {}/{} from chunk {} of {}", self.book.id, chapter.id, from, total);
        self.state.send_replace(PlaybackState::Prebuffering);

        for index in from..total {
            if hold_while_paused(&mut commands, &self.state).await == Command::Abort {
                return Ok(self.stop(PlaybackState::Aborted));
            }
            handle.prioritize(index..(index + self.prebuffer).min(total));

            let audio = tokio::select! {
                audio = handle.chunk_audio(index) => match audio {
                    Ok(audio) => audio,
                    Err(err) => {
                        self.stop(PlaybackState::Aborted);
                        return Err(err);
                    }
                },
                _ = aborted(&mut commands) => return Ok(self.stop(PlaybackState::Aborted)),
            };

            self.markers.save(&chapter.id, index).await?;
            self.state.send_if_modified(|s| {
                let changed = *s != PlaybackState::Playing;
                *s = PlaybackState::Playing;
                changed
            });

            let chunk = PlayedChunk {
                chapter: chapter.id.clone(),
                index,
                total,
                audio,
            };
            tokio::select! {
                played = sink.play(chunk) => {
                    if let Err(err) = played {
                        self.stop(PlaybackState::Aborted);
                        return Err(err);
                    }
                }
                _ = aborted(&mut commands) => return Ok(self.stop(PlaybackState::Aborted)),
            }
        }

        self.markers.clear().await?;
        info!("Finished playing {}/{}", self.book.id, chapter.id);
        Ok(self.stop(PlaybackState::Finished))
    }

    fn stop(&self, state: PlaybackState) -> PlaybackState {
        self.state.send_replace(state);
        state
    }
}

async fn aborted(rx: &mut watch::Receiver<Command>) {
    if rx.wait_for(|c| *c == Command::Abort).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Blocks while paused. Returns the command that ended the wait.
async fn hold_while_paused(
    rx: &mut watch::Receiver<Command>,
    state: &watch::Sender<PlaybackState>,
) -> Command {
    let current = *rx.borrow_and_update();
    if current != Command::Pause {
        return current;
    }
    let before = state.send_replace(PlaybackState::Paused);
    let next = match rx.wait_for(|c| *c != Command::Pause).await {
        Ok(command) => *command,
        Err(_) => Command::Abort,
    };
    if next == Command::Play {
        state.send_replace(before);
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::WavEncoder;
    use crate::library::Library;
    use crate::settings::PipelineSettings;
    use crate::testing::{write_book, ScriptedEngine};
    use std::time::Duration;
    use tempfile::TempDir;

    const FIVE: &str = "一。\n\n二。\n\n三。\n\n四。\n\n五。\n";

    /// Records what it plays and runs a hook after each chunk.
    struct RecordingSink<F: FnMut(usize) + Send> {
        played: Vec<usize>,
        after: F,
    }

    #[async_trait]
    impl<F: FnMut(usize) + Send> AudioSink for RecordingSink<F> {
        async fn play(&mut self, chunk: PlayedChunk) -> Result<()> {
            self.played.push(chunk.index);
            (self.after)(chunk.index);
            Ok(())
        }
    }

    fn recorder<F: FnMut(usize) + Send>(after: F) -> RecordingSink<F> {
        RecordingSink {
            played: Vec::new(),
            after,
        }
    }

    fn setup(engine: ScriptedEngine, chapters: &[(&str, &str)]) -> (TempDir, Arc<JobScheduler>, Book) {
        let root = TempDir::new().unwrap();
        write_book(root.path(), "novel", chapters);
        let book = Library::open(root.path()).unwrap().book("novel").unwrap();
        let settings = PipelineSettings::default().with_jobs(2).with_retry(1, 1);
        let scheduler = Arc::new(JobScheduler::new(settings, Arc::new(engine), Arc::new(WavEncoder)));
        (root, scheduler, book)
    }

    #[tokio::test]
    async fn test_plays_every_chunk_in_order_and_clears_marker() {
        let (_root, scheduler, book) =
            setup(ScriptedEngine::new().with_delay(Duration::from_millis(5)), &[("01.txt", FIVE)]);
        let controller = PlaybackController::new(scheduler, book.clone()).with_prebuffer(2);
        let chapter = book.chapter("01.txt").unwrap();

        let mut sink = recorder(|_| {});
        let state = controller.play(&chapter, 0, &mut sink).await.unwrap();

        assert_eq!(state, PlaybackState::Finished);
        assert_eq!(sink.played, [0, 1, 2, 3, 4]);
        assert!(controller.resume_point().await.is_none());
    }

    #[tokio::test]
    async fn test_resume_replays_the_interrupted_chunk() {
        let (_root, scheduler, book) = setup(ScriptedEngine::new(), &[("01.txt", FIVE)]);
        let chapter = book.chapter("01.txt").unwrap();

        let first = PlaybackController::new(Arc::clone(&scheduler), book.clone());
        let control = first.control();
        let mut sink = recorder(move |index| {
            if index == 2 {
                control.abort();
            }
        });
        let state = first.play(&chapter, 0, &mut sink).await.unwrap();
        assert_eq!(state, PlaybackState::Aborted);
        assert_eq!(sink.played, [0, 1, 2]);

        // A new session, as after a restart.
        let second = PlaybackController::new(scheduler, book.clone());
        let (resume_chapter, chunk) = second.resume_point().await.unwrap();
        assert_eq!(resume_chapter.id, "01.txt");
        assert_eq!(chunk, 2);

        let mut sink = recorder(|_| {});
        second.play(&resume_chapter, chunk, &mut sink).await.unwrap();
        assert_eq!(sink.played, [2, 3, 4]);
    }

    #[tokio::test]
    async fn test_switching_chapter_replaces_marker() {
        let (_root, scheduler, book) =
            setup(ScriptedEngine::new(), &[("01.txt", FIVE), ("02.txt", FIVE)]);
        let controller = PlaybackController::new(scheduler, book.clone());
        let control = controller.control();

        let mut sink = recorder(move |_| control.abort());
        controller.play(&book.chapter("01.txt").unwrap(), 3, &mut sink).await.unwrap();
        assert_eq!(controller.markers().load().await.unwrap().chapter, "01.txt");

        let control = controller.control();
        let mut sink = recorder(move |_| control.abort());
        controller.play(&book.chapter("02.txt").unwrap(), 0, &mut sink).await.unwrap();

        let marker = controller.markers().load().await.unwrap();
        assert_eq!(marker.chapter, "02.txt");
        assert_eq!(marker.chunk, 0);
    }

    #[tokio::test]
    async fn test_pause_holds_until_resume() {
        let (_root, scheduler, book) = setup(ScriptedEngine::new(), &[("01.txt", FIVE)]);
        let controller = PlaybackController::new(scheduler, book.clone());
        let chapter = book.chapter("01.txt").unwrap();
        let control = controller.control();

        let pauser = control.clone();
        let mut sink = recorder(move |index| {
            if index == 1 {
                pauser.pause();
            }
        });
        let mut states = control.subscribe();
        let resumer = tokio::spawn(async move {
            states.wait_for(|s| *s == PlaybackState::Paused).await.unwrap();
            control.resume();
        });

        let state = controller.play(&chapter, 0, &mut sink).await.unwrap();
        resumer.await.unwrap();
        assert_eq!(state, PlaybackState::Finished);
        assert_eq!(sink.played, [0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failed_chunk_is_never_skipped() {
        let (_root, scheduler, book) = setup(ScriptedEngine::new().reject("三。"), &[("01.txt", FIVE)]);
        let controller = PlaybackController::new(scheduler, book.clone());
        let chapter = book.chapter("01.txt").unwrap();

        let mut sink = recorder(|_| {});
        let err = controller.play(&chapter, 0, &mut sink).await.unwrap_err();

        assert!(matches!(err, PipelineError::EngineRejected(_)), "{err}");
        assert_eq!(sink.played, [0, 1]);
        assert_eq!(controller.state(), PlaybackState::Aborted);
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_chunks() {
        let (_root, scheduler, book) = setup(ScriptedEngine::new(), &[("01.txt", "一。\n\n二。\n")]);
        let controller = PlaybackController::new(scheduler, book.clone());
        let chapter = book.chapter("01.txt").unwrap();

        let (mut sink, mut rx) = ChannelSink::new(4);
        controller.play(&chapter, 0, &mut sink).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.index, second.index), (0, 1));
        assert_eq!(first.total, 2);
        assert!(!first.audio.is_empty());
    }

    #[tokio::test]
    async fn test_start_past_the_end_is_rejected() {
        let (_root, scheduler, book) = setup(ScriptedEngine::new(), &[("01.txt", FIVE)]);
        let controller = PlaybackController::new(scheduler, book.clone());
        let chapter = book.chapter("01.txt").unwrap();
        let mut sink = recorder(|_| {});
        assert!(matches!(
            controller.play(&chapter, 5, &mut sink).await,
            Err(PipelineError::InvalidInput(_))
        ));
    }
}
