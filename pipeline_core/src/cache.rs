//! Durable, content-addressed store of synthesized chunks.
//!
//! Layout: `<book cache>/<chapter-slug>-<fp>/<identity>.wav`. The book cache
//! is `<book>/.nk-tts-cache` by default, or `<cache_dir>/<book-slug>-<fp>`
//! when a shared cache root is configured. Entries are published with a
//! temp-file + rename, so a reader never sees a partial entry.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::identity::{keyed_dir_name, ChunkIdentity};
use crate::library::{Book, Chapter};
use crate::metrics::PipelineMetrics;
use crate::settings::DEFAULT_CACHE_DIR_NAME;

pub const COMPLETE_MARKER: &str = ".complete";
pub const MANIFEST_FILE: &str = "chunks.json";
const ENTRY_EXTENSION: &str = "wav";
const TMP_SUFFIX: &str = ".tmp";
/// Temp files younger than this may belong to a write still in progress.
const STALE_TMP_AGE: Duration = Duration::from_secs(10 * 60);
const HOT_ENTRIES: usize = 64;

/// What [`ChunkCache::clear`] removes.
#[derive(Debug, Clone, Copy)]
pub enum CacheScope<'a> {
    Chapter(&'a Book, &'a Chapter),
    Book(&'a Book),
}

/// One line of a chapter's `chunks.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub identity: ChunkIdentity,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub book: String,
    pub chapter: String,
    pub chunks: Vec<ManifestEntry>,
}

#[derive(Clone)]
pub struct ChunkCache {
    shared_root: Option<PathBuf>,
    hot: Arc<Mutex<LruCache<PathBuf, Arc<Vec<u8>>>>>,
    metrics: Arc<PipelineMetrics>,
}

impl ChunkCache {
    pub fn new(shared_root: Option<PathBuf>, metrics: Arc<PipelineMetrics>) -> Self {
        let capacity = NonZeroUsize::new(HOT_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        Self {
            shared_root,
            hot: Arc::new(Mutex::new(LruCache::new(capacity))),
            metrics,
        }
    }

    pub fn book_root(&self, book: &Book) -> PathBuf {
        match &self.shared_root {
            Some(root) => root.join(keyed_dir_name(&book.id, &book.id)),
            None => book.dir.join(DEFAULT_CACHE_DIR_NAME),
        }
    }

    pub fn chapter(&self, book: &Book, chapter: &Chapter) -> ChapterCache {
        let key = format!("{}/{}", book.id, chapter.id);
        let stem = chapter
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| chapter.id.clone());
        ChapterCache {
            dir: self.book_root(book).join(keyed_dir_name(&stem, &key)),
            cache: self.clone(),
        }
    }

    /// Remove every entry in `scope`. Returns the number of chunk files removed.
    pub async fn clear(&self, scope: CacheScope<'_>) -> Result<usize> {
        let dir = match scope {
            CacheScope::Chapter(book, chapter) => self.chapter(book, chapter).dir,
            CacheScope::Book(book) => self.book_root(book),
        };
        self.forget_hot(&dir);
        remove_tree(&dir).await
    }

    fn hot_get(&self, path: &Path) -> Option<Arc<Vec<u8>>> {
        self.hot.lock().ok().and_then(|mut hot| hot.get(path).cloned())
    }

    fn hot_put(&self, path: PathBuf, bytes: Arc<Vec<u8>>) {
        if let Ok(mut hot) = self.hot.lock() {
            hot.put(path, bytes);
        }
    }

    fn forget_hot(&self, prefix: &Path) {
        if let Ok(mut hot) = self.hot.lock() {
            let stale: Vec<PathBuf> = hot
                .iter()
                .filter(|(path, _)| path.starts_with(prefix))
                .map(|(path, _)| path.clone())
                .collect();
            for path in stale {
                hot.pop(&path);
            }
        }
    }
}

/// Counts chunk entries under `dir`, then removes it.
async fn remove_tree(dir: &Path) -> Result<usize> {
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(0);
    }
    let removed = count_entries(dir).await;
    tokio::fs::remove_dir_all(dir)
        .await
        .map_err(|e| PipelineError::storage(dir, e))?;
    Ok(removed)
}

async fn count_entries(dir: &Path) -> usize {
    let mut count = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&current).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION) {
                count += 1;
            }
        }
    }
    count
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| PipelineError::storage(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}{}", file_name, uuid::Uuid::new_v4(), TMP_SUFFIX));

    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(PipelineError::storage(path, e));
    }
    Ok(())
}

/// The slice of the cache that belongs to one chapter.
#[derive(Clone)]
pub struct ChapterCache {
    dir: PathBuf,
    cache: ChunkCache,
}

impl ChapterCache {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, id: &ChunkIdentity) -> PathBuf {
        self.dir.join(format!("{}.{}", id.as_str(), ENTRY_EXTENSION))
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.dir).await.unwrap_or(false)
    }

    /// Create the directory and drop temp files left by interrupted writes.
    /// Recent temp files are kept: another job may be writing them.
    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PipelineError::storage(&self.dir, e))?;
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| PipelineError::storage(&self.dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::storage(&self.dir, e))?
        {
            if !entry.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
                continue;
            }
            let age = entry
                .metadata()
                .await
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok());
            if age.is_some_and(|age| age >= STALE_TMP_AGE) {
                debug!("Removing stale temp file {}", entry.path().display());
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    warn!("Could not remove {}: {}", entry.path().display(), e);
                }
            }
        }
        Ok(())
    }

    pub async fn lookup(&self, id: &ChunkIdentity) -> bool {
        let path = self.entry_path(id);
        if self.cache.hot_get(&path).is_some() {
            return true;
        }
        tokio::fs::try_exists(&path).await.unwrap_or(false)
    }

    pub async fn fetch(&self, id: &ChunkIdentity) -> Result<Arc<Vec<u8>>> {
        let path = self.entry_path(id);
        if let Some(bytes) = self.cache.hot_get(&path) {
            return Ok(bytes);
        }
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => Arc::new(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::NotFound(format!("cached chunk {}", id.short())))
            }
            Err(e) => return Err(PipelineError::storage(&path, e)),
        };
        self.cache.hot_put(path, Arc::clone(&bytes));
        Ok(bytes)
    }

    /// Publish a chunk. Storing an identity that is already present is a
    /// no-op; returns whether a new entry was written.
    pub async fn store(&self, id: &ChunkIdentity, bytes: &[u8]) -> Result<bool> {
        let path = self.entry_path(id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(false);
        }
        write_atomic(&path, bytes).await?;
        self.cache.metrics.record_chunk_stored();
        Ok(true)
    }

    pub async fn is_complete(&self) -> bool {
        tokio::fs::try_exists(self.dir.join(COMPLETE_MARKER))
            .await
            .unwrap_or(false)
    }

    pub async fn mark_complete(&self, chunks: usize) -> Result<()> {
        write_atomic(&self.dir.join(COMPLETE_MARKER), format!("{chunks}\n").as_bytes()).await
    }

    pub async fn clear_marker(&self) -> Result<()> {
        let marker = self.dir.join(COMPLETE_MARKER);
        match tokio::fs::remove_file(&marker).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::storage(&marker, e)),
        }
    }

    pub async fn write_manifest(&self, manifest: &ChunkManifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| PipelineError::InvalidInput(format!("manifest not serializable: {e}")))?;
        write_atomic(&self.dir.join(MANIFEST_FILE), &json).await
    }

    /// Delete this chapter's cache directory.
    pub async fn remove(&self) -> Result<usize> {
        self.cache.forget_hot(&self.dir);
        remove_tree(&self.dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::VoiceSettings;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Book, Chapter, ChunkCache) {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("novel");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("01.txt"), "本文。").unwrap();
        let book = Book::open(&dir).unwrap();
        let chapter = book.chapter("01.txt").unwrap();
        let cache = ChunkCache::new(None, PipelineMetrics::new());
        (root, book, chapter, cache)
    }

    fn id(text: &str) -> ChunkIdentity {
        ChunkIdentity::compute(text, &VoiceSettings::default(), None)
    }

    #[tokio::test]
    async fn test_store_then_fetch() {
        let (_root, book, chapter, cache) = fixture();
        let chapter_cache = cache.chapter(&book, &chapter);
        chapter_cache.prepare().await.unwrap();

        assert!(!chapter_cache.lookup(&id("a")).await);
        assert!(chapter_cache.store(&id("a"), b"RIFFdata").await.unwrap());
        assert!(chapter_cache.lookup(&id("a")).await);
        assert_eq!(chapter_cache.fetch(&id("a")).await.unwrap().as_slice(), b"RIFFdata");
    }

    #[tokio::test]
    async fn test_store_is_idempotent() {
        let (_root, book, chapter, cache) = fixture();
        let chapter_cache = cache.chapter(&book, &chapter);
        assert!(chapter_cache.store(&id("a"), b"first").await.unwrap());
        assert!(!chapter_cache.store(&id("a"), b"second").await.unwrap());
        assert_eq!(chapter_cache.fetch(&id("a")).await.unwrap().as_slice(), b"first");
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let (_root, book, chapter, cache) = fixture();
        let chapter_cache = cache.chapter(&book, &chapter);
        assert!(matches!(
            chapter_cache.fetch(&id("missing")).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_prepare_sweeps_old_temp_files() {
        let (_root, book, chapter, cache) = fixture();
        let chapter_cache = cache.chapter(&book, &chapter);
        chapter_cache.prepare().await.unwrap();
        let leftover = chapter_cache.dir().join(format!(".{}.wav.1234.tmp", id("a")));
        std::fs::write(&leftover, b"half").unwrap();
        let an_hour_ago = std::time::SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&leftover)
            .unwrap()
            .set_modified(an_hour_ago)
            .unwrap();
        assert!(!chapter_cache.lookup(&id("a")).await);

        chapter_cache.prepare().await.unwrap();
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn test_prepare_keeps_temp_files_being_written() {
        let (_root, book, chapter, cache) = fixture();
        let chapter_cache = cache.chapter(&book, &chapter);
        chapter_cache.prepare().await.unwrap();
        let in_flight = chapter_cache.dir().join(format!(".{}.wav.5678.tmp", id("b")));
        std::fs::write(&in_flight, b"half").unwrap();

        // A second job starting on the same chapter must not pull the file
        // out from under the writer.
        chapter_cache.prepare().await.unwrap();
        assert!(in_flight.exists());
    }

    #[tokio::test]
    async fn test_complete_marker() {
        let (_root, book, chapter, cache) = fixture();
        let chapter_cache = cache.chapter(&book, &chapter);
        chapter_cache.prepare().await.unwrap();
        assert!(!chapter_cache.is_complete().await);
        chapter_cache.mark_complete(7).await.unwrap();
        assert!(chapter_cache.is_complete().await);
        assert_eq!(
            std::fs::read_to_string(chapter_cache.dir().join(COMPLETE_MARKER)).unwrap(),
            "7\n"
        );
        chapter_cache.clear_marker().await.unwrap();
        assert!(!chapter_cache.is_complete().await);
    }

    #[tokio::test]
    async fn test_clear_scopes() {
        let (_root, book, chapter, cache) = fixture();
        let chapter_cache = cache.chapter(&book, &chapter);
        chapter_cache.store(&id("a"), b"a").await.unwrap();
        chapter_cache.store(&id("b"), b"b").await.unwrap();

        assert_eq!(cache.clear(CacheScope::Chapter(&book, &chapter)).await.unwrap(), 2);
        assert!(!chapter_cache.lookup(&id("a")).await);

        chapter_cache.store(&id("c"), b"c").await.unwrap();
        assert_eq!(cache.clear(CacheScope::Book(&book)).await.unwrap(), 1);
        assert!(!cache.book_root(&book).exists());
    }

    #[test]
    fn test_shared_root_separates_books() {
        let (_root, book, chapter, _) = fixture();
        let shared = ChunkCache::new(Some(PathBuf::from("/var/cache/nk")), PipelineMetrics::new());
        let dir = shared.chapter(&book, &chapter).dir().to_path_buf();
        assert!(dir.starts_with("/var/cache/nk"));
        assert!(dir.parent().unwrap().file_name().unwrap().to_string_lossy().starts_with("novel-"));
        assert!(dir.file_name().unwrap().to_string_lossy().starts_with("01-"));
    }
}
