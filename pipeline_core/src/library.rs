//! Books on disk.
//!
//! A library root holds one directory per book. A book directory holds its
//! chapters as `*.txt` files (ordered by file name), an optional
//! `book.json` with metadata and voice overrides, and an optional cover
//! image. Assembled chapter audio is written next to the chapter text.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::identity::fingerprint;
use crate::settings::{VoiceOverrides, VoiceSettings};

pub const METADATA_FILE: &str = "book.json";
const COVER_CANDIDATES: &[&str] = &["cover.jpg", "cover.jpeg", "cover.png"];
const SKIPPED_SUFFIXES: &[&str] = &[".original.txt", ".partial.txt"];

/// Contents of `book.json`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    /// Cover image path, relative to the book directory.
    pub cover: Option<PathBuf>,
    pub voice: VoiceOverrides,
    /// Reading overrides already applied to the text by upstream tooling.
    /// Only their signature matters here: changing them re-synthesizes.
    pub overrides: BTreeMap<String, String>,
    /// Chapter titles keyed by chapter file name.
    pub chapter_titles: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Library {
    root: PathBuf,
}

impl Library {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(PipelineError::NotFound(format!(
                "library directory {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All book directories that contain at least one chapter, by name.
    pub fn books(&self) -> Result<Vec<Book>> {
        let entries =
            std::fs::read_dir(&self.root).map_err(|e| PipelineError::storage(&self.root, e))?;
        let mut books = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::storage(&self.root, e))?;
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden || !path.is_dir() {
                continue;
            }
            let book = Book::open(&path)?;
            if !book.chapters()?.is_empty() {
                books.push(book);
            }
        }
        books.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(books)
    }

    pub fn book(&self, id: &str) -> Result<Book> {
        if !is_plain_name(id) {
            return Err(PipelineError::InvalidInput(format!("invalid book id: {id}")));
        }
        let dir = self.root.join(id);
        if !dir.is_dir() {
            return Err(PipelineError::NotFound(format!("book {id}")));
        }
        Book::open(dir)
    }
}

/// A single path component that is not hidden and not a parent reference.
pub(crate) fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && Path::new(name).components().count() == 1
}

#[derive(Debug, Clone)]
pub struct Book {
    pub id: String,
    pub dir: PathBuf,
    pub metadata: BookMetadata,
}

impl Book {
    /// Open a book directory, reading `book.json` when present.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::InvalidInput(format!("not a book directory: {}", dir.display())))?;

        let metadata_path = dir.join(METADATA_FILE);
        let metadata = match std::fs::read(&metadata_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring unreadable {}: {}", metadata_path.display(), e);
                BookMetadata::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BookMetadata::default(),
            Err(e) => return Err(PipelineError::storage(&metadata_path, e)),
        };

        Ok(Self { id, dir, metadata })
    }

    pub fn title(&self) -> String {
        self.metadata
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.id.clone())
    }

    pub fn author(&self) -> Option<&str> {
        self.metadata.author.as_deref().filter(|a| !a.trim().is_empty())
    }

    /// Cover named in `book.json`, else the first conventional cover file.
    pub fn cover_path(&self) -> Option<PathBuf> {
        let explicit = self.metadata.cover.as_ref().map(|p| self.dir.join(p));
        explicit
            .into_iter()
            .chain(COVER_CANDIDATES.iter().map(|name| self.dir.join(name)))
            .find(|p| p.is_file())
    }

    /// Global voice with this book's overrides applied.
    pub fn voice(&self, base: &VoiceSettings) -> VoiceSettings {
        base.with_overrides(&self.metadata.voice)
    }

    /// Stable signature of the reading overrides, `None` when there are none.
    pub fn override_signature(&self) -> Option<String> {
        if self.metadata.overrides.is_empty() {
            return None;
        }
        let joined: Vec<String> = self
            .metadata
            .overrides
            .iter()
            .map(|(from, to)| format!("{from}\u{1f}{to}"))
            .collect();
        Some(fingerprint(&joined.join("\u{1e}")))
    }

    pub fn chapters(&self) -> Result<Vec<Chapter>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| PipelineError::storage(&self.dir, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::storage(&self.dir, e))?;
            let path = entry.path();
            if path.is_file() && is_chapter_file(&path) {
                files.push(path);
            }
        }
        files.sort();

        Ok(files
            .into_iter()
            .enumerate()
            .map(|(index, source)| Chapter::new(self, index, source))
            .collect())
    }

    pub fn chapter(&self, id: &str) -> Result<Chapter> {
        self.chapters()?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| PipelineError::NotFound(format!("chapter {id} in book {}", self.id)))
    }
}

fn is_chapter_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".txt")
        && !name.starts_with('.')
        && !SKIPPED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Leading digits of a file stem, e.g. `012_intro` gives 12.
pub fn parse_track_number(stem: &str) -> Option<u32> {
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chapter {
    /// Zero-based position in the book's reading order.
    pub index: usize,
    /// File name of the chapter text, unique within the book.
    pub id: String,
    pub source: PathBuf,
    pub title: String,
    pub track_number: u32,
}

impl Chapter {
    fn new(book: &Book, index: usize, source: PathBuf) -> Self {
        let id = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let title = book
            .metadata
            .chapter_titles
            .get(&id)
            .cloned()
            .unwrap_or_else(|| stem.clone());
        let track_number = parse_track_number(&stem).unwrap_or(index as u32 + 1);
        Self {
            index,
            id,
            source,
            title,
            track_number,
        }
    }

    /// Where the assembled audio for this chapter lives.
    pub fn output_path(&self, extension: &str) -> PathBuf {
        self.source.with_extension(extension)
    }

    pub async fn read_text(&self) -> Result<String> {
        let bytes = tokio::fs::read(&self.source)
            .await
            .map_err(|e| PipelineError::storage(&self.source, e))?;
        String::from_utf8(bytes).map_err(|e| PipelineError::Chunking {
            chapter: self.id.clone(),
            reason: format!("text is not valid UTF-8: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample_library() -> TempDir {
        let root = TempDir::new().unwrap();
        let book = root.path().join("novel");
        fs::create_dir(&book).unwrap();
        fs::write(book.join("002_second.txt"), "二章").unwrap();
        fs::write(book.join("001_first.txt"), "一章").unwrap();
        fs::write(book.join("001_first.original.txt"), "raw").unwrap();
        fs::write(book.join("003.partial.txt"), "partial").unwrap();
        fs::write(book.join("notes.md"), "ignored").unwrap();
        fs::write(book.join("cover.png"), [0u8; 4]).unwrap();
        fs::write(
            book.join(METADATA_FILE),
            r#"{"title":"Sample Novel","author":"Someone","voice":{"speaker":8},
               "chapter_titles":{"002_second.txt":"The Second"}}"#,
        )
        .unwrap();
        fs::create_dir(root.path().join("empty")).unwrap();
        root
    }

    #[test]
    fn test_chapters_are_ordered_and_filtered() {
        let root = sample_library();
        let library = Library::open(root.path()).unwrap();
        let book = library.book("novel").unwrap();
        let chapters = book.chapters().unwrap();
        let ids: Vec<&str> = chapters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["001_first.txt", "002_second.txt"]);
        assert_eq!(chapters[0].title, "001_first");
        assert_eq!(chapters[1].title, "The Second");
        assert_eq!(chapters[1].track_number, 2);
        assert_eq!(
            chapters[0].output_path("mp3"),
            root.path().join("novel").join("001_first.mp3")
        );
    }

    #[test]
    fn test_books_skip_empty_directories() {
        let root = sample_library();
        let library = Library::open(root.path()).unwrap();
        let books = library.books().unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].title(), "Sample Novel");
        assert_eq!(books[0].author(), Some("Someone"));
        assert_eq!(books[0].cover_path(), Some(root.path().join("novel").join("cover.png")));
        assert_eq!(books[0].voice(&VoiceSettings::default()).speaker, 8);
    }

    #[test]
    fn test_book_ids_are_single_components() {
        let root = sample_library();
        let library = Library::open(root.path()).unwrap();
        assert!(matches!(library.book("../etc"), Err(PipelineError::InvalidInput(_))));
        assert!(matches!(library.book(".hidden"), Err(PipelineError::InvalidInput(_))));
        assert!(matches!(library.book("missing"), Err(PipelineError::NotFound(_))));
    }

    #[test]
    fn test_track_number_parsing() {
        assert_eq!(parse_track_number("012_intro"), Some(12));
        assert_eq!(parse_track_number("intro"), None);
    }

    #[test]
    fn test_override_signature_tracks_content() {
        let root = sample_library();
        let mut book = Book::open(root.path().join("novel")).unwrap();
        assert_eq!(book.override_signature(), None);
        book.metadata.overrides.insert("重複".into(), "ちょうふく".into());
        let first = book.override_signature().unwrap();
        book.metadata.overrides.insert("重複".into(), "じゅうふく".into());
        assert_ne!(book.override_signature().unwrap(), first);
    }
}
