use std::sync::Arc;

use pipeline_core::{Book, Chapter, JobScheduler, Library};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::metrics::AppMetrics;
use crate::validation::{validate_book_id, validate_chapter_id};

#[derive(Clone)]
pub struct AppState {
    pub library: Arc<Library>,
    pub scheduler: Arc<JobScheduler>,
    pub metrics: Arc<AppMetrics>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(library: Library, scheduler: JobScheduler, config: ServerConfig) -> Self {
        Self {
            library: Arc::new(library),
            scheduler: Arc::new(scheduler),
            metrics: Arc::new(AppMetrics::new()),
            config,
        }
    }

    /// Resolve a book id from the URL.
    pub fn book(&self, id: &str) -> Result<Book, ApiError> {
        validate_book_id(id)?;
        Ok(self.library.book(id)?)
    }

    /// Resolve a book and one of its chapters from the URL.
    pub fn chapter(&self, book_id: &str, chapter_id: &str) -> Result<(Book, Chapter), ApiError> {
        let book = self.book(book_id)?;
        validate_chapter_id(chapter_id)?;
        let chapter = book.chapter(chapter_id)?;
        Ok((book, chapter))
    }
}
