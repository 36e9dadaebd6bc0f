use crate::error::ApiError;

/// Maximum length of a book or chapter id
const MAX_ID_LENGTH: usize = 255;
/// Upper bound for chunk offsets in query strings
const MAX_CHUNK_INDEX: usize = 1_000_000;

/// Validate a book directory name taken from the URL
pub fn validate_book_id(id: &str) -> Result<(), ApiError> {
    validate_name("book", id)
}

/// Validate a chapter file name taken from the URL
pub fn validate_chapter_id(id: &str) -> Result<(), ApiError> {
    validate_name("chapter", id)?;
    if !id.ends_with(".txt") {
        return Err(ApiError::InvalidInput(format!(
            "Invalid chapter id: {}. Expected a .txt file name",
            id
        )));
    }
    Ok(())
}

/// Validate a chunk offset
pub fn validate_chunk_index(index: usize) -> Result<(), ApiError> {
    if index > MAX_CHUNK_INDEX {
        return Err(ApiError::InvalidInput(format!(
            "Chunk index too large (max {})",
            MAX_CHUNK_INDEX
        )));
    }
    Ok(())
}

// Ids are single path components: no separators, no traversal, not hidden.
fn validate_name(kind: &str, id: &str) -> Result<(), ApiError> {
    if id.trim().is_empty() {
        return Err(ApiError::InvalidInput(format!("{} id cannot be empty", kind)));
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "{} id too long (max {} characters)",
            kind, MAX_ID_LENGTH
        )));
    }
    if id.starts_with('.') || id.contains(['/', '\\', '\0']) {
        return Err(ApiError::InvalidInput(format!("Invalid {} id: {}", kind, id)));
    }
    Ok(())
}
