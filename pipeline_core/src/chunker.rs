//! Splits chapter text into engine-sized chunks.
//!
//! Text is first cut into blocks at blank lines. A block that fits the
//! limit becomes one chunk; a longer block is cut at the last sentence
//! break before the limit, else the last clause break, else hard at the
//! limit. Splitting is a pure function of `(text, max_chars)`.

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CHARS_PER_CHUNK: usize = 360;

const SENTENCE_BREAKS: &[&str] = &["\n", "。", "！", "？", "!", "?", "…", "‼", "⁉", "⁈", "｡"];
const CLAUSE_BREAKS: &[&str] = &["、", "，", "､", ",", ";", "；", ":", "：", "・", "—", "─"];

/// A piece of chapter text with its byte span in the source.
///
/// `source[start..end] == text` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

impl TextChunk {
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// Split `text` into ordered chunks of at most `max_chars` characters.
///
/// Returns an empty list for text with nothing speakable in it; callers
/// decide whether that is an error. `max_chars` of zero is treated as one.
pub fn split_text(text: &str, max_chars: usize) -> Vec<TextChunk> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    for (start, end) in blocks(text) {
        split_block(text, start, end, max_chars, &mut chunks);
    }
    chunks
}

/// Byte ranges of the non-blank blocks, trimmed of surrounding whitespace.
fn blocks(text: &str) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let content = line.trim_end_matches(['\n', '\r']);
        if content.trim().is_empty() {
            if let Some(block) = current.take() {
                out.push(block);
            }
            continue;
        }
        let lead = content.len() - content.trim_start().len();
        let line_end = line_start + content.trim_end().len();
        current = match current {
            Some((start, _)) => Some((start, line_end)),
            None => Some((line_start + lead, line_end)),
        };
    }
    if let Some(block) = current {
        out.push(block);
    }
    out
}

fn split_block(text: &str, start: usize, end: usize, max_chars: usize, out: &mut Vec<TextChunk>) {
    let mut pos = start;
    while pos < end {
        let rest = &text[pos..end];
        let cut = if rest.chars().count() <= max_chars {
            rest.len()
        } else {
            preferred_cut(rest, max_chars)
        };

        let piece = rest[..cut].trim_end();
        if !piece.is_empty() {
            out.push(TextChunk {
                index: out.len(),
                text: piece.to_string(),
                start: pos,
                end: pos + piece.len(),
            });
        }

        pos += cut;
        let skipped = text[pos..end].len() - text[pos..end].trim_start().len();
        pos += skipped;
    }
}

/// Byte offset in `text` where the next chunk should end.
fn preferred_cut(text: &str, max_chars: usize) -> usize {
    let limit = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let window = &text[..limit];

    for separators in [SENTENCE_BREAKS, CLAUSE_BREAKS] {
        let best = separators
            .iter()
            .filter_map(|sep| match window.rfind(sep) {
                Some(idx) if idx > 0 => Some(idx + sep.len()),
                _ => None,
            })
            .max();
        if let Some(cut) = best {
            return cut;
        }
    }
    limit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_spans(text: &str, chunks: &[TextChunk]) {
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(&text[chunk.start..chunk.end], chunk.text);
        }
        for pair in chunks.windows(2) {
            assert!(pair[0].end <= pair[1].start, "chunks overlap: {pair:?}");
        }
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = split_text("吾輩は猫である。名前はまだ無い。", 360);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "吾輩は猫である。名前はまだ無い。");
    }

    #[test]
    fn test_blank_lines_separate_blocks() {
        let text = "  first paragraph\nstill first\n\n\n\nsecond paragraph  \n";
        let chunks = split_text(text, 360);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "first paragraph\nstill first");
        assert_eq!(chunks[1].text, "second paragraph");
        assert_spans(text, &chunks);
    }

    #[test]
    fn test_prefers_sentence_break_over_clause_break() {
        let text = "あいうえお。かきくけこ、さしすせそ";
        let chunks = split_text(text, 14);
        assert_eq!(chunks[0].text, "あいうえお。");
        assert_eq!(chunks[1].text, "かきくけこ、さしすせそ");
        assert_spans(text, &chunks);
    }

    #[test]
    fn test_falls_back_to_clause_break() {
        let text = "あいうえお、かきくけこさしすせそ";
        let chunks = split_text(text, 10);
        assert_eq!(chunks[0].text, "あいうえお、");
        assert_spans(text, &chunks);
    }

    #[test]
    fn test_hard_cut_without_separators() {
        let text = "a".repeat(25);
        let chunks = split_text(&text, 10);
        let lens: Vec<usize> = chunks.iter().map(|c| c.char_count()).collect();
        assert_eq!(lens, vec![10, 10, 5]);
        assert_spans(&text, &chunks);
    }

    #[test]
    fn test_no_chunk_exceeds_limit() {
        let text = "今日は晴れ。明日は雨、あさっては曇り！それから、ずっと雪？\n".repeat(40);
        for limit in [5, 17, 60, 360] {
            let chunks = split_text(&text, limit);
            assert!(chunks.iter().all(|c| c.char_count() <= limit));
            assert_spans(&text, &chunks);
        }
    }

    #[test]
    fn test_whitespace_only_text_has_no_chunks() {
        assert!(split_text("", 360).is_empty());
        assert!(split_text(" \n\n\t \r\n", 360).is_empty());
    }

    #[test]
    fn test_splitting_is_deterministic() {
        let text = "One. Two, three; four! Five? ".repeat(30);
        assert_eq!(split_text(&text, 40), split_text(&text, 40));
    }

    #[test]
    fn test_crlf_lines() {
        let text = "line one\r\nline two\r\n\r\nline three\r\n";
        let chunks = split_text(text, 360);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "line one\r\nline two");
        assert_eq!(chunks[1].text, "line three");
        assert_spans(text, &chunks);
    }
}
