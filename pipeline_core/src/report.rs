// Summaries of finished chapters and runs.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::PipelineError;
use crate::job::{ChapterPlan, FailureKind, JobProgress, JobState};
use crate::library::Chapter;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedChunk {
    pub index: usize,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChapterReport {
    pub index: usize,
    pub chapter: String,
    pub title: String,
    pub state: JobState,
    pub total_chunks: usize,
    pub cached_at_start: usize,
    pub synthesized: usize,
    pub failed: Vec<FailedChunk>,
    pub output: Option<PathBuf>,
    pub error: Option<String>,
}

impl ChapterReport {
    /// A chapter whose output already existed and was left alone.
    pub fn skipped(chapter: &Chapter, output: PathBuf) -> Self {
        Self {
            index: chapter.index,
            chapter: chapter.id.clone(),
            title: chapter.title.clone(),
            state: JobState::Skipped,
            total_chunks: 0,
            cached_at_start: 0,
            synthesized: 0,
            failed: Vec::new(),
            output: Some(output),
            error: None,
        }
    }

    /// A chapter that could not even be planned (unreadable, empty).
    pub fn not_started(chapter: &Chapter, err: &PipelineError) -> Self {
        Self {
            index: chapter.index,
            chapter: chapter.id.clone(),
            title: chapter.title.clone(),
            state: JobState::Failed,
            total_chunks: 0,
            cached_at_start: 0,
            synthesized: 0,
            failed: Vec::new(),
            output: None,
            error: Some(err.to_string()),
        }
    }

    pub(crate) fn from_progress(plan: &ChapterPlan, progress: &JobProgress) -> Self {
        Self {
            index: plan.chapter.index,
            chapter: plan.chapter.id.clone(),
            title: plan.chapter.title.clone(),
            state: progress.state,
            total_chunks: progress.total,
            cached_at_start: progress.cached_at_start,
            synthesized: progress.synthesized,
            failed: progress.failed(),
            output: progress.output.clone(),
            error: progress.error.clone(),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::Skipped)
    }
}

impl fmt::Display for ChapterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            JobState::Skipped => write!(f, "{}: already assembled", self.chapter),
            JobState::Completed => write!(
                f,
                "{}: done ({} chunks, {} reused, {} synthesized)",
                self.chapter, self.total_chunks, self.cached_at_start, self.synthesized
            ),
            _ => {
                write!(f, "{}: {:?}", self.chapter, self.state)?;
                if !self.failed.is_empty() {
                    let indices: Vec<String> = self.failed.iter().map(|c| c.index.to_string()).collect();
                    write!(
                        f,
                        ", {} of {} chunks failed [{}]",
                        self.failed.len(),
                        self.total_chunks,
                        indices.join(", ")
                    )?;
                    if let Some(first) = self.failed.first() {
                        write!(f, " (first: {})", first.message)?;
                    }
                }
                if let Some(error) = &self.error {
                    write!(f, ": {error}")?;
                }
                Ok(())
            }
        }
    }
}

/// Outcome of a batch run over a book.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub book: String,
    pub chapters: Vec<ChapterReport>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.chapters.iter().all(ChapterReport::is_complete)
    }

    pub fn incomplete(&self) -> impl Iterator<Item = &ChapterReport> {
        self.chapters.iter().filter(|c| !c.is_complete())
    }

    pub fn synthesized(&self) -> usize {
        self.chapters.iter().map(|c| c.synthesized).sum()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let complete = self.chapters.iter().filter(|c| c.is_complete()).count();
        writeln!(
            f,
            "{}: {} of {} chapters complete, {} chunks synthesized",
            self.book,
            complete,
            self.chapters.len(),
            self.synthesized()
        )?;
        for chapter in &self.chapters {
            writeln!(f, "  {chapter}")?;
        }
        if !self.is_complete() {
            writeln!(
                f,
                "Run again to resume: cached chunks are reused and only missing ones are synthesized."
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(state: JobState, failed: Vec<FailedChunk>) -> ChapterReport {
        ChapterReport {
            index: 0,
            chapter: "01.txt".into(),
            title: "01".into(),
            state,
            total_chunks: 5,
            cached_at_start: 2,
            synthesized: 3 - failed.len(),
            failed,
            output: None,
            error: None,
        }
    }

    #[test]
    fn test_run_report_mentions_failed_chunks_and_resume() {
        let run = RunReport {
            book: "novel".into(),
            chapters: vec![
                report(JobState::Completed, vec![]),
                report(
                    JobState::PartiallyFailed,
                    vec![FailedChunk {
                        index: 3,
                        kind: FailureKind::EngineRejected,
                        message: "engine rejected the chunk".into(),
                    }],
                ),
            ],
        };
        assert!(!run.is_complete());
        assert_eq!(run.incomplete().count(), 1);
        let text = run.to_string();
        assert!(text.contains("1 of 2 chapters complete"));
        assert!(text.contains("[3]"));
        assert!(text.contains("Run again to resume"));
    }

    #[test]
    fn test_complete_run_has_no_resume_hint() {
        let run = RunReport {
            book: "novel".into(),
            chapters: vec![report(JobState::Completed, vec![])],
        };
        assert!(run.is_complete());
        assert!(!run.to_string().contains("resume"));
    }
}
