//! Deterministic engine and library fixtures for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use engine_core::{EngineError, EngineResult, SynthesisEngine, SynthesisRequest};
use hound::{SampleFormat, WavSpec};

use crate::audio::encode_wav;

pub const SCRIPTED_SAMPLE_RATE: u32 = 8_000;
const SAMPLES_PER_CHAR: usize = 16;

/// An engine that renders every chunk as a constant tone whose level is
/// derived from the text, so assembled output can be checked for order.
#[derive(Default)]
pub struct ScriptedEngine {
    delay: Duration,
    rejected: Vec<String>,
    flaky: Mutex<HashMap<String, usize>>,
    unavailable: AtomicBool,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    texts: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answer this text with a 422 rejection.
    pub fn reject(mut self, text: &str) -> Self {
        self.rejected.push(text.to_string());
        self
    }

    /// Fail this text with a retryable error the first `times` attempts.
    pub fn fail_first(self, text: &str, times: usize) -> Self {
        if let Ok(mut flaky) = self.flaky.lock() {
            flaky.insert(text.to_string(), times);
        }
        self
    }

    /// Behave like an engine that is not running.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Texts in the order the engine received them.
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Sample level used for `text`. Never zero, so it is distinguishable
    /// from inter-chunk silence.
    pub fn level_for(text: &str) -> i16 {
        let sum: u32 = text.bytes().map(u32::from).sum();
        1 + (sum % 20_000) as i16
    }

    pub fn render(text: &str) -> Vec<u8> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: SCRIPTED_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let frames = SAMPLES_PER_CHAR * text.chars().count().max(1);
        let samples = vec![Self::level_for(text); frames];
        encode_wav(spec, &samples).unwrap_or_default()
    }
}

#[async_trait]
impl SynthesisEngine for ScriptedEngine {
    async fn synthesize(&self, request: &SynthesisRequest) -> EngineResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut texts) = self.texts.lock() {
            texts.push(request.text.clone());
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable {
                endpoint: self.endpoint(),
                reason: "connection refused".to_string(),
            });
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.rejected.iter().any(|t| t == &request.text) {
            return Err(EngineError::Rejected {
                status: 422,
                message: format!("cannot read {:?}", request.text),
            });
        }
        if let Ok(mut flaky) = self.flaky.lock() {
            if let Some(remaining) = flaky.get_mut(&request.text) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(EngineError::Malformed("truncated response".to_string()));
                }
            }
        }
        Ok(Self::render(&request.text))
    }

    fn endpoint(&self) -> String {
        "scripted://engine".to_string()
    }
}

/// Create `<root>/<book>/` with the given `(file name, text)` chapters.
pub fn write_book(root: &Path, book: &str, chapters: &[(&str, &str)]) -> PathBuf {
    let dir = root.join(book);
    std::fs::create_dir_all(&dir).expect("create book directory");
    for (name, text) in chapters {
        std::fs::write(dir.join(name), text).expect("write chapter");
    }
    dir
}

/// Levels of the consecutive non-silent runs in a decoded WAV.
pub fn segment_levels(samples: &[i16]) -> Vec<i16> {
    let mut levels: Vec<i16> = Vec::new();
    let mut previous = 0;
    for &sample in samples {
        if sample != 0 && sample != previous {
            levels.push(sample);
        }
        previous = sample;
    }
    levels
}
