//! Call contract for the external speech-synthesis engine.
//!
//! The pipeline only ever talks to an engine through [`SynthesisEngine`]:
//! one chunk of text plus voice parameters in, one WAV blob out. The
//! [`VoicevoxClient`] speaks the VOICEVOX HTTP protocol and the
//! [`EngineRuntime`] implementations decide who owns the engine process.

mod client;
mod error;
mod runtime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use client::VoicevoxClient;
pub use error::{EngineError, EngineResult};
pub use runtime::{EngineRuntime, ExternalRuntime, ManagedRuntime};

/// Default address of a locally running VOICEVOX engine.
pub const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:50021";

/// Voice parameters forwarded to the engine. `None` keeps the engine's own
/// default for that scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    pub speaker: u32,
    pub speed: Option<f32>,
    pub pitch: Option<f32>,
    pub intonation: Option<f32>,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            speaker: 2,
            speed: None,
            pitch: None,
            intonation: None,
        }
    }
}

/// One unit of work for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: VoiceParams,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, voice: VoiceParams) -> Self {
        Self {
            text: text.into(),
            voice,
        }
    }
}

/// Anything that can turn a chunk of text into WAV bytes.
#[async_trait]
pub trait SynthesisEngine: Send + Sync {
    /// Synthesize one chunk. Returns the complete WAV file.
    async fn synthesize(&self, request: &SynthesisRequest) -> EngineResult<Vec<u8>>;

    /// Human-readable location of the engine, used in error messages.
    fn endpoint(&self) -> String;
}
