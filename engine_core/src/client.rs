use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::{SynthesisEngine, SynthesisRequest, VoiceParams};

/// HTTP client for a VOICEVOX-compatible engine.
///
/// Synthesis is the two-step protocol of the engine: `POST /audio_query`
/// builds a query for the text, the client adjusts the voice scales on it,
/// and `POST /synthesis` renders the query to WAV.
#[derive(Debug, Clone)]
pub struct VoicevoxClient {
    base_url: String,
    client: Client,
}

impl VoicevoxClient {
    /// Create a client for the engine at `base_url`. `timeout` bounds every
    /// request, including the synthesis call itself.
    pub fn new(base_url: &str, timeout: Duration) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| EngineError::Runtime(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Readiness check. Succeeds once the engine answers `GET /version`.
    pub async fn version(&self) -> EngineResult<String> {
        let response = self
            .client
            .get(format!("{}/version", self.base_url))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let response = self.check_status(response).await?;
        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        Ok(body.trim().trim_matches('"').to_string())
    }

    /// Build the engine's synthesis query for `text` and apply the voice scales.
    pub async fn audio_query(&self, text: &str, voice: &VoiceParams) -> EngineResult<Value> {
        let response = self
            .client
            .post(format!("{}/audio_query", self.base_url))
            .query(&[("text", text.to_string()), ("speaker", voice.speaker.to_string())])
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let response = self.check_status(response).await?;
        let mut query: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Malformed(format!("audio_query returned invalid JSON: {e}")))?;
        apply_voice(&mut query, voice)?;
        Ok(query)
    }

    /// Render a prepared query to WAV bytes.
    pub async fn synthesis(&self, query: &Value, speaker: u32) -> EngineResult<Vec<u8>> {
        let response = self
            .client
            .post(format!("{}/synthesis", self.base_url))
            .query(&[("speaker", speaker.to_string())])
            .json(query)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let response = self.check_status(response).await?;
        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        if bytes.len() < 12 || &bytes[..4] != b"RIFF" {
            return Err(EngineError::Malformed(format!(
                "synthesis returned {} bytes that are not a WAV file",
                bytes.len()
            )));
        }
        Ok(bytes.to_vec())
    }

    fn transport_error(&self, err: reqwest::Error) -> EngineError {
        EngineError::Unavailable {
            endpoint: self.base_url.clone(),
            reason: err.to_string(),
        }
    }

    async fn check_status(&self, response: Response) -> EngineResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(EngineError::Rejected {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(EngineError::Malformed(format!("engine returned {status}: {message}")))
        }
    }
}

fn apply_voice(query: &mut Value, voice: &VoiceParams) -> EngineResult<()> {
    let fields = query
        .as_object_mut()
        .ok_or_else(|| EngineError::Malformed("audio_query did not return an object".into()))?;
    let scales = [
        ("speedScale", voice.speed),
        ("pitchScale", voice.pitch),
        ("intonationScale", voice.intonation),
    ];
    for (name, value) in scales {
        if let Some(value) = value {
            fields.insert(name.to_string(), Value::from(value));
        }
    }
    Ok(())
}

#[async_trait]
impl SynthesisEngine for VoicevoxClient {
    async fn synthesize(&self, request: &SynthesisRequest) -> EngineResult<Vec<u8>> {
        debug!(
            speaker = request.voice.speaker,
            chars = request.text.chars().count(),
            "requesting synthesis"
        );
        let query = self.audio_query(&request.text, &request.voice).await?;
        self.synthesis(&query, request.voice.speaker).await
    }

    fn endpoint(&self) -> String {
        self.base_url.clone()
    }
}
