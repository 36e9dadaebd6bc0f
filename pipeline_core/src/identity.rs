// Content-addressed keys for cached chunks.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::settings::VoiceSettings;

/// Bumped whenever the encoding below changes, which invalidates every entry.
const IDENTITY_VERSION: &str = "nk-chunk-v1";
const FIELD_SEPARATOR: u8 = 0x1f;

/// Hex SHA-256 over everything that influences a chunk's audio.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkIdentity(String);

impl ChunkIdentity {
    /// Identity of `text` spoken with `voice`, under an optional per-book
    /// override signature.
    pub fn compute(text: &str, voice: &VoiceSettings, overrides: Option<&str>) -> Self {
        let normalized = normalize_text(text);
        let fields = [
            IDENTITY_VERSION.to_string(),
            normalized,
            voice.speaker.to_string(),
            encode_scale(voice.speed),
            encode_scale(voice.pitch),
            encode_scale(voice.intonation),
            format!("{:.4}", voice.pause),
            overrides.unwrap_or("-").to_string(),
        ];

        let mut hasher = Sha256::new();
        for field in &fields {
            hasher.update(field.as_bytes());
            hasher.update([FIELD_SEPARATOR]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ChunkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Line endings unified, surrounding whitespace dropped.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}

// "default" can never collide with a formatted number.
fn encode_scale(value: Option<f32>) -> String {
    match value {
        Some(v) => format!("{v:.4}"),
        None => "default".to_string(),
    }
}

/// Short stable fingerprint of an arbitrary key.
pub fn fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(digest)[..10].to_string()
}

/// File-system friendly rendering of a name: ASCII alphanumerics, `.`,
/// `_` and `-` survive, runs of anything else collapse into `_`.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    trimmed.chars().take(48).collect()
}

/// Directory name `<slug>-<fingerprint>` for a key; falls back to the bare
/// fingerprint when nothing of the name survives slugging.
pub fn keyed_dir_name(display: &str, key: &str) -> String {
    let slug = slugify(display);
    let fp = fingerprint(key);
    if slug.is_empty() {
        fp
    } else {
        format!("{slug}-{fp}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice() -> VoiceSettings {
        VoiceSettings::default()
    }

    #[test]
    fn test_identity_is_stable() {
        let a = ChunkIdentity::compute("こんにちは。", &voice(), None);
        let b = ChunkIdentity::compute("こんにちは。", &voice(), None);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_identity_normalizes_line_endings_and_edges() {
        let a = ChunkIdentity::compute("一行目\r\n二行目", &voice(), None);
        let b = ChunkIdentity::compute("  一行目\n二行目\n", &voice(), None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_identity_changes_with_every_voice_field() {
        let base = ChunkIdentity::compute("text", &voice(), None);
        let variants = [
            VoiceSettings { speaker: 3, ..voice() },
            VoiceSettings { speed: Some(1.0), ..voice() },
            VoiceSettings { pitch: Some(0.0), ..voice() },
            VoiceSettings { intonation: Some(1.0), ..voice() },
            VoiceSettings { pause: 0.5, ..voice() },
        ];
        for variant in variants {
            assert_ne!(base, ChunkIdentity::compute("text", &variant, None), "{variant:?}");
        }
        assert_ne!(base, ChunkIdentity::compute("text", &voice(), Some("abc")));
        assert_ne!(base, ChunkIdentity::compute("text!", &voice(), None));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("01 The Beginning.txt"), "01_The_Beginning.txt");
        assert_eq!(slugify("第一章"), "");
        assert_eq!(slugify("__a  b__"), "a_b");
        assert_eq!(keyed_dir_name("第一章", "book/第一章.txt"), fingerprint("book/第一章.txt"));
    }
}
