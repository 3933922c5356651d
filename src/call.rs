//! Inbound call events: one radio transmission with its detected tones
//! and transcript, as posted by the upstream tone detector.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Detector-assigned candidate id. Upstream sends either integers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToneId {
    Num(i64),
    Text(String),
}

impl Default for ToneId {
    fn default() -> Self {
        Self::Num(0)
    }
}

impl fmt::Display for ToneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Two sequential tones (A then B) with their measured lengths in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwoToneCandidate {
    pub detected: [f64; 2],
    #[serde(default)]
    pub tone_id: ToneId,
    #[serde(default)]
    pub tone_a_length: f64,
    #[serde(default)]
    pub tone_b_length: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongToneCandidate {
    pub detected: f64,
    #[serde(default)]
    pub tone_id: ToneId,
    #[serde(default)]
    pub length: f64,
}

/// Alternating hi/low warble; `alternations` counts the switches observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiLowCandidate {
    pub detected: [f64; 2],
    #[serde(default)]
    pub tone_id: ToneId,
    #[serde(default)]
    pub alternations: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectedTones {
    #[serde(default, deserialize_with = "null_as_default")]
    pub two_tone: Vec<TwoToneCandidate>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub long_tone: Vec<LongToneCandidate>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub hl_tone: Vec<HiLowCandidate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(default, deserialize_with = "null_as_default")]
    pub transcript: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub short_name: String,
    /// Epoch seconds.
    #[serde(default)]
    pub start_time: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tones: DetectedTones,
    #[serde(default, deserialize_with = "null_as_default")]
    pub transcript: Transcript,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_wav_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_m4a_url: Option<String>,
}

impl CallEvent {
    pub fn transcript_text(&self) -> &str {
        &self.transcript.transcript
    }

    /// Preferred audio reference for notifications (m4a first, it is smaller).
    pub fn audio_url(&self) -> Option<&str> {
        self.audio_m4a_url
            .as_deref()
            .or(self.audio_wav_url.as_deref())
    }
}

/// Treat an explicit JSON `null` the same as a missing field.
fn null_as_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}
