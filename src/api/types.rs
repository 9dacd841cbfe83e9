//! Wire types for the assistant backend.

use serde::{Deserialize, Deserializer, Serialize};

/// Body of the answer-stream request.
#[derive(Debug, Clone, Serialize)]
pub struct AskRequest<'a> {
    pub question: &'a str,
    pub user_id: &'a str,
    pub session_id: &'a str,
    pub persona: Option<&'a str>,
}

/// One `data:` payload of the answer stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnswerPayload {
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub full_text: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Typed answer-stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerEvent {
    /// Next fragment of answer text.
    Chunk(String),
    /// Terminal event carrying the server's view of the whole answer.
    Done { full_text: String },
}

/// Response of `POST /transcribe`.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscribeResponse {
    pub success: bool,
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Body of the per-sentence synthesis request.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesizeRequest<'a> {
    pub text: &'a str,
}

/// Body of the turn-persistence request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveMessageRequest {
    pub question: String,
    pub answer: String,
    pub mode: String,
    pub persona: Option<String>,
    pub user_id: String,
    /// Always `null` here; audio is attached by a later call.
    pub audio_file: Option<String>,
    pub session_id: String,
}

/// Response of the turn-persistence request.
#[derive(Debug, Clone, Deserialize)]
pub struct SaveMessageResponse {
    pub success: bool,
    #[serde(default, deserialize_with = "opaque_id")]
    pub message_id: Option<String>,
    #[serde(default, deserialize_with = "opaque_id")]
    pub session_id: Option<String>,
}

/// Body of the audio-persistence request.
#[derive(Debug, Clone, Serialize)]
pub struct SaveAudioRequest<'a> {
    pub text: &'a str,
    pub message_id: &'a str,
}

/// Response of the audio-persistence request.
#[derive(Debug, Clone, Deserialize)]
pub struct SaveAudioResponse {
    pub success: bool,
    #[serde(default)]
    pub audio_file_path: Option<String>,
}

/// Body of the session-creation request.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionRequest<'a> {
    pub session_id: &'a str,
    pub user_id: &'a str,
}

/// Response of the session-creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionResponse {
    pub success: bool,
    #[serde(default)]
    pub title: Option<String>,
}

/// Ids are opaque: the backend may send them as strings or numbers.
fn opaque_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
