//! Conversation data model: sessions and turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of conversation a session holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Free-form questions (default).
    #[default]
    Question,
    /// Task-oriented requests.
    Task,
}

impl SessionMode {
    /// Wire name used by the persistence endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Task => "task",
        }
    }
}

/// One question/answer exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    /// Grows while the answer streams in.
    pub answer: String,
    pub is_streaming: bool,
    /// Persona captured when the question was asked.
    pub persona: Option<String>,
    /// Server id, known once turn persistence succeeds.
    pub message_id: Option<String>,
    /// Saved audio reference, attached after audio persistence succeeds.
    pub audio_file: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(question: impl Into<String>, persona: Option<String>) -> Self {
        Self {
            question: question.into(),
            answer: String::new(),
            is_streaming: true,
            persona,
            message_id: None,
            audio_file: None,
            created_at: Utc::now(),
        }
    }
}

/// A persisted, identified conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Immutable once assigned.
    pub session_id: String,
    pub mode: SessionMode,
    pub title: String,
    pub turns: Vec<ConversationTurn>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, mode: SessionMode) -> Self {
        Self {
            session_id: session_id.into(),
            mode,
            title: String::new(),
            turns: Vec::new(),
        }
    }
}

/// Identifies a turn for continuations that finish after the fact.
///
/// A continuation holding a key whose session is no longer active is stale
/// and must be discarded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TurnKey {
    pub session_id: String,
    pub index: usize,
}
