//! Conversation session state.
//!
//! [`SessionStateManager`] is the only writer of session identity. A session
//! id is assigned once, lazily, when the first question of a fresh
//! conversation is asked, and it never changes for the lifetime of that
//! conversation: persona switches, errors and server disagreement leave it
//! untouched. Only [`SessionStateManager::new_chat`] and
//! [`SessionStateManager::switch_session`] replace the conversation object
//! itself.

pub mod persist;
pub mod types;

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use types::{ConversationTurn, Session, SessionMode, TurnKey};

/// Session manager shared between the coordinator and its continuations.
pub type SharedSession = Arc<Mutex<SessionStateManager>>;

/// Lock a shared manager, recovering from a poisoned lock.
pub fn lock(session: &SharedSession) -> MutexGuard<'_, SessionStateManager> {
    session
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Result of [`SessionStateManager::ensure_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStart {
    pub session_id: String,
    /// `true` when this call created the session.
    pub created: bool,
}

/// Owner of the active conversation and the current persona.
#[derive(Debug, Default)]
pub struct SessionStateManager {
    session: Option<Session>,
    persona: Option<String>,
    mode: SessionMode,
}

impl SessionStateManager {
    pub fn new(mode: SessionMode) -> Self {
        Self {
            session: None,
            persona: None,
            mode,
        }
    }

    /// Wrap a manager for sharing across tasks.
    pub fn shared(mode: SessionMode) -> SharedSession {
        Arc::new(Mutex::new(Self::new(mode)))
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.session_id.as_str())
    }

    /// Clone of the active session for display.
    pub fn snapshot(&self) -> Option<Session> {
        self.session.clone()
    }

    pub fn persona(&self) -> Option<&str> {
        self.persona.as_deref()
    }

    /// Change the persona used for subsequent questions.
    ///
    /// Never touches the session id.
    pub fn set_persona(&mut self, persona: Option<String>) {
        let persona = persona.filter(|p| !p.trim().is_empty());
        debug!(persona = ?persona, "persona changed");
        self.persona = persona;
    }

    /// Mode for sessions created from now on.
    ///
    /// A session that has no turns yet adopts it as well.
    pub fn set_mode(&mut self, mode: SessionMode) {
        self.mode = mode;
        if let Some(session) = self.session.as_mut()
            && session.turns.is_empty()
        {
            session.mode = mode;
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.session.as_ref().map_or(self.mode, |s| s.mode)
    }

    /// Return the active session id, creating the session if there is none.
    pub fn ensure_session(&mut self) -> SessionStart {
        if let Some(session) = self.session.as_ref() {
            return SessionStart {
                session_id: session.session_id.clone(),
                created: false,
            };
        }
        let session_id = uuid::Uuid::new_v4().to_string();
        info!(%session_id, "created conversation session");
        self.session = Some(Session::new(session_id.clone(), self.mode));
        SessionStart {
            session_id,
            created: true,
        }
    }

    /// Open a new streaming turn, creating the session if needed.
    ///
    /// The current persona is captured on the turn.
    pub fn begin_turn(&mut self, question: &str) -> (TurnKey, SessionStart) {
        let start = self.ensure_session();
        let persona = self.persona.clone();
        let mode = self.mode;
        let session = self
            .session
            .get_or_insert_with(|| Session::new(start.session_id.clone(), mode));
        session.turns.push(ConversationTurn::new(question, persona));
        let key = TurnKey {
            session_id: session.session_id.clone(),
            index: session.turns.len() - 1,
        };
        (key, start)
    }

    fn turn_mut(&mut self, key: &TurnKey) -> Option<&mut ConversationTurn> {
        let session = self.session.as_mut()?;
        if session.session_id != key.session_id {
            debug!(
                stale = %key.session_id,
                active = %session.session_id,
                "ignoring update for inactive session"
            );
            return None;
        }
        session.turns.get_mut(key.index)
    }

    pub fn turn(&self, key: &TurnKey) -> Option<&ConversationTurn> {
        let session = self.session.as_ref()?;
        if session.session_id != key.session_id {
            return None;
        }
        session.turns.get(key.index)
    }

    /// Append streamed answer text. Returns `false` for stale keys.
    pub fn append_answer(&mut self, key: &TurnKey, delta: &str) -> bool {
        match self.turn_mut(key) {
            Some(turn) => {
                turn.answer.push_str(delta);
                true
            }
            None => false,
        }
    }

    /// Mark the turn as no longer streaming and return a copy of it.
    pub fn finish_turn(&mut self, key: &TurnKey) -> Option<ConversationTurn> {
        let turn = self.turn_mut(key)?;
        turn.is_streaming = false;
        Some(turn.clone())
    }

    /// Mark every still-streaming turn as finished (turn abandonment).
    pub fn abandon_streaming(&mut self) {
        if let Some(session) = self.session.as_mut() {
            for turn in session.turns.iter_mut().filter(|t| t.is_streaming) {
                turn.is_streaming = false;
            }
        }
    }

    pub fn set_message_id(&mut self, key: &TurnKey, message_id: &str) -> bool {
        match self.turn_mut(key) {
            Some(turn) => {
                turn.message_id = Some(message_id.to_owned());
                true
            }
            None => false,
        }
    }

    pub fn attach_audio(&mut self, key: &TurnKey, audio_file: &str) -> bool {
        match self.turn_mut(key) {
            Some(turn) => {
                turn.audio_file = Some(audio_file.to_owned());
                true
            }
            None => false,
        }
    }

    /// Assign a title to the session with the given id, if still active.
    pub fn set_title(&mut self, session_id: &str, title: &str) -> bool {
        match self.session.as_mut() {
            Some(session) if session.session_id == session_id => {
                session.title = title.to_owned();
                true
            }
            _ => false,
        }
    }

    /// Compare a server-echoed session id with the local one.
    ///
    /// The local id stays authoritative; a mismatch is only logged.
    /// Returns `true` when the ids agree.
    pub fn reconcile_server_session_id(&self, sent: &str, returned: Option<&str>) -> bool {
        match returned {
            Some(returned) if !returned.is_empty() && returned != sent => {
                warn!(
                    sent,
                    returned, "backend returned a different session id; keeping the local one"
                );
                false
            }
            _ => true,
        }
    }

    /// Drop the local conversation; the next question starts a new session.
    pub fn new_chat(&mut self) {
        if let Some(session) = self.session.take() {
            info!(session_id = %session.session_id, "closed conversation session");
        }
    }

    /// Adopt a previously persisted session.
    pub fn switch_session(&mut self, session: Session) {
        info!(session_id = %session.session_id, "switched conversation session");
        self.session = Some(session);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn session_created_once() {
        let mut mgr = SessionStateManager::new(SessionMode::Question);
        let first = mgr.ensure_session();
        assert!(first.created);
        let second = mgr.ensure_session();
        assert!(!second.created);
        assert_eq!(first.session_id, second.session_id);
    }

    #[test]
    fn persona_switch_keeps_session_id() {
        let mut mgr = SessionStateManager::new(SessionMode::Question);
        let (k1, _) = mgr.begin_turn("one");
        mgr.set_persona(Some("coach".into()));
        let (k2, _) = mgr.begin_turn("two");
        mgr.set_persona(Some("tutor".into()));
        mgr.set_persona(None);
        let (k3, _) = mgr.begin_turn("three");

        assert_eq!(k1.session_id, k2.session_id);
        assert_eq!(k2.session_id, k3.session_id);
        assert_eq!(mgr.turn(&k1).unwrap().persona, None);
        assert_eq!(mgr.turn(&k2).unwrap().persona.as_deref(), Some("coach"));
        assert_eq!(mgr.turn(&k3).unwrap().persona, None);
    }

    #[test]
    fn answer_appends_and_finishes() {
        let mut mgr = SessionStateManager::new(SessionMode::Question);
        let (key, _) = mgr.begin_turn("What time is it?");
        assert!(mgr.append_answer(&key, "It is"));
        assert!(mgr.append_answer(&key, " three"));
        let turn = mgr.finish_turn(&key).unwrap();
        assert_eq!(turn.answer, "It is three");
        assert!(!turn.is_streaming);
    }

    #[test]
    fn stale_key_after_new_chat_is_ignored() {
        let mut mgr = SessionStateManager::new(SessionMode::Question);
        let (key, _) = mgr.begin_turn("hello");
        mgr.new_chat();
        let (fresh, start) = mgr.begin_turn("again");
        assert!(start.created);
        assert_ne!(fresh.session_id, key.session_id);
        assert!(!mgr.attach_audio(&key, "audio/1.mp3"));
        assert!(!mgr.append_answer(&key, "late"));
        assert!(mgr.attach_audio(&fresh, "audio/2.mp3"));
    }

    #[test]
    fn server_mismatch_does_not_override() {
        let mut mgr = SessionStateManager::new(SessionMode::Question);
        let start = mgr.ensure_session();
        assert!(!mgr.reconcile_server_session_id(&start.session_id, Some("server-id")));
        assert!(mgr.reconcile_server_session_id(&start.session_id, None));
        assert!(mgr.reconcile_server_session_id(&start.session_id, Some(&start.session_id)));
        assert_eq!(mgr.session_id(), Some(start.session_id.as_str()));
    }

    #[test]
    fn switch_session_adopts_persisted_id() {
        let mut mgr = SessionStateManager::new(SessionMode::Question);
        mgr.ensure_session();
        mgr.switch_session(Session::new("persisted-1", SessionMode::Task));
        let (key, start) = mgr.begin_turn("continue");
        assert!(!start.created);
        assert_eq!(key.session_id, "persisted-1");
        assert_eq!(mgr.mode(), SessionMode::Task);
    }

    #[test]
    fn title_only_applies_to_active_session() {
        let mut mgr = SessionStateManager::new(SessionMode::Question);
        let start = mgr.ensure_session();
        assert!(!mgr.set_title("other", "Nope"));
        assert!(mgr.set_title(&start.session_id, "Clock talk"));
        assert_eq!(mgr.session().unwrap().title, "Clock talk");
    }

    #[test]
    fn abandon_marks_streaming_turns_done() {
        let mut mgr = SessionStateManager::new(SessionMode::Question);
        let (key, _) = mgr.begin_turn("first");
        mgr.abandon_streaming();
        assert!(!mgr.turn(&key).unwrap().is_streaming);
    }

    #[test]
    fn mode_applies_to_empty_session_only() {
        let mut mgr = SessionStateManager::new(SessionMode::Question);
        mgr.ensure_session();
        mgr.set_mode(SessionMode::Task);
        assert_eq!(mgr.mode(), SessionMode::Task);
        mgr.begin_turn("x");
        mgr.set_mode(SessionMode::Question);
        assert_eq!(mgr.mode(), SessionMode::Task);
    }
}
