//! Fire-and-forget persistence of finished turns.
//!
//! Turn persistence and audio persistence run as two independent tasks.
//! The audio task needs the message id the turn task produces, handed over
//! through a `watch` channel and awaited for a bounded time.

use crate::api::FocusClient;
use crate::api::types::SaveMessageRequest;
use crate::runtime::{RuntimeEvent, emit};
use crate::session::types::{ConversationTurn, SessionMode, TurnKey};
use crate::session::{self, SharedSession};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the persistence tasks need from the coordinator.
#[derive(Debug, Clone)]
pub struct PersistContext {
    pub client: FocusClient,
    pub session: SharedSession,
    pub events: Option<broadcast::Sender<RuntimeEvent>>,
}

/// Save `turn` and publish its message id once known.
///
/// The receiver yields `Some(id)` after a successful save; the channel
/// closes without a value if the save fails.
pub fn spawn_turn_persistence(
    ctx: &PersistContext,
    key: TurnKey,
    turn: &ConversationTurn,
    mode: SessionMode,
) -> (JoinHandle<()>, watch::Receiver<Option<String>>) {
    let (tx, rx) = watch::channel(None);
    let request = SaveMessageRequest {
        question: turn.question.clone(),
        answer: turn.answer.clone(),
        mode: mode.as_str().to_owned(),
        persona: turn.persona.clone(),
        user_id: ctx.client.user_id().to_owned(),
        audio_file: None,
        session_id: key.session_id.clone(),
    };
    let ctx = ctx.clone();

    let handle = tokio::spawn(async move {
        let response = match ctx.client.save_message(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(session_id = %key.session_id, "turn persistence failed: {e}");
                return;
            }
        };
        let Some(message_id) = response.message_id else {
            warn!("turn saved without a message id");
            return;
        };
        {
            let mut manager = session::lock(&ctx.session);
            manager.reconcile_server_session_id(&key.session_id, response.session_id.as_deref());
            if !manager.set_message_id(&key, &message_id) {
                debug!(%message_id, "turn no longer active; message id not recorded");
            }
        }
        info!(%message_id, index = key.index, "turn persisted");
        emit(
            &ctx.events,
            RuntimeEvent::MessageSaved {
                key,
                message_id: message_id.clone(),
            },
        );
        tx.send_replace(Some(message_id));
    });
    (handle, rx)
}

/// Wait up to `limit` for a message id.
pub async fn await_message_id(
    mut rx: watch::Receiver<Option<String>>,
    limit: Duration,
) -> Option<String> {
    let id = match tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await {
        Ok(Ok(id)) => id.clone(),
        _ => None,
    };
    id
}

/// Persist the answer's audio once the message id arrives and attach the
/// returned file path to the turn.
pub fn spawn_audio_persistence(
    ctx: &PersistContext,
    key: TurnKey,
    answer: String,
    message_id: watch::Receiver<Option<String>>,
    wait: Duration,
) -> JoinHandle<()> {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        if answer.trim().is_empty() {
            return;
        }
        let Some(message_id) = await_message_id(message_id, wait).await else {
            warn!(
                index = key.index,
                wait_ms = wait.as_millis() as u64,
                "no message id; giving up on audio persistence"
            );
            return;
        };
        let audio_file = match ctx.client.save_audio(&answer, &message_id).await {
            Ok(path) => path,
            Err(e) => {
                warn!(%message_id, "audio persistence failed: {e}");
                return;
            }
        };
        if !session::lock(&ctx.session).attach_audio(&key, &audio_file) {
            debug!(%audio_file, "turn no longer active; audio not attached");
            return;
        }
        info!(%message_id, %audio_file, "audio attached");
        emit(&ctx.events, RuntimeEvent::AudioAttached { key, audio_file });
    })
}

/// Register a freshly created session and adopt the title it comes back with.
pub fn spawn_session_registration(ctx: &PersistContext, session_id: String) -> JoinHandle<()> {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        match ctx.client.create_session(&session_id).await {
            Ok(Some(title)) => {
                if session::lock(&ctx.session).set_title(&session_id, &title) {
                    emit(&ctx.events, RuntimeEvent::SessionTitle { session_id, title });
                }
            }
            Ok(None) => debug!(%session_id, "session registered without a title"),
            Err(e) => warn!(%session_id, "session registration failed: {e}"),
        }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn message_id_arrives_within_limit() {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            tx.send_replace(Some("m-9".to_owned()));
        });
        let id = await_message_id(rx, Duration::from_millis(3_000)).await;
        assert_eq!(id.as_deref(), Some("m-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn message_id_wait_is_bounded() {
        let (_tx, rx) = watch::channel::<Option<String>>(None);
        let started = tokio::time::Instant::now();
        assert!(await_message_id(rx, Duration::from_millis(3_000)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(3_000));
    }

    #[tokio::test]
    async fn failed_save_closes_channel_without_id() {
        let (tx, rx) = watch::channel::<Option<String>>(None);
        drop(tx);
        assert!(await_message_id(rx, Duration::from_secs(60)).await.is_none());
    }
}
