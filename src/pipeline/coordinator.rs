//! Turn orchestration: wires client, session, speech path and persistence.
//!
//! [`TurnCoordinator`] owns at most one active turn. Asking a new question
//! first releases the previous turn's [`TurnResources`] (filler, sentence
//! queue, sink or on-device queue), so two turns never speak at once.

use crate::api::FocusClient;
use crate::audio::device::AudioOutput;
use crate::audio::filler::{FillerAudioController, FillerOutcome, FillerSource};
use crate::audio::sink::AudioChunkSink;
use crate::config::FocusConfig;
use crate::error::{FocusError, Result};
use crate::pipeline::consumer::{StreamOutcome, TextStreamConsumer};
use crate::pipeline::queue::SentenceQueue;
use crate::pipeline::speech::SpeechPath;
use crate::preferences::{Preferences, SpeechBackend};
use crate::runtime::{AssistantState, RuntimeEvent, emit};
use crate::session::persist::{
    PersistContext, spawn_audio_persistence, spawn_session_registration, spawn_turn_persistence,
};
use crate::session::types::{Session, TurnKey};
use crate::session::{self, SessionStateManager, SharedSession};
use crate::tts::SpeechSynthesizer;
use crate::tts::fallback::{SpeechSynthesisFallback, SystemVoice, Utterer};
use crate::tts::worker::{FirstAudioSignal, SentenceAudioWorker};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Summary of one finished `ask`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    pub key: TurnKey,
    /// Answer text as shown in the transcript.
    pub answer: String,
    /// `true` when the answer stream completed normally and persistence was started.
    pub completed: bool,
    pub backend: SpeechBackend,
}

/// Everything one turn holds on to while it is speaking.
///
/// Released when the next turn starts, on errors, and on drop.
struct TurnResources {
    key: TurnKey,
    speech: SpeechPath,
    filler: Option<Arc<FillerAudioController>>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    released: bool,
}

impl TurnResources {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.cancel.cancel();
        if let Some(filler) = &self.filler {
            filler.stop();
        }
        self.speech.stop();
        debug!(index = self.key.index, "turn resources released");
    }
}

impl Drop for TurnResources {
    fn drop(&mut self) {
        self.release();
    }
}

/// Drives questions through the spoken-response pipeline.
pub struct TurnCoordinator {
    config: FocusConfig,
    client: FocusClient,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    filler_source: Arc<dyn FillerSource>,
    output: Arc<dyn AudioOutput>,
    session: SharedSession,
    preferences_path: PathBuf,
    utterer: Option<Arc<dyn Utterer>>,
    events: Option<broadcast::Sender<RuntimeEvent>>,
    active: Mutex<Option<TurnResources>>,
}

impl std::fmt::Debug for TurnCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCoordinator")
            .field("client", &self.client)
            .field("preferences_path", &self.preferences_path)
            .field("on_device", &self.utterer.is_some())
            .finish()
    }
}

impl TurnCoordinator {
    /// Build a coordinator talking to the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: FocusConfig, output: Arc<dyn AudioOutput>) -> Result<Self> {
        let client = FocusClient::new(config.api.clone())?;
        let utterer =
            SystemVoice::detect(&config.fallback).map(|v| Arc::new(v) as Arc<dyn Utterer>);
        Ok(Self {
            session: SessionStateManager::shared(config.pipeline.session_mode),
            synthesizer: Arc::new(client.clone()),
            filler_source: Arc::new(client.clone()),
            client,
            output,
            preferences_path: Preferences::default_path(),
            utterer,
            events: None,
            active: Mutex::new(None),
            config,
        })
    }

    /// Attach a runtime event sender for UI updates.
    pub fn with_runtime_events(mut self, tx: broadcast::Sender<RuntimeEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_preferences_path(mut self, path: PathBuf) -> Self {
        self.preferences_path = path;
        self
    }

    /// Replace the on-device speech command.
    pub fn with_utterer(mut self, utterer: Arc<dyn Utterer>) -> Self {
        self.utterer = Some(utterer);
        self
    }

    /// Replace the per-sentence synthesizer (defaults to the backend client).
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    /// Replace the filler clip source (defaults to the backend client).
    pub fn with_filler_source(mut self, source: Arc<dyn FillerSource>) -> Self {
        self.filler_source = source;
        self
    }

    pub fn client(&self) -> &FocusClient {
        &self.client
    }

    pub fn session(&self) -> SharedSession {
        Arc::clone(&self.session)
    }

    /// Clone of the active conversation for display.
    pub fn snapshot(&self) -> Option<Session> {
        session::lock(&self.session).snapshot()
    }

    fn active(&self) -> MutexGuard<'_, Option<TurnResources>> {
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn release_active(&self) {
        let previous = self.active().take();
        if let Some(mut previous) = previous {
            previous.release();
        }
    }

    fn persist_context(&self) -> PersistContext {
        PersistContext {
            client: self.client.clone(),
            session: Arc::clone(&self.session),
            events: self.events.clone(),
        }
    }

    fn set_state(&self, state: AssistantState) {
        emit(&self.events, RuntimeEvent::State(state));
    }

    fn status(&self, message: String) {
        emit(&self.events, RuntimeEvent::Status { message });
    }

    /// Upload a recording, then ask its transcript.
    ///
    /// # Errors
    ///
    /// Returns an error if transcription fails or the transcript is empty;
    /// the assistant goes back to listening.
    pub async fn handle_recording(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        mime: &str,
    ) -> Result<TurnReport> {
        self.set_state(AssistantState::Transcribing);
        match self.client.transcribe(audio, file_name, mime).await {
            Ok(transcript) => {
                info!(chars = transcript.chars().count(), "transcribed recording");
                self.ask(&transcript).await
            }
            Err(e) => {
                warn!("transcription failed: {e}");
                self.status(format!("Could not understand the recording: {e}"));
                self.set_state(AssistantState::Listening);
                Err(e)
            }
        }
    }

    /// Ask a question and stream the spoken answer.
    ///
    /// Returns once the answer text is complete; audio may still be
    /// playing. Use [`wait_idle`](Self::wait_idle) to wait for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the question is blank or the answer stream
    /// cannot be opened. Failures after that point end the turn normally.
    pub async fn ask(&self, question: &str) -> Result<TurnReport> {
        let question = question.trim();
        if question.is_empty() {
            return Err(FocusError::Stream("question is empty".to_owned()));
        }

        self.release_active();
        let prefs = Preferences::load_or_default(&self.preferences_path);

        let (key, start, persona, mode) = {
            let mut manager = session::lock(&self.session);
            manager.abandon_streaming();
            if prefs.persona.is_some() {
                manager.set_persona(prefs.persona.clone());
            }
            let (key, start) = manager.begin_turn(question);
            (key, start, manager.persona().map(str::to_owned), manager.mode())
        };
        info!(session_id = %key.session_id, index = key.index, "question submitted");
        emit(
            &self.events,
            RuntimeEvent::TurnStarted {
                key: key.clone(),
                question: question.to_owned(),
                persona: persona.clone(),
            },
        );
        self.set_state(AssistantState::Thinking);

        let ctx = self.persist_context();
        if start.created {
            emit(
                &self.events,
                RuntimeEvent::SessionStarted {
                    session_id: start.session_id.clone(),
                },
            );
            spawn_session_registration(&ctx, start.session_id.clone());
        }

        let (speech, filler, backend) = self.build_speech_path(prefs.speech_backend);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        if let (Some(filler), SpeechPath::Remote { sink, .. }) = (&filler, &speech) {
            self.spawn_filler(Arc::clone(filler), sink.clone(), cancel.clone());
        }
        *self.active() = Some(TurnResources {
            key: key.clone(),
            speech: speech.clone(),
            filler: filler.clone(),
            cancel: cancel.clone(),
            done: done_rx,
            released: false,
        });

        let stream = match self
            .client
            .ask(question, &key.session_id, persona.as_deref())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                error!("could not open answer stream: {e}");
                self.release_active();
                session::lock(&self.session).finish_turn(&key);
                self.status(format!("The assistant is unavailable: {e}"));
                self.set_state(AssistantState::Idle);
                return Err(e);
            }
        };

        let mut consumer = TextStreamConsumer::new(
            key.clone(),
            Arc::clone(&self.session),
            self.config.pipeline.min_sentence_chars,
            speech.clone(),
        );
        if let Some(events) = &self.events {
            consumer = consumer.with_events(events.clone());
        }
        let outcome = tokio::select! {
            outcome = consumer.consume(stream) => outcome,
            _ = cancel.cancelled() => {
                info!(index = key.index, "turn superseded while streaming");
                return Ok(TurnReport {
                    answer: self.answer_of(&key),
                    key,
                    completed: false,
                    backend,
                });
            }
        };
        self.set_state(AssistantState::Speaking);

        let (answer, completed) = match outcome {
            StreamOutcome::Completed(Some(turn)) => {
                let (_, message_id) = spawn_turn_persistence(&ctx, key.clone(), &turn, mode);
                spawn_audio_persistence(
                    &ctx,
                    key.clone(),
                    turn.answer.clone(),
                    message_id,
                    self.config.persistence.message_id_wait(),
                );
                (turn.answer, true)
            }
            StreamOutcome::Completed(None) => {
                debug!("turn finished after its session was replaced");
                (String::new(), false)
            }
            StreamOutcome::Broken { turn, error } => {
                self.status(format!("The answer was interrupted: {error}"));
                (turn.map(|t| t.answer).unwrap_or_default(), false)
            }
        };

        let events = self.events.clone();
        tokio::spawn(async move {
            let finished = tokio::select! {
                _ = cancel.cancelled() => false,
                _ = speech.finish() => true,
            };
            if let Some(filler) = filler
                && filler.stop()
            {
                emit(&events, RuntimeEvent::FillerStopped);
            }
            if finished {
                emit(&events, RuntimeEvent::State(AssistantState::Listening));
            }
            done_tx.send_replace(true);
        });

        Ok(TurnReport {
            key,
            answer,
            completed,
            backend,
        })
    }

    /// Wait until the active turn has finished speaking (or was released).
    pub async fn wait_idle(&self) {
        let done = self.active().as_ref().map(|r| r.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|d| *d).await;
        }
    }

    /// Halt whatever the active turn is saying.
    pub fn stop(&self) {
        self.release_active();
        session::lock(&self.session).abandon_streaming();
        self.set_state(AssistantState::Idle);
    }

    /// Change the persona for subsequent questions and remember it.
    ///
    /// # Errors
    ///
    /// Returns an error if the preference file cannot be written.
    pub fn set_persona(&self, persona: Option<String>) -> Result<()> {
        let persona = persona.filter(|p| !p.trim().is_empty());
        let mut prefs = Preferences::load_or_default(&self.preferences_path);
        prefs.persona = persona.clone();
        prefs.save(&self.preferences_path)?;
        session::lock(&self.session).set_persona(persona);
        Ok(())
    }

    /// Choose the speech path for subsequent questions and remember it.
    ///
    /// # Errors
    ///
    /// Returns an error if the preference file cannot be written.
    pub fn set_speech_backend(&self, backend: SpeechBackend) -> Result<()> {
        let mut prefs = Preferences::load_or_default(&self.preferences_path);
        prefs.speech_backend = backend;
        prefs.save(&self.preferences_path)
    }

    /// Start a fresh conversation.
    pub fn new_chat(&self) {
        self.release_active();
        session::lock(&self.session).new_chat();
        self.set_state(AssistantState::Idle);
    }

    /// Continue a previously persisted conversation.
    pub fn switch_session(&self, session: Session) {
        self.release_active();
        session::lock(&self.session).switch_session(session);
    }

    fn answer_of(&self, key: &TurnKey) -> String {
        session::lock(&self.session)
            .turn(key)
            .map(|t| t.answer.clone())
            .unwrap_or_default()
    }

    fn build_speech_path(
        &self,
        backend: SpeechBackend,
    ) -> (SpeechPath, Option<Arc<FillerAudioController>>, SpeechBackend) {
        if backend == SpeechBackend::OnDevice {
            match &self.utterer {
                Some(utterer) => {
                    let fallback = SpeechSynthesisFallback::new(Arc::clone(utterer));
                    return (SpeechPath::OnDevice(Arc::new(fallback)), None, backend);
                }
                None => {
                    warn!("no on-device speech command available; using remote synthesis");
                    self.status("On-device speech is unavailable; using the server voice.".into());
                }
            }
        }

        let sink = AudioChunkSink::new(
            Arc::clone(&self.output),
            self.config.playback.min_start_bytes,
        );
        let filler = self.config.filler.enabled.then(|| {
            Arc::new(FillerAudioController::new(
                Arc::clone(&self.filler_source),
                Arc::clone(&self.output),
            ))
        });
        let first_audio = match &filler {
            Some(filler) => {
                let filler = Arc::clone(filler);
                let events = self.events.clone();
                FirstAudioSignal::new(move || {
                    if filler.stop() {
                        emit(&events, RuntimeEvent::FillerStopped);
                    }
                })
            }
            None => FirstAudioSignal::noop(),
        };
        let mut worker = SentenceAudioWorker::new(
            Arc::clone(&self.synthesizer),
            sink.clone(),
            first_audio,
            self.config.synthesis.sentence_timeout(),
        );
        if let Some(events) = &self.events {
            worker = worker.with_events(events.clone());
        }
        self.forward_playback_states(&sink);

        let speech = SpeechPath::Remote {
            queue: Arc::new(SentenceQueue::new(worker)),
            sink,
        };
        (speech, filler, SpeechBackend::Remote)
    }

    fn spawn_filler(
        &self,
        filler: Arc<FillerAudioController>,
        sink: AudioChunkSink,
        cancel: CancellationToken,
    ) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                outcome = filler.play_filler() => {
                    if outcome == FillerOutcome::Playing {
                        sink.note_filler_playing();
                        emit(&events, RuntimeEvent::FillerStarted);
                    }
                }
            }
        });
    }

    fn forward_playback_states(&self, sink: &AudioChunkSink) {
        let Some(events) = self.events.clone() else {
            return;
        };
        let mut states = sink.subscribe();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                let _ = events.send(RuntimeEvent::Playback { state });
                if state.is_terminal() {
                    break;
                }
            }
        });
    }
}

impl Drop for TurnCoordinator {
    fn drop(&mut self) {
        self.release_active();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::audio::memory::MemoryOutput;
    use crate::config::ApiConfig;

    fn coordinator(dir: &tempfile::TempDir) -> TurnCoordinator {
        let config = FocusConfig {
            api: ApiConfig {
                // Nothing listens here; every request fails fast.
                base_url: "http://127.0.0.1:9".into(),
                connect_timeout_ms: 200,
                ..ApiConfig::default()
            },
            ..FocusConfig::default()
        };
        TurnCoordinator::new(config, Arc::new(MemoryOutput::new()))
            .unwrap()
            .with_preferences_path(dir.path().join("preferences.toml"))
    }

    #[tokio::test]
    async fn blank_question_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(&dir);
        assert!(c.ask("   ").await.is_err());
        assert!(c.snapshot().is_none());
    }

    #[tokio::test]
    async fn unreachable_backend_fails_turn_but_keeps_session() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = broadcast::channel(64);
        let c = coordinator(&dir).with_runtime_events(tx);

        assert!(c.ask("What time is it?").await.is_err());
        let session = c.snapshot().unwrap();
        assert_eq!(session.turns.len(), 1);
        assert!(!session.turns[0].is_streaming);
        assert!(c.active().is_none());

        let mut saw_idle = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, RuntimeEvent::State(AssistantState::Idle)) {
                saw_idle = true;
            }
        }
        assert!(saw_idle);
        c.wait_idle().await;
    }

    #[tokio::test]
    async fn persona_and_backend_are_remembered() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(&dir);
        c.set_persona(Some("coach".into())).unwrap();
        c.set_speech_backend(SpeechBackend::OnDevice).unwrap();
        let prefs = Preferences::load(&dir.path().join("preferences.toml")).unwrap();
        assert_eq!(prefs.persona.as_deref(), Some("coach"));
        assert_eq!(prefs.speech_backend, SpeechBackend::OnDevice);
        assert_eq!(session::lock(&c.session()).persona(), Some("coach"));
    }

    #[tokio::test]
    async fn new_chat_drops_session() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(&dir);
        let _ = c.ask("Hello?").await;
        assert!(c.snapshot().is_some());
        c.new_chat();
        assert!(c.snapshot().is_none());
    }
}
