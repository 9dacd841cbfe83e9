//! On-device speech for turns where remote synthesis is not wanted.
//!
//! [`SpeechSynthesisFallback`] keeps an ordered utterance queue drained by
//! one background task; [`SystemVoice`] speaks each utterance with the
//! platform's command-line synthesizer.

use crate::config::FallbackConfig;
use crate::error::{FocusError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Speaks one utterance to completion.
///
/// Dropping the returned future must halt the utterance.
#[async_trait]
pub trait Utterer: Send + Sync {
    async fn utter(&self, text: &str) -> Result<()>;
}

/// Commands looked up on `PATH`, in order, when none is configured.
const SYSTEM_COMMANDS: &[&str] = &["say", "espeak-ng", "espeak"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandFlavor {
    /// macOS `say`.
    Say,
    /// `espeak` and `espeak-ng`.
    Espeak,
}

/// Platform text-to-speech command run once per utterance.
#[derive(Debug, Clone)]
pub struct SystemVoice {
    program: PathBuf,
    flavor: CommandFlavor,
    voice: Option<String>,
    rate_wpm: Option<u32>,
}

impl SystemVoice {
    /// Find a usable synthesis command, preferring the configured one.
    pub fn detect(config: &FallbackConfig) -> Option<Self> {
        let candidates = config
            .command
            .iter()
            .map(String::as_str)
            .chain(SYSTEM_COMMANDS.iter().copied());
        for candidate in candidates {
            match which::which(candidate) {
                Ok(program) => {
                    info!("on-device speech via {}", program.display());
                    return Some(Self::with_program(program, config));
                }
                Err(_) => debug!("speech command {candidate} not found"),
            }
        }
        None
    }

    fn with_program(program: PathBuf, config: &FallbackConfig) -> Self {
        let flavor = match program.file_stem().and_then(|s| s.to_str()) {
            Some("say") => CommandFlavor::Say,
            _ => CommandFlavor::Espeak,
        };
        Self {
            program,
            flavor,
            voice: config.voice.clone(),
            rate_wpm: config.rate_wpm,
        }
    }

    fn args(&self, text: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(voice) = &self.voice {
            args.push("-v".to_owned());
            args.push(voice.clone());
        }
        if let Some(rate) = self.rate_wpm {
            let flag = match self.flavor {
                CommandFlavor::Say => "-r",
                CommandFlavor::Espeak => "-s",
            };
            args.push(flag.to_owned());
            args.push(rate.to_string());
        }
        // Sentences may start with '-' (list items).
        args.push("--".to_owned());
        args.push(text.to_owned());
        args
    }
}

#[async_trait]
impl Utterer for SystemVoice {
    async fn utter(&self, text: &str) -> Result<()> {
        let status = tokio::process::Command::new(&self.program)
            .args(self.args(text))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(FocusError::Synthesis(format!(
                "{} exited with {status}",
                self.program.display()
            )))
        }
    }
}

struct QueueState {
    utterances: VecDeque<String>,
    /// Cancels the utterance currently being spoken.
    current: CancellationToken,
}

struct FallbackShared {
    state: Mutex<QueueState>,
    wake: Notify,
    /// Queued plus in-progress utterances.
    pending: watch::Sender<usize>,
    closed: CancellationToken,
}

impl FallbackShared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn release(&self, n: usize) {
        self.pending.send_modify(|p| *p = p.saturating_sub(n));
    }
}

/// Ordered on-device utterance queue.
pub struct SpeechSynthesisFallback {
    shared: Arc<FallbackShared>,
    pending_rx: watch::Receiver<usize>,
}

impl std::fmt::Debug for SpeechSynthesisFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechSynthesisFallback")
            .field("pending", &*self.pending_rx.borrow())
            .finish()
    }
}

impl SpeechSynthesisFallback {
    /// Spawn the speaking task. Must be called inside a tokio runtime.
    pub fn new(utterer: Arc<dyn Utterer>) -> Self {
        let (pending, pending_rx) = watch::channel(0usize);
        let shared = Arc::new(FallbackShared {
            state: Mutex::new(QueueState {
                utterances: VecDeque::new(),
                current: CancellationToken::new(),
            }),
            wake: Notify::new(),
            pending,
            closed: CancellationToken::new(),
        });
        tokio::spawn(run_utterances(Arc::clone(&shared), utterer));
        Self { shared, pending_rx }
    }

    /// Queue an utterance; blank text is ignored.
    pub fn speak(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let mut state = self.shared.state();
        state.utterances.push_back(text.to_owned());
        self.shared.pending.send_modify(|p| *p += 1);
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Drop queued utterances and halt the one being spoken.
    pub fn stop_all(&self) {
        let mut state = self.shared.state();
        let dropped = state.utterances.len();
        state.utterances.clear();
        state.current.cancel();
        state.current = CancellationToken::new();
        drop(state);
        self.shared.release(dropped);
        if dropped > 0 {
            debug!(dropped, "on-device utterances cleared");
        }
    }

    /// Queued plus in-progress utterances.
    pub fn pending(&self) -> usize {
        *self.pending_rx.borrow()
    }

    /// Resolve once nothing is queued or being spoken.
    pub async fn idle(&self) {
        let mut rx = self.pending_rx.clone();
        let _ = rx.wait_for(|p| *p == 0).await;
    }
}

impl Drop for SpeechSynthesisFallback {
    fn drop(&mut self) {
        self.stop_all();
        self.shared.closed.cancel();
    }
}

async fn run_utterances(shared: Arc<FallbackShared>, utterer: Arc<dyn Utterer>) {
    loop {
        let next = {
            let mut state = shared.state();
            state
                .utterances
                .pop_front()
                .map(|text| (text, state.current.clone()))
        };
        let Some((text, token)) = next else {
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = shared.closed.cancelled() => break,
            }
            continue;
        };

        tokio::select! {
            _ = token.cancelled() => debug!("utterance halted"),
            result = utterer.utter(&text) => {
                if let Err(e) = result {
                    warn!("on-device utterance failed: {e}");
                }
            }
        }
        shared.release(1);
    }
}
