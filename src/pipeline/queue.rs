//! Serial sentence synthesis queue.
//!
//! One background task pops sentences in FIFO order and runs the
//! [`SentenceAudioWorker`] for each to completion before starting the next,
//! so audio for sentence N is always fully appended before sentence N+1
//! starts.

use crate::pipeline::messages::{SentenceOutcome, SentenceUnit};
use crate::tts::worker::SentenceAudioWorker;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type OutcomeLog = Arc<Mutex<Vec<(u64, SentenceOutcome)>>>;

/// FIFO of sentences waiting for synthesis.
pub struct SentenceQueue {
    tx: mpsc::UnboundedSender<SentenceUnit>,
    pending_tx: Arc<watch::Sender<usize>>,
    pending_rx: watch::Receiver<usize>,
    cancel: CancellationToken,
    last_sequence: Mutex<Option<u64>>,
    outcomes: OutcomeLog,
}

impl std::fmt::Debug for SentenceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentenceQueue")
            .field("pending", &self.pending())
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

impl SentenceQueue {
    /// Spawn the draining task for `worker`. Must be called inside a tokio runtime.
    pub fn new(worker: SentenceAudioWorker) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending_tx, pending_rx) = watch::channel(0usize);
        let pending_tx = Arc::new(pending_tx);
        let cancel = CancellationToken::new();
        let outcomes = OutcomeLog::default();

        tokio::spawn(drain(
            worker,
            rx,
            Arc::clone(&pending_tx),
            cancel.clone(),
            Arc::clone(&outcomes),
        ));

        Self {
            tx,
            pending_tx,
            pending_rx,
            cancel,
            last_sequence: Mutex::new(None),
            outcomes,
        }
    }

    fn last_sequence(&self) -> MutexGuard<'_, Option<u64>> {
        self.last_sequence
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Append a sentence; draining starts immediately if the queue is idle.
    ///
    /// Ignored once the queue has been stopped.
    pub fn enqueue(&self, unit: SentenceUnit) {
        if self.cancel.is_cancelled() {
            debug!(sequence = unit.sequence, "queue stopped; dropping sentence");
            return;
        }
        {
            let mut last = self.last_sequence();
            if let Some(prev) = *last
                && unit.sequence <= prev
            {
                warn!(
                    sequence = unit.sequence,
                    previous = prev,
                    "sentence enqueued out of order"
                );
            }
            *last = Some(unit.sequence);
        }
        self.pending_tx.send_modify(|p| *p += 1);
        if self.tx.send(unit).is_err() {
            self.pending_tx.send_modify(|p| *p = p.saturating_sub(1));
        }
    }

    /// Sentences queued or being synthesized.
    pub fn pending(&self) -> usize {
        *self.pending_rx.borrow()
    }

    /// Resolve once nothing is queued and no worker is active.
    pub async fn drained(&self) {
        let mut rx = self.pending_rx.clone();
        let _ = rx.wait_for(|p| *p == 0).await;
    }

    /// Drop pending sentences and abandon the active worker.
    pub fn stop_all(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let dropped = self.pending_tx.send_replace(0);
        if dropped > 0 {
            debug!(dropped, "sentence queue stopped");
        }
    }

    /// Outcomes of finished sentences, in completion order.
    pub fn outcomes(&self) -> Vec<(u64, SentenceOutcome)> {
        self.outcomes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Drop for SentenceQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drain(
    worker: SentenceAudioWorker,
    mut rx: mpsc::UnboundedReceiver<SentenceUnit>,
    pending: Arc<watch::Sender<usize>>,
    cancel: CancellationToken,
    outcomes: OutcomeLog,
) {
    loop {
        let unit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            unit = rx.recv() => match unit {
                Some(unit) => unit,
                None => break,
            },
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(sequence = unit.sequence, "sentence abandoned");
                break;
            }
            outcome = worker.run(&unit) => outcome,
        };

        debug!(sequence = unit.sequence, ?outcome, "sentence done");
        outcomes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((unit.sequence, outcome));
        pending.send_modify(|p| *p = p.saturating_sub(1));
    }
    info!("sentence queue closed");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::audio::memory::MemoryOutput;
    use crate::audio::sink::AudioChunkSink;
    use crate::error::Result;
    use crate::tts::worker::FirstAudioSignal;
    use crate::tts::{AudioByteStream, SpeechSynthesizer};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Answers after a per-sentence delay, echoing the sentence as audio.
    struct DelayedSynth {
        started: Mutex<Vec<(String, Instant)>>,
    }

    #[async_trait]
    impl SpeechSynthesizer for DelayedSynth {
        async fn synthesize(&self, text: &str) -> Result<Option<AudioByteStream>> {
            self.started
                .lock()
                .unwrap()
                .push((text.to_owned(), Instant::now()));
            let millis = match text {
                "One." => 300,
                "Two." => 50,
                "Three." => 150,
                _ => 10,
            };
            tokio::time::sleep(Duration::from_millis(millis)).await;
            let body = Bytes::from(format!("[{text}]"));
            Ok(Some(Box::pin(futures_util::stream::iter(vec![Ok(body)]))))
        }
    }

    fn setup() -> (SentenceQueue, Arc<DelayedSynth>, MemoryOutput, AudioChunkSink) {
        let synth = Arc::new(DelayedSynth {
            started: Mutex::new(Vec::new()),
        });
        let output = MemoryOutput::new();
        let sink = AudioChunkSink::new(Arc::new(output.clone()), 1);
        let worker = SentenceAudioWorker::new(
            synth.clone(),
            sink.clone(),
            FirstAudioSignal::noop(),
            Duration::from_secs(15),
        );
        (SentenceQueue::new(worker), synth, output, sink)
    }

    fn unit(text: &str, sequence: u64) -> SentenceUnit {
        SentenceUnit {
            text: text.to_owned(),
            sequence,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn appends_in_sequence_order_despite_latencies() {
        let (queue, synth, output, _sink) = setup();
        queue.enqueue(unit("One.", 0));
        queue.enqueue(unit(" Two.", 1));
        queue.enqueue(unit(" Three.", 2));
        assert_eq!(queue.pending(), 3);

        queue.drained().await;
        assert_eq!(
            String::from_utf8(output.last_stream().unwrap().bytes()).unwrap(),
            "[One.][Two.][Three.]"
        );

        // Each request starts only after the previous sentence completed.
        let started = synth.started.lock().unwrap().clone();
        assert_eq!(started.len(), 3);
        assert!(started[1].1 - started[0].1 >= Duration::from_millis(300));
        assert!(started[2].1 - started[1].1 >= Duration::from_millis(50));

        let order: Vec<u64> = queue.outcomes().iter().map(|(s, _)| *s).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn drained_resolves_immediately_when_empty() {
        let (queue, _synth, _output, _sink) = setup();
        queue.drained().await;
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_abandons_active_and_pending() {
        let (queue, synth, output, _sink) = setup();
        queue.enqueue(unit("One.", 0));
        queue.enqueue(unit(" Two.", 1));
        tokio::time::sleep(Duration::from_millis(100)).await;

        queue.stop_all();
        queue.stop_all();
        queue.drained().await;
        queue.enqueue(unit(" Three.", 2));
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        assert_eq!(synth.started.lock().unwrap().len(), 1);
        assert!(output.streams().is_empty());
        assert!(queue.outcomes().is_empty());
    }
}
