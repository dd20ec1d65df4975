//! Concurrent speech synthesis for partial-response units.
//!
//! Every unit gets its own task, but outbound calls are capped by a shared
//! semaphore. Results are reported as [`SynthesisEvent`]s in completion
//! order, which is generally not index order; the reorder stage fixes that.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::SpeechSynthesisBackend;
use crate::completion::{speakable_text, PartialResponseUnit};
use crate::error::{BackendError, PipelineError, Result};
use crate::reorder::InteractionGate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisResult {
    pub sequence_index: u64,
    pub audio: Vec<u8>,
    pub source_text: String,
    pub interaction_id: u64,
}

/// Everything the reorder stage needs to know about an interaction, in the
/// order the dispatcher observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    Started {
        interaction_id: u64,
        llm_latency_ms: u64,
    },
    Ready(SynthesisResult),
    Failed {
        interaction_id: u64,
        sequence_index: u64,
        cause: BackendError,
    },
    /// Unit had nothing to speak and was not dispatched.
    Skipped {
        interaction_id: u64,
        sequence_index: u64,
    },
    /// All units of the interaction have been dispatched.
    Sealed { interaction_id: u64, total: u64 },
    /// Barge-in: outstanding work for the interaction was cancelled.
    Abandoned { interaction_id: u64 },
}

impl SynthesisEvent {
    pub fn interaction_id(&self) -> u64 {
        match self {
            Self::Ready(result) => result.interaction_id,
            Self::Started { interaction_id, .. }
            | Self::Failed { interaction_id, .. }
            | Self::Skipped { interaction_id, .. }
            | Self::Sealed { interaction_id, .. }
            | Self::Abandoned { interaction_id } => *interaction_id,
        }
    }
}

pub struct SynthesisDispatcher {
    backend: Arc<dyn SpeechSynthesisBackend>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    pause_marker: char,
    events: mpsc::Sender<SynthesisEvent>,
    gate: InteractionGate,
    current: Option<u64>,
    cancel: CancellationToken,
    workers: JoinSet<()>,
}

impl SynthesisDispatcher {
    pub fn new(
        backend: Arc<dyn SpeechSynthesisBackend>,
        max_in_flight: usize,
        timeout: Duration,
        pause_marker: char,
        events: mpsc::Sender<SynthesisEvent>,
        gate: InteractionGate,
    ) -> Self {
        Self {
            backend,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            timeout,
            pause_marker,
            events,
            gate,
            current: None,
            cancel: CancellationToken::new(),
            workers: JoinSet::new(),
        }
    }

    pub fn current_interaction(&self) -> Option<u64> {
        self.current
    }

    /// Number of synthesis calls that may start right now.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Start a fresh interaction. Any previous one is left to finish unless
    /// it was cancelled first.
    pub async fn begin(&mut self, interaction_id: u64, llm_latency_ms: u64) -> Result<()> {
        self.current = Some(interaction_id);
        self.cancel = CancellationToken::new();
        self.send(SynthesisEvent::Started {
            interaction_id,
            llm_latency_ms,
        })
        .await
    }

    /// Issue the synthesis call for one unit without waiting for it.
    pub async fn dispatch(&mut self, unit: PartialResponseUnit) -> Result<()> {
        self.reap();

        let text = speakable_text(&unit.text, self.pause_marker);
        if text.is_empty() {
            debug!(
                "Interaction {}: unit {} has nothing to speak",
                unit.interaction_id, unit.sequence_index
            );
            return self
                .send(SynthesisEvent::Skipped {
                    interaction_id: unit.interaction_id,
                    sequence_index: unit.sequence_index,
                })
                .await;
        }

        let backend = self.backend.clone();
        let permits = self.permits.clone();
        let timeout = self.timeout;
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        self.workers.spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(
                        "Interaction {}: unit {} cancelled",
                        unit.interaction_id, unit.sequence_index
                    );
                    return;
                }
                outcome = synthesize(backend.as_ref(), &permits, timeout, &text) => outcome,
            };

            let event = match outcome {
                Ok(audio) => SynthesisEvent::Ready(SynthesisResult {
                    sequence_index: unit.sequence_index,
                    audio,
                    source_text: unit.text,
                    interaction_id: unit.interaction_id,
                }),
                Err(cause) => {
                    let err = PipelineError::SynthesisFailed {
                        sequence_index: unit.sequence_index,
                        cause: cause.clone(),
                    };
                    warn!("Interaction {}: {err}", unit.interaction_id);
                    SynthesisEvent::Failed {
                        interaction_id: unit.interaction_id,
                        sequence_index: unit.sequence_index,
                        cause,
                    }
                }
            };

            if cancel.is_cancelled() {
                return;
            }
            if events.send(event).await.is_err() {
                debug!("Synthesis event channel closed");
            }
        });

        Ok(())
    }

    /// Announce how many units the interaction produced.
    pub async fn seal(&mut self, interaction_id: u64, total: u64) -> Result<()> {
        self.send(SynthesisEvent::Sealed {
            interaction_id,
            total,
        })
        .await
    }

    /// Cancel every outstanding call of the current interaction. Results
    /// that still arrive are dropped by the reorder stage.
    pub async fn cancel(&mut self) -> Result<()> {
        let Some(interaction_id) = self.current.take() else {
            return Ok(());
        };

        self.gate.abandon(interaction_id);
        self.cancel.cancel();
        info!("Interaction {interaction_id}: synthesis cancelled");
        self.send(SynthesisEvent::Abandoned { interaction_id }).await
    }

    /// Wait for every spawned synthesis task to finish.
    pub async fn drain(&mut self) {
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                warn!("Synthesis worker crashed: {e}");
            }
        }
    }

    fn reap(&mut self) {
        while let Some(result) = self.workers.try_join_next() {
            if let Err(e) = result {
                warn!("Synthesis worker crashed: {e}");
            }
        }
    }

    async fn send(&self, event: SynthesisEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| PipelineError::ChannelClosed)
    }
}

/// One bounded, time-limited synthesis call. The permit is released before
/// the result is reported.
async fn synthesize(
    backend: &dyn SpeechSynthesisBackend,
    permits: &Semaphore,
    timeout: Duration,
    text: &str,
) -> std::result::Result<Vec<u8>, BackendError> {
    let _permit = permits
        .acquire()
        .await
        .map_err(|_| BackendError::Unreachable("synthesis dispatcher shut down".into()))?;

    match tokio::time::timeout(timeout, backend.synthesize(text)).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout),
    }
}
