//! Per-call orchestration with a small state machine.
//!
//! IDLE → COMPLETING → SPEAKING → IDLE
//!
//! One utterance is processed at a time (`&mut self`). A new utterance
//! while the previous reply is still being spoken counts as barge-in: the
//! old interaction is cancelled before the new completion starts. SPEAKING
//! ends once the output stream has handed the reply's last event to the
//! sink.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{BackendRegistry, LanguageModelBackend, SpeechSynthesisBackend};
use crate::completion::{CompletionEngine, ResponseUnits};
use crate::config::Config;
use crate::conversation::ConversationContext;
use crate::dispatcher::SynthesisDispatcher;
use crate::error::Result;
use crate::history::{HistoryLog, HistorySender, SummaryRecord};
use crate::reorder::{InteractionGate, ReorderTask};
use crate::sink::OutputStream;
use crate::summary::CallSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Completing,
    Speaking,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Completing => write!(f, "COMPLETING"),
            Self::Speaking => write!(f, "SPEAKING"),
        }
    }
}

pub struct CallSession {
    call_id: String,
    state: SessionState,
    engine: CompletionEngine,
    dispatcher: SynthesisDispatcher,
    reorder: JoinHandle<()>,
    next_interaction: u64,
    /// Last interaction whose reply reached the sink in full.
    drained: watch::Receiver<u64>,
    speaking: Option<u64>,
    summary_timeout: Duration,
    history: Option<(HistorySender, JoinHandle<()>)>,
}

impl CallSession {
    /// Build a session and the receiving end of its ordered output stream.
    ///
    /// The stream must be drained (see [`crate::sink::run_sink`]) while
    /// the session runs, otherwise synthesis stalls on backpressure.
    pub fn new(
        config: &Config,
        llm: Arc<dyn LanguageModelBackend>,
        tts: Arc<dyn SpeechSynthesisBackend>,
        call_id: &str,
    ) -> (Self, OutputStream) {
        let history = config
            .history
            .enabled
            .then(|| HistoryLog::new(config.history.resolved_dir()).spawn_writer());

        let (event_tx, event_rx) = mpsc::channel(config.pipeline.event_buffer);
        let (output_tx, output_rx) = mpsc::channel(config.pipeline.output_buffer);
        let gate = InteractionGate::new();
        let output = OutputStream::new(output_rx, gate.clone());

        let reorder = ReorderTask::new(gate.clone(), history.as_ref().map(|(tx, _)| tx.clone()), call_id)
            .spawn(event_rx, output_tx);

        let mut engine = CompletionEngine::new(llm, &config.llm, config.pipeline.pause_marker);
        if !call_id.is_empty() {
            engine.set_call_id(call_id);
        }

        let dispatcher = SynthesisDispatcher::new(
            tts,
            config.pipeline.max_in_flight,
            config.tts.timeout(),
            config.pipeline.pause_marker,
            event_tx,
            gate,
        );

        let session = Self {
            call_id: call_id.to_string(),
            state: SessionState::Idle,
            engine,
            dispatcher,
            reorder,
            next_interaction: 1,
            drained: output.drained(),
            speaking: None,
            summary_timeout: Duration::from_secs(config.pipeline.summary_timeout_secs),
            history,
        };
        (session, output)
    }

    /// Build both backends by name through `registry`, then the session.
    pub fn from_config(
        config: &Config,
        registry: &BackendRegistry,
        call_id: &str,
    ) -> Result<(Self, OutputStream)> {
        config.validate()?;
        let llm = registry.build_llm(&config.llm)?;
        let tts = registry.build_tts(&config.tts)?;
        info!("Backends: llm={} tts={}", llm.name(), tts.name());
        Ok(Self::new(config, llm, tts, call_id))
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn state(&self) -> SessionState {
        if self.state == SessionState::Speaking && self.reply_drained() {
            SessionState::Idle
        } else {
            self.state
        }
    }

    fn reply_drained(&self) -> bool {
        self.speaking
            .map_or(true, |interaction_id| *self.drained.borrow() >= interaction_id)
    }

    /// Catch up with a reply that finished playing on its own.
    fn sync_state(&mut self) {
        if self.state == SessionState::Speaking && self.reply_drained() {
            self.state = SessionState::Idle;
            self.speaking = None;
            info!("State: SPEAKING → IDLE (reply drained)");
        }
    }

    pub fn context(&self) -> &ConversationContext {
        self.engine.context()
    }

    /// Prime the conversation with a turn given by role name.
    pub fn seed_turn(&mut self, role: &str, content: &str) -> Result<()> {
        self.engine.seed_turn(role, content)
    }

    /// Run one interaction: complete, slice, dispatch. Returns the
    /// interaction id once every unit is dispatched; audio arrives on the
    /// output stream.
    pub async fn handle_utterance(&mut self, text: &str) -> Result<u64> {
        self.interrupt().await?;

        let interaction_id = self.next_interaction;
        self.next_interaction += 1;

        self.state = SessionState::Completing;
        info!("State: IDLE → COMPLETING (interaction {interaction_id})");

        let t_start = Instant::now();
        let units = match self.engine.complete(text, interaction_id).await {
            Ok(units) => units,
            Err(e) => {
                self.state = SessionState::Idle;
                info!("State: COMPLETING → IDLE (completion failed)");
                return Err(e);
            }
        };
        let llm_latency_ms = t_start.elapsed().as_millis() as u64;

        let total = match self.dispatch_all(interaction_id, units, llm_latency_ms).await {
            Ok(total) => total,
            Err(e) => {
                if let Err(cancel_err) = self.dispatcher.cancel().await {
                    debug!("Cancel after failed dispatch: {cancel_err}");
                }
                self.state = SessionState::Idle;
                warn!("State: COMPLETING → IDLE (dispatch failed: {e})");
                return Err(e);
            }
        };

        self.state = SessionState::Speaking;
        self.speaking = Some(interaction_id);
        info!("State: COMPLETING → SPEAKING ({total} units, llm={llm_latency_ms}ms)");
        Ok(interaction_id)
    }

    async fn dispatch_all(&mut self, interaction_id: u64, units: ResponseUnits, llm_latency_ms: u64) -> Result<u64> {
        self.dispatcher.begin(interaction_id, llm_latency_ms).await?;
        let mut total = 0u64;
        for unit in units {
            self.dispatcher.dispatch(unit).await?;
            total += 1;
        }
        self.dispatcher.seal(interaction_id, total).await?;
        Ok(total)
    }

    /// Barge-in: stop the reply being spoken. Nothing more of it reaches
    /// the sink, including audio already queued on the output stream.
    pub async fn interrupt(&mut self) -> Result<()> {
        self.sync_state();
        if self.state != SessionState::Speaking {
            return Ok(());
        }
        let cancelled = self.dispatcher.cancel().await;
        self.state = SessionState::Idle;
        self.speaking = None;
        info!("State: SPEAKING → IDLE (interrupted)");
        cancelled
    }

    /// End the call: let the last reply finish, produce the summary and
    /// close the output stream.
    pub async fn finish(mut self) -> CallSummary {
        self.dispatcher.drain().await;

        let summary = self.engine.generate_summary(self.summary_timeout).await;
        let turns = self.context().len();

        let Self {
            call_id,
            dispatcher,
            reorder,
            history,
            ..
        } = self;
        drop(dispatcher);
        if let Err(e) = reorder.await {
            warn!("Reorder task failed: {e}");
        }

        // Queued after the reorder task exits so the day file keeps call order.
        if let Some((sender, writer)) = history {
            sender.summary(SummaryRecord::new(&call_id, turns, &summary));
            drop(sender);
            if let Err(e) = writer.await {
                warn!("History writer failed: {e}");
            }
        }
        info!("Call ended");

        summary
    }
}
