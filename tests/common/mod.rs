#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use call_speaker::{
    BackendError, CallSession, CollectingSink, Config, LanguageModelBackend, OutputEvent,
    OutputSink, OutputStream, SpeechSynthesisBackend, Turn,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Language model that replays a script of (delay, reply) pairs.
pub struct ScriptedLlm {
    script: Mutex<VecDeque<(Duration, Result<String, BackendError>)>>,
    pub calls: Mutex<Vec<Vec<Turn>>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<Result<String, BackendError>>) -> Arc<Self> {
        Self::with_delays(replies.into_iter().map(|r| (Duration::ZERO, r)).collect())
    }

    pub fn replying(replies: &[&str]) -> Arc<Self> {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn with_delays(script: Vec<(Duration, Result<String, BackendError>)>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Vec<Turn>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModelBackend for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, messages: &[Turn], _system_prompt: &str) -> Result<String, BackendError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let next = self.script.lock().unwrap().pop_front();
        let Some((delay, reply)) = next else {
            return Err(BackendError::Unreachable("script exhausted".into()));
        };
        tokio::time::sleep(delay).await;
        reply
    }
}

/// Synthesizer whose latency and failures are chosen per text. Audio is
/// the text's bytes.
#[derive(Default)]
pub struct FakeTts {
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    failures: HashSet<String>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
}

impl FakeTts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, text: &str, delay: Duration) -> Self {
        self.delays.insert(text.to_string(), delay);
        self
    }

    pub fn default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn fail(mut self, text: &str) -> Self {
        self.failures.insert(text.to_string());
        self
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpeechSynthesisBackend for FakeTts {
    fn name(&self) -> &str {
        "fake"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, BackendError> {
        self.calls.lock().unwrap().push(text.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(text).copied().unwrap_or(self.default_delay);
        tokio::time::sleep(delay).await;
        self.finished.lock().unwrap().push(text.to_string());

        if self.failures.contains(text) {
            return Err(BackendError::RejectedByProvider {
                status: 500,
                body: "synthesis failed".into(),
            });
        }
        Ok(text.as_bytes().to_vec())
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.history.enabled = false;
    config.llm.timeout_secs = 5;
    config.tts.timeout_secs = 5;
    config.pipeline.max_in_flight = 4;
    config
}

pub fn start_session(
    config: &Config,
    llm: Arc<ScriptedLlm>,
    tts: Arc<FakeTts>,
) -> (CallSession, JoinHandle<std::io::Result<CollectingSink>>) {
    start_session_with_sink(config, llm, tts, CollectingSink::new())
}

pub fn start_session_with_sink<S: OutputSink + 'static>(
    config: &Config,
    llm: Arc<ScriptedLlm>,
    tts: Arc<FakeTts>,
    sink: S,
) -> (CallSession, JoinHandle<std::io::Result<S>>) {
    let (session, output): (CallSession, OutputStream) = CallSession::new(config, llm, tts, "CA-test");
    let sink = tokio::spawn(call_speaker::run_sink(output, sink));
    (session, sink)
}

/// Sink that plays each event for a fixed time, like a call leg streaming
/// audio in real time. Records when each event was handed over.
pub struct PacedSink {
    pace: Duration,
    pub delivered: Vec<(Instant, OutputEvent)>,
}

impl PacedSink {
    pub fn new(pace: Duration) -> Self {
        Self {
            pace,
            delivered: Vec::new(),
        }
    }

    /// `(interaction_id, sequence_index)` of audio handed over after `since`.
    pub fn audio_after(&self, since: Instant) -> Vec<(u64, u64)> {
        self.delivered
            .iter()
            .filter(|(at, _)| *at > since)
            .filter_map(|(_, e)| match e {
                OutputEvent::Audio {
                    interaction_id,
                    sequence_index,
                    ..
                } => Some((*interaction_id, *sequence_index)),
                OutputEvent::Completed { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl OutputSink for PacedSink {
    async fn deliver(&mut self, event: OutputEvent) -> std::io::Result<()> {
        self.delivered.push((Instant::now(), event));
        tokio::time::sleep(self.pace).await;
        Ok(())
    }
}

pub fn audio_texts(sink: &CollectingSink) -> Vec<String> {
    sink.events
        .iter()
        .filter_map(|e| match e {
            OutputEvent::Audio { audio, .. } => Some(String::from_utf8_lossy(audio).to_string()),
            OutputEvent::Completed { .. } => None,
        })
        .collect()
}
