//! Ordered output stream towards the call leg.
//!
//! The reorder task publishes [`OutputEvent`]s on a bounded channel; a sink
//! drains it through an [`OutputStream`]. A slow sink applies backpressure
//! all the way back to the synthesis tasks.
//!
//! Events can sit in the channel for a while behind a sink that plays at
//! real-time speed, so the stream checks the barge-in gate again as each
//! event is taken off the channel.

use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::reorder::InteractionGate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Audio {
        sequence_index: u64,
        interaction_id: u64,
        audio: Vec<u8>,
        source_text: String,
    },
    /// Terminal event once every unit was released or skipped.
    Completed {
        interaction_id: u64,
        released: u64,
        skipped: u64,
    },
}

impl OutputEvent {
    pub fn interaction_id(&self) -> u64 {
        match self {
            Self::Audio { interaction_id, .. } | Self::Completed { interaction_id, .. } => *interaction_id,
        }
    }
}

/// Receiving end of a session's ordered output.
pub struct OutputStream {
    events: mpsc::Receiver<OutputEvent>,
    gate: InteractionGate,
    drained: watch::Sender<u64>,
}

impl OutputStream {
    pub fn new(events: mpsc::Receiver<OutputEvent>, gate: InteractionGate) -> Self {
        Self {
            events,
            gate,
            drained: watch::Sender::new(0),
        }
    }

    /// Id of the last interaction whose terminal event was taken off the
    /// stream, i.e. whose audio has all been handed to the sink.
    pub fn drained(&self) -> watch::Receiver<u64> {
        self.drained.subscribe()
    }

    /// Next event of a live interaction. Events of interactions abandoned
    /// by barge-in are dropped here even if they were queued before it.
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        loop {
            let event = self.events.recv().await?;
            let interaction_id = event.interaction_id();
            if self.gate.is_abandoned(interaction_id) {
                debug!("Dropping queued output of abandoned interaction {interaction_id}");
                continue;
            }
            if matches!(event, OutputEvent::Completed { .. }) {
                self.drained.send_replace(interaction_id);
            }
            return Some(event);
        }
    }
}

#[async_trait]
pub trait OutputSink: Send {
    async fn deliver(&mut self, event: OutputEvent) -> std::io::Result<()>;

    async fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Pump the output stream into `sink` until it closes, then hand the sink
/// back.
pub async fn run_sink<S: OutputSink>(mut events: OutputStream, mut sink: S) -> std::io::Result<S> {
    while let Some(event) = events.recv().await {
        sink.deliver(event).await?;
    }
    sink.flush().await?;
    debug!("Output channel closed");
    Ok(sink)
}

/// Writes one JSON object per event. Audio is base64 encoded, as media
/// streams expect.
pub struct JsonLinesSink {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl JsonLinesSink {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self { writer }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(tokio::io::stdout()))
    }

    pub async fn create(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Self::new(Box::new(file)))
    }

    pub fn encode(event: &OutputEvent) -> serde_json::Value {
        match event {
            OutputEvent::Audio {
                sequence_index,
                interaction_id,
                audio,
                source_text,
            } => json!({
                "event": "audio",
                "interaction_id": interaction_id,
                "sequence_index": sequence_index,
                "source_text": source_text,
                "payload": BASE64.encode(audio),
            }),
            OutputEvent::Completed {
                interaction_id,
                released,
                skipped,
            } => json!({
                "event": "completed",
                "interaction_id": interaction_id,
                "released": released,
                "skipped": skipped,
            }),
        }
    }
}

#[async_trait]
impl OutputSink for JsonLinesSink {
    async fn deliver(&mut self, event: OutputEvent) -> std::io::Result<()> {
        let mut line = Self::encode(&event).to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush().await
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub events: Vec<OutputEvent>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(interaction_id, sequence_index)` of every audio event, in arrival order.
    pub fn released(&self) -> Vec<(u64, u64)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Audio {
                    interaction_id,
                    sequence_index,
                    ..
                } => Some((*interaction_id, *sequence_index)),
                OutputEvent::Completed { .. } => None,
            })
            .collect()
    }

    pub fn completed(&self) -> Vec<u64> {
        self.events
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Completed { interaction_id, .. } => Some(*interaction_id),
                OutputEvent::Audio { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl OutputSink for CollectingSink {
    async fn deliver(&mut self, event: OutputEvent) -> std::io::Result<()> {
        self.events.push(event);
        Ok(())
    }
}
