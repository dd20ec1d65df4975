//! Reorder buffer: releases synthesized audio strictly in index order.
//!
//! Idle → Awaiting (units still being dispatched) → Draining (unit count
//! known, flushing what is left) → Idle.
//!
//! Results ahead of `next_expected` wait in `pending`. A failed or empty
//! unit becomes a skipped slot, stepped over when `next_expected` reaches
//! it, so one bad unit costs at most its own latency. Late or duplicate
//! arrivals are dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::{SynthesisEvent, SynthesisResult};
use crate::history::{now_timestamp, HistorySender, InteractionRecord};
use crate::sink::OutputEvent;

/// Highest abandoned interaction id, shared between the dispatcher (writer)
/// and the reorder task (reader). Interaction ids start at 1.
#[derive(Debug, Clone, Default)]
pub struct InteractionGate {
    abandoned: Arc<AtomicU64>,
}

impl InteractionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abandon(&self, interaction_id: u64) {
        self.abandoned.fetch_max(interaction_id, Ordering::SeqCst);
    }

    pub fn is_abandoned(&self, interaction_id: u64) -> bool {
        interaction_id <= self.abandoned.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Idle,
    Awaiting { interaction_id: u64 },
    Draining { interaction_id: u64, total: u64 },
}

#[derive(Debug)]
enum Slot {
    Ready(SynthesisResult),
    Skipped,
}

#[derive(Debug)]
pub struct ReorderBuffer {
    state: BufferState,
    next_expected: u64,
    pending: BTreeMap<u64, Slot>,
    released: u64,
    skipped: u64,
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self {
            state: BufferState::Idle,
            next_expected: 0,
            pending: BTreeMap::new(),
            released: 0,
            skipped: 0,
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn released(&self) -> u64 {
        self.released
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn current_interaction(&self) -> Option<u64> {
        match self.state {
            BufferState::Idle => None,
            BufferState::Awaiting { interaction_id } | BufferState::Draining { interaction_id, .. } => {
                Some(interaction_id)
            }
        }
    }

    /// Start tracking a new interaction. Whatever the previous one left
    /// behind is dropped.
    pub fn begin(&mut self, interaction_id: u64) {
        if !self.pending.is_empty() {
            warn!(
                "Dropping {} buffered results of superseded interaction {:?}",
                self.pending.len(),
                self.current_interaction()
            );
        }
        self.clear();
        self.state = BufferState::Awaiting { interaction_id };
    }

    /// Return to idle without releasing anything still buffered.
    pub fn reset(&mut self) {
        self.clear();
        self.state = BufferState::Idle;
    }

    pub fn on_result(&mut self, result: SynthesisResult) -> Vec<OutputEvent> {
        let index = result.sequence_index;
        if !self.accepts(result.interaction_id, index) {
            return Vec::new();
        }
        self.pending.entry(index).or_insert(Slot::Ready(result));
        self.flush()
    }

    /// Failed unit: skip its slot.
    pub fn on_failure(&mut self, interaction_id: u64, sequence_index: u64) -> Vec<OutputEvent> {
        self.on_skip(interaction_id, sequence_index)
    }

    pub fn on_skip(&mut self, interaction_id: u64, sequence_index: u64) -> Vec<OutputEvent> {
        if !self.accepts(interaction_id, sequence_index) {
            return Vec::new();
        }
        self.pending.entry(sequence_index).or_insert(Slot::Skipped);
        self.flush()
    }

    /// Record the unit count; the interaction completes once every index
    /// below `total` is released or skipped.
    pub fn seal(&mut self, interaction_id: u64, total: u64) -> Vec<OutputEvent> {
        if self.current_interaction() != Some(interaction_id) {
            debug!("Ignoring seal for inactive interaction {interaction_id}");
            return Vec::new();
        }

        let beyond = self.pending.split_off(&total);
        if !beyond.is_empty() {
            warn!(
                "Interaction {interaction_id}: dropping {} results past final index {total}",
                beyond.len()
            );
        }
        self.state = BufferState::Draining {
            interaction_id,
            total,
        };
        self.flush()
    }

    pub fn apply(&mut self, event: SynthesisEvent) -> Vec<OutputEvent> {
        match event {
            SynthesisEvent::Started { interaction_id, .. } => {
                self.begin(interaction_id);
                Vec::new()
            }
            SynthesisEvent::Ready(result) => self.on_result(result),
            SynthesisEvent::Failed {
                interaction_id,
                sequence_index,
                ..
            } => self.on_failure(interaction_id, sequence_index),
            SynthesisEvent::Skipped {
                interaction_id,
                sequence_index,
            } => self.on_skip(interaction_id, sequence_index),
            SynthesisEvent::Sealed {
                interaction_id,
                total,
            } => self.seal(interaction_id, total),
            SynthesisEvent::Abandoned { interaction_id } => {
                if self.current_interaction() == Some(interaction_id) {
                    self.reset();
                }
                Vec::new()
            }
        }
    }

    fn accepts(&self, interaction_id: u64, index: u64) -> bool {
        if self.current_interaction() != Some(interaction_id) {
            debug!("Discarding unit {index} of inactive interaction {interaction_id}");
            return false;
        }
        if index < self.next_expected {
            debug!("Discarding late unit {index} (next expected {})", self.next_expected);
            return false;
        }
        if let BufferState::Draining { total, .. } = self.state {
            if index >= total {
                warn!("Discarding unit {index} past final index {total}");
                return false;
            }
        }
        true
    }

    fn flush(&mut self) -> Vec<OutputEvent> {
        let mut out = Vec::new();

        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.next_expected {
                break;
            }
            match entry.remove() {
                Slot::Ready(result) => {
                    self.released += 1;
                    out.push(OutputEvent::Audio {
                        sequence_index: result.sequence_index,
                        interaction_id: result.interaction_id,
                        audio: result.audio,
                        source_text: result.source_text,
                    });
                }
                Slot::Skipped => {
                    self.skipped += 1;
                    debug!("Skipping unit {}", self.next_expected);
                }
            }
            self.next_expected += 1;
        }

        if let BufferState::Draining {
            interaction_id,
            total,
        } = self.state
        {
            if self.next_expected >= total {
                debug_assert!(self.pending.is_empty());
                out.push(OutputEvent::Completed {
                    interaction_id,
                    released: self.released,
                    skipped: self.skipped,
                });
                self.reset();
            }
        }

        out
    }

    fn clear(&mut self) {
        self.next_expected = 0;
        self.pending.clear();
        self.released = 0;
        self.skipped = 0;
    }
}

/// Timing for the interaction currently in the buffer.
struct InFlight {
    interaction_id: u64,
    started: Instant,
    llm_latency_ms: u64,
}

/// Owns the buffer; all state updates happen on this one task.
pub struct ReorderTask {
    buffer: ReorderBuffer,
    gate: InteractionGate,
    history: Option<HistorySender>,
    call_id: String,
    in_flight: Option<InFlight>,
}

impl ReorderTask {
    pub fn new(gate: InteractionGate, history: Option<HistorySender>, call_id: impl Into<String>) -> Self {
        Self {
            buffer: ReorderBuffer::new(),
            gate,
            history,
            call_id: call_id.into(),
            in_flight: None,
        }
    }

    pub fn spawn(
        self,
        events: mpsc::Receiver<SynthesisEvent>,
        output: mpsc::Sender<OutputEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(events, output))
    }

    async fn run(mut self, mut events: mpsc::Receiver<SynthesisEvent>, output: mpsc::Sender<OutputEvent>) {
        while let Some(event) = events.recv().await {
            let interaction_id = event.interaction_id();
            match &event {
                SynthesisEvent::Started { llm_latency_ms, .. } => {
                    self.in_flight = Some(InFlight {
                        interaction_id,
                        started: Instant::now(),
                        llm_latency_ms: *llm_latency_ms,
                    });
                }
                SynthesisEvent::Abandoned { .. } => self.record_abandoned(interaction_id),
                _ => {}
            }

            for out in self.buffer.apply(event) {
                // Barge-in may land while we wait on a slow sink.
                if self.gate.is_abandoned(out.interaction_id()) {
                    continue;
                }
                if let OutputEvent::Completed {
                    interaction_id,
                    released,
                    skipped,
                } = out
                {
                    self.record_completed(interaction_id, released, skipped);
                }
                if output.send(out).await.is_err() {
                    warn!("Output sink closed, stopping reorder task");
                    return;
                }
            }
        }
        debug!("Synthesis event channel closed, reorder task done");
    }

    fn record_completed(&mut self, interaction_id: u64, released: u64, skipped: u64) {
        info!("Interaction {interaction_id} drained: {released} released, {skipped} skipped");
        self.record(interaction_id, released, skipped, false);
    }

    fn record_abandoned(&mut self, interaction_id: u64) {
        let (released, skipped) = if self.buffer.current_interaction() == Some(interaction_id) {
            (self.buffer.released(), self.buffer.skipped())
        } else {
            (0, 0)
        };
        self.record(interaction_id, released, skipped, true);
    }

    fn record(&mut self, interaction_id: u64, released: u64, skipped: u64, interrupted: bool) {
        match &self.in_flight {
            Some(f) if f.interaction_id == interaction_id => {}
            _ => return,
        }
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        let Some(history) = &self.history else {
            return;
        };

        history.interaction(InteractionRecord {
            timestamp: now_timestamp(),
            call_id: self.call_id.clone(),
            interaction_id,
            released,
            skipped,
            llm_latency_ms: in_flight.llm_latency_ms,
            total_latency_ms: in_flight.started.elapsed().as_millis() as u64 + in_flight.llm_latency_ms,
            interrupted,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(interaction_id: u64, index: u64) -> SynthesisResult {
        SynthesisResult {
            sequence_index: index,
            audio: vec![index as u8],
            source_text: format!("unit {index}"),
            interaction_id,
        }
    }

    fn released_indices(events: &[OutputEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Audio { sequence_index, .. } => Some(*sequence_index),
                OutputEvent::Completed { .. } => None,
            })
            .collect()
    }

    #[test]
    fn every_permutation_releases_in_order() {
        // All 120 orderings of five results.
        fn permutations(items: Vec<u64>) -> Vec<Vec<u64>> {
            if items.len() <= 1 {
                return vec![items];
            }
            let mut all = Vec::new();
            for i in 0..items.len() {
                let mut rest = items.clone();
                let head = rest.remove(i);
                for mut tail in permutations(rest) {
                    tail.insert(0, head);
                    all.push(tail);
                }
            }
            all
        }

        for order in permutations((0..5).collect()) {
            let mut buffer = ReorderBuffer::new();
            buffer.begin(1);
            let mut out = Vec::new();
            for &i in &order {
                out.extend(buffer.on_result(result(1, i)));
            }
            out.extend(buffer.seal(1, 5));

            assert_eq!(released_indices(&out), vec![0, 1, 2, 3, 4], "arrival order {order:?}");
            assert!(matches!(out.last(), Some(OutputEvent::Completed { interaction_id: 1, .. })));
            assert_eq!(buffer.state(), BufferState::Idle);
        }
    }

    #[test]
    fn holds_results_until_gap_is_filled() {
        let mut buffer = ReorderBuffer::new();
        buffer.begin(1);

        assert!(buffer.on_result(result(1, 2)).is_empty());
        assert!(buffer.on_result(result(1, 1)).is_empty());
        assert_eq!(buffer.pending_len(), 2);

        let out = buffer.on_result(result(1, 0));
        assert_eq!(released_indices(&out), vec![0, 1, 2]);
        assert_eq!(buffer.next_expected(), 3);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn duplicates_are_never_released_twice() {
        let mut buffer = ReorderBuffer::new();
        buffer.begin(1);

        assert_eq!(released_indices(&buffer.on_result(result(1, 0))), vec![0]);
        assert!(buffer.on_result(result(1, 0)).is_empty());

        assert!(buffer.on_result(result(1, 2)).is_empty());
        assert!(buffer.on_result(result(1, 2)).is_empty());
        assert_eq!(buffer.pending_len(), 1);

        assert_eq!(released_indices(&buffer.on_result(result(1, 1))), vec![1, 2]);
    }

    #[test]
    fn failed_unit_is_skipped() {
        let mut buffer = ReorderBuffer::new();
        buffer.begin(1);
        let mut out = Vec::new();

        out.extend(buffer.on_result(result(1, 3)));
        out.extend(buffer.on_result(result(1, 0)));
        out.extend(buffer.on_result(result(1, 2)));
        out.extend(buffer.seal(1, 4));
        assert_eq!(released_indices(&out), vec![0]);
        assert_eq!(buffer.state(), BufferState::Draining { interaction_id: 1, total: 4 });

        out.extend(buffer.on_failure(1, 1));
        assert_eq!(released_indices(&out), vec![0, 2, 3]);
        assert_eq!(
            out.last(),
            Some(&OutputEvent::Completed {
                interaction_id: 1,
                released: 3,
                skipped: 1
            })
        );
        assert_eq!(buffer.state(), BufferState::Idle);
    }

    #[test]
    fn failure_reported_after_release_is_ignored() {
        let mut buffer = ReorderBuffer::new();
        buffer.begin(1);
        buffer.on_result(result(1, 0));
        assert!(buffer.on_failure(1, 0).is_empty());
        assert_eq!(buffer.skipped(), 0);
    }

    #[test]
    fn results_of_other_interactions_are_dropped() {
        let mut buffer = ReorderBuffer::new();
        buffer.begin(2);
        assert!(buffer.on_result(result(1, 0)).is_empty());
        assert_eq!(buffer.next_expected(), 0);
        assert_eq!(released_indices(&buffer.on_result(result(2, 0))), vec![0]);
    }

    #[test]
    fn idle_buffer_releases_nothing() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.on_result(result(1, 0)).is_empty());
        assert_eq!(buffer.state(), BufferState::Idle);
    }

    #[test]
    fn empty_interaction_completes_on_seal() {
        let mut buffer = ReorderBuffer::new();
        buffer.begin(4);
        let out = buffer.seal(4, 0);
        assert_eq!(
            out,
            vec![OutputEvent::Completed {
                interaction_id: 4,
                released: 0,
                skipped: 0
            }]
        );
    }

    #[test]
    fn reset_discards_pending() {
        let mut buffer = ReorderBuffer::new();
        buffer.begin(1);
        buffer.on_result(result(1, 1));
        buffer.apply(SynthesisEvent::Abandoned { interaction_id: 1 });

        assert_eq!(buffer.state(), BufferState::Idle);
        assert_eq!(buffer.pending_len(), 0);
        assert!(buffer.on_result(result(1, 0)).is_empty());
    }

    #[test]
    fn gate_tracks_highest_abandoned_id() {
        let gate = InteractionGate::new();
        assert!(!gate.is_abandoned(1));
        gate.abandon(3);
        gate.abandon(2);
        assert!(gate.is_abandoned(3));
        assert!(gate.is_abandoned(1));
        assert!(!gate.is_abandoned(4));
    }
}
