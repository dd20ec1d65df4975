//! call-speaker: ordered streaming speech for real-time phone conversations.
//!
//! A language model produces a reply, the reply is cut into sentence-sized
//! units, every unit is synthesized concurrently, and the audio is released
//! to the call leg strictly in the order the text was generated.
//!
//! Modules, leaves first:
//! - `conversation`: append-only turn log
//! - `backend`: LLM and TTS capability traits + name-keyed registry
//! - `completion`: LLM call and reply slicing
//! - `dispatcher`: bounded concurrent synthesis
//! - `reorder`: in-order release with skip policy
//! - `sink`: ordered output stream consumers
//! - `summary`: best-effort post-call digest
//! - `session`: per-call wiring and barge-in
//! - `history`: JSONL call records and reports

pub mod backend;
pub mod completion;
pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod reorder;
pub mod session;
pub mod sink;
pub mod summary;

pub use backend::{BackendRegistry, LanguageModelBackend, SpeechSynthesisBackend};
pub use completion::{CompletionEngine, PartialResponseUnit, ResponseUnits};
pub use config::Config;
pub use conversation::{ConversationContext, Role, Turn};
pub use dispatcher::{SynthesisDispatcher, SynthesisEvent, SynthesisResult};
pub use error::{BackendError, PipelineError};
pub use reorder::{BufferState, ReorderBuffer};
pub use session::{CallSession, SessionState};
pub use sink::{run_sink, CollectingSink, JsonLinesSink, OutputEvent, OutputSink, OutputStream};
pub use summary::{CallSummary, Sentiment, Summary};
