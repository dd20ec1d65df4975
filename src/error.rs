use thiserror::Error;

/// Failure reported by a language-model or speech-synthesis backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("request timed out")]
    Timeout,

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("rejected by provider (status {status}): {body}")]
    RejectedByProvider { status: u16, body: String },

    #[error("malformed response payload: {0}")]
    MalformedPayload(String),
}

impl BackendError {
    /// Classify a transport error the way the HTTP backends report it.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::MalformedPayload(err.to_string())
        } else {
            Self::Unreachable(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid turn role: {0:?}")]
    InvalidTurnRole(String),

    #[error("completion failed: {cause}")]
    CompletionFailed { cause: BackendError },

    #[error("synthesis failed for unit {sequence_index}: {cause}")]
    SynthesisFailed {
        sequence_index: u64,
        cause: BackendError,
    },

    #[error("unknown {kind} backend: {name}")]
    UnknownBackend { kind: &'static str, name: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("pipeline channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
