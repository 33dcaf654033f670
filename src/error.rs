//! Error types for the hearth pipeline.

/// Top-level error type for the voice-companion pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Stream bus unreachable or a stream operation failed.
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    /// Gateway socket or session error.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Voice activity detection error.
    #[error("VAD error: {0}")]
    Vad(String),

    /// Speech recognition error.
    #[error("ASR error: {0}")]
    Asr(String),

    /// Language model inference error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Conversation store error.
    #[error("state error: {0}")]
    State(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Malformed message on the bus (schema or encoding mismatch).
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, PipelineError>;
