use std::net::SocketAddr;

/// Errors raised while classifying or parsing a wire frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("could not classify frame: {0:?}")]
    MalformedFrame(String),

    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    BadChecksum { expected: String, computed: String },

    #[error("telemetry frame dialect forbids checksum but one was present")]
    UnexpectedChecksum,

    #[error("telemetry frame dialect requires a checksum but none was present")]
    MissingChecksum,

    #[error("unsupported encrypted protocol version {0:?}")]
    UnsupportedEncryptedVersion(String),

    #[error("field {0:?} could not be parsed as an integer")]
    BadFieldValue(String),
}

/// Errors raised by the admin channel client (C5).
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("connection to admin channel at {0} failed: {1}")]
    Connect(SocketAddr, std::io::Error),

    #[error("admin channel connection reset")]
    ConnectionReset,

    #[error("admin channel operation timed out")]
    Timeout,

    #[error("admin channel io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("admin channel response could not be parsed: {0:?}")]
    Protocol(String),
}

/// Errors raised by the MITM relay (C7).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("receive timed out")]
    Timeout,

    #[error("transport closed")]
    TransportClosed,

    #[error("os error: {0}")]
    Os(#[from] std::io::Error),

    #[error("error budget exceeded: {count} errors within the lookback window")]
    ErrorBudgetExceeded { count: usize },

    #[error("fatal: {0}")]
    Fatal(String),
}

/// Errors raised by the config store (C4).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path:?}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config at {path:?}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Errors raised by the command synthesizer (C8).
#[derive(Debug, thiserror::Error)]
pub enum SynthesizerError {
    #[error("new setpoint values requested but current_max_online/current_max_offline are not both defined")]
    UndefinedSetpoints,

    #[error("no prior status frame observed; nothing to synthesize against")]
    NoStatusFrame,
}

/// Top-level error composing every component boundary, used at the binary's edge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Admin(#[from] AdminError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Synthesizer(#[from] SynthesizerError),
    #[error("supervisor exhausted its restart budget after {0} attempts")]
    SupervisorExhausted(u32),
}
