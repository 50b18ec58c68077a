use thiserror::Error;

#[derive(Error, Debug)]
pub enum PumpError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Receive failed: {0}")]
    Receive(#[from] SourceError),

    #[error("Handler failed: {0}")]
    Handler(#[from] HandlerError),
}

/// The stage of a pump run that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStage {
    Configuration,
    Receive,
    Handler,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to connect or communicate with the source: {source}")]
    Connection {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("A transient error occurred, the operation can be retried: {source}")]
    Transient {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Unrecoverable error from the source: {0}")]
    Unrecoverable(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Source {source_id} is closed")]
    Closed { source_id: String },
}

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Handler panicked: {message}")]
    Panicked { message: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {location}: {error}")]
    LoadFailed {
        location: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, PumpError>;

impl HandlerError {
    /// Wraps a plain message, e.g. `HandlerError::msg("boom")`.
    pub fn msg(message: impl Into<String>) -> Self {
        let message: String = message.into();
        HandlerError::Failed(message.into())
    }
}

impl SourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        let message: String = message.into();
        SourceError::Transient {
            source: message.into(),
        }
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        let message: String = message.into();
        SourceError::Unrecoverable(message.into())
    }
}

impl PumpError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        PumpError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        PumpError::InvalidState {
            message: message.into(),
        }
    }

    pub fn stage(&self) -> ErrorStage {
        match self {
            PumpError::InvalidArgument { .. } | PumpError::InvalidState { .. } => {
                ErrorStage::Configuration
            }
            PumpError::Receive(_) => ErrorStage::Receive,
            PumpError::Handler(_) => ErrorStage::Handler,
        }
    }

    /// Hint for owners deciding whether to build a fresh pump and resume.
    /// The pump never acts on this itself.
    pub fn is_retryable(&self) -> bool {
        match self {
            PumpError::Receive(SourceError::Transient { .. }) => true,
            PumpError::Receive(SourceError::Connection { .. }) => true,
            PumpError::Receive(_) => false,
            PumpError::Handler(_) => false,
            PumpError::InvalidArgument { .. } | PumpError::InvalidState { .. } => false,
        }
    }
}
