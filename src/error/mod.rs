use std::fmt::Display;
use thiserror::Error;

pub mod codes;
pub mod helpers;

pub use codes::{describe_error_code, ErrorCode};
pub use helpers::ErrorExt;

/// The unified error type for brokermr
#[derive(Error, Debug)]
pub enum MapReduceError {
    #[error("[E{code:04}] Configuration error: {message}")]
    Configuration {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Decode error: {message}")]
    Decode {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Encode error: {message}")]
    Encode {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Compute error: {message}")]
    Compute {
        code: u16,
        message: String,
        computation: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Broker error: {message}")]
    Broker {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Coordination error: {message}")]
    Coordination {
        code: u16,
        message: String,
        run_id: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] {message}")]
    Other {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl MapReduceError {
    /// Create a configuration error with default code
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::configuration_with_code(ErrorCode::CONFIG_GENERIC, message)
    }

    /// Create a configuration error with specific code
    pub fn configuration_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Configuration {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a decode error with default code
    pub fn decode(message: impl Into<String>) -> Self {
        Self::decode_with_code(ErrorCode::DECODE_MALFORMED, message)
    }

    /// Create a decode error with specific code
    pub fn decode_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Decode {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create an encode error
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            code: ErrorCode::ENCODE_FAILED,
            message: message.into(),
            source: None,
        }
    }

    /// Create a compute error with default code
    pub fn compute(message: impl Into<String>) -> Self {
        Self::compute_with_code(ErrorCode::COMPUTE_GENERIC, message, None)
    }

    /// Create a compute error with specific code and computation name
    pub fn compute_with_code(
        code: u16,
        message: impl Into<String>,
        computation: Option<String>,
    ) -> Self {
        Self::Compute {
            code,
            message: message.into(),
            computation,
            source: None,
        }
    }

    /// Create a broker error with default code
    pub fn broker(message: impl Into<String>) -> Self {
        Self::broker_with_code(ErrorCode::BROKER_GENERIC, message)
    }

    /// Create a broker error with specific code
    pub fn broker_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Broker {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a coordination error with specific code and run ID
    pub fn coordination_with_code(
        code: u16,
        message: impl Into<String>,
        run_id: Option<String>,
    ) -> Self {
        Self::Coordination {
            code,
            message: message.into(),
            run_id,
            source: None,
        }
    }

    /// Create a generic other error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            code: ErrorCode::OTHER_GENERIC,
            message: message.into(),
            source: None,
        }
    }

    /// Add a source error to this error
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        match &mut self {
            Self::Configuration { source: src, .. }
            | Self::Decode { source: src, .. }
            | Self::Encode { source: src, .. }
            | Self::Compute { source: src, .. }
            | Self::Broker { source: src, .. }
            | Self::Coordination { source: src, .. }
            | Self::Other { source: src, .. } => {
                *src = Some(source.into());
            }
        }
        self
    }

    /// Add context to the error message
    pub fn with_context(mut self, context: impl Display) -> Self {
        match &mut self {
            Self::Configuration { message, .. }
            | Self::Decode { message, .. }
            | Self::Encode { message, .. }
            | Self::Compute { message, .. }
            | Self::Broker { message, .. }
            | Self::Coordination { message, .. }
            | Self::Other { message, .. } => {
                *message = format!("{}: {}", message, context);
            }
        }
        self
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration { .. } => 2,
            Self::Decode { .. } | Self::Encode { .. } => 3,
            Self::Compute { .. } => 4,
            Self::Broker { .. } => 5,
            Self::Coordination { .. } => 6,
            Self::Other { .. } => 1,
        }
    }

    /// Get the error code
    pub fn code(&self) -> u16 {
        match self {
            Self::Configuration { code, .. }
            | Self::Decode { code, .. }
            | Self::Encode { code, .. }
            | Self::Compute { code, .. }
            | Self::Broker { code, .. }
            | Self::Coordination { code, .. }
            | Self::Other { code, .. } => *code,
        }
    }

    /// Configuration errors are fatal and raised before any dispatch
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Whether the failure may clear up on another delivery of the same message
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker { code, .. } => *code != ErrorCode::BROKER_UNKNOWN_DELIVERY,
            Self::Compute { code, .. } => *code == ErrorCode::COMPUTE_SOURCE_FAILED,
            _ => false,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::Configuration { message, .. } => format!("Configuration problem: {}", message),
            Self::Compute {
                message,
                computation,
                ..
            } => match computation {
                Some(name) => format!("Computation '{}' failed: {}", name, message),
                None => format!("Computation failed: {}", message),
            },
            Self::Coordination {
                message, run_id, ..
            } => match run_id {
                Some(id) => format!("Run {} failed: {}", id, message),
                None => format!("Run failed: {}", message),
            },
            Self::Decode { message, .. }
            | Self::Encode { message, .. }
            | Self::Broker { message, .. }
            | Self::Other { message, .. } => message.clone(),
        }
    }
}

/// Type alias for Results using MapReduceError
pub type MapReduceResult<T> = std::result::Result<T, MapReduceError>;

impl From<std::io::Error> for MapReduceError {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::CONFIG_NOT_FOUND,
            _ => ErrorCode::OTHER_GENERIC,
        };
        if code == ErrorCode::CONFIG_NOT_FOUND {
            MapReduceError::configuration_with_code(code, "File not found").with_source(err)
        } else {
            MapReduceError::other("IO operation failed").with_source(err)
        }
    }
}

impl From<toml::de::Error> for MapReduceError {
    fn from(err: toml::de::Error) -> Self {
        MapReduceError::configuration_with_code(
            ErrorCode::CONFIG_INVALID_TOML,
            "Invalid TOML syntax",
        )
        .with_source(err)
    }
}
