use super::{ErrorCode, MapReduceError};

/// Extension trait for convenient error conversion
pub trait ErrorExt<T> {
    /// Convert to a configuration error with the given message
    fn to_config_error(self, message: impl Into<String>) -> Result<T, MapReduceError>;

    /// Convert to a decode error with the given message
    fn to_decode_error(self, message: impl Into<String>) -> Result<T, MapReduceError>;

    /// Convert to an encode error with the given message
    fn to_encode_error(self, message: impl Into<String>) -> Result<T, MapReduceError>;

    /// Convert to a compute error raised while reading a data source
    fn to_source_error(self, message: impl Into<String>) -> Result<T, MapReduceError>;
}

impl<T, E> ErrorExt<T> for Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn to_config_error(self, message: impl Into<String>) -> Result<T, MapReduceError> {
        self.map_err(|e| MapReduceError::configuration(message).with_source(e))
    }

    fn to_decode_error(self, message: impl Into<String>) -> Result<T, MapReduceError> {
        self.map_err(|e| MapReduceError::decode(message).with_source(e))
    }

    fn to_encode_error(self, message: impl Into<String>) -> Result<T, MapReduceError> {
        self.map_err(|e| MapReduceError::encode(message).with_source(e))
    }

    fn to_source_error(self, message: impl Into<String>) -> Result<T, MapReduceError> {
        self.map_err(|e| {
            MapReduceError::compute_with_code(ErrorCode::COMPUTE_SOURCE_FAILED, message, None)
                .with_source(e)
        })
    }
}
