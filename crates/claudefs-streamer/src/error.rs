//! Error types for the streamer subsystem.

use thiserror::Error;

/// Result type alias for streamer operations.
pub type StreamerResult<T> = Result<T, StreamerError>;

/// Error variants for streamer operations.
///
/// Per-request failures (a read that could not get a buffer, a device error)
/// are never reported through this type; they only show up as the terminal
/// status of the affected request.
#[derive(Debug, Error)]
pub enum StreamerError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An alignment value is not a power of two.
    #[error("Invalid {name}: {value} is not a power of two")]
    InvalidAlignment {
        /// Which alignment was rejected.
        name: &'static str,
        /// The rejected value.
        value: u64,
    },

    /// The processing stack reported outstanding work when the scheduler was built.
    #[error("Processing stack is not idle")]
    StackNotIdle,

    /// A request was submitted while the scheduler thread is not running.
    #[error("Scheduler is not running")]
    NotRunning,

    /// The scheduler thread could not be spawned.
    #[error("Failed to spawn scheduler thread: {0}")]
    ThreadSpawn(std::io::Error),

    /// Creating a child request would exceed the maximum chain depth.
    #[error("Request chain too deep: depth {depth} exceeds the maximum")]
    ChainTooDeep {
        /// The depth the new request would have had.
        depth: usize,
    },

    /// The command data of a request is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streamer_result_alias() {
        let ok: StreamerResult<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: StreamerResult<i32> = Err(StreamerError::NotRunning);
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StreamerError = std_err.into();
        assert!(matches!(err, StreamerError::Io(_)));
        assert!(format!("{}", err).contains("file not found"));
    }

    #[test]
    fn test_invalid_alignment() {
        let err = StreamerError::InvalidAlignment {
            name: "size alignment",
            value: 3000,
        };
        assert_eq!(
            format!("{}", err),
            "Invalid size alignment: 3000 is not a power of two"
        );
    }

    #[test]
    fn test_chain_too_deep() {
        let err = StreamerError::ChainTooDeep { depth: 9 };
        assert!(format!("{}", err).contains('9'));
    }

    #[test]
    fn test_not_running() {
        assert_eq!(
            format!("{}", StreamerError::NotRunning),
            "Scheduler is not running"
        );
    }
}
