//! Error types for the external parsing collaborator.

/// Result type for parser operations.
pub type Result<T> = std::result::Result<T, ParseError>;

/// Error taxonomy for everything that can go wrong while driving the
/// external parser.
///
/// The classes matter more than the variants: the orchestrator routes on
/// [`ParseError::is_transient`] and [`ParseError::is_permanent`].
///
/// - **Input** errors (missing file, unsupported format, oversized file)
///   are rejected synchronously and never enter the retry state machine.
/// - **Transient** errors (network failure, timeouts, rate limiting,
///   damaged downloads) drive the retry/backoff path.
/// - **Permanent** errors (provider-reported unrecoverable failure,
///   malformed document) skip remaining retries and fail immediately.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// Caller-supplied input that can never succeed as given.
    #[error("invalid input: {message}")]
    Input { message: String },

    /// A failure worth retrying: the same call may succeed later.
    #[error("transient parser failure: {message}")]
    Transient { message: String },

    /// The provider reported an unrecoverable failure for this document.
    #[error("permanent parser failure: {message}")]
    Permanent { message: String },

    /// HTTP transport errors, including timeouts. Treated as transient.
    #[error("http error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    /// Local IO while staging content or writing results. Transient.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// The downloaded result archive could not be read. A damaged download
    /// may succeed on re-fetch, so this is transient.
    #[error("malformed result archive: {message}")]
    Archive { message: String },

    /// Blocking extraction task failed to join.
    #[error("async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries. Transient.
    #[error("external error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl ParseError {
    pub fn input<S: Into<String>>(message: S) -> Self {
        Self::Input {
            message: message.into(),
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn archive<S: Into<String>>(message: S) -> Self {
        Self::Archive {
            message: message.into(),
        }
    }

    /// Whether the retry/backoff path applies to this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. }
                | Self::Http { .. }
                | Self::Io { .. }
                | Self::Archive { .. }
                | Self::AsyncTask { .. }
                | Self::External { .. }
        )
    }

    /// Whether remaining retries should be skipped.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }

    /// Whether this was rejected before entering the state machine.
    pub fn is_input(&self) -> bool {
        matches!(self, Self::Input { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_are_disjoint() {
        let input = ParseError::input("missing file");
        assert!(input.is_input());
        assert!(!input.is_transient());
        assert!(!input.is_permanent());

        let transient = ParseError::transient("connection reset");
        assert!(transient.is_transient());
        assert!(!transient.is_permanent());

        let permanent = ParseError::permanent("document is encrypted");
        assert!(permanent.is_permanent());
        assert!(!permanent.is_transient());
    }

    #[test]
    fn io_and_archive_errors_are_transient() {
        let io: ParseError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk").into();
        assert!(io.is_transient());

        assert!(ParseError::archive("truncated zip").is_transient());
    }
}
