use keel_dispatch_core::{DispatchError, ErrorKind, RangeId, memory::SplitError};
use keel_observability::ObservabilityError;
use snafu::Snafu;

/// CLI error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StressError {
    #[snafu(display("Failed to initialize observability"))]
    Observability { source: ObservabilityError },
    #[snafu(display("Failed to create executor"))]
    Executor { source: DispatchError },
    #[snafu(display("Failed to submit operation"))]
    Submit { source: DispatchError },
    #[snafu(display("Failed to split range {range_id}"))]
    Split {
        range_id: RangeId,
        source: SplitError,
    },
    #[snafu(display("Stress task failed"))]
    Join { source: tokio::task::JoinError },
    #[snafu(display("{count} operations failed unexpectedly"))]
    UnexpectedFailures { count: u64 },
}

impl StressError {
    /// Process exit code, following the dispatch error category when there is one.
    pub fn exit_code(&self) -> u8 {
        let code = match self {
            Self::Executor { source } | Self::Submit { source } => source.kind().exit_code(),
            Self::Observability { .. } => ErrorKind::Configuration.exit_code(),
            Self::UnexpectedFailures { .. } => ErrorKind::RetryExhausted.exit_code(),
            Self::Split { .. } | Self::Join { .. } => ErrorKind::Internal.exit_code(),
        };
        u8::try_from(code).unwrap_or(1)
    }
}

pub type Result<T, E = StressError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_follows_dispatch_error() {
        let configuration = StressError::Executor {
            source: DispatchError::Configuration {
                message: "max_operation_count must be positive".to_string(),
            },
        };
        assert_eq!(configuration.exit_code(), 78);

        let validation = StressError::Submit {
            source: DispatchError::Validation {
                message: "missing id".to_string(),
            },
        };
        assert_eq!(validation.exit_code(), 64);

        assert_eq!(StressError::UnexpectedFailures { count: 3 }.exit_code(), 75);
    }
}
