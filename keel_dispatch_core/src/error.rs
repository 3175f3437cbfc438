use std::sync::Arc;

use http::StatusCode;
use snafu::Snafu;

use crate::{
    response::SubStatusCode,
    routing::{RangeId, RoutingError},
    transport::TransportError,
};

/// Dispatch error types.
///
/// Every error reaches the caller through the operation's own result handle,
/// or synchronously from `submit` for the errors raised before queuing.
/// Errors are `Clone` because a batch-level failure fans out to all the
/// operations in the batch.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum DispatchError {
    /// The operation payload could not be serialized.
    #[snafu(display("materialization error: {message}"))]
    Materialization {
        message: String,
        #[snafu(source(from(serde_json::Error, Arc::new)))]
        source: Arc<serde_json::Error>,
    },
    /// The operation is malformed.
    #[snafu(display("validation error: {message}"))]
    Validation { message: String },
    /// The request options cannot be expressed by a batched request.
    #[snafu(display("configuration error: {message}"))]
    Configuration { message: String },
    /// The server kept throttling the operation until the retry budget ran out.
    #[snafu(display(
        "throttled after {attempts} attempts (status {status}, sub-status {sub_status:?})"
    ))]
    Throttled {
        status: StatusCode,
        sub_status: Option<SubStatusCode>,
        attempts: u32,
    },
    /// The partition range kept being reported as stale after re-routing.
    #[snafu(display("partition range {range_id} is stale after {reroutes} re-routes"))]
    StaleRange { range_id: RangeId, reroutes: u32 },
    /// The range resolution collaborator failed.
    #[snafu(display("routing error: {message}"))]
    Routing {
        message: &'static str,
        source: RoutingError,
    },
    /// The batch carrying the operation never got a response.
    #[snafu(display("transport error on range {range_id}"))]
    Transport {
        range_id: RangeId,
        source: TransportError,
    },
    /// The server rejected the operation with a non-retryable status.
    #[snafu(display("operation rejected with status {status} (sub-status {sub_status:?})"))]
    Rejected {
        status: StatusCode,
        sub_status: Option<SubStatusCode>,
        request_charge: f64,
    },
    /// The server rejected the whole batch without per-operation results.
    #[snafu(display("batch rejected with status {status} (sub-status {sub_status:?})"))]
    BatchRejected {
        status: StatusCode,
        sub_status: Option<SubStatusCode>,
    },
    /// The caller cancelled the operation.
    #[snafu(display("operation cancelled"))]
    Cancelled,
    /// The executor was closed before the operation completed.
    #[snafu(display("executor closed"))]
    ExecutorClosed,
    /// Internal error.
    #[snafu(display("internal error: {message}"))]
    Internal { message: String },
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

/// Categories of errors for classification and handling.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed operation, needs a caller fix
    Validation,

    /// Options incompatible with batching, needs a caller fix
    Configuration,

    /// Retryable condition that outlived the retry policy
    RetryExhausted,

    /// Range resolution failed
    Routing,

    /// No response from the server
    Transport,

    /// The server refused the operation
    Rejected,

    /// Cancelled by the caller or by shutdown
    Cancelled,

    /// Bugs, system errors
    Internal,
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Materialization { .. } | Self::Validation { .. } => ErrorKind::Validation,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Throttled { .. } | Self::StaleRange { .. } => ErrorKind::RetryExhausted,
            Self::Routing { .. } => ErrorKind::Routing,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Rejected { .. } | Self::BatchRejected { .. } => ErrorKind::Rejected,
            Self::Cancelled | Self::ExecutorClosed => ErrorKind::Cancelled,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// The server status associated with the error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Throttled { status, .. }
            | Self::Rejected { status, .. }
            | Self::BatchRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl ErrorKind {
    /// Whether the caller may retry the operation as-is.
    ///
    /// Throttling and stale ranges are already retried by the dispatcher, so
    /// only transport failures are left to the caller.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transport)
    }

    /// Standard exit code for this error category.
    pub fn exit_code(self) -> i32 {
        match self {
            // EX_CONFIG
            Self::Configuration => 78,
            // EX_USAGE
            Self::Validation => 64,
            // EX_TEMPFAIL
            Self::RetryExhausted | Self::Transport => 75,
            // EX_UNAVAILABLE
            Self::Routing => 69,
            // EX_SOFTWARE
            _ => 70,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        let throttled = DispatchError::Throttled {
            status: StatusCode::TOO_MANY_REQUESTS,
            sub_status: None,
            attempts: 9,
        };
        assert_eq!(throttled.kind(), ErrorKind::RetryExhausted);
        assert_eq!(throttled.status(), Some(StatusCode::TOO_MANY_REQUESTS));

        let validation = DispatchError::Validation {
            message: "missing id".to_string(),
        };
        assert_eq!(validation.kind(), ErrorKind::Validation);
        assert!(!validation.kind().is_retryable());

        let transport = DispatchError::Transport {
            range_id: RangeId::from("0"),
            source: TransportError::Unavailable {
                message: "connection reset".to_string(),
            },
        };
        assert!(transport.kind().is_retryable());
        assert_eq!(DispatchError::Cancelled.kind(), ErrorKind::Cancelled);
    }
}
