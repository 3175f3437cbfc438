use std::{
    fmt::{self, Debug},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use http::StatusCode;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::{
    error::DispatchError,
    operation::Operation,
    response::{OperationRecord, OperationResponse, SubStatusCode},
    retry::RetryInput,
};

pub type OperationResult = Result<OperationResponse, DispatchError>;

pub(crate) type OperationReplySender = oneshot::Sender<OperationResult>;

/// Handle to the result of a submitted operation.
///
/// Resolves exactly once, with the operation's result or with
/// [`DispatchError::Cancelled`] after [`OperationHandle::cancel`].
pub struct OperationHandle {
    rx: oneshot::Receiver<OperationResult>,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

/// An operation waiting in a streamer queue or in flight in a batch.
///
/// Owns the reply channel: completing the operation consumes it.
pub(crate) struct QueuedOperation {
    pub operation: Operation,
    pub retry: RetryState,
    reply: OperationReplySender,
    cancel: CancellationToken,
}

/// Retry counters carried by an operation across re-submissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RetryState {
    pub throttle_attempts: u32,
    pub waited: Duration,
    pub reroutes: u32,
}

impl OperationHandle {
    /// Cancel the operation.
    ///
    /// Operations still queued are dropped before dispatch. Once the batch is
    /// in flight the request is not aborted, but its result is discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels the operation when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Future for OperationHandle {
    type Output = OperationResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Poll::Ready(result) = Pin::new(&mut this.rx).poll(cx) {
            return Poll::Ready(result.unwrap_or_else(|_| {
                Err(DispatchError::Internal {
                    message: "reply channel closed".to_string(),
                })
            }));
        }

        if this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(DispatchError::Cancelled));
        }

        Poll::Pending
    }
}

impl Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl QueuedOperation {
    pub fn new(operation: Operation) -> (Self, OperationHandle) {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let handle = OperationHandle {
            rx,
            cancelled: Box::pin(cancel.clone().cancelled_owned()),
            cancel: cancel.clone(),
        };

        let queued = Self {
            operation,
            retry: RetryState::default(),
            reply: tx,
            cancel,
        };

        (queued, handle)
    }

    /// Whether nobody is waiting for the result anymore.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.reply.is_closed()
    }

    /// Total number of retries and re-routes so far.
    pub fn retries(&self) -> u32 {
        self.retry.throttle_attempts + self.retry.reroutes
    }

    pub fn retry_input(
        &self,
        status: StatusCode,
        sub_status: Option<SubStatusCode>,
        retry_after: Option<Duration>,
    ) -> RetryInput {
        RetryInput {
            status,
            sub_status,
            retry_after,
            attempt_count: self.retry.throttle_attempts,
            waited: self.retry.waited,
            reroute_count: self.retry.reroutes,
        }
    }

    pub fn complete(self, result: OperationResult) {
        // The receiver may be gone if the caller cancelled or dropped the handle.
        let _ = self.reply.send(result);
    }

    pub fn succeed(self, record: OperationRecord) {
        let retries = self.retries();
        self.complete(Ok(OperationResponse::from_record(record, retries)));
    }

    pub fn fail(self, error: DispatchError) {
        self.complete(Err(error));
    }
}

impl AsRef<Operation> for QueuedOperation {
    fn as_ref(&self) -> &Operation {
        &self.operation
    }
}

impl Debug for QueuedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("operation", &self.operation)
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_receives_result() {
        let (queued, handle) = QueuedOperation::new(Operation::read("pk", "a"));
        queued.succeed(OperationRecord::new(0, StatusCode::OK).with_etag("e1"));

        let response = handle.await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.etag.as_deref(), Some("e1"));
        assert_eq!(response.retries, 0);
    }

    #[tokio::test]
    async fn test_cancel_resolves_handle() {
        let (queued, handle) = QueuedOperation::new(Operation::read("pk", "a"));
        handle.cancel();
        assert!(queued.is_cancelled());

        let result = handle.await;
        assert!(matches!(result, Err(DispatchError::Cancelled)));

        // Completing afterwards is harmless.
        queued.fail(DispatchError::Cancelled);
    }

    #[tokio::test]
    async fn test_dropped_handle_marks_cancelled() {
        let (queued, handle) = QueuedOperation::new(Operation::read("pk", "a"));
        drop(handle);
        assert!(queued.is_cancelled());
    }
}
