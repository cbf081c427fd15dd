//! One-shot response delivery shared by the client and provider sides.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use cr_common::InvocationResponse;
use crate::error::RpcError;
use crate::Result;

/// Completion handle for exactly one response
#[derive(Debug)]
pub struct Callback {
    tx: oneshot::Sender<InvocationResponse>,
}

impl Callback {
    /// Create a callback and the future that observes it
    pub fn new() -> (Self, ResponseFuture) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, ResponseFuture { rx })
    }

    /// Deliver the response. Returns `false` if nobody is waiting any more.
    pub fn complete(self, response: InvocationResponse) -> bool {
        self.tx.send(response).is_ok()
    }

    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Resolves with the response delivered to the paired [`Callback`].
///
/// Fails with [`RpcError::Canceled`] if the callback was dropped unanswered.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<InvocationResponse>,
}

impl Future for ResponseFuture {
    type Output = Result<InvocationResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| RpcError::Canceled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cr_common::InvocationRequest;

    #[tokio::test]
    async fn test_complete_resolves_future() {
        let (callback, future) = Callback::new();
        let request = InvocationRequest::heartbeat(3);
        assert!(callback.complete(InvocationResponse::success(&request, serde_json::json!("pong"))));

        let response = future.await.unwrap();
        assert_eq!(response.seq, 3);
        assert!(response.is_success());
    }

    #[test]
    fn test_future_pending_until_completed() {
        let (callback, future) = Callback::new();
        let mut future = tokio_test::task::spawn(future);
        tokio_test::assert_pending!(future.poll());
        assert!(!callback.is_abandoned());

        callback.complete(InvocationResponse::success(&InvocationRequest::heartbeat(4), serde_json::Value::Null));
        assert!(future.is_woken());
        let response = tokio_test::assert_ready_ok!(future.poll());
        assert_eq!(response.seq, 4);
    }

    #[test]
    fn test_abandoned_when_future_dropped() {
        let (callback, future) = Callback::new();
        drop(future);
        assert!(callback.is_abandoned());
        assert!(!callback.complete(InvocationResponse::success(
            &InvocationRequest::heartbeat(5),
            serde_json::Value::Null
        )));
    }

    #[tokio::test]
    async fn test_dropped_callback_cancels() {
        let (callback, future) = Callback::new();
        drop(callback);
        assert!(matches!(future.await, Err(RpcError::Canceled)));
    }
}
