//! Invocation Dispatcher
//!
//! Turns one logical cache operation into exactly one outbound invocation,
//! addressed to the partition owner when the operation has a key. Single
//! attempt: retries belong to the invocation service underneath.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

use crate::cluster::{
    Address, Invocation, InvocationFuture, InvocationService, InvocationTarget,
};
use crate::protocol::CacheRequest;
use crate::serialization::Data;

/// An invocation that has been sent and not yet completed.
#[derive(Debug, Clone)]
pub struct PendingInvocation {
    pub request_id: u64,
    pub operation: &'static str,
    pub target: InvocationTarget,
    pub started: Instant,
}

struct DispatcherInner {
    invocation: Arc<dyn InvocationService>,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingInvocation>>,
}

/// Removes the pending entry when the invocation future completes or is dropped.
struct PendingGuard {
    inner: Arc<DispatcherInner>,
    request_id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.request_id);
    }
}

/// Maps cache requests onto invocations. Cheap to clone.
#[derive(Clone)]
pub struct InvocationDispatcher {
    inner: Arc<DispatcherInner>,
}

impl InvocationDispatcher {
    pub fn new(invocation: Arc<dyn InvocationService>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                invocation,
                next_request_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Sends a request to the owner of `routing_key`'s partition, or to any
    /// member when the request is cluster-wide (`None`).
    pub fn invoke(&self, request: CacheRequest, routing_key: Option<Data>) -> InvocationFuture {
        match routing_key {
            Some(key) => self.dispatch(request, InvocationTarget::Key(key), true),
            None => self.dispatch(request, InvocationTarget::Any, false),
        }
    }

    pub fn invoke_on_partition(&self, request: CacheRequest, partition_id: u32) -> InvocationFuture {
        self.dispatch(request, InvocationTarget::Partition(partition_id), true)
    }

    pub fn invoke_on_member(&self, request: CacheRequest, address: Address) -> InvocationFuture {
        self.dispatch(request, InvocationTarget::Member(address), false)
    }

    /// Number of invocations sent and not yet completed.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn pending(&self) -> Vec<PendingInvocation> {
        self.inner.pending.lock().values().cloned().collect()
    }

    fn dispatch(
        &self,
        request: CacheRequest,
        target: InvocationTarget,
        smart_routing: bool,
    ) -> InvocationFuture {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let operation = request.kind();

        debug!(
            request_id,
            operation,
            cache = %request.cache_name,
            target = ?target,
            "dispatching invocation"
        );

        self.inner.pending.lock().insert(
            request_id,
            PendingInvocation {
                request_id,
                operation,
                target: target.clone(),
                started: Instant::now(),
            },
        );
        let guard = PendingGuard {
            inner: self.inner.clone(),
            request_id,
        };

        let future = self.inner.invocation.invoke(Invocation {
            request_id,
            request,
            target,
            smart_routing,
        });

        async move {
            let _guard = guard;
            let result = future.await;
            if let Err(err) = &result {
                debug!(request_id, operation, error = %err, "invocation failed");
            }
            result
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::protocol::{CacheOperation, CacheResponse};
    use futures::channel::oneshot;

    /// Records invocations and completes them when told to.
    #[derive(Default)]
    struct ManualInvocations {
        sent: Mutex<Vec<Invocation>>,
        replies: Mutex<Vec<oneshot::Sender<Result<CacheResponse, RemoteError>>>>,
    }

    impl InvocationService for ManualInvocations {
        fn invoke(&self, invocation: Invocation) -> InvocationFuture {
            let (tx, rx) = oneshot::channel();
            self.sent.lock().push(invocation);
            self.replies.lock().push(tx);
            async move {
                rx.await
                    .unwrap_or_else(|_| Err(RemoteError::Transport("dropped".to_string())))
            }
            .boxed()
        }
    }

    fn request(operation: CacheOperation) -> CacheRequest {
        CacheRequest::new("users", operation)
    }

    #[tokio::test]
    async fn test_keyed_request_routes_to_key_owner() {
        let service = Arc::new(ManualInvocations::default());
        let dispatcher = InvocationDispatcher::new(service.clone());
        let key = Data::from_bytes(&b"\"k\""[..]);

        let future = dispatcher.invoke(
            request(CacheOperation::ContainsKey { key: key.clone() }),
            Some(key.clone()),
        );

        {
            let sent = service.sent.lock();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].target, InvocationTarget::Key(key));
            assert!(sent[0].smart_routing);
        }
        assert_eq!(dispatcher.pending_count(), 1);

        let reply = service.replies.lock().pop().unwrap();
        reply.send(Ok(CacheResponse::Bool(true))).unwrap();
        assert_eq!(future.await, Ok(CacheResponse::Bool(true)));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cluster_wide_request_has_no_key_hint() {
        let service = Arc::new(ManualInvocations::default());
        let dispatcher = InvocationDispatcher::new(service.clone());

        let _future = dispatcher.invoke(request(CacheOperation::Clear), None);

        let sent = service.sent.lock();
        assert_eq!(sent[0].target, InvocationTarget::Any);
        assert!(!sent[0].smart_routing);
    }

    #[tokio::test]
    async fn test_request_ids_increase() {
        let service = Arc::new(ManualInvocations::default());
        let dispatcher = InvocationDispatcher::new(service.clone());

        let _a = dispatcher.invoke(request(CacheOperation::Size), None);
        let _b = dispatcher.invoke(request(CacheOperation::Size), None);

        let sent = service.sent.lock();
        assert!(sent[1].request_id > sent[0].request_id);
    }

    #[tokio::test]
    async fn test_failure_completes_future_and_clears_pending() {
        let service = Arc::new(ManualInvocations::default());
        let dispatcher = InvocationDispatcher::new(service.clone());

        let future = dispatcher.invoke(request(CacheOperation::Size), None);
        let reply = service.replies.lock().pop().unwrap();
        reply
            .send(Err(RemoteError::Transport("reset".to_string())))
            .unwrap();

        assert!(matches!(future.await, Err(RemoteError::Transport(_))));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn test_dropped_future_is_not_left_pending() {
        let service = Arc::new(ManualInvocations::default());
        let dispatcher = InvocationDispatcher::new(service);

        let future = dispatcher.invoke(request(CacheOperation::Size), None);
        assert_eq!(dispatcher.pending_count(), 1);
        drop(future);
        assert_eq!(dispatcher.pending_count(), 0);
    }
}
