//! Correlation and completion tracking for in-flight requests.
//!
//! Each `send` registers a pending entry and then races two sources:
//! - the transport delivering a reply ([`CompletionTracker::resolve`])
//! - an optional timer that manufactures [`BridgeError::Timeout`]
//!
//! The first source to reach the entry flips its `completed` flag under the
//! entry mutex, cancels the timer, and hands the outcome to the waiter. Anything
//! arriving later is a no-op. Completion is decided by this explicit flag, never
//! by dropping a future: a reply callback may still fire long after the caller
//! stopped waiting.
//!
//! Lock order is always table, then entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::bridge::protocol::RequestId;
use crate::error::BridgeError;

type Outcome<T> = Result<T, BridgeError>;

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Completion tracker mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

struct EntryState<T> {
    completed: bool,
    waiter: Option<oneshot::Sender<Outcome<T>>>,
    timer: Option<AbortHandle>,
}

struct PendingEntry<T> {
    request_id: RequestId,
    state: Mutex<EntryState<T>>,
}

impl<T> PendingEntry<T> {
    /// Decide completion. Returns `true` only for the single winner.
    ///
    /// `None` releases the entry without delivering anything (caller gave up).
    fn complete(&self, outcome: Option<Outcome<T>>) -> bool {
        let mut state = lock(&self.state);
        if state.completed {
            return false;
        }
        state.completed = true;

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if let (Some(waiter), Some(outcome)) = (state.waiter.take(), outcome) {
            // Receiver gone means the caller stopped waiting; nothing to deliver to.
            let _ = waiter.send(outcome);
        }
        true
    }

    fn arm_timer(&self, timer: AbortHandle) {
        let mut state = lock(&self.state);
        if state.completed {
            timer.abort();
        } else {
            state.timer = Some(timer);
        }
    }

    fn is_completed(&self) -> bool {
        lock(&self.state).completed
    }
}

struct TrackerInner<T> {
    route: String,
    pending: Mutex<HashMap<RequestId, Arc<PendingEntry<T>>>>,
}

impl<T> TrackerInner<T> {
    fn settle(&self, entry: &Arc<PendingEntry<T>>, outcome: Option<Outcome<T>>) -> bool {
        let mut pending = lock(&self.pending);
        let won = entry.complete(outcome);
        if won
            && pending
                .get(&entry.request_id)
                .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            pending.remove(&entry.request_id);
        }
        won
    }
}

/// Per-connection table of in-flight requests.
pub struct CompletionTracker<T> {
    inner: Arc<TrackerInner<T>>,
}

impl<T> Clone for CompletionTracker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> CompletionTracker<T> {
    /// `route` names the target in timeout errors, e.g. the service name.
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                route: route.into(),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create the pending entry for `request_id` and arm its timer.
    ///
    /// With `timeout = None` the entry waits for a reply indefinitely.
    pub fn register(
        &self,
        request_id: RequestId,
        timeout: Option<Duration>,
    ) -> Result<PendingReply<T>, BridgeError> {
        let runtime = match timeout {
            Some(_) => Some(tokio::runtime::Handle::try_current().map_err(|_| {
                BridgeError::internal("request timeouts require a tokio runtime")
            })?),
            None => None,
        };

        let (tx, rx) = oneshot::channel();
        let entry = Arc::new(PendingEntry {
            request_id: request_id.clone(),
            state: Mutex::new(EntryState {
                completed: false,
                waiter: Some(tx),
                timer: None,
            }),
        });

        {
            let mut pending = lock(&self.inner.pending);
            if pending.contains_key(&request_id) {
                return Err(BridgeError::DuplicateRequest(request_id));
            }
            pending.insert(request_id.clone(), Arc::clone(&entry));
        }

        if let (Some(after), Some(runtime)) = (timeout, runtime) {
            let tracker = Arc::downgrade(&self.inner);
            let timed_entry = Arc::clone(&entry);
            let timer = runtime.spawn(async move {
                tokio::time::sleep(after).await;
                let Some(tracker) = tracker.upgrade() else {
                    return;
                };
                let err = BridgeError::Timeout {
                    route: tracker.route.clone(),
                    request_id: timed_entry.request_id.clone(),
                    after,
                };
                if tracker.settle(&timed_entry, Some(Err(err))) {
                    tracing::debug!(
                        request_id = %timed_entry.request_id,
                        route = %tracker.route,
                        timeout_ms = after.as_millis() as u64,
                        "Request timed out"
                    );
                }
            });
            entry.arm_timer(timer.abort_handle());
        }

        tracing::trace!(request_id = %request_id, route = %self.inner.route, ?timeout, "Registered request");

        Ok(PendingReply {
            entry,
            receiver: rx,
            tracker: Arc::downgrade(&self.inner),
        })
    }

    /// Report a reply for `request_id`. Returns `false` if the entry was already
    /// decided (timed out, cancelled) or never existed; the outcome is dropped.
    pub fn resolve(&self, request_id: &RequestId, outcome: Outcome<T>) -> bool {
        let entry = lock(&self.inner.pending).get(request_id).cloned();
        match entry {
            Some(entry) => {
                let won = self.inner.settle(&entry, Some(outcome));
                if !won {
                    tracing::trace!(request_id = %request_id, "Ignoring reply for decided request");
                }
                won
            }
            None => {
                tracing::debug!(request_id = %request_id, "Ignoring reply for unknown request");
                false
            }
        }
    }

    /// Fail every pending request, e.g. when the connection is lost.
    pub fn fail_all(&self, err: BridgeError) -> usize {
        let drained: Vec<_> = lock(&self.inner.pending).drain().map(|(_, e)| e).collect();
        let failed = drained
            .iter()
            .filter(|entry| entry.complete(Some(Err(err.clone()))))
            .count();
        if failed > 0 {
            tracing::debug!(failed, error = %err, "Failed pending requests");
        }
        failed
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.inner.pending).len()
    }
}

/// The caller's side of one pending entry.
///
/// Dropping it before completion releases the entry and cancels its timer; the
/// request stays outstanding on the wire and any late reply is ignored.
pub struct PendingReply<T> {
    entry: Arc<PendingEntry<T>>,
    receiver: oneshot::Receiver<Outcome<T>>,
    tracker: Weak<TrackerInner<T>>,
}

impl<T> PendingReply<T> {
    pub fn request_id(&self) -> &RequestId {
        &self.entry.request_id
    }

    /// Wait for the single terminal outcome.
    pub async fn wait(mut self) -> Outcome<T> {
        match (&mut self.receiver).await {
            Ok(outcome) => outcome,
            // Waiter dropped without a decision: the tracker itself went away.
            Err(_) => Err(BridgeError::ConnectionClosed),
        }
    }
}

impl<T> Drop for PendingReply<T> {
    fn drop(&mut self) {
        if self.entry.is_completed() {
            return;
        }
        match self.tracker.upgrade() {
            Some(tracker) => {
                if tracker.settle(&self.entry, None) {
                    tracing::debug!(
                        request_id = %self.entry.request_id,
                        "Stopped waiting for request; remote side not cancelled"
                    );
                }
            }
            None => {
                self.entry.complete(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn reply_wins_before_timeout() {
        let tracker = CompletionTracker::<u32>::new("sandbox");
        let id = RequestId::from("req-1");
        let pending = tracker.register(id.clone(), Some(Duration::from_secs(5))).unwrap();

        assert!(tracker.resolve(&id, Ok(7)));
        assert_eq!(pending.wait().await.unwrap(), 7);
        assert_eq!(tracker.in_flight(), 0);

        // A second reply for the same id is a no-op.
        assert!(!tracker.resolve(&id, Ok(8)));
    }

    #[tokio::test]
    async fn timeout_wins_and_late_reply_is_ignored() {
        let tracker = CompletionTracker::<u32>::new("sandbox");
        let id = RequestId::from("req-2");
        let pending = tracker
            .register(id.clone(), Some(Duration::from_millis(20)))
            .unwrap();

        match pending.wait().await {
            Err(BridgeError::Timeout {
                route, request_id, ..
            }) => {
                assert_eq!(route, "sandbox");
                assert_eq!(request_id, id);
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        assert!(!tracker.resolve(&id, Ok(1)));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn no_timeout_waits_for_reply() {
        let tracker = CompletionTracker::<&'static str>::new("sandbox");
        let id = RequestId::from("req-3");
        let pending = tracker.register(id.clone(), None).unwrap();

        let waiter = tokio::spawn(pending.wait());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        assert!(tracker.resolve(&id, Ok("done")));
        assert_eq!(waiter.await.unwrap().unwrap(), "done");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_sources_resolve_exactly_once() {
        let tracker = CompletionTracker::<usize>::new("sandbox");
        let reply_wins = Arc::new(AtomicUsize::new(0));

        for i in 0..200 {
            let id = RequestId::from(format!("race-{i}"));
            let pending = tracker
                .register(id.clone(), Some(Duration::from_millis(1)))
                .unwrap();

            let replier = {
                let tracker = tracker.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    tracker.resolve(&id, Ok(i))
                })
            };

            let outcome = pending.wait().await;
            let reply_won = replier.await.unwrap();

            match outcome {
                Ok(value) => {
                    assert!(reply_won, "reply delivered but resolve reported a loss");
                    assert_eq!(value, i);
                    reply_wins.fetch_add(1, Ordering::Relaxed);
                }
                Err(BridgeError::Timeout { .. }) => {
                    assert!(!reply_won, "timeout delivered but reply also won");
                }
                Err(other) => panic!("unexpected outcome: {other:?}"),
            }
        }

        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn dropping_pending_releases_entry() {
        let tracker = CompletionTracker::<u32>::new("sandbox");
        let id = RequestId::from("req-4");
        let pending = tracker.register(id.clone(), Some(Duration::from_secs(60))).unwrap();
        assert_eq!(tracker.in_flight(), 1);

        drop(pending);

        assert_eq!(tracker.in_flight(), 0);
        assert!(!tracker.resolve(&id, Ok(1)));
    }

    #[tokio::test]
    async fn cancelled_wait_releases_entry() {
        let tracker = CompletionTracker::<u32>::new("sandbox");
        let id = RequestId::from("req-5");
        let pending = tracker.register(id.clone(), None).unwrap();

        let result = tokio::time::timeout(Duration::from_millis(20), pending.wait()).await;
        assert!(result.is_err());
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_is_rejected() {
        let tracker = CompletionTracker::<u32>::new("sandbox");
        let id = RequestId::from("req-6");
        let _pending = tracker.register(id.clone(), None).unwrap();

        assert!(matches!(
            tracker.register(id.clone(), None),
            Err(BridgeError::DuplicateRequest(dup)) if dup == id
        ));
    }

    #[tokio::test]
    async fn id_can_be_reused_after_completion() {
        let tracker = CompletionTracker::<u32>::new("sandbox");
        let id = RequestId::from("req-7");

        let first = tracker.register(id.clone(), None).unwrap();
        assert!(tracker.resolve(&id, Ok(1)));
        assert_eq!(first.wait().await.unwrap(), 1);

        let second = tracker.register(id.clone(), None).unwrap();
        assert!(tracker.resolve(&id, Ok(2)));
        assert_eq!(second.wait().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fail_all_reaches_every_waiter() {
        let tracker = CompletionTracker::<u32>::new("sandbox");
        let a = tracker.register(RequestId::from("a"), None).unwrap();
        let b = tracker
            .register(RequestId::from("b"), Some(Duration::from_secs(60)))
            .unwrap();

        assert_eq!(tracker.fail_all(BridgeError::ConnectionClosed), 2);

        assert!(matches!(a.wait().await, Err(BridgeError::ConnectionClosed)));
        assert!(matches!(b.wait().await, Err(BridgeError::ConnectionClosed)));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn timeout_without_runtime_is_an_error() {
        let tracker = CompletionTracker::<u32>::new("sandbox");
        assert!(
            tracker
                .register(RequestId::from("x"), Some(Duration::from_secs(1)))
                .is_err()
        );
        assert_eq!(tracker.in_flight(), 0);
    }
}
