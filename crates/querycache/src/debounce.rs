use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The pending or running dispatch of one key.
struct Window {
    generation: u64,
    token: CancellationToken,
    /// When the dispatch fires, unless superseded.
    deadline: Instant,
}

struct Windows<K> {
    slots: HashMap<K, Window>,
    next_generation: u64,
}

impl<K> Default for Windows<K> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            next_generation: 0,
        }
    }
}

/// Coalesces bursts of calls per key into a single dispatch of the latest arguments.
///
/// Every [`schedule`](Self::schedule) restarts the window of its key. Only when a window elapses
/// without being superseded is its dispatch started. A newer call also cancels a dispatch of the
/// same key that is still running, whose result is then discarded.
pub struct DebounceGate<K> {
    windows: Arc<Mutex<Windows<K>>>,
    /// Parent of all window tokens, cancelled on shutdown.
    root: CancellationToken,
}

impl<K> fmt::Debug for DebounceGate<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.lock().slots.len();
        f.debug_struct("DebounceGate")
            .field("pending", &pending)
            .field("shut_down", &self.root.is_cancelled())
            .finish()
    }
}

impl<K> Default for DebounceGate<K> {
    fn default() -> Self {
        Self {
            windows: Default::default(),
            root: CancellationToken::new(),
        }
    }
}

impl<K> DebounceGate<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Windows<K>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The number of keys with a pending or running dispatch.
    pub fn pending(&self) -> usize {
        self.lock().slots.len()
    }

    /// Cancels every pending and running dispatch. Later calls to
    /// [`schedule`](Self::schedule) are ignored.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.lock().slots.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl<K> DebounceGate<K>
where
    K: Eq + Hash + Clone + fmt::Display + Send + 'static,
{
    /// When the dispatch of `key` fires, if it has not fired yet.
    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.lock().slots.get(key).map(|window| window.deadline)
    }

    /// Dispatches `args` for `key` once `delay` has passed without another call for `key`.
    ///
    /// `dispatch` receives a token that is cancelled once a newer call for `key` arrives or the
    /// gate shuts down.
    pub fn schedule<A, D, F>(&self, key: K, args: A, delay: Duration, dispatch: D)
    where
        A: Send + 'static,
        D: FnOnce(A, CancellationToken) -> F + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        if self.root.is_cancelled() {
            tracing::debug!(key = %key, "Ignoring call on a shut down debounce gate");
            return;
        }

        let token = self.root.child_token();
        let generation = {
            let mut windows = self.lock();
            let generation = windows.next_generation;
            windows.next_generation += 1;

            let window = Window {
                generation,
                token: token.clone(),
                deadline: Instant::now() + delay,
            };
            if let Some(superseded) = windows.slots.insert(key.clone(), window) {
                superseded.token.cancel();
                metric!(counter("debounce.superseded") += 1);
                tracing::trace!(key = %key, "Superseded earlier call");
            }
            generation
        };

        let windows = Arc::clone(&self.windows);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            tokio::select! {
                _ = token.cancelled() => {
                    tracing::trace!(key = %key, "Discarding result of superseded dispatch");
                }
                _ = dispatch(args, token.clone()) => {}
            }

            let mut windows = windows.lock().unwrap_or_else(PoisonError::into_inner);
            if windows
                .slots
                .get(&key)
                .is_some_and(|window| window.generation == generation)
            {
                windows.slots.remove(&key);
            }
        });
    }
}

impl<K> Drop for DebounceGate<K> {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_only_latest_call_dispatches() {
        let gate = DebounceGate::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for args in ["a1", "a2"] {
            let tx = tx.clone();
            gate.schedule("dashboard", args, Duration::from_millis(300), move |args, _| async move {
                tx.send(args).unwrap();
            });
            tokio::time::advance(Duration::from_millis(100)).await;
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(tx);

        let mut dispatched = vec![];
        while let Some(args) = rx.recv().await {
            dispatched.push(args);
        }
        assert_eq!(dispatched, vec!["a2"]);
        assert_eq!(gate.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_call_resets_the_window() {
        let gate = DebounceGate::new();
        let dispatched = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = Arc::clone(&dispatched);
            gate.schedule("dashboard", (), Duration::from_millis(300), move |_, _| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(dispatched.load(Ordering::SeqCst), 0);
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let gate = DebounceGate::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for key in ["dashboard", "funnels"] {
            let tx = tx.clone();
            gate.schedule(key, key, Duration::from_millis(300), move |args, _| async move {
                tx.send(args).unwrap();
            });
        }
        drop(tx);

        let mut dispatched = vec![];
        while let Some(args) = rx.recv().await {
            dispatched.push(args);
        }
        dispatched.sort();
        assert_eq!(dispatched, vec!["dashboard", "funnels"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_dispatch_is_cancelled() {
        let gate = DebounceGate::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = {
            let tx = tx.clone();
            move |args: &'static str, token: CancellationToken| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                // never reached, the dispatch is dropped once superseded
                tx.send((args, token.is_cancelled())).unwrap();
            }
        };
        gate.schedule("dashboard", "a1", Duration::from_millis(300), first);

        // let the first window elapse, so its dispatch is running
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(gate.pending(), 1);

        let tx2 = tx.clone();
        gate.schedule("dashboard", "a2", Duration::from_millis(300), move |args, token| async move {
            tx2.send((args, token.is_cancelled())).unwrap();
        });
        drop(tx);

        let mut dispatched = vec![];
        while let Some(result) = rx.recv().await {
            dispatched.push(result);
        }
        assert_eq!(dispatched, vec![("a2", false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_everything() {
        let gate = DebounceGate::new();
        let dispatched = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&dispatched);
        gate.schedule("dashboard", (), Duration::from_millis(300), move |_, _| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(gate.deadline(&"dashboard").is_some());

        gate.shutdown();
        assert!(gate.is_shut_down());
        assert_eq!(gate.pending(), 0);

        let counter = Arc::clone(&dispatched);
        gate.schedule("dashboard", (), Duration::from_millis(300), move |_, _| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
        assert_eq!(gate.pending(), 0);
    }
}
