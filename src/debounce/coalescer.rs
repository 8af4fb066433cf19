use super::TimerKey;
use crate::core::{AggregateId, Result, SyncError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

struct PendingTimer {
    ticket: u64,
    scope: AggregateId,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct CoalescerState {
    by_key: HashMap<TimerKey, PendingTimer>,
    /// Ticket of every live timer to the key it currently fires under.
    owners: HashMap<u64, TimerKey>,
}

impl CoalescerState {
    fn remove_key(&mut self, key: &TimerKey) -> Option<PendingTimer> {
        let timer = self.by_key.remove(key)?;
        self.owners.remove(&timer.ticket);
        Some(timer)
    }

    fn remove_where(
        &mut self,
        mut predicate: impl FnMut(&TimerKey, &PendingTimer) -> bool,
    ) -> usize {
        let doomed: Vec<TimerKey> = self
            .by_key
            .iter()
            .filter(|(key, timer)| predicate(key, timer))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            if let Some(timer) = self.remove_key(key) {
                timer.handle.abort();
            }
        }
        doomed.len()
    }

    /// A fired timer owns its ticket only if nobody replaced or cancelled it.
    fn claim(&mut self, ticket: u64) -> bool {
        match self.owners.remove(&ticket) {
            Some(key) => {
                self.by_key.remove(&key);
                true
            }
            None => false,
        }
    }
}

/// Trailing-edge debouncer: one live timer per key, last value wins.
///
/// Each scheduled call replaces the timer of its key. When a timer survives a
/// full quiet window it claims itself and runs its producer exactly once.
/// Cancelled or replaced timers never run, and dropping the coalescer aborts
/// every timer that has not fired yet.
pub struct DebounceCoalescer {
    window: Duration,
    state: Arc<Mutex<CoalescerState>>,
    tickets: AtomicU64,
}

impl DebounceCoalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(CoalescerState::default())),
            tickets: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// (Re)starts the timer of `key`. Must be called inside a Tokio runtime.
    pub fn schedule<V, F, Fut>(
        &self,
        key: TimerKey,
        scope: AggregateId,
        value: V,
        producer: F,
    ) -> Result<u64>
    where
        V: Send + 'static,
        F: FnOnce(V) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = Handle::try_current()
            .map_err(|err| SyncError::Runtime(format!("cannot schedule '{}': {}", key, err)))?;
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed) + 1;

        let mut state = self.state.lock()?;
        if let Some(previous) = state.remove_key(&key) {
            previous.handle.abort();
        }

        // The quiet window runs from the call, not from the first poll.
        let deadline = Instant::now() + self.window;
        let shared = Arc::clone(&self.state);
        let handle = runtime.spawn(async move {
            sleep_until(deadline).await;
            let claimed = match shared.lock() {
                Ok(mut state) => state.claim(ticket),
                Err(err) => {
                    log::warn!("debounce timer {} dropped: {}", ticket, err);
                    false
                }
            };
            if claimed {
                producer(value).await;
            }
        });

        state.owners.insert(ticket, key.clone());
        state.by_key.insert(
            key,
            PendingTimer {
                ticket,
                scope,
                handle,
            },
        );
        Ok(ticket)
    }

    /// Cancels the timer of `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &TimerKey) -> Result<bool> {
        let mut state = self.state.lock()?;
        Ok(match state.remove_key(key) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        })
    }

    /// Cancels every timer of one entity (or one aggregate-level subject).
    pub fn cancel_subject(&self, subject: &str) -> Result<usize> {
        let mut state = self.state.lock()?;
        Ok(state.remove_where(|key, _| key.subject == subject))
    }

    /// Cancels every timer scheduled on behalf of an aggregate.
    pub fn cancel_scope(&self, scope: &AggregateId) -> Result<usize> {
        let mut state = self.state.lock()?;
        Ok(state.remove_where(|_, timer| timer.scope == *scope))
    }

    pub fn cancel_all(&self) -> Result<usize> {
        let mut state = self.state.lock()?;
        Ok(state.remove_where(|_, _| true))
    }

    /// Moves the pending timers of `from` to `to` without restarting them.
    ///
    /// A timer already pending under `to` was scheduled later and wins; the
    /// moved one is dropped.
    pub fn rekey_subject(&self, from: &str, to: &str) -> Result<usize> {
        let mut state = self.state.lock()?;
        let moving: Vec<TimerKey> = state
            .by_key
            .keys()
            .filter(|key| key.subject == from)
            .cloned()
            .collect();
        for old_key in &moving {
            let new_key = TimerKey::new(to, old_key.operation.clone());
            if state.by_key.contains_key(&new_key) {
                if let Some(stale) = state.remove_key(old_key) {
                    stale.handle.abort();
                }
                continue;
            }
            if let Some(timer) = state.by_key.remove(old_key) {
                state.owners.insert(timer.ticket, new_key.clone());
                state.by_key.insert(new_key, timer);
            }
        }
        Ok(moving.len())
    }

    pub fn is_pending(&self, key: &TimerKey) -> Result<bool> {
        Ok(self.state.lock()?.by_key.contains_key(key))
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.state.lock()?.by_key.len())
    }

    pub fn pending_keys(&self) -> Result<Vec<TimerKey>> {
        let mut keys: Vec<TimerKey> = self.state.lock()?.by_key.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

impl Drop for DebounceCoalescer {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.remove_where(|_, _| true);
        }
    }
}
