//! Per-key lock table for Ember.
//!
//! Provides exclusive key locks with:
//! - One owner per key and a FIFO queue of pending requests
//! - Re-entrant acquisition for the current owner
//! - Terminal deadlock marking of pending requests
//! - Listeners notified on ownership grants and on queued requests

use dashmap::DashMap;
use ember_common::prelude::*;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

type LockReply = std::result::Result<(), TransactionError>;

/// Result of a lock acquisition attempt.
#[derive(Debug)]
pub enum LockPromise {
    /// Lock was granted immediately (or was already held)
    Granted,
    /// Lock request is waiting in queue; resolves when granted or failed
    Pending(oneshot::Receiver<LockReply>),
}

impl LockPromise {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockPromise::Granted)
    }
}

/// Observer of lock table events.
///
/// Callbacks run on the thread that caused the event, after the per-key
/// critical section has been left, so they may read the table freely.
pub trait LockListener: Send + Sync {
    /// `owner` was just granted `key`.
    fn on_lock_acquired(&self, table: &LockTable, key: &Key, owner: &LockOwner);

    /// `waiter` was queued on `key`, currently held by `owner`.
    fn on_lock_waiting(&self, _table: &LockTable, _key: &Key, _waiter: &LockOwner, _owner: &LockOwner) {
    }
}

/// Handle returned by [`LockTable::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Pending lock request.
#[derive(Debug)]
struct PendingRequest {
    owner: LockOwner,
    reply: oneshot::Sender<LockReply>,
}

/// State of a single key lock.
#[derive(Debug, Default)]
struct KeyLock {
    owner: Option<LockOwner>,
    queue: VecDeque<PendingRequest>,
}

impl KeyLock {
    /// Hand the lock to the first live request in the queue.
    fn grant_next(&mut self) -> Option<LockOwner> {
        while let Some(request) = self.queue.pop_front() {
            if request.reply.send(Ok(())).is_ok() {
                self.owner = Some(request.owner);
                return Some(request.owner);
            }
        }
        None
    }

    fn is_idle(&self) -> bool {
        self.owner.is_none() && self.queue.is_empty()
    }

    fn remove_pending(&mut self, owner: &LockOwner) -> usize {
        let before = self.queue.len();
        self.queue.retain(|r| r.owner != *owner);
        before - self.queue.len()
    }
}

/// Lock table statistics.
#[derive(Debug, Clone, Default)]
pub struct LockTableStats {
    pub locks_granted: u64,
    pub locks_waited: u64,
    pub locks_released: u64,
    pub timeouts: u64,
    pub deadlocked: u64,
}

enum Event {
    Acquired(LockOwner),
    Waiting(LockOwner),
}

/// Lock table implementation.
pub struct LockTable {
    /// Lock states keyed by cache key
    locks: DashMap<Key, Arc<Mutex<KeyLock>>>,
    /// Owners and the keys they currently hold
    owned: DashMap<LockOwner, HashSet<Key>>,
    /// Registered listeners
    listeners: RwLock<Vec<(ListenerId, Arc<dyn LockListener>)>>,
    next_listener: AtomicU64,
    /// Statistics
    stats: Mutex<LockTableStats>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            owned: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            stats: Mutex::new(LockTableStats::default()),
        }
    }

    /// Register a listener for ownership and queueing events.
    pub fn add_listener(&self, listener: Arc<dyn LockListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Request `key` for `owner` without waiting.
    pub fn acquire(&self, owner: LockOwner, key: Key) -> LockPromise {
        let (promise, event) = {
            // The entry guard keeps `prune` from dropping the lock under us
            let lock = self
                .locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(KeyLock::default())));
            let mut state = lock.lock();
            let current_owner = state.owner;
            match current_owner {
                None => {
                    state.owner = Some(owner);
                    self.record_owned(owner, &key);
                    (LockPromise::Granted, Some(Event::Acquired(owner)))
                }
                Some(current) if current == owner => (LockPromise::Granted, None),
                Some(current) => {
                    let (reply, rx) = oneshot::channel();
                    state.queue.push_back(PendingRequest { owner, reply });
                    (LockPromise::Pending(rx), Some(Event::Waiting(current)))
                }
            }
        };

        match event {
            Some(Event::Acquired(owner)) => {
                self.stats.lock().locks_granted += 1;
                self.notify_acquired(&key, &owner);
            }
            Some(Event::Waiting(current)) => {
                self.stats.lock().locks_waited += 1;
                trace!(key = %display_key(&key), %owner, holder = %current, "lock request queued");
                self.notify_waiting(&key, &owner, &current);
            }
            None => {}
        }

        promise
    }

    /// Acquire `key` for `owner`, waiting at most `timeout`.
    pub async fn lock(&self, owner: LockOwner, key: Key, timeout: Duration) -> std::result::Result<(), TransactionError> {
        let mut rx = match self.acquire(owner, key.clone()) {
            LockPromise::Granted => return Ok(()),
            LockPromise::Pending(rx) => rx,
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransactionError::LockCancelled(display_key(&key))),
            Err(_) => self.settle_timed_out(owner, &key, &mut rx),
        }
    }

    /// Outcome of a request whose wait timed out.
    ///
    /// A request that is no longer queued was answered while the timer fired;
    /// that answer wins over the timeout.
    fn settle_timed_out(&self, owner: LockOwner, key: &Key, rx: &mut oneshot::Receiver<LockReply>) -> LockReply {
        if !self.cancel(&owner, key) {
            if let Ok(reply) = rx.try_recv() {
                return reply;
            }
            if self.owner_of(key) == Some(owner) {
                return Ok(());
            }
        }
        self.stats.lock().timeouts += 1;
        Err(TransactionError::LockTimeout {
            key: display_key(key),
        })
    }

    /// Remove a pending request. Returns true if one was queued.
    pub fn cancel(&self, owner: &LockOwner, key: &Key) -> bool {
        let Some(lock) = self.key_lock(key) else {
            return false;
        };
        let removed = lock.lock().remove_pending(owner) > 0;
        if removed {
            self.prune(key);
        }
        removed
    }

    /// Release `key` if held by `owner` and grant it to the next waiter.
    pub fn release(&self, owner: &LockOwner, key: &Key) -> bool {
        let Some(lock) = self.key_lock(key) else {
            return false;
        };

        let next = {
            let mut state = lock.lock();
            if state.owner != Some(*owner) {
                return false;
            }
            state.owner = None;
            self.forget_owned(owner, key);
            let next = state.grant_next();
            if let Some(next) = next {
                self.record_owned(next, key);
            }
            next
        };

        {
            let mut stats = self.stats.lock();
            stats.locks_released += 1;
            if next.is_some() {
                stats.locks_granted += 1;
            }
        }

        match next {
            Some(next) => self.notify_acquired(key, &next),
            None => self.prune(key),
        }
        true
    }

    /// Release every lock held by `owner` and drop its pending requests.
    pub fn release_all(&self, owner: &LockOwner) -> usize {
        for (key, lock) in self.snapshot() {
            let removed = lock.lock().remove_pending(owner);
            if removed > 0 {
                self.prune(&key);
            }
        }

        let keys = self.keys_owned_by(owner);
        keys.iter().filter(|key| self.release(owner, key)).count()
    }

    /// Current owner of `key`.
    pub fn owner_of(&self, key: &Key) -> Option<LockOwner> {
        self.key_lock(key).and_then(|lock| lock.lock().owner)
    }

    /// Owners waiting for `key`, in queue order.
    pub fn pending_owners_of(&self, key: &Key) -> Vec<LockOwner> {
        match self.key_lock(key) {
            Some(lock) => lock.lock().queue.iter().map(|r| r.owner).collect(),
            None => Vec::new(),
        }
    }

    /// Keys currently held by `owner`.
    pub fn keys_owned_by(&self, owner: &LockOwner) -> Vec<Key> {
        self.owned
            .get(owner)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Fail every pending request matching `predicate(pending, current_owner)`
    /// with a deadlock error and drop it from its queue.
    ///
    /// Returns how many requests were marked; a marked request is gone, so a
    /// repeated call with the same predicate returns 0.
    pub fn mark_deadlocked<F>(&self, predicate: F) -> usize
    where
        F: Fn(&LockOwner, Option<&LockOwner>) -> bool,
    {
        let mut marked = 0;
        let mut emptied = Vec::new();
        for (key, lock) in self.snapshot() {
            let mut state = lock.lock();
            let current = state.owner;
            let mut kept = VecDeque::with_capacity(state.queue.len());
            while let Some(request) = state.queue.pop_front() {
                if predicate(&request.owner, current.as_ref()) {
                    let error = match request.owner.as_transaction() {
                        Some(txn) => TransactionError::Deadlock { txn },
                        None => TransactionError::LockCancelled(display_key(&key)),
                    };
                    let _ = request.reply.send(Err(error));
                    marked += 1;
                } else {
                    kept.push_back(request);
                }
            }
            state.queue = kept;
            if state.is_idle() {
                emptied.push(key);
            }
        }
        for key in &emptied {
            self.prune(key);
        }

        if marked > 0 {
            self.stats.lock().deadlocked += marked as u64;
        }
        marked
    }

    /// Get statistics.
    pub fn stats(&self) -> LockTableStats {
        self.stats.lock().clone()
    }

    fn key_lock(&self, key: &Key) -> Option<Arc<Mutex<KeyLock>>> {
        self.locks.get(key).map(|entry| entry.value().clone())
    }

    /// Drop the entry of `key` once nobody holds or waits for it.
    ///
    /// Must not be called with the key's state locked.
    fn prune(&self, key: &Key) {
        self.locks.remove_if(key, |_, lock| lock.lock().is_idle());
    }

    fn snapshot(&self) -> Vec<(Key, Arc<Mutex<KeyLock>>)> {
        self.locks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn record_owned(&self, owner: LockOwner, key: &Key) {
        self.owned.entry(owner).or_default().insert(key.clone());
    }

    fn forget_owned(&self, owner: &LockOwner, key: &Key) {
        let empty = match self.owned.get_mut(owner) {
            Some(mut keys) => {
                keys.remove(key);
                keys.is_empty()
            }
            None => false,
        };
        if empty {
            self.owned.remove_if(owner, |_, keys| keys.is_empty());
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn LockListener>> {
        self.listeners.read().iter().map(|(_, l)| l.clone()).collect()
    }

    fn notify_acquired(&self, key: &Key, owner: &LockOwner) {
        for listener in self.listeners() {
            listener.on_lock_acquired(self, key, owner);
        }
    }

    fn notify_waiting(&self, key: &Key, waiter: &LockOwner, owner: &LockOwner) {
        for listener in self.listeners() {
            listener.on_lock_waiting(self, key, waiter, owner);
        }
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_common::testing::fixtures::{key, txn};

    fn owner(seq: u64) -> LockOwner {
        LockOwner::from(txn(seq, 1))
    }

    #[derive(Default)]
    struct Recorder {
        acquired: Mutex<Vec<(Key, LockOwner)>>,
        waiting: Mutex<Vec<(LockOwner, LockOwner)>>,
    }

    impl LockListener for Recorder {
        fn on_lock_acquired(&self, table: &LockTable, key: &Key, owner: &LockOwner) {
            // The table is readable from inside the callback
            assert_eq!(table.owner_of(key), Some(*owner));
            self.acquired.lock().push((key.clone(), *owner));
        }

        fn on_lock_waiting(&self, _table: &LockTable, _key: &Key, waiter: &LockOwner, owner: &LockOwner) {
            self.waiting.lock().push((*waiter, *owner));
        }
    }

    #[test]
    fn test_acquire_and_reenter() {
        let table = LockTable::new();
        let k = key("k1");

        assert!(table.acquire(owner(1), k.clone()).is_granted());
        assert!(table.acquire(owner(1), k.clone()).is_granted());
        assert!(!table.acquire(owner(2), k.clone()).is_granted());

        assert_eq!(table.owner_of(&k), Some(owner(1)));
        assert_eq!(table.pending_owners_of(&k), vec![owner(2)]);
        assert_eq!(table.keys_owned_by(&owner(1)), vec![k]);
    }

    #[tokio::test]
    async fn test_release_grants_in_fifo_order() {
        let table = LockTable::new();
        let k = key("k1");

        table.acquire(owner(1), k.clone());
        let LockPromise::Pending(second) = table.acquire(owner(2), k.clone()) else {
            panic!("expected pending");
        };
        let LockPromise::Pending(_third) = table.acquire(owner(3), k.clone()) else {
            panic!("expected pending");
        };

        assert!(table.release(&owner(1), &k));
        assert_eq!(second.await.unwrap(), Ok(()));
        assert_eq!(table.owner_of(&k), Some(owner(2)));
        assert_eq!(table.pending_owners_of(&k), vec![owner(3)]);
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let table = LockTable::new();
        let k = key("k1");

        table.acquire(owner(1), k.clone());
        let result = table.lock(owner(2), k.clone(), Duration::from_millis(20)).await;

        assert!(matches!(result, Err(TransactionError::LockTimeout { .. })));
        assert!(table.pending_owners_of(&k).is_empty());
        assert_eq!(table.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_mark_deadlocked_is_idempotent() {
        let table = LockTable::new();
        let k1 = key("k1");
        let k2 = key("k2");
        let victim = txn(2, 1);

        table.acquire(owner(1), k1.clone());
        table.acquire(owner(1), k2.clone());
        let LockPromise::Pending(rx1) = table.acquire(victim.into(), k1.clone()) else {
            panic!("expected pending");
        };
        let LockPromise::Pending(_rx2) = table.acquire(owner(3), k2.clone()) else {
            panic!("expected pending");
        };

        let marked = table.mark_deadlocked(|pending, _| pending.is_transaction(victim));
        assert_eq!(marked, 1);
        assert_eq!(rx1.await.unwrap(), Err(TransactionError::Deadlock { txn: victim }));
        assert_eq!(table.pending_owners_of(&k2), vec![owner(3)]);

        // Nothing left to mark
        assert_eq!(table.mark_deadlocked(|pending, _| pending.is_transaction(victim)), 0);
        assert_eq!(table.stats().deadlocked, 1);
    }

    #[test]
    fn test_release_all() {
        let table = LockTable::new();
        let keys = ember_common::testing::fixtures::keys("k", 3);

        for k in &keys {
            table.acquire(owner(1), k.clone());
        }
        let _waiting = table.acquire(owner(2), keys[0].clone());
        table.acquire(owner(1), key("other-owner-waits"));
        table.acquire(owner(3), key("held-by-3"));
        table.acquire(owner(1), key("held-by-3"));

        assert_eq!(table.release_all(&owner(1)), 4);
        assert_eq!(table.owner_of(&keys[0]), Some(owner(2)));
        assert!(table.pending_owners_of(&key("held-by-3")).is_empty());
        assert!(table.keys_owned_by(&owner(1)).is_empty());
    }

    #[test]
    fn test_idle_entries_are_dropped() {
        let table = LockTable::new();
        let keys = ember_common::testing::fixtures::keys("k", 1000);
        for k in &keys {
            assert!(table.acquire(owner(1), k.clone()).is_granted());
        }
        let _waiting = table.acquire(owner(2), keys[0].clone());
        assert_eq!(table.locks.len(), 1000);

        assert_eq!(table.release_all(&owner(1)), 1000);
        assert_eq!(table.locks.len(), 1);
        assert_eq!(table.owner_of(&keys[0]), Some(owner(2)));

        table.release_all(&owner(2));
        assert!(table.locks.is_empty());

        // A freshly acquired key gets a new entry
        assert!(table.acquire(owner(3), keys[1].clone()).is_granted());
        assert_eq!(table.owner_of(&keys[1]), Some(owner(3)));
    }

    #[tokio::test]
    async fn test_entry_survives_cancel_while_held() {
        let table = LockTable::new();
        let k = key("k1");

        table.acquire(owner(1), k.clone());
        let result = table.lock(owner(3), k.clone(), Duration::from_millis(10)).await;
        assert!(result.is_err());
        let _next = table.acquire(owner(2), k.clone());
        assert_eq!(table.locks.len(), 1);

        table.release(&owner(1), &k);
        assert_eq!(table.owner_of(&k), Some(owner(2)));
        table.release(&owner(2), &k);
        assert!(table.locks.is_empty());
    }

    #[tokio::test]
    async fn test_deadlock_reply_wins_over_timeout() {
        let table = LockTable::new();
        let k = key("k1");
        let victim = txn(2, 1);

        table.acquire(owner(1), k.clone());
        let LockPromise::Pending(mut rx) = table.acquire(victim.into(), k.clone()) else {
            panic!("expected pending");
        };

        // The marking lands as the timer fires
        assert_eq!(table.mark_deadlocked(|pending, _| pending.is_transaction(victim)), 1);
        let reply = table.settle_timed_out(victim.into(), &k, &mut rx);

        assert_eq!(reply, Err(TransactionError::Deadlock { txn: victim }));
        assert_eq!(table.stats().timeouts, 0);
    }

    #[test]
    fn test_listeners() {
        let table = LockTable::new();
        let recorder = Arc::new(Recorder::default());
        let id = table.add_listener(recorder.clone());
        let k = key("k1");

        table.acquire(owner(1), k.clone());
        let _pending = table.acquire(owner(2), k.clone());
        table.release(&owner(1), &k);

        assert_eq!(
            *recorder.acquired.lock(),
            vec![(k.clone(), owner(1)), (k.clone(), owner(2))]
        );
        assert_eq!(*recorder.waiting.lock(), vec![(owner(2), owner(1))]);

        assert!(table.remove_listener(id));
        table.release(&owner(2), &k);
        table.acquire(owner(4), k.clone());
        assert_eq!(recorder.acquired.lock().len(), 2);
    }

    #[test]
    fn test_stats() {
        let table = LockTable::new();
        let k = key("k1");

        table.acquire(owner(1), k.clone());
        table.release(&owner(1), &k);

        let stats = table.stats();
        assert_eq!(stats.locks_granted, 1);
        assert_eq!(stats.locks_released, 1);
    }
}
