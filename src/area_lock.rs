//! Named zone-area locks held by external callers across several steps.
//!
//! These reserve a physical area for one owner. They are independent of the
//! scheduler's own serialization.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::types::{LockId, RobotId};

#[derive(Debug, Default)]
pub struct AreaLocks {
    held: Mutex<HashMap<LockId, RobotId>>,
    available: Condvar,
}

impl AreaLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `lock` is free, then take it for `owner`.
    pub fn acquire(&self, lock: LockId, owner: RobotId) {
        let mut guard = self.held.lock().expect("area lock mutex poisoned");
        loop {
            if !guard.contains_key(&lock) {
                guard.insert(lock, owner);
                debug!(lock, owner, "area lock acquired");
                return;
            }
            guard = self.available.wait(guard).expect("condvar wait failed");
        }
    }

    /// Like `acquire` but gives up after `timeout`.
    pub fn acquire_timeout(&self, lock: LockId, owner: RobotId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.held.lock().expect("area lock mutex poisoned");
        loop {
            if !guard.contains_key(&lock) {
                guard.insert(lock, owner);
                debug!(lock, owner, "area lock acquired");
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .available
                .wait_timeout(guard, deadline - now)
                .expect("condvar wait failed");
            guard = next;
        }
    }

    pub fn try_acquire(&self, lock: LockId, owner: RobotId) -> bool {
        let mut guard = self.held.lock().expect("area lock mutex poisoned");
        if guard.contains_key(&lock) {
            return false;
        }
        guard.insert(lock, owner);
        true
    }

    /// Release `lock` if `owner` holds it. Returns false otherwise and leaves
    /// the lock untouched.
    pub fn release(&self, lock: LockId, owner: RobotId) -> bool {
        let mut guard = self.held.lock().expect("area lock mutex poisoned");
        match guard.get(&lock) {
            Some(holder) if *holder == owner => {
                guard.remove(&lock);
                self.available.notify_all();
                debug!(lock, owner, "area lock released");
                true
            }
            Some(holder) => {
                warn!(lock, owner, holder = *holder, "area lock release by non-owner");
                false
            }
            None => {
                warn!(lock, owner, "release of an area lock that is not held");
                false
            }
        }
    }

    /// Current holders, sorted by lock id.
    pub fn held(&self) -> Vec<(LockId, RobotId)> {
        let guard = self.held.lock().expect("area lock mutex poisoned");
        let mut out: Vec<(LockId, RobotId)> = guard.iter().map(|(l, o)| (*l, *o)).collect();
        out.sort_unstable();
        out
    }

    /// Drop every lock and wake all waiters.
    pub fn clear(&self) {
        let mut guard = self.held.lock().expect("area lock mutex poisoned");
        guard.clear();
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, mpsc};
    use std::thread;

    #[test]
    fn lock_is_exclusive_under_contention() {
        let locks = Arc::new(AreaLocks::new());
        let contenders = 6;
        let barrier = Arc::new(Barrier::new(contenders));
        let inside = Arc::new(AtomicUsize::new(0));
        let violation = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for robot in 0..contenders {
            let locks = Arc::clone(&locks);
            let barrier = Arc::clone(&barrier);
            let inside = Arc::clone(&inside);
            let violation = Arc::clone(&violation);
            handles.push(thread::spawn(move || {
                barrier.wait();
                locks.acquire(1, robot as u64);
                if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                    violation.store(true, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(10));
                inside.fetch_sub(1, Ordering::SeqCst);
                assert!(locks.release(1, robot as u64));
            }));
        }
        for handle in handles {
            handle.join().expect("lock thread panicked");
        }
        assert!(!violation.load(Ordering::SeqCst));
        assert!(locks.held().is_empty());
    }

    #[test]
    fn non_owner_release_keeps_lock() {
        let locks = AreaLocks::new();
        locks.acquire(3, 1);
        assert!(!locks.release(3, 2));
        assert_eq!(locks.held(), vec![(3, 1)]);
        assert!(!locks.try_acquire(3, 2));
        assert!(locks.release(3, 1));
        assert!(!locks.release(3, 1));
    }

    #[test]
    fn clear_wakes_blocked_acquirer() {
        let locks = Arc::new(AreaLocks::new());
        locks.acquire(5, 1);
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                locks.acquire(5, 2);
                tx.send(()).expect("send acquired");
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        locks.clear();
        rx.recv_timeout(Duration::from_secs(1)).expect("waiter acquired");
        waiter.join().expect("waiter panicked");
        assert_eq!(locks.held(), vec![(5, 2)]);
    }

    #[test]
    fn acquire_timeout_gives_up() {
        let locks = AreaLocks::new();
        locks.acquire(1, 1);
        assert!(!locks.acquire_timeout(1, 2, Duration::from_millis(20)));
        assert!(locks.acquire_timeout(2, 2, Duration::from_millis(20)));
    }
}
