//! Deferred-commit registry keyed by correlation id.
//!
//! Task emission only predicts a world change; the actions registered here
//! apply it once the robot confirms completion. Each entry runs at most once.

use std::collections::HashMap;

use tracing::debug;

use crate::types::CorrelationId;

/// Correlation id -> ordered commit actions.
#[derive(Debug)]
pub struct FuturesManager<A> {
    pending: HashMap<CorrelationId, Vec<A>>,
}

impl<A> Default for FuturesManager<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> FuturesManager<A> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Store `actions` for `id`, replacing any earlier registration.
    pub fn register(&mut self, id: CorrelationId, actions: Vec<A>) {
        if self.pending.insert(id, actions).is_some() {
            debug!(correlation_id = id, "future registration replaced");
        }
    }

    /// Remove and return the actions for `id`. A second call for the same id
    /// returns `None`.
    pub fn take(&mut self, id: CorrelationId) -> Option<Vec<A>> {
        self.pending.remove(&id)
    }

    /// Run the actions for `id` in order, stopping at the first error.
    /// Returns `Ok(false)` for an unknown or finished id.
    ///
    /// The manager lives inside `owner` and is reached through `registry`,
    /// so `apply` gets the whole owner and may register follow-up futures.
    pub fn execute_in<W, E>(
        owner: &mut W,
        id: CorrelationId,
        registry: fn(&mut W) -> &mut Self,
        mut apply: impl FnMut(&mut W, A) -> Result<(), E>,
    ) -> Result<bool, E> {
        let Some(actions) = registry(owner).take(id) else {
            return Ok(false);
        };
        for action in actions {
            apply(owner, action)?;
        }
        Ok(true)
    }

    /// Drop a registration without running it.
    pub fn discard(&mut self, id: CorrelationId) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Owner {
        futures: FuturesManager<u32>,
        seen: Vec<u32>,
    }

    fn registry(owner: &mut Owner) -> &mut FuturesManager<u32> {
        &mut owner.futures
    }

    fn record(owner: &mut Owner, n: u32) -> Result<(), u32> {
        owner.seen.push(n);
        Ok(())
    }

    #[test]
    fn executes_in_order_exactly_once() {
        let mut owner = Owner::default();
        owner.futures.register(7, vec![1, 2, 3]);
        let ran = FuturesManager::execute_in(&mut owner, 7, registry, record).expect("execute");
        assert!(ran);
        assert_eq!(owner.seen, vec![1, 2, 3]);
        let again = FuturesManager::execute_in(&mut owner, 7, registry, record).expect("execute");
        assert!(!again);
        assert_eq!(owner.seen.len(), 3);
    }

    #[test]
    fn register_overwrites_previous_actions() {
        let mut futures = FuturesManager::new();
        futures.register(1, vec!["old"]);
        futures.register(1, vec!["new"]);
        assert_eq!(futures.len(), 1);
        assert_eq!(futures.take(1), Some(vec!["new"]));
        assert!(futures.is_empty());
    }

    #[test]
    fn unknown_id_is_a_silent_noop() {
        let mut owner = Owner::default();
        let ran = FuturesManager::execute_in(&mut owner, 42, registry, |_, n| Err(n)).expect("no error");
        assert!(!ran);
    }

    #[test]
    fn error_stops_remaining_actions_and_consumes_entry() {
        let mut owner = Owner::default();
        owner.futures.register(3, vec![1, 2, 3]);
        let result = FuturesManager::execute_in(&mut owner, 3, registry, |o, n| {
            if n == 2 {
                return Err(n);
            }
            record(o, n)
        });
        assert_eq!(result, Err(2));
        assert_eq!(owner.seen, vec![1]);
        assert!(!owner.futures.contains(3));
    }

    #[test]
    fn actions_may_register_follow_ups() {
        let mut owner = Owner::default();
        owner.futures.register(1, vec![10]);
        FuturesManager::execute_in(&mut owner, 1, registry, |o, n| {
            o.futures.register(2, vec![n + 1]);
            record(o, n)
        })
        .expect("execute");
        assert_eq!(owner.futures.take(2), Some(vec![11]));
    }
}
