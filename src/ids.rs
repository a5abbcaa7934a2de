//! Correlation identifier allocation

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// Identifier stamped on a request and echoed back in its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// The key this identifier is matched under once it has crossed the wire
    pub fn wire_key(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct AllocState {
    next: u64,
    free: VecDeque<u64>,
    live: HashSet<u64>,
}

/// Hands out identifiers that no two live requests share.
///
/// Released identifiers are recycled, oldest release first.
#[derive(Default)]
pub struct IdAllocator {
    state: Mutex<AllocState>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an identifier that is not currently live
    pub fn allocate(&self) -> CorrelationId {
        let mut state = self.state.lock();
        let value = match state.free.pop_front() {
            Some(value) => value,
            None => {
                state.next += 1;
                state.next
            }
        };
        state.live.insert(value);
        CorrelationId(value)
    }

    /// Return an identifier to the pool. Releasing one that is not live does nothing.
    pub fn release(&self, id: CorrelationId) -> bool {
        let mut state = self.state.lock();
        if state.live.remove(&id.0) {
            state.free.push_back(id.0);
            true
        } else {
            false
        }
    }

    pub fn is_live(&self, id: CorrelationId) -> bool {
        self.state.lock().live.contains(&id.0)
    }

    /// Number of identifiers currently handed out
    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_allocate_is_unique_while_live() {
        let ids = IdAllocator::new();
        let a = ids.allocate();
        let b = ids.allocate();
        let c = ids.allocate();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!(ids.live_count(), 3);
    }

    #[test]
    fn test_release_recycles_oldest_first() {
        let ids = IdAllocator::new();
        let a = ids.allocate();
        let b = ids.allocate();

        assert!(ids.release(b));
        assert!(ids.release(a));

        assert_eq!(ids.allocate(), b);
        assert_eq!(ids.allocate(), a);
    }

    #[test]
    fn test_double_release_is_noop() {
        let ids = IdAllocator::new();
        let a = ids.allocate();

        assert!(ids.release(a));
        assert!(!ids.release(a));

        // The id must only come back once
        let first = ids.allocate();
        let second = ids.allocate();
        assert_eq!(first, a);
        assert_ne!(second, a);
    }

    #[test]
    fn test_wire_key_matches_display() {
        let id = CorrelationId::new(42);
        assert_eq!(id.wire_key(), "42");
        assert_eq!(id.to_string(), "42");
        assert_eq!(id.value(), 42);
    }

    #[test]
    fn test_concurrent_allocation_never_collides() {
        let ids = Arc::new(IdAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    for round in 0..200 {
                        held.push(ids.allocate());
                        if round % 3 == 0 {
                            let id = held.remove(0);
                            ids.release(id);
                        }
                    }
                    held
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "identifier {id} handed out twice");
            }
        }
        assert_eq!(all.len(), ids.live_count());
    }
}
