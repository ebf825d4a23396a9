//! Generation counter used to detect stale asynchronous results.
//!
//! The controller owns the [`GenerationToken`] and is its only writer. The
//! decode worker gets a read-only [`GenerationObserver`] so it can drop work
//! early without ever mutating session state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic epoch counter for one decoding session.
///
/// Wrapping at `u64::MAX` restarts at zero; that edge is accepted.
#[derive(Debug, Default)]
pub struct GenerationToken {
    current: Arc<AtomicU64>,
}

impl GenerationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Advance to a new epoch and return it.
    pub fn bump(&self) -> u64 {
        let next = self.current().wrapping_add(1);
        self.current.store(next, Ordering::Release);
        next
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.current()
    }

    pub fn observer(&self) -> GenerationObserver {
        GenerationObserver {
            current: Arc::clone(&self.current),
        }
    }
}

/// Read-only view of a [`GenerationToken`], safe to hand to other threads.
#[derive(Debug, Clone)]
pub struct GenerationObserver {
    current: Arc<AtomicU64>,
}

impl GenerationObserver {
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_is_strictly_increasing() {
        let token = GenerationToken::new();
        let mut last = token.current();
        for _ in 0..10 {
            let next = token.bump();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_observer_sees_bumps() {
        let token = GenerationToken::new();
        let observer = token.observer();
        let g = token.bump();
        assert!(observer.is_current(g));
        token.bump();
        assert!(!observer.is_current(g));
    }

    #[test]
    fn test_observer_across_threads() {
        let token = GenerationToken::new();
        let observer = token.observer();
        let g = token.bump();
        let seen = std::thread::spawn(move || observer.current()).join().unwrap();
        assert_eq!(seen, g);
    }
}
