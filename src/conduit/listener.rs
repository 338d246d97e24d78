//! Readiness listener slots and the read-listener loop breaker

use parking_lot::Mutex;

/// Default cap on consecutive read-listener invocations without progress
pub const DEFAULT_MAX_READ_LISTENER_INVOCATIONS: usize = 100;

/// Holds one callback that is taken out while it runs.
///
/// The conduit never calls a listener with a lock held: it checks the
/// callback out, releases the slot, invokes it, then checks it back in.
/// Every `set` (including clearing) bumps a generation, and check-in only
/// succeeds when the generation is still the one seen at check-out, so a
/// callback that replaced or cleared itself stays replaced or cleared.
pub struct ListenerSlot<L: ?Sized> {
    slot: Mutex<Slot<L>>,
}

struct Slot<L: ?Sized> {
    listener: Option<Box<L>>,
    generation: u64,
}

/// A listener checked out of its slot for one invocation
pub struct CheckedOut<L: ?Sized> {
    pub listener: Box<L>,
    generation: u64,
}

impl<L: ?Sized> ListenerSlot<L> {
    pub fn new() -> Self {
        Self { slot: Mutex::new(Slot { listener: None, generation: 0 }) }
    }

    pub fn set(&self, listener: Option<Box<L>>) {
        let mut slot = self.slot.lock();
        slot.listener = listener;
        slot.generation = slot.generation.wrapping_add(1);
    }

    /// Remove the listener for good
    pub fn take(&self) -> Option<Box<L>> {
        let mut slot = self.slot.lock();
        let listener = slot.listener.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(listener)
    }

    /// Remove the listener for one invocation; hand it back with `check_in`
    pub fn check_out(&self) -> Option<CheckedOut<L>> {
        let mut slot = self.slot.lock();
        let listener = slot.listener.take()?;
        Some(CheckedOut { listener, generation: slot.generation })
    }

    /// Put the listener back unless the slot was set or cleared meanwhile
    pub fn check_in(&self, checked_out: CheckedOut<L>) {
        let mut slot = self.slot.lock();
        if slot.generation == checked_out.generation {
            slot.listener = Some(checked_out.listener);
        }
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().listener.is_some()
    }
}

impl<L: ?Sized> Default for ListenerSlot<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts consecutive read-listener invocations that made no progress
#[derive(Debug, Clone, Copy)]
pub struct ReadLoopBreaker {
    max: usize,
    count: usize,
}

impl ReadLoopBreaker {
    pub fn new(max: usize) -> Self {
        Self { max, count: 0 }
    }

    /// Record one invocation; false once the cap is exceeded
    pub fn admit(&mut self) -> bool {
        self.count += 1;
        self.count <= self.max
    }

    /// The consumer drained data, start counting afresh
    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl Default for ReadLoopBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_READ_LISTENER_INVOCATIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Callback = dyn FnMut(u32) -> u32 + Send;

    #[test]
    fn test_check_out_and_in() {
        let slot: ListenerSlot<Callback> = ListenerSlot::new();
        slot.set(Some(Box::new(|x| x + 1)));
        let mut running = slot.check_out().unwrap();
        assert!(!slot.is_set());
        assert_eq!((running.listener)(1), 2);
        slot.check_in(running);
        assert!(slot.is_set());
    }

    #[test]
    fn test_check_in_keeps_replacement() {
        let slot: ListenerSlot<Callback> = ListenerSlot::new();
        slot.set(Some(Box::new(|x| x + 1)));
        let old = slot.check_out().unwrap();
        slot.set(Some(Box::new(|x| x * 10)));
        slot.check_in(old);
        let mut current = slot.take().unwrap();
        assert_eq!(current(2), 20);
    }

    #[test]
    fn test_check_in_keeps_clear() {
        let slot: ListenerSlot<Callback> = ListenerSlot::new();
        slot.set(Some(Box::new(|x| x + 1)));
        let running = slot.check_out().unwrap();
        slot.set(None);
        slot.check_in(running);
        assert!(!slot.is_set());
    }

    #[test]
    fn test_loop_breaker() {
        let mut breaker = ReadLoopBreaker::new(100);
        for _ in 0..100 {
            assert!(breaker.admit());
        }
        assert!(!breaker.admit());
        assert_eq!(breaker.count(), 101);
        breaker.reset();
        assert!(breaker.admit());
    }
}
