//! Process-local coordination flags: the global batch gate, the per-subject
//! in-flight set and the scale-out interrupt latch.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashSet;

/// Concurrent set of keys currently held by an apply worker.
#[derive(Debug)]
pub struct LeaseSet<K: Eq + Hash> {
    held: DashSet<K>,
}

impl<K: Eq + Hash> Default for LeaseSet<K> {
    fn default() -> Self {
        Self {
            held: DashSet::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> LeaseSet<K> {
    /// Returns false when another holder already has the key.
    pub fn try_acquire(&self, key: K) -> bool {
        self.held.insert(key)
    }

    pub fn release(&self, key: &K) {
        self.held.remove(key);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.held.contains(key)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Flags shared by the orchestrator, restore loop, membership heartbeat and
/// the cluster endpoint of one process.
#[derive(Debug, Default)]
pub struct CoordinationFlags {
    global_gate: AtomicBool,
    in_flight: LeaseSet<i64>,
    scale_out: AtomicBool,
}

impl CoordinationFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gate if it is clear. Returns whether this caller set it.
    pub fn try_raise_global_gate(&self) -> bool {
        self.global_gate
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn raise_global_gate(&self) {
        self.global_gate.store(true, Ordering::SeqCst);
    }

    pub fn clear_global_gate(&self) {
        self.global_gate.store(false, Ordering::SeqCst);
    }

    pub fn is_global_gate_raised(&self) -> bool {
        self.global_gate.load(Ordering::SeqCst)
    }

    pub fn mark_key_in_flight(&self, user_id: i64) -> bool {
        self.in_flight.try_acquire(user_id)
    }

    pub fn clear_key_in_flight(&self, user_id: i64) {
        self.in_flight.release(&user_id);
    }

    pub fn is_key_in_flight(&self, user_id: i64) -> bool {
        self.in_flight.contains(&user_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn raise_scale_out(&self) {
        self.scale_out.store(true, Ordering::SeqCst);
    }

    pub fn reset_scale_out(&self) {
        self.scale_out.store(false, Ordering::SeqCst);
    }

    pub fn is_scale_out_raised(&self) -> bool {
        self.scale_out.load(Ordering::SeqCst)
    }
}

/// Holds the global gate for its lifetime; dropping it clears the gate.
#[derive(Debug)]
pub struct GlobalGateGuard {
    flags: Arc<CoordinationFlags>,
}

impl GlobalGateGuard {
    /// Returns `None` when the gate is already held.
    pub fn try_acquire(flags: &Arc<CoordinationFlags>) -> Option<Self> {
        flags.try_raise_global_gate().then(|| Self {
            flags: Arc::clone(flags),
        })
    }
}

impl Drop for GlobalGateGuard {
    fn drop(&mut self) {
        self.flags.clear_global_gate();
    }
}

/// In-flight leases for a set of subjects, released on drop.
pub struct InFlightLeases<'a> {
    flags: &'a CoordinationFlags,
    held: Vec<i64>,
}

impl<'a> InFlightLeases<'a> {
    pub fn new(flags: &'a CoordinationFlags) -> Self {
        Self {
            flags,
            held: Vec::new(),
        }
    }

    /// Mark `user_id` in flight unless this guard already holds it. Returns
    /// false when some other holder has it.
    pub fn acquire(&mut self, user_id: i64) -> bool {
        if self.held.contains(&user_id) {
            return true;
        }
        if self.flags.mark_key_in_flight(user_id) {
            self.held.push(user_id);
            true
        } else {
            false
        }
    }

    pub fn held(&self) -> &[i64] {
        &self.held
    }
}

impl Drop for InFlightLeases<'_> {
    fn drop(&mut self) {
        for user_id in self.held.drain(..) {
            self.flags.clear_key_in_flight(user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_admits_one_holder_until_released() {
        let flags = Arc::new(CoordinationFlags::new());
        let guard = GlobalGateGuard::try_acquire(&flags).expect("first acquire");
        assert!(GlobalGateGuard::try_acquire(&flags).is_none());
        assert!(flags.is_global_gate_raised());
        drop(guard);
        assert!(!flags.is_global_gate_raised());
        assert!(GlobalGateGuard::try_acquire(&flags).is_some());
    }

    #[test]
    fn in_flight_leases_release_on_drop() {
        let flags = CoordinationFlags::new();
        {
            let mut leases = InFlightLeases::new(&flags);
            assert!(leases.acquire(7));
            assert!(leases.acquire(7));
            assert!(flags.is_key_in_flight(7));

            let mut other = InFlightLeases::new(&flags);
            assert!(!other.acquire(7));
            assert!(other.held().is_empty());
        }
        assert!(!flags.is_key_in_flight(7));
        assert_eq!(flags.in_flight_count(), 0);
    }

    #[test]
    fn scale_out_latch_is_idempotent() {
        let flags = CoordinationFlags::new();
        flags.raise_scale_out();
        flags.raise_scale_out();
        assert!(flags.is_scale_out_raised());
        flags.reset_scale_out();
        assert!(!flags.is_scale_out_raised());
    }
}
