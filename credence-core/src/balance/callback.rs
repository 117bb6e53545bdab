//! Priority threshold callbacks of a single node.

use std::fmt;

/// Work run once when a callback's threshold is reached. Always invoked with
/// no balance or tracker lock held, so it may call back into the tracker.
pub type CallbackAction = Box<dyn FnOnce() + Send + 'static>;

/// Public callback slots; a node holds at most one callback per kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    /// Priority reached a threshold, typically zero.
    Exhausted,
    /// Priority dropped to a previously forecast value.
    PriorityUpdate,
}

/// Slot identity. The priority status slot is owned by the node itself and
/// does not collide with user callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Slot {
    Kind(CallbackKind),
    PriorityStatus,
}

pub(crate) struct Callback {
    slot: Slot,
    threshold: i64,
    action: CallbackAction,
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("slot", &self.slot)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

/// Armed callbacks sorted by ascending threshold.
///
/// Priority only decreases between mutations, so the callback with the
/// highest threshold is always the next one to fire and sits at the end.
#[derive(Debug, Default)]
pub(crate) struct CallbackList {
    entries: Vec<Callback>,
}

impl CallbackList {
    /// Arms a callback, replacing any existing one in the same slot. A new
    /// callback goes before existing ones with an equal threshold.
    pub fn insert(&mut self, slot: Slot, threshold: i64, action: CallbackAction) {
        self.remove(slot);
        let index = self.entries.partition_point(|cb| cb.threshold < threshold);
        self.entries.insert(
            index,
            Callback {
                slot,
                threshold,
                action,
            },
        );
    }

    pub fn remove(&mut self, slot: Slot) -> bool {
        match self.entries.iter().position(|cb| cb.slot == slot) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Threshold of the next callback to fire.
    pub fn highest_threshold(&self) -> Option<i64> {
        self.entries.last().map(|cb| cb.threshold)
    }

    /// Removes and returns the actions of every callback whose threshold is
    /// at or above `priority`, highest threshold first.
    pub fn take_reached(&mut self, priority: i64) -> Vec<CallbackAction> {
        let mut reached = Vec::new();
        while self.entries.last().is_some_and(|cb| cb.threshold >= priority) {
            if let Some(cb) = self.entries.pop() {
                reached.push(cb.action);
            }
        }
        reached
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> CallbackAction {
        let log = log.clone();
        Box::new(move || log.lock().unwrap().push(label))
    }

    #[test]
    fn fires_highest_threshold_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = CallbackList::default();
        list.insert(Slot::Kind(CallbackKind::Exhausted), 0, recording(&log, "zero"));
        list.insert(Slot::Kind(CallbackKind::PriorityUpdate), 10, recording(&log, "ten"));
        list.insert(Slot::PriorityStatus, -5, recording(&log, "debt"));
        assert_eq!(list.highest_threshold(), Some(10));

        for action in list.take_reached(0) {
            action();
        }
        assert_eq!(*log.lock().unwrap(), vec!["ten", "zero"]);
        assert_eq!(list.len(), 1);
        assert_eq!(list.highest_threshold(), Some(-5));
    }

    #[test]
    fn one_callback_per_slot() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = CallbackList::default();
        let slot = Slot::Kind(CallbackKind::Exhausted);
        list.insert(slot, 0, recording(&log, "first"));
        list.insert(slot, 3, recording(&log, "second"));
        assert_eq!(list.len(), 1);
        assert_eq!(list.highest_threshold(), Some(3));

        assert!(list.remove(slot));
        assert!(!list.remove(slot));
        assert!(list.is_empty());
    }

    #[test]
    fn equal_thresholds_fire_oldest_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = CallbackList::default();
        list.insert(Slot::PriorityStatus, 0, recording(&log, "old"));
        list.insert(Slot::Kind(CallbackKind::Exhausted), 0, recording(&log, "new"));
        for action in list.take_reached(0) {
            action();
        }
        assert_eq!(*log.lock().unwrap(), vec!["old", "new"]);
    }
}
