use serde::Deserialize;
use std::collections::VecDeque;

/// Scheduling tier of a queued request. Higher tiers always drain first, so
/// sustained high priority traffic can starve lower tiers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub(crate) fn index(self: Self) -> usize {
        self as usize
    }
}

/// Strict priority queue with FIFO order inside each tier
#[derive(Debug)]
pub(crate) struct PriorityQueue<T> {
    tiers: [VecDeque<T>; 3],
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self {
            tiers: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
        }
    }
}

impl<T> PriorityQueue<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(self: &mut Self, priority: Priority, item: T) {
        self.tiers[priority.index()].push_back(item);
    }

    pub(crate) fn pop(self: &mut Self) -> Option<T> {
        self.tiers.iter_mut().find_map(|tier| tier.pop_front())
    }

    pub(crate) fn len(self: &Self) -> usize {
        self.tiers.iter().map(|tier| tier.len()).sum()
    }

    pub(crate) fn is_empty(self: &Self) -> bool {
        self.tiers.iter().all(|tier| tier.is_empty())
    }

    /// Removes and returns the first item matching the predicate, searching from the
    /// highest tier down
    pub(crate) fn remove_where<F>(self: &mut Self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        for tier in self.tiers.iter_mut() {
            if let Some(position) = tier.iter().position(&mut predicate) {
                return tier.remove(position);
            }
        }
        None
    }

    /// Empties the queue in scheduling order
    pub(crate) fn drain(self: &mut Self) -> Vec<T> {
        self.tiers.iter_mut().flat_map(|tier| tier.drain(..)).collect()
    }
}
