//! LRU-2 replacement with hint boosts.
//!
//! Every slot remembers the operation generation of its two most recent
//! accesses. A page touched once keeps a previous generation of 0 and is the
//! first to go, which makes one-off scans cheap to absorb.
//!
//! # Algorithm
//!
//! - On hit: `k[1] = k[0]; k[0] = generation`
//! - On fault: `k = [generation, 0]`, hints cleared
//! - Score: `k[1]` (or `k[0]` with `USE_SOON`) plus `weight * boost`, where
//!   weight is 2 for `DIRTY` plus 1..=4 for index depth 3..=0. `RESET`
//!   forces the score to 0.
//! - On eviction: lowest score among evictable slots, ties broken by the
//!   older `k[0]`, then by scan order.
//!
//! # Complexity
//!
//! - Hit: O(1)
//! - Eviction: O(n) over the slot table

use bitflags::bitflags;

bitflags! {
    /// Usage hints attached to a cached page.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CacheHints: u8 {
        /// Score by the most recent access instead of the one before.
        const USE_SOON = 0x01;
        /// The page was modified and must be written back before eviction.
        const DIRTY = 0x02;
        /// The page is garbage; evict first and never write back.
        const RESET = 0x04;
        const INDEX3 = 0x10;
        const INDEX2 = 0x20;
        const INDEX1 = 0x30;
        /// Lookup root.
        const INDEX0 = 0x40;
    }
}

impl CacheHints {
    const INDEX_MASK: u8 = 0x70;

    /// Hint for a lookup node `level` steps below the root.
    pub fn index(level: u8) -> CacheHints {
        CacheHints::from_bits_retain(0x40 - level.min(3) * 0x10)
    }

    /// Adds `new` to the current hints. An index hint replaces any earlier
    /// index hint instead of mixing with it.
    pub fn merge(self, new: CacheHints) -> CacheHints {
        let base = if new.bits() & Self::INDEX_MASK != 0 {
            CacheHints::from_bits_retain(self.bits() & !Self::INDEX_MASK)
        } else {
            self
        };
        base | new
    }

    fn weight(self) -> u64 {
        let dirty = if self.contains(CacheHints::DIRTY) { 2 } else { 0 };
        dirty + ((self.bits() & Self::INDEX_MASK) >> 4) as u64
    }
}

/// Access history and hints of one slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct History {
    pub k: [u64; 2],
    pub hints: CacheHints,
    pub score: u64,
}

#[derive(Debug)]
pub struct PolicyState {
    generation: u64,
    slot_boost: u64,
}

impl PolicyState {
    pub fn new(slot_boost: u64) -> Self {
        Self {
            generation: 0,
            slot_boost: slot_boost.max(1),
        }
    }

    fn tick(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn record_hit(&mut self, history: &mut History) {
        history.k[1] = history.k[0];
        history.k[0] = self.tick();
    }

    pub fn on_slot_assigned(&mut self, history: &mut History) {
        *history = History {
            k: [self.tick(), 0],
            hints: CacheHints::empty(),
            score: 0,
        };
    }

    pub fn score(&self, history: &History) -> u64 {
        let hints = history.hints;
        if hints.contains(CacheHints::RESET) {
            return 0;
        }
        let base = if hints.contains(CacheHints::USE_SOON) {
            history.k[0]
        } else {
            history.k[1]
        };
        base + hints.weight() * self.slot_boost
    }

    /// Picks the victim among `candidates`, given in scan order.
    pub fn evict_slot<'a, I>(&self, candidates: I) -> Option<usize>
    where
        I: Iterator<Item = (usize, &'a History)>,
    {
        candidates
            .min_by_key(|(_, history)| (history.score, history.k[0]))
            .map(|(idx, _)| idx)
    }
}

#[cfg(test)]
mod lru_k_tests {
    use super::*;

    fn history(policy: &mut PolicyState, hits: usize) -> History {
        let mut h = History::default();
        policy.on_slot_assigned(&mut h);
        for _ in 0..hits {
            policy.record_hit(&mut h);
        }
        h.score = policy.score(&h);
        h
    }

    #[test]
    fn single_access_scores_lowest() {
        let mut policy = PolicyState::new(1);
        let twice = history(&mut policy, 1);
        let once = history(&mut policy, 0);
        assert_eq!(once.score, 0);
        assert!(twice.score > once.score);
        let slots = [twice, once];
        assert_eq!(policy.evict_slot(slots.iter().enumerate()), Some(1));
    }

    #[test]
    fn ties_evict_the_older_access() {
        let mut policy = PolicyState::new(1);
        let old = history(&mut policy, 0);
        let new = history(&mut policy, 0);
        let slots = [new, old];
        assert_eq!(policy.evict_slot(slots.iter().enumerate()), Some(1));
    }

    #[test]
    fn hints_boost_and_reset() {
        let policy = PolicyState::new(10);
        let mut h = History {
            k: [5, 3],
            ..Default::default()
        };
        assert_eq!(policy.score(&h), 3);
        h.hints = CacheHints::USE_SOON;
        assert_eq!(policy.score(&h), 5);
        h.hints = CacheHints::DIRTY | CacheHints::index(0);
        assert_eq!(policy.score(&h), 3 + 6 * 10);
        h.hints = h.hints.merge(CacheHints::index(3));
        assert_eq!(policy.score(&h), 3 + 3 * 10);
        h.hints |= CacheHints::RESET;
        assert_eq!(policy.score(&h), 0);
    }

    #[test]
    fn shallow_index_outranks_deep_index() {
        let policy = PolicyState::new(1);
        let score = |hints| {
            policy.score(&History {
                k: [0, 0],
                hints,
                score: 0,
            })
        };
        assert!(score(CacheHints::index(0)) > score(CacheHints::index(1)));
        assert!(score(CacheHints::index(2)) > score(CacheHints::index(3)));
        assert_eq!(score(CacheHints::index(7)), score(CacheHints::index(3)));
    }
}
