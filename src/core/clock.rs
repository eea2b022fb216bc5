//! Per-actor logical clocks.
//!
//! A vector clock distinguishes "B causally followed A" from "A and B happened
//! independently". Clocks are never mutated in place: `advance` returns a new
//! clock, and `compare` returns a classification, not a merged clock.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ActorId;

/// How two clocks relate causally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Causality {
    Equal,
    /// Self happened before other.
    Before,
    /// Self happened after other.
    After,
    Concurrent,
}

impl Causality {
    pub fn as_str(self) -> &'static str {
        match self {
            Causality::Equal => "equal",
            Causality::Before => "before",
            Causality::After => "after",
            Causality::Concurrent => "concurrent",
        }
    }
}

/// Map of actor to logical counter. The empty map is the zero clock.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<ActorId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `actor`; absent entries read as zero.
    pub fn get(&self, actor: &ActorId) -> u64 {
        self.counters.get(actor).copied().unwrap_or(0)
    }

    /// A copy of this clock with `actor`'s counter incremented by one.
    pub fn advance(&self, actor: &ActorId) -> VectorClock {
        let mut counters = self.counters.clone();
        *counters.entry(actor.clone()).or_insert(0) += 1;
        Self { counters }
    }

    /// Classify this clock against `other`.
    ///
    /// Self dominates other iff every counter in either clock satisfies
    /// `self >= other`, with at least one strictly greater. A zero counter is
    /// equivalent to an absent entry.
    pub fn compare(&self, other: &VectorClock) -> Causality {
        let mut self_ahead = false;
        let mut other_ahead = false;
        for (actor, mine) in &self.counters {
            let theirs = other.get(actor);
            if *mine > theirs {
                self_ahead = true;
            } else if theirs > *mine {
                other_ahead = true;
            }
        }
        for (actor, theirs) in &other.counters {
            if !self.counters.contains_key(actor) && *theirs > 0 {
                other_ahead = true;
            }
        }
        match (self_ahead, other_ahead) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::After,
            (false, true) => Causality::Before,
            (true, true) => Causality::Concurrent,
        }
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, u64)> {
        self.counters.iter().map(|(actor, n)| (actor, *n))
    }
}

impl FromIterator<(ActorId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (ActorId, u64)>>(iter: I) -> Self {
        let counters = iter.into_iter().filter(|(_, n)| *n > 0).collect();
        Self { counters }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn actor(s: &str) -> ActorId {
        ActorId::parse(s).expect("valid actor")
    }

    #[test]
    fn advance_starts_from_zero() {
        let a = actor("alice");
        let clock = VectorClock::new().advance(&a);
        assert_eq!(clock.get(&a), 1);
        assert_eq!(clock.len(), 1);
    }

    #[test]
    fn advance_copies_rather_than_mutates() {
        let a = actor("alice");
        let base = VectorClock::new().advance(&a);
        let next = base.advance(&a);
        assert_eq!(base.get(&a), 1);
        assert_eq!(next.get(&a), 2);
    }

    #[test]
    fn repeated_advance_touches_only_that_actor() {
        let a = actor("alice");
        let b = actor("bob");
        let base = VectorClock::new().advance(&b);
        let mut clock = base.clone();
        for _ in 0..5 {
            clock = clock.advance(&a);
        }
        assert_eq!(clock.get(&a), 5);
        assert_eq!(clock.get(&b), base.get(&b));
    }

    #[test]
    fn compare_self_is_equal() {
        let a = actor("alice");
        let clock = VectorClock::new().advance(&a).advance(&a);
        assert_eq!(clock.compare(&clock), Causality::Equal);
        assert_eq!(
            VectorClock::new().compare(&VectorClock::new()),
            Causality::Equal
        );
    }

    #[test]
    fn advanced_clock_is_after_its_ancestor() {
        let a = actor("alice");
        let base = VectorClock::new().advance(&a);
        let next = base.advance(&actor("bob"));
        assert_eq!(next.compare(&base), Causality::After);
        assert_eq!(base.compare(&next), Causality::Before);
    }

    #[test]
    fn zero_clock_is_before_any_advanced_clock() {
        let zero = VectorClock::new();
        let one = VectorClock::new().advance(&actor("alice"));
        assert_eq!(zero.compare(&one), Causality::Before);
        assert_eq!(one.compare(&zero), Causality::After);
    }

    #[test]
    fn siblings_from_common_ancestor_are_concurrent() {
        let base = VectorClock::new().advance(&actor("root"));
        let left = base.advance(&actor("alice"));
        let right = base.advance(&actor("bob"));
        assert_eq!(left.compare(&right), Causality::Concurrent);
        assert_eq!(right.compare(&left), Causality::Concurrent);
    }

    #[test]
    fn explicit_zero_entries_do_not_matter() {
        let a = actor("alice");
        let with_zero: VectorClock =
            serde_json::from_str(r#"{"alice":0}"#).expect("deserialize");
        assert_eq!(with_zero.compare(&VectorClock::new()), Causality::Equal);
        assert_eq!(with_zero.get(&a), 0);
    }

    #[test]
    fn serde_round_trips_as_a_plain_map() {
        let clock = VectorClock::new()
            .advance(&actor("alice"))
            .advance(&actor("bob"))
            .advance(&actor("bob"));
        let json = serde_json::to_string(&clock).expect("serialize");
        assert_eq!(json, r#"{"alice":1,"bob":2}"#);
        let back: VectorClock = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, clock);
    }

    fn actor_strategy() -> impl Strategy<Value = ActorId> {
        prop::sample::select(vec!["ana", "bo", "cy", "dee"]).prop_map(actor)
    }

    fn clock_strategy() -> impl Strategy<Value = VectorClock> {
        prop::collection::vec((actor_strategy(), 0u64..4), 0..4)
            .prop_map(VectorClock::from_iter)
    }

    /// Dominance spelled out directly over the union of actors.
    fn dominates(a: &VectorClock, b: &VectorClock) -> bool {
        a.iter().all(|(actor, n)| n >= b.get(actor))
            && b.iter().all(|(actor, n)| a.get(actor) >= n)
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn compare_is_antisymmetric(a in clock_strategy(), b in clock_strategy()) {
            let mirrored = match a.compare(&b) {
                Causality::Equal => Causality::Equal,
                Causality::Before => Causality::After,
                Causality::After => Causality::Before,
                Causality::Concurrent => Causality::Concurrent,
            };
            prop_assert_eq!(b.compare(&a), mirrored);
        }

        #[test]
        fn compare_agrees_with_counterwise_dominance(
            a in clock_strategy(),
            b in clock_strategy(),
        ) {
            let expected = match (dominates(&a, &b), dominates(&b, &a)) {
                (true, true) => Causality::Equal,
                (true, false) => Causality::After,
                (false, true) => Causality::Before,
                (false, false) => Causality::Concurrent,
            };
            prop_assert_eq!(a.compare(&b), expected);
        }

        #[test]
        fn advance_strictly_dominates(clock in clock_strategy(), who in actor_strategy()) {
            let next = clock.advance(&who);
            prop_assert_eq!(next.compare(&clock), Causality::After);
            prop_assert_eq!(clock.compare(&next), Causality::Before);
        }

        #[test]
        fn advance_touches_only_the_given_actor(
            clock in clock_strategy(),
            who in actor_strategy(),
            n in 1u64..5,
        ) {
            let mut advanced = clock.clone();
            for _ in 0..n {
                advanced = advanced.advance(&who);
            }
            prop_assert_eq!(advanced.get(&who), clock.get(&who) + n);
            for (actor, count) in clock.iter() {
                if *actor != who {
                    prop_assert_eq!(advanced.get(actor), count);
                }
            }
        }
    }
}
