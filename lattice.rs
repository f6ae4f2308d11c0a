// The generic lattice and per-instruction state shared by both analyses.
// Concrete lattices (Multiplier, BSizeDependence) live in `analyses/` and
// implement `AbstractValue`; `AbstractState<V>` and the engine in
// `engine.rs` never need to know which one they're working with.

use std::collections::BTreeMap as Map;
use std::fmt::Display;

use crate::ir::ValueId;

/// A finite-height join-semilattice value. `BOTTOM` must be the identity
/// element of `join` (`x.join(&BOTTOM) == x` for every `x`), and `join` must
/// be commutative, associative and idempotent — the engine's fixpoint
/// argument depends on it.
pub trait AbstractValue: Clone + PartialEq + Display {
    const BOTTOM: Self;

    fn join(&self, other: &Self) -> Self;
}

/// The state the engine threads through a function: a pointwise map from
/// values to abstract values (absent entries read as `BOTTOM`, never
/// stored), plus a scalar "is this program point reachable by every thread
/// in the block" summary of the *same* lattice type `V` — both analyses in
/// this crate track thread/block-size dependence using one value type for
/// ordinary values and for that summary.
#[derive(Clone, Debug)]
pub struct AbstractState<V: AbstractValue> {
    values: Map<ValueId, V>,
    pub num_threads: V,
}

impl<V: AbstractValue> AbstractState<V> {
    pub fn bottom() -> Self {
        AbstractState {
            values: Map::new(),
            num_threads: V::BOTTOM,
        }
    }

    pub fn with_num_threads(num_threads: V) -> Self {
        AbstractState {
            values: Map::new(),
            num_threads,
        }
    }

    pub fn get(&self, v: ValueId) -> V {
        self.values.get(&v).cloned().unwrap_or(V::BOTTOM)
    }

    pub fn set(&mut self, v: ValueId, val: V) {
        self.values.insert(v, val);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ValueId, &V)> {
        self.values.iter()
    }

    /// Joins `other` into `self` in place (`self` is the running/stored
    /// state, `other` the freshly computed one) and reports whether `self`
    /// changed. The engine's termination check and the worklist's
    /// buffer-then-flush merge both reduce to this one operation.
    pub fn join_in_place(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (k, v) in other.values.iter() {
            let merged = match self.values.get(k) {
                Some(cur) => cur.join(v),
                None => v.clone(),
            };
            if self.values.get(k) != Some(&merged) {
                changed = true;
                self.values.insert(*k, merged);
            }
        }
        let merged_nt = self.num_threads.join(&other.num_threads);
        if merged_nt != self.num_threads {
            changed = true;
        }
        self.num_threads = merged_nt;
        changed
    }
}

impl<V: AbstractValue> Display for AbstractState<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (k, v) in &self.values {
            if *v != V::BOTTOM {
                writeln!(f, "  {k:?} = {v}")?;
            }
        }
        writeln!(f, "  num_threads = {}", self.num_threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use derive_more::Display;
    use pretty_assertions::assert_eq;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
    enum Toy {
        Bot,
        Zero,
        Top,
    }

    impl AbstractValue for Toy {
        const BOTTOM: Self = Toy::Bot;

        fn join(&self, other: &Self) -> Self {
            match (self, other) {
                (Toy::Bot, x) | (x, Toy::Bot) => *x,
                (a, b) if a == b => *a,
                _ => Toy::Top,
            }
        }
    }

    #[test]
    fn missing_entries_read_as_bottom() {
        let st: AbstractState<Toy> = AbstractState::bottom();
        assert_eq!(st.get(ValueId(7)), Toy::Bot);
    }

    /// Spec invariant 2: merging never loses information — the result is
    /// `⊒` both inputs, point-wise and on `num_threads`.
    #[test]
    fn join_in_place_is_monotone() {
        let mut s: AbstractState<Toy> = AbstractState::bottom();
        s.set(ValueId(0), Toy::Zero);
        s.num_threads = Toy::Zero;
        let before = s.clone();

        let mut t: AbstractState<Toy> = AbstractState::bottom();
        t.set(ValueId(0), Toy::Top);
        t.set(ValueId(1), Toy::Zero);
        t.num_threads = Toy::Top;

        s.join_in_place(&t);

        assert_eq!(s.get(ValueId(0)), before.get(ValueId(0)).join(&t.get(ValueId(0))));
        assert_eq!(s.get(ValueId(1)), t.get(ValueId(1)));
        assert_eq!(s.num_threads, before.num_threads.join(&t.num_threads));
    }

    #[test]
    fn join_in_place_is_idempotent() {
        let mut a: AbstractState<Toy> = AbstractState::bottom();
        a.set(ValueId(0), Toy::Zero);
        let mut b: AbstractState<Toy> = AbstractState::bottom();
        b.set(ValueId(0), Toy::Zero);

        assert!(!a.join_in_place(&b));
        assert_eq!(a.get(ValueId(0)), Toy::Zero);

        b.set(ValueId(0), Toy::Top);
        assert!(a.join_in_place(&b));
        assert_eq!(a.get(ValueId(0)), Toy::Top);
    }
}
