//! The admissibility oracle: a nondeterministic finite automaton over
//! fingerprint state ids.
//!
//! State 0 is the distinguished start state and corresponds to no
//! fingerprint. Every transition is labelled with its target's id, so
//! `δ(s, ℓ) ⊆ {ℓ}` by construction; nondeterminism exists only because many
//! predecessors can share a target.

use crate::error::Error;
use crate::StateId;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// `origin → label → targets`.
pub type TransitionMap = BTreeMap<StateId, BTreeMap<StateId, BTreeSet<StateId>>>;

const SERIAL_MAGIC: i32 = 0x4e46_4131; // "NFA1"

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Automaton {
    state_count: StateId,
    initials: BTreeSet<StateId>,
    finals: BTreeSet<StateId>,
    forward: TransitionMap,
    pre: TransitionMap,
}

impl Automaton {
    /// Build an automaton from scratch, validating every component against
    /// the state space `{0, …, state_count - 1}`.
    pub fn construct(
        state_count: StateId,
        initials: BTreeSet<StateId>,
        finals: BTreeSet<StateId>,
        transitions: TransitionMap,
    ) -> Result<Self, Error> {
        if state_count == 0 {
            return Err(Error::Automaton("an automaton needs at least state 0".into()));
        }
        for &state in initials.iter().chain(finals.iter()) {
            if state >= state_count {
                return Err(Error::Automaton(format!(
                    "state {state} is outside the {state_count}-state space"
                )));
            }
        }
        for (&from, by_label) in &transitions {
            if from >= state_count {
                return Err(Error::Automaton(format!(
                    "transition origin {from} is outside the state space"
                )));
            }
            for (&label, targets) in by_label {
                if label == 0 || label >= state_count {
                    return Err(Error::Automaton(format!(
                        "label {label} is outside the alphabet"
                    )));
                }
                for &target in targets {
                    if target >= state_count {
                        return Err(Error::Automaton(format!(
                            "transition target {target} is outside the state space"
                        )));
                    }
                }
            }
        }
        let pre = reverse(&transitions);
        Ok(Self {
            state_count,
            initials,
            finals,
            forward: transitions,
            pre,
        })
    }

    /// Number of states, including the start state 0.
    pub fn state_count(&self) -> StateId {
        self.state_count
    }

    /// Labels range over `1..state_count`: a label is its target's id.
    pub fn alphabet_size(&self) -> StateId {
        self.state_count
    }

    pub fn initial_states(&self) -> &BTreeSet<StateId> {
        &self.initials
    }

    pub fn final_states(&self) -> &BTreeSet<StateId> {
        &self.finals
    }

    pub fn set_final_states(&mut self, finals: BTreeSet<StateId>) -> Result<(), Error> {
        if let Some(&state) = finals.iter().find(|&&s| s >= self.state_count) {
            return Err(Error::Automaton(format!(
                "final state {state} is outside the state space"
            )));
        }
        self.finals = finals;
        Ok(())
    }

    /// Pointwise union of `δ(s, label)` over the given state set.
    pub fn transition(&self, from: &BTreeSet<StateId>, label: StateId) -> BTreeSet<StateId> {
        let mut result = BTreeSet::new();
        for state in from {
            if let Some(targets) = self
                .forward
                .get(state)
                .and_then(|by_label| by_label.get(&label))
            {
                result.extend(targets.iter().copied());
            }
        }
        result
    }

    /// Copies of the predecessor and forward transition maps, for rebuilds.
    pub fn transition_maps(&self) -> (TransitionMap, TransitionMap) {
        (self.pre.clone(), self.forward.clone())
    }

    /// Flat sequence of native 32-bit words; [`Automaton::deserialize`] is
    /// the exact inverse.
    pub fn serialize(&self) -> Vec<i32> {
        let mut words = vec![
            SERIAL_MAGIC,
            self.state_count as i32,
            self.initials.len() as i32,
        ];
        words.extend(self.initials.iter().map(|&s| s as i32));
        words.push(self.finals.len() as i32);
        words.extend(self.finals.iter().map(|&s| s as i32));
        let rows: usize = self.forward.values().map(BTreeMap::len).sum();
        words.push(rows as i32);
        for (&from, by_label) in &self.forward {
            for (&label, targets) in by_label {
                words.push(from as i32);
                words.push(label as i32);
                words.push(targets.len() as i32);
                words.extend(targets.iter().map(|&s| s as i32));
            }
        }
        words
    }

    /// Rebuild an automaton from its serialised form.
    pub fn deserialize(words: &[i32]) -> Result<Self, Error> {
        let mut reader = Reader { words, at: 0 };
        if reader.next()? != SERIAL_MAGIC {
            return Err(Error::Automaton("bad automaton magic".into()));
        }
        let state_count = reader.next_id()?;
        let initials = reader.next_id_set()?;
        let finals = reader.next_id_set()?;
        let rows = reader.next_len()?;
        let mut transitions = TransitionMap::new();
        for _ in 0..rows {
            let from = reader.next_id()?;
            let label = reader.next_id()?;
            let target_count = reader.next_len()?;
            let mut targets = BTreeSet::new();
            for _ in 0..target_count {
                targets.insert(reader.next_id()?);
            }
            if transitions
                .entry(from)
                .or_default()
                .insert(label, targets)
                .is_some()
            {
                return Err(Error::Automaton(format!(
                    "duplicate transition row for state {from} label {label}"
                )));
            }
        }
        if !reader.exhausted() {
            return Err(Error::Automaton("trailing data after automaton".into()));
        }
        Self::construct(state_count, initials, finals, transitions)
    }

    /// Read the automaton blob written by [`Automaton::store`]. `Ok(None)`
    /// when no file exists yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>, Error> {
        let bytes = match std::fs::read(path.as_ref()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if bytes.len() % 4 != 0 {
            return Err(Error::Automaton(format!(
                "automaton file {} is truncated",
                path.as_ref().display()
            )));
        }
        let words: Vec<i32> = bytes
            .chunks_exact(4)
            .map(|chunk| i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Self::deserialize(&words).map(Some)
    }

    /// Persist the serialised automaton to disk.
    pub fn store(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let words = self.serialize();
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for word in words {
            bytes.extend_from_slice(&word.to_ne_bytes());
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// DOT rendition for debugging.
    pub fn visualize(&self) -> String {
        let mut dot = String::from("digraph automaton {\n  rankdir=LR;\n");
        dot.push_str("  start [shape=point];\n");
        for state in 0..self.state_count {
            let shape = if self.finals.contains(&state) {
                "doublecircle"
            } else {
                "circle"
            };
            dot.push_str(&format!("  s{state} [shape={shape} label=\"{state}\"];\n"));
        }
        for initial in &self.initials {
            dot.push_str(&format!("  start -> s{initial};\n"));
        }
        for (from, by_label) in &self.forward {
            for (label, targets) in by_label {
                for target in targets {
                    dot.push_str(&format!("  s{from} -> s{target} [label=\"{label}\"];\n"));
                }
            }
        }
        dot.push_str("}\n");
        dot
    }
}

fn reverse(forward: &TransitionMap) -> TransitionMap {
    let mut pre = TransitionMap::new();
    for (&from, by_label) in forward {
        for (&label, targets) in by_label {
            for &target in targets {
                pre.entry(target)
                    .or_default()
                    .entry(label)
                    .or_default()
                    .insert(from);
            }
        }
    }
    pre
}

struct Reader<'a> {
    words: &'a [i32],
    at: usize,
}

impl Reader<'_> {
    fn next(&mut self) -> Result<i32, Error> {
        let word = self
            .words
            .get(self.at)
            .copied()
            .ok_or_else(|| Error::Automaton("unexpected end of automaton data".into()))?;
        self.at += 1;
        Ok(word)
    }

    fn next_id(&mut self) -> Result<StateId, Error> {
        let word = self.next()?;
        StateId::try_from(word)
            .map_err(|_| Error::Automaton(format!("negative state id {word}")))
    }

    fn next_len(&mut self) -> Result<usize, Error> {
        let word = self.next()?;
        usize::try_from(word).map_err(|_| Error::Automaton(format!("negative length {word}")))
    }

    fn next_id_set(&mut self) -> Result<BTreeSet<StateId>, Error> {
        let len = self.next_len()?;
        let mut set = BTreeSet::new();
        for _ in 0..len {
            set.insert(self.next_id()?);
        }
        Ok(set)
    }

    fn exhausted(&self) -> bool {
        self.at == self.words.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn chain(states: StateId) -> Automaton {
        // 0 -1-> 1 -2-> 2 … with the last state final.
        let mut transitions = TransitionMap::new();
        for target in 1..states {
            transitions
                .entry(target - 1)
                .or_default()
                .insert(target, BTreeSet::from([target]));
        }
        Automaton::construct(
            states,
            BTreeSet::from([0]),
            BTreeSet::from([states - 1]),
            transitions,
        )
        .unwrap()
    }

    #[test]
    fn construct_validates_bounds() {
        assert!(Automaton::construct(0, BTreeSet::new(), BTreeSet::new(), TransitionMap::new())
            .is_err());
        assert!(
            Automaton::construct(2, BTreeSet::from([5]), BTreeSet::new(), TransitionMap::new())
                .is_err()
        );
        let mut label_zero = TransitionMap::new();
        label_zero
            .entry(0)
            .or_default()
            .insert(0, BTreeSet::from([0]));
        assert!(
            Automaton::construct(2, BTreeSet::from([0]), BTreeSet::new(), label_zero).is_err()
        );
    }

    #[test]
    fn transition_takes_the_pointwise_union() {
        // Two predecessors share target 2.
        let mut transitions = TransitionMap::new();
        transitions
            .entry(0)
            .or_default()
            .insert(2, BTreeSet::from([2]));
        transitions
            .entry(1)
            .or_default()
            .insert(2, BTreeSet::from([2]));
        let automaton =
            Automaton::construct(3, BTreeSet::from([0]), BTreeSet::new(), transitions).unwrap();

        let from = BTreeSet::from([0, 1]);
        assert_eq!(automaton.transition(&from, 2), BTreeSet::from([2]));
        assert_eq!(automaton.transition(&from, 1), BTreeSet::new());
        assert_eq!(
            automaton.transition(&BTreeSet::from([2]), 2),
            BTreeSet::new()
        );
    }

    #[test]
    fn set_final_states_checks_bounds() {
        let mut automaton = chain(3);
        assert!(automaton.set_final_states(BTreeSet::from([1, 2])).is_ok());
        assert!(automaton.set_final_states(BTreeSet::from([9])).is_err());
    }

    #[test]
    fn pre_map_mirrors_forward() {
        let automaton = chain(4);
        let (pre, forward) = automaton.transition_maps();
        assert_eq!(forward[&0][&1], BTreeSet::from([1]));
        assert_eq!(pre[&1][&1], BTreeSet::from([0]));
        assert_eq!(pre[&3][&3], BTreeSet::from([2]));
    }

    #[test]
    fn store_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nfa.bin");
        let automaton = chain(5);
        automaton.store(&path).unwrap();
        let loaded = Automaton::load(&path).unwrap().unwrap();
        assert_eq!(loaded, automaton);
    }

    #[test]
    fn load_of_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Automaton::load(dir.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn deserialize_rejects_corruption() {
        let automaton = chain(3);
        let mut words = automaton.serialize();
        words[0] = 0; // magic
        assert!(Automaton::deserialize(&words).is_err());
        let words = automaton.serialize();
        assert!(Automaton::deserialize(&words[..words.len() - 1]).is_err());
    }

    #[test]
    fn visualize_mentions_every_edge() {
        let automaton = chain(3);
        let dot = automaton.visualize();
        assert!(dot.contains("s0 -> s1"));
        assert!(dot.contains("s1 -> s2"));
        assert!(dot.contains("doublecircle"));
    }

    fn automaton_strategy() -> impl Strategy<Value = Automaton> {
        (2u32..16).prop_flat_map(|states| {
            let edges = proptest::collection::vec((0..states, 1..states), 0..40);
            let finals = proptest::collection::btree_set(0..states, 0..4);
            (edges, finals).prop_map(move |(edges, finals)| {
                let mut transitions = TransitionMap::new();
                for (from, label) in edges {
                    transitions
                        .entry(from)
                        .or_default()
                        .insert(label, BTreeSet::from([label]));
                }
                Automaton::construct(states, BTreeSet::from([0]), finals, transitions).unwrap()
            })
        })
    }

    proptest! {
        /// `deserialize(serialize(A)) == A`.
        #[test]
        fn serialisation_roundtrips(automaton in automaton_strategy()) {
            let words = automaton.serialize();
            let rebuilt = Automaton::deserialize(&words).unwrap();
            prop_assert_eq!(rebuilt, automaton);
        }

        /// Every non-empty transition result equals `{label}`.
        #[test]
        fn transitions_are_sound(
            automaton in automaton_strategy(),
            from in proptest::collection::btree_set(0u32..16, 0..6),
            label in 1u32..16,
        ) {
            let from: BTreeSet<StateId> =
                from.into_iter().filter(|&s| s < automaton.state_count()).collect();
            let result = automaton.transition(&from, label);
            prop_assert!(result.is_empty() || result == BTreeSet::from([label]));
        }
    }
}
