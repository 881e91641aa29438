//! Microstep computation.
//!
//! Everything here is a pure function of the document, the current
//! configuration and the recorded history. The interpreter applies the
//! resulting [`MicroStepPlan`] and runs the attached content.

use crate::document::{
    Document, HistoryType, StateHandle, StateKind, TransitionHandle, TransitionType,
};
use std::collections::{BTreeMap, BTreeSet};

/// The set of active states. Ordered by document position.
pub type Configuration = BTreeSet<StateHandle>;

/// Recorded configurations, keyed by history state.
pub type HistoryValues = BTreeMap<StateHandle, Vec<StateHandle>>;

/// What one microstep does, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MicroStepPlan {
    /// Transitions whose content runs between exit and entry.
    pub transitions: Vec<TransitionHandle>,
    /// States to exit, deepest first.
    pub exit_set: Vec<StateHandle>,
    /// History values to record before exiting.
    pub history_updates: Vec<(StateHandle, Vec<StateHandle>)>,
    /// States to enter, shallowest first in document order.
    pub entry_set: Vec<StateHandle>,
    /// Default history transitions to run after their parent's entry content,
    /// keyed by that parent.
    pub history_content: BTreeMap<StateHandle, TransitionHandle>,
}

impl MicroStepPlan {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.exit_set.is_empty() && self.entry_set.is_empty()
    }

    /// The configuration after this plan is applied to `config`.
    pub fn next_configuration(&self, config: &Configuration) -> Configuration {
        let mut next = config.clone();
        for s in &self.exit_set {
            next.remove(s);
        }
        next.extend(self.entry_set.iter().copied());
        next
    }
}

/// Microstep computations over one document.
#[derive(Debug, Clone, Copy)]
pub struct MicroStep<'d> {
    doc: &'d Document,
}

struct EntrySet {
    states: BTreeSet<StateHandle>,
    history_content: BTreeMap<StateHandle, TransitionHandle>,
}

impl<'d> MicroStep<'d> {
    pub fn new(doc: &'d Document) -> Self {
        Self { doc }
    }

    /// Selects the enabled, non-conflicting transitions.
    ///
    /// With no event only eventless transitions are considered. `guard` is
    /// called for transitions that carry a condition; returning false skips
    /// to the next transition of the same state.
    pub fn select_transitions<F>(
        &self,
        config: &Configuration,
        history: &HistoryValues,
        event: Option<&str>,
        mut guard: F,
    ) -> Vec<TransitionHandle>
    where
        F: FnMut(TransitionHandle, &str) -> bool,
    {
        let mut enabled: Vec<TransitionHandle> = Vec::new();

        for &atomic in config.iter().filter(|&&s| self.doc.is_atomic(s)) {
            let chain = std::iter::once(atomic).chain(self.doc.proper_ancestors(atomic, None));
            'states: for state in chain {
                for &t in &self.doc.state(state).transitions {
                    let node = self.doc.transition(t);
                    let event_ok = match event {
                        None => node.is_eventless(),
                        Some(name) => !node.is_eventless() && node.matches(name),
                    };
                    if !event_ok {
                        continue;
                    }
                    let cond_ok = match &node.cond {
                        Some(cond) => guard(t, cond),
                        None => true,
                    };
                    if cond_ok {
                        if !enabled.contains(&t) {
                            enabled.push(t);
                        }
                        break 'states;
                    }
                }
            }
        }

        self.remove_conflicting(config, history, enabled)
    }

    fn remove_conflicting(
        &self,
        config: &Configuration,
        history: &HistoryValues,
        enabled: Vec<TransitionHandle>,
    ) -> Vec<TransitionHandle> {
        let mut filtered: Vec<(TransitionHandle, BTreeSet<StateHandle>)> = Vec::new();

        for t1 in enabled {
            let exit1 = self.transition_exit_set(config, history, t1);
            let source1 = self.doc.transition(t1).source;
            let mut preempted = false;
            let mut to_remove = Vec::new();

            for (t2, exit2) in &filtered {
                if exit1.is_disjoint(exit2) {
                    continue;
                }
                if self.doc.is_descendant(source1, self.doc.transition(*t2).source) {
                    to_remove.push(*t2);
                } else {
                    preempted = true;
                    break;
                }
            }

            if !preempted {
                filtered.retain(|(t, _)| !to_remove.contains(t));
                filtered.push((t1, exit1));
            }
        }

        filtered.into_iter().map(|(t, _)| t).collect()
    }

    /// Computes the microstep for the selected transitions.
    pub fn plan(
        &self,
        config: &Configuration,
        history: &HistoryValues,
        transitions: Vec<TransitionHandle>,
    ) -> MicroStepPlan {
        let mut exit = BTreeSet::new();
        for &t in &transitions {
            exit.extend(self.transition_exit_set(config, history, t));
        }
        let exit_set: Vec<StateHandle> = exit.into_iter().rev().collect();
        let history_updates = self.history_updates(config, &exit_set);

        let mut entry = EntrySet {
            states: BTreeSet::new(),
            history_content: BTreeMap::new(),
        };
        for &t in &transitions {
            let node = self.doc.transition(t);
            for &s in &node.targets {
                self.add_descendants(s, history, &mut entry);
            }
            let Some(domain) = self.transition_domain(history, t) else {
                continue;
            };
            for s in self.effective_targets(history, t) {
                self.add_ancestors(s, domain, history, &mut entry);
            }
        }

        MicroStepPlan {
            transitions,
            exit_set,
            history_updates,
            entry_set: entry.states.into_iter().collect(),
            history_content: entry.history_content,
        }
    }

    /// The microstep that enters the initial configuration.
    pub fn initial_plan(&self, history: &HistoryValues) -> MicroStepPlan {
        let mut entry = EntrySet {
            states: BTreeSet::new(),
            history_content: BTreeMap::new(),
        };
        for &s in &self.doc.state(StateHandle::ROOT).initial {
            self.add_descendants(s, history, &mut entry);
            self.add_ancestors(s, StateHandle::ROOT, history, &mut entry);
        }
        MicroStepPlan {
            entry_set: entry.states.into_iter().collect(),
            history_content: entry.history_content,
            ..Default::default()
        }
    }

    /// All active states in exit order.
    pub fn exit_all(&self, config: &Configuration) -> Vec<StateHandle> {
        config.iter().rev().copied().collect()
    }

    /// Returns true if `state` has reached a final configuration.
    pub fn is_in_final_state(&self, config: &Configuration, state: StateHandle) -> bool {
        if self.doc.is_compound(state) {
            self.doc
                .child_states(state)
                .any(|c| self.doc.is_final(c) && config.contains(&c))
        } else if self.doc.is_parallel(state) {
            self.doc
                .child_states(state)
                .all(|c| self.is_in_final_state(config, c))
        } else {
            false
        }
    }

    /// States completed by entering the final state `entered`: its parent, and
    /// the grandparent if that is a parallel state with all regions final.
    /// Empty for a top-level final state.
    pub fn completed_by(&self, config: &Configuration, entered: StateHandle) -> Vec<StateHandle> {
        let Some(parent) = self.doc.parent(entered) else {
            return Vec::new();
        };
        if parent == StateHandle::ROOT {
            return Vec::new();
        }
        let mut completed = vec![parent];
        if let Some(grandparent) = self.doc.parent(parent) {
            if self.doc.is_parallel(grandparent) && self.is_in_final_state(config, grandparent) {
                completed.push(grandparent);
            }
        }
        completed
    }

    /// Returns true if `state` is a final child of the document root.
    pub fn is_top_level_final(&self, state: StateHandle) -> bool {
        self.doc.is_final(state) && self.doc.parent(state) == Some(StateHandle::ROOT)
    }

    fn history_updates(
        &self,
        config: &Configuration,
        exit_set: &[StateHandle],
    ) -> Vec<(StateHandle, Vec<StateHandle>)> {
        let mut updates = Vec::new();
        for &s in exit_set {
            for h in self.doc.history_children(s) {
                let deep = self.doc.state(h).kind == StateKind::History(HistoryType::Deep);
                let recorded: Vec<StateHandle> = config
                    .iter()
                    .copied()
                    .filter(|&c| {
                        if deep {
                            self.doc.is_atomic(c) && self.doc.is_descendant(c, s)
                        } else {
                            self.doc.parent(c) == Some(s)
                        }
                    })
                    .collect();
                updates.push((h, recorded));
            }
        }
        updates
    }

    fn transition_exit_set(
        &self,
        config: &Configuration,
        history: &HistoryValues,
        t: TransitionHandle,
    ) -> BTreeSet<StateHandle> {
        if self.doc.transition(t).is_targetless() {
            return BTreeSet::new();
        }
        match self.transition_domain(history, t) {
            Some(domain) => config
                .iter()
                .copied()
                .filter(|&s| self.doc.is_descendant(s, domain))
                .collect(),
            None => BTreeSet::new(),
        }
    }

    fn transition_domain(&self, history: &HistoryValues, t: TransitionHandle) -> Option<StateHandle> {
        let node = self.doc.transition(t);
        let targets = self.effective_targets(history, t);
        if targets.is_empty() {
            return None;
        }
        if node.transition_type == TransitionType::Internal
            && self.doc.is_compound(node.source)
            && targets.iter().all(|&s| self.doc.is_descendant(s, node.source))
        {
            return Some(node.source);
        }
        let mut states = vec![node.source];
        states.extend(targets);
        Some(self.find_lcca(&states))
    }

    fn find_lcca(&self, states: &[StateHandle]) -> StateHandle {
        let Some((&head, tail)) = states.split_first() else {
            return StateHandle::ROOT;
        };
        self.doc
            .proper_ancestors(head, None)
            .into_iter()
            .filter(|&a| self.doc.is_compound(a))
            .find(|&a| tail.iter().all(|&s| self.doc.is_descendant(s, a)))
            .unwrap_or(StateHandle::ROOT)
    }

    fn effective_targets(&self, history: &HistoryValues, t: TransitionHandle) -> Vec<StateHandle> {
        let mut out = Vec::new();
        for &s in &self.doc.transition(t).targets {
            self.resolve_target(history, s, &mut out);
        }
        out
    }

    fn resolve_target(&self, history: &HistoryValues, s: StateHandle, out: &mut Vec<StateHandle>) {
        if !self.doc.is_history(s) {
            if !out.contains(&s) {
                out.push(s);
            }
            return;
        }
        if let Some(recorded) = history.get(&s) {
            for &r in recorded {
                if !out.contains(&r) {
                    out.push(r);
                }
            }
        } else if let Some(default) = self.doc.history_default(s) {
            for &target in &self.doc.transition(default).targets {
                self.resolve_target(history, target, out);
            }
        } else if let Some(first) = self.history_fallback(s) {
            if !out.contains(&first) {
                out.push(first);
            }
        }
    }

    /// Entry target of a history state with neither a record nor a default.
    fn history_fallback(&self, h: StateHandle) -> Option<StateHandle> {
        let parent = self.doc.parent(h)?;
        self.doc.child_states(parent).next()
    }

    fn add_descendants(&self, state: StateHandle, history: &HistoryValues, entry: &mut EntrySet) {
        if self.doc.is_history(state) {
            let parent = self.doc.parent(state).unwrap_or(StateHandle::ROOT);
            let targets: Vec<StateHandle> = if let Some(recorded) = history.get(&state) {
                recorded.clone()
            } else if let Some(default) = self.doc.history_default(state) {
                entry.history_content.insert(parent, default);
                self.doc.transition(default).targets.clone()
            } else {
                self.history_fallback(state).into_iter().collect()
            };
            for &s in &targets {
                self.add_descendants(s, history, entry);
            }
            for &s in &targets {
                self.add_ancestors(s, parent, history, entry);
            }
            return;
        }

        entry.states.insert(state);
        if self.doc.is_compound(state) {
            for &s in &self.doc.state(state).initial {
                self.add_descendants(s, history, entry);
                self.add_ancestors(s, state, history, entry);
            }
        } else if self.doc.is_parallel(state) {
            self.enter_regions(state, history, entry);
        }
    }

    fn add_ancestors(
        &self,
        state: StateHandle,
        ancestor: StateHandle,
        history: &HistoryValues,
        entry: &mut EntrySet,
    ) {
        for anc in self.doc.proper_ancestors(state, Some(ancestor)) {
            if anc == StateHandle::ROOT {
                continue;
            }
            entry.states.insert(anc);
            if self.doc.is_parallel(anc) {
                self.enter_regions(anc, history, entry);
            }
        }
    }

    fn enter_regions(&self, parallel: StateHandle, history: &HistoryValues, entry: &mut EntrySet) {
        let regions: Vec<StateHandle> = self.doc.child_states(parallel).collect();
        for region in regions {
            let covered = entry
                .states
                .iter()
                .any(|&s| s == region || self.doc.is_descendant(s, region));
            if !covered {
                self.add_descendants(region, history, entry);
            }
        }
    }
}
