//! Execution semantics.
//!
//! One microstep runs through three stages:
//!
//! 1. [`selector`] enumerates the transitions reachable from the active
//!    leaves, filters them by event and guard and resolves conflicts.
//! 2. [`resolver`] computes the exit set and expands the targets into the
//!    next configuration, rejecting illegal ones before anything runs.
//! 3. [`executor`] runs exit, transition and entry content in order, emits
//!    completion events and records history.
//!
//! Configurations are stored as sets of atomic leaves; the active states are
//! the leaves plus their ancestors (see [`closure`]).

pub(crate) mod executor;
pub(crate) mod path;
pub(crate) mod resolver;
pub(crate) mod selector;

use crate::event::Event;
use crate::evaluator::{ErrorReporter, Evaluator, Listener};
use crate::model::{Document, NodeId, TransitionId};
use std::collections::{BTreeMap, BTreeSet};

/// Mutable state of one machine instance.
#[derive(Debug, Clone, Default)]
pub(crate) struct Status {
    /// Active atomic states.
    pub leaves: BTreeSet<NodeId>,
    /// Last recorded configuration per history pseudostate.
    pub history: BTreeMap<NodeId, Vec<NodeId>>,
    /// States whose final child has been entered.
    pub done: BTreeSet<NodeId>,
    /// A top-level final state has been entered.
    pub is_final: bool,
}

impl Status {
    pub(crate) fn active(&self, doc: &Document) -> BTreeSet<NodeId> {
        closure(doc, &self.leaves)
    }
}

/// Ephemeral record of one microstep.
#[derive(Debug, Default)]
pub(crate) struct Step {
    pub before: BTreeSet<NodeId>,
    /// External events first, then the internal events being processed.
    pub events: Vec<Event>,
    pub transit: Vec<TransitionId>,
    /// Deepest first.
    pub exited: Vec<NodeId>,
    /// Shallowest first.
    pub entered: Vec<NodeId>,
    pub after: BTreeSet<NodeId>,
    /// Composite states entered through their initial transition.
    pub default_entries: BTreeSet<NodeId>,
    /// History default transitions taken, keyed by the history's owner.
    pub history_defaults: BTreeMap<NodeId, Vec<TransitionId>>,
    /// Events generated while executing this microstep.
    pub generated: Vec<Event>,
}

impl Step {
    pub(crate) fn new(before: BTreeSet<NodeId>, events: Vec<Event>) -> Self {
        Self {
            before,
            events,
            ..Self::default()
        }
    }
}

/// The collaborators a microstep calls into.
pub(crate) struct Runtime<'a> {
    pub doc: &'a Document,
    pub evaluator: &'a mut dyn Evaluator,
    pub reporter: &'a dyn ErrorReporter,
    pub listeners: &'a mut [Box<dyn Listener>],
}

/// The given states plus all their ancestors, root excluded.
pub(crate) fn closure<'a>(
    doc: &Document,
    states: impl IntoIterator<Item = &'a NodeId>,
) -> BTreeSet<NodeId> {
    let mut result = BTreeSet::new();
    for &state in states {
        if state == Document::ROOT || !result.insert(state) {
            continue;
        }
        for ancestor in doc.ancestors(state) {
            if !result.insert(ancestor) {
                break;
            }
        }
    }
    result
}

/// Exit order: deepest first, reverse document order among equals.
pub(crate) fn exit_order(doc: &Document, states: impl IntoIterator<Item = NodeId>) -> Vec<NodeId> {
    let mut sorted: Vec<NodeId> = states.into_iter().collect();
    sorted.sort_by_key(|n| {
        let node = doc.node(*n);
        std::cmp::Reverse((node.depth(), node.document_order()))
    });
    sorted
}

/// Entry order: shallowest first, document order among equals.
pub(crate) fn entry_order(doc: &Document, states: impl IntoIterator<Item = NodeId>) -> Vec<NodeId> {
    let mut sorted: Vec<NodeId> = states.into_iter().collect();
    sorted.sort_by_key(|n| {
        let node = doc.node(*n);
        (node.depth(), node.document_order())
    });
    sorted
}

/// Sorts by document order.
pub(crate) fn document_order(doc: &Document, states: impl IntoIterator<Item = NodeId>) -> Vec<NodeId> {
    let mut sorted: Vec<NodeId> = states.into_iter().collect();
    sorted.sort_by_key(|n| doc.node(*n).document_order());
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::validate;
    use serde_json::json;

    fn document() -> Document {
        let mut doc = Document::from_json(&json!({
            "states": [
                {"id": "A", "states": [{"id": "A1", "states": [{"id": "A11"}]}, {"id": "A2"}]},
                {"id": "B"}
            ]
        }))
        .unwrap();
        validate(&mut doc).unwrap();
        doc
    }

    fn ids(doc: &Document, nodes: &[NodeId]) -> Vec<String> {
        nodes.iter().map(|n| doc.id_of(*n).to_string()).collect()
    }

    #[test]
    fn test_closure_adds_ancestors() {
        let doc = document();
        let leaves: BTreeSet<NodeId> = [doc.lookup("A11").unwrap(), doc.lookup("B").unwrap()]
            .into_iter()
            .collect();

        let all = closure(&doc, &leaves);
        let names = ids(&doc, &document_order(&doc, all));
        assert_eq!(names, vec!["A", "A1", "A11", "B"]);
    }

    #[test]
    fn test_exit_and_entry_order() {
        let doc = document();
        let states: Vec<NodeId> = ["A2", "A", "A11", "A1"]
            .iter()
            .map(|id| doc.lookup(id).unwrap())
            .collect();

        let exit = ids(&doc, &exit_order(&doc, states.clone()));
        assert_eq!(exit, vec!["A11", "A2", "A1", "A"]);

        let entry = ids(&doc, &entry_order(&doc, states));
        assert_eq!(entry, vec!["A", "A1", "A2", "A11"]);
    }
}
