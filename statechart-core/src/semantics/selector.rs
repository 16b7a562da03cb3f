//! Transition selection.

use super::{closure, Runtime, Step};
use crate::error::ErrorCode;
use crate::evaluator::Scope;
use crate::event::Event;
use crate::model::{Document, NodeId, TransitionId};
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Whether a transition event pattern matches one of the events.
///
/// A pattern is a whitespace-separated list of descriptors: an exact name,
/// `*` (any event except completion events) or `prefix.*`. Eventless
/// transitions always match.
pub(crate) fn event_matches(pattern: Option<&str>, events: &[Event]) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    pattern
        .split_whitespace()
        .any(|descriptor| events.iter().any(|e| descriptor_matches(descriptor, e)))
}

fn descriptor_matches(descriptor: &str, event: &Event) -> bool {
    if descriptor == "*" {
        return !event.is_completion();
    }
    if let Some(prefix) = descriptor.strip_suffix('*') {
        if prefix.ends_with('.') {
            return event.name.starts_with(prefix);
        }
    }
    event.name == descriptor
}

/// Transitions reachable from the given leaves, breadth first up to the
/// root. Each state contributes its transitions once.
pub(crate) fn enumerate(doc: &Document, leaves: &BTreeSet<NodeId>) -> Vec<TransitionId> {
    let mut queue: VecDeque<NodeId> = super::document_order(doc, leaves.iter().copied()).into();
    let mut visited: HashSet<NodeId> = queue.iter().copied().collect();
    let mut result = Vec::new();

    while let Some(node) = queue.pop_front() {
        result.extend_from_slice(doc.node(node).transitions());
        if let Some(parent) = doc.parent(node) {
            if parent != Document::ROOT && visited.insert(parent) {
                queue.push_back(parent);
            }
        }
    }
    result
}

/// Fills `step.transit` with the transitions to take.
pub(crate) fn select(rt: &mut Runtime<'_>, step: &mut Step) {
    let doc = rt.doc;
    let active = closure(doc, &step.before);

    let mut enabled = Vec::new();
    for t in enumerate(doc, &step.before) {
        let transition = doc.transition(t);
        if !event_matches(transition.event(), &step.events) {
            continue;
        }
        if let Some(cond) = transition.cond() {
            let scope = Scope::new(doc, transition.source(), &step.events, &active);
            match rt.evaluator.eval_cond(&scope, cond) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    rt.reporter.on_error(
                        ErrorCode::ExpressionError,
                        &e.to_string(),
                        doc.id_of(transition.source()),
                    );
                    continue;
                }
            }
        }
        enabled.push(t);
    }

    step.transit = resolve_conflicts(doc, &enabled);
}

/// Drops transitions overridden by ones from more specific sources, then
/// keeps the first transition in document order per source among those
/// left in conflict. The result is in document order.
pub(crate) fn resolve_conflicts(doc: &Document, enabled: &[TransitionId]) -> Vec<TransitionId> {
    let mut removed = BTreeSet::new();
    let mut nondeterministic = BTreeSet::new();

    for (i, &t1) in enabled.iter().enumerate() {
        let s1 = doc.transition(t1).source();
        for &t2 in &enabled[i + 1..] {
            let s2 = doc.transition(t2).source();
            if doc.is_descendant(s2, s1) {
                removed.insert(t1);
                break;
            } else if doc.is_descendant(s1, s2) {
                removed.insert(t2);
            } else {
                nondeterministic.insert(t1);
                nondeterministic.insert(t2);
            }
        }
    }

    let mut result: Vec<TransitionId> = enabled
        .iter()
        .copied()
        .filter(|t| !removed.contains(t))
        .collect();
    result.sort_by_key(|t| doc.transition(*t).document_order());
    result.dedup();

    let mut sources = BTreeSet::new();
    result.retain(|t| !nondeterministic.contains(t) || sources.insert(doc.transition(*t).source()));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::JsonDataModel;
    use crate::error::ExpressionError;
    use crate::evaluator::{ErrorReporter, Evaluator, Listener};
    use crate::model::Action;
    use crate::validate::validate;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    #[derive(Default)]
    struct CollectingReporter {
        reports: Mutex<Vec<(ErrorCode, String)>>,
    }

    impl ErrorReporter for CollectingReporter {
        fn on_error(&self, code: ErrorCode, _detail: &str, source: &str) {
            self.reports.lock().push((code, source.to_string()));
        }
    }

    fn document(json: serde_json::Value) -> Document {
        let mut doc = Document::from_json(&json).unwrap();
        validate(&mut doc).unwrap();
        doc
    }

    fn leaves(doc: &Document, ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|id| doc.lookup(id).unwrap()).collect()
    }

    fn run_select(doc: &Document, before: &[&str], events: Vec<Event>, ctx: Value) -> Vec<String> {
        let mut dm = JsonDataModel::new(ctx);
        let reporter = CollectingReporter::default();
        let mut listeners: Vec<Box<dyn Listener>> = Vec::new();
        let mut rt = Runtime {
            doc,
            evaluator: &mut dm,
            reporter: &reporter,
            listeners: &mut listeners,
        };
        let mut step = Step::new(leaves(doc, before), events);
        select(&mut rt, &mut step);
        step.transit
            .iter()
            .map(|t| {
                let tr = doc.transition(*t);
                format!("{}->{}", doc.id_of(tr.source()), tr.next().unwrap_or(""))
            })
            .collect()
    }

    #[test]
    fn test_event_patterns() {
        let go = [Event::new("order.paid")];
        assert!(event_matches(None, &go));
        assert!(event_matches(Some("order.paid"), &go));
        assert!(event_matches(Some("order.*"), &go));
        assert!(event_matches(Some("*"), &go));
        assert!(event_matches(Some("other order.paid"), &go));
        assert!(!event_matches(Some("order"), &go));
        assert!(!event_matches(Some("ord.*"), &go));
        assert!(!event_matches(Some("order.paid.late"), &go));

        let done = [Event::completion("A.done")];
        assert!(!event_matches(Some("*"), &done));
        assert!(event_matches(Some("A.done"), &done));
        assert!(event_matches(Some("A.*"), &done));

        assert!(!event_matches(Some("anything"), &[]));
    }

    #[test]
    fn test_enumerate_walks_up_once() {
        let doc = document(json!({
            "states": [{
                "id": "P",
                "parallel": true,
                "transitions": [{"event": "p", "target": "P"}],
                "states": [
                    {"id": "R1", "transitions": [{"event": "r1"}], "states": [{"id": "S1"}]},
                    {"id": "R2", "states": [{"id": "S2", "transitions": [{"event": "s2"}]}]}
                ]
            }]
        }));

        let found = enumerate(&doc, &leaves(&doc, &["S1", "S2"]));
        let events: Vec<_> = found
            .iter()
            .map(|t| doc.transition(*t).event().unwrap_or_default())
            .collect();
        assert_eq!(events, vec!["s2", "r1", "p"]);
    }

    #[test]
    fn test_descendant_wins() {
        let doc = document(json!({
            "states": [
                {
                    "id": "A",
                    "transitions": [{"event": "e", "target": "B"}],
                    "states": [{"id": "A1", "transitions": [{"event": "e", "target": "A2"}]}, {"id": "A2"}]
                },
                {"id": "B"}
            ]
        }));

        let chosen = run_select(&doc, &["A1"], vec![Event::new("e")], json!({}));
        assert_eq!(chosen, vec!["A1->A2"]);
    }

    #[test]
    fn test_first_in_document_order_per_source() {
        let doc = document(json!({
            "states": [
                {
                    "id": "A",
                    "transitions": [
                        {"event": "e", "target": "B"},
                        {"event": "e", "target": "C"}
                    ]
                },
                {"id": "B"},
                {"id": "C"}
            ]
        }));

        let chosen = run_select(&doc, &["A"], vec![Event::new("e")], json!({}));
        assert_eq!(chosen, vec!["A->B"]);
    }

    #[test]
    fn test_parallel_regions_both_fire() {
        let doc = document(json!({
            "states": [{
                "id": "P",
                "parallel": true,
                "states": [
                    {"id": "R1", "states": [
                        {"id": "S1", "transitions": [{"event": "e", "target": "T1"}]},
                        {"id": "T1"}
                    ]},
                    {"id": "R2", "states": [
                        {"id": "S2", "transitions": [{"event": "e", "target": "T2"}]},
                        {"id": "T2"}
                    ]}
                ]
            }]
        }));

        let chosen = run_select(&doc, &["S1", "S2"], vec![Event::new("e")], json!({}));
        assert_eq!(chosen, vec!["S1->T1", "S2->T2"]);
    }

    #[test]
    fn test_guards_filter() {
        let doc = document(json!({
            "states": [
                {
                    "id": "A",
                    "transitions": [
                        {"event": "e", "cond": "ctx.big", "target": "B"},
                        {"event": "e", "target": "C"}
                    ]
                },
                {"id": "B"},
                {"id": "C"}
            ]
        }));

        let chosen = run_select(&doc, &["A"], vec![Event::new("e")], json!({"big": true}));
        assert_eq!(chosen, vec!["A->B"]);

        let chosen = run_select(&doc, &["A"], vec![Event::new("e")], json!({"big": false}));
        assert_eq!(chosen, vec!["A->C"]);
    }

    #[test]
    fn test_eventless_transitions_fire_without_events() {
        let doc = document(json!({
            "states": [
                {"id": "A", "transitions": [{"target": "B"}, {"event": "e", "target": "C"}]},
                {"id": "B"},
                {"id": "C"}
            ]
        }));

        let chosen = run_select(&doc, &["A"], vec![], json!({}));
        assert_eq!(chosen, vec!["A->B"]);
    }

    struct BrokenGuards;

    impl Evaluator for BrokenGuards {
        fn eval_cond(&mut self, _: &Scope<'_>, expr: &str) -> Result<bool, ExpressionError> {
            Err(ExpressionError::new(expr, "boom"))
        }

        fn eval_expr(&mut self, _: &Scope<'_>, _: &str) -> Result<Value, ExpressionError> {
            Ok(Value::Null)
        }

        fn exec_action(&mut self, _: &Scope<'_>, _: &Action) -> Result<(), ExpressionError> {
            Ok(())
        }
    }

    #[test]
    fn test_guard_error_is_reported_and_false() {
        let doc = document(json!({
            "states": [
                {
                    "id": "A",
                    "transitions": [
                        {"event": "e", "cond": "whatever", "target": "B"},
                        {"event": "e", "target": "C"}
                    ]
                },
                {"id": "B"},
                {"id": "C"}
            ]
        }));

        let reporter = CollectingReporter::default();
        let mut listeners: Vec<Box<dyn Listener>> = Vec::new();
        let mut rt = Runtime {
            doc: &doc,
            evaluator: &mut BrokenGuards,
            reporter: &reporter,
            listeners: &mut listeners,
        };
        let mut step = Step::new(leaves(&doc, &["A"]), vec![Event::new("e")]);
        select(&mut rt, &mut step);

        assert_eq!(step.transit.len(), 1);
        assert_eq!(doc.transition(step.transit[0]).next(), Some("C"));
        assert_eq!(
            *reporter.reports.lock(),
            vec![(ErrorCode::ExpressionError, "A".to_string())]
        );
    }
}
