//! Configuration resolution: exit sets, target expansion and legality.

use super::path::Path;
use super::{closure, entry_order, exit_order, Step};
use crate::error::{CoreError, ErrorCode};
use crate::evaluator::ErrorReporter;
use crate::model::{Document, NodeId, NodeKind};
use std::collections::{BTreeMap, BTreeSet};

/// Computes exit set, next configuration and entry set of `step`.
///
/// Nothing is executed here; an illegal result is reported and returned as
/// `IllegalConfiguration` before any content runs.
pub(crate) fn resolve(
    doc: &Document,
    step: &mut Step,
    history: &BTreeMap<NodeId, Vec<NodeId>>,
    reporter: &dyn ErrorReporter,
) -> Result<(), CoreError> {
    let before_all = closure(doc, &step.before);
    let mut paths = Vec::new();
    for &t in &step.transit {
        let transition = doc.transition(t);
        for &target in transition.targets() {
            paths.push(Path::new(doc, transition.source(), target));
        }
    }

    let exited = states_exited(doc, &before_all, &paths);
    let residual: BTreeSet<NodeId> = step
        .before
        .iter()
        .copied()
        .filter(|n| !exited.contains(n))
        .collect();

    let seed = seed_targets(doc, step, &residual, &paths);
    let after = expand(doc, step, residual, seed, history);
    check_legal(doc, &after, reporter)?;

    let after_all = closure(doc, &after);
    let entered = after_all
        .iter()
        .copied()
        .filter(|n| !before_all.contains(n) || exited.contains(n));

    step.entered = entry_order(doc, entered);
    step.exited = exit_order(doc, exited);
    step.after = after;
    Ok(())
}

/// Everything below the outermost state each path leaves, plus the contents
/// of every parallel whose region is left.
fn states_exited(doc: &Document, before_all: &BTreeSet<NodeId>, paths: &[Path]) -> BTreeSet<NodeId> {
    let mut exited = BTreeSet::new();
    for path in paths {
        if let Some(top) = path.top_exited() {
            exited.extend(
                before_all
                    .iter()
                    .copied()
                    .filter(|&s| s == top || doc.is_descendant(s, top)),
            );
        }
        for &region in &path.regions_exited {
            let Some(parallel) = doc.parent(region) else {
                continue;
            };
            exited.extend(
                before_all
                    .iter()
                    .copied()
                    .filter(|&s| doc.is_descendant(s, parallel)),
            );
        }
    }
    exited
}

/// Transition targets, plus the sibling regions of every region a path
/// enters that would otherwise stay inactive.
fn seed_targets(
    doc: &Document,
    step: &Step,
    residual: &BTreeSet<NodeId>,
    paths: &[Path],
) -> Vec<NodeId> {
    let mut seed: Vec<NodeId> = Vec::new();
    for &t in &step.transit {
        for &target in doc.transition(t).targets() {
            if !seed.contains(&target) {
                seed.push(target);
            }
        }
    }

    let covered = closure(doc, residual.iter().chain(seed.iter()));
    for path in paths.iter().filter(|p| p.is_cross_region()) {
        for &region in &path.regions_entered {
            let Some(parallel) = doc.parent(region) else {
                continue;
            };
            for &sibling in doc.node(parallel).children() {
                if !covered.contains(&sibling) && !seed.contains(&sibling) {
                    seed.push(sibling);
                }
            }
        }
    }

    // A deeper target decides the subtree of any seeded ancestor.
    let pinned: Vec<NodeId> = seed.iter().chain(residual.iter()).copied().collect();
    seed.retain(|&s| !pinned.iter().any(|&p| doc.is_descendant(p, s)));
    seed
}

/// Expands the seed down to atomic states, then enters every region of an
/// active parallel that nothing in the seed reached.
fn expand(
    doc: &Document,
    step: &mut Step,
    residual: BTreeSet<NodeId>,
    seed: Vec<NodeId>,
    history: &BTreeMap<NodeId, Vec<NodeId>>,
) -> BTreeSet<NodeId> {
    let mut leaves = residual;
    let mut work = seed;
    work.reverse();

    loop {
        expand_work(doc, step, &mut leaves, &mut work, history);

        let active = closure(doc, &leaves);
        work = active
            .iter()
            .filter(|n| doc.node(**n).is_parallel())
            .flat_map(|p| doc.node(*p).children().iter().copied())
            .filter(|region| !active.contains(region))
            .collect();
        if work.is_empty() {
            return leaves;
        }
        work.reverse();
    }
}

fn expand_work(
    doc: &Document,
    step: &mut Step,
    leaves: &mut BTreeSet<NodeId>,
    work: &mut Vec<NodeId>,
    history: &BTreeMap<NodeId, Vec<NodeId>>,
) {
    while let Some(node) = work.pop() {
        match doc.node(node).kind() {
            NodeKind::State { initial, .. } => {
                if doc.node(node).children().is_empty() {
                    leaves.insert(node);
                } else if let Some(t) = initial {
                    step.default_entries.insert(node);
                    work.extend(doc.transition(*t).targets().iter().rev());
                } else {
                    work.extend(doc.node(node).children().first());
                }
            }
            NodeKind::Parallel => {
                work.extend(doc.node(node).children().iter().rev());
            }
            NodeKind::History { transition, .. } => match history.get(&node) {
                Some(recorded) => work.extend(recorded.iter().rev()),
                None => {
                    if let Some(t) = transition {
                        let owner = doc.parent(node).unwrap_or(Document::ROOT);
                        step.history_defaults.entry(owner).or_default().push(*t);
                        work.extend(doc.transition(*t).targets().iter().rev());
                    }
                }
            },
            NodeKind::Root { .. } => {}
        }
    }
}

/// Checks the all-or-none rule for parallels and the at-most-one rule for
/// everything else. Each violation is reported before failing.
pub(crate) fn check_legal(
    doc: &Document,
    leaves: &BTreeSet<NodeId>,
    reporter: &dyn ErrorReporter,
) -> Result<(), CoreError> {
    let active = closure(doc, leaves);
    let mut counts: BTreeMap<NodeId, usize> = BTreeMap::new();
    for &node in &active {
        if let Some(parent) = doc.parent(node) {
            *counts.entry(parent).or_default() += 1;
        }
    }

    let mut violations: Vec<(NodeId, String)> = Vec::new();
    for &leaf in leaves {
        if !doc.node(leaf).is_atomic() {
            violations.push((leaf, format!("'{}' is not an atomic state", doc.id_of(leaf))));
        }
    }

    for node in std::iter::once(Document::ROOT).chain(active.iter().copied()) {
        let n = doc.node(node);
        let count = counts.get(&node).copied().unwrap_or(0);
        let problem = match n.kind() {
            NodeKind::Parallel if count != n.children().len() => Some(format!(
                "parallel '{}' has {} of {} regions active",
                n.id(),
                count,
                n.children().len()
            )),
            NodeKind::Root { .. } if count != 1 => {
                Some(format!("{} top-level states active", count))
            }
            NodeKind::State { .. } if !n.children().is_empty() && count != 1 => Some(format!(
                "composite '{}' has {} active children",
                n.id(),
                count
            )),
            _ => None,
        };
        if let Some(problem) = problem {
            violations.push((node, problem));
        }
    }

    if violations.is_empty() {
        return Ok(());
    }

    for (node, problem) in &violations {
        reporter.on_error(ErrorCode::IllegalConfiguration, problem, doc.id_of(*node));
    }
    let reason = violations
        .into_iter()
        .map(|(_, p)| p)
        .collect::<Vec<_>>()
        .join("; ");
    Err(CoreError::IllegalConfiguration { reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::TracingReporter;
    use crate::validate::validate;
    use parking_lot::Mutex;
    use serde_json::json;

    fn document() -> Document {
        let mut doc = Document::from_json(&json!({
            "states": [
                {
                    "id": "A",
                    "initial": "A1",
                    "history": [{"id": "Ah", "type": "deep", "target": "A1"}],
                    "transitions": [{"event": "leave", "target": "B"}],
                    "states": [
                        {"id": "A1", "transitions": [{"event": "e", "target": "A2"}]},
                        {"id": "A2", "states": [{"id": "A21"}, {"id": "A22"}]}
                    ]
                },
                {
                    "id": "B",
                    "transitions": [
                        {"event": "back", "target": "Ah"},
                        {"event": "par", "target": "S1b"}
                    ]
                },
                {
                    "id": "P",
                    "parallel": true,
                    "transitions": [{"event": "out", "target": "B"}],
                    "states": [
                        {"id": "R1", "states": [
                            {"id": "S1", "transitions": [{"event": "cross", "target": "S2b"}]},
                            {"id": "S1b"}
                        ]},
                        {"id": "R2", "states": [{"id": "S2"}, {"id": "S2b"}]}
                    ]
                }
            ]
        }))
        .unwrap();
        validate(&mut doc).unwrap();
        doc
    }

    fn node(doc: &Document, id: &str) -> NodeId {
        doc.lookup(id).unwrap()
    }

    fn set(doc: &Document, ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|id| node(doc, id)).collect()
    }

    fn names(doc: &Document, nodes: &[NodeId]) -> Vec<String> {
        nodes.iter().map(|n| doc.id_of(*n).to_string()).collect()
    }

    fn step_for(doc: &Document, before: &[&str], source: &str, event: &str) -> Step {
        let src = node(doc, source);
        let t = doc
            .node(src)
            .transitions()
            .iter()
            .copied()
            .find(|t| doc.transition(*t).event() == Some(event))
            .unwrap();
        let mut step = Step::new(set(doc, before), Vec::new());
        step.transit = vec![t];
        step
    }

    #[test]
    fn test_sibling_transition() {
        let doc = document();
        let mut step = step_for(&doc, &["A1"], "A1", "e");
        resolve(&doc, &mut step, &BTreeMap::new(), &TracingReporter::default()).unwrap();

        assert_eq!(names(&doc, &step.exited), vec!["A1"]);
        assert_eq!(names(&doc, &step.entered), vec!["A2", "A21"]);
        assert_eq!(step.after, set(&doc, &["A21"]));
        assert!(step.default_entries.contains(&node(&doc, "A2")));
    }

    #[test]
    fn test_exit_composite_deepest_first() {
        let doc = document();
        let mut step = step_for(&doc, &["A22"], "A", "leave");
        resolve(&doc, &mut step, &BTreeMap::new(), &TracingReporter::default()).unwrap();

        assert_eq!(names(&doc, &step.exited), vec!["A22", "A2", "A"]);
        assert_eq!(names(&doc, &step.entered), vec!["B"]);
    }

    #[test]
    fn test_history_default_and_record() {
        let doc = document();
        let ah = node(&doc, "Ah");

        let mut step = step_for(&doc, &["B"], "B", "back");
        resolve(&doc, &mut step, &BTreeMap::new(), &TracingReporter::default()).unwrap();
        assert_eq!(step.after, set(&doc, &["A1"]));
        assert_eq!(step.history_defaults.get(&node(&doc, "A")), Some(&vec![
            match doc.node(ah).kind() {
                NodeKind::History { transition: Some(t), .. } => *t,
                _ => unreachable!(),
            }
        ]));

        let mut history = BTreeMap::new();
        history.insert(ah, vec![node(&doc, "A22")]);
        let mut step = step_for(&doc, &["B"], "B", "back");
        resolve(&doc, &mut step, &history, &TracingReporter::default()).unwrap();
        assert_eq!(step.after, set(&doc, &["A22"]));
        assert_eq!(names(&doc, &step.entered), vec!["A", "A2", "A22"]);
        assert!(step.history_defaults.is_empty());
        assert!(step.default_entries.is_empty());
    }

    #[test]
    fn test_entering_one_region_enters_all() {
        let doc = document();
        let mut step = step_for(&doc, &["B"], "B", "par");
        resolve(&doc, &mut step, &BTreeMap::new(), &TracingReporter::default()).unwrap();

        assert_eq!(step.after, set(&doc, &["S1b", "S2"]));
        assert_eq!(names(&doc, &step.entered), vec!["P", "R1", "R2", "S1b", "S2"]);
    }

    #[test]
    fn test_cross_region_transition() {
        let doc = document();
        let mut step = step_for(&doc, &["S1", "S2"], "S1", "cross");
        resolve(&doc, &mut step, &BTreeMap::new(), &TracingReporter::default()).unwrap();

        assert_eq!(step.after, set(&doc, &["S1", "S2b"]));
        assert_eq!(names(&doc, &step.exited), vec!["S2", "S1", "R2", "R1"]);
        assert_eq!(names(&doc, &step.entered), vec!["R1", "R2", "S1", "S2b"]);
    }

    #[test]
    fn test_leaving_parallel_exits_all_regions() {
        let doc = document();
        let mut step = step_for(&doc, &["S1b", "S2b"], "P", "out");
        resolve(&doc, &mut step, &BTreeMap::new(), &TracingReporter::default()).unwrap();

        assert_eq!(names(&doc, &step.exited), vec!["S2b", "S1b", "R2", "R1", "P"]);
        assert_eq!(step.after, set(&doc, &["B"]));
    }

    #[test]
    fn test_targetless_transition_changes_nothing() {
        let mut doc = document();
        let a1 = node(&doc, "A1");
        let t = doc.add_transition(a1, Some("tick".to_string()), None, None, Vec::new());
        validate(&mut doc).unwrap();

        let mut step = Step::new(set(&doc, &["A1"]), Vec::new());
        step.transit = vec![t];
        resolve(&doc, &mut step, &BTreeMap::new(), &TracingReporter::default()).unwrap();

        assert!(step.exited.is_empty());
        assert!(step.entered.is_empty());
        assert_eq!(step.after, set(&doc, &["A1"]));
    }

    #[derive(Default)]
    struct CountingReporter {
        count: Mutex<usize>,
    }

    impl ErrorReporter for CountingReporter {
        fn on_error(&self, code: ErrorCode, _detail: &str, _source: &str) {
            assert_eq!(code, ErrorCode::IllegalConfiguration);
            *self.count.lock() += 1;
        }
    }

    #[test]
    fn test_legality() {
        let doc = document();
        let reporter = CountingReporter::default();

        assert!(check_legal(&doc, &set(&doc, &["A1"]), &reporter).is_ok());
        assert!(check_legal(&doc, &set(&doc, &["S1", "S2b"]), &reporter).is_ok());

        // One region missing.
        let err = check_legal(&doc, &set(&doc, &["S1"]), &reporter).unwrap_err();
        assert!(matches!(err, CoreError::IllegalConfiguration { .. }));

        // Two siblings in a composite, and two top-level states.
        let err = check_legal(&doc, &set(&doc, &["A1", "A21", "B"]), &reporter).unwrap_err();
        assert!(err.to_string().contains("top-level"));

        // Composite leaf.
        assert!(check_legal(&doc, &set(&doc, &["A2"]), &reporter).is_err());

        assert!(*reporter.count.lock() >= 4);
    }

    fn parallel_history_document(default: &str) -> Document {
        let mut doc = Document::from_json(&json!({
            "states": [
                {
                    "id": "P",
                    "parallel": true,
                    "history": [{"id": "Ph", "type": "deep", "target": default}],
                    "transitions": [{"event": "out", "target": "Z"}],
                    "states": [
                        {"id": "R1", "states": [{"id": "R1a"}, {"id": "R1b"}]},
                        {"id": "R2", "states": [{"id": "R2a"}, {"id": "R2b"}]}
                    ]
                },
                {"id": "Z", "transitions": [{"event": "back", "target": "Ph"}]}
            ]
        }))
        .unwrap();
        validate(&mut doc).unwrap();
        doc
    }

    #[test]
    fn test_parallel_history_record() {
        let doc = parallel_history_document("R1a R2a");
        let mut history = BTreeMap::new();
        history.insert(node(&doc, "Ph"), vec![node(&doc, "R1b"), node(&doc, "R2b")]);

        let mut step = step_for(&doc, &["Z"], "Z", "back");
        resolve(&doc, &mut step, &history, &TracingReporter::default()).unwrap();

        assert_eq!(step.after, set(&doc, &["R1b", "R2b"]));
        assert_eq!(names(&doc, &step.entered), vec!["P", "R1", "R2", "R1b", "R2b"]);
        assert!(step.default_entries.is_empty());
    }

    #[test]
    fn test_parallel_history_default_fills_regions() {
        let doc = parallel_history_document("R1b");
        let mut step = step_for(&doc, &["Z"], "Z", "back");
        resolve(&doc, &mut step, &BTreeMap::new(), &TracingReporter::default()).unwrap();

        assert_eq!(step.after, set(&doc, &["R1b", "R2a"]));
        assert!(step.default_entries.contains(&node(&doc, "R2")));
        assert!(!step.default_entries.contains(&node(&doc, "R1")));
    }
}
