//! Microstep execution: exit, transition and entry content, completion
//! events and history recording.

use super::{closure, document_order, Runtime, Status, Step};
use crate::error::{ErrorCode, ExpressionError};
use crate::evaluator::Scope;
use crate::event::Event;
use crate::invoke::InvokeManager;
use crate::model::{Action, Document, HistoryDepth, NodeId, NodeKind};
use serde_json::Value;
use std::collections::BTreeSet;

impl Runtime<'_> {
    /// Runs a block of executable content in the scope of `state`.
    ///
    /// The first expression error stops the block: it is reported and an
    /// `error.execution` event is queued. Returns whether the block ran to
    /// completion.
    pub(crate) fn run_actions(
        &mut self,
        state: NodeId,
        actions: &[Action],
        events: &[Event],
        active: &BTreeSet<NodeId>,
        out: &mut Vec<Event>,
    ) -> bool {
        let doc = self.doc;
        for action in actions {
            let scope = Scope::new(doc, state, events, active);
            let result = match action {
                Action::Raise { event } => {
                    out.push(Event::internal(event.trim()));
                    Ok(())
                }
                Action::If {
                    cond,
                    then,
                    otherwise,
                } => match self.evaluator.eval_cond(&scope, cond) {
                    Ok(branch) => {
                        let block = if branch { then } else { otherwise };
                        if !self.run_actions(state, block, events, active, out) {
                            return false;
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                Action::Log { label, expr } => self.evaluator.eval_expr(&scope, expr).map(|value| {
                    let rendered = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    tracing::info!(
                        target: "statechart::log",
                        state = doc.id_of(state),
                        label = label.as_deref().unwrap_or(""),
                        "{}",
                        rendered
                    );
                }),
                Action::Assign { .. } | Action::Script { .. } => {
                    self.evaluator.exec_action(&scope, action)
                }
            };

            if let Err(e) = result {
                self.execution_failed(state, &e, out);
                return false;
            }
        }
        true
    }

    fn execution_failed(&self, state: NodeId, error: &ExpressionError, out: &mut Vec<Event>) {
        self.reporter
            .on_error(ErrorCode::ExpressionError, &error.to_string(), self.doc.id_of(state));
        out.push(Event::internal("error.execution"));
    }
}

/// Executes a resolved microstep and commits its configuration to `status`.
pub(crate) fn execute(
    rt: &mut Runtime<'_>,
    step: &mut Step,
    status: &mut Status,
    invokes: &mut InvokeManager,
) {
    let doc = rt.doc;
    let before_all = closure(doc, &step.before);
    let after_all = closure(doc, &step.after);

    for &state in &step.exited {
        let id = doc.id_of(state);
        invokes.cancel(doc, state, rt.reporter, &mut step.generated);
        rt.run_actions(state, doc.node(state).on_exit(), &step.events, &before_all, &mut step.generated);
        for listener in rt.listeners.iter_mut() {
            listener.on_exit(id);
        }
        step.generated.push(Event::completion(format!("{}.exit", id)));

        if doc.node(state).is_final() {
            leave_final(doc, state, status);
        }
    }

    for &t in &step.transit {
        let transition = doc.transition(t);
        let source = transition.source();
        rt.run_actions(source, transition.actions(), &step.events, &before_all, &mut step.generated);
        for target in transition.runtime_targets() {
            for listener in rt.listeners.iter_mut() {
                listener.on_transition(doc.id_of(source), doc.id_of(target), transition.event());
            }
        }
    }

    for &state in &step.entered {
        let node = doc.node(state);
        let id = node.id();
        status.done.remove(&state);

        rt.run_actions(state, node.on_entry(), &step.events, &after_all, &mut step.generated);
        for listener in rt.listeners.iter_mut() {
            listener.on_entry(id);
        }
        step.generated.push(Event::completion(format!("{}.entry", id)));

        if step.default_entries.contains(&state) {
            if let Some(t) = node.initial() {
                let actions = doc.transition(t).actions();
                rt.run_actions(state, actions, &step.events, &after_all, &mut step.generated);
            }
        }
        if let Some(defaults) = step.history_defaults.get(&state) {
            for &t in defaults {
                let actions = doc.transition(t).actions();
                rt.run_actions(state, actions, &step.events, &after_all, &mut step.generated);
            }
        }

        if node.is_final() {
            enter_final(doc, state, status, &mut step.generated);
        }
    }

    record_history(doc, step, status);
    status.leaves = std::mem::take(&mut step.after);
}

fn enter_final(doc: &Document, state: NodeId, status: &mut Status, out: &mut Vec<Event>) {
    let parent = match doc.parent(state) {
        Some(parent) if parent != Document::ROOT => parent,
        _ => {
            status.is_final = true;
            tracing::info!(state = doc.id_of(state), "Machine reached a final state");
            return;
        }
    };

    out.push(Event::completion(format!("{}.done", doc.id_of(parent))));
    status.done.insert(parent);

    if doc.is_region(parent) {
        if let Some(parallel) = doc.parent(parent) {
            let all_done = doc
                .node(parallel)
                .children()
                .iter()
                .all(|region| status.done.contains(region));
            if all_done && status.done.insert(parallel) {
                out.push(Event::completion(format!("{}.done", doc.id_of(parallel))));
            }
        }
    }
}

/// A parent whose final child is left is no longer done, and neither is
/// the parallel owning it as a region.
fn leave_final(doc: &Document, state: NodeId, status: &mut Status) {
    let Some(parent) = doc.parent(state) else {
        return;
    };
    status.done.remove(&parent);
    if doc.is_region(parent) {
        if let Some(parallel) = doc.parent(parent) {
            status.done.remove(&parallel);
        }
    }
}

/// Snapshots the pre-step configuration into the histories of every exited
/// state that owns one.
fn record_history(doc: &Document, step: &Step, status: &mut Status) {
    let before_all = closure(doc, &step.before);
    for &state in &step.exited {
        for &history in doc.node(state).histories() {
            let NodeKind::History { depth, .. } = doc.node(history).kind() else {
                continue;
            };
            let recorded: Vec<NodeId> = match depth {
                HistoryDepth::Deep => document_order(
                    doc,
                    step.before
                        .iter()
                        .copied()
                        .filter(|&leaf| doc.is_descendant(leaf, state)),
                ),
                HistoryDepth::Shallow => document_order(
                    doc,
                    doc.node(state)
                        .children()
                        .iter()
                        .copied()
                        .filter(|child| before_all.contains(child)),
                ),
            };
            status.history.insert(history, recorded);
        }
    }
}
