//! Model validation.
//!
//! `validate` is the one-shot pass that turns a freshly built document into
//! an executable one. It assigns stable ids and document order, synthesizes
//! missing initial and history default transitions, resolves every target
//! reference and checks the structural rules of the state tree.

use crate::error::ModelError;
use crate::model::{Document, HistoryDepth, NodeId, NodeKind, TransitionId};
use std::collections::HashMap;

/// Validates and links a document in place.
///
/// On success the document is marked validated and every transition carries
/// resolved targets. On failure the document must be discarded.
pub fn validate(doc: &mut Document) -> Result<(), ModelError> {
    if doc.root().children().is_empty() {
        return Err(ModelError::EmptyDocument);
    }

    assign_ids(doc)?;
    synthesize_defaults(doc)?;
    assign_document_order(doc);
    resolve_root_initial(doc)?;

    let nodes: Vec<NodeId> = doc.node_ids().skip(1).collect();
    for node in nodes {
        check_node(doc, node)?;
    }

    doc.validated = true;
    tracing::info!(
        document = doc.id_of(Document::ROOT),
        states = doc.node_count() - 1,
        transitions = doc.transition_count(),
        "Document validated"
    );
    Ok(())
}

// =============================================================================
// Identifiers
// =============================================================================

fn kind_label(doc: &Document, node: NodeId) -> &'static str {
    match doc.node(node).kind() {
        NodeKind::State { is_final: true, .. } => "final",
        NodeKind::State { .. } => "state",
        NodeKind::Parallel => "parallel",
        NodeKind::History { .. } => "history",
        NodeKind::Root { .. } => "scxml",
    }
}

/// Assigns client ids top-down and rebuilds the id map.
///
/// Declared ids are kept as is. Anonymous nodes get
/// `<parent client id>:<kind><n>`, where `n` counts siblings of the same kind.
fn assign_ids(doc: &mut Document) -> Result<(), ModelError> {
    let root_id = doc.name().unwrap_or("scxml").to_string();
    doc.nodes[0].client_id = root_id.clone();
    doc.nodes[0].id = root_id;
    doc.ids.clear();

    let mut stack = vec![Document::ROOT];
    while let Some(parent) = stack.pop() {
        let parent_client = doc.node(parent).client_id().to_string();
        let members: Vec<NodeId> = doc
            .node(parent)
            .histories()
            .iter()
            .chain(doc.node(parent).children())
            .copied()
            .collect();

        let mut counters: HashMap<&'static str, u32> = HashMap::new();
        for member in members {
            let label = kind_label(doc, member);
            let n = counters.entry(label).or_insert(0);
            *n += 1;
            let generated = format!("{}:{}{}", parent_client, label, n);

            let node = &mut doc.nodes[member.index()];
            node.client_id = node.declared_id.clone().unwrap_or(generated);
            node.id = node.client_id.clone();

            if doc.ids.insert(node.id.clone(), member).is_some() {
                return Err(ModelError::DuplicateId {
                    id: node.id.clone(),
                });
            }
            stack.push(member);
        }
    }
    Ok(())
}

// =============================================================================
// Synthesized transitions
// =============================================================================

fn first_child_id(doc: &Document, node: NodeId) -> Option<String> {
    doc.node(node)
        .children()
        .first()
        .map(|c| doc.id_of(*c).to_string())
}

/// Fills in initial transitions of the root and composite states, and
/// history default transitions that declare no target.
fn synthesize_defaults(doc: &mut Document) -> Result<(), ModelError> {
    let nodes: Vec<NodeId> = doc.node_ids().collect();

    for &node in &nodes {
        let n = doc.node(node);
        let needs_initial = (n.is_root() || n.is_composite()) && n.initial().is_none();
        if needs_initial {
            if let Some(first) = first_child_id(doc, node) {
                doc.set_initial(node, &first, Vec::new());
            }
        }
    }

    for &node in &nodes {
        let (owner, transition) = match doc.node(node).kind() {
            NodeKind::History { transition, .. } => match doc.parent(node) {
                Some(owner) => (owner, *transition),
                None => continue,
            },
            _ => continue,
        };

        let declared = transition.and_then(|t| doc.transition(t).next().map(str::to_string));
        if declared.is_some() {
            continue;
        }

        let fallback = doc
            .node(owner)
            .initial()
            .and_then(|t| doc.transition(t).next().map(str::to_string))
            .ok_or_else(|| ModelError::HistoryNoDefault {
                history: doc.id_of(node).to_string(),
                state: doc.id_of(owner).to_string(),
            })?;

        match transition {
            Some(t) => doc.transitions[t.index()].next = Some(fallback),
            None => doc.set_history_default(node, Some(&fallback), Vec::new()),
        }
    }
    Ok(())
}

// =============================================================================
// Document order
// =============================================================================

/// Numbers nodes and transitions depth-first: a node, its history children
/// and their default transitions, its initial transition, its outgoing
/// transitions, then its child states.
fn assign_document_order(doc: &mut Document) {
    fn visit(doc: &mut Document, node: NodeId, order: &mut u32) {
        doc.nodes[node.index()].document_order = *order;
        *order += 1;

        for history in doc.node(node).histories().to_vec() {
            doc.nodes[history.index()].document_order = *order;
            *order += 1;
            if let NodeKind::History {
                transition: Some(t),
                ..
            } = *doc.node(history).kind()
            {
                doc.transitions[t.index()].document_order = *order;
                *order += 1;
            }
        }

        if let Some(t) = doc.node(node).initial() {
            doc.transitions[t.index()].document_order = *order;
            *order += 1;
        }

        for t in doc.node(node).transitions().to_vec() {
            doc.transitions[t.index()].document_order = *order;
            *order += 1;
        }

        for child in doc.node(node).children().to_vec() {
            visit(doc, child, order);
        }
    }

    let mut order = 0;
    visit(doc, Document::ROOT, &mut order);
}

// =============================================================================
// Resolution and structural checks
// =============================================================================

fn resolve(doc: &Document, next: &str) -> Result<Vec<NodeId>, String> {
    next.split_whitespace()
        .map(|id| doc.lookup(id).ok_or_else(|| id.to_string()))
        .collect()
}

fn resolve_root_initial(doc: &mut Document) -> Result<(), ModelError> {
    let Some(t) = doc.root().initial() else {
        return Err(ModelError::EmptyDocument);
    };
    let next = doc.transition(t).next().unwrap_or_default().to_string();
    let targets = resolve(doc, &next).map_err(|_| ModelError::NoInitialState {
        initial: next.clone(),
    })?;
    if targets.is_empty() {
        return Err(ModelError::NoInitialState { initial: next });
    }
    check_legal_targets(doc, Document::ROOT, &next, &targets)?;
    doc.transitions[t.index()].targets = targets;
    Ok(())
}

fn check_node(doc: &mut Document, node: NodeId) -> Result<(), ModelError> {
    let id = doc.id_of(node).to_string();

    match doc.node(node).kind().clone() {
        NodeKind::State { initial, .. } => {
            if doc.node(node).children().is_empty() && !doc.node(node).histories().is_empty() {
                return Err(ModelError::HistorySimpleState { state: id });
            }
            if let Some(t) = initial {
                resolve_initial(doc, node, t)?;
            }
        }
        NodeKind::Parallel => {
            for &region in doc.node(node).children() {
                if doc.node(region).is_atomic() {
                    return Err(ModelError::AtomicRegion {
                        parallel: id,
                        region: doc.id_of(region).to_string(),
                    });
                }
            }
        }
        NodeKind::History { depth, transition } => {
            return resolve_history(doc, node, depth, transition);
        }
        NodeKind::Root { .. } => {}
    }

    if let Some(invoke) = doc.node(node).invoke() {
        if invoke.invoke_type.trim().is_empty() {
            return Err(ModelError::MissingInvokeType { state: id });
        }
        match (&invoke.src, &invoke.srcexpr) {
            (Some(_), Some(_)) => return Err(ModelError::AmbiguousInvokeSource { state: id }),
            (None, None) => return Err(ModelError::MissingInvokeSource { state: id }),
            _ => {}
        }
    }

    for t in doc.node(node).transitions().to_vec() {
        let Some(next) = doc.transition(t).next().map(str::to_string) else {
            continue;
        };
        let targets = resolve(doc, &next).map_err(|target| ModelError::TargetNotFound { target })?;
        check_legal_targets(doc, node, &next, &targets)?;
        doc.transitions[t.index()].targets = targets;
    }

    Ok(())
}

fn resolve_initial(doc: &mut Document, state: NodeId, t: TransitionId) -> Result<(), ModelError> {
    let bad = || ModelError::BadInitialState {
        state: doc.id_of(state).to_string(),
    };
    let next = doc.transition(t).next().unwrap_or_default().to_string();
    let targets = resolve(doc, &next).map_err(|_| bad())?;
    if targets.is_empty() || targets.iter().any(|&x| !doc.is_descendant(x, state)) {
        return Err(bad());
    }
    check_legal_targets(doc, state, &next, &targets)?;
    doc.transitions[t.index()].targets = targets;
    Ok(())
}

fn resolve_history(
    doc: &mut Document,
    history: NodeId,
    depth: HistoryDepth,
    transition: Option<TransitionId>,
) -> Result<(), ModelError> {
    let owner = doc.parent(history).unwrap_or(Document::ROOT);
    let history_id = doc.id_of(history).to_string();
    let owner_id = doc.id_of(owner).to_string();

    let Some(t) = transition else {
        return Err(ModelError::HistoryNoDefault {
            history: history_id,
            state: owner_id,
        });
    };
    let next = doc.transition(t).next().unwrap_or_default().to_string();
    let targets = resolve(doc, &next).map_err(|target| ModelError::TargetNotFound { target })?;
    if targets.is_empty() {
        return Err(ModelError::HistoryNoDefault {
            history: history_id,
            state: owner_id,
        });
    }

    for &target in &targets {
        match depth {
            HistoryDepth::Shallow if doc.parent(target) != Some(owner) => {
                return Err(ModelError::BadShallowHistory {
                    history: history_id,
                    state: owner_id,
                });
            }
            HistoryDepth::Deep if !doc.is_descendant(target, owner) => {
                return Err(ModelError::BadDeepHistory {
                    history: history_id,
                    state: owner_id,
                });
            }
            _ => {}
        }
    }

    check_legal_targets(doc, history, &next, &targets)?;
    doc.transitions[t.index()].targets = targets;
    Ok(())
}

/// A set of targets is legal when no target is an ancestor of another and
/// every pair meets in a parallel.
fn check_legal_targets(
    doc: &Document,
    source: NodeId,
    next: &str,
    targets: &[NodeId],
) -> Result<(), ModelError> {
    for (i, &a) in targets.iter().enumerate() {
        for &b in &targets[i + 1..] {
            let related = a == b || doc.is_descendant(a, b) || doc.is_descendant(b, a);
            if related || !doc.node(doc.lca(a, b)).is_parallel() {
                return Err(ModelError::IllegalTransitionTargets {
                    state: doc.id_of(source).to_string(),
                    next: next.to_string(),
                });
            }
        }
    }
    Ok(())
}
