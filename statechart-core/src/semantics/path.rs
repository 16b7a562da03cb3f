//! The path a transition takes through the state tree.

use crate::model::{Document, NodeId};

/// Route from a transition source to one of its targets.
///
/// The scope is the least common ancestor of source and target, moved one
/// level up when it coincides with either end. Everything below the scope on
/// the source side is left, everything below it on the target side is
/// entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Path {
    pub scope: NodeId,
    /// Source up to (excluding) the scope, nearest first.
    pub up: Vec<NodeId>,
    /// Below the scope down to the target, outermost first.
    pub down: Vec<NodeId>,
    /// Parallel regions on the upward segment.
    pub regions_exited: Vec<NodeId>,
    /// Parallel regions on the downward segment.
    pub regions_entered: Vec<NodeId>,
}

impl Path {
    pub(crate) fn new(doc: &Document, source: NodeId, target: NodeId) -> Self {
        let mut scope = doc.lca(source, target);
        if scope == source || scope == target {
            scope = doc.parent(scope).unwrap_or(Document::ROOT);
        }

        let up = segment(doc, source, scope);
        let mut down = segment(doc, target, scope);
        down.reverse();

        let regions_exited = up.iter().copied().filter(|n| doc.is_region(*n)).collect();
        let regions_entered = down.iter().copied().filter(|n| doc.is_region(*n)).collect();

        Self {
            scope,
            up,
            down,
            regions_exited,
            regions_entered,
        }
    }

    pub(crate) fn is_cross_region(&self) -> bool {
        !self.regions_exited.is_empty() || !self.regions_entered.is_empty()
    }

    /// The outermost state left by this path.
    pub(crate) fn top_exited(&self) -> Option<NodeId> {
        self.up.last().copied()
    }
}

/// `from` and its ancestors strictly below `scope`, nearest first.
fn segment(doc: &Document, from: NodeId, scope: NodeId) -> Vec<NodeId> {
    let mut result = Vec::new();
    let mut current = Some(from);
    while let Some(node) = current {
        if node == scope || node == Document::ROOT {
            break;
        }
        result.push(node);
        current = doc.parent(node);
    }
    result
}
