//! Document model.
//!
//! A document is an arena of nodes addressed by [`NodeId`]. Parents own
//! their children through index lists; every node keeps its parent as an
//! index, which makes ancestry walks cheap without reference cycles.
//!
//! Node 0 is always the document root. The root is never part of a
//! configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Handle of a node in a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle of a transition in a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransitionId(pub(crate) u32);

impl TransitionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Whether a history pseudostate remembers direct children or leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryDepth {
    #[default]
    Shallow,
    Deep,
}

/// The kind of a transition target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// The document root.
    Root { initial: Option<TransitionId> },
    /// A simple or composite state.
    State {
        initial: Option<TransitionId>,
        is_final: bool,
    },
    /// A container whose children are all active together.
    Parallel,
    /// A history pseudostate with its default transition.
    History {
        depth: HistoryDepth,
        transition: Option<TransitionId>,
    },
}

/// Executable content attached to entry, exit, transitions and finalize blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Assign the value of `expr` to `location` in the data model.
    Assign { location: String, expr: String },
    /// Evaluate `expr` and log the result.
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        expr: String,
    },
    /// Queue an internal event.
    Raise { event: String },
    /// Conditional execution.
    If {
        cond: String,
        #[serde(default)]
        then: Vec<Action>,
        #[serde(default, rename = "else")]
        otherwise: Vec<Action>,
    },
    /// An opaque script block handed to the evaluator.
    Script { body: String },
}

/// A parameter passed to an invoker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
}

/// An external service bound to the lifetime of a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoke {
    /// Invoker type, used to pick the invoker factory.
    #[serde(rename = "type")]
    pub invoke_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srcexpr: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    /// Actions run when an event from this invoker arrives.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalize: Vec<Action>,
}

/// A node of the state tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) declared_id: Option<String>,
    pub(crate) id: String,
    pub(crate) client_id: String,
    pub(crate) kind: NodeKind,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) histories: Vec<NodeId>,
    pub(crate) transitions: Vec<TransitionId>,
    pub(crate) on_entry: Vec<Action>,
    pub(crate) on_exit: Vec<Action>,
    pub(crate) invoke: Option<Invoke>,
    pub(crate) document_order: u32,
    pub(crate) depth: u32,
}

impl Node {
    fn new(kind: NodeKind, declared_id: Option<String>, parent: Option<NodeId>, depth: u32) -> Self {
        Self {
            id: declared_id.clone().unwrap_or_default(),
            client_id: String::new(),
            declared_id,
            kind,
            parent,
            children: Vec::new(),
            histories: Vec::new(),
            transitions: Vec::new(),
            on_entry: Vec::new(),
            on_exit: Vec::new(),
            invoke: None,
            document_order: 0,
            depth,
        }
    }

    /// The effective id: the declared id, or the generated client id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The id as written in the document, if any.
    pub fn declared_id(&self) -> Option<&str> {
        self.declared_id.as_deref()
    }

    /// Stable, human-readable identifier assigned during validation.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Child states and parallels, in document order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn histories(&self) -> &[NodeId] {
        &self.histories
    }

    /// Outgoing transitions, in document order.
    pub fn transitions(&self) -> &[TransitionId] {
        &self.transitions
    }

    pub fn on_entry(&self) -> &[Action] {
        &self.on_entry
    }

    pub fn on_exit(&self) -> &[Action] {
        &self.on_exit
    }

    pub fn invoke(&self) -> Option<&Invoke> {
        self.invoke.as_ref()
    }

    pub fn document_order(&self) -> u32 {
        self.document_order
    }

    /// Distance from the root; top-level states have depth 1.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// The initial transition of the root or of a composite state.
    pub fn initial(&self) -> Option<TransitionId> {
        match self.kind {
            NodeKind::Root { initial } | NodeKind::State { initial, .. } => initial,
            NodeKind::Parallel | NodeKind::History { .. } => None,
        }
    }

    pub fn is_state(&self) -> bool {
        matches!(self.kind, NodeKind::State { .. })
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self.kind, NodeKind::Parallel)
    }

    pub fn is_history(&self) -> bool {
        matches!(self.kind, NodeKind::History { .. })
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, NodeKind::Root { .. })
    }

    pub fn is_final(&self) -> bool {
        matches!(self.kind, NodeKind::State { is_final: true, .. })
    }

    /// A state with no child states.
    pub fn is_atomic(&self) -> bool {
        self.is_state() && self.children.is_empty()
    }

    /// A state with child states.
    pub fn is_composite(&self) -> bool {
        self.is_state() && !self.children.is_empty()
    }
}

/// A transition between targets.
#[derive(Debug, Clone)]
pub struct Transition {
    pub(crate) source: NodeId,
    pub(crate) event: Option<String>,
    pub(crate) cond: Option<String>,
    pub(crate) next: Option<String>,
    pub(crate) targets: Vec<NodeId>,
    pub(crate) actions: Vec<Action>,
    pub(crate) document_order: u32,
}

impl Transition {
    /// The node that owns this transition.
    pub fn source(&self) -> NodeId {
        self.source
    }

    /// Event pattern; `None` for eventless transitions.
    pub fn event(&self) -> Option<&str> {
        self.event.as_deref()
    }

    /// Guard expression.
    pub fn cond(&self) -> Option<&str> {
        self.cond.as_deref()
    }

    /// Whitespace-separated target ids as declared.
    pub fn next(&self) -> Option<&str> {
        self.next.as_deref()
    }

    /// Resolved targets. Empty for targetless transitions.
    pub fn targets(&self) -> &[NodeId] {
        &self.targets
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn document_order(&self) -> u32 {
        self.document_order
    }

    /// The targets used at runtime: the declared targets, or the source for
    /// targetless transitions.
    pub fn runtime_targets(&self) -> Vec<NodeId> {
        if self.targets.is_empty() {
            vec![self.source]
        } else {
            self.targets.clone()
        }
    }
}

/// The state tree plus its transitions.
#[derive(Debug, Clone)]
pub struct Document {
    pub(crate) name: Option<String>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) transitions: Vec<Transition>,
    pub(crate) ids: HashMap<String, NodeId>,
    pub(crate) checksum: String,
    pub(crate) validated: bool,
}

impl Document {
    /// Handle of the document root.
    pub const ROOT: NodeId = NodeId(0);

    /// Creates an empty, unvalidated document.
    pub fn new(name: Option<String>) -> Self {
        let root = Node::new(NodeKind::Root { initial: None }, None, None, 0);
        Self {
            name,
            nodes: vec![root],
            transitions: Vec::new(),
            ids: HashMap::new(),
            checksum: String::new(),
            validated: false,
        }
    }

    // =========================================================================
    // Construction
    // =========================================================================

    fn push_node(&mut self, parent: NodeId, kind: NodeKind, id: Option<&str>) -> NodeId {
        let depth = self.nodes[parent.index()].depth + 1;
        let handle = NodeId(self.nodes.len() as u32);
        let is_history = matches!(kind, NodeKind::History { .. });
        self.nodes
            .push(Node::new(kind, id.map(str::to_string), Some(parent), depth));
        let parent_node = &mut self.nodes[parent.index()];
        if is_history {
            parent_node.histories.push(handle);
        } else {
            parent_node.children.push(handle);
        }
        self.validated = false;
        handle
    }

    /// Adds a state under `parent`.
    pub fn add_state(&mut self, parent: NodeId, id: Option<&str>, is_final: bool) -> NodeId {
        self.push_node(
            parent,
            NodeKind::State {
                initial: None,
                is_final,
            },
            id,
        )
    }

    /// Adds a parallel container under `parent`.
    pub fn add_parallel(&mut self, parent: NodeId, id: Option<&str>) -> NodeId {
        self.push_node(parent, NodeKind::Parallel, id)
    }

    /// Adds a history pseudostate under `parent`.
    pub fn add_history(&mut self, parent: NodeId, id: Option<&str>, depth: HistoryDepth) -> NodeId {
        self.push_node(
            parent,
            NodeKind::History {
                depth,
                transition: None,
            },
            id,
        )
    }

    fn push_transition(
        &mut self,
        source: NodeId,
        event: Option<String>,
        cond: Option<String>,
        next: Option<String>,
        actions: Vec<Action>,
    ) -> TransitionId {
        let handle = TransitionId(self.transitions.len() as u32);
        self.transitions.push(Transition {
            source,
            event: event.filter(|e| !e.trim().is_empty()),
            cond: cond.filter(|c| !c.trim().is_empty()),
            next: next.filter(|n| !n.trim().is_empty()),
            targets: Vec::new(),
            actions,
            document_order: 0,
        });
        self.validated = false;
        handle
    }

    /// Adds an outgoing transition to `source`.
    pub fn add_transition(
        &mut self,
        source: NodeId,
        event: Option<String>,
        cond: Option<String>,
        next: Option<String>,
        actions: Vec<Action>,
    ) -> TransitionId {
        let handle = self.push_transition(source, event, cond, next, actions);
        self.nodes[source.index()].transitions.push(handle);
        handle
    }

    /// Declares the initial target(s) of the root or of a state.
    ///
    /// Has no effect on parallels and history nodes; the model builder
    /// rejects those before getting here.
    pub fn set_initial(&mut self, node: NodeId, next: &str, actions: Vec<Action>) {
        let handle = self.push_transition(node, None, None, Some(next.to_string()), actions);
        match &mut self.nodes[node.index()].kind {
            NodeKind::Root { initial } | NodeKind::State { initial, .. } => *initial = Some(handle),
            NodeKind::Parallel | NodeKind::History { .. } => {}
        }
    }

    /// Declares the default transition of a history pseudostate.
    pub fn set_history_default(&mut self, history: NodeId, next: Option<&str>, actions: Vec<Action>) {
        let handle = self.push_transition(history, None, None, next.map(str::to_string), actions);
        if let NodeKind::History { transition, .. } = &mut self.nodes[history.index()].kind {
            *transition = Some(handle);
        }
    }

    pub fn add_on_entry(&mut self, node: NodeId, actions: Vec<Action>) {
        self.nodes[node.index()].on_entry.extend(actions);
    }

    pub fn add_on_exit(&mut self, node: NodeId, actions: Vec<Action>) {
        self.nodes[node.index()].on_exit.extend(actions);
    }

    pub fn set_invoke(&mut self, node: NodeId, invoke: Invoke) {
        self.nodes[node.index()].invoke = Some(invoke);
    }

    pub(crate) fn set_checksum(&mut self, checksum: String) {
        self.checksum = checksum;
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// crc32c of the definition this document was built from, if any.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn transition(&self, id: TransitionId) -> &Transition {
        &self.transitions[id.index()]
    }

    /// All node handles, root included, in construction order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    /// Resolves an effective id. Only populated after validation.
    pub fn lookup(&self, id: &str) -> Option<NodeId> {
        self.ids.get(id).copied()
    }

    // =========================================================================
    // Ancestry
    // =========================================================================

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent
    }

    /// Returns true if `node` is a proper descendant of `ancestor`.
    pub fn is_descendant(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut current = self.parent(node);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.parent(p);
        }
        false
    }

    /// Proper ancestors of `node`, nearest first, excluding the root.
    pub fn ancestors(&self, node: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut current = self.parent(node);
        while let Some(p) = current {
            if p == Self::ROOT {
                break;
            }
            result.push(p);
            current = self.parent(p);
        }
        result
    }

    /// Least common ancestor. Falls back to the root.
    pub fn lca(&self, a: NodeId, b: NodeId) -> NodeId {
        if a == b {
            return a;
        }
        if self.is_descendant(b, a) {
            return a;
        }
        let mut current = self.parent(a);
        while let Some(p) = current {
            if b == p || self.is_descendant(b, p) {
                return p;
            }
            current = self.parent(p);
        }
        Self::ROOT
    }

    /// A region is a child state or parallel of a parallel. History
    /// pseudostates of a parallel are not regions.
    pub fn is_region(&self, id: NodeId) -> bool {
        let node = &self.nodes[id.index()];
        if node.is_history() {
            return false;
        }
        self.parent(id)
            .map(|p| self.nodes[p.index()].is_parallel())
            .unwrap_or(false)
    }

    /// The effective id of a node, for messages.
    pub fn id_of(&self, id: NodeId) -> &str {
        &self.nodes[id.index()].id
    }
}
