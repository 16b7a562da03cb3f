//! Document definitions.
//!
//! Hosts describe a state chart with a serde tree and hand it to
//! [`Document::from_def`], which builds the unvalidated arena:
//!
//! ```json
//! {
//!   "name": "door",
//!   "initial": "closed",
//!   "states": [
//!     {"id": "closed", "transitions": [{"event": "open", "target": "opened"}]},
//!     {"id": "opened", "transitions": [{"event": "close", "target": "closed", "cond": "ctx.safe"}]}
//!   ]
//! }
//! ```

use crate::error::{CoreError, ModelError};
use crate::model::{Action, Document, HistoryDepth, Invoke, NodeId};
use serde::{Deserialize, Serialize};

/// Top-level document definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Whitespace-separated initial target ids. Defaults to the first state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    pub states: Vec<StateDef>,
}

/// A state, a final state or a parallel container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub parallel: bool,

    #[serde(default, rename = "final", skip_serializing_if = "is_false")]
    pub is_final: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    /// Actions of the initial transition.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_actions: Vec<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_entry: Vec<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_exit: Vec<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryDef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke: Option<Invoke>,
}

/// A transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,

    /// Whitespace-separated target ids. Absent for targetless transitions.
    #[serde(default, alias = "next", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

/// A history pseudostate and its default transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, rename = "type")]
    pub depth: HistoryDepth,

    /// Default target(s) used while no history has been recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Document {
    /// Builds an unvalidated document from a JSON definition.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        let def: DocumentDef = serde_json::from_value(json.clone())?;
        Ok(Self::from_def(&def)?)
    }

    /// Builds an unvalidated document from its definition.
    pub fn from_def(def: &DocumentDef) -> Result<Self, ModelError> {
        let mut doc = Document::new(def.name.clone());

        if let Some(initial) = &def.initial {
            doc.set_initial(Document::ROOT, initial, Vec::new());
        }
        for state in &def.states {
            add_state_def(&mut doc, Document::ROOT, state)?;
        }

        let json_bytes = serde_json::to_vec(def).unwrap_or_default();
        doc.set_checksum(format!("{:08x}", crc32c::crc32c(&json_bytes)));

        Ok(doc)
    }
}

fn add_state_def(doc: &mut Document, parent: NodeId, def: &StateDef) -> Result<(), ModelError> {
    let node = if def.parallel {
        if def.initial.is_some() {
            return Err(ModelError::ParallelInitial {
                parallel: def.id.clone().unwrap_or_default(),
            });
        }
        doc.add_parallel(parent, def.id.as_deref())
    } else {
        let node = doc.add_state(parent, def.id.as_deref(), def.is_final);
        if let Some(initial) = &def.initial {
            doc.set_initial(node, initial, def.initial_actions.clone());
        }
        node
    };

    doc.add_on_entry(node, def.on_entry.clone());
    doc.add_on_exit(node, def.on_exit.clone());

    for history in &def.history {
        let h = doc.add_history(node, history.id.as_deref(), history.depth);
        doc.set_history_default(h, history.target.as_deref(), history.actions.clone());
    }

    for t in &def.transitions {
        doc.add_transition(
            node,
            t.event.clone(),
            t.cond.clone(),
            t.target.clone(),
            t.actions.clone(),
        );
    }

    if let Some(invoke) = &def.invoke {
        doc.set_invoke(node, invoke.clone());
    }

    for child in &def.states {
        add_state_def(doc, node, child)?;
    }

    Ok(())
}
