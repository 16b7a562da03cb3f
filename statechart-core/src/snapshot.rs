//! Machine snapshots.
//!
//! A snapshot holds the configuration, history records and done flags of a
//! machine, keyed by stable client ids, together with the checksum of the
//! document it was taken from. The data model is not part of it; hosts
//! persist their evaluator state themselves.

use crate::error::CoreError;
use crate::evaluator::Evaluator;
use crate::machine::Machine;
use crate::model::{Document, NodeId};
use crate::semantics::{document_order, resolver, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Persistable state of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Root id of the document.
    pub document: String,

    /// Checksum of the document definition.
    pub checksum: String,

    /// Active atomic states.
    pub configuration: Vec<String>,

    /// History records by history id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub history: BTreeMap<String, Vec<String>>,

    /// States whose completion has been signalled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub done: Vec<String>,

    #[serde(default)]
    pub is_final: bool,

    /// Creation timestamp (Unix millis).
    pub created_at: i64,
}

impl Snapshot {
    pub fn from_json(value: &Value) -> Result<Self, CoreError> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_json(&self) -> Result<Value, CoreError> {
        Ok(serde_json::to_value(self)?)
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn names(doc: &Document, nodes: impl IntoIterator<Item = NodeId>) -> Vec<String> {
    document_order(doc, nodes)
        .into_iter()
        .map(|n| doc.id_of(n).to_string())
        .collect()
}

fn resolve_states(doc: &Document, ids: &[String]) -> Result<Vec<NodeId>, CoreError> {
    ids.iter()
        .map(|id| {
            doc.lookup(id)
                .filter(|n| doc.node(*n).is_state() || doc.node(*n).is_parallel())
                .ok_or_else(|| CoreError::InvalidSnapshot {
                    reason: format!("unknown state '{}'", id),
                })
        })
        .collect()
}

impl<E: Evaluator> Machine<E> {
    /// Captures the current configuration, history and done flags.
    pub fn snapshot(&self) -> Snapshot {
        let doc = &self.doc;
        let history = self
            .status
            .history
            .iter()
            .map(|(h, recorded)| {
                (
                    doc.id_of(*h).to_string(),
                    recorded.iter().map(|n| doc.id_of(*n).to_string()).collect(),
                )
            })
            .collect();

        Snapshot {
            document: doc.id_of(Document::ROOT).to_string(),
            checksum: doc.checksum().to_string(),
            configuration: names(doc, self.status.leaves.iter().copied()),
            history,
            done: names(doc, self.status.done.iter().copied()),
            is_final: self.status.is_final,
            created_at: now_millis(),
        }
    }

    /// Replaces the machine state with a snapshot of the same document.
    ///
    /// Running invokers are cancelled; invokers of the restored states start
    /// after the first microstep of the next macrostep. Pending events are
    /// kept.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<(), CoreError> {
        let doc = &self.doc;
        if snapshot.checksum != doc.checksum() {
            return Err(CoreError::InvalidSnapshot {
                reason: format!(
                    "checksum {} does not match document checksum {}",
                    snapshot.checksum,
                    doc.checksum()
                ),
            });
        }

        let leaves: BTreeSet<NodeId> = resolve_states(doc, &snapshot.configuration)?
            .into_iter()
            .collect();

        let mut history = BTreeMap::new();
        for (id, recorded) in &snapshot.history {
            let node = doc
                .lookup(id)
                .filter(|n| doc.node(*n).is_history())
                .ok_or_else(|| CoreError::InvalidSnapshot {
                    reason: format!("unknown history '{}'", id),
                })?;
            history.insert(node, resolve_states(doc, recorded)?);
        }

        let done = resolve_states(doc, &snapshot.done)?.into_iter().collect();

        resolver::check_legal(doc, &leaves, self.reporter.as_ref())?;

        self.invokes.cancel_all(&self.doc, self.reporter.as_ref());
        self.status = Status {
            leaves,
            history,
            done,
            is_final: snapshot.is_final,
        };
        self.started = true;
        tracing::info!(
            document = %snapshot.document,
            configuration = ?snapshot.configuration,
            "Machine restored"
        );
        Ok(())
    }
}
