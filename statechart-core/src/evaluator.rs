//! Boundaries to the host: expression evaluation, error reporting and
//! observation.

use crate::error::{ErrorCode, ExpressionError};
use crate::event::Event;
use crate::model::{Action, Document, NodeId};
use serde_json::Value;
use std::collections::BTreeSet;

/// The context an expression is evaluated in: the state that owns it, the
/// events of the current microstep and the active configuration.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    document: &'a Document,
    state: NodeId,
    events: &'a [Event],
    active: &'a BTreeSet<NodeId>,
}

impl<'a> Scope<'a> {
    pub fn new(
        document: &'a Document,
        state: NodeId,
        events: &'a [Event],
        active: &'a BTreeSet<NodeId>,
    ) -> Self {
        Self {
            document,
            state,
            events,
            active,
        }
    }

    pub fn document(&self) -> &'a Document {
        self.document
    }

    pub fn state(&self) -> NodeId {
        self.state
    }

    pub fn state_id(&self) -> &'a str {
        self.document.id_of(self.state)
    }

    pub fn events(&self) -> &'a [Event] {
        self.events
    }

    /// The event being processed: the first one of the microstep.
    pub fn event(&self) -> Option<&'a Event> {
        self.events.first()
    }

    /// Whether the state with the given id is active.
    pub fn in_state(&self, id: &str) -> bool {
        self.document
            .lookup(id)
            .map(|node| self.active.contains(&node))
            .unwrap_or(false)
    }
}

/// Expression evaluator and action executor of a data model.
///
/// Every call may fail with an [`ExpressionError`]; the machine reports the
/// failure and carries on.
pub trait Evaluator {
    /// Evaluates a guard condition.
    fn eval_cond(&mut self, scope: &Scope<'_>, expr: &str) -> Result<bool, ExpressionError>;

    /// Evaluates a value expression.
    fn eval_expr(&mut self, scope: &Scope<'_>, expr: &str) -> Result<Value, ExpressionError>;

    /// Executes `Assign` and `Script` actions. `Raise`, `If` and `Log` are
    /// handled by the machine and never reach this method.
    fn exec_action(&mut self, scope: &Scope<'_>, action: &Action) -> Result<(), ExpressionError>;
}

/// Receives non-fatal conditions.
pub trait ErrorReporter {
    /// `source` is the id of the state, invoker or document involved.
    fn on_error(&self, code: ErrorCode, detail: &str, source: &str);
}

/// Logs reports through `tracing`.
///
/// Production mode keeps details at debug level; verbose mode logs them
/// with the warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter {
    verbose: bool,
}

impl TracingReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ErrorReporter for TracingReporter {
    fn on_error(&self, code: ErrorCode, detail: &str, source: &str) {
        if self.verbose {
            tracing::warn!(code = %code, source, detail, "Statechart error");
        } else {
            tracing::warn!(code = %code, source, "Statechart error");
            tracing::debug!(code = %code, source, detail, "Statechart error detail");
        }
    }
}

/// Observes state entries, exits and taken transitions.
pub trait Listener {
    fn on_entry(&mut self, _state: &str) {}

    fn on_exit(&mut self, _state: &str) {}

    /// Called once per target of a taken transition. `event` is the
    /// transition's event pattern, `None` for eventless transitions.
    fn on_transition(&mut self, _source: &str, _target: &str, _event: Option<&str>) {}
}
