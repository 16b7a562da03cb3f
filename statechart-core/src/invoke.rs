//! Invoke lifecycle.
//!
//! States may declare an invoke: an external service started when the state
//! becomes active and cancelled when it is exited. Invokers are created by
//! type through an [`InvokerRegistry`] and talk back to the machine only
//! through an [`EventSender`].

use crate::error::{ErrorCode, InvokerError};
use crate::evaluator::{ErrorReporter, Evaluator, Scope};
use crate::event::{Event, EventSender};
use crate::model::{Document, NodeId};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Everything an invoker gets to know about its owner.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    /// Id of the owning state. Events the invoker sends back should be named
    /// `<state_id>.invoke.<name>` so they reach the finalize block and are not
    /// forwarded back to it.
    pub state_id: String,
    pub sender: EventSender,
}

/// An external service bound to a state.
pub trait Invoker {
    fn start(
        &mut self,
        ctx: InvokeContext,
        source: &str,
        params: &Map<String, Value>,
    ) -> Result<(), InvokerError>;

    /// Receives an external event processed by the machine.
    fn forward(&mut self, event: &Event) -> Result<(), InvokerError>;

    fn cancel(&mut self) -> Result<(), InvokerError>;

    /// Whether `event` runs the finalize block of `state_id` before
    /// transitions are selected. Defaults to events named
    /// `<state_id>.invoke.*`.
    fn await_finalize(&self, state_id: &str, event: &Event) -> bool {
        event.name.starts_with(&format!("{}.invoke.", state_id))
    }
}

type InvokerFactory = Box<dyn Fn() -> Box<dyn Invoker>>;

/// Invoker factories keyed by invoke type.
#[derive(Default)]
pub struct InvokerRegistry {
    factories: HashMap<String, InvokerFactory>,
}

impl InvokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, invoke_type: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Invoker> + 'static,
    {
        self.factories.insert(invoke_type.into(), Box::new(factory));
    }

    pub fn create(&self, invoke_type: &str) -> Result<Box<dyn Invoker>, InvokerError> {
        self.factories
            .get(invoke_type)
            .map(|factory| factory())
            .ok_or_else(|| InvokerError::UnknownType {
                invoke_type: invoke_type.to_string(),
            })
    }

    pub fn contains(&self, invoke_type: &str) -> bool {
        self.factories.contains_key(invoke_type)
    }
}

impl std::fmt::Debug for InvokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.factories.keys().collect();
        types.sort();
        f.debug_struct("InvokerRegistry").field("types", &types).finish()
    }
}

fn invoke_prefix(doc: &Document, node: NodeId) -> String {
    format!("{}.invoke.", doc.id_of(node))
}

fn value_to_source(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Active invoker handles of one machine, keyed by owning state.
#[derive(Debug, Default)]
pub(crate) struct InvokeManager {
    registry: InvokerRegistry,
    active: BTreeMap<NodeId, Box<dyn Invoker>>,
    /// Failed to start or cancelled explicitly; not started again until the
    /// state is exited.
    suppressed: BTreeSet<NodeId>,
}

impl std::fmt::Debug for dyn Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Invoker")
    }
}

impl InvokeManager {
    pub(crate) fn registry_mut(&mut self) -> &mut InvokerRegistry {
        &mut self.registry
    }

    pub(crate) fn has_handle(&self, node: NodeId) -> bool {
        self.active.contains_key(&node)
    }

    pub(crate) fn handles(&self) -> usize {
        self.active.len()
    }

    /// Starts invokers for active states that declare one and have no
    /// handle yet. Failures become `<id>.invoke.failed` events.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start_pending(
        &mut self,
        doc: &Document,
        active: &BTreeSet<NodeId>,
        events: &[Event],
        evaluator: &mut dyn Evaluator,
        reporter: &dyn ErrorReporter,
        sender: &EventSender,
        out: &mut Vec<Event>,
    ) {
        let mut pending: Vec<NodeId> = active
            .iter()
            .copied()
            .filter(|n| doc.node(*n).invoke().is_some())
            .filter(|n| !self.active.contains_key(n) && !self.suppressed.contains(n))
            .collect();
        pending.sort_by_key(|n| doc.node(*n).document_order());

        for node in pending {
            let Some(invoke) = doc.node(node).invoke() else {
                continue;
            };
            let state_id = doc.id_of(node);
            let scope = Scope::new(doc, node, events, active);

            let result = Self::prepare(invoke, &scope, evaluator).and_then(|(source, params)| {
                let mut invoker = self.registry.create(&invoke.invoke_type)?;
                let ctx = InvokeContext {
                    state_id: state_id.to_string(),
                    sender: sender.clone(),
                };
                invoker.start(ctx, &source, &params)?;
                Ok(invoker)
            });

            match result {
                Ok(invoker) => {
                    tracing::debug!(state = state_id, invoke_type = %invoke.invoke_type, "Invoker started");
                    self.active.insert(node, invoker);
                }
                Err(e) => {
                    reporter.on_error(ErrorCode::InvokeFailed, &e.to_string(), state_id);
                    out.push(Event::internal(format!("{}.invoke.failed", state_id)));
                    self.suppressed.insert(node);
                }
            }
        }
    }

    fn prepare(
        invoke: &crate::model::Invoke,
        scope: &Scope<'_>,
        evaluator: &mut dyn Evaluator,
    ) -> Result<(String, Map<String, Value>), InvokerError> {
        let start_error = |message: String| InvokerError::Start { reason: message };

        let source = match (&invoke.src, &invoke.srcexpr) {
            (Some(src), _) => src.clone(),
            (None, Some(expr)) => evaluator
                .eval_expr(scope, expr)
                .map(value_to_source)
                .map_err(|e| start_error(e.to_string()))?,
            (None, None) => return Err(start_error("no invoke source".to_string())),
        };

        let mut params = Map::new();
        for param in &invoke.params {
            let expr = param
                .expr
                .clone()
                .unwrap_or_else(|| format!("ctx.{}", param.name));
            let value = evaluator
                .eval_expr(scope, &expr)
                .map_err(|e| start_error(e.to_string()))?;
            params.insert(param.name.clone(), value);
        }

        Ok((source, params))
    }

    /// Cancels the invoker of `node`, if any.
    pub(crate) fn cancel(
        &mut self,
        doc: &Document,
        node: NodeId,
        reporter: &dyn ErrorReporter,
        out: &mut Vec<Event>,
    ) {
        self.suppressed.remove(&node);
        let Some(mut invoker) = self.active.remove(&node) else {
            return;
        };

        let state_id = doc.id_of(node);
        match invoker.cancel() {
            Ok(()) => tracing::debug!(state = state_id, "Invoker cancelled"),
            Err(e) => {
                reporter.on_error(ErrorCode::InvokeCancelFailed, &e.to_string(), state_id);
                out.push(Event::internal(format!("{}.invoke.cancel.failed", state_id)));
            }
        }
    }

    /// Cancels the invoker of `node` on request. The state gets no new
    /// invoker until it is exited.
    pub(crate) fn cancel_until_exit(
        &mut self,
        doc: &Document,
        node: NodeId,
        reporter: &dyn ErrorReporter,
        out: &mut Vec<Event>,
    ) {
        self.cancel(doc, node, reporter, out);
        self.suppressed.insert(node);
    }

    /// Cancels every invoker whose state is not in `active`.
    pub(crate) fn cancel_inactive(
        &mut self,
        doc: &Document,
        active: &BTreeSet<NodeId>,
        reporter: &dyn ErrorReporter,
        out: &mut Vec<Event>,
    ) {
        let stale: Vec<NodeId> = self
            .active
            .keys()
            .copied()
            .filter(|n| !active.contains(n))
            .collect();
        for node in stale {
            self.cancel(doc, node, reporter, out);
        }
        self.suppressed.retain(|n| active.contains(n));
    }

    pub(crate) fn cancel_all(&mut self, doc: &Document, reporter: &dyn ErrorReporter) {
        let mut ignored = Vec::new();
        self.cancel_inactive(doc, &BTreeSet::new(), reporter, &mut ignored);
    }

    /// Forwards external events to every invoker, except events addressed
    /// from that invoker. Failures become `error.communication` events.
    pub(crate) fn forward(
        &mut self,
        doc: &Document,
        events: &[Event],
        reporter: &dyn ErrorReporter,
        out: &mut Vec<Event>,
    ) {
        for (&node, invoker) in self.active.iter_mut() {
            let prefix = invoke_prefix(doc, node);
            for event in events.iter().filter(|e| !e.name.starts_with(&prefix)) {
                if let Err(e) = invoker.forward(event) {
                    reporter.on_error(ErrorCode::CommunicationError, &e.to_string(), doc.id_of(node));
                    out.push(Event::internal("error.communication"));
                }
            }
        }
    }

    /// States whose invoker awaits finalization for one of `events`, in
    /// document order. Their finalize blocks run before transitions are
    /// selected.
    pub(crate) fn finalizing(&self, doc: &Document, events: &[Event]) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .active
            .iter()
            .filter(|&(&node, invoker)| {
                let state_id = doc.id_of(node);
                events.iter().any(|e| invoker.await_finalize(state_id, e))
            })
            .map(|(&node, _)| node)
            .filter(|&node| {
                doc.node(node)
                    .invoke()
                    .map(|i| !i.finalize.is_empty())
                    .unwrap_or(false)
            })
            .collect();
        nodes.sort_by_key(|n| doc.node(*n).document_order());
        nodes
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::datamodel::JsonDataModel;
    use crate::error::ExpressionError;
    use crate::evaluator::TracingReporter;
    use crate::event::EventQueue;
    use crate::validate::validate;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    /// Invoker that records its lifecycle into a shared log.
    pub(crate) struct RecordingInvoker {
        pub log: Arc<Mutex<Vec<String>>>,
        pub fail_cancel: bool,
    }

    impl Invoker for RecordingInvoker {
        fn start(
            &mut self,
            ctx: InvokeContext,
            source: &str,
            params: &Map<String, Value>,
        ) -> Result<(), InvokerError> {
            self.log.lock().push(format!(
                "start {} {} {}",
                ctx.state_id,
                source,
                Value::Object(params.clone())
            ));
            Ok(())
        }

        fn forward(&mut self, event: &Event) -> Result<(), InvokerError> {
            self.log.lock().push(format!("forward {}", event.name));
            Ok(())
        }

        fn cancel(&mut self) -> Result<(), InvokerError> {
            self.log.lock().push("cancel".to_string());
            if self.fail_cancel {
                return Err(InvokerError::Cancel {
                    reason: "stuck".to_string(),
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingReporter {
        codes: Mutex<Vec<ErrorCode>>,
    }

    impl ErrorReporter for CollectingReporter {
        fn on_error(&self, code: ErrorCode, _detail: &str, _source: &str) {
            self.codes.lock().push(code);
        }
    }

    fn document() -> Document {
        let mut doc = Document::from_json(&json!({
            "states": [{
                "id": "work",
                "invoke": {
                    "type": "job",
                    "srcexpr": "ctx.url",
                    "params": [{"name": "retries", "expr": "3"}, {"name": "user"}],
                    "finalize": [{"action": "assign", "location": "ctx.got", "expr": "true"}]
                }
            }]
        }))
        .unwrap();
        validate(&mut doc).unwrap();
        doc
    }

    fn manager(log: &Arc<Mutex<Vec<String>>>, fail_cancel: bool) -> InvokeManager {
        let mut manager = InvokeManager::default();
        let log = Arc::clone(log);
        manager.registry_mut().register("job", move || {
            Box::new(RecordingInvoker {
                log: Arc::clone(&log),
                fail_cancel,
            }) as Box<dyn Invoker>
        });
        manager
    }

    #[test]
    fn test_start_forward_cancel() {
        let doc = document();
        let work = doc.lookup("work").unwrap();
        let active: BTreeSet<NodeId> = [work].into_iter().collect();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = manager(&log, false);
        let mut dm = JsonDataModel::new(json!({"url": "https://jobs/1", "user": "ann"}));
        let queue = EventQueue::new();
        let mut out = Vec::new();

        manager.start_pending(&doc, &active, &[], &mut dm, &TracingReporter::default(), &queue.sender(), &mut out);
        assert!(manager.has_handle(work));
        assert!(out.is_empty());

        // Starting again is a no-op while the handle exists.
        manager.start_pending(&doc, &active, &[], &mut dm, &TracingReporter::default(), &queue.sender(), &mut out);
        assert_eq!(manager.handles(), 1);

        let events = vec![Event::new("ping"), Event::new("work.invoke.done")];
        manager.forward(&doc, &events, &TracingReporter::default(), &mut out);
        assert_eq!(manager.finalizing(&doc, &events), vec![work]);
        assert!(manager.finalizing(&doc, &events[..1]).is_empty());

        manager.cancel_inactive(&doc, &BTreeSet::new(), &TracingReporter::default(), &mut out);
        assert!(!manager.has_handle(work));

        let log = log.lock();
        assert_eq!(
            *log,
            vec![
                "start work https://jobs/1 {\"retries\":3,\"user\":\"ann\"}".to_string(),
                "forward ping".to_string(),
                "cancel".to_string(),
            ]
        );
    }

    #[test]
    fn test_unknown_type_fails_once() {
        let doc = document();
        let work = doc.lookup("work").unwrap();
        let active: BTreeSet<NodeId> = [work].into_iter().collect();
        let mut manager = InvokeManager::default();
        let mut dm = JsonDataModel::new(json!({"url": "x"}));
        let reporter = CollectingReporter::default();
        let queue = EventQueue::new();
        let mut out = Vec::new();

        manager.start_pending(&doc, &active, &[], &mut dm, &reporter, &queue.sender(), &mut out);
        manager.start_pending(&doc, &active, &[], &mut dm, &reporter, &queue.sender(), &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "work.invoke.failed");
        assert!(out[0].is_internal());
        assert_eq!(*reporter.codes.lock(), vec![ErrorCode::InvokeFailed]);
    }

    #[test]
    fn test_cancel_failure_is_reported() {
        let doc = document();
        let work = doc.lookup("work").unwrap();
        let active: BTreeSet<NodeId> = [work].into_iter().collect();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = manager(&log, true);
        let mut dm = JsonDataModel::new(json!({"url": "x"}));
        let reporter = CollectingReporter::default();
        let queue = EventQueue::new();
        let mut out = Vec::new();

        manager.start_pending(&doc, &active, &[], &mut dm, &reporter, &queue.sender(), &mut out);
        manager.cancel(&doc, work, &reporter, &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "work.invoke.cancel.failed");
        assert_eq!(*reporter.codes.lock(), vec![ErrorCode::InvokeCancelFailed]);
    }

    struct FailingEvaluator;

    impl Evaluator for FailingEvaluator {
        fn eval_cond(&mut self, _: &Scope<'_>, expr: &str) -> Result<bool, ExpressionError> {
            Err(ExpressionError::new(expr, "unsupported"))
        }

        fn eval_expr(&mut self, _: &Scope<'_>, expr: &str) -> Result<Value, ExpressionError> {
            Err(ExpressionError::new(expr, "unsupported"))
        }

        fn exec_action(
            &mut self,
            _: &Scope<'_>,
            _: &crate::model::Action,
        ) -> Result<(), ExpressionError> {
            Ok(())
        }
    }

    #[test]
    fn test_srcexpr_failure_fails_invoke() {
        let doc = document();
        let work = doc.lookup("work").unwrap();
        let active: BTreeSet<NodeId> = [work].into_iter().collect();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = manager(&log, false);
        let queue = EventQueue::new();
        let mut out = Vec::new();

        manager.start_pending(
            &doc,
            &active,
            &[],
            &mut FailingEvaluator,
            &TracingReporter::default(),
            &queue.sender(),
            &mut out,
        );

        assert!(!manager.has_handle(work));
        assert_eq!(out[0].name, "work.invoke.failed");
        assert!(log.lock().is_empty());
    }

    /// Finalizes on `result.*` events instead of its own invoke events.
    struct ResultInvoker;

    impl Invoker for ResultInvoker {
        fn start(&mut self, _: InvokeContext, _: &str, _: &Map<String, Value>) -> Result<(), InvokerError> {
            Ok(())
        }

        fn forward(&mut self, _: &Event) -> Result<(), InvokerError> {
            Ok(())
        }

        fn cancel(&mut self) -> Result<(), InvokerError> {
            Ok(())
        }

        fn await_finalize(&self, _state_id: &str, event: &Event) -> bool {
            event.name.starts_with("result.")
        }
    }

    #[test]
    fn test_finalizing_asks_the_invoker() {
        let doc = document();
        let work = doc.lookup("work").unwrap();
        let active: BTreeSet<NodeId> = [work].into_iter().collect();
        let mut manager = InvokeManager::default();
        manager
            .registry_mut()
            .register("job", || Box::new(ResultInvoker) as Box<dyn Invoker>);
        let mut dm = JsonDataModel::new(json!({"url": "x"}));
        let queue = EventQueue::new();
        let mut out = Vec::new();

        manager.start_pending(&doc, &active, &[], &mut dm, &TracingReporter::default(), &queue.sender(), &mut out);
        assert!(manager.has_handle(work));

        assert_eq!(manager.finalizing(&doc, &[Event::new("result.ready")]), vec![work]);
        assert!(manager
            .finalizing(&doc, &[Event::new("work.invoke.done")])
            .is_empty());
    }

    #[test]
    fn test_cancel_until_exit() {
        let doc = document();
        let work = doc.lookup("work").unwrap();
        let active: BTreeSet<NodeId> = [work].into_iter().collect();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = manager(&log, false);
        let mut dm = JsonDataModel::new(json!({"url": "x"}));
        let queue = EventQueue::new();
        let mut out = Vec::new();

        manager.start_pending(&doc, &active, &[], &mut dm, &TracingReporter::default(), &queue.sender(), &mut out);
        manager.cancel_until_exit(&doc, work, &TracingReporter::default(), &mut out);
        manager.start_pending(&doc, &active, &[], &mut dm, &TracingReporter::default(), &queue.sender(), &mut out);
        assert!(!manager.has_handle(work));

        // Leaving the state lifts the block.
        manager.cancel_inactive(&doc, &BTreeSet::new(), &TracingReporter::default(), &mut out);
        manager.start_pending(&doc, &active, &[], &mut dm, &TracingReporter::default(), &queue.sender(), &mut out);
        assert!(manager.has_handle(work));
        assert!(out.is_empty());
    }
}
