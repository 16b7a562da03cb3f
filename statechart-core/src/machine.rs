//! Machine instance and macrostep driver.

use crate::config::InterpreterConfig;
use crate::definition::DocumentDef;
use crate::error::{CoreError, ErrorCode, ModelError};
use crate::evaluator::{ErrorReporter, Evaluator, Listener, TracingReporter};
use crate::event::{Event, EventQueue, EventSender};
use crate::invoke::{InvokeManager, Invoker};
use crate::model::{Document, NodeId, TransitionId};
use crate::semantics::{document_order, executor, resolver, selector, Runtime, Status, Step};
use crate::validate::validate;

/// Outcome of one macrostep.
#[derive(Debug, Clone, Default)]
pub struct Macrostep {
    /// Microsteps executed, including the final one that found nothing to do.
    pub microsteps: usize,
    /// Every event generated while processing, in order.
    pub events: Vec<Event>,
}

/// A running instance of a validated document.
///
/// The machine is single-threaded. Other threads reach it only through
/// [`EventSender`] handles, whose events wait in the inbox until the next
/// [`Machine::step`].
pub struct Machine<E: Evaluator> {
    pub(crate) doc: Document,
    pub(crate) evaluator: E,
    pub(crate) reporter: Box<dyn ErrorReporter>,
    pub(crate) listeners: Vec<Box<dyn Listener>>,
    pub(crate) invokes: InvokeManager,
    pub(crate) inbox: EventQueue,
    pub(crate) status: Status,
    pub(crate) started: bool,
    pub(crate) config: InterpreterConfig,
}

impl<E: Evaluator> Machine<E> {
    /// Creates a machine for a validated document.
    pub fn new(document: Document, evaluator: E) -> Result<Self, CoreError> {
        if !document.is_validated() {
            return Err(ModelError::NotValidated.into());
        }
        let config = InterpreterConfig::default();
        Ok(Self {
            doc: document,
            evaluator,
            reporter: Box::new(TracingReporter::new(config.verbose_errors)),
            listeners: Vec::new(),
            invokes: InvokeManager::default(),
            inbox: EventQueue::new(),
            status: Status::default(),
            started: false,
            config,
        })
    }

    /// Builds and validates a document definition, then creates a machine.
    pub fn load(def: &DocumentDef, evaluator: E) -> Result<Self, CoreError> {
        let mut document = Document::from_def(def)?;
        validate(&mut document)?;
        Self::new(document, evaluator)
    }

    /// Applies interpreter settings and installs a [`TracingReporter`] with
    /// the configured verbosity.
    pub fn with_config(mut self, config: InterpreterConfig) -> Self {
        self.reporter = Box::new(TracingReporter::new(config.verbose_errors));
        self.config = config;
        self
    }

    pub fn with_reporter(mut self, reporter: impl ErrorReporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn with_listener(mut self, listener: impl Listener + 'static) -> Self {
        self.listeners.push(Box::new(listener));
        self
    }

    /// Registers an invoker factory for an invoke type.
    pub fn with_invoker<F>(mut self, invoke_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Invoker> + 'static,
    {
        self.invokes.registry_mut().register(invoke_type, factory);
        self
    }

    /// Enters the initial configuration.
    ///
    /// Events pushed before the machine starts stay in the inbox for the
    /// first [`Machine::step`]. Calling `start` on a started machine does
    /// nothing.
    pub fn start(&mut self) -> Result<Macrostep, CoreError> {
        if self.started {
            return Ok(Macrostep::default());
        }
        let initial = self.doc.root().initial();
        let result = self.macrostep(initial)?;
        self.started = true;
        tracing::info!(
            document = self.doc.id_of(Document::ROOT),
            configuration = ?self.configuration(),
            "Machine started"
        );
        Ok(result)
    }

    /// Queues an external event for the next macrostep.
    pub fn push(&self, event: Event) {
        self.inbox.push(event);
    }

    /// A handle for queueing events from elsewhere.
    pub fn sender(&self) -> EventSender {
        self.inbox.sender()
    }

    /// Processes every queued event in one macrostep.
    ///
    /// On `IllegalConfiguration` the configuration, history and done flags
    /// from before the macrostep are put back. A machine in a final state
    /// ignores further steps.
    pub fn step(&mut self) -> Result<Macrostep, CoreError> {
        if !self.started {
            return Err(CoreError::NotStarted);
        }
        if self.status.is_final {
            return Ok(Macrostep::default());
        }
        self.macrostep(None)
    }

    /// Pushes an event and steps.
    pub fn fire(&mut self, event: Event) -> Result<Macrostep, CoreError> {
        self.push(event);
        self.step()
    }

    /// Cancels all invokers, forgets history and pending events, and enters
    /// the initial configuration again.
    pub fn reset(&mut self) -> Result<Macrostep, CoreError> {
        self.invokes.cancel_all(&self.doc, self.reporter.as_ref());
        self.status = Status::default();
        self.inbox.clear();
        self.started = false;
        self.start()
    }

    fn macrostep(&mut self, initial: Option<TransitionId>) -> Result<Macrostep, CoreError> {
        let saved = self.status.clone();
        let external = if initial.is_some() {
            Vec::new()
        } else {
            self.inbox.drain()
        };

        match self.run_microsteps(initial, external) {
            Ok(result) => Ok(result),
            Err(e) => {
                self.status = saved;
                let active = self.status.active(&self.doc);
                let mut ignored = Vec::new();
                self.invokes
                    .cancel_inactive(&self.doc, &active, self.reporter.as_ref(), &mut ignored);
                tracing::debug!(error = %e, "Macrostep rolled back");
                Err(e)
            }
        }
    }

    fn run_microsteps(
        &mut self,
        mut initial: Option<TransitionId>,
        external: Vec<Event>,
    ) -> Result<Macrostep, CoreError> {
        let doc = &self.doc;
        let reporter = self.reporter.as_ref();
        let sender = self.inbox.sender();
        let mut result = Macrostep::default();

        let mut failures = Vec::new();
        self.invokes.forward(doc, &external, reporter, &mut failures);
        let mut events = external;
        events.extend(failures);

        loop {
            if self.status.is_final {
                break;
            }
            if result.microsteps >= self.config.max_microsteps {
                reporter.on_error(
                    ErrorCode::MicrostepLimit,
                    &format!("stopped after {} microsteps", result.microsteps),
                    doc.id_of(Document::ROOT),
                );
                break;
            }

            let mut step = Step::new(self.status.leaves.clone(), std::mem::take(&mut events));
            let active = self.status.active(doc);
            let mut rt = Runtime {
                doc,
                evaluator: &mut self.evaluator,
                reporter,
                listeners: &mut self.listeners,
            };

            for node in self.invokes.finalizing(doc, &step.events) {
                if let Some(invoke) = doc.node(node).invoke() {
                    rt.run_actions(node, &invoke.finalize, &step.events, &active, &mut step.generated);
                }
            }

            match initial.take() {
                Some(t) => step.transit = vec![t],
                None => selector::select(&mut rt, &mut step),
            }
            resolver::resolve(doc, &mut step, &self.status.history, reporter)?;
            executor::execute(&mut rt, &mut step, &mut self.status, &mut self.invokes);

            let active = self.status.active(doc);
            self.invokes.start_pending(
                doc,
                &active,
                &step.events,
                &mut self.evaluator,
                reporter,
                &sender,
                &mut step.generated,
            );

            result.microsteps += 1;
            tracing::debug!(
                microstep = result.microsteps,
                transitions = step.transit.len(),
                exited = ?ids(doc, &step.exited),
                entered = ?ids(doc, &step.entered),
                generated = step.generated.len(),
                "Microstep"
            );

            let progressed = !step.transit.is_empty() || !step.generated.is_empty();
            result.events.extend(step.generated.iter().cloned());
            events = step.generated;
            if !progressed {
                break;
            }
        }

        Ok(result)
    }

    /// Active atomic states, in document order.
    pub fn configuration(&self) -> Vec<String> {
        ids(&self.doc, &document_order(&self.doc, self.status.leaves.iter().copied()))
    }

    /// Every active state, ancestors included, in document order.
    pub fn active_states(&self) -> Vec<String> {
        ids(&self.doc, &document_order(&self.doc, self.status.active(&self.doc)))
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.doc
            .lookup(id)
            .map(|node| self.status.active(&self.doc).contains(&node))
            .unwrap_or(false)
    }

    /// Whether a top-level final state has been entered.
    pub fn is_final(&self) -> bool {
        self.status.is_final
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether the final child of `id` (or of every region, for a
    /// parallel) has been entered since `id` was last entered.
    pub fn is_done(&self, id: &str) -> bool {
        self.doc
            .lookup(id)
            .map(|node| self.status.done.contains(&node))
            .unwrap_or(false)
    }

    /// States recorded by a history pseudostate, or `None` if it has not
    /// recorded anything yet.
    pub fn history(&self, id: &str) -> Option<Vec<String>> {
        let node = self.doc.lookup(id)?;
        self.status
            .history
            .get(&node)
            .map(|recorded| ids(&self.doc, recorded))
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn evaluator_mut(&mut self) -> &mut E {
        &mut self.evaluator
    }

    /// Number of events waiting in the inbox.
    pub fn pending_events(&self) -> usize {
        self.inbox.len()
    }

    /// Whether the state has a running invoker.
    pub fn has_invoker(&self, id: &str) -> bool {
        self.doc
            .lookup(id)
            .map(|node| self.invokes.has_handle(node))
            .unwrap_or(false)
    }

    /// Cancels the running invoker of a state. The state gets no new invoker
    /// until it is exited and entered again. A failed cancel queues
    /// `<id>.invoke.cancel.failed` for the next macrostep.
    ///
    /// Returns whether an invoker was running.
    pub fn cancel_invoke(&mut self, id: &str) -> bool {
        let Some(node) = self.doc.lookup(id) else {
            return false;
        };
        if !self.invokes.has_handle(node) {
            return false;
        }

        let mut failures = Vec::new();
        self.invokes
            .cancel_until_exit(&self.doc, node, self.reporter.as_ref(), &mut failures);
        for event in failures {
            self.inbox.push(event);
        }
        true
    }
}

impl<E: Evaluator> std::fmt::Debug for Machine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("document", &self.doc.id_of(Document::ROOT))
            .field("configuration", &self.configuration())
            .field("started", &self.started)
            .field("is_final", &self.status.is_final)
            .field("invokers", &self.invokes.handles())
            .finish()
    }
}

fn ids(doc: &Document, nodes: &[NodeId]) -> Vec<String> {
    nodes.iter().map(|n| doc.id_of(*n).to_string()).collect()
}
