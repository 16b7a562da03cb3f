//! # statechart-core
//!
//! Hierarchical and parallel state-chart interpreter with SCXML execution
//! semantics.
//!
//! This crate provides:
//! - Document model, definitions and validation
//! - Transition selection, configuration resolution and step execution
//! - History, completion events and the invoke lifecycle
//! - A reference JSON data model with a guard expression language
//! - Machine snapshots
//!
//! ```no_run
//! use statechart_core::{Event, JsonDataModel, Machine};
//! use serde_json::json;
//!
//! let def = serde_json::from_value(json!({
//!     "states": [
//!         {"id": "off", "transitions": [{"event": "toggle", "target": "on"}]},
//!         {"id": "on", "transitions": [{"event": "toggle", "target": "off"}]}
//!     ]
//! }))?;
//! let mut machine = Machine::load(&def, JsonDataModel::default())?;
//! machine.start()?;
//! machine.fire(Event::new("toggle"))?;
//! assert_eq!(machine.configuration(), vec!["on"]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod datamodel;
pub mod definition;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod guard;
pub mod invoke;
pub mod machine;
pub mod model;
mod semantics;
pub mod snapshot;
pub mod validate;

pub use config::{Config, ConfigError, InterpreterConfig, LoggingConfig};
pub use datamodel::JsonDataModel;
pub use definition::{DocumentDef, HistoryDef, StateDef, TransitionDef};
pub use error::{CoreError, ErrorCode, ExpressionError, InvokerError, ModelError};
pub use evaluator::{ErrorReporter, Evaluator, Listener, Scope, TracingReporter};
pub use event::{Event, EventKind, EventSender};
pub use guard::{GuardContext, GuardExpr};
pub use invoke::{InvokeContext, Invoker, InvokerRegistry};
pub use machine::{Machine, Macrostep};
pub use model::{Action, Document, HistoryDepth, Invoke, Node, NodeId, NodeKind, Param, Transition};
pub use snapshot::Snapshot;
pub use validate::validate;
