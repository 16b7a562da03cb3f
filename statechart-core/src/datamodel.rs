//! Reference data model over a JSON context.
//!
//! - conditions use the [`guard`](crate::guard) language
//! - value expressions are JSON literals, `ctx.`/`_event.` field references,
//!   or guard expressions (yielding a boolean)
//! - `Assign` writes into `ctx.` locations, creating objects on the way
//! - `Script` is not supported

use crate::error::ExpressionError;
use crate::evaluator::{Evaluator, Scope};
use crate::guard::{Field, FieldRoot, GuardContext, GuardExpr};
use crate::model::Action;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// A data model holding a single JSON context object.
#[derive(Debug, Clone, Default)]
pub struct JsonDataModel {
    ctx: Value,
    guards: HashMap<String, GuardExpr>,
}

impl JsonDataModel {
    pub fn new(ctx: Value) -> Self {
        let ctx = if ctx.is_null() {
            Value::Object(Map::new())
        } else {
            ctx
        };
        Self {
            ctx,
            guards: HashMap::new(),
        }
    }

    pub fn context(&self) -> &Value {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Value {
        &mut self.ctx
    }

    /// Number of parsed guards kept in the cache.
    pub fn cached_guards(&self) -> usize {
        self.guards.len()
    }

    fn guard(&mut self, expr: &str) -> Result<&GuardExpr, ExpressionError> {
        if !self.guards.contains_key(expr) {
            let parsed = GuardExpr::parse(expr)?;
            self.guards.insert(expr.to_string(), parsed);
        }
        self.guards
            .get(expr)
            .ok_or_else(|| ExpressionError::new(expr, "guard cache miss"))
    }

    fn assign(&mut self, location: &str, value: Value) -> Result<(), ExpressionError> {
        let path = location
            .trim()
            .strip_prefix("ctx.")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ExpressionError::new(location, "location must start with 'ctx.'"))?;

        if !self.ctx.is_object() {
            self.ctx = Value::Object(Map::new());
        }

        let mut parts = path.split('.').peekable();
        let mut current = &mut self.ctx;
        while let Some(part) = parts.next() {
            let map = current.as_object_mut().ok_or_else(|| {
                ExpressionError::new(location, format!("cannot assign below non-object at '{}'", part))
            })?;
            if parts.peek().is_none() {
                map.insert(part.to_string(), value);
                return Ok(());
            }
            current = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        Ok(())
    }
}

/// What guards see while evaluated by this data model.
struct Env<'s> {
    ctx: &'s Value,
    event: Option<Value>,
    scope: &'s Scope<'s>,
}

impl<'s> Env<'s> {
    fn new(ctx: &'s Value, scope: &'s Scope<'s>) -> Self {
        let event = scope
            .event()
            .map(|e| serde_json::to_value(e).unwrap_or(Value::Null));
        Self { ctx, event, scope }
    }
}

impl GuardContext for Env<'_> {
    fn ctx(&self) -> &Value {
        self.ctx
    }

    fn event(&self) -> Option<&Value> {
        self.event.as_ref()
    }

    fn in_state(&self, id: &str) -> bool {
        self.scope.in_state(id)
    }
}

fn field_reference(expr: &str) -> Option<Field> {
    let (root, path) = if let Some(path) = expr.strip_prefix("ctx.") {
        (FieldRoot::Ctx, path)
    } else if let Some(path) = expr.strip_prefix("_event.") {
        (FieldRoot::Event, path)
    } else {
        return None;
    };

    let valid = !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.');
    valid.then(|| Field {
        root,
        path: path.to_string(),
    })
}

impl Evaluator for JsonDataModel {
    fn eval_cond(&mut self, scope: &Scope<'_>, expr: &str) -> Result<bool, ExpressionError> {
        let guard = self.guard(expr)?.clone();
        Ok(guard.evaluate(&Env::new(&self.ctx, scope)))
    }

    fn eval_expr(&mut self, scope: &Scope<'_>, expr: &str) -> Result<Value, ExpressionError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(ExpressionError::new(expr, "empty expression"));
        }

        if let Ok(literal) = serde_json::from_str::<Value>(trimmed) {
            return Ok(literal);
        }
        if let Some(field) = field_reference(trimmed) {
            return Ok(field.resolve(&Env::new(&self.ctx, scope)));
        }
        if let Some(quoted) = trimmed
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
        {
            return Ok(Value::String(quoted.to_string()));
        }

        self.eval_cond(scope, trimmed)
            .map(Value::Bool)
            .map_err(|e| ExpressionError::new(expr, format!("cannot evaluate: {}", e.message)))
    }

    fn exec_action(&mut self, scope: &Scope<'_>, action: &Action) -> Result<(), ExpressionError> {
        match action {
            Action::Assign { location, expr } => {
                let value = self.eval_expr(scope, expr)?;
                self.assign(location, value)
            }
            Action::Script { body } => Err(ExpressionError::new(
                body.as_str(),
                "script blocks are not supported by the JSON data model",
            )),
            Action::Log { .. } | Action::Raise { .. } | Action::If { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::model::{Document, NodeId};
    use crate::validate::validate;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn document() -> Document {
        let mut doc = Document::from_json(&json!({
            "states": [{"id": "A", "states": [{"id": "A1"}]}, {"id": "B"}]
        }))
        .unwrap();
        validate(&mut doc).unwrap();
        doc
    }

    fn active(doc: &Document) -> BTreeSet<NodeId> {
        ["A", "A1"].iter().filter_map(|id| doc.lookup(id)).collect()
    }

    #[test]
    fn test_conditions_are_cached() {
        let doc = document();
        let active = active(&doc);
        let events = vec![Event::new("go").with_data(json!({"n": 5}))];
        let scope = Scope::new(&doc, doc.lookup("A1").unwrap(), &events, &active);

        let mut dm = JsonDataModel::new(json!({"limit": 3}));
        assert!(dm.eval_cond(&scope, "_event.data.n > ctx.limit || In('A')").is_err());
        assert!(dm.eval_cond(&scope, "_event.data.n > 3 && In('A')").unwrap());
        assert!(dm.eval_cond(&scope, "_event.data.n > 3 && In('A')").unwrap());
        assert!(!dm.eval_cond(&scope, "In(\"B\")").unwrap());
        assert_eq!(dm.cached_guards(), 2);
    }

    #[test]
    fn test_eval_expr_forms() {
        let doc = document();
        let active = active(&doc);
        let events = vec![Event::new("go").with_data(json!({"who": "bob"}))];
        let scope = Scope::new(&doc, doc.lookup("A").unwrap(), &events, &active);

        let mut dm = JsonDataModel::new(json!({"count": 2, "nested": {"x": [1, 2]}}));
        assert_eq!(dm.eval_expr(&scope, "42").unwrap(), json!(42));
        assert_eq!(dm.eval_expr(&scope, "\"hi\"").unwrap(), json!("hi"));
        assert_eq!(dm.eval_expr(&scope, "'single'").unwrap(), json!("single"));
        assert_eq!(dm.eval_expr(&scope, "{\"a\": 1}").unwrap(), json!({"a": 1}));
        assert_eq!(dm.eval_expr(&scope, "ctx.nested.x").unwrap(), json!([1, 2]));
        assert_eq!(dm.eval_expr(&scope, "ctx.missing").unwrap(), Value::Null);
        assert_eq!(dm.eval_expr(&scope, "_event.name").unwrap(), json!("go"));
        assert_eq!(dm.eval_expr(&scope, "_event.data.who").unwrap(), json!("bob"));
        assert_eq!(dm.eval_expr(&scope, "ctx.count >= 2").unwrap(), json!(true));
        assert!(dm.eval_expr(&scope, "1 +").is_err());
        assert!(dm.eval_expr(&scope, "  ").is_err());
    }

    #[test]
    fn test_assign() {
        let doc = document();
        let active = active(&doc);
        let scope = Scope::new(&doc, doc.lookup("A").unwrap(), &[], &active);

        let mut dm = JsonDataModel::new(Value::Null);
        dm.exec_action(
            &scope,
            &Action::Assign {
                location: "ctx.order.total".to_string(),
                expr: "12.5".to_string(),
            },
        )
        .unwrap();
        dm.exec_action(
            &scope,
            &Action::Assign {
                location: "ctx.copy".to_string(),
                expr: "ctx.order".to_string(),
            },
        )
        .unwrap();

        assert_eq!(dm.context(), &json!({"order": {"total": 12.5}, "copy": {"total": 12.5}}));
    }

    #[test]
    fn test_assign_errors() {
        let doc = document();
        let active = active(&doc);
        let scope = Scope::new(&doc, doc.lookup("A").unwrap(), &[], &active);
        let mut dm = JsonDataModel::new(json!({"flag": true}));

        let bad_location = Action::Assign {
            location: "order.total".to_string(),
            expr: "1".to_string(),
        };
        assert!(dm.exec_action(&scope, &bad_location).is_err());

        let through_scalar = Action::Assign {
            location: "ctx.flag.inner".to_string(),
            expr: "1".to_string(),
        };
        assert!(dm.exec_action(&scope, &through_scalar).is_err());

        let script = Action::Script {
            body: "x = 1".to_string(),
        };
        let err = dm.exec_action(&scope, &script).unwrap_err();
        assert_eq!(err.expr, "x = 1");
    }
}
