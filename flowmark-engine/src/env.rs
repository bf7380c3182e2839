// ABOUTME: Variable Environment (C1) — dot/index path resolution over inputs,
// ABOUTME: variables, and stepMetadata, per spec §4.1

use flowmark_core::ExecutionContext;
use serde_json::Value;

/// One segment of a resolved path: either a map key or a sequence index.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Splits `a.b[0].c` into `[Key(a), Key(b), Index(0), Key(c)]`.
fn parse_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                let mut idx = String::new();
                for c2 in chars.by_ref() {
                    if c2 == ']' {
                        break;
                    }
                    idx.push(c2);
                }
                if let Ok(n) = idx.trim().parse::<usize>() {
                    segments.push(Segment::Index(n));
                } else {
                    // Not a numeric index: treat the bracketed content as a string key.
                    segments.push(Segment::Key(idx.trim().to_string()));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Key(current));
    }
    segments
}

/// Walks `value` following `segments`. Numeric segments only act as array
/// indices when the carrier at that point is actually a sequence; against a
/// mapping, a numeric-looking key is used as a string key (spec §4.1
/// invariant).
fn walk<'a>(value: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        current = match (current, segment) {
            (Value::Array(arr), Segment::Index(i)) => arr.get(*i)?,
            (Value::Array(_), Segment::Key(_)) => return None,
            (Value::Object(map), Segment::Index(i)) => map.get(&i.to_string())?,
            (Value::Object(map), Segment::Key(k)) => map.get(k)?,
            _ => return None,
        };
    }
    Some(current)
}

fn lookup_map(map: &std::collections::HashMap<String, Value>, segments: &[Segment]) -> Option<Value> {
    let Some((first, rest)) = segments.split_first() else {
        return None;
    };
    let Segment::Key(key) = first else {
        return None;
    };
    let root = map.get(key)?;
    if rest.is_empty() {
        Some(root.clone())
    } else {
        walk(root, rest).cloned()
    }
}

/// Thin view over an `ExecutionContext` implementing the C1 resolution order
/// from spec §4.1: `inputs.`-prefixed paths strip and look up directly in
/// `inputs`; otherwise probe `variables`; then bare `inputs`; then
/// `stepMetadata`; then the context object itself (`workflowId`, `runId`,
/// `status`, ...). Any miss along the walk is `None`, never an error.
pub struct Environment<'a> {
    ctx: &'a ExecutionContext,
}

impl<'a> Environment<'a> {
    pub fn new(ctx: &'a ExecutionContext) -> Self {
        Self { ctx }
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        if let Some(rest) = path.strip_prefix("inputs.") {
            let segments = parse_path(rest);
            return lookup_map(&self.ctx.inputs, &segments);
        }

        let segments = parse_path(path);
        if segments.is_empty() {
            return None;
        }

        if let Some(v) = lookup_map(&self.ctx.variables, &segments) {
            return Some(v);
        }
        if let Some(v) = lookup_map(&self.ctx.inputs, &segments) {
            return Some(v);
        }
        if let Segment::Key(key) = &segments[0] {
            if let Some(meta) = self.ctx.step_metadata.get(key) {
                let meta_value = serde_json::to_value(meta).ok()?;
                return if segments.len() == 1 {
                    Some(meta_value)
                } else {
                    walk(&meta_value, &segments[1..]).cloned()
                };
            }
        }

        self.probe_context_object(&segments)
    }

    fn probe_context_object(&self, segments: &[Segment]) -> Option<Value> {
        let Segment::Key(key) = &segments[0] else {
            return None;
        };
        let value = match key.as_str() {
            "workflowId" | "workflow_id" => Value::String(self.ctx.workflow_id.clone()),
            "runId" | "run_id" => Value::String(self.ctx.run_id.clone()),
            "status" => Value::String(format!("{:?}", self.ctx.status).to_lowercase()),
            "currentStepIndex" | "current_step_index" => {
                Value::from(self.ctx.current_step_index)
            }
            _ => return None,
        };
        if segments.len() == 1 {
            Some(value)
        } else {
            walk(&value, &segments[1..]).cloned()
        }
    }
}

/// Mutating helpers, kept separate from the read-only `Environment` view
/// because sets/deletes always target `variables` specifically (spec §4.1).
pub fn set(ctx: &mut ExecutionContext, name: &str, value: Value) {
    ctx.variables.insert(name.to_string(), value);
}

pub fn delete(ctx: &mut ExecutionContext, name: &str) {
    ctx.variables.remove(name);
}

/// Scoped binding helper (spec §9 "Scoped acquisition"): snapshots whatever
/// `variables[name]` held before each key in the scope was bound, so `exit`
/// can restore it (or remove the key if it didn't exist before). Does not
/// hold a borrow of the context — callers `enter` before running scoped
/// child steps and `exit` unconditionally afterward (on the success path
/// *and* the failure path), which is how loop/catch variable hygiene (spec
/// §3 invariant 3, §8 P7) survives `?`-propagated errors across `.await`
/// points without fighting the borrow checker over a held `&mut` guard.
pub struct LoopScope {
    previous: Vec<(String, Option<Value>)>,
}

impl LoopScope {
    /// Binds every `(name, value)` pair, recording what was there before.
    pub fn enter(ctx: &mut ExecutionContext, bindings: Vec<(String, Value)>) -> Self {
        let mut previous = Vec::with_capacity(bindings.len());
        for (name, value) in bindings {
            let prior = ctx.variables.insert(name.clone(), value);
            previous.push((name, prior));
        }
        Self { previous }
    }

    /// Restores every binding to its pre-`enter` state. Must be called on
    /// every exit path of the scope, success or failure.
    pub fn exit(self, ctx: &mut ExecutionContext) {
        for (name, prior) in self.previous {
            match prior {
                Some(v) => {
                    ctx.variables.insert(name, v);
                }
                None => {
                    ctx.variables.remove(&name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx_with(variables: Vec<(&str, Value)>, inputs: Vec<(&str, Value)>) -> ExecutionContext {
        let mut ctx = ExecutionContext::new("wf".into(), "run".into(), HashMap::new());
        for (k, v) in inputs {
            ctx.inputs.insert(k.to_string(), v);
        }
        for (k, v) in variables {
            ctx.variables.insert(k.to_string(), v);
        }
        ctx
    }

    #[test]
    fn resolves_nested_dot_and_index_path() {
        let ctx = ctx_with(
            vec![(
                "user",
                serde_json::json!({"tags": ["a", "b"], "profile": {"age": 30}}),
            )],
            vec![],
        );
        let env = Environment::new(&ctx);
        assert_eq!(env.get("user.tags[1]"), Some(Value::String("b".into())));
        assert_eq!(env.get("user.profile.age"), Some(Value::from(30)));
    }

    #[test]
    fn numeric_key_against_map_is_string_key_not_index() {
        let ctx = ctx_with(
            vec![("obj", serde_json::json!({"0": "zero"}))],
            vec![],
        );
        let env = Environment::new(&ctx);
        assert_eq!(env.get("obj[0]"), Some(Value::String("zero".into())));
    }

    #[test]
    fn inputs_prefix_strips_and_looks_up_inputs() {
        let ctx = ctx_with(vec![], vec![("channel", Value::String("general".into()))]);
        let env = Environment::new(&ctx);
        assert_eq!(
            env.get("inputs.channel"),
            Some(Value::String("general".into()))
        );
    }

    #[test]
    fn bare_path_falls_back_to_inputs_when_not_a_variable() {
        let ctx = ctx_with(vec![], vec![("channel", Value::String("general".into()))]);
        let env = Environment::new(&ctx);
        assert_eq!(env.get("channel"), Some(Value::String("general".into())));
    }

    #[test]
    fn missing_path_is_none_not_an_error() {
        let ctx = ctx_with(vec![], vec![]);
        let env = Environment::new(&ctx);
        assert_eq!(env.get("nowhere.at.all"), None);
    }

    #[test]
    fn step_metadata_is_probed_after_variables_and_inputs() {
        let mut ctx = ctx_with(vec![], vec![]);
        ctx.record_step_metadata("a", flowmark_core::StepStatus::Failed, 2, Some("boom".into()));
        let env = Environment::new(&ctx);
        assert_eq!(env.get("a.status"), Some(Value::String("failed".into())));
    }

    #[test]
    fn loop_scope_restores_prior_value_on_exit() {
        let mut ctx = ctx_with(vec![("x", Value::from(1))], vec![]);
        let scope = LoopScope::enter(&mut ctx, vec![("x".to_string(), Value::from(2))]);
        assert_eq!(ctx.variables.get("x"), Some(&Value::from(2)));
        scope.exit(&mut ctx);
        assert_eq!(ctx.variables.get("x"), Some(&Value::from(1)));
    }

    #[test]
    fn loop_scope_removes_key_if_absent_before() {
        let mut ctx = ctx_with(vec![], vec![]);
        let scope = LoopScope::enter(&mut ctx, vec![("loop".to_string(), Value::from(1))]);
        assert!(ctx.variables.contains_key("loop"));
        scope.exit(&mut ctx);
        assert!(!ctx.variables.contains_key("loop"));
    }
}
