// ABOUTME: Template Renderer (C2) — pure (string, env) -> value function per spec §4.2
// ABOUTME: Single-expression templates preserve native type; otherwise string interpolation

use crate::env::Environment;
use flowmark_core::{ExecutionContext, TemplateRenderer};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Matches a template that is *exactly* one `{{ ... }}` expression with
/// nothing else around it (spec §4.2 rule 2).
static SINGLE_EXPR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\{\{\s*(.*?)\s*\}\}$").unwrap());
/// Matches every `{{ ... }}` occurrence for rule 3 (general interpolation).
static ANY_EXPR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*(.*?)\s*\}\}").unwrap());

/// `true` when `expr` needs the richer filter/regex/loop/conditional syntax
/// (spec §4.2 rule 4) and must be delegated to an external `TemplateRenderer`.
fn needs_rich_renderer(expr: &str) -> bool {
    expr.contains('|') || expr.contains("=~") || expr.contains("!~") || expr.contains("{%")
}

/// Converts a resolved value to the string used for interpolation; undefined
/// (`None`) becomes the empty string (spec §4.2 rule 3, legacy compatibility).
pub fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

fn resolve_expr(
    expr: &str,
    ctx: &ExecutionContext,
    external: Option<&dyn TemplateRenderer>,
) -> Option<Value> {
    let expr = expr.trim();
    if needs_rich_renderer(expr) {
        let external = external?;
        let full_env = serde_json::json!({
            "inputs": ctx.inputs,
            "variables": ctx.variables,
            "stepMetadata": ctx.step_metadata,
        });
        return external.render(expr, &full_env).ok();
    }
    Environment::new(ctx).get(expr)
}

fn render_string(template: &str, ctx: &ExecutionContext, external: Option<&dyn TemplateRenderer>) -> Value {
    if let Some(caps) = SINGLE_EXPR.captures(template) {
        let expr = caps.get(1).map_or("", |m| m.as_str()).to_string();
        return match resolve_expr(&expr, ctx, external) {
            Some(v) => v,
            None => Value::String(String::new()),
        };
    }

    let rendered = ANY_EXPR
        .replace_all(template, |caps: &regex::Captures| {
            let expr = caps.get(1).map_or("", |m| m.as_str());
            let value = resolve_expr(expr, ctx, external);
            stringify(value.as_ref())
        })
        .into_owned();
    Value::String(rendered)
}

/// The full C2 contract: non-strings recurse structurally, strings follow
/// the single-expression / interpolation split above.
pub fn render(template: &Value, ctx: &ExecutionContext, external: Option<&dyn TemplateRenderer>) -> Value {
    match template {
        Value::String(s) => render_string(s, ctx, external),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render(v, ctx, external))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render(v, ctx, external));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx_with_var(key: &str, value: Value) -> ExecutionContext {
        let mut ctx = ExecutionContext::new("wf".into(), "run".into(), HashMap::new());
        ctx.variables.insert(key.to_string(), value);
        ctx
    }

    #[test]
    fn single_expression_preserves_native_type() {
        let ctx = ctx_with_var("x", serde_json::json!([1, 2]));
        let result = render(&Value::String("{{ x }}".to_string()), &ctx, None);
        assert_eq!(result, serde_json::json!([1, 2]));
    }

    #[test]
    fn single_expression_missing_becomes_empty_string() {
        let ctx = ExecutionContext::new("wf".into(), "run".into(), HashMap::new());
        let result = render(&Value::String("{{ missing }}".to_string()), &ctx, None);
        assert_eq!(result, Value::String(String::new()));
    }

    #[test]
    fn mixed_template_stringifies_and_concatenates() {
        let ctx = ctx_with_var("name", Value::String("Ada".to_string()));
        let result = render(
            &Value::String("Hello, {{ name }}!".to_string()),
            &ctx,
            None,
        );
        assert_eq!(result, Value::String("Hello, Ada!".to_string()));
    }

    #[test]
    fn non_string_trees_recurse_structurally() {
        let ctx = ctx_with_var("x", Value::from(5));
        let template = serde_json::json!({"a": "{{ x }}", "b": ["{{ x }}", "literal"]});
        let result = render(&template, &ctx, None);
        assert_eq!(result, serde_json::json!({"a": 5, "b": [5, "literal"]}));
    }

    #[test]
    fn idempotent_on_non_string_scalars() {
        let ctx = ExecutionContext::new("wf".into(), "run".into(), HashMap::new());
        let template = serde_json::json!({"n": 5, "b": true, "s": null});
        let once = render(&template, &ctx, None);
        let twice = render(&once, &ctx, None);
        assert_eq!(once, twice);
    }

    struct UppercaseRenderer;
    impl TemplateRenderer for UppercaseRenderer {
        fn render(&self, template: &str, _ctx: &Value) -> anyhow::Result<Value> {
            Ok(Value::String(template.to_uppercase()))
        }
    }

    #[test]
    fn rich_expression_delegates_to_external_renderer() {
        let ctx = ExecutionContext::new("wf".into(), "run".into(), HashMap::new());
        let renderer = UppercaseRenderer;
        let result = render(
            &Value::String("{{ name | upper }}".to_string()),
            &ctx,
            Some(&renderer),
        );
        assert_eq!(result, Value::String("NAME | UPPER".to_string()));
    }
}
