// ABOUTME: Condition Evaluator (C3) — infix comparisons and truthiness per spec §4.3
// ABOUTME: Preserves the source's loose literal parsing and NaN-comparison semantics on purpose

use crate::env::Environment;
use crate::template;
use flowmark_core::{ExecutionContext, TemplateRenderer};
use serde_json::Value;

/// Locates the first (leftmost) comparison operator in `s`, preferring the
/// two-character operators over `>`/`<` at the same position (spec §4.3
/// step 1's precedence list: `==, !=, >=, <=, >, <`).
fn find_operator(s: &str) -> Option<(usize, usize, &'static str)> {
    let chars: Vec<(usize, char)> = s.char_indices().collect();
    for idx in 0..chars.len() {
        let (pos, c) = chars[idx];
        let next = chars.get(idx + 1).map(|&(_, c)| c);
        match (c, next) {
            ('=', Some('=')) => return Some((pos, pos + 2, "==")),
            ('!', Some('=')) => return Some((pos, pos + 2, "!=")),
            ('>', Some('=')) => return Some((pos, pos + 2, ">=")),
            ('<', Some('=')) => return Some((pos, pos + 2, "<=")),
            ('>', _) => return Some((pos, pos + 1, ">")),
            ('<', _) => return Some((pos, pos + 1, "<")),
            _ => {}
        }
    }
    None
}

/// Parses a literal per spec §4.3 step 3/4: quoted string, number, `true`,
/// `false`, `null`. Returns `None` when the text isn't recognized as any of
/// those — i.e. "the parse yields the original string unchanged".
fn parse_literal(raw: &str) -> Option<Value> {
    let t = raw.trim();
    if t.len() >= 2 {
        let bytes = t.as_bytes();
        if (bytes[0] == b'"' && bytes[t.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[t.len() - 1] == b'\'')
        {
            return Some(Value::String(t[1..t.len() - 1].to_string()));
        }
    }
    match t {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    if let Ok(n) = t.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(n) {
            return Some(Value::Number(num));
        }
    }
    None
}

/// Right-hand side is "always parsed as a literal"; when it isn't one of the
/// recognized literal forms, the raw trimmed text is used as a string value,
/// which is what lets unquoted words like `failed` work in practice.
fn parse_literal_or_raw(raw: &str) -> Value {
    parse_literal(raw).unwrap_or_else(|| Value::String(raw.trim().to_string()))
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Loose `Number(...)`-style coercion used for `<`/`<=`/`>`/`>=`. Unparseable
/// operands become NaN, so every comparison involving them is `false` (spec
/// §9 Open Question "numeric comparison of non-numbers" — preserved as-is).
fn to_number(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(f64::NAN),
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Null => 0.0,
        _ => f64::NAN,
    }
}

/// `==`/`!=` value-equality with numeric coercion on mixed string/number
/// operands (spec §4.3 step 5).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            let (na, nb) = (to_number(a), to_number(b));
            !na.is_nan() && !nb.is_nan() && (na - nb).abs() < f64::EPSILON
        }
        _ => a == b,
    }
}

fn resolve_side(raw: &str, ctx: &ExecutionContext, external: Option<&dyn TemplateRenderer>) -> Value {
    let raw = raw.trim();
    if raw.contains('|') || raw.contains("=~") || raw.contains("!~") {
        return template::render(&Value::String(format!("{{{{ {raw} }}}}")), ctx, external);
    }
    match parse_literal(raw) {
        Some(v) => v,
        None => Environment::new(ctx).get(raw).unwrap_or(Value::Null),
    }
}

/// Evaluates a single predicate string. Never returns an error: an
/// unparseable comparison degrades to truthiness of the raw text (spec §7.2,
/// §9 Open Question "condition parser tolerance") — callers that want to
/// surface a warning should check `looks_malformed` alongside the result.
pub fn evaluate(predicate: &str, ctx: &ExecutionContext, external: Option<&dyn TemplateRenderer>) -> bool {
    match find_operator(predicate) {
        Some((start, end, op)) => {
            let left_raw = &predicate[..start];
            let right_raw = &predicate[end..];
            let left = resolve_side(left_raw, ctx, external);
            let right = parse_literal_or_raw(right_raw);
            match op {
                "==" => values_equal(&left, &right),
                "!=" => !values_equal(&left, &right),
                ">" => to_number(&left) > to_number(&right),
                ">=" => to_number(&left) >= to_number(&right),
                "<" => to_number(&left) < to_number(&right),
                "<=" => to_number(&left) <= to_number(&right),
                _ => unreachable!("find_operator only returns the six handled operators"),
            }
        }
        None => {
            let trimmed = predicate.trim();
            match Environment::new(ctx).get(trimmed) {
                Some(v) => is_truthy(&v),
                None => !trimmed.is_empty(),
            }
        }
    }
}

/// A `conditions` list gates a step as a short-circuit conjunction (spec
/// §4.3 last paragraph): the first `false` stops evaluation.
pub fn evaluate_all(conditions: &[String], ctx: &ExecutionContext, external: Option<&dyn TemplateRenderer>) -> bool {
    conditions.iter().all(|c| evaluate(c, ctx, external))
}
