//! Criteria evaluation: ordered field predicates over trigger payloads.
//!
//! A rule's criteria document is an ordered map of `field path → criterion`.
//! Every criterion must match (logical AND) and evaluation short-circuits on
//! the first failure. A missing field or a null pattern makes the criterion
//! false; evaluation itself never raises on absent data.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::template::{Renderer, TemplateError};

#[derive(Debug, Error)]
pub enum CriteriaError {
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("malformed criterion for '{0}'")]
    Malformed(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Evaluate a criteria document against a lookup context (`{"trigger": payload,
/// …}`). Patterns containing template syntax are rendered against the same
/// context before comparison.
pub fn evaluate_criteria(
    criteria: &Value,
    context: &Value,
    renderer: &Renderer,
) -> Result<bool, CriteriaError> {
    let Some(map) = criteria.as_object() else {
        // No criteria object means the rule matches every instance.
        return Ok(true);
    };
    for (path, criterion) in map {
        if !evaluate_criterion(path, criterion, context, renderer)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn evaluate_criterion(
    path: &str,
    criterion: &Value,
    context: &Value,
    renderer: &Renderer,
) -> Result<bool, CriteriaError> {
    let op = criterion
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CriteriaError::Malformed(path.to_string()))?;
    let value = lookup_path(context, path);

    match op {
        "exists" => return Ok(value.is_some()),
        "nexists" => return Ok(value.is_none()),
        "search" => {
            let condition = criterion
                .get("condition")
                .and_then(Value::as_str)
                .unwrap_or("any");
            let pattern = criterion.get("pattern");
            return evaluate_search(value, condition, pattern, renderer);
        }
        _ => {}
    }

    // Null or missing pattern never matches.
    let pattern = match criterion.get("pattern") {
        Some(p) if !p.is_null() => render_pattern(p, context, renderer)?,
        _ => return Ok(false),
    };
    let Some(value) = value else {
        return Ok(false);
    };
    apply_operator(op, value, &pattern).ok_or_else(|| CriteriaError::UnknownOperator(op.to_string()))
}

/// `search` runs nested criteria (field paths prefixed `item.`) over each
/// element of a list-valued field. `any` needs one matching element, `all`
/// needs every element to match.
fn evaluate_search(
    value: Option<&Value>,
    condition: &str,
    pattern: Option<&Value>,
    renderer: &Renderer,
) -> Result<bool, CriteriaError> {
    let Some(Value::Array(items)) = value else {
        return Ok(false);
    };
    let Some(sub_criteria) = pattern.filter(|p| p.is_object()) else {
        return Ok(false);
    };
    let mut matched = 0usize;
    for item in items {
        let item_ctx = serde_json::json!({ "item": item });
        if evaluate_criteria(sub_criteria, &item_ctx, renderer)? {
            matched += 1;
        }
    }
    Ok(match condition {
        "all" => matched == items.len() && !items.is_empty(),
        _ => matched > 0,
    })
}

fn render_pattern(
    pattern: &Value,
    context: &Value,
    renderer: &Renderer,
) -> Result<Value, CriteriaError> {
    match pattern {
        Value::String(s) if s.contains("{{") || s.contains("{%") => {
            Ok(renderer.render_value(pattern, context)?)
        }
        other => Ok(other.clone()),
    }
}

/// Resolve a dotted field path (`trigger.metrics[0].cpu`) in the context.
pub fn lookup_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        let (name, index) = match segment.find('[') {
            Some(pos) if segment.ends_with(']') => {
                let idx = segment[pos + 1..segment.len() - 1].parse::<usize>().ok()?;
                (&segment[..pos], Some(idx))
            }
            _ => (segment, None),
        };
        if !name.is_empty() {
            current = current.get(name)?;
        }
        if let Some(i) = index {
            current = current.get(i)?;
        }
    }
    Some(current)
}

// ─── Operators ────────────────────────────────────────────────────────────────

/// Dispatch one comparison operator. `None` means the operator name is
/// unknown.
fn apply_operator(op: &str, value: &Value, pattern: &Value) -> Option<bool> {
    Some(match op {
        "equals" | "eq" => loose_eq(value, pattern),
        "nequals" | "neq" => !loose_eq(value, pattern),
        "iequals" | "ieq" => {
            as_text(value).to_lowercase() == as_text(pattern).to_lowercase()
        }
        "contains" => contains(value, pattern, false),
        "ncontains" => !contains(value, pattern, false),
        "icontains" => contains(value, pattern, true),
        "incontains" => !contains(value, pattern, true),
        "startswith" => as_text(value).starts_with(&as_text(pattern)),
        "istartswith" => as_text(value)
            .to_lowercase()
            .starts_with(&as_text(pattern).to_lowercase()),
        "endswith" => as_text(value).ends_with(&as_text(pattern)),
        "iendswith" => as_text(value)
            .to_lowercase()
            .ends_with(&as_text(pattern).to_lowercase()),
        "lessthan" | "lt" => match (as_number(value), as_number(pattern)) {
            (Some(a), Some(b)) => a < b,
            _ => as_text(value) < as_text(pattern),
        },
        "greaterthan" | "gt" => match (as_number(value), as_number(pattern)) {
            (Some(a), Some(b)) => a > b,
            _ => as_text(value) > as_text(pattern),
        },
        "matchwildcard" => wildcard_match(&as_text(pattern), &as_text(value)),
        "matchregex" => regex_test(&format!("^(?s:{})", as_text(pattern)), &as_text(value)),
        "regex" => regex_test(&as_text(pattern), &as_text(value)),
        "iregex" => regex_test(&format!("(?i:{})", as_text(pattern)), &as_text(value)),
        "timediff_lt" | "td_lt" => timediff(value, pattern, |diff, secs| diff < secs),
        "timediff_gt" | "td_gt" => timediff(value, pattern, |diff, secs| diff > secs),
        "inside" | "in" => inside(value, pattern),
        "ninside" | "nin" => !inside(value, pattern),
        _ => return None,
    })
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numbers compare numerically across int/float; everything else compares by
/// value, with string/number coercion on one side.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        if a.is_number() || b.is_number() {
            return x == y;
        }
    }
    if a == b {
        return true;
    }
    matches!((a, b), (Value::String(_), _) | (_, Value::String(_)) if as_text(a) == as_text(b))
}

/// `pattern` inside `value`: substring for strings, membership for arrays.
fn contains(value: &Value, pattern: &Value, ci: bool) -> bool {
    match value {
        Value::Array(items) => items.iter().any(|item| {
            if ci {
                as_text(item).to_lowercase() == as_text(pattern).to_lowercase()
            } else {
                loose_eq(item, pattern)
            }
        }),
        _ => {
            let haystack = as_text(value);
            let needle = as_text(pattern);
            if ci {
                haystack.to_lowercase().contains(&needle.to_lowercase())
            } else {
                haystack.contains(&needle)
            }
        }
    }
}

/// `value` inside `pattern`: the mirror of `contains`.
fn inside(value: &Value, pattern: &Value) -> bool {
    contains(pattern, value, false)
}

fn regex_test(pattern: &str, subject: &str) -> bool {
    regex::Regex::new(pattern)
        .map(|re| re.is_match(subject))
        .unwrap_or(false)
}

/// Glob-style matching with `*` and `?`.
fn wildcard_match(pattern: &str, subject: &str) -> bool {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    regex_test(&re, subject)
}

/// Compare `now - value_timestamp` (seconds) against the pattern.
fn timediff(value: &Value, pattern: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    let Some(ts) = value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    else {
        return false;
    };
    let Some(secs) = as_number(pattern) else {
        return false;
    };
    let diff = (Utc::now() - ts.with_timezone(&Utc)).num_milliseconds() as f64 / 1000.0;
    cmp(diff, secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(criteria: Value, payload: Value) -> bool {
        let ctx = json!({ "trigger": payload });
        evaluate_criteria(&criteria, &ctx, &Renderer::new()).unwrap()
    }

    #[test]
    fn greaterthan_on_numbers() {
        let criteria = json!({"trigger.cpu": {"type": "gt", "pattern": 90}});
        assert!(eval(criteria.clone(), json!({"cpu": 95})));
        assert!(!eval(criteria, json!({"cpu": 85})));
    }

    #[test]
    fn equals_coerces_numeric_strings() {
        let criteria = json!({"trigger.code": {"type": "equals", "pattern": 200}});
        assert!(eval(criteria.clone(), json!({"code": 200})));
        assert!(eval(criteria.clone(), json!({"code": "200"})));
        assert!(!eval(criteria, json!({"code": 404})));
    }

    #[test]
    fn missing_field_fails_without_error() {
        let criteria = json!({"trigger.absent.deeply": {"type": "eq", "pattern": 1}});
        assert!(!eval(criteria, json!({"cpu": 1})));
    }

    #[test]
    fn null_pattern_never_matches() {
        let criteria = json!({"trigger.cpu": {"type": "eq", "pattern": null}});
        assert!(!eval(criteria, json!({"cpu": 1})));
    }

    #[test]
    fn empty_criteria_matches_everything() {
        assert!(eval(json!({}), json!({"anything": true})));
    }

    #[test]
    fn multiple_criteria_are_anded() {
        let criteria = json!({
            "trigger.cpu": {"type": "gt", "pattern": 90},
            "trigger.host": {"type": "startswith", "pattern": "web"},
        });
        assert!(eval(criteria.clone(), json!({"cpu": 95, "host": "web1"})));
        assert!(!eval(criteria.clone(), json!({"cpu": 95, "host": "db1"})));
        assert!(!eval(criteria, json!({"cpu": 10, "host": "web1"})));
    }

    #[test]
    fn string_operators() {
        assert!(eval(
            json!({"trigger.msg": {"type": "icontains", "pattern": "ERROR"}}),
            json!({"msg": "disk error on sda"})
        ));
        assert!(eval(
            json!({"trigger.msg": {"type": "iendswith", "pattern": "SDA"}}),
            json!({"msg": "disk error on sda"})
        ));
        assert!(eval(
            json!({"trigger.msg": {"type": "iequals", "pattern": "OK"}}),
            json!({"msg": "ok"})
        ));
    }

    #[test]
    fn regex_operators() {
        assert!(eval(
            json!({"trigger.host": {"type": "matchregex", "pattern": "web\\d+"}}),
            json!({"host": "web12"})
        ));
        // matchregex anchors at the start.
        assert!(!eval(
            json!({"trigger.host": {"type": "matchregex", "pattern": "web\\d+"}}),
            json!({"host": "xweb12"})
        ));
        assert!(eval(
            json!({"trigger.host": {"type": "regex", "pattern": "web\\d+"}}),
            json!({"host": "xweb12"})
        ));
        assert!(eval(
            json!({"trigger.host": {"type": "iregex", "pattern": "WEB"}}),
            json!({"host": "web1"})
        ));
    }

    #[test]
    fn wildcard_operator() {
        let criteria = json!({"trigger.file": {"type": "matchwildcard", "pattern": "*.log"}});
        assert!(eval(criteria.clone(), json!({"file": "app.log"})));
        assert!(!eval(criteria, json!({"file": "app.txt"})));
    }

    #[test]
    fn membership_operators() {
        assert!(eval(
            json!({"trigger.level": {"type": "in", "pattern": ["warn", "error"]}}),
            json!({"level": "error"})
        ));
        assert!(eval(
            json!({"trigger.level": {"type": "nin", "pattern": ["warn", "error"]}}),
            json!({"level": "info"})
        ));
        assert!(eval(
            json!({"trigger.tags": {"type": "contains", "pattern": "prod"}}),
            json!({"tags": ["prod", "web"]})
        ));
    }

    #[test]
    fn exists_operators() {
        assert!(eval(
            json!({"trigger.cpu": {"type": "exists"}}),
            json!({"cpu": 1})
        ));
        assert!(eval(
            json!({"trigger.gpu": {"type": "nexists"}}),
            json!({"cpu": 1})
        ));
        assert!(!eval(
            json!({"trigger.gpu": {"type": "exists"}}),
            json!({"cpu": 1})
        ));
    }

    #[test]
    fn timediff_operators() {
        let old = (Utc::now() - chrono::Duration::seconds(3600)).to_rfc3339();
        assert!(eval(
            json!({"trigger.at": {"type": "td_gt", "pattern": 60}}),
            json!({"at": old})
        ));
        let recent = Utc::now().to_rfc3339();
        assert!(eval(
            json!({"trigger.at": {"type": "td_lt", "pattern": 60}}),
            json!({"at": recent})
        ));
    }

    #[test]
    fn search_any_and_all() {
        let payload = json!({"disks": [
            {"name": "sda", "full_pct": 97},
            {"name": "sdb", "full_pct": 20},
        ]});
        let any = json!({"trigger.disks": {
            "type": "search",
            "condition": "any",
            "pattern": {"item.full_pct": {"type": "gt", "pattern": 95}},
        }});
        let all = json!({"trigger.disks": {
            "type": "search",
            "condition": "all",
            "pattern": {"item.full_pct": {"type": "gt", "pattern": 95}},
        }});
        assert!(eval(any, payload.clone()));
        assert!(!eval(all, payload));
    }

    #[test]
    fn templated_pattern_renders_before_compare() {
        let criteria = json!({"trigger.host": {"type": "eq", "pattern": "{{ trigger.expected }}"}});
        assert!(eval(criteria, json!({"host": "web1", "expected": "web1"})));
    }

    #[test]
    fn unknown_operator_is_an_error() {
        let ctx = json!({"trigger": {"x": 1}});
        let criteria = json!({"trigger.x": {"type": "bogus", "pattern": 1}});
        assert!(matches!(
            evaluate_criteria(&criteria, &ctx, &Renderer::new()),
            Err(CriteriaError::UnknownOperator(_))
        ));
    }

    #[test]
    fn indexed_path_lookup() {
        let criteria = json!({"trigger.metrics[1].cpu": {"type": "gt", "pattern": 50}});
        assert!(eval(
            criteria,
            json!({"metrics": [{"cpu": 10}, {"cpu": 99}]})
        ));
    }
}
