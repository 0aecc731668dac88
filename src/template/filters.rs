//! The fixed filter vocabulary available inside templates.
//!
//! Filters convert through `serde_json::Value` at the boundary so the same
//! data model flows through criteria, parameters and notifications.

use std::collections::HashMap;
use std::path::Path;

use minijinja::value::Value;
use minijinja::{Environment, Error, ErrorKind};

/// Sentinel produced by `use_none` for absent values.
pub const NONE_SENTINEL: &str = "%*****%";

pub fn register(env: &mut Environment<'static>, kv: HashMap<String, String>) {
    env.add_filter("to_json_string", to_json_string);
    env.add_filter("to_yaml_string", to_yaml_string);
    env.add_filter("from_json_string", from_json_string);
    env.add_filter("from_yaml_string", from_yaml_string);
    env.add_filter("jsonpath_query", jsonpath_query);
    env.add_filter("regex_match", regex_match);
    env.add_filter("regex_search", regex_search);
    env.add_filter("regex_replace", regex_replace);
    env.add_filter("regex_substring", regex_substring);
    env.add_filter("version_compare", version_compare);
    env.add_filter("version_more_than", version_more_than);
    env.add_filter("version_less_than", version_less_than);
    env.add_filter("version_equal", version_equal);
    env.add_filter("version_match", version_match);
    env.add_filter("version_bump_major", version_bump_major);
    env.add_filter("version_bump_minor", version_bump_minor);
    env.add_filter("version_bump_patch", version_bump_patch);
    env.add_filter("complex_semver_match", complex_semver_match);
    env.add_filter("to_human_time_from_seconds", to_human_time_from_seconds);
    env.add_filter("basename", basename);
    env.add_filter("dirname", dirname);
    env.add_filter("to_complex", to_complex);
    env.add_filter("use_none", use_none);
    env.add_filter("decrypt_kv", move |name: String| -> Result<String, Error> {
        kv.get(&name).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidOperation,
                format!("no decryptable value for key '{name}'"),
            )
        })
    });
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, msg.into())
}

fn to_json(value: &Value) -> Result<serde_json::Value, Error> {
    serde_json::to_value(value).map_err(|e| invalid(format!("not JSON-serializable: {e}")))
}

// ─── Serialization ────────────────────────────────────────────────────────────

fn to_json_string(value: Value) -> Result<String, Error> {
    serde_json::to_string(&to_json(&value)?).map_err(|e| invalid(e.to_string()))
}

fn to_yaml_string(value: Value) -> Result<String, Error> {
    serde_yaml::to_string(&to_json(&value)?).map_err(|e| invalid(e.to_string()))
}

fn from_json_string(value: String) -> Result<Value, Error> {
    let parsed: serde_json::Value =
        serde_json::from_str(&value).map_err(|e| invalid(format!("invalid JSON: {e}")))?;
    Ok(Value::from_serialize(&parsed))
}

fn from_yaml_string(value: String) -> Result<Value, Error> {
    let parsed: serde_json::Value =
        serde_yaml::from_str(&value).map_err(|e| invalid(format!("invalid YAML: {e}")))?;
    Ok(Value::from_serialize(&parsed))
}

/// `to_complex` serializes any value to its JSON text, mirroring the
/// criteria-side convention for comparing structured payload fields.
fn to_complex(value: Value) -> Result<String, Error> {
    to_json_string(value)
}

fn use_none(value: Value) -> Value {
    if value.is_none() || value.is_undefined() {
        Value::from(NONE_SENTINEL)
    } else {
        value
    }
}

// ─── JSONPath (dotted subset) ─────────────────────────────────────────────────

/// Supports `$.a.b`, bare `a.b`, numeric indexes `a[0]` and the `*` wildcard
/// segment (which maps the remainder over every element). A path that
/// resolves nothing yields `none` rather than an error.
fn jsonpath_query(value: Value, path: String) -> Result<Value, Error> {
    let doc = to_json(&value)?;
    let trimmed = path.trim_start_matches('$').trim_start_matches('.');
    let segments: Vec<&str> = if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('.').collect()
    };
    let mut matches = Vec::new();
    collect_path(&doc, &segments, &mut matches);
    match matches.len() {
        0 => Ok(Value::from(())),
        1 => Ok(Value::from_serialize(&matches[0])),
        _ => Ok(Value::from_serialize(&matches)),
    }
}

fn collect_path(doc: &serde_json::Value, segments: &[&str], out: &mut Vec<serde_json::Value>) {
    let Some((seg, rest)) = segments.split_first() else {
        out.push(doc.clone());
        return;
    };
    if *seg == "*" {
        match doc {
            serde_json::Value::Array(items) => {
                for item in items {
                    collect_path(item, rest, out);
                }
            }
            serde_json::Value::Object(map) => {
                for item in map.values() {
                    collect_path(item, rest, out);
                }
            }
            _ => {}
        }
        return;
    }
    let (name, index) = match seg.find('[') {
        Some(pos) if seg.ends_with(']') => {
            let idx = seg[pos + 1..seg.len() - 1].parse::<usize>().ok();
            (&seg[..pos], idx)
        }
        _ => (*seg, None),
    };
    let mut current = doc;
    if !name.is_empty() {
        match current.get(name) {
            Some(v) => current = v,
            None => return,
        }
    }
    if let Some(i) = index {
        match current.get(i) {
            Some(v) => current = v,
            None => return,
        }
    }
    collect_path(current, rest, out);
}

// ─── Regular expressions ──────────────────────────────────────────────────────

fn compile(pattern: &str) -> Result<regex::Regex, Error> {
    regex::Regex::new(pattern).map_err(|e| invalid(format!("invalid regex: {e}")))
}

/// Anchored at the start of the subject.
fn regex_match(value: String, pattern: String) -> Result<bool, Error> {
    let re = compile(&format!("^(?:{pattern})"))?;
    Ok(re.is_match(&value))
}

fn regex_search(value: String, pattern: String) -> Result<bool, Error> {
    Ok(compile(&pattern)?.is_match(&value))
}

fn regex_replace(value: String, pattern: String, replacement: String) -> Result<String, Error> {
    Ok(compile(&pattern)?
        .replace_all(&value, replacement.as_str())
        .into_owned())
}

/// Returns the `result_index`-th match of `pattern` in the subject.
fn regex_substring(
    value: String,
    pattern: String,
    result_index: Option<usize>,
) -> Result<String, Error> {
    let re = compile(&pattern)?;
    let index = result_index.unwrap_or(0);
    let found = re.find_iter(&value).nth(index).map(|m| m.as_str().to_string());
    found.ok_or_else(|| invalid(format!("no match {index} for pattern '{pattern}'")))
}

// ─── Versions ─────────────────────────────────────────────────────────────────

fn parse_version(value: &str) -> Result<semver::Version, Error> {
    semver::Version::parse(value.trim())
        .map_err(|e| invalid(format!("invalid version '{value}': {e}")))
}

fn version_compare(value: String, other: String) -> Result<i64, Error> {
    let a = parse_version(&value)?;
    let b = parse_version(&other)?;
    Ok(match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    })
}

fn version_more_than(value: String, other: String) -> Result<bool, Error> {
    Ok(parse_version(&value)? > parse_version(&other)?)
}

fn version_less_than(value: String, other: String) -> Result<bool, Error> {
    Ok(parse_version(&value)? < parse_version(&other)?)
}

fn version_equal(value: String, other: String) -> Result<bool, Error> {
    Ok(parse_version(&value)? == parse_version(&other)?)
}

/// Single-requirement match, e.g. `">=1.6.0"` or `"~1.2"`.
fn version_match(value: String, pattern: String) -> Result<bool, Error> {
    let version = parse_version(&value)?;
    let req = semver::VersionReq::parse(pattern.trim())
        .map_err(|e| invalid(format!("invalid version requirement '{pattern}': {e}")))?;
    Ok(req.matches(&version))
}

fn version_bump_major(value: String) -> Result<String, Error> {
    let mut v = parse_version(&value)?;
    v.major += 1;
    v.minor = 0;
    v.patch = 0;
    v.pre = semver::Prerelease::EMPTY;
    v.build = semver::BuildMetadata::EMPTY;
    Ok(v.to_string())
}

fn version_bump_minor(value: String) -> Result<String, Error> {
    let mut v = parse_version(&value)?;
    v.minor += 1;
    v.patch = 0;
    v.pre = semver::Prerelease::EMPTY;
    v.build = semver::BuildMetadata::EMPTY;
    Ok(v.to_string())
}

fn version_bump_patch(value: String) -> Result<String, Error> {
    let mut v = parse_version(&value)?;
    v.patch += 1;
    v.pre = semver::Prerelease::EMPTY;
    v.build = semver::BuildMetadata::EMPTY;
    Ok(v.to_string())
}

/// Range expressions: `||` separates alternatives; within an alternative,
/// comparators separated by whitespace or commas are all required.
/// `">=1.0.0 <2.0.0 || >=3.0.0"` matches 1.5.0 and 3.1.0 but not 2.1.0.
fn complex_semver_match(value: String, range: String) -> Result<bool, Error> {
    let version = parse_version(&value)?;
    for alternative in range.split("||") {
        let comparators: Vec<&str> = alternative
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .collect();
        if comparators.is_empty() {
            continue;
        }
        let req_src = comparators.join(", ");
        let req = semver::VersionReq::parse(&req_src)
            .map_err(|e| invalid(format!("invalid range '{alternative}': {e}")))?;
        if req.matches(&version) {
            return Ok(true);
        }
    }
    Ok(false)
}

// ─── Time and paths ───────────────────────────────────────────────────────────

/// `93784` becomes `"1d2h3m4s"`; zero is `"0s"`. Negative input is an error.
fn to_human_time_from_seconds(value: i64) -> Result<String, Error> {
    if value < 0 {
        return Err(invalid("seconds must be non-negative"));
    }
    if value == 0 {
        return Ok("0s".to_string());
    }
    let mut remaining = value;
    let mut out = String::new();
    for (unit, span) in [("y", 31_536_000), ("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)] {
        let count = remaining / span;
        remaining %= span;
        if count > 0 {
            out.push_str(&format!("{count}{unit}"));
        }
    }
    Ok(out)
}

fn basename(value: String) -> String {
    Path::new(&value)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn dirname(value: String) -> String {
    Path::new(&value)
        .parent()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
