//! Template capability
//!
//! Destinations and job descriptions are templates rendered against item
//! data. The engine only needs "compile once, render per item", expressed by
//! [`TemplateEngine`] and [`Template`]. [`StrictTemplates`] is the stock
//! implementation: handlebars-style mustaches without blocks.
//!
//! - `{{foo.bar}}` inserts a field; a missing field is an error
//! - `{{helper "literal" field key=value}}` calls a registered helper
//! - `{{! comment }}` renders nothing
//! - output is never HTML-escaped; `{{{x}}}` is accepted and means `{{x}}`
//! - unknown helpers are rejected at compile time

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::TemplateError;

/// Output format of the `date` helper when `toformat` is not given
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

static TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\{?([^}]*)\}?\}\}").expect("tag pattern compiles")
});

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"([A-Za-z_][\w-]*)=("(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'|\S+)|("(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*')|(\S+)"#,
    )
    .expect("token pattern compiles")
});

/// A compiled template
pub trait Template: Send + Sync + fmt::Debug {
    /// Render against `data`
    ///
    /// # Errors
    /// - `TemplateError::Missing` if a referenced field is absent
    /// - `TemplateError::Helper` if a helper rejects its arguments
    fn render(&self, data: &Value) -> Result<String, TemplateError>;

    /// Text the template was compiled from
    fn source(&self) -> &str;
}

/// Compiles template text
pub trait TemplateEngine: Send + Sync {
    /// Compile `source`
    ///
    /// # Errors
    /// - `TemplateError::Parse` for malformed text
    /// - `TemplateError::UnknownHelper` for calls to unregistered helpers
    fn compile(&self, source: &str) -> Result<Arc<dyn Template>, TemplateError>;
}

/// Function callable from a template
pub trait Helper: Send + Sync {
    /// Produce output from positional `params` and named `hash` arguments
    ///
    /// # Errors
    /// `TemplateError::Helper` when the arguments are unusable
    fn call(&self, params: &[Value], hash: &Map<String, Value>) -> Result<String, TemplateError>;
}

type Helpers = HashMap<String, Arc<dyn Helper>>;

/// Strict, non-escaping template engine with a fixed helper set
#[derive(Clone)]
pub struct StrictTemplates {
    helpers: Arc<Helpers>,
}

impl StrictTemplates {
    /// Engine with the built-in helpers (`date`)
    #[must_use]
    pub fn new() -> Self {
        Self::empty().with_helper("date", DateHelper)
    }

    /// Engine without any helper
    #[must_use]
    pub fn empty() -> Self {
        Self {
            helpers: Arc::new(HashMap::new()),
        }
    }

    /// With an additional helper
    #[must_use]
    pub fn with_helper(mut self, name: impl Into<String>, helper: impl Helper + 'static) -> Self {
        Arc::make_mut(&mut self.helpers).insert(name.into(), Arc::new(helper));
        self
    }

    /// Whether a helper is registered under `name`
    #[must_use]
    pub fn has_helper(&self, name: &str) -> bool {
        self.helpers.contains_key(name)
    }
}

impl Default for StrictTemplates {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StrictTemplates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.helpers.keys().collect();
        names.sort();
        f.debug_struct("StrictTemplates")
            .field("helpers", &names)
            .finish()
    }
}

impl TemplateEngine for StrictTemplates {
    fn compile(&self, source: &str) -> Result<Arc<dyn Template>, TemplateError> {
        let parts = parse(source, &self.helpers)?;
        Ok(Arc::new(Compiled {
            source: source.to_string(),
            parts,
            helpers: Arc::clone(&self.helpers),
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Param {
    Literal(Value),
    Path(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Text(String),
    Value(Param),
    Call {
        helper: String,
        params: Vec<Param>,
        hash: Vec<(String, Param)>,
    },
}

struct Compiled {
    source: String,
    parts: Vec<Part>,
    helpers: Arc<Helpers>,
}

impl fmt::Debug for Compiled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Template for Compiled {
    fn render(&self, data: &Value) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        for part in &self.parts {
            match part {
                Part::Text(text) => out.push_str(text),
                Part::Value(param) => out.push_str(&stringify(&resolve(param, data)?)),
                Part::Call {
                    helper,
                    params,
                    hash,
                } => {
                    let Some(callee) = self.helpers.get(helper) else {
                        return Err(TemplateError::UnknownHelper(helper.clone()));
                    };
                    let params = params
                        .iter()
                        .map(|p| resolve(p, data))
                        .collect::<Result<Vec<_>, _>>()?;
                    let hash = hash
                        .iter()
                        .map(|(k, p)| Ok((k.clone(), resolve(p, data)?)))
                        .collect::<Result<Map<_, _>, TemplateError>>()?;
                    out.push_str(&callee.call(&params, &hash)?);
                }
            }
        }
        Ok(out)
    }

    fn source(&self) -> &str {
        &self.source
    }
}

fn parse(source: &str, helpers: &Helpers) -> Result<Vec<Part>, TemplateError> {
    let mut parts = Vec::new();
    let mut last = 0;
    for caps in TAG.captures_iter(source) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        push_text(source, &source[last..whole.start()], &mut parts)?;
        last = whole.end();

        let body = body.as_str().trim();
        if body.starts_with('!') {
            continue;
        }
        if body.is_empty() {
            return Err(TemplateError::parse(source, "empty expression"));
        }
        if body.starts_with(['#', '/', '^', '>', '&']) || body == "else" {
            return Err(TemplateError::parse(
                source,
                format!("'{body}' is not supported"),
            ));
        }
        parts.push(parse_expression(source, body, helpers)?);
    }
    push_text(source, &source[last..], &mut parts)?;
    Ok(parts)
}

fn push_text(source: &str, text: &str, parts: &mut Vec<Part>) -> Result<(), TemplateError> {
    if text.contains("{{") {
        return Err(TemplateError::parse(source, "unterminated '{{'"));
    }
    if !text.is_empty() {
        parts.push(Part::Text(text.to_string()));
    }
    Ok(())
}

fn parse_expression(source: &str, body: &str, helpers: &Helpers) -> Result<Part, TemplateError> {
    let mut params = Vec::new();
    let mut hash = Vec::new();
    for caps in TOKEN.captures_iter(body) {
        if let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) {
            hash.push((key.as_str().to_string(), parse_param(source, value.as_str())?));
        } else if let Some(quoted) = caps.get(3) {
            params.push(Param::Literal(Value::String(unquote(quoted.as_str()))));
        } else if let Some(bare) = caps.get(4) {
            params.push(parse_param(source, bare.as_str())?);
        }
    }

    let name = match params.first() {
        Some(Param::Path(path)) if path.len() == 1 => Some(path[0].clone()),
        _ => None,
    };
    let is_call = params.len() > 1 || !hash.is_empty();

    match name {
        Some(name) if helpers.contains_key(&name) => Ok(Part::Call {
            helper: name,
            params: params.split_off(1),
            hash,
        }),
        Some(name) if is_call => Err(TemplateError::UnknownHelper(name)),
        _ if is_call => Err(TemplateError::parse(
            source,
            format!("'{body}' does not start with a helper name"),
        )),
        _ => params
            .pop()
            .map(Part::Value)
            .ok_or_else(|| TemplateError::parse(source, "empty expression")),
    }
}

fn parse_param(source: &str, raw: &str) -> Result<Param, TemplateError> {
    if raw.starts_with(['"', '\'']) {
        return Ok(Param::Literal(Value::String(unquote(raw))));
    }
    match raw {
        "true" => return Ok(Param::Literal(Value::Bool(true))),
        "false" => return Ok(Param::Literal(Value::Bool(false))),
        "null" => return Ok(Param::Literal(Value::Null)),
        _ => {}
    }
    if raw.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        if let Ok(number) = serde_json::from_str::<serde_json::Number>(raw) {
            return Ok(Param::Literal(Value::Number(number)));
        }
    }

    let raw = raw
        .strip_prefix("this.")
        .or_else(|| raw.strip_prefix("./"))
        .unwrap_or(raw);
    if raw == "this" || raw == "." {
        return Ok(Param::Path(Vec::new()));
    }
    let segments: Vec<String> = raw.split(['.', '/']).map(str::to_string).collect();
    if segments.iter().any(|s| s.is_empty() || s == "..") {
        return Err(TemplateError::parse(source, format!("invalid path '{raw}'")));
    }
    Ok(Param::Path(segments))
}

fn unquote(quoted: &str) -> String {
    let mut chars = quoted.chars();
    let quote = chars.next();
    let rest = chars.as_str();
    let inner = quote.and_then(|q| rest.strip_suffix(q)).unwrap_or(rest);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn resolve(param: &Param, data: &Value) -> Result<Value, TemplateError> {
    match param {
        Param::Literal(value) => Ok(value.clone()),
        Param::Path(path) => {
            let mut current = data;
            for seg in path {
                let next = match current {
                    Value::Object(map) => map.get(seg),
                    Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
                    _ => None,
                };
                current = next.ok_or_else(|| TemplateError::Missing(path.join(".")))?;
            }
            Ok(current.clone())
        }
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// `{{date "<input format>" value toformat="<output format>"}}`
///
/// Parses `value` with the strftime-style input format and renders it with
/// the output format (default [`DEFAULT_DATE_FORMAT`]). Inputs with an
/// offset, date-times and plain dates are accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateHelper;

impl Helper for DateHelper {
    fn call(&self, params: &[Value], hash: &Map<String, Value>) -> Result<String, TemplateError> {
        let [format, value] = params else {
            return Err(TemplateError::helper(
                "date",
                format!("expected an input format and a date, got {} arguments", params.len()),
            ));
        };
        let (Some(format), Some(value)) = (format.as_str(), value.as_str()) else {
            return Err(TemplateError::helper("date", "arguments must be strings"));
        };
        let output = hash
            .get("toformat")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_DATE_FORMAT);
        reformat(value, format, output).map_err(|message| TemplateError::helper("date", message))
    }
}

fn reformat(value: &str, input: &str, output: &str) -> Result<String, String> {
    let mut rendered = String::new();
    let written = if let Ok(dt) = DateTime::parse_from_str(value, input) {
        write!(rendered, "{}", dt.format(output))
    } else if let Ok(dt) = NaiveDateTime::parse_from_str(value, input) {
        write!(rendered, "{}", dt.format(output))
    } else if let Ok(d) = NaiveDate::parse_from_str(value, input) {
        write!(rendered, "{}", d.format(output))
    } else {
        return Err(format!("'{value}' does not match format '{input}'"));
    };
    written.map_err(|_| format!("cannot render with format '{output}'"))?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn render(source: &str, data: &Value) -> Result<String, TemplateError> {
        StrictTemplates::new().compile(source)?.render(data)
    }

    #[test]
    fn substitutes_fields() {
        assert_eq!(render("/out/{{foo}}", &json!({"foo": "a"})).unwrap(), "/out/a");
        assert_eq!(
            render("/x/{{ a.b }}/{{n}}", &json!({"a": {"b": "deep"}, "n": 3})).unwrap(),
            "/x/deep/3"
        );
    }

    #[test]
    fn no_tags_renders_verbatim() {
        assert_eq!(render("/static/path", &json!({})).unwrap(), "/static/path");
    }

    #[test]
    fn missing_field_is_an_error() {
        assert_eq!(
            render("/out/{{foo}}", &json!({"bar": 1})),
            Err(TemplateError::Missing("foo".into()))
        );
    }

    #[test]
    fn output_is_not_escaped() {
        assert_eq!(
            render("{{v}}|{{{v}}}", &json!({"v": "a&b<c>"})).unwrap(),
            "a&b<c>|a&b<c>"
        );
    }

    #[test]
    fn meta_and_array_paths() {
        let data = json!({"_meta": {"tags": ["x", "y"]}});
        assert_eq!(render("{{_meta.tags.1}}", &data).unwrap(), "y");
        assert_eq!(render("{{this._meta.tags.0}}", &data).unwrap(), "x");
    }

    #[test]
    fn comments_render_nothing() {
        assert_eq!(render("a{{! note }}b", &json!({})).unwrap(), "ab");
    }

    #[test]
    fn unknown_helper_fails_compilation() {
        let err = StrictTemplates::new().compile("{{upper foo}}").unwrap_err();
        assert_eq!(err, TemplateError::UnknownHelper("upper".into()));
    }

    #[test]
    fn malformed_templates_fail_compilation() {
        let engine = StrictTemplates::new();
        assert!(matches!(engine.compile("/out/{{foo"), Err(TemplateError::Parse { .. })));
        assert!(matches!(engine.compile("{{#if x}}y{{/if}}"), Err(TemplateError::Parse { .. })));
        assert!(matches!(engine.compile("{{}}"), Err(TemplateError::Parse { .. })));
        assert!(matches!(engine.compile("{{../up}}"), Err(TemplateError::Parse { .. })));
    }

    #[test]
    fn date_helper_reformats() {
        let data = json!({"when": "03/15/2024"});
        assert_eq!(
            render("/days/{{date \"%m/%d/%Y\" when}}", &data).unwrap(),
            "/days/2024-03-15"
        );
        assert_eq!(
            render("{{date \"%m/%d/%Y\" when toformat=\"%Y/%m\"}}", &data).unwrap(),
            "2024/03"
        );
    }

    #[test]
    fn date_helper_accepts_date_times() {
        let data = json!({"at": "2024-03-15T10:20:30"});
        assert_eq!(
            render("{{date \"%Y-%m-%dT%H:%M:%S\" at toformat=\"%H:%M\"}}", &data).unwrap(),
            "10:20"
        );
    }

    #[test]
    fn date_helper_rejects_bad_input() {
        let data = json!({"when": "yesterday"});
        assert!(matches!(
            render("{{date \"%Y-%m-%d\" when}}", &data),
            Err(TemplateError::Helper { .. })
        ));
        assert!(matches!(
            render("{{date \"%Y-%m-%d\"}}", &data),
            Err(TemplateError::Helper { .. })
        ));
    }

    #[test]
    fn custom_helpers_can_be_added() {
        struct Upper;
        impl Helper for Upper {
            fn call(&self, params: &[Value], _: &Map<String, Value>) -> Result<String, TemplateError> {
                Ok(params.iter().map(stringify).collect::<String>().to_uppercase())
            }
        }
        let engine = StrictTemplates::new().with_helper("upper", Upper);
        assert!(engine.has_helper("upper"));
        let out = engine.compile("{{upper name}}").unwrap().render(&json!({"name": "ab"}));
        assert_eq!(out.unwrap(), "AB");
    }

    proptest! {
        #[test]
        fn substitution_is_literal(value in "[A-Za-z0-9_ .-]{0,24}") {
            let out = render("/out/{{foo}}", &json!({ "foo": value.clone() })).unwrap();
            prop_assert_eq!(out, format!("/out/{value}"));
        }

        #[test]
        fn text_without_tags_is_unchanged(text in "[^{}]{0,40}") {
            prop_assert_eq!(render(&text, &json!({})).unwrap(), text);
        }
    }
}
