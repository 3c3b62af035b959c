use std::fmt;

use crate::dsl::{CompiledExpression, HelperRegistry};
use crate::value::{Value, VarMap};

const MARKER_OPEN: &str = "{{";
const MARKER_CLOSE: &str = "}}";
const MARKER_GENERAL: char = '§';

/// Placeholders that survived an [`evaluate_template`] pass. The executor
/// treats this as the stop-execution signal for the current sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    pub markers: Vec<String>,
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unresolved variables: {}", self.markers.join(", "))
    }
}

impl std::error::Error for Unresolved {}

/// Substitute every known variable into `template`, leaving unknown markers
/// untouched. Both `{{name}}` and `§name§` marker styles are honored.
pub fn replace(template: &str, values: &VarMap) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        let rendered = value.to_string();
        out = out.replace(&format!("{MARKER_OPEN}{key}{MARKER_CLOSE}"), &rendered);
        out = out.replace(
            &format!("{MARKER_GENERAL}{key}{MARKER_GENERAL}"),
            &rendered,
        );
    }
    out
}

/// Substitute the first occurrence of a single variable, in both marker
/// styles.
pub fn replace_one(template: &str, key: &str, value: &Value) -> String {
    let rendered = value.to_string();
    let out = template.replacen(
        &format!("{MARKER_OPEN}{key}{MARKER_CLOSE}"),
        &rendered,
        1,
    );
    out.replacen(
        &format!("{MARKER_GENERAL}{key}{MARKER_GENERAL}"),
        &rendered,
        1,
    )
}

/// One `{{…}}` or `§…§` span found in a template string.
struct Marker {
    start: usize,
    end: usize,
    content: String,
}

/// Scan for marker spans, left to right, without nesting.
fn find_markers(input: &str) -> Vec<Marker> {
    let mut markers = Vec::new();
    let mut rest = 0;
    while let Some(open) = input[rest..].find(MARKER_OPEN) {
        let start = rest + open;
        let Some(close) = input[start + 2..].find(MARKER_CLOSE) else {
            break;
        };
        let end = start + 2 + close + 2;
        markers.push(Marker {
            start,
            end,
            content: input[start + 2..end - 2].to_string(),
        });
        rest = end;
    }
    rest = 0;
    while let Some(open) = input[rest..].find(MARKER_GENERAL) {
        let start = rest + open;
        let after = start + MARKER_GENERAL.len_utf8();
        let Some(close) = input[after..].find(MARKER_GENERAL) else {
            break;
        };
        let end = after + close + MARKER_GENERAL.len_utf8();
        markers.push(Marker {
            start,
            end,
            content: input[after..after + close].to_string(),
        });
        rest = end;
    }
    markers.sort_by_key(|m| m.start);
    markers
}

/// Evaluate a template string against a variable scope.
///
/// Each marker is replaced by the variable of the same name when one exists;
/// otherwise its content is parsed and evaluated as a DSL expression over the
/// same scope (this is what makes `{{md5(Hostname)}}`-style payloads work).
/// Markers that resolve neither way fail the whole pass.
pub fn evaluate_template(
    template: &str,
    vars: &VarMap,
    helpers: &HelperRegistry,
) -> Result<String, Unresolved> {
    let markers = find_markers(template);
    if markers.is_empty() {
        return Ok(template.to_string());
    }

    let mut out = String::with_capacity(template.len());
    let mut cursor = 0;
    let mut unresolved = Vec::new();
    for marker in markers {
        if marker.start < cursor {
            continue;
        }
        out.push_str(&template[cursor..marker.start]);
        let name = marker.content.trim();
        if let Some(value) = vars.get(name) {
            out.push_str(&value.to_string());
        } else if let Some(value) = try_expression(name, vars, helpers) {
            out.push_str(&value.to_string());
        } else {
            unresolved.push(name.to_string());
            out.push_str(&template[marker.start..marker.end]);
        }
        cursor = marker.end;
    }
    out.push_str(&template[cursor..]);

    if unresolved.is_empty() {
        Ok(out)
    } else {
        Err(Unresolved {
            markers: unresolved,
        })
    }
}

fn try_expression(src: &str, vars: &VarMap, helpers: &HelperRegistry) -> Option<Value> {
    let compiled = CompiledExpression::parse(src).ok()?;
    compiled.eval(vars, helpers).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn scope(pairs: &[(&str, &str)]) -> VarMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn replace_handles_both_marker_styles() {
        let vars = scope(&[("Host", "example.com")]);
        assert_eq!(
            replace("{{Host}} and §Host§", &vars),
            "example.com and example.com"
        );
    }

    #[test]
    fn replace_leaves_unknown_markers() {
        let vars = scope(&[("a", "1")]);
        assert_eq!(replace("{{a}}/{{b}}", &vars), "1/{{b}}");
    }

    #[test]
    fn evaluate_substitutes_variables() {
        let vars = scope(&[("BaseURL", "http://example.com"), ("p", "admin")]);
        let out = evaluate_template("{{BaseURL}}/{{p}}", &vars, &HelperRegistry::default())
            .unwrap();
        assert_eq!(out, "http://example.com/admin");
    }

    #[test]
    fn evaluate_falls_back_to_expressions() {
        let vars = scope(&[("word", "Abc")]);
        let out =
            evaluate_template("x-{{to_lower(word)}}", &vars, &HelperRegistry::default()).unwrap();
        assert_eq!(out, "x-abc");
    }

    #[test]
    fn evaluate_reports_unresolved() {
        let vars = VarMap::new();
        let err = evaluate_template("{{missing}}", &vars, &HelperRegistry::default())
            .unwrap_err();
        assert_eq!(err.markers, vec!["missing".to_string()]);
    }

    #[test]
    fn plain_text_passes_through() {
        let out = evaluate_template("no markers here", &VarMap::new(), &HelperRegistry::default())
            .unwrap();
        assert_eq!(out, "no markers here");
    }
}
