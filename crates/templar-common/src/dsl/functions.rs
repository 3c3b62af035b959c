//! The helper-function table exposed to DSL expressions.
//!
//! The set of functions is a stable contract: templates in the wild depend on
//! these names and signatures. Additions are fine, renames and removals are
//! not.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::DslError;
use crate::value::Value;

type Helper = fn(&[Value]) -> Result<Value, DslError>;

/// Named helper functions callable from DSL expressions.
///
/// The registry is immutable once built; an engine wanting extra helpers
/// builds its own instance and passes it wherever expressions are evaluated.
pub struct HelperRegistry {
    table: BTreeMap<&'static str, Helper>,
}

impl Default for HelperRegistry {
    fn default() -> Self {
        let mut table: BTreeMap<&'static str, Helper> = BTreeMap::new();
        table.insert("contains", helper_contains);
        table.insert("len", helper_len);
        table.insert("to_lower", helper_to_lower);
        table.insert("to_upper", helper_to_upper);
        table.insert("trim", helper_trim);
        table.insert("replace", helper_replace);
        table.insert("regex", helper_regex);
        table.insert("md5", helper_md5);
        table.insert("sha1", helper_sha1);
        table.insert("sha256", helper_sha256);
        table.insert("base64", helper_base64);
        table.insert("base64_decode", helper_base64_decode);
        table.insert("hex_encode", helper_hex_encode);
        table.insert("hex_decode", helper_hex_decode);
        table.insert("unix_time", helper_unix_time);
        table.insert("compare_versions", helper_compare_versions);
        Self { table }
    }
}

impl HelperRegistry {
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, DslError> {
        let helper = self
            .table
            .get(name)
            .ok_or_else(|| DslError::new(format!("unknown function: {name}")))?;
        helper(args)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.table.keys().copied()
    }
}

impl std::fmt::Debug for HelperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperRegistry")
            .field("functions", &self.table.len())
            .finish()
    }
}

fn want(args: &[Value], n: usize, name: &str) -> Result<(), DslError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(DslError::new(format!(
            "{name} expects {n} argument(s), got {}",
            args.len()
        )))
    }
}

fn helper_contains(args: &[Value]) -> Result<Value, DslError> {
    want(args, 2, "contains")?;
    let haystack = args[0].to_string();
    let needle = args[1].to_string();
    Ok(Value::Bool(haystack.contains(&needle)))
}

fn helper_len(args: &[Value]) -> Result<Value, DslError> {
    want(args, 1, "len")?;
    Ok(Value::Int(args[0].len() as i64))
}

fn helper_to_lower(args: &[Value]) -> Result<Value, DslError> {
    want(args, 1, "to_lower")?;
    Ok(Value::Str(args[0].to_string().to_lowercase()))
}

fn helper_to_upper(args: &[Value]) -> Result<Value, DslError> {
    want(args, 1, "to_upper")?;
    Ok(Value::Str(args[0].to_string().to_uppercase()))
}

fn helper_trim(args: &[Value]) -> Result<Value, DslError> {
    want(args, 1, "trim")?;
    Ok(Value::Str(args[0].to_string().trim().to_string()))
}

fn helper_replace(args: &[Value]) -> Result<Value, DslError> {
    want(args, 3, "replace")?;
    let corpus = args[0].to_string();
    let from = args[1].to_string();
    let to = args[2].to_string();
    Ok(Value::Str(corpus.replace(&from, &to)))
}

fn helper_regex(args: &[Value]) -> Result<Value, DslError> {
    want(args, 2, "regex")?;
    let pattern = args[0].to_string();
    let corpus = args[1].to_string();
    let re = regex::Regex::new(&pattern)
        .map_err(|e| DslError::new(format!("invalid regex {pattern:?}: {e}")))?;
    Ok(Value::Bool(re.is_match(&corpus)))
}

fn helper_md5(args: &[Value]) -> Result<Value, DslError> {
    want(args, 1, "md5")?;
    let mut hasher = Md5::new();
    hasher.update(args[0].to_string().as_bytes());
    Ok(Value::Str(hex::encode(hasher.finalize())))
}

fn helper_sha1(args: &[Value]) -> Result<Value, DslError> {
    want(args, 1, "sha1")?;
    let mut hasher = Sha1::new();
    hasher.update(args[0].to_string().as_bytes());
    Ok(Value::Str(hex::encode(hasher.finalize())))
}

fn helper_sha256(args: &[Value]) -> Result<Value, DslError> {
    want(args, 1, "sha256")?;
    let mut hasher = Sha256::new();
    hasher.update(args[0].to_string().as_bytes());
    Ok(Value::Str(hex::encode(hasher.finalize())))
}

fn helper_base64(args: &[Value]) -> Result<Value, DslError> {
    want(args, 1, "base64")?;
    Ok(Value::Str(BASE64.encode(args[0].to_string())))
}

fn helper_base64_decode(args: &[Value]) -> Result<Value, DslError> {
    want(args, 1, "base64_decode")?;
    let decoded = BASE64
        .decode(args[0].to_string())
        .map_err(|e| DslError::new(format!("invalid base64: {e}")))?;
    Ok(Value::Str(String::from_utf8_lossy(&decoded).into_owned()))
}

fn helper_hex_encode(args: &[Value]) -> Result<Value, DslError> {
    want(args, 1, "hex_encode")?;
    Ok(Value::Str(hex::encode(args[0].to_string())))
}

fn helper_hex_decode(args: &[Value]) -> Result<Value, DslError> {
    want(args, 1, "hex_decode")?;
    let decoded = hex::decode(args[0].to_string())
        .map_err(|e| DslError::new(format!("invalid hex: {e}")))?;
    Ok(Value::Str(String::from_utf8_lossy(&decoded).into_owned()))
}

fn helper_unix_time(args: &[Value]) -> Result<Value, DslError> {
    want(args, 0, "unix_time")?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| DslError::new(format!("clock error: {e}")))?;
    Ok(Value::Int(now.as_secs() as i64))
}

/// `compare_versions(found, ">=1.2", "<2")`: every constraint must hold.
fn helper_compare_versions(args: &[Value]) -> Result<Value, DslError> {
    if args.len() < 2 {
        return Err(DslError::new(
            "compare_versions expects a version and at least one constraint",
        ));
    }
    let version = args[0].to_string();
    for constraint in &args[1..] {
        for part in constraint.to_string().split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if !constraint_holds(&version, part)? {
                return Ok(Value::Bool(false));
            }
        }
    }
    Ok(Value::Bool(true))
}

fn constraint_holds(version: &str, constraint: &str) -> Result<bool, DslError> {
    let (op, wanted) = split_constraint(constraint);
    let ordering = compare_version_strings(version, wanted);
    Ok(match op {
        ">=" => ordering != Ordering::Less,
        "<=" => ordering != Ordering::Greater,
        ">" => ordering == Ordering::Greater,
        "<" => ordering == Ordering::Less,
        "==" | "=" | "" => ordering == Ordering::Equal,
        "!=" => ordering != Ordering::Equal,
        other => {
            return Err(DslError::new(format!(
                "unknown version constraint operator: {other}"
            )));
        }
    })
}

fn split_constraint(constraint: &str) -> (&str, &str) {
    for op in [">=", "<=", "==", "!=", ">", "<", "="] {
        if let Some(rest) = constraint.strip_prefix(op) {
            return (op, rest.trim());
        }
    }
    ("", constraint.trim())
}

/// Dotted-segment comparison: numeric where both segments parse, string
/// otherwise; missing segments count as zero.
fn compare_version_strings(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches(['v', 'V']);
    let b = b.trim_start_matches(['v', 'V']);
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (l, r) => {
                let l = l.unwrap_or("0");
                let r = r.unwrap_or("0");
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => l.cmp(r),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Value {
        HelperRegistry::default().call(name, args).unwrap()
    }

    #[test]
    fn string_helpers() {
        assert_eq!(
            call("contains", &["hello world".into(), "world".into()]),
            Value::Bool(true)
        );
        assert_eq!(call("len", &["abcd".into()]), Value::Int(4));
        assert_eq!(call("to_upper", &["abc".into()]), Value::Str("ABC".into()));
        assert_eq!(call("trim", &["  x ".into()]), Value::Str("x".into()));
        assert_eq!(
            call("replace", &["a-b".into(), "-".into(), "_".into()]),
            Value::Str("a_b".into())
        );
        assert_eq!(
            call("regex", &["^v\\d+".into(), "v12.3".into()]),
            Value::Bool(true)
        );
    }

    #[test]
    fn digest_helpers_match_known_vectors() {
        assert_eq!(
            call("md5", &["abc".into()]),
            Value::Str("900150983cd24fb0d6963f7d28e17f72".into())
        );
        assert_eq!(
            call("sha1", &["abc".into()]),
            Value::Str("a9993e364706816aba3e25717850c26c9cd0d89d".into())
        );
        assert_eq!(
            call("sha256", &["abc".into()]),
            Value::Str("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into())
        );
    }

    #[test]
    fn encoding_round_trips() {
        let encoded = call("base64", &["probe".into()]);
        assert_eq!(call("base64_decode", &[encoded]), Value::Str("probe".into()));

        let encoded = call("hex_encode", &["probe".into()]);
        assert_eq!(encoded, Value::Str("70726f6265".into()));
        assert_eq!(call("hex_decode", &[encoded]), Value::Str("probe".into()));
    }

    #[test]
    fn compare_versions_constraints() {
        assert_eq!(
            call("compare_versions", &["1.3".into(), ">=1.2".into()]),
            Value::Bool(true)
        );
        assert_eq!(
            call("compare_versions", &["1.3".into(), ">=1.2,<2".into()]),
            Value::Bool(true)
        );
        assert_eq!(
            call("compare_versions", &["2.0.1".into(), "<2".into()]),
            Value::Bool(false)
        );
        assert_eq!(
            call("compare_versions", &["v5.0".into(), ">4.9".into()]),
            Value::Bool(true)
        );
        // Missing segments compare as zero: 1.2 == 1.2.0
        assert_eq!(
            call("compare_versions", &["1.2".into(), "==1.2.0".into()]),
            Value::Bool(true)
        );
    }

    #[test]
    fn unknown_function_errors() {
        let err = HelperRegistry::default()
            .call("nope", &[])
            .unwrap_err();
        assert!(!err.is_missing_parameter());
    }

    #[test]
    fn arity_is_checked() {
        assert!(HelperRegistry::default().call("md5", &[]).is_err());
        assert!(
            HelperRegistry::default()
                .call("contains", &["x".into()])
                .is_err()
        );
    }
}
