use std::collections::BTreeSet;

use regex::Regex;
use serde::Deserialize;
use templar_common::dsl::{CompiledExpression, HelperRegistry};
use templar_common::value::{Value, VarMap};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    Regex,
    KVal,
    Dsl,
}

impl ExtractorKind {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "regex" => Ok(Self::Regex),
            "kval" => Ok(Self::KVal),
            "dsl" => Ok(Self::Dsl),
            // json and xpath exist in the template ecosystem but are not
            // implemented by this engine.
            other => Err(Error::UnknownExtractorType(other.to_string())),
        }
    }
}

/// Pulls values out of an event map and binds them as variables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Extractor {
    /// Variable name the extraction binds to.
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub regex: Vec<String>,
    /// Capture group to collect for regex extractions (0 = whole match).
    #[serde(rename = "group")]
    pub regex_group: usize,
    /// Event-map keys to read. Hyphens are written as underscores, the way
    /// response headers appear in the event map.
    pub kval: Vec<String>,
    pub dsl: Vec<String>,
    pub part: String,
    /// Internal extractions feed subsequent requests but are not part of the
    /// surfaced output.
    pub internal: bool,
    /// Supported for kval only.
    pub case_insensitive: bool,

    #[serde(skip)]
    compiled: Option<CompiledExtractor>,
}

#[derive(Debug, Clone)]
struct CompiledExtractor {
    kind: ExtractorKind,
    regexes: Vec<Regex>,
    expressions: Vec<CompiledExpression>,
}

impl Extractor {
    pub fn compile(&mut self) -> Result<()> {
        let kind = ExtractorKind::parse(&self.kind)?;

        let mut regexes = Vec::with_capacity(self.regex.len());
        for pattern in &self.regex {
            let compiled =
                Regex::new(pattern).map_err(|_| Error::BadRegex(pattern.clone()))?;
            regexes.push(compiled);
        }

        for key in &mut self.kval {
            *key = key.to_lowercase().replace('-', "_");
        }

        let mut expressions = Vec::with_capacity(self.dsl.len());
        for src in &self.dsl {
            let compiled =
                CompiledExpression::parse(src).map_err(|_| Error::BadDsl(src.clone()))?;
            expressions.push(compiled);
        }

        if self.case_insensitive && kind != ExtractorKind::KVal {
            return Err(Error::Parse(format!(
                "case-insensitive flag is supported only for 'kval' extractors (not '{}')",
                self.kind
            )));
        }

        self.compiled = Some(CompiledExtractor {
            kind,
            regexes,
            expressions,
        });
        Ok(())
    }

    pub fn kind(&self) -> ExtractorKind {
        self.compiled
            .as_ref()
            .map_or(ExtractorKind::Regex, |c| c.kind)
    }

    /// Collect the configured capture group of every regex match, deduped.
    pub fn extract_regex(&self, corpus: &str) -> BTreeSet<String> {
        let mut results = BTreeSet::new();
        let Some(compiled) = self.compiled.as_ref() else {
            return results;
        };
        for regex in &compiled.regexes {
            for captures in regex.captures_iter(corpus) {
                if let Some(group) = captures.get(self.regex_group) {
                    results.insert(group.as_str().to_string());
                }
            }
        }
        results
    }

    /// Look up each configured key in the event map.
    pub fn extract_kval(&self, data: &VarMap) -> BTreeSet<String> {
        let mut results = BTreeSet::new();
        for key in &self.kval {
            let item = if self.case_insensitive {
                data.iter()
                    .find(|(k, _)| k.to_lowercase() == *key)
                    .map(|(_, v)| Value::Str(v.to_string().to_lowercase()))
            } else {
                data.get(key).cloned()
            };
            if let Some(item) = item {
                results.insert(item.to_string());
            }
        }
        results
    }

    /// Evaluate each expression and keep the stringified non-empty results.
    /// Missing event keys skip the expression; any other failure abandons the
    /// remaining expressions.
    pub fn extract_dsl(&self, data: &VarMap, helpers: &HelperRegistry) -> BTreeSet<String> {
        let mut results = BTreeSet::new();
        let Some(compiled) = self.compiled.as_ref() else {
            return results;
        };
        for expression in &compiled.expressions {
            match expression.eval(data, helpers) {
                Ok(value) => {
                    let rendered = value.to_string();
                    if !rendered.is_empty() {
                        results.insert(rendered);
                    }
                }
                Err(err) if err.is_missing_parameter() => {}
                Err(_) => return results,
            }
        }
        results
    }
}
