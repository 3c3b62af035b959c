//! Matcher/extractor blocks and the ordering rules that combine them.
//!
//! An operators block runs its extractors first (so matchers can see freshly
//! bound variables), promotes dynamic values into the event map, then folds
//! matcher verdicts under the block's AND/OR condition.

pub mod extractors;
pub mod matchers;

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use templar_common::dsl::HelperRegistry;
use templar_common::value::{Value, VarMap, extracted_value};

use crate::error::Result;

pub use extractors::{Extractor, ExtractorKind};
pub use matchers::{Condition, Matcher, MatcherKind};

/// The operators attached to one request: matchers, extractors, and the
/// condition that combines matcher verdicts.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Operators {
    pub matchers: Vec<Matcher>,
    pub extractors: Vec<Extractor>,
    /// `and` or `or` between matchers; default is `or`.
    pub matchers_condition: Option<String>,

    #[serde(skip)]
    condition: Condition,
}


impl Operators {
    pub fn compile(&mut self) -> Result<()> {
        self.condition = match self.matchers_condition.as_deref() {
            Some(name) => Condition::parse(name)?,
            None => Condition::Or,
        };
        for matcher in &mut self.matchers {
            matcher.compile()?;
        }
        for extractor in &mut self.extractors {
            extractor.compile()?;
        }
        Ok(())
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty() && self.extractors.is_empty()
    }

    /// Run the block against an event map.
    ///
    /// `data` is mutated: extracted values and dynamic-value aliases become
    /// visible to the matchers of this same block and to callers afterwards.
    /// Returns `None` when nothing matched and nothing was extracted.
    pub fn execute<R>(
        &self,
        data: &mut VarMap,
        helpers: &HelperRegistry,
        resolve_part: R,
    ) -> Option<OperatorResult>
    where
        R: Fn(&str, &VarMap) -> Option<String>,
    {
        let mut result = OperatorResult::default();
        let mut output_seen = BTreeSet::new();

        for extractor in &self.extractors {
            let found: Vec<String> = self
                .extract_one(extractor, data, helpers, &resolve_part)
                .into_iter()
                .collect();
            for value in &found {
                if extractor.internal {
                    if let Some(name) = extractor.name.as_deref() {
                        result
                            .dynamic_values
                            .entry(name.to_string())
                            .or_default()
                            .push(value.clone());
                    }
                } else if output_seen.insert(value.clone()) {
                    result.output_extracts.push(value.clone());
                }
            }
            if found.is_empty() {
                continue;
            }
            if let Some(name) = extractor.name.as_deref() {
                if !extractor.internal {
                    result.extracts.insert(name.to_string(), found.clone());
                }
                data.insert(name.to_string(), extracted_value(found));
            }
        }

        // Dynamic values become visible to this block's own matchers, with
        // index-suffixed aliases for multi-valued extractions.
        for (name, values) in &result.dynamic_values {
            if values.len() > 1 {
                for (index, value) in values.iter().enumerate() {
                    data.insert(format!("{name}{index}"), Value::from(value.clone()));
                }
                data.insert(name.clone(), Value::List(values.clone()));
            } else if let Some(value) = values.first() {
                data.insert(name.clone(), Value::from(value.clone()));
            }
        }

        let mut verdicts = Vec::with_capacity(self.matchers.len());
        for (index, matcher) in self.matchers.iter().enumerate() {
            let (is_match, snippets) = self.match_one(matcher, data, helpers, &resolve_part);
            verdicts.push(is_match);
            if is_match {
                tracing::debug!(matcher = %matcher.display_name(index), "matched");
                if self.condition == Condition::Or {
                    result
                        .matches
                        .insert(matcher.display_name(index), snippets);
                }
            } else if self.condition == Condition::And {
                if result.dynamic_values.is_empty() {
                    return None;
                }
                result.matched = false;
                result.extracted = !result.output_extracts.is_empty();
                return Some(result);
            }
        }

        result.matched = !self.matchers.is_empty() && self.condition.aggregate(&verdicts);
        result.extracted = !result.output_extracts.is_empty();

        if !result.dynamic_values.is_empty() {
            return Some(result);
        }
        if !self.matchers.is_empty() && !result.matched {
            return None;
        }
        if result.matched || !result.extracts.is_empty() || !result.output_extracts.is_empty() {
            return Some(result);
        }
        None
    }

    /// Run only the internal extractors, for mid-sequence feedback such as
    /// named network reads.
    pub fn execute_internal_extractors<R>(
        &self,
        data: &VarMap,
        helpers: &HelperRegistry,
        resolve_part: R,
    ) -> VarMap
    where
        R: Fn(&str, &VarMap) -> Option<String>,
    {
        let mut dynamic = VarMap::new();
        for extractor in &self.extractors {
            if !extractor.internal {
                continue;
            }
            let Some(name) = extractor.name.as_deref() else {
                continue;
            };
            if let Some(first) = self
                .extract_one(extractor, data, helpers, &resolve_part)
                .into_iter()
                .next()
            {
                dynamic
                    .entry(name.to_string())
                    .or_insert(Value::Str(first));
            }
        }
        dynamic
    }

    fn match_one<R>(
        &self,
        matcher: &Matcher,
        data: &VarMap,
        helpers: &HelperRegistry,
        resolve_part: &R,
    ) -> (bool, Vec<String>)
    where
        R: Fn(&str, &VarMap) -> Option<String>,
    {
        let corpus = resolve_part(&matcher.part, data);
        match matcher.kind() {
            MatcherKind::Status => {
                let Some(Value::Int(code)) = data.get("status_code") else {
                    return (false, Vec::new());
                };
                let code = u16::try_from(*code).unwrap_or_default();
                (
                    matcher.result(matcher.match_status(code)),
                    vec![code.to_string()],
                )
            }
            MatcherKind::Size => {
                let Some(corpus) = corpus else {
                    return (false, Vec::new());
                };
                (matcher.result(matcher.match_size(corpus.len())), Vec::new())
            }
            MatcherKind::Word => {
                let Some(corpus) = corpus else {
                    return (false, Vec::new());
                };
                let (ok, snippets) = matcher.match_words(&corpus, data, helpers);
                matcher.result_with_snippets(ok, snippets)
            }
            MatcherKind::Regex => {
                let Some(corpus) = corpus else {
                    return (false, Vec::new());
                };
                let (ok, snippets) = matcher.match_regex(&corpus);
                matcher.result_with_snippets(ok, snippets)
            }
            MatcherKind::Binary => {
                let Some(corpus) = corpus else {
                    return (false, Vec::new());
                };
                let (ok, snippets) = matcher.match_binary(&corpus);
                matcher.result_with_snippets(ok, snippets)
            }
            MatcherKind::Dsl => (
                matcher.result(matcher.match_dsl(data, helpers)),
                Vec::new(),
            ),
        }
    }

    fn extract_one<R>(
        &self,
        extractor: &Extractor,
        data: &VarMap,
        helpers: &HelperRegistry,
        resolve_part: &R,
    ) -> BTreeSet<String>
    where
        R: Fn(&str, &VarMap) -> Option<String>,
    {
        match extractor.kind() {
            ExtractorKind::Regex => {
                let Some(corpus) = resolve_part(&extractor.part, data) else {
                    return BTreeSet::new();
                };
                extractor.extract_regex(&corpus)
            }
            ExtractorKind::KVal => extractor.extract_kval(data),
            ExtractorKind::Dsl => extractor.extract_dsl(data, helpers),
        }
    }
}

/// The outcome of running an operators block (or the fold of several).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperatorResult {
    pub matched: bool,
    pub extracted: bool,
    /// Matcher name → snippets that triggered it.
    pub matches: BTreeMap<String, Vec<String>>,
    /// Non-internal extractor name → extracted values.
    pub extracts: BTreeMap<String, Vec<String>>,
    /// Deduped values surfaced to the caller, in extraction order.
    pub output_extracts: Vec<String>,
    /// Internal extractions that feed subsequent requests.
    pub dynamic_values: BTreeMap<String, Vec<String>>,
    /// The payload tuple in effect when this result was produced.
    pub payload_values: VarMap,
}

impl OperatorResult {
    pub fn is_matched(&self) -> bool {
        self.matched
    }

    pub fn is_extracted(&self) -> bool {
        self.extracted
    }

    /// Fold another result in, deduping surfaced extracts; used across
    /// probes of one template and across file chunks.
    pub fn merge(&mut self, other: &Self) {
        self.matched |= other.matched;
        self.extracted |= other.extracted;
        for (name, snippets) in &other.matches {
            self.matches
                .entry(name.clone())
                .or_default()
                .extend(snippets.iter().cloned());
        }
        for (name, values) in &other.extracts {
            self.extracts
                .entry(name.clone())
                .or_default()
                .extend(values.iter().cloned());
        }
        for value in &other.output_extracts {
            if !self.output_extracts.contains(value) {
                self.output_extracts.push(value.clone());
            }
        }
        for (name, values) in &other.dynamic_values {
            self.dynamic_values
                .entry(name.clone())
                .or_default()
                .extend(values.iter().cloned());
        }
        for (name, value) in &other.payload_values {
            self.payload_values
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }
}
