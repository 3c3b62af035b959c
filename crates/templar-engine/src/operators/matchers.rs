use regex::Regex;
use serde::Deserialize;
use templar_common::dsl::{CompiledExpression, HelperRegistry};
use templar_common::replace::evaluate_template;
use templar_common::value::VarMap;

use crate::error::{Error, Result};

/// Aggregation condition between the literals of one matcher, and between the
/// matchers of an operators block. Default is OR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    And,
    #[default]
    Or,
}

impl Condition {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            other => Err(Error::UnknownCondition(other.to_string())),
        }
    }

    /// Fold a list of verdicts: AND is vacuously true over zero verdicts,
    /// OR is false.
    pub fn aggregate(self, verdicts: &[bool]) -> bool {
        match self {
            Self::And => verdicts.iter().all(|v| *v),
            Self::Or => verdicts.iter().any(|v| *v),
        }
    }
}

/// The detection kinds a matcher can run against an event map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    Status,
    Size,
    Word,
    Regex,
    Binary,
    Dsl,
}

impl MatcherKind {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "status" => Ok(Self::Status),
            "size" => Ok(Self::Size),
            "word" => Ok(Self::Word),
            "regex" => Ok(Self::Regex),
            "binary" => Ok(Self::Binary),
            "dsl" => Ok(Self::Dsl),
            other => Err(Error::UnknownMatcherType(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Size => "size",
            Self::Word => "word",
            Self::Regex => "regex",
            Self::Binary => "binary",
            Self::Dsl => "dsl",
        }
    }
}

/// A single detection rule: a literal set plus flags, compiled once per
/// template load.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Matcher {
    #[serde(rename = "type")]
    pub kind: String,
    /// Condition between this matcher's own literals.
    pub condition: Option<String>,
    /// Which slice of the event map to inspect. Defaults to the protocol's
    /// primary corpus.
    pub part: String,
    /// Invert the final verdict.
    pub negative: bool,
    pub name: Option<String>,
    pub status: Vec<u16>,
    pub size: Vec<usize>,
    pub words: Vec<String>,
    pub regex: Vec<String>,
    pub binary: Vec<String>,
    pub dsl: Vec<String>,
    /// `hex` enables hex-decoding of `words` literals at compile time.
    pub encoding: Option<String>,
    pub case_insensitive: bool,
    /// Collect every matching literal instead of stopping at the first.
    pub match_all: bool,

    #[serde(skip)]
    compiled: Option<CompiledMatcher>,
}

#[derive(Debug, Clone)]
struct CompiledMatcher {
    kind: MatcherKind,
    condition: Condition,
    regexes: Vec<Regex>,
    expressions: Vec<CompiledExpression>,
    binary_decoded: Vec<String>,
}

impl Matcher {
    pub fn compile(&mut self) -> Result<()> {
        if self.encoding.as_deref() == Some("hex") {
            for word in &mut self.words {
                if let Ok(decoded) = hex::decode(word.as_bytes()) {
                    if !decoded.is_empty() {
                        *word = String::from_utf8_lossy(&decoded).into_owned();
                    }
                }
            }
        }

        let kind = MatcherKind::parse(&self.kind)?;
        if self.part.is_empty() {
            self.part = "body".to_string();
        }
        if self.case_insensitive {
            for word in &mut self.words {
                *word = word.to_lowercase();
            }
        }

        let mut regexes = Vec::with_capacity(self.regex.len());
        for pattern in &self.regex {
            let compiled =
                Regex::new(pattern).map_err(|_| Error::BadRegex(pattern.clone()))?;
            regexes.push(compiled);
        }

        // Binary literals are hex on the wire; they are matched against the
        // lossily decoded corpus, which uses the same conversion.
        let mut binary_decoded = Vec::with_capacity(self.binary.len());
        for literal in &self.binary {
            let decoded =
                hex::decode(literal.as_bytes()).map_err(|_| Error::BadBinary(literal.clone()))?;
            binary_decoded.push(String::from_utf8_lossy(&decoded).into_owned());
        }

        let mut expressions = Vec::with_capacity(self.dsl.len());
        for src in &self.dsl {
            let compiled =
                CompiledExpression::parse(src).map_err(|_| Error::BadDsl(src.clone()))?;
            expressions.push(compiled);
        }

        let condition = match self.condition.as_deref() {
            Some(name) => Condition::parse(name)?,
            None => Condition::Or,
        };

        self.compiled = Some(CompiledMatcher {
            kind,
            condition,
            regexes,
            expressions,
            binary_decoded,
        });
        Ok(())
    }

    pub fn kind(&self) -> MatcherKind {
        self.compiled
            .as_ref()
            .map_or(MatcherKind::Word, |c| c.kind)
    }

    fn condition(&self) -> Condition {
        self.compiled
            .as_ref()
            .map_or(Condition::Or, |c| c.condition)
    }

    /// Reporting name: explicit, or `{type}-{index+1}` for unnamed matchers.
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.kind().name(), index + 1))
    }

    /// Apply the `negative` flag to a raw verdict.
    pub fn result(&self, matched: bool) -> bool {
        if self.negative { !matched } else { matched }
    }

    /// Apply `negative` and drop snippets when the final verdict is false.
    pub fn result_with_snippets(
        &self,
        matched: bool,
        snippets: Vec<String>,
    ) -> (bool, Vec<String>) {
        let verdict = self.result(matched);
        if verdict && !self.negative {
            (verdict, snippets)
        } else {
            (verdict, Vec::new())
        }
    }

    pub fn match_status(&self, status_code: u16) -> bool {
        // Status codes only OR together.
        self.status.contains(&status_code)
    }

    pub fn match_size(&self, length: usize) -> bool {
        self.size.contains(&length)
    }

    /// Word literals pass through the template evaluator first, so
    /// `{{var}}`-bearing words compare against the live scope. A word whose
    /// variables stay unresolved counts as unmatched.
    pub fn match_words(
        &self,
        corpus: &str,
        data: &VarMap,
        helpers: &HelperRegistry,
    ) -> (bool, Vec<String>) {
        let corpus = if self.case_insensitive {
            self.lowercase_corpus(corpus)
        } else {
            corpus.to_string()
        };
        let words: Vec<Option<String>> = self
            .words
            .iter()
            .map(|w| evaluate_template(w, data, helpers).ok())
            .collect();
        self.match_literals(&corpus, words.iter().map(std::option::Option::as_deref))
    }

    pub fn match_regex(&self, corpus: &str) -> (bool, Vec<String>) {
        let Some(compiled) = self.compiled.as_ref() else {
            return (false, Vec::new());
        };
        let mut matched = Vec::new();
        for (i, regex) in compiled.regexes.iter().enumerate() {
            let hits: Vec<String> = if self.match_all {
                regex
                    .find_iter(corpus)
                    .map(|m| m.as_str().to_string())
                    .collect()
            } else {
                regex
                    .find(corpus)
                    .map(|m| vec![m.as_str().to_string()])
                    .unwrap_or_default()
            };
            if hits.is_empty() {
                match compiled.condition {
                    Condition::And => return (false, Vec::new()),
                    Condition::Or => continue,
                }
            }
            matched.extend(hits);
            if compiled.condition == Condition::Or && !self.match_all {
                return (true, matched);
            }
            if compiled.condition == Condition::And && i == compiled.regexes.len() - 1 {
                return (true, matched);
            }
        }
        (!matched.is_empty(), matched)
    }

    pub fn match_binary(&self, corpus: &str) -> (bool, Vec<String>) {
        let Some(compiled) = self.compiled.as_ref() else {
            return (false, Vec::new());
        };
        let literals: Vec<Option<&str>> = compiled
            .binary_decoded
            .iter()
            .map(|b| Some(b.as_str()))
            .collect();
        self.match_literals(corpus, literals.into_iter())
    }

    /// Substring search shared by word and binary matching. `None` literals
    /// (unresolved words) never match.
    fn match_literals<'a>(
        &self,
        corpus: &str,
        literals: impl Iterator<Item = Option<&'a str>>,
    ) -> (bool, Vec<String>) {
        let condition = self.condition();
        let literals: Vec<Option<&str>> = literals.collect();
        if literals.is_empty() {
            return (false, Vec::new());
        }
        let mut matched = Vec::new();
        for (i, literal) in literals.iter().enumerate() {
            let hit = literal.is_some_and(|l| corpus.contains(l));
            if !hit {
                match condition {
                    Condition::And => return (false, Vec::new()),
                    Condition::Or => continue,
                }
            }
            if let Some(l) = literal {
                matched.push((*l).to_string());
            }
            if condition == Condition::Or && !self.match_all {
                return (true, matched);
            }
            if condition == Condition::And && i == literals.len() - 1 {
                return (true, matched);
            }
        }
        (!matched.is_empty(), matched)
    }

    /// Each expression is variable-substituted against the event, re-parsed
    /// and evaluated; the result must be a boolean. Missing event keys skip
    /// the expression under OR and fail it under AND.
    pub fn match_dsl(&self, data: &VarMap, helpers: &HelperRegistry) -> bool {
        let Some(compiled) = self.compiled.as_ref() else {
            return false;
        };
        for (i, expression) in compiled.expressions.iter().enumerate() {
            let Ok(resolved) = evaluate_template(expression.source(), data, helpers) else {
                tracing::debug!(expression = expression.source(), "dsl substitution failed");
                return false;
            };
            let reparsed = match CompiledExpression::parse(&resolved) {
                Ok(expr) => expr,
                Err(err) => {
                    tracing::debug!(expression = %resolved, %err, "dsl re-parse failed");
                    return false;
                }
            };
            let verdict = match reparsed.eval(data, helpers) {
                Ok(value) => match value.as_bool() {
                    Some(b) => b,
                    None => {
                        tracing::warn!(
                            expression = expression.source(),
                            "dsl matcher must return a boolean"
                        );
                        continue;
                    }
                },
                Err(_) => match compiled.condition {
                    Condition::And => return false,
                    Condition::Or => continue,
                },
            };
            if !verdict {
                match compiled.condition {
                    Condition::And => return false,
                    Condition::Or => continue,
                }
            }
            if compiled.condition == Condition::Or {
                return true;
            }
            if i == compiled.expressions.len() - 1 {
                return true;
            }
        }
        false
    }

    fn lowercase_corpus(&self, corpus: &str) -> String {
        corpus.to_lowercase()
    }
}
