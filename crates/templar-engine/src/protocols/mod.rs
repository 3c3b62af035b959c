//! Protocol-independent plumbing: engine options, the ordered variables
//! block, scan contexts, events and the compiled-request variants.

pub mod file;
pub mod http;
pub mod network;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use templar_common::dsl::HelperRegistry;
use templar_common::replace::evaluate_template;
use templar_common::value::{Value, VarMap, extracted_value};

use crate::error::{Error, Result};
use crate::operators::OperatorResult;
use crate::payloads::AttackKind;

pub use file::FileRequest;
pub use http::HttpRequest;
pub use network::NetworkRequest;

/// Engine-level timeout applied to HTTP clients and socket reads, seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A YAML scalar that we always treat as its string form (template fields
/// routinely mix bare numbers and strings).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Caller-facing knobs for a whole scan run.
#[derive(Debug, Clone)]
pub struct Options {
    /// Payload overrides supplied by the embedder; names colliding with
    /// template payloads replace them.
    pub vars_payload: IndexMap<String, Vec<String>>,
    /// Forced attack kind, overriding per-request settings.
    pub attack_type: Option<AttackKind>,
    /// Refuse templates that flag themselves opsec-sensitive.
    pub opsec: bool,
    /// Per-request timeout in seconds.
    pub timeout: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            vars_payload: IndexMap::new(),
            attack_type: None,
            opsec: false,
            timeout: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Options {
    /// The caller payload overrides as a variable scope.
    pub fn payload_values(&self) -> VarMap {
        self.vars_payload
            .iter()
            .map(|(name, values)| (name.clone(), extracted_value(values.clone())))
            .collect()
    }
}

/// Everything a compiled request needs at execution time.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub template_id: String,
    pub variables: Variables,
    pub options: Arc<Options>,
    pub helpers: Arc<HelperRegistry>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            template_id: String::new(),
            variables: Variables::default(),
            options: Arc::new(Options::default()),
            helpers: Arc::new(HelperRegistry::default()),
        }
    }
}

/// The template `variables` block. Order matters: later entries may
/// reference earlier ones.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Variables(IndexMap<String, ScalarValue>);

impl Variables {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Evaluate every variable in declaration order against `scope`,
    /// each seeing the ones evaluated before it. Expressions that fail to
    /// resolve keep their raw text.
    pub fn evaluate(&self, scope: &VarMap, helpers: &HelperRegistry) -> VarMap {
        let mut live = scope.clone();
        let mut evaluated = VarMap::new();
        for (name, raw) in &self.0 {
            let raw = raw.to_string();
            let rendered = evaluate_template(&raw, &live, helpers).unwrap_or(raw);
            live.insert(name.clone(), Value::Str(rendered.clone()));
            evaluated.insert(name.clone(), Value::Str(rendered));
        }
        evaluated
    }
}

/// The per-response fact map consumed by operators and the DSL.
pub type InternalEvent = VarMap;

/// One reportable finding, flattened for output sinks.
#[derive(Debug, Clone, Serialize)]
pub struct ResultEvent {
    pub template_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matcher_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extractor_name: Option<String>,
    /// Protocol kind: `http`, `network` or `file`.
    pub kind: String,
    pub host: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// The transformed input that produced the finding (final URL, address,
    /// file path).
    pub matched: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extracted_results: Vec<String>,
    /// Line numbers of file-protocol findings.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub lines: Vec<usize>,
    /// Payload values in effect for the probe.
    pub metadata: VarMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix timestamp, seconds.
    pub timestamp: u64,
}

impl ResultEvent {
    fn base(kind: &str, internal: &InternalEvent) -> Self {
        let get = |key: &str| {
            internal
                .get(key)
                .map(ToString::to_string)
                .unwrap_or_default()
        };
        Self {
            template_id: get("template-id"),
            matcher_name: None,
            extractor_name: None,
            kind: kind.to_string(),
            host: get("host"),
            path: get("path"),
            matched: get("matched"),
            extracted_results: Vec::new(),
            lines: Vec::new(),
            metadata: VarMap::new(),
            error: None,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }
}

/// An event as it travels through the engine: the raw fact map plus the
/// operator outcome and the flattened findings.
#[derive(Debug, Clone, Default)]
pub struct WrappedEvent {
    pub internal: InternalEvent,
    pub operators_result: Option<OperatorResult>,
    pub results: Vec<ResultEvent>,
}

/// Flatten an operator outcome into result events: one per named matcher,
/// else one per extractor, else a single record. Events holding only
/// dynamic values produce nothing.
pub fn make_result_events(kind: &str, wrapped: &WrappedEvent) -> Vec<ResultEvent> {
    let Some(result) = wrapped.operators_result.as_ref() else {
        return Vec::new();
    };
    if !result.dynamic_values.is_empty() && !result.matched {
        return Vec::new();
    }

    let mut item = ResultEvent::base(kind, &wrapped.internal);
    item.metadata = result.payload_values.clone();
    item.extracted_results = result.output_extracts.clone();

    let mut events = Vec::new();
    if !result.matches.is_empty() {
        for name in result.matches.keys() {
            let mut event = item.clone();
            event.matcher_name = Some(name.clone());
            events.push(event);
        }
    } else if !result.extracts.is_empty() {
        for (name, values) in &result.extracts {
            let mut event = item.clone();
            event.extractor_name = Some(name.clone());
            event.extracted_results = values.clone();
            events.push(event);
        }
    } else {
        events.push(item);
    }
    events
}

/// Callback invoked for every event a protocol emits.
pub type OutputEventCallback<'a> = &'a mut dyn FnMut(WrappedEvent);

#[derive(Default)]
struct ScanState {
    events: Vec<WrappedEvent>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

/// Per-invocation state: one target, its seed payloads, and everything the
/// probes reported. Safe to share across the threads a callback may run on.
pub struct ScanContext {
    target: String,
    payloads: Option<IndexMap<String, Vec<String>>>,
    on_result: Option<Box<dyn Fn(&WrappedEvent) + Send + Sync>>,
    on_error: Option<Box<dyn Fn(&Error) + Send + Sync>>,
    state: Mutex<ScanState>,
}

impl ScanContext {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            payloads: None,
            on_result: None,
            on_error: None,
            state: Mutex::new(ScanState::default()),
        }
    }

    /// Seed payloads for this invocation; they replace the template's own
    /// payload lists.
    pub fn with_payloads(mut self, payloads: IndexMap<String, Vec<String>>) -> Self {
        self.payloads = Some(payloads);
        self
    }

    pub fn on_result(mut self, callback: impl Fn(&WrappedEvent) + Send + Sync + 'static) -> Self {
        self.on_result = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn payloads(&self) -> Option<&IndexMap<String, Vec<String>>> {
        self.payloads.as_ref()
    }

    pub fn log_event(&self, event: WrappedEvent) {
        if let Some(callback) = &self.on_result {
            callback(&event);
        }
        self.lock().events.push(event);
    }

    pub fn log_error(&self, error: &Error) {
        if let Some(callback) = &self.on_error {
            callback(error);
        }
        tracing::debug!(%error, target = %self.target, "probe error");
        self.lock().errors.push(error.to_string());
    }

    pub fn log_warning(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(warning = %message, target = %self.target);
        self.lock().warnings.push(message);
    }

    /// All flattened findings, annotated with the joined error string when
    /// any probe failed.
    pub fn results(&self) -> Vec<ResultEvent> {
        let state = self.lock();
        let error = if state.errors.is_empty() {
            None
        } else {
            Some(state.errors.join("; "))
        };
        state
            .events
            .iter()
            .flat_map(|e| e.results.iter().cloned())
            .map(|mut r| {
                r.error.clone_from(&error);
                r
            })
            .collect()
    }

    pub fn first_error(&self) -> Option<String> {
        self.lock().errors.first().cloned()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.lock().warnings.clone()
    }

    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A compiled request block of any protocol. The executor owns these; the
/// template keeps only a handle to its executor.
#[derive(Debug, Clone)]
pub enum ProtocolRequest {
    Http(HttpRequest),
    Network(NetworkRequest),
    File(FileRequest),
}

impl ProtocolRequest {
    pub fn compile(&mut self, options: &ExecutorOptions) -> Result<()> {
        match self {
            Self::Http(r) => r.compile(options),
            Self::Network(r) => r.compile(options),
            Self::File(r) => r.compile(options),
        }
    }

    /// Total probes this block advertises.
    pub fn requests(&self) -> usize {
        match self {
            Self::Http(r) => r.requests(),
            Self::Network(r) => r.requests(),
            Self::File(r) => r.requests(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Network(_) => "network",
            Self::File(_) => "file",
        }
    }

    pub fn execute(
        &self,
        ctx: &ScanContext,
        dynamic_values: &mut VarMap,
        previous: &mut VarMap,
        callback: OutputEventCallback<'_>,
    ) -> Result<()> {
        match self {
            Self::Http(r) => r.execute(ctx, dynamic_values, previous, callback),
            Self::Network(r) => r.execute(ctx, dynamic_values, previous, callback),
            Self::File(r) => r.execute(ctx, dynamic_values, previous, callback),
        }
    }
}

/// Re-play dynamic values into concrete scopes.
///
/// Without `iterate_all` only the first value of each name is used, once.
/// With it, multi-valued names are walked index-wise, shorter lists clamping
/// to their last value. The callback returns `true` to stop early.
pub fn each_dynamic_scope(
    input: &std::collections::BTreeMap<String, Vec<String>>,
    iterate_all: bool,
    mut callback: impl FnMut(VarMap) -> bool,
) {
    if !iterate_all {
        let scope: VarMap = input
            .iter()
            .filter_map(|(k, v)| {
                v.first()
                    .map(|first| (k.clone(), Value::from(first.clone())))
            })
            .collect();
        callback(scope);
        return;
    }
    let rounds = input.values().map(Vec::len).max().unwrap_or(0);
    for round in 0..rounds {
        let scope: VarMap = input
            .iter()
            .filter_map(|(k, v)| {
                let index = round.min(v.len().saturating_sub(1));
                v.get(index).map(|value| (k.clone(), Value::from(value.clone())))
            })
            .collect();
        if callback(scope) {
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn variables_evaluate_in_declaration_order() {
        let vars: Variables = serde_yaml::from_str(
            r"
base: admin
probe: '{{base}}-panel'
",
        )
        .unwrap();
        let evaluated = vars.evaluate(&VarMap::new(), &HelperRegistry::default());
        assert_eq!(evaluated.get("probe"), Some(&Value::from("admin-panel")));
    }

    #[test]
    fn variables_see_external_scope() {
        let vars: Variables = serde_yaml::from_str("probe: '{{Hostname}}:22'").unwrap();
        let mut scope = VarMap::new();
        scope.insert("Hostname".into(), Value::from("internal"));
        let evaluated = vars.evaluate(&scope, &HelperRegistry::default());
        assert_eq!(evaluated.get("probe"), Some(&Value::from("internal:22")));
    }

    #[test]
    fn scan_context_collects_events_and_errors() {
        let ctx = ScanContext::new("http://example.com");
        let mut event = WrappedEvent::default();
        event
            .results
            .push(ResultEvent::base("http", &InternalEvent::new()));
        ctx.log_event(event);
        assert_eq!(ctx.event_count(), 1);
        assert!(ctx.results()[0].error.is_none());

        ctx.log_error(&Error::Dial("refused".into()));
        let results = ctx.results();
        assert!(results[0].error.as_deref().unwrap().contains("refused"));
        assert_eq!(ctx.first_error().unwrap(), "dial error: refused");
    }

    #[test]
    fn result_events_skip_dynamic_only_outcomes() {
        let mut wrapped = WrappedEvent::default();
        let mut result = OperatorResult::default();
        result
            .dynamic_values
            .insert("v".into(), vec!["1".into()]);
        wrapped.operators_result = Some(result);
        assert!(make_result_events("http", &wrapped).is_empty());
    }

    #[test]
    fn result_events_fan_out_per_named_matcher() {
        let mut wrapped = WrappedEvent::default();
        let mut result = OperatorResult {
            matched: true,
            ..OperatorResult::default()
        };
        result.matches.insert("a".into(), Vec::new());
        result.matches.insert("b".into(), Vec::new());
        wrapped.operators_result = Some(result);
        let events = make_result_events("http", &wrapped);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].matcher_name.as_deref(), Some("a"));
    }

    #[test]
    fn dynamic_scopes_without_iterate_all_use_first_values() {
        let mut input = BTreeMap::new();
        input.insert("v".to_string(), vec!["1".to_string(), "2".to_string()]);
        let mut seen = Vec::new();
        each_dynamic_scope(&input, false, |scope| {
            seen.push(scope.get("v").unwrap().to_string());
            false
        });
        assert_eq!(seen, vec!["1".to_string()]);
    }

    #[test]
    fn dynamic_scopes_with_iterate_all_walk_and_clamp() {
        let mut input = BTreeMap::new();
        input.insert("a".to_string(), vec!["1".to_string(), "2".to_string()]);
        input.insert("b".to_string(), vec!["x".to_string()]);
        let mut seen = Vec::new();
        each_dynamic_scope(&input, true, |scope| {
            seen.push((
                scope.get("a").unwrap().to_string(),
                scope.get("b").unwrap().to_string(),
            ));
            false
        });
        assert_eq!(
            seen,
            vec![
                ("1".to_string(), "x".to_string()),
                ("2".to_string(), "x".to_string()),
            ]
        );
    }
}
