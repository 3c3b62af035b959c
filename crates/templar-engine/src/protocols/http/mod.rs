//! The HTTP protocol: request blocks, probe generation and the send/evaluate
//! loop that feeds operators and threads dynamic values forward.

pub mod client;
pub mod generator;
pub mod raw;

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Instant;

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use templar_common::value::{Value, VarMap};

use crate::error::{Error, Result};
use crate::operators::Operators;
use crate::payloads::{AttackKind, PayloadGenerator, PayloadTuple};
use crate::protocols::{
    ExecutorOptions, InternalEvent, OutputEventCallback, ScalarValue, ScanContext, WrappedEvent,
    each_dynamic_scope, make_result_events,
};

use self::client::{ClientConfig, create_client};
use self::generator::{GeneratedRequest, RequestGenerator};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; templar/0.3)";

/// Detects `_1`-style history references in matcher parts and expressions.
fn request_condition_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(r"_\d+").unwrap();
        re
    })
}

/// One HTTP request block: an ordered path or raw sequence, its payloads and
/// its operators.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HttpRequest {
    #[serde(flatten)]
    pub operators: Operators,
    pub path: Vec<String>,
    pub raw: Vec<String>,
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "attack")]
    pub attack: Option<AttackKind>,
    pub method: Option<String>,
    pub body: Option<String>,
    pub payloads: IndexMap<String, Vec<ScalarValue>>,
    pub headers: IndexMap<String, String>,
    pub max_redirects: usize,
    /// Maximum response body bytes to keep.
    pub max_size: Option<usize>,
    pub cookie_reuse: bool,
    pub redirects: bool,
    /// Pipelined raw HTTP; rejected at compile time.
    #[serde(rename = "unsafe")]
    pub unsafe_raw: bool,
    /// Keep per-request history under `_N`-suffixed keys.
    pub req_condition: bool,
    pub stop_at_first_match: bool,
    /// Re-play every candidate of multi-valued dynamic extractions.
    pub iterate_all: bool,

    #[serde(skip)]
    compiled: Option<Compiled>,
}

#[derive(Debug, Clone)]
struct Compiled {
    client: reqwest::blocking::Client,
    generator: Option<PayloadGenerator>,
    attack: AttackKind,
    options: ExecutorOptions,
    total: usize,
}

struct ProbeOutcome {
    matched: bool,
    dynamics: BTreeMap<String, Vec<String>>,
}

impl HttpRequest {
    pub fn compile(&mut self, options: &ExecutorOptions) -> Result<()> {
        if self.unsafe_raw {
            return Err(Error::UnsupportedUnsafe);
        }

        let client = create_client(&ClientConfig {
            timeout_secs: options.options.timeout,
            follow_redirects: self.redirects,
            max_redirects: self.max_redirects,
            cookie_reuse: self.cookie_reuse,
        })?;

        // Raw texts and bodies are normalized to CRLF line endings.
        if let Some(body) = &mut self.body {
            if !body.contains("\r\n") {
                *body = body.replace('\n', "\r\n");
            }
        }
        for raw in &mut self.raw {
            if !raw.contains("\r\n") {
                *raw = raw.replace('\n', "\r\n");
            }
        }

        if !self.operators.is_empty() {
            self.operators.compile()?;
        }

        let mut generator = None;
        let mut attack = AttackKind::Sniper;
        if !self.payloads.is_empty() {
            attack = options.options.attack_type.unwrap_or_else(|| {
                if options.options.vars_payload.is_empty() {
                    self.attack.unwrap_or_default()
                } else {
                    AttackKind::ClusterBomb
                }
            });
            let mut lists: IndexMap<String, Vec<String>> = self
                .payloads
                .iter()
                .map(|(name, values)| {
                    (
                        name.clone(),
                        values.iter().map(ToString::to_string).collect(),
                    )
                })
                .collect();
            for (name, values) in &options.options.vars_payload {
                if lists.contains_key(name) {
                    lists.insert(name.clone(), values.clone());
                }
            }
            generator = Some(PayloadGenerator::new(lists, attack));
        }

        let total = {
            let entries = self.path.len().max(self.raw.len());
            let combinations = generator.as_ref().map_or(1, PayloadGenerator::total);
            entries * combinations
        };

        self.compiled = Some(Compiled {
            client,
            generator,
            attack,
            options: options.clone(),
            total,
        });
        Ok(())
    }

    /// Total probes: entries × payload combinations.
    pub fn requests(&self) -> usize {
        self.compiled.as_ref().map_or(0, |c| c.total)
    }

    pub fn attack_kind(&self) -> AttackKind {
        self.compiled
            .as_ref()
            .map_or(AttackKind::Sniper, |c| c.attack)
    }

    /// Part selector resolution for HTTP events.
    fn resolve_part(part: &str, data: &VarMap) -> Option<String> {
        let part = match part {
            "" => "body",
            "header" => "all_headers",
            other => other,
        };
        if part == "all" {
            let body = data.get("body").map(ToString::to_string).unwrap_or_default();
            let headers = data
                .get("all_headers")
                .map(ToString::to_string)
                .unwrap_or_default();
            return Some(format!("{body}{headers}"));
        }
        data.get(part).map(ToString::to_string)
    }

    /// Request history is kept when asked for explicitly or when any
    /// operator references an `_N`-suffixed key.
    fn needs_request_condition(&self) -> bool {
        if self.req_condition {
            return true;
        }
        let re = request_condition_regex();
        self.operators.matchers.iter().any(|m| {
            m.dsl.iter().any(|d| re.is_match(d)) || re.is_match(&m.part)
        }) || self.operators.extractors.iter().any(|e| {
            e.dsl.iter().any(|d| re.is_match(d)) || re.is_match(&e.part)
        })
    }

    pub fn execute(
        &self,
        ctx: &ScanContext,
        dynamic_values: &mut VarMap,
        previous: &mut VarMap,
        callback: OutputEventCallback<'_>,
    ) -> Result<()> {
        let compiled = self
            .compiled
            .as_ref()
            .ok_or_else(|| Error::Parse("request executed before compile".to_string()))?;
        let options = &compiled.options;

        // Template variables first; live dynamic values win on collision.
        let scope = {
            let mut merged = previous.clone();
            merged.extend(dynamic_values.clone());
            merged
        };
        for (name, value) in options.variables.evaluate(&scope, &options.helpers) {
            dynamic_values.entry(name).or_insert(value);
        }

        let payload_iter = match ctx.payloads() {
            Some(seed) => Some(
                PayloadGenerator::new(seed.clone(), compiled.attack).iterator(),
            ),
            None => compiled.generator.as_ref().map(PayloadGenerator::iterator),
        };
        let mut generator = RequestGenerator::new(self, payload_iter);

        let mut request_count: usize = 1;
        let mut accumulated: BTreeMap<String, Vec<String>> = BTreeMap::new();

        'entries: while let Some((entry, tuple)) = generator.next_value() {
            let scopes = if accumulated.is_empty() {
                vec![dynamic_values.clone()]
            } else {
                let mut scopes = Vec::new();
                each_dynamic_scope(&accumulated, self.iterate_all, |scope| {
                    let mut merged = dynamic_values.clone();
                    merged.extend(scope);
                    scopes.push(merged);
                    false
                });
                scopes
            };

            for scope in scopes {
                let outcome = self.execute_probe(
                    ctx,
                    &generator,
                    &entry,
                    &tuple,
                    &scope,
                    previous,
                    request_count,
                    callback,
                );
                request_count += 1;
                match outcome {
                    Ok(outcome) => {
                        for (name, values) in outcome.dynamics {
                            accumulated.entry(name).or_default().extend(values);
                        }
                        if self.stop_at_first_match && outcome.matched {
                            break 'entries;
                        }
                    }
                    Err(err) if err.is_stop_execution() => break 'entries,
                    Err(err) => {
                        // A failed probe is recorded but does not end the
                        // sequence.
                        ctx.log_error(&err);
                    }
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_probe(
        &self,
        ctx: &ScanContext,
        generator: &RequestGenerator<'_>,
        entry: &str,
        tuple: &PayloadTuple,
        scope: &VarMap,
        previous: &mut VarMap,
        request_count: usize,
        callback: OutputEventCallback<'_>,
    ) -> Result<ProbeOutcome> {
        let compiled = self
            .compiled
            .as_ref()
            .ok_or_else(|| Error::Parse("request executed before compile".to_string()))?;
        let options = &compiled.options;

        let generated = generator.make(ctx.target(), entry, tuple, scope, options)?;
        tracing::debug!(method = %generated.method, url = %generated.url, "sending probe");

        let started = Instant::now();
        let response = self.send(&compiled.client, &generated)?;
        let duration = started.elapsed();

        let matched_url = response.url().to_string();
        let status = response.status().as_u16();
        let cookies: Vec<(String, String)> = response
            .cookies()
            .map(|c| (c.name().to_lowercase(), c.value().to_string()))
            .collect();
        let headers = response.headers().clone();
        let mut body = response
            .text()
            .map_err(|e| Error::Read(e.to_string()))?;
        if let Some(mut max) = self.max_size {
            if max < body.len() {
                while max > 0 && !body.is_char_boundary(max) {
                    max -= 1;
                }
                body.truncate(max);
            }
        }

        let output_event = self.response_to_event(
            &generated,
            status,
            &headers,
            &cookies,
            &body,
            ctx.target(),
            &matched_url,
            duration.as_secs_f64(),
        );

        let mut final_event: InternalEvent = previous.clone();
        final_event.extend(output_event.clone());
        final_event.insert(
            "template-id".into(),
            Value::from(options.template_id.clone()),
        );

        if self.needs_request_condition() {
            for (key, value) in &output_event {
                let suffixed = format!("{key}_{request_count}");
                previous.insert(suffixed.clone(), value.clone());
                final_event.insert(suffixed, value.clone());
            }
        }

        let mut outcome = ProbeOutcome {
            matched: false,
            dynamics: BTreeMap::new(),
        };
        if !self.operators.is_empty() {
            if let Some(mut result) = self.operators.execute(
                &mut final_event,
                &options.helpers,
                Self::resolve_part,
            ) {
                result.payload_values = generated.dynamic_values.clone();
                outcome.matched = result.matched;
                outcome.dynamics = result.dynamic_values.clone();
                let mut wrapped = WrappedEvent {
                    internal: final_event,
                    operators_result: Some(result),
                    results: Vec::new(),
                };
                wrapped.results = make_result_events("http", &wrapped);
                callback(wrapped);
            }
        }
        Ok(outcome)
    }

    fn send(
        &self,
        client: &reqwest::blocking::Client,
        generated: &GeneratedRequest,
    ) -> Result<reqwest::blocking::Response> {
        let method = reqwest::Method::from_bytes(generated.method.as_bytes())
            .map_err(|_| Error::Parse(format!("invalid method: {}", generated.method)))?;
        let mut builder = client.request(method, &generated.url);
        for (name, value) in &generated.headers {
            builder = builder.header(name, value);
        }
        if !generated.from_raw {
            if !generated.headers.contains_key("Accept") {
                builder = builder.header("Accept", "*/*");
            }
            if !generated.headers.contains_key("Accept-Language") {
                builder = builder.header("Accept-Language", "en");
            }
        }
        if !generated
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("user-agent"))
        {
            builder = builder.header("User-Agent", DEFAULT_USER_AGENT);
        }
        if let Some(body) = &generated.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = generated.timeout_override {
            builder = builder.timeout(timeout);
        }
        builder.send().map_err(|e| {
            if e.is_connect() {
                Error::Dial(e.to_string())
            } else {
                Error::Read(e.to_string())
            }
        })
    }

    /// Turn one HTTP response into the fact map operators consume.
    #[allow(clippy::too_many_arguments)]
    fn response_to_event(
        &self,
        generated: &GeneratedRequest,
        status: u16,
        headers: &reqwest::header::HeaderMap,
        cookies: &[(String, String)],
        body: &str,
        host: &str,
        matched_url: &str,
        duration_secs: f64,
    ) -> InternalEvent {
        let mut data = generated.dynamic_values.clone();
        for (name, value) in cookies {
            data.insert(name.clone(), Value::from(value.clone()));
        }

        let mut all_headers = String::new();
        let mut header_values: IndexMap<String, Vec<String>> = IndexMap::new();
        for (name, value) in headers {
            let text = String::from_utf8_lossy(value.as_bytes()).into_owned();
            header_values
                .entry(name.as_str().to_lowercase())
                .or_default()
                .push(text);
        }
        for (name, values) in &header_values {
            let joined = values.join(" ");
            all_headers.push_str(&format!("{name}: {joined}\r\n"));
            data.insert(name.replace('-', "_"), Value::from(joined));
        }

        let content_length = header_values
            .get("content-length")
            .and_then(|v| v.first())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(body.len() as i64);

        let mut request_dump = format!("{} {}\r\n", generated.method, generated.url);
        for (name, value) in &generated.headers {
            request_dump.push_str(&format!("{name}: {value}\r\n"));
        }
        if let Some(request_body) = &generated.body {
            request_dump.push_str("\r\n");
            request_dump.push_str(request_body);
        }

        let response_dump = format!("HTTP/1.1 {status}\r\n{all_headers}\r\n{body}");

        data.insert("host".into(), Value::from(host));
        data.insert("type".into(), Value::from("http"));
        data.insert("matched".into(), Value::from(matched_url));
        data.insert("status_code".into(), Value::Int(i64::from(status)));
        data.insert("duration".into(), Value::Float(duration_secs));
        data.insert("all_headers".into(), Value::from(all_headers));
        data.insert("body".into(), Value::from(body));
        data.insert("content_length".into(), Value::Int(content_length));
        data.insert("request".into(), Value::from(request_dump));
        data.insert("response".into(), Value::from(response_dump));
        data
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn from_yaml(yaml: &str) -> HttpRequest {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn deserializes_path_form() {
        let request = from_yaml(
            r"
method: GET
path:
  - '{{BaseURL}}/login'
  - '{{BaseURL}}/admin'
matchers:
  - type: status
    status:
      - 200
",
        );
        assert_eq!(request.path.len(), 2);
        assert_eq!(request.operators.matchers.len(), 1);
    }

    #[test]
    fn unsafe_requests_are_rejected_at_compile() {
        let mut request = from_yaml(
            r"
unsafe: true
raw:
  - |
    GET / HTTP/1.1
    Host: {{Hostname}}
",
        );
        let err = request.compile(&ExecutorOptions::default()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedUnsafe));
    }

    #[test]
    fn requests_counts_entries_times_payloads() {
        let mut request = from_yaml(
            r"
path:
  - '{{BaseURL}}/login/{{user}}/{{pass}}'
attack: clusterbomb
payloads:
  user:
    - a
    - b
  pass:
    - 1
    - 2
",
        );
        request.compile(&ExecutorOptions::default()).unwrap();
        assert_eq!(request.requests(), 4);
    }

    #[test]
    fn payload_tuples_walk_in_cluster_bomb_order() {
        let mut request = from_yaml(
            r"
path:
  - '/login'
attack: clusterbomb
payloads:
  user:
    - a
    - b
  pass:
    - 1
    - 2
",
        );
        request.compile(&ExecutorOptions::default()).unwrap();
        let compiled = request.compiled.as_ref().unwrap();
        let mut generator =
            RequestGenerator::new(&request, compiled.generator.as_ref().map(PayloadGenerator::iterator));
        let mut seen = Vec::new();
        while let Some((_, tuple)) = generator.next_value() {
            seen.push((tuple["user"].clone(), tuple["pass"].clone()));
        }
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), "1".to_string()),
                ("a".to_string(), "2".to_string()),
                ("b".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn entries_advance_after_payload_space() {
        let mut request = from_yaml(
            r"
path:
  - '/a'
  - '/b'
payloads:
  p:
    - '1'
    - '2'
",
        );
        request.compile(&ExecutorOptions::default()).unwrap();
        let compiled = request.compiled.as_ref().unwrap();
        let mut generator =
            RequestGenerator::new(&request, compiled.generator.as_ref().map(PayloadGenerator::iterator));
        let mut seen = Vec::new();
        while let Some((entry, tuple)) = generator.next_value() {
            seen.push(format!("{entry}:{}", tuple["p"]));
        }
        assert_eq!(seen, vec!["/a:1", "/a:2", "/b:1", "/b:2"]);
    }

    #[test]
    fn body_is_normalized_to_crlf() {
        let mut request = from_yaml("method: POST\npath: ['/x']\nbody: \"a\\nb\"");
        request.compile(&ExecutorOptions::default()).unwrap();
        assert_eq!(request.body.as_deref(), Some("a\r\nb"));
    }

    #[test]
    fn request_condition_detected_from_dsl() {
        let request = from_yaml(
            r"
path: ['/x']
req-condition: false
matchers:
  - type: dsl
    dsl:
      - 'status_code_1 == 200 && status_code_2 == 500'
",
        );
        assert!(request.needs_request_condition());
        let plain = from_yaml("path: ['/x']");
        assert!(!plain.needs_request_condition());
    }

    #[test]
    fn resolve_part_aliases() {
        let mut data = VarMap::new();
        data.insert("body".into(), Value::from("B"));
        data.insert("all_headers".into(), Value::from("H"));
        assert_eq!(HttpRequest::resolve_part("", &data).unwrap(), "B");
        assert_eq!(HttpRequest::resolve_part("header", &data).unwrap(), "H");
        assert_eq!(HttpRequest::resolve_part("all", &data).unwrap(), "BH");
        assert!(HttpRequest::resolve_part("missing", &data).is_none());
    }
}
