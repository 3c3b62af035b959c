#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use common::HttpServer;
use templar_engine::{Options, Template};

fn compiled(yaml: &str) -> Template {
    let mut template = Template::from_yaml(yaml).unwrap();
    template.compile(Arc::new(Options::default())).unwrap();
    template
}

#[test]
fn status_or_word_matches() {
    let server = HttpServer::start(|_| (200, "Example Domain".to_string()));
    let template = compiled(
        r"
id: basic-detect
info:
  name: Basic detect
http:
  - method: GET
    path:
      - '{{BaseURL}}/'
    matchers-condition: or
    matchers:
      - type: status
        status:
          - 200
      - type: word
        words:
          - 'Example Domain'
",
    );
    let result = template.execute_target(&server.url()).unwrap().unwrap();
    assert!(result.matched);
    assert!(result.matches.contains_key("status-1") || result.matches.contains_key("word-2"));
    assert!(result.output_extracts.is_empty());
    assert_eq!(server.seen().len(), 1);
    assert_eq!(server.seen()[0].path(), "/");
}

#[test]
fn default_headers_are_sent() {
    let server = HttpServer::start(|_| (200, "ok".to_string()));
    let template = compiled(
        r"
id: headers
info:
  name: x
http:
  - path:
      - '{{BaseURL}}/'
    matchers:
      - type: status
        status:
          - 200
",
    );
    template.execute_target(&server.url()).unwrap();
    let seen = server.seen();
    assert_eq!(seen[0].header("accept").as_deref(), Some("*/*"));
    assert_eq!(seen[0].header("accept-language").as_deref(), Some("en"));
    assert!(seen[0].header("user-agent").is_some());
}

#[test]
fn extractor_feeds_dsl_matcher() {
    let server = HttpServer::start(|path| {
        if path == "/version" {
            (200, "service v1.3 ready".to_string())
        } else {
            (404, String::new())
        }
    });
    let template = compiled(
        r"
id: version-gate
info:
  name: Version gate
http:
  - path:
      - '{{BaseURL}}/version'
    extractors:
      - type: regex
        name: v
        internal: true
        regex:
          - 'v([\d.]+)'
        group: 1
    matchers:
      - type: dsl
        dsl:
          - compare_versions(v, '>=1.2')
",
    );
    let result = template.execute_target(&server.url()).unwrap().unwrap();
    assert!(result.matched);
    assert_eq!(result.dynamic_values.get("v").unwrap(), &vec!["1.3".to_string()]);
}

#[test]
fn raw_request_host_annotation_rewrites_target() {
    let server = HttpServer::start(|_| (200, "admin page".to_string()));
    // The raw text targets `frontend`, the annotation redirects the probe to
    // the test listener while keeping the configured port.
    let yaml = format!(
        r"
id: host-override
info:
  name: x
http:
  - raw:
      - |
        @Host:127.0.0.1:{port}
        GET /admin HTTP/1.1
        Host: frontend
    matchers:
      - type: word
        words:
          - 'admin page'
",
        port = server.addr.rsplit(':').next().unwrap()
    );
    let template = compiled(&yaml);
    let result = template.execute_target("http://frontend-placeholder.invalid:8080");
    let result = result.unwrap().unwrap();
    assert!(result.matched);
    let seen = server.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path(), "/admin");
    assert_eq!(seen[0].header("host").as_deref(), Some("frontend"));
}

#[test]
fn cluster_bomb_payloads_walk_in_order() {
    let server = HttpServer::start(|_| (404, String::new()));
    let template = compiled(
        r"
id: combos
info:
  name: x
http:
  - path:
      - '{{BaseURL}}/login/{{user}}/{{pass}}'
    attack: clusterbomb
    payloads:
      user: [a, b]
      pass: ['1', '2']
    matchers:
      - type: status
        status:
          - 200
",
    );
    assert_eq!(template.total_requests(), 4);
    let result = template.execute_target(&server.url()).unwrap();
    assert!(result.is_none());
    let paths: Vec<String> = server.seen().iter().map(common::SeenRequest::path).collect();
    assert_eq!(
        paths,
        vec!["/login/a/1", "/login/a/2", "/login/b/1", "/login/b/2"]
    );
}

#[test]
fn stop_at_first_match_ends_the_sequence() {
    let server = HttpServer::start(|_| (200, "hit".to_string()));
    let template = compiled(
        r"
id: stop-early
info:
  name: x
http:
  - stop-at-first-match: true
    path:
      - '{{BaseURL}}/first'
      - '{{BaseURL}}/second'
    matchers:
      - type: word
        words:
          - hit
",
    );
    let result = template.execute_target(&server.url()).unwrap().unwrap();
    assert!(result.matched);
    assert_eq!(server.seen().len(), 1);
}

#[test]
fn dynamic_values_feed_subsequent_probes() {
    let server = HttpServer::start(|path| {
        if path == "/start" {
            (200, "next=step-7b".to_string())
        } else if path == "/follow/step-7b" {
            (200, "finished".to_string())
        } else {
            (404, String::new())
        }
    });
    let template = compiled(
        r"
id: chained
info:
  name: x
http:
  - path:
      - '{{BaseURL}}/start'
      - '{{BaseURL}}/follow/{{next}}'
    extractors:
      - type: regex
        name: next
        internal: true
        regex:
          - 'step-\w+'
    matchers:
      - type: word
        words:
          - finished
",
    );
    let result = template.execute_target(&server.url()).unwrap().unwrap();
    assert!(result.matched);
    let paths: Vec<String> = server.seen().iter().map(common::SeenRequest::path).collect();
    assert_eq!(paths, vec!["/start", "/follow/step-7b"]);
}

#[test]
fn req_condition_exposes_numbered_history() {
    let server = HttpServer::start(|path| {
        if path == "/a" {
            (200, "first".to_string())
        } else {
            (404, "second".to_string())
        }
    });
    let template = compiled(
        r"
id: history
info:
  name: x
http:
  - req-condition: true
    path:
      - '{{BaseURL}}/a'
      - '{{BaseURL}}/b'
    matchers:
      - type: dsl
        dsl:
          - 'status_code_1 == 200 && status_code_2 == 404'
",
    );
    let result = template.execute_target(&server.url()).unwrap().unwrap();
    assert!(result.matched);
    assert_eq!(server.seen().len(), 2);
}

#[test]
fn unresolved_variables_stop_the_sequence_quietly() {
    let server = HttpServer::start(|_| (200, "ok".to_string()));
    let template = compiled(
        r"
id: missing-var
info:
  name: x
http:
  - path:
      - '{{BaseURL}}/{{never_bound}}'
    matchers:
      - type: status
        status:
          - 200
",
    );
    let result = template.execute_target(&server.url()).unwrap();
    assert!(result.is_none());
    assert!(server.seen().is_empty());
}

#[test]
fn result_events_serialize_for_output_sinks() -> anyhow::Result<()> {
    let server = HttpServer::start(|_| (200, "Example Domain".to_string()));
    let template = compiled(
        r"
id: serializable
info:
  name: x
http:
  - path:
      - '{{BaseURL}}/'
    matchers:
      - type: word
        name: marker
        words:
          - 'Example Domain'
",
    );
    let ctx = templar_engine::ScanContext::new(server.url());
    template.execute(&ctx)?;
    let results = ctx.results();
    assert_eq!(results.len(), 1);
    let json = serde_json::to_value(&results[0])?;
    assert_eq!(json["template_id"], "serializable");
    assert_eq!(json["matcher_name"], "marker");
    assert_eq!(json["kind"], "http");
    Ok(())
}

#[test]
fn determinism_same_inputs_same_verdict() {
    let server = HttpServer::start(|_| (200, "Example Domain".to_string()));
    let template = compiled(
        r"
id: stable
info:
  name: x
http:
  - path:
      - '{{BaseURL}}/'
    matchers:
      - type: word
        words:
          - 'Example Domain'
    extractors:
      - type: regex
        name: word
        regex:
          - 'Example \w+'
",
    );
    let first = template.execute_target(&server.url()).unwrap().unwrap();
    let second = template.execute_target(&server.url()).unwrap().unwrap();
    assert_eq!(first.matched, second.matched);
    assert_eq!(first.extracted, second.extracted);
    assert_eq!(first.output_extracts, second.output_extracts);
}
