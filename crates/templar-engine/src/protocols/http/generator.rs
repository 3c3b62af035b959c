//! Materializes concrete HTTP probes: walks the path/raw entries with their
//! payload space and renders each into a ready-to-send request description.

use std::sync::OnceLock;
use std::time::Duration;

use indexmap::IndexMap;
use regex::Regex;
use templar_common::replace::evaluate_template;
use templar_common::value::{Value, VarMap};
use url::Url;

use super::HttpRequest;
use super::raw::RawRequest;
use crate::error::{Error, Result};
use crate::payloads::{PayloadIterator, PayloadTuple};
use crate::protocols::ExecutorOptions;

/// `{{BaseURL}}:3000`-style entries override the target port.
fn url_with_port_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(r"\{\{BaseURL\}\}:(\d+)").unwrap();
        re
    })
}

/// A fully rendered probe, independent of the transport client.
#[derive(Debug, Clone)]
pub struct GeneratedRequest {
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<String>,
    pub timeout_override: Option<Duration>,
    /// Whether the probe came from a raw text (default headers are then
    /// left alone).
    pub from_raw: bool,
    /// The payload tuple and dynamic values this probe was rendered with.
    pub dynamic_values: VarMap,
}

/// Walks entries outer, payload tuples inner: for each path/raw entry the
/// entire payload space is exhausted before advancing.
pub(super) struct RequestGenerator<'a> {
    request: &'a HttpRequest,
    entries: &'a [String],
    entry_index: usize,
    payload_iter: Option<PayloadIterator>,
}

impl<'a> RequestGenerator<'a> {
    pub fn new(request: &'a HttpRequest, payload_iter: Option<PayloadIterator>) -> Self {
        let entries: &[String] = if request.path.is_empty() {
            &request.raw
        } else {
            &request.path
        };
        Self {
            request,
            entries,
            entry_index: 0,
            payload_iter,
        }
    }

    /// Next `(entry, payload tuple)` or `None` when exhausted.
    pub fn next_value(&mut self) -> Option<(String, PayloadTuple)> {
        if self.entry_index >= self.entries.len() {
            return None;
        }
        let Some(iter) = self.payload_iter.as_mut() else {
            let entry = self.entries.get(self.entry_index)?.clone();
            self.entry_index += 1;
            return Some((entry, PayloadTuple::new()));
        };

        loop {
            if let Some(tuple) = iter.value() {
                let entry = self.entries.get(self.entry_index)?.clone();
                return Some((entry, tuple));
            }
            self.entry_index += 1;
            if self.entry_index >= self.entries.len() {
                return None;
            }
            iter.reset();
        }
    }

    /// Render one probe from an entry, a payload tuple and the live dynamic
    /// scope.
    pub fn make(
        &self,
        base_url: &str,
        entry: &str,
        payloads: &PayloadTuple,
        dynamic_values: &VarMap,
        options: &ExecutorOptions,
    ) -> Result<GeneratedRequest> {
        let helpers = options.helpers.as_ref();

        // Payload values may reference each other and the dynamic scope.
        let mut all_vars: VarMap = dynamic_values.clone();
        for (name, value) in payloads {
            all_vars.insert(name.clone(), Value::from(value.clone()));
        }
        for (name, value) in payloads {
            let evaluated = evaluate_template(value, &all_vars, helpers)?;
            all_vars.insert(name.clone(), Value::from(evaluated));
        }

        let mut parsed = Url::parse(base_url)
            .map_err(|e| Error::Parse(format!("invalid target url {base_url:?}: {e}")))?;
        let entry = apply_template_port(entry, &mut parsed);
        let is_raw = !self.request.raw.is_empty();

        let trailing_slash = !is_raw && entry.contains("{{BaseURL}}/");
        let mut values = all_vars.clone();
        for (name, value) in url_variables(&parsed, trailing_slash) {
            values.insert(name, value);
        }

        let rendered = evaluate_template(&entry, &values, helpers)?;

        if is_raw {
            self.make_from_raw(&parsed, &rendered, &values, all_vars, options)
        } else {
            self.make_from_model(&rendered, &values, all_vars, options)
        }
    }

    fn make_from_model(
        &self,
        url: &str,
        values: &VarMap,
        dynamic_values: VarMap,
        options: &ExecutorOptions,
    ) -> Result<GeneratedRequest> {
        let helpers = options.helpers.as_ref();
        let mut headers = IndexMap::new();
        for (name, value) in &self.request.headers {
            headers.insert(name.clone(), evaluate_template(value, values, helpers)?);
        }
        let body = match self.request.body.as_deref() {
            Some(body) if !body.is_empty() => {
                Some(evaluate_template(body, values, helpers)?)
            }
            _ => None,
        };
        Ok(GeneratedRequest {
            method: self
                .request
                .method
                .clone()
                .unwrap_or_else(|| "GET".to_string()),
            url: url.to_string(),
            headers,
            body,
            timeout_override: None,
            from_raw: false,
            dynamic_values,
        })
    }

    fn make_from_raw(
        &self,
        base: &Url,
        rendered: &str,
        values: &VarMap,
        dynamic_values: VarMap,
        options: &ExecutorOptions,
    ) -> Result<GeneratedRequest> {
        let helpers = options.helpers.as_ref();
        let parsed = RawRequest::parse(rendered, base)?;
        let url = parsed.annotated_url()?;
        let mut headers = IndexMap::new();
        for (name, value) in &parsed.headers {
            if name.is_empty() {
                continue;
            }
            headers.insert(name.clone(), evaluate_template(value, values, helpers)?);
        }
        Ok(GeneratedRequest {
            method: parsed.method.clone(),
            url,
            headers,
            body: if parsed.body.is_empty() {
                None
            } else {
                Some(parsed.body.clone())
            },
            timeout_override: parsed.annotations.timeout,
            from_raw: true,
            dynamic_values,
        })
    }
}

/// Honor a `{{BaseURL}}:NNN` port preference: override the parsed port and
/// strip the literal from the entry.
fn apply_template_port(entry: &str, parsed: &mut Url) -> String {
    let Some(captures) = url_with_port_regex().captures(entry) else {
        return entry.to_string();
    };
    let port_text = &captures[1];
    if let Ok(port) = port_text.parse::<u16>() {
        let _ = parsed.set_port(Some(port));
    }
    if parsed.path().is_empty() {
        parsed.set_path("/");
    }
    entry.replace(&format!(":{port_text}"), "")
}

/// Built-in URL and domain variables for one parsed target.
pub fn url_variables(parsed: &Url, trailing_slash: bool) -> VarMap {
    let mut vars = VarMap::new();
    let domain = parsed.host_str().unwrap_or_default().to_string();
    let hostname = match parsed.port() {
        Some(port) => format!("{domain}:{port}"),
        None => domain.clone(),
    };
    let port = parsed
        .port_or_known_default()
        .map(|p| p.to_string())
        .unwrap_or_default();

    let mut base = parsed.to_string();
    if trailing_slash && base.ends_with('/') {
        base.pop();
    }

    let escaped_path = parsed.path();
    let (directory, file) = match escaped_path.rsplit_once('/') {
        Some((dir, file)) => (dir.to_string(), file.to_string()),
        None => (String::new(), escaped_path.to_string()),
    };

    vars.insert("BaseURL".into(), Value::from(base));
    vars.insert(
        "RootURL".into(),
        Value::from(format!("{}://{hostname}", parsed.scheme())),
    );
    vars.insert("Hostname".into(), Value::from(hostname));
    vars.insert("Host".into(), Value::from(domain.clone()));
    vars.insert("Port".into(), Value::from(port));
    vars.insert("Path".into(), Value::from(directory));
    vars.insert("File".into(), Value::from(file));
    vars.insert("Scheme".into(), Value::from(parsed.scheme()));

    for (name, value) in domain_variables(&domain) {
        vars.insert(name, value);
    }
    vars
}

/// Domain-shaped variables. A plain label split: the last label is the TLD,
/// the last two form the registered domain, the rest is the subdomain.
fn domain_variables(domain: &str) -> VarMap {
    let mut vars = VarMap::new();
    vars.insert("FQDN".into(), Value::from(domain));
    if domain.parse::<std::net::IpAddr>().is_ok() {
        return vars;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return vars;
    }
    let tld = labels[labels.len() - 1];
    let dn = labels[labels.len() - 2];
    let rdn = format!("{dn}.{tld}");
    let sd = labels[..labels.len() - 2].join(".");
    vars.insert("TLD".into(), Value::from(tld));
    vars.insert("DN".into(), Value::from(dn));
    vars.insert("RDN".into(), Value::from(rdn));
    vars.insert("SD".into(), Value::from(sd));
    vars
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn url_variables_for_full_url() {
        let parsed = Url::parse("https://www.example.com:8443/dir/file.php").unwrap();
        let vars = url_variables(&parsed, false);
        assert_eq!(
            vars.get("BaseURL").unwrap().to_string(),
            "https://www.example.com:8443/dir/file.php"
        );
        assert_eq!(
            vars.get("RootURL").unwrap().to_string(),
            "https://www.example.com:8443"
        );
        assert_eq!(
            vars.get("Hostname").unwrap().to_string(),
            "www.example.com:8443"
        );
        assert_eq!(vars.get("Host").unwrap().to_string(), "www.example.com");
        assert_eq!(vars.get("Port").unwrap().to_string(), "8443");
        assert_eq!(vars.get("Path").unwrap().to_string(), "/dir");
        assert_eq!(vars.get("File").unwrap().to_string(), "file.php");
        assert_eq!(vars.get("Scheme").unwrap().to_string(), "https");
    }

    #[test]
    fn default_port_is_derived_from_scheme() {
        let parsed = Url::parse("http://example.com").unwrap();
        let vars = url_variables(&parsed, false);
        assert_eq!(vars.get("Port").unwrap().to_string(), "80");
        assert_eq!(vars.get("Hostname").unwrap().to_string(), "example.com");
    }

    #[test]
    fn domain_variables_split_labels() {
        let vars = domain_variables("www.example.co");
        assert_eq!(vars.get("FQDN").unwrap().to_string(), "www.example.co");
        assert_eq!(vars.get("TLD").unwrap().to_string(), "co");
        assert_eq!(vars.get("DN").unwrap().to_string(), "example");
        assert_eq!(vars.get("RDN").unwrap().to_string(), "example.co");
        assert_eq!(vars.get("SD").unwrap().to_string(), "www");
    }

    #[test]
    fn ip_targets_only_get_fqdn() {
        let vars = domain_variables("10.0.0.1");
        assert_eq!(vars.get("FQDN").unwrap().to_string(), "10.0.0.1");
        assert!(!vars.contains_key("TLD"));
    }

    #[test]
    fn template_port_overrides_target() {
        let mut parsed = Url::parse("http://example.com:8080/").unwrap();
        let entry = apply_template_port("{{BaseURL}}:9090/manager", &mut parsed);
        assert_eq!(parsed.port(), Some(9090));
        assert_eq!(entry, "{{BaseURL}}/manager");
    }

    #[test]
    fn entries_without_port_literal_are_untouched() {
        let mut parsed = Url::parse("http://example.com:8080/").unwrap();
        let entry = apply_template_port("{{BaseURL}}/manager", &mut parsed);
        assert_eq!(parsed.port(), Some(8080));
        assert_eq!(entry, "{{BaseURL}}/manager");
    }
}
