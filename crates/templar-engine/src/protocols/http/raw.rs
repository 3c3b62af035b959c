//! Raw request texts: the request-line grammar plus the `@`-annotation
//! directives that override target host and timeout per probe.

use std::time::Duration;

use indexmap::IndexMap;
use url::Url;

use crate::error::{Error, Result};

/// Out-of-band directives embedded in a raw request text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotations {
    /// `@Host:` overrides the target host, keeping the configured port
    /// when the override does not name one.
    pub host: Option<String>,
    /// `@timeout:` sets a per-probe timeout override.
    pub timeout: Option<Duration>,
}

/// A raw request parsed into its wire components.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRequest {
    pub method: String,
    /// Path plus query, exactly as in the request line.
    pub path: String,
    pub full_url: String,
    pub headers: IndexMap<String, String>,
    pub body: String,
    pub annotations: Annotations,
}

impl RawRequest {
    /// Parse a raw request against the base URL of the target.
    ///
    /// Annotation lines may precede the request line and are stripped before
    /// parsing. A bare path request line is resolved against the base URL;
    /// an absolute URL is taken as-is.
    pub fn parse(raw: &str, base_url: &Url) -> Result<Self> {
        let mut annotations = Annotations::default();
        let mut lines = Vec::new();
        for line in raw.lines() {
            if let Some(value) = line.strip_prefix("@Host:") {
                annotations.host = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("@timeout:") {
                annotations.timeout = parse_duration(value.trim());
            } else {
                lines.push(line);
            }
        }
        while lines.first().is_some_and(|l| l.trim().is_empty()) {
            lines.remove(0);
        }
        let request_line = lines
            .first()
            .ok_or_else(|| Error::Parse("raw request is empty".to_string()))?;

        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| Error::Parse(format!("invalid request line: {request_line}")))?
            .to_string();
        let path = parts
            .next()
            .ok_or_else(|| Error::Parse(format!("invalid request line: {request_line}")))?
            .to_string();

        let mut headers = IndexMap::new();
        let mut body_start = lines.len();
        for (index, line) in lines.iter().enumerate().skip(1) {
            if line.trim().is_empty() {
                body_start = index + 1;
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }
        let body = if body_start < lines.len() {
            lines[body_start..].join("\r\n")
        } else {
            String::new()
        };

        let full_url = if path.starts_with("http://") || path.starts_with("https://") {
            path.clone()
        } else {
            let mut joined = base_url.clone();
            joined.set_query(None);
            let (p, q) = match path.split_once('?') {
                Some((p, q)) => (p, Some(q)),
                None => (path.as_str(), None),
            };
            joined.set_path(p);
            joined.set_query(q);
            joined.to_string()
        };

        Ok(Self {
            method,
            path,
            full_url,
            headers,
            body,
            annotations,
        })
    }

    /// Render back to wire text. Round-trips method, path, headers and body.
    pub fn to_wire(&self) -> String {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.path);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }

    /// The URL after applying the `@Host:` annotation, keeping the
    /// configured port when the override names none.
    pub fn annotated_url(&self) -> Result<String> {
        let Some(host) = self.annotations.host.as_deref() else {
            return Ok(self.full_url.clone());
        };
        let mut url = Url::parse(&self.full_url)
            .map_err(|e| Error::Parse(format!("invalid raw request url: {e}")))?;
        let mut value = host;
        if let Some(rest) = value.strip_prefix("http://") {
            let _ = url.set_scheme("http");
            value = rest;
        } else if let Some(rest) = value.strip_prefix("https://") {
            let _ = url.set_scheme("https");
            value = rest;
        }
        let port = url.port();
        if let Some((host_part, port_part)) = value.rsplit_once(':') {
            if let Ok(explicit) = port_part.parse::<u16>() {
                url.set_host(Some(host_part))
                    .map_err(|e| Error::Parse(format!("invalid @Host value: {e}")))?;
                let _ = url.set_port(Some(explicit));
                return Ok(url.to_string());
            }
        }
        url.set_host(Some(value))
            .map_err(|e| Error::Parse(format!("invalid @Host value: {e}")))?;
        if let Some(port) = port {
            let _ = url.set_port(Some(port));
        }
        Ok(url.to_string())
    }
}

/// Parse `5s` / `500ms` / `2m` / bare seconds.
fn parse_duration(value: &str) -> Option<Duration> {
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = value.strip_suffix('s') {
        return secs.trim().parse().ok().map(Duration::from_secs);
    }
    if let Some(mins) = value.strip_suffix('m') {
        return mins
            .trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    value.parse().ok().map(Duration::from_secs)
}
