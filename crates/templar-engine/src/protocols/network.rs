//! The network protocol: raw TCP exchanges described as an ordered list of
//! input frames, with named reads feeding extracted values back into the
//! running variable scope.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use templar_common::replace::{evaluate_template, replace};
use templar_common::value::{Value, VarMap};

use crate::error::{Error, Result};
use crate::operators::Operators;
use crate::payloads::{AttackKind, PayloadGenerator};
use crate::protocols::{
    ExecutorOptions, InternalEvent, OutputEventCallback, ScalarValue, ScanContext, WrappedEvent,
    make_result_events,
};

const DEFAULT_READ_SIZE: usize = 1024;
const READ_DEADLINE: Duration = Duration::from_secs(2);
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// One frame written to the socket. Hex-typed frames are decoded before any
/// substitution; a `read` count captures the reply into `name`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NetworkInput {
    pub data: Option<ScalarValue>,
    pub read: usize,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone)]
struct AddressEntry {
    value: String,
    tls: bool,
}

/// A network request block: addresses to dial plus the frames to exchange.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NetworkRequest {
    #[serde(flatten)]
    pub operators: Operators,
    /// Address entries; `tls://` marks an entry for TLS. A missing port is a
    /// compile-visible error at execution.
    #[serde(alias = "address")]
    pub host: Vec<String>,
    pub inputs: Vec<NetworkInput>,
    #[serde(rename = "attack")]
    pub attack: Option<AttackKind>,
    pub payloads: IndexMap<String, Vec<ScalarValue>>,
    /// Bytes for the final read; 0 means the 1024-byte default.
    pub read_size: usize,
    /// Drain the socket until EOF or the idle timer instead of one read.
    pub read_all: bool,

    #[serde(skip)]
    compiled: Option<Compiled>,
}

#[derive(Debug, Clone)]
struct Compiled {
    addresses: Vec<AddressEntry>,
    generator: Option<PayloadGenerator>,
    attack: AttackKind,
    options: ExecutorOptions,
}

impl NetworkRequest {
    pub fn compile(&mut self, options: &ExecutorOptions) -> Result<()> {
        if !self.operators.is_empty() {
            self.operators.compile()?;
        }

        let addresses = self
            .host
            .iter()
            .map(|entry| match entry.strip_prefix("tls://") {
                Some(rest) => AddressEntry {
                    value: rest.to_string(),
                    tls: true,
                },
                None => AddressEntry {
                    value: entry.clone(),
                    tls: false,
                },
            })
            .collect();

        let mut generator = None;
        let attack = options
            .options
            .attack_type
            .or(self.attack)
            .unwrap_or_default();
        if !self.payloads.is_empty() {
            let lists: IndexMap<String, Vec<String>> = self
                .payloads
                .iter()
                .map(|(name, values)| {
                    (
                        name.clone(),
                        values.iter().map(ToString::to_string).collect(),
                    )
                })
                .collect();
            generator = Some(PayloadGenerator::new(lists, attack));
        }

        self.compiled = Some(Compiled {
            addresses,
            generator,
            attack,
            options: options.clone(),
        });
        Ok(())
    }

    pub fn requests(&self) -> usize {
        self.compiled.as_ref().map_or(0, |c| {
            let tuples = c.generator.as_ref().map_or(1, PayloadGenerator::total);
            c.addresses.len() * tuples.max(1)
        })
    }

    /// Part selector resolution for network events: the primary corpus is
    /// the accumulated response under `data`.
    fn resolve_part(part: &str, data: &VarMap) -> Option<String> {
        let part = match part {
            "" | "body" | "all" => "data",
            other => other,
        };
        data.get(part).map(ToString::to_string)
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

        let scope = {
            let mut merged = previous.clone();
            merged.extend(dynamic_values.clone());
            merged
        };
        for (name, value) in options.variables.evaluate(&scope, &options.helpers) {
            dynamic_values.entry(name).or_insert(value);
        }

        let address = host_from_target(ctx.target());
        dynamic_values.insert("Hostname".into(), Value::from(address.clone()));

        for entry in &compiled.addresses {
            if entry.tls {
                // The TLS dial path is not wired up; the entry is recorded
                // and skipped rather than probed in the clear.
                ctx.log_warning(format!("skipping tls address {}", entry.value));
                continue;
            }
            let variables = address_variables(&address);
            let actual = replace(&entry.value, &variables);
            if let Err(err) =
                self.execute_address(ctx, &variables, &actual, dynamic_values, callback)
            {
                if err.is_stop_execution() {
                    return Err(err);
                }
                ctx.log_error(&err);
            }
        }
        Ok(())
    }

    fn execute_address(
        &self,
        ctx: &ScanContext,
        variables: &VarMap,
        actual_address: &str,
        dynamic_values: &VarMap,
        callback: OutputEventCallback<'_>,
    ) -> Result<()> {
        let compiled = self
            .compiled
            .as_ref()
            .ok_or_else(|| Error::Parse("request executed before compile".to_string()))?;
        if !actual_address.contains(':') {
            return Err(Error::MissingPort(actual_address.to_string()));
        }

        let mut base_payloads = compiled.options.options.payload_values();
        base_payloads.extend(variables.clone());
        base_payloads.extend(dynamic_values.clone());

        // Caller-supplied payloads take precedence over the template's own
        // generator.
        let iterator = match ctx.payloads() {
            Some(seed) => Some(PayloadGenerator::new(seed.clone(), compiled.attack).iterator()),
            None => compiled.generator.as_ref().map(PayloadGenerator::iterator),
        };

        match iterator {
            Some(mut iterator) => {
                while let Some(tuple) = iterator.value() {
                    let mut payloads = base_payloads.clone();
                    for (name, value) in tuple {
                        payloads.insert(name, Value::from(value));
                    }
                    self.exchange(ctx, actual_address, payloads, callback)?;
                }
                Ok(())
            }
            None => self.exchange(ctx, actual_address, base_payloads.clone(), callback),
        }
    }

    /// Dial, play the input frames, read the reply, run operators.
    fn exchange(
        &self,
        ctx: &ScanContext,
        address: &str,
        mut payloads: VarMap,
        callback: OutputEventCallback<'_>,
    ) -> Result<()> {
        let compiled = self
            .compiled
            .as_ref()
            .ok_or_else(|| Error::Parse("request executed before compile".to_string()))?;
        let options = &compiled.options;
        let timeout = Duration::from_secs(options.options.timeout);

        tracing::debug!(%address, "dialing");
        let mut conn = TcpStream::connect_timeout(
            &address
                .parse()
                .or_else(|_| resolve_first(address))
                .map_err(|e| Error::Dial(format!("{address}: {e}")))?,
            timeout,
        )
        .map_err(|e| Error::Dial(format!("{address}: {e}")))?;
        conn.set_read_timeout(Some(READ_DEADLINE))
            .map_err(|e| Error::Dial(e.to_string()))?;

        let mut response = String::new();
        let mut input_events = VarMap::new();

        for input in &self.inputs {
            let raw = input
                .data
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            let frame: Vec<u8> = if input.kind.as_deref() == Some("hex") {
                let decoded = hex::decode(raw.trim())
                    .map_err(|e| Error::Write(format!("invalid hex input: {e}")))?;
                match String::from_utf8(decoded.clone()) {
                    Ok(text) => evaluate_template(&text, &payloads, &options.helpers)?
                        .into_bytes(),
                    // Binary frames cannot carry placeholders; send verbatim.
                    Err(_) => decoded,
                }
            } else {
                evaluate_template(&raw, &payloads, &options.helpers)?.into_bytes()
            };

            conn.write_all(&frame)
                .map_err(|e| Error::Write(e.to_string()))?;

            if input.read > 0 {
                let mut buffer = vec![0_u8; input.read];
                let n = conn
                    .read(&mut buffer)
                    .map_err(|e| Error::Read(e.to_string()))?;
                let chunk = String::from_utf8_lossy(&buffer[..n]).into_owned();
                response.push_str(&chunk);
                if let Some(name) = input.name.as_deref() {
                    input_events.insert(name.to_string(), Value::from(chunk.clone()));
                    // Internal extractors over just this read feed the
                    // remaining frames.
                    let mut scoped = VarMap::new();
                    scoped.insert(name.to_string(), Value::from(chunk));
                    let found = self.operators.execute_internal_extractors(
                        &scoped,
                        &options.helpers,
                        Self::resolve_part,
                    );
                    payloads.extend(found);
                }
            }
        }

        let read_size = if self.read_size == 0 {
            DEFAULT_READ_SIZE
        } else {
            self.read_size
        };
        if self.read_all {
            conn.set_read_timeout(Some(SETTLE_DELAY))
                .map_err(|e| Error::Read(e.to_string()))?;
            let mut buffer = vec![0_u8; read_size];
            loop {
                match conn.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => response.push_str(&String::from_utf8_lossy(&buffer[..n])),
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        break;
                    }
                    Err(e) => return Err(Error::Read(e.to_string())),
                }
            }
        } else {
            std::thread::sleep(SETTLE_DELAY);
            let mut buffer = vec![0_u8; read_size];
            match conn.read(&mut buffer) {
                Ok(n) => response.push_str(&String::from_utf8_lossy(&buffer[..n])),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(Error::Read(e.to_string())),
            }
        }

        let mut event: InternalEvent = payloads.clone();
        event.extend(input_events);
        event.insert("data".into(), Value::from(response));
        event.insert("host".into(), Value::from(ctx.target()));
        event.insert("matched".into(), Value::from(address));
        event.insert("type".into(), Value::from("network"));
        event.insert(
            "template-id".into(),
            Value::from(options.template_id.clone()),
        );

        if !self.operators.is_empty() {
            if let Some(mut result) =
                self.operators
                    .execute(&mut event, &options.helpers, Self::resolve_part)
            {
                result.payload_values = payloads;
                let mut wrapped = WrappedEvent {
                    internal: event,
                    operators_result: Some(result),
                    results: Vec::new(),
                };
                wrapped.results = make_result_events("network", &wrapped);
                callback(wrapped);
            }
        }
        Ok(())
    }
}

/// Strip a scheme from the target, keeping `host[:port]`.
fn host_from_target(target: &str) -> String {
    if let Some((_, rest)) = target.split_once("://") {
        rest.split('/').next().unwrap_or(rest).to_string()
    } else {
        target.to_string()
    }
}

/// `Hostname`, `Host` and `Port` variables for one address.
fn address_variables(address: &str) -> VarMap {
    let mut vars = VarMap::new();
    vars.insert("Hostname".into(), Value::from(address));
    match address.rsplit_once(':') {
        Some((host, port)) => {
            vars.insert("Host".into(), Value::from(host));
            vars.insert("Port".into(), Value::from(port));
        }
        None => {
            vars.insert("Host".into(), Value::from(address));
        }
    }
    vars
}

/// Resolve a `host:port` address to its first socket address.
fn resolve_first(address: &str) -> std::io::Result<std::net::SocketAddr> {
    use std::net::ToSocketAddrs;
    address.to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_inputs_and_aliases() {
        let request: NetworkRequest = serde_yaml::from_str(
            r#"
host:
  - '{{Hostname}}'
  - 'tls://{{Hostname}}:443'
inputs:
  - data: "0000000800030000"
    type: hex
    read: 1024
    name: banner
read-size: 2048
"#,
        )
        .unwrap();
        assert_eq!(request.host.len(), 2);
        assert_eq!(request.inputs[0].kind.as_deref(), Some("hex"));
        assert_eq!(request.inputs[0].read, 1024);
        assert_eq!(request.read_size, 2048);
    }

    #[test]
    fn compile_splits_tls_addresses() {
        let mut request: NetworkRequest =
            serde_yaml::from_str("host: ['tls://x:443', 'x:80']").unwrap();
        request.compile(&ExecutorOptions::default()).unwrap();
        let compiled = request.compiled.as_ref().unwrap();
        assert!(compiled.addresses[0].tls);
        assert_eq!(compiled.addresses[0].value, "x:443");
        assert!(!compiled.addresses[1].tls);
    }

    #[test]
    fn requests_counts_addresses_times_tuples() {
        let mut request: NetworkRequest = serde_yaml::from_str(
            r"
host: ['a:1', 'b:2']
attack: sniper
payloads:
  probe:
    - x
    - y
    - z
",
        )
        .unwrap();
        request.compile(&ExecutorOptions::default()).unwrap();
        assert_eq!(request.requests(), 6);
    }

    #[test]
    fn missing_port_is_an_error() {
        let mut request: NetworkRequest = serde_yaml::from_str("host: ['{{Hostname}}']").unwrap();
        request.compile(&ExecutorOptions::default()).unwrap();
        let ctx = ScanContext::new("hostwithoutport");
        let mut dynamic = VarMap::new();
        let mut previous = VarMap::new();
        let mut seen = 0;
        let mut cb = |_event: WrappedEvent| {
            seen += 1;
        };
        request
            .execute(&ctx, &mut dynamic, &mut previous, &mut cb)
            .unwrap();
        assert_eq!(seen, 0);
        assert!(ctx.first_error().unwrap().contains("no port"));
    }

    #[test]
    fn host_from_target_strips_scheme() {
        assert_eq!(host_from_target("tcp://h:99/x"), "h:99");
        assert_eq!(host_from_target("h:99"), "h:99");
    }

    #[test]
    fn address_variables_split_host_and_port() {
        let vars = address_variables("db.internal:5432");
        assert_eq!(vars.get("Host").unwrap().to_string(), "db.internal");
        assert_eq!(vars.get("Port").unwrap().to_string(), "5432");
        assert_eq!(
            vars.get("Hostname").unwrap().to_string(),
            "db.internal:5432"
        );
    }
}
