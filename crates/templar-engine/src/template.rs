//! The template document: deserialization, alias folding, executor selection
//! and the top-level execute entrypoint.

use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::operators::OperatorResult;
use crate::protocols::{
    ExecutorOptions, FileRequest, HttpRequest, NetworkRequest, Options, ProtocolRequest,
    ScanContext, Variables,
};

/// Human metadata carried by a template.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Info {
    pub name: String,
    pub author: Option<String>,
    pub severity: Option<String>,
    pub description: Option<String>,
    #[serde(deserialize_with = "string_or_list", default)]
    pub reference: Vec<String>,
    pub tags: Option<String>,
    pub classification: Option<serde_yaml::Value>,
    pub metadata: Option<serde_yaml::Value>,
}

/// A declarative scan template: identity, metadata, request blocks of one
/// protocol, and a variables block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Template {
    pub id: String,
    pub info: Info,
    /// Advisory flag: the template is noisy or dangerous and may be refused.
    pub opsec: bool,
    #[serde(rename = "finger")]
    pub fingers: Vec<String>,
    #[serde(rename = "chain")]
    pub chains: Vec<String>,
    pub variables: Variables,
    #[serde(alias = "requests")]
    pub http: Vec<HttpRequest>,
    pub network: Vec<NetworkRequest>,
    /// Folded into `network` at compile time.
    pub tcp: Vec<NetworkRequest>,
    /// Folded into `network` at compile time.
    pub udp: Vec<NetworkRequest>,
    pub file: Vec<FileRequest>,

    #[serde(skip)]
    executor: Option<Executor>,
    #[serde(skip)]
    total_requests: usize,
}

impl Template {
    /// Load a template from YAML text. The result still needs [`compile`].
    ///
    /// [`compile`]: Template::compile
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Comma-separated tags, split.
    pub fn tags(&self) -> Vec<String> {
        self.info
            .tags
            .as_deref()
            .map(|tags| {
                tags.split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Compile the template: fold protocol aliases, validate requests and
    /// build the executor. When several protocol blocks are present the last
    /// compiled one wins.
    pub fn compile(&mut self, options: Arc<Options>) -> Result<()> {
        self.network.append(&mut self.tcp);
        self.network.append(&mut self.udp);

        if self.http.iter().any(|r| r.unsafe_raw) {
            return Err(Error::UnsupportedUnsafe);
        }

        let executor_options = ExecutorOptions {
            template_id: self.id.clone(),
            variables: self.variables.clone(),
            options,
            helpers: Arc::new(templar_common::dsl::HelperRegistry::default()),
        };

        let mut executor = None;
        if !self.http.is_empty() {
            let requests = self.http.drain(..).map(ProtocolRequest::Http).collect();
            executor = Some(Executor::new(requests, executor_options.clone()));
        }
        if !self.network.is_empty() {
            let requests = self
                .network
                .drain(..)
                .map(ProtocolRequest::Network)
                .collect();
            executor = Some(Executor::new(requests, executor_options.clone()));
        }
        if !self.file.is_empty() {
            let requests = self.file.drain(..).map(ProtocolRequest::File).collect();
            executor = Some(Executor::new(requests, executor_options));
        }

        let Some(mut executor) = executor else {
            return Err(Error::EmptyTemplate);
        };
        executor.compile()?;
        self.total_requests = executor.requests();
        self.executor = Some(executor);
        Ok(())
    }

    /// Total probes the compiled template will perform.
    pub fn total_requests(&self) -> usize {
        self.total_requests
    }

    pub fn executor(&self) -> Option<&Executor> {
        self.executor.as_ref()
    }

    /// Run the compiled template against a prepared scan context.
    ///
    /// An opsec-flagged template combined with opsec-conservative options is
    /// refused before any I/O.
    pub fn execute(&self, ctx: &ScanContext) -> Result<Option<OperatorResult>> {
        let executor = self
            .executor
            .as_ref()
            .ok_or_else(|| Error::Parse("template executed before compile".to_string()))?;
        if self.opsec && executor.options().options.opsec {
            tracing::debug!(template = %self.id, "refused by opsec policy");
            return Err(Error::Opsec);
        }
        executor.execute(ctx)
    }

    /// Convenience wrapper: build a context for `target` and execute.
    pub fn execute_target(&self, target: &str) -> Result<Option<OperatorResult>> {
        self.execute(&ScanContext::new(target))
    }
}

fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
    }
    Ok(match StringOrList::deserialize(deserializer)? {
        StringOrList::One(s) => vec![s],
        StringOrList::Many(list) => list,
    })
}
