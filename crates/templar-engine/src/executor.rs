//! Drives a template's compiled requests in order, threading dynamic values
//! from one request block to the next and folding every emitted event into
//! the final result.

use templar_common::value::VarMap;

use crate::error::Result;
use crate::operators::OperatorResult;
use crate::protocols::{ExecutorOptions, ProtocolRequest, ScanContext, WrappedEvent};

/// Owns the compiled requests of one template.
#[derive(Debug, Clone)]
pub struct Executor {
    requests: Vec<ProtocolRequest>,
    options: ExecutorOptions,
}

impl Executor {
    pub fn new(requests: Vec<ProtocolRequest>, options: ExecutorOptions) -> Self {
        Self { requests, options }
    }

    pub fn compile(&mut self) -> Result<()> {
        let options = self.options.clone();
        for request in &mut self.requests {
            request.compile(&options)?;
        }
        Ok(())
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Total probes across all request blocks.
    pub fn requests(&self) -> usize {
        self.requests.iter().map(ProtocolRequest::requests).sum()
    }

    /// Run every request block against the scan context.
    ///
    /// Dynamic values extracted by block N are visible to block N+1. Probe
    /// errors are recorded on the context; only stop-execution ends a block
    /// early, and it never fails the scan.
    pub fn execute(&self, ctx: &ScanContext) -> Result<Option<OperatorResult>> {
        let mut dynamic_values = VarMap::new();
        let mut previous = VarMap::new();
        let mut folded: Option<OperatorResult> = None;

        for request in &self.requests {
            let mut emitted: Vec<WrappedEvent> = Vec::new();
            let mut callback = |event: WrappedEvent| emitted.push(event);
            let outcome = request.execute(ctx, &mut dynamic_values, &mut previous, &mut callback);

            for event in emitted {
                if let Some(result) = event.operators_result.as_ref() {
                    for (name, values) in &result.dynamic_values {
                        dynamic_values.insert(
                            name.clone(),
                            templar_common::value::extracted_value(values.clone()),
                        );
                    }
                    match &mut folded {
                        None => folded = Some(result.clone()),
                        Some(existing) => existing.merge(result),
                    }
                }
                ctx.log_event(event);
            }

            if let Err(err) = outcome {
                if !err.is_stop_execution() {
                    ctx.log_error(&err);
                }
            }
        }
        Ok(folded)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocols::FileRequest;
    use std::io::Write;

    #[test]
    fn executor_folds_results_across_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "alpha beta").unwrap();

        let first: FileRequest = serde_yaml::from_str(
            r"
matchers:
  - type: word
    name: first
    words:
      - alpha
",
        )
        .unwrap();
        let second: FileRequest = serde_yaml::from_str(
            r"
matchers:
  - type: word
    name: second
    words:
      - beta
",
        )
        .unwrap();

        let mut executor = Executor::new(
            vec![
                ProtocolRequest::File(first),
                ProtocolRequest::File(second),
            ],
            ExecutorOptions::default(),
        );
        executor.compile().unwrap();
        assert_eq!(executor.requests(), 2);

        let ctx = ScanContext::new(path.to_str().unwrap().to_string());
        let result = executor.execute(&ctx).unwrap().unwrap();
        assert!(result.matched);
        assert!(result.matches.contains_key("first"));
        assert!(result.matches.contains_key("second"));
        assert_eq!(ctx.event_count(), 2);
    }

    #[test]
    fn executor_with_no_findings_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, "nothing").unwrap();

        let request: FileRequest = serde_yaml::from_str(
            r"
matchers:
  - type: word
    words:
      - missing-token
",
        )
        .unwrap();
        let mut executor = Executor::new(
            vec![ProtocolRequest::File(request)],
            ExecutorOptions::default(),
        );
        executor.compile().unwrap();
        let ctx = ScanContext::new(path.to_str().unwrap().to_string());
        assert!(executor.execute(&ctx).unwrap().is_none());
    }
}
