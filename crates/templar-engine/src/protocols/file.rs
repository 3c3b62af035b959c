//! The file protocol: stream files under a root through the operators,
//! line-by-line for OR blocks and chunk-wise for AND blocks, walking
//! tar/gzip archives transparently.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use serde::Deserialize;
use templar_common::value::{Value, VarMap};

use crate::error::{Error, Result};
use crate::operators::{Condition, Operators};
use crate::protocols::{
    ExecutorOptions, InternalEvent, OutputEventCallback, ScanContext, WrappedEvent,
    make_result_events,
};

/// Upper bound on bytes examined per file.
const DEFAULT_MAX_SIZE: u64 = 5 * 1024 * 1024;
/// Chunk size for AND-condition scans.
const DEFAULT_MAX_READ_SIZE: usize = 1 << 22;

/// One match or extraction found while streaming a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMatch {
    pub data: String,
    pub line: usize,
    pub byte_index: usize,
    pub is_match: bool,
    pub is_extract: bool,
    pub expr: String,
    pub raw: String,
}

/// A file request block: glob and size constraints plus operators.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FileRequest {
    #[serde(flatten)]
    pub operators: Operators,
    /// Glob patterns matched under the target root. Empty means every file.
    pub glob: Vec<String>,
    /// Extensions to accept (without dot). Empty means all.
    pub extensions: Vec<String>,
    /// Per-file byte cap.
    pub max_size: Option<u64>,

    #[serde(skip)]
    compiled: Option<Compiled>,
}

#[derive(Debug, Clone)]
struct Compiled {
    options: ExecutorOptions,
}

impl FileRequest {
    pub fn compile(&mut self, options: &ExecutorOptions) -> Result<()> {
        if !self.operators.is_empty() {
            self.operators.compile()?;
        }
        self.compiled = Some(Compiled {
            options: options.clone(),
        });
        Ok(())
    }

    /// The file walk is target-dependent; one probe is advertised per block.
    pub fn requests(&self) -> usize {
        1
    }

    fn resolve_part(part: &str, data: &VarMap) -> Option<String> {
        let part = match part {
            "" | "body" | "all" | "data" => "raw",
            other => other,
        };
        data.get(part).map(ToString::to_string)
    }

    fn max_size(&self) -> u64 {
        self.max_size.unwrap_or(DEFAULT_MAX_SIZE)
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

        let mut merged_previous = previous.clone();
        merged_previous.extend(dynamic_values.clone());

        for path in self.input_paths(ctx.target())? {
            let result = self.process_path(ctx.target(), &path, &merged_previous);
            match result {
                Ok(Some(event)) => callback(event),
                Ok(None) => {}
                Err(err) => ctx.log_error(&err),
            }
        }
        Ok(())
    }

    /// Files under the target matching the glob and extension constraints.
    /// A target that is itself a file is taken as-is.
    fn input_paths(&self, target: &str) -> Result<Vec<PathBuf>> {
        let root = Path::new(target);
        if root.is_file() {
            return Ok(vec![root.to_path_buf()]);
        }
        if !root.is_dir() {
            return Err(Error::Read(format!("no such path: {target}")));
        }
        let patterns: Vec<String> = if self.glob.is_empty() {
            vec!["**/*".to_string()]
        } else {
            self.glob.clone()
        };
        let mut paths = Vec::new();
        for pattern in &patterns {
            let full = root.join(pattern);
            let full = full.to_string_lossy().into_owned();
            let entries = glob::glob(&full)
                .map_err(|e| Error::Read(format!("bad glob {pattern:?}: {e}")))?;
            for entry in entries.flatten() {
                if entry.is_file() && self.accepts_extension(&entry) {
                    paths.push(entry);
                }
            }
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    fn accepts_extension(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|want| want == ext))
    }

    fn process_path(
        &self,
        input: &str,
        path: &Path,
        previous: &VarMap,
    ) -> Result<Option<WrappedEvent>> {
        let name = path.to_string_lossy().into_owned();
        if name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            return self.process_archive(input, path, previous);
        }
        if name.ends_with(".gz") {
            let file = File::open(path).map_err(|e| Error::Read(format!("{name}: {e}")))?;
            let reader = GzDecoder::new(file);
            return self.process_reader(reader, input, &name, previous);
        }
        let file = File::open(path).map_err(|e| Error::Read(format!("{name}: {e}")))?;
        self.process_reader(file, input, &name, previous)
    }

    /// Walk a tar archive, scanning each regular entry whose path stays
    /// inside the archive root.
    fn process_archive(
        &self,
        input: &str,
        path: &Path,
        previous: &VarMap,
    ) -> Result<Option<WrappedEvent>> {
        let name = path.to_string_lossy().into_owned();
        let file = File::open(path).map_err(|e| Error::Read(format!("{name}: {e}")))?;
        let reader: Box<dyn Read> = if name.ends_with(".tar") {
            Box::new(file)
        } else {
            Box::new(GzDecoder::new(file))
        };
        let mut archive = tar::Archive::new(reader);
        let mut folded: Option<WrappedEvent> = None;
        let entries = archive
            .entries()
            .map_err(|e| Error::Read(format!("{name}: {e}")))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| Error::Read(format!("{name}: {e}")))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let entry_path = entry
                .path()
                .map_err(|e| Error::Read(format!("{name}: {e}")))?
                .into_owned();
            if !path_is_contained(&entry_path) {
                tracing::warn!(entry = %entry_path.display(), archive = %name, "skipping entry outside archive root");
                continue;
            }
            let entry_name = format!("{name}/{}", entry_path.display());
            let mut content = Vec::new();
            (&mut entry)
                .take(self.max_size())
                .read_to_end(&mut content)
                .map_err(|e| Error::Read(format!("{entry_name}: {e}")))?;
            if let Some(event) =
                self.process_reader(Cursor::new(content), input, &entry_name, previous)?
            {
                match &mut folded {
                    None => folded = Some(event),
                    Some(existing) => merge_events(existing, event),
                }
            }
        }
        Ok(folded)
    }

    fn process_reader<R: Read>(
        &self,
        reader: R,
        input: &str,
        file_path: &str,
        previous: &VarMap,
    ) -> Result<Option<WrappedEvent>> {
        let limited = reader.take(self.max_size());
        let (matches, result) = self.find_matches(limited, input, file_path, previous)?;
        let Some(result) = result else {
            return Ok(None);
        };
        if !result.matched && !result.extracted && matches.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.build_event(input, file_path, matches, result, previous)))
    }

    /// Scan the stream, one operators pass per line (OR) or per chunk (AND),
    /// folding all chunk results into one.
    fn find_matches<R: Read>(
        &self,
        reader: R,
        input: &str,
        file_path: &str,
        previous: &VarMap,
    ) -> Result<(Vec<FileMatch>, Option<crate::operators::OperatorResult>)> {
        let compiled = self
            .compiled
            .as_ref()
            .ok_or_else(|| Error::Parse("request executed before compile".to_string()))?;
        let options = &compiled.options;

        let mut matches = Vec::new();
        let mut folded: Option<crate::operators::OperatorResult> = None;
        let mut lines_count = 0_usize;
        let mut bytes_count = 0_usize;

        let mut chunks = ChunkReader::new(reader, self.operators.condition());
        while let Some(chunk) = chunks.next_chunk()? {
            let mut data: InternalEvent = previous.clone();
            data.insert("path".into(), Value::from(input));
            data.insert("matched".into(), Value::from(file_path));
            data.insert("raw".into(), Value::from(chunk.as_str()));
            data.insert("type".into(), Value::from("file"));
            data.insert(
                "template-id".into(),
                Value::from(options.template_id.clone()),
            );

            if let Some(result) =
                self.operators
                    .execute(&mut data, &options.helpers, Self::resolve_part)
            {
                if result.matched || result.extracted {
                    record_file_matches(
                        &mut matches,
                        &result,
                        lines_count + 1,
                        bytes_count,
                        &chunk,
                    );
                }
                match &mut folded {
                    None => folded = Some(result),
                    Some(existing) => existing.merge(&result),
                }
            }

            lines_count += 1 + chunk.matches('\n').count();
            bytes_count += chunk.len();
        }
        Ok((matches, folded))
    }

    fn build_event(
        &self,
        input: &str,
        file_path: &str,
        matches: Vec<FileMatch>,
        result: crate::operators::OperatorResult,
        previous: &VarMap,
    ) -> WrappedEvent {
        let template_id = self
            .compiled
            .as_ref()
            .map(|c| c.options.template_id.clone())
            .unwrap_or_default();

        let mut internal: InternalEvent = previous.clone();
        internal.insert("path".into(), Value::from(input));
        internal.insert("matched".into(), Value::from(file_path));
        internal.insert("raw".into(), Value::from(""));
        internal.insert("type".into(), Value::from("file"));
        internal.insert("template-id".into(), Value::from(template_id));

        let mut expr_lines: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for file_match in &matches {
            expr_lines
                .entry(file_match.expr.clone())
                .or_default()
                .push(file_match.line);
        }

        let mut wrapped = WrappedEvent {
            internal,
            operators_result: Some(result),
            results: Vec::new(),
        };
        wrapped.results = make_result_events("file", &wrapped);
        for event in &mut wrapped.results {
            let key = event
                .matcher_name
                .as_deref()
                .or(event.extractor_name.as_deref());
            let mut lines = match key {
                Some(key) => expr_lines.get(key).cloned().unwrap_or_default(),
                None => event
                    .extracted_results
                    .iter()
                    .flat_map(|value| {
                        expr_lines.get(value).cloned().unwrap_or_default()
                    })
                    .collect(),
            };
            lines.sort_unstable();
            lines.dedup();
            event.lines = lines;
        }
        wrapped
    }
}

/// Append (line, byte-index, expression, raw) records for everything one
/// chunk's operator pass produced.
fn record_file_matches(
    matches: &mut Vec<FileMatch>,
    result: &crate::operators::OperatorResult,
    line: usize,
    byte_index: usize,
    raw: &str,
) {
    for (expr, values) in &result.extracts {
        for value in values {
            matches.push(FileMatch {
                data: value.clone(),
                line,
                byte_index,
                is_match: false,
                is_extract: true,
                expr: expr.clone(),
                raw: raw.to_string(),
            });
        }
    }
    for (expr, snippets) in &result.matches {
        for snippet in snippets {
            matches.push(FileMatch {
                data: snippet.clone(),
                line,
                byte_index,
                is_match: true,
                is_extract: false,
                expr: expr.clone(),
                raw: raw.to_string(),
            });
        }
    }
    for value in &result.output_extracts {
        matches.push(FileMatch {
            data: value.clone(),
            line,
            byte_index,
            is_match: true,
            is_extract: false,
            expr: value.clone(),
            raw: raw.to_string(),
        });
    }
}

fn merge_events(existing: &mut WrappedEvent, other: WrappedEvent) {
    if let (Some(base), Some(new)) = (
        existing.operators_result.as_mut(),
        other.operators_result.as_ref(),
    ) {
        base.merge(new);
    }
    existing.results.extend(other.results);
}

/// True when the relative entry path cannot escape the archive root.
fn path_is_contained(path: &Path) -> bool {
    !path.is_absolute()
        && path
            .components()
            .all(|c| !matches!(c, Component::ParentDir | Component::Prefix(_)))
}

/// Streams either whole lines (OR condition) or large chunks (AND
/// condition, so all literals can see the same corpus).
struct ChunkReader<R: Read> {
    reader: BufReader<R>,
    by_line: bool,
    done: bool,
}

impl<R: Read> ChunkReader<R> {
    fn new(reader: R, condition: Condition) -> Self {
        Self {
            reader: BufReader::new(reader),
            by_line: condition == Condition::Or,
            done: false,
        }
    }

    fn next_chunk(&mut self) -> Result<Option<String>> {
        if self.done {
            return Ok(None);
        }
        if self.by_line {
            let mut line = String::new();
            let mut buffer = Vec::new();
            let n = self
                .reader
                .read_until(b'\n', &mut buffer)
                .map_err(|e| Error::Read(e.to_string()))?;
            if n == 0 {
                self.done = true;
                return Ok(None);
            }
            line.push_str(&String::from_utf8_lossy(&buffer));
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            Ok(Some(line))
        } else {
            let mut buffer = vec![0_u8; DEFAULT_MAX_READ_SIZE];
            let mut filled = 0;
            while filled < buffer.len() {
                let n = self
                    .reader
                    .read(&mut buffer[filled..])
                    .map_err(|e| Error::Read(e.to_string()))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                self.done = true;
                return Ok(None);
            }
            if filled < buffer.len() {
                self.done = true;
            }
            Ok(Some(String::from_utf8_lossy(&buffer[..filled]).into_owned()))
        }
    }
}
