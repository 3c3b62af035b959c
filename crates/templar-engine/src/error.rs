use std::fmt;

/// Engine failure taxonomy.
///
/// Compile-time variants abort loading of a single template; I/O variants are
/// recorded on the scan context and do not stop the remaining probes of the
/// same template. [`Error::StopExecution`] is the one control-flow error: it
/// halts the current request sequence without surfacing as a user-visible
/// failure.
#[derive(Debug)]
pub enum Error {
    /// Template refused because both it and the engine options are flagged
    /// opsec-sensitive.
    Opsec,
    /// A placeholder could not be resolved; the current sequence stops.
    StopExecution(String),
    /// Raw pipelined ("unsafe") HTTP requests are rejected at compile time.
    UnsupportedUnsafe,
    BadRegex(String),
    BadBinary(String),
    BadDsl(String),
    UnknownMatcherType(String),
    UnknownExtractorType(String),
    UnknownCondition(String),
    /// A template with no request block of any protocol.
    EmptyTemplate,
    /// Network address without a port component.
    MissingPort(String),
    Dial(String),
    Read(String),
    Write(String),
    Eval(String),
    /// Template document failed to deserialize.
    Parse(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the executor should stop the current sequence but keep the
    /// scan alive.
    pub fn is_stop_execution(&self) -> bool {
        matches!(self, Self::StopExecution(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opsec => write!(f, "template skipped by opsec policy"),
            Self::StopExecution(what) => {
                write!(f, "stop execution due to unresolved variables: {what}")
            }
            Self::UnsupportedUnsafe => write!(f, "unsafe raw http requests are not supported"),
            Self::BadRegex(pattern) => write!(f, "could not compile regex: {pattern}"),
            Self::BadBinary(literal) => write!(f, "could not hex decode binary: {literal}"),
            Self::BadDsl(expr) => write!(f, "could not compile dsl expression: {expr}"),
            Self::UnknownMatcherType(kind) => write!(f, "unknown matcher type specified: {kind}"),
            Self::UnknownExtractorType(kind) => {
                write!(f, "unknown extractor type specified: {kind}")
            }
            Self::UnknownCondition(cond) => write!(f, "unknown condition specified: {cond}"),
            Self::EmptyTemplate => write!(f, "template has no request blocks"),
            Self::MissingPort(address) => {
                write!(f, "no port provided in network address: {address}")
            }
            Self::Dial(msg) => write!(f, "dial error: {msg}"),
            Self::Read(msg) => write!(f, "read error: {msg}"),
            Self::Write(msg) => write!(f, "write error: {msg}"),
            Self::Eval(msg) => write!(f, "evaluation error: {msg}"),
            Self::Parse(msg) => write!(f, "template parse error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<templar_common::Unresolved> for Error {
    fn from(err: templar_common::Unresolved) -> Self {
        Self::StopExecution(err.markers.join(", "))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn stop_execution_is_control_flow() {
        assert!(Error::StopExecution("BaseURL".into()).is_stop_execution());
        assert!(!Error::Opsec.is_stop_execution());
    }

    #[test]
    fn display_mentions_offender() {
        let err = Error::BadRegex("[unclosed".into());
        assert!(err.to_string().contains("[unclosed"));
    }
}
