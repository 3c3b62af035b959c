//! Template-driven scanning engine.
//!
//! A declarative YAML template describing probes (HTTP sequences, raw TCP
//! exchanges, file scans) with matchers and extractors is compiled into an
//! executable plan, run against a target, and folded into a structured
//! match/extract result.

pub mod error;
pub mod executor;
pub mod operators;
pub mod payloads;
pub mod protocols;
pub mod template;

pub use error::{Error, Result};
pub use executor::Executor;
pub use operators::{Condition, Extractor, Matcher, OperatorResult, Operators};
pub use payloads::{AttackKind, PayloadGenerator};
pub use protocols::{
    ExecutorOptions, FileRequest, HttpRequest, NetworkRequest, Options, ResultEvent, ScanContext,
    Variables, WrappedEvent,
};
pub use template::{Info, Template};
