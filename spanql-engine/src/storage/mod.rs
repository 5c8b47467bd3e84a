//! The contract between the engine and whatever holds the spans.
//!
//! The engine describes what it needs with a [`FetchSpansRequest`]: the time
//! range, the conditions it could push down and, optionally, a second pass
//! that re-runs the query on each candidate spanset. A [`SpansetFetcher`]
//! answers with an async sequence of spansets. `transient` holds everything
//! in memory and is what the tests run against.

use std::fmt::{Debug, Error as FmtError, Formatter};
use std::sync::Arc;

use anyhow::Error as AnyError;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::attribute::{Attribute, Intrinsic};
use crate::error::EngineError;
use crate::filter::Operator;
use crate::models::Static;
use crate::span::Spanset;

pub mod transient;

/// A single pushed down predicate. With [`Operator::None`] the attribute only
/// needs to be loaded, it is not filtered on.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub attribute: Attribute,
    pub op: Operator,
    pub operands: Vec<Static>,
}

impl Condition {
    pub fn new(attribute: Attribute, op: Operator, operands: Vec<Static>) -> Condition {
        Condition {
            attribute,
            op,
            operands,
        }
    }

    /// Load the attribute without filtering on it.
    pub fn fetch(attribute: Attribute) -> Condition {
        Condition::new(attribute, Operator::None, Vec::new())
    }

    /// Whether this condition restricts which spans are returned.
    pub fn is_filter(&self) -> bool {
        self.op != Operator::None && !is_structural(&self.attribute)
    }
}

fn is_structural(attribute: &Attribute) -> bool {
    matches!(
        attribute.intrinsic,
        Intrinsic::StructuralChild | Intrinsic::StructuralDescendant | Intrinsic::StructuralSibling
    )
}

/// Re-runs the query on a spanset fetched in the first pass, deciding which
/// spansets continue to the second pass.
pub type SecondPassFn = Arc<dyn Fn(Spanset) -> Result<Vec<Spanset>, EngineError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct FetchSpansRequest {
    pub start_time_unix_nanos: u64,
    pub end_time_unix_nanos: u64,
    pub conditions: Vec<Condition>,

    /// The conditions are all AND'ed. The fetcher may drop any span failing
    /// any one of them without running the second pass.
    pub all_conditions: bool,

    pub second_pass_conditions: Vec<Condition>,
    pub second_pass: Option<SecondPassFn>,
    /// Every attribute should be loaded in the second pass.
    pub second_pass_select_all: bool,
}

impl FetchSpansRequest {
    pub fn new(start_time_unix_nanos: u64, end_time_unix_nanos: u64) -> FetchSpansRequest {
        FetchSpansRequest {
            start_time_unix_nanos,
            end_time_unix_nanos,
            all_conditions: true,
            ..FetchSpansRequest::default()
        }
    }

    /// Adds a first pass condition. Fetch-only conditions are not repeated.
    pub fn append_condition(&mut self, condition: Condition) {
        append_deduplicated(&mut self.conditions, condition);
    }

    pub fn append_second_pass_condition(&mut self, condition: Condition) {
        append_deduplicated(&mut self.second_pass_conditions, condition);
    }

    /// Whether the attribute is referenced by any condition of either pass.
    pub fn has_attribute(&self, attribute: &Attribute) -> bool {
        self.conditions
            .iter()
            .chain(self.second_pass_conditions.iter())
            .any(|c| &c.attribute == attribute)
    }
}

fn append_deduplicated(conditions: &mut Vec<Condition>, condition: Condition) {
    if condition.op == Operator::None
        && conditions
            .iter()
            .any(|c| c.op == Operator::None && c.attribute == condition.attribute)
    {
        return;
    }

    conditions.push(condition);
}

impl Debug for FetchSpansRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("FetchSpansRequest")
            .field("start_time_unix_nanos", &self.start_time_unix_nanos)
            .field("end_time_unix_nanos", &self.end_time_unix_nanos)
            .field("conditions", &self.conditions)
            .field("all_conditions", &self.all_conditions)
            .field("second_pass_conditions", &self.second_pass_conditions)
            .field("second_pass", &self.second_pass.is_some())
            .field("second_pass_select_all", &self.second_pass_select_all)
            .finish()
    }
}

/// An async sequence of spansets. Returning `None` ends the sequence; the
/// caller stops early simply by not calling `next` again.
pub trait SpansetIterator: Send {
    fn next(&mut self) -> BoxFuture<'_, Result<Option<Spanset>, AnyError>>;

    fn close(&mut self) {}
}

pub struct FetchSpansResponse {
    pub results: Box<dyn SpansetIterator>,
    /// Bytes read so far. Only final once `results` is exhausted.
    pub bytes: Box<dyn Fn() -> u64 + Send + Sync>,
}

pub trait SpansetFetcher: Send + Sync {
    fn fetch(&self, request: FetchSpansRequest) -> BoxFuture<'_, Result<FetchSpansResponse, AnyError>>;
}

/// Returned by a fetcher that cannot serve a request at all, e.g. because its
/// data format does not support the query. The metrics evaluator treats it as
/// an empty result.
#[derive(Debug, Clone, Copy, Error)]
#[error("fetch request is not supported by this data source")]
pub struct Unsupported;

/// Attributes needed to build search results.
pub fn search_meta_conditions() -> Vec<Condition> {
    [
        Intrinsic::TraceRootService,
        Intrinsic::TraceRootSpan,
        Intrinsic::TraceDuration,
        Intrinsic::TraceId,
        Intrinsic::TraceStartTime,
        Intrinsic::SpanId,
        Intrinsic::SpanStartTime,
        Intrinsic::Duration,
    ]
    .into_iter()
    .map(|i| Condition::fetch(Attribute::intrinsic(i)))
    .collect()
}

/// Attributes needed to build exemplars, minus those that are guaranteed to
/// be loaded already by `existing`. That is only the case when the existing
/// conditions are AND'ed, otherwise a span may have matched without them.
pub fn exemplar_meta_conditions_without(
    existing: &[Condition],
    all_conditions: bool,
) -> Vec<Condition> {
    [
        Intrinsic::TraceId,
        Intrinsic::SpanId,
        Intrinsic::SpanStartTime,
        Intrinsic::Duration,
    ]
    .into_iter()
    .map(Attribute::intrinsic)
    .filter(|attribute| !all_conditions || !existing.iter().any(|c| &c.attribute == attribute))
    .map(Condition::fetch)
    .collect()
}
