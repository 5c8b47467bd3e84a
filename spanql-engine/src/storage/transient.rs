//! An in-memory fetcher. Traces are built up front with [`MemoryTrace`] and
//! every fetch scans all of them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Error as AnyError;
use futures::future::{BoxFuture, FutureExt};
use regex::Regex;

use super::{Condition, FetchSpansRequest, FetchSpansResponse, SpansetFetcher, SpansetIterator};
use crate::attribute::{Attribute, AttributeScope, Intrinsic};
use crate::filter::value::binary_op;
use crate::filter::Operator;
use crate::models::{Kind, Static, Status};
use crate::span::{hex, ReleaseFn, Span, SpanRef, Spanset};

/// Nominal size of a span, used to report bytes read.
const SPAN_BYTES: u64 = 256;

/// A span to be inserted into a [`MemoryTrace`].
#[derive(Debug, Clone)]
pub struct NewSpan {
    pub id: Vec<u8>,
    pub parent_id: Option<Vec<u8>>,
    pub name: String,
    pub start_time_unix_nanos: u64,
    pub duration_nanos: u64,
    pub status: Status,
    pub status_message: String,
    pub kind: Kind,
    pub attributes: Vec<(String, Static)>,
    pub resource_attributes: Vec<(String, Static)>,
}

impl NewSpan {
    pub fn new(id: &[u8], name: &str) -> NewSpan {
        NewSpan {
            id: id.to_vec(),
            parent_id: None,
            name: name.to_owned(),
            start_time_unix_nanos: 0,
            duration_nanos: 0,
            status: Status::Unset,
            status_message: String::new(),
            kind: Kind::Unspecified,
            attributes: Vec::new(),
            resource_attributes: Vec::new(),
        }
    }

    pub fn parent(mut self, parent_id: &[u8]) -> NewSpan {
        self.parent_id = Some(parent_id.to_vec());
        self
    }

    pub fn start(mut self, start_time_unix_nanos: u64) -> NewSpan {
        self.start_time_unix_nanos = start_time_unix_nanos;
        self
    }

    pub fn duration(mut self, duration: Duration) -> NewSpan {
        self.duration_nanos = duration.as_nanos() as u64;
        self
    }

    pub fn status(mut self, status: Status) -> NewSpan {
        self.status = status;
        self
    }

    pub fn status_message(mut self, message: &str) -> NewSpan {
        self.status_message = message.to_owned();
        self
    }

    pub fn kind(mut self, kind: Kind) -> NewSpan {
        self.kind = kind;
        self
    }

    pub fn attribute(mut self, name: &str, value: impl Into<Static>) -> NewSpan {
        self.attributes.push((name.to_owned(), value.into()));
        self
    }

    pub fn resource_attribute(mut self, name: &str, value: impl Into<Static>) -> NewSpan {
        self.resource_attributes.push((name.to_owned(), value.into()));
        self
    }
}

#[derive(Debug)]
struct TraceInfo {
    trace_id: Vec<u8>,
    root_service_name: String,
    root_span_name: String,
    start_time_unix_nanos: u64,
    duration_nanos: u64,
}

/// A span held in memory. Structure is encoded as a nested set: a span
/// descends from another if its `left..right` range is within the other's.
pub struct MemorySpan {
    id: Vec<u8>,
    parent_id: Option<Vec<u8>>,
    name: String,
    start_time_unix_nanos: u64,
    duration_nanos: u64,
    status: Status,
    status_message: String,
    kind: Kind,
    attributes: Vec<(Attribute, Static)>,
    resource_attributes: Vec<(Attribute, Static)>,
    child_count: i64,
    nested_set_left: i64,
    nested_set_right: i64,
    nested_set_parent: i64,
    parent: Option<Arc<MemorySpan>>,
    trace: Arc<TraceInfo>,
}

impl MemorySpan {
    fn intrinsic(&self, intrinsic: Intrinsic) -> Option<Static> {
        let value = match intrinsic {
            Intrinsic::Duration => Static::Duration(Duration::from_nanos(self.duration_nanos)),
            Intrinsic::Name => Static::String(self.name.clone()),
            Intrinsic::Status => Static::Status(self.status),
            Intrinsic::StatusMessage => Static::String(self.status_message.clone()),
            Intrinsic::Kind => Static::Kind(self.kind),
            Intrinsic::ChildCount => Static::Int(self.child_count),
            Intrinsic::TraceRootService => Static::String(self.trace.root_service_name.clone()),
            Intrinsic::TraceRootSpan => Static::String(self.trace.root_span_name.clone()),
            Intrinsic::TraceDuration => {
                Static::Duration(Duration::from_nanos(self.trace.duration_nanos))
            }
            Intrinsic::TraceId => Static::String(hex(&self.trace.trace_id)),
            Intrinsic::TraceStartTime => Static::Int(self.trace.start_time_unix_nanos as i64),
            Intrinsic::SpanId => Static::String(hex(&self.id)),
            Intrinsic::SpanStartTime => Static::Int(self.start_time_unix_nanos as i64),
            Intrinsic::ParentId => Static::String(hex(self.parent_id.as_deref()?)),
            Intrinsic::NestedSetLeft => Static::Int(self.nested_set_left),
            Intrinsic::NestedSetRight => Static::Int(self.nested_set_right),
            Intrinsic::NestedSetParent => Static::Int(self.nested_set_parent),
            _ => return None,
        };

        Some(value)
    }
}

fn find(attributes: &[(Attribute, Static)], name: &str) -> Option<Static> {
    attributes
        .iter()
        .find(|(a, _)| a.name == name)
        .map(|(_, v)| v.clone())
}

impl Span for MemorySpan {
    fn attribute_for(&self, attribute: &Attribute) -> Option<Static> {
        if attribute.parent {
            return self.parent.as_ref()?.attribute_for(&attribute.without_parent());
        }

        if attribute.is_intrinsic() {
            return self.intrinsic(attribute.intrinsic);
        }

        match attribute.scope {
            AttributeScope::Span => find(&self.attributes, &attribute.name),
            AttributeScope::Resource => find(&self.resource_attributes, &attribute.name),
            AttributeScope::None => find(&self.attributes, &attribute.name)
                .or_else(|| find(&self.resource_attributes, &attribute.name)),
            AttributeScope::Event | AttributeScope::Link | AttributeScope::Instrumentation => None,
        }
    }

    fn all_attributes_func(&self, f: &mut dyn FnMut(&Attribute, &Static)) {
        for intrinsic in [
            Intrinsic::Name,
            Intrinsic::Status,
            Intrinsic::Kind,
            Intrinsic::Duration,
        ] {
            if let Some(value) = self.intrinsic(intrinsic) {
                f(&Attribute::intrinsic(intrinsic), &value);
            }
        }

        for (attribute, value) in self.attributes.iter().chain(&self.resource_attributes) {
            f(attribute, value);
        }
    }

    fn id(&self) -> &[u8] {
        &self.id
    }

    fn start_time_unix_nanos(&self) -> u64 {
        self.start_time_unix_nanos
    }

    fn duration_nanos(&self) -> u64 {
        self.duration_nanos
    }

    fn sibling_of(
        &self,
        lhs: &[SpanRef],
        rhs: &[SpanRef],
        false_for_all: bool,
        union: bool,
        buffer: &mut Vec<SpanRef>,
    ) {
        relate(lhs, rhs, false_for_all, union, buffer, |l, r| {
            l.parent > 0 && l.parent == r.parent && l.left != r.left
        });
    }

    fn descendant_of(
        &self,
        lhs: &[SpanRef],
        rhs: &[SpanRef],
        false_for_all: bool,
        invert: bool,
        union: bool,
        buffer: &mut Vec<SpanRef>,
    ) {
        relate(lhs, rhs, false_for_all, union, buffer, |l, r| {
            if invert {
                r.left < l.left && l.right < r.right
            } else {
                l.left < r.left && r.right < l.right
            }
        });
    }

    fn child_of(
        &self,
        lhs: &[SpanRef],
        rhs: &[SpanRef],
        false_for_all: bool,
        invert: bool,
        union: bool,
        buffer: &mut Vec<SpanRef>,
    ) {
        relate(lhs, rhs, false_for_all, union, buffer, |l, r| {
            if invert {
                l.parent == r.left
            } else {
                r.parent == l.left
            }
        });
    }
}

#[derive(Clone, Copy)]
struct NestedSet {
    left: i64,
    right: i64,
    parent: i64,
}

fn nested_set(span: &dyn Span) -> Option<NestedSet> {
    let get = |i| span.attribute_for(&Attribute::intrinsic(i)).map(|v| v.float() as i64);

    Some(NestedSet {
        left: get(Intrinsic::NestedSetLeft)?,
        right: get(Intrinsic::NestedSetRight)?,
        parent: get(Intrinsic::NestedSetParent)?,
    })
}

/// Shared shape of the relationship queries. `holds(l, r)` decides whether a
/// span of `rhs` relates to a span of `lhs`.
fn relate(
    lhs: &[SpanRef],
    rhs: &[SpanRef],
    false_for_all: bool,
    union: bool,
    buffer: &mut Vec<SpanRef>,
    holds: impl Fn(NestedSet, NestedSet) -> bool,
) {
    buffer.clear();

    let lhs_sets: Vec<Option<NestedSet>> = lhs.iter().map(|s| nested_set(s.as_ref())).collect();
    let rhs_sets: Vec<Option<NestedSet>> = rhs.iter().map(|s| nested_set(s.as_ref())).collect();

    if union {
        let mut lhs_matched = vec![false; lhs.len()];
        let mut rhs_matched = vec![false; rhs.len()];

        for (i, l) in lhs_sets.iter().enumerate() {
            for (j, r) in rhs_sets.iter().enumerate() {
                if let (Some(l), Some(r)) = (l, r) {
                    if holds(*l, *r) {
                        lhs_matched[i] = true;
                        rhs_matched[j] = true;
                    }
                }
            }
        }

        let mut seen: Vec<&[u8]> = Vec::new();
        let matched = lhs
            .iter()
            .zip(lhs_matched)
            .chain(rhs.iter().zip(rhs_matched))
            .filter(|(_, m)| *m)
            .map(|(s, _)| s);

        for span in matched {
            if !seen.contains(&span.id()) {
                seen.push(span.id());
                buffer.push(span.clone());
            }
        }

        return;
    }

    for (span, r) in rhs.iter().zip(&rhs_sets) {
        let Some(r) = r else {
            continue;
        };

        let related = lhs_sets.iter().flatten().any(|l| holds(*l, *r));
        if related != false_for_all {
            buffer.push(span.clone());
        }
    }
}

/// A trace under construction.
#[derive(Debug, Clone)]
pub struct MemoryTrace {
    trace_id: Vec<u8>,
    spans: Vec<NewSpan>,
}

impl MemoryTrace {
    pub fn new(trace_id: &[u8]) -> MemoryTrace {
        MemoryTrace {
            trace_id: trace_id.to_vec(),
            spans: Vec::new(),
        }
    }

    pub fn with_span(mut self, span: NewSpan) -> MemoryTrace {
        self.spans.push(span);
        self
    }

    /// Resolves the span tree and produces a spanset of all spans, in the
    /// order they were added.
    pub fn build(&self) -> Spanset {
        let index: HashMap<&[u8], usize> = self
            .spans
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_slice(), i))
            .collect();

        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.spans.len()];
        let mut roots = Vec::new();
        for (i, span) in self.spans.iter().enumerate() {
            match span.parent_id.as_deref().and_then(|p| index.get(p)) {
                Some(&parent) => children[parent].push(i),
                None => roots.push(i),
            }
        }

        // nested set numbering, depth first
        let mut left = vec![0i64; self.spans.len()];
        let mut right = vec![0i64; self.spans.len()];
        let mut parent = vec![0i64; self.spans.len()];
        let mut preorder = Vec::with_capacity(self.spans.len());
        let mut counter = 0i64;
        let mut stack: Vec<(usize, bool)> = roots.iter().rev().map(|&r| (r, false)).collect();
        while let Some((i, exiting)) = stack.pop() {
            counter += 1;
            if exiting {
                right[i] = counter;
                continue;
            }

            left[i] = counter;
            preorder.push(i);
            stack.push((i, true));
            for &child in children[i].iter().rev() {
                parent[child] = left[i];
                stack.push((child, false));
            }
        }

        let root = roots.first().map(|&r| &self.spans[r]);
        let start = self.spans.iter().map(|s| s.start_time_unix_nanos).min().unwrap_or(0);
        let end = self
            .spans
            .iter()
            .map(|s| s.start_time_unix_nanos + s.duration_nanos)
            .max()
            .unwrap_or(0);

        let trace = Arc::new(TraceInfo {
            trace_id: self.trace_id.clone(),
            root_service_name: root
                .and_then(|r| {
                    r.resource_attributes
                        .iter()
                        .find(|(name, _)| name == "service.name")
                        .and_then(|(_, v)| v.as_str().map(str::to_owned))
                })
                .unwrap_or_default(),
            root_span_name: root.map(|r| r.name.clone()).unwrap_or_default(),
            start_time_unix_nanos: start,
            duration_nanos: end - start,
        });

        let mut built: Vec<Option<Arc<MemorySpan>>> = vec![None; self.spans.len()];
        for &i in &preorder {
            let new = &self.spans[i];
            let parent_span = new
                .parent_id
                .as_deref()
                .and_then(|p| index.get(p))
                .and_then(|&p| built[p].clone());

            built[i] = Some(Arc::new(MemorySpan {
                id: new.id.clone(),
                parent_id: new.parent_id.clone(),
                name: new.name.clone(),
                start_time_unix_nanos: new.start_time_unix_nanos,
                duration_nanos: new.duration_nanos,
                status: new.status,
                status_message: new.status_message.clone(),
                kind: new.kind,
                attributes: new
                    .attributes
                    .iter()
                    .map(|(n, v)| (Attribute::span(n), v.clone()))
                    .collect(),
                resource_attributes: new
                    .resource_attributes
                    .iter()
                    .map(|(n, v)| (Attribute::resource(n), v.clone()))
                    .collect(),
                child_count: children[i].len() as i64,
                nested_set_left: left[i],
                nested_set_right: right[i],
                nested_set_parent: parent[i],
                parent: parent_span,
                trace: trace.clone(),
            }));
        }

        let spans: Vec<SpanRef> = built
            .into_iter()
            .flatten()
            .map(|s| s as SpanRef)
            .collect();

        let mut spanset = Spanset::new(self.trace_id.clone(), spans);
        spanset.root_span_name = trace.root_span_name.clone();
        spanset.root_service_name = trace.root_service_name.clone();
        spanset.start_time_unix_nanos = trace.start_time_unix_nanos;
        spanset.duration_nanos = trace.duration_nanos;
        spanset
    }
}

#[derive(Debug, Default)]
struct FetcherStats {
    released: AtomicUsize,
}

/// Serves fetch requests from traces held in memory. Every spanset it hands
/// out carries a release callback that is counted, so tests can check that
/// callers honor the contract.
pub struct TransientFetcher {
    traces: Vec<Spanset>,
    stats: Arc<FetcherStats>,
    requests: Mutex<Vec<FetchSpansRequest>>,
}

impl TransientFetcher {
    pub fn new(traces: impl IntoIterator<Item = MemoryTrace>) -> TransientFetcher {
        TransientFetcher {
            traces: traces.into_iter().map(|t| t.build()).collect(),
            stats: Arc::new(FetcherStats::default()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of spansets handed out that have been released.
    pub fn released(&self) -> usize {
        self.stats.released.load(Ordering::SeqCst)
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<FetchSpansRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Earliest start and latest end of the held spans, in nanoseconds.
    pub fn time_range(&self) -> (u64, u64) {
        let start = self.traces.iter().map(|t| t.start_time_unix_nanos).min();
        let end = self
            .traces
            .iter()
            .map(|t| t.start_time_unix_nanos + t.duration_nanos)
            .max();

        (start.unwrap_or(0), end.unwrap_or(0))
    }
}

impl SpansetFetcher for TransientFetcher {
    fn fetch(&self, request: FetchSpansRequest) -> BoxFuture<'_, Result<FetchSpansResponse, AnyError>> {
        tracing::debug!(?request, "fetching spans");

        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let bytes = Arc::new(AtomicU64::new(0));
        let stats = self.stats.clone();
        let release: ReleaseFn = Arc::new(move |_: &Spanset| {
            stats.released.fetch_add(1, Ordering::SeqCst);
        });

        let regexes = vec![None; request.conditions.len()];
        let iter = TransientIterator {
            pending: self.traces.iter().cloned().collect(),
            ready: VecDeque::new(),
            request,
            regexes,
            bytes: bytes.clone(),
            release,
        };

        let response = FetchSpansResponse {
            results: Box::new(iter),
            bytes: Box::new(move || bytes.load(Ordering::SeqCst)),
        };

        futures::future::ready(Ok(response)).boxed()
    }
}

struct TransientIterator {
    pending: VecDeque<Spanset>,
    ready: VecDeque<Spanset>,
    request: FetchSpansRequest,
    regexes: Vec<Option<Regex>>,
    bytes: Arc<AtomicU64>,
    release: ReleaseFn,
}

impl TransientIterator {
    fn overlaps(&self, spanset: &Spanset) -> bool {
        let start = self.request.start_time_unix_nanos;
        let end = self.request.end_time_unix_nanos;
        if start == 0 && end == 0 {
            return true;
        }

        let trace_start = spanset.start_time_unix_nanos;
        let trace_end = trace_start + spanset.duration_nanos;
        trace_start < end && trace_end >= start
    }

    fn matches(&mut self, span: &dyn Span) -> Result<bool, AnyError> {
        for (condition, regex) in self.request.conditions.iter().zip(self.regexes.iter_mut()) {
            if !condition.is_filter() {
                continue;
            }

            if !condition_matches(condition, span, regex)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn load_next(&mut self) -> Result<(), AnyError> {
        while self.ready.is_empty() {
            let Some(mut spanset) = self.pending.pop_front() else {
                return Ok(());
            };

            if !self.overlaps(&spanset) {
                continue;
            }

            // without AllConditions a span may match through any condition,
            // so only the second pass can decide
            if self.request.all_conditions {
                let mut spans = Vec::with_capacity(spanset.spans.len());
                for span in &spanset.spans {
                    if self.matches(span.as_ref())? {
                        spans.push(span.clone());
                    }
                }
                spanset.spans = spans;
            }

            if spanset.spans.is_empty() {
                continue;
            }

            self.bytes
                .fetch_add(spanset.spans.len() as u64 * SPAN_BYTES, Ordering::SeqCst);

            let results = match &self.request.second_pass {
                Some(second_pass) => second_pass(spanset).map_err(AnyError::from)?,
                None => vec![spanset],
            };

            for result in results {
                if !result.spans.is_empty() {
                    self.ready.push_back(result.with_release(self.release.clone()));
                }
            }
        }

        Ok(())
    }
}

fn condition_matches(
    condition: &Condition,
    span: &dyn Span,
    regex: &mut Option<Regex>,
) -> Result<bool, AnyError> {
    let value = span.attribute_for(&condition.attribute).unwrap_or_default();

    if condition.op == Operator::Exists {
        return Ok(!value.is_nil());
    }

    let Some(operand) = condition.operands.first() else {
        return Ok(true);
    };

    let result = binary_op(condition.op, &value, operand, regex)?;
    Ok(result.as_bool() == Some(true))
}

impl SpansetIterator for TransientIterator {
    fn next(&mut self) -> BoxFuture<'_, Result<Option<Spanset>, AnyError>> {
        let result = self.load_next().map(|_| self.ready.pop_front());
        futures::future::ready(result).boxed()
    }

    fn close(&mut self) {
        self.pending.clear();
        self.ready.clear();
    }
}
