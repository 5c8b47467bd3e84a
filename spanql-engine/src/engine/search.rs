use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::instrument;

use super::{CompiledQuery, Engine};
use crate::attribute::{Attribute, Intrinsic};
use crate::error::EngineError;
use crate::filter::RootExpr;
use crate::hints::HINT_MOST_RECENT;
use crate::models::Static;
use crate::span::{hex, Span, Spanset, SpansetAttribute};
use crate::storage::{search_meta_conditions, FetchSpansResponse, SpansetFetcher};

/// Spanset attribute holding the number of spans that matched, before the
/// spanset is cut down to `spans_per_spanset`.
pub const ATTRIBUTE_MATCHED: &str = "matched";

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub start: u64,
    pub end: u64,
    /// Maximum number of traces returned. Zero is unlimited.
    pub limit: usize,
    /// Maximum number of spans returned per spanset. Zero is unlimited.
    pub spans_per_spanset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpanMetadata {
    pub span_id: String,
    pub name: String,
    pub start_time_unix_nanos: u64,
    pub duration_nanos: u64,
    /// The attributes the query referenced, when the span has them.
    pub attributes: Vec<(String, Static)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpansetMetadata {
    pub spans: Vec<SpanMetadata>,
    pub matched: usize,
    pub attributes: Vec<(String, Static)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceSearchMetadata {
    pub trace_id: String,
    pub root_service_name: String,
    pub root_trace_name: String,
    pub start_time_unix_nanos: u64,
    pub duration_ms: u64,
    pub span_sets: Vec<SpansetMetadata>,
}

impl TraceSearchMetadata {
    fn from_spanset(spanset: &Spanset, attributes: &[Attribute]) -> TraceSearchMetadata {
        let spans = spanset
            .spans
            .iter()
            .map(|span| span_metadata(span.as_ref(), attributes))
            .collect();

        let matched = match spanset.attribute(ATTRIBUTE_MATCHED) {
            Some(Static::Int(matched)) => *matched as usize,
            _ => spanset.spans.len(),
        };

        let spanset_attributes = spanset
            .attributes
            .iter()
            .filter(|a| a.name != ATTRIBUTE_MATCHED)
            .map(|SpansetAttribute { name, value }| (name.clone(), value.clone()))
            .collect();

        TraceSearchMetadata {
            trace_id: spanset.trace_id_hex(),
            root_service_name: spanset.root_service_name.clone(),
            root_trace_name: spanset.root_span_name.clone(),
            start_time_unix_nanos: spanset.start_time_unix_nanos,
            duration_ms: spanset.duration_nanos / 1_000_000,
            span_sets: vec![SpansetMetadata {
                spans,
                matched,
                attributes: spanset_attributes,
            }],
        }
    }

    /// Folds another result for the same trace into this one. Spansets with
    /// exactly the same spans are kept once.
    fn merge(&mut self, other: TraceSearchMetadata) {
        if self.root_service_name.is_empty() {
            self.root_service_name = other.root_service_name;
        }
        if self.root_trace_name.is_empty() {
            self.root_trace_name = other.root_trace_name;
        }
        if self.start_time_unix_nanos == 0
            || other.start_time_unix_nanos < self.start_time_unix_nanos
        {
            self.start_time_unix_nanos = other.start_time_unix_nanos;
        }
        self.duration_ms = self.duration_ms.max(other.duration_ms);

        for spanset in other.span_sets {
            let duplicate = self.span_sets.iter().any(|existing| {
                existing.spans.len() == spanset.spans.len()
                    && existing
                        .spans
                        .iter()
                        .zip(&spanset.spans)
                        .all(|(a, b)| a.span_id == b.span_id)
            });

            if !duplicate {
                self.span_sets.push(spanset);
            }
        }
    }
}

fn span_metadata(span: &dyn Span, attributes: &[Attribute]) -> SpanMetadata {
    let name = match span.attribute_for(&Attribute::intrinsic(Intrinsic::Name)) {
        Some(Static::String(name)) => name,
        _ => String::new(),
    };

    SpanMetadata {
        span_id: hex(span.id()),
        name,
        start_time_unix_nanos: span.start_time_unix_nanos(),
        duration_nanos: span.duration_nanos(),
        attributes: attributes
            .iter()
            .filter_map(|attribute| {
                let value = span.attribute_for(attribute)?;
                Some((attribute.to_string(), value))
            })
            .collect(),
    }
}

/// Collects search results, deduplicated by trace id.
///
/// By default the first `limit` traces found win and the search can stop as
/// soon as there are enough. With `most_recent` every result is considered
/// and the `limit` traces that started last are kept.
#[derive(Debug)]
pub struct MetadataCombiner {
    limit: usize,
    most_recent: bool,
    traces: HashMap<String, TraceSearchMetadata>,
}

impl MetadataCombiner {
    pub fn new(limit: usize, most_recent: bool) -> MetadataCombiner {
        MetadataCombiner {
            limit,
            most_recent,
            traces: HashMap::new(),
        }
    }

    /// Adds a result. Returns `true` if it was kept.
    pub fn add(&mut self, metadata: TraceSearchMetadata) -> bool {
        if let Some(existing) = self.traces.get_mut(&metadata.trace_id) {
            existing.merge(metadata);
            return true;
        }

        if self.limit == 0 || self.traces.len() < self.limit {
            self.traces.insert(metadata.trace_id.clone(), metadata);
            return true;
        }

        if !self.most_recent {
            return false;
        }

        let oldest = self
            .traces
            .values()
            .min_by(|a, b| {
                a.start_time_unix_nanos
                    .cmp(&b.start_time_unix_nanos)
                    .then_with(|| b.trace_id.cmp(&a.trace_id))
            })
            .map(|t| (t.trace_id.clone(), t.start_time_unix_nanos));

        match oldest {
            Some((trace_id, start)) if start < metadata.start_time_unix_nanos => {
                self.traces.remove(&trace_id);
                self.traces.insert(metadata.trace_id.clone(), metadata);
                true
            }
            _ => false,
        }
    }

    /// Whether more results cannot change the outcome.
    pub fn is_complete(&self) -> bool {
        !self.most_recent && self.limit > 0 && self.traces.len() >= self.limit
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// The traces, most recent first.
    pub fn metadata(&self) -> Vec<TraceSearchMetadata> {
        let mut traces: Vec<_> = self.traces.values().cloned().collect();
        traces.sort_by(|a, b| {
            b.start_time_unix_nanos
                .cmp(&a.start_time_unix_nanos)
                .then_with(|| a.trace_id.cmp(&b.trace_id))
        });
        traces
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResponse {
    pub traces: Vec<TraceSearchMetadata>,
    pub inspected_traces: u64,
    pub inspected_bytes: u64,
}

impl Engine {
    /// Runs a search query. Spansets are evaluated in the fetcher's second
    /// pass, so only matching spansets are returned from storage.
    #[instrument(level = tracing::Level::TRACE, skip_all)]
    pub async fn execute_search(
        &self,
        root: RootExpr,
        search: &SearchRequest,
        fetcher: &dyn SpansetFetcher,
    ) -> Result<SearchResponse, EngineError> {
        let CompiledQuery { root, mut request } = self.compile(root)?;

        if root.is_noop() {
            tracing::debug!("query can not match anything, skipping fetch");
            return Ok(SearchResponse::default());
        }

        let most_recent = root
            .hints
            .get_bool(HINT_MOST_RECENT, self.config.allow_unsafe_query_hints)
            .unwrap_or(false);

        // attributes worth reporting on each span
        let mut reported: Vec<Attribute> = Vec::new();
        for condition in request.conditions.iter().chain(&request.second_pass_conditions) {
            if !condition.attribute.is_intrinsic() && !reported.contains(&condition.attribute) {
                reported.push(condition.attribute.clone());
            }
        }

        request.start_time_unix_nanos = search.start;
        request.end_time_unix_nanos = search.end;
        for condition in search_meta_conditions() {
            if !request.has_attribute(&condition.attribute) {
                request.append_second_pass_condition(condition);
            }
        }

        let inspected = Arc::new(AtomicU64::new(0));
        let pipeline = Arc::new(Mutex::new(root.pipeline));
        let spans_per_spanset = search.spans_per_spanset;
        {
            let inspected = inspected.clone();
            request.second_pass = Some(Arc::new(move |spanset: Spanset| {
                inspected.fetch_add(1, Ordering::Relaxed);

                let mut pipeline = pipeline.lock().unwrap_or_else(PoisonError::into_inner);
                let mut results = pipeline.evaluate(vec![spanset])?;

                for result in &mut results {
                    result.add_attribute(ATTRIBUTE_MATCHED, Static::Int(result.spans.len() as i64));
                    if spans_per_spanset > 0 {
                        result.spans.truncate(spans_per_spanset);
                    }
                }

                Ok(results)
            }));
        }

        let FetchSpansResponse { mut results, bytes } = fetcher.fetch(request).await?;

        let mut combiner = MetadataCombiner::new(search.limit, most_recent);
        loop {
            let spanset = match results.next().await {
                Ok(Some(spanset)) => spanset,
                Ok(None) => break,
                Err(err) => {
                    results.close();
                    return Err(EngineError::from(err));
                }
            };

            combiner.add(TraceSearchMetadata::from_spanset(&spanset, &reported));
            spanset.release();

            if combiner.is_complete() {
                tracing::debug!(traces = combiner.len(), "search limit reached");
                break;
            }
        }
        results.close();

        Ok(SearchResponse {
            traces: combiner.metadata(),
            inspected_traces: inspected.load(Ordering::Relaxed),
            inspected_bytes: bytes(),
        })
    }
}
