use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use tracing::instrument;

use super::{CompiledQuery, Engine};
use crate::attribute::{Attribute, Intrinsic};
use crate::error::EngineError;
use crate::filter::{Pipeline, RootExpr};
use crate::hints::{HINT_EXEMPLARS, HINT_TIME_OVERLAP_CUTOFF};
use crate::metrics::{
    is_intrinsic_like, AggregateMode, FirstStageElement, QueryRangeRequest, SampledSeries,
    SecondStageElement, SeriesSet,
};
use crate::span::Spanset;
use crate::storage::{
    exemplar_meta_conditions_without, Condition, FetchSpansRequest, FetchSpansResponse,
    SpansetFetcher, Unsupported,
};

/// Drops work from the fetch request that storage can do on its own.
///
/// When the first pass alone fully describes the query, e.g. a single
/// condition or only intrinsics, the second pass is not needed. An all
/// intrinsic second pass is cheap enough to be folded into the first.
pub fn optimize(request: &mut FetchSpansRequest) {
    if !request.all_conditions || request.second_pass_select_all {
        return;
    }

    let all = || request.conditions.iter().chain(&request.second_pass_conditions);

    // unscoped attributes are looked up in several places
    if all().any(|c| c.attribute.is_unscoped()) {
        return;
    }

    let mut seen = HashSet::new();
    if !all().all(|c| seen.insert(&c.attribute)) {
        return;
    }

    if !request.second_pass_conditions.is_empty() {
        if !request
            .second_pass_conditions
            .iter()
            .all(|c| is_intrinsic_like(&c.attribute))
        {
            return;
        }

        let second_pass = std::mem::take(&mut request.second_pass_conditions);
        request.conditions.extend(second_pass);
    }

    let intrinsic_only = !request.conditions.is_empty()
        && request.conditions.iter().all(|c| is_intrinsic_like(&c.attribute));

    if request.conditions.len() == 1 || intrinsic_only {
        tracing::debug!(conditions = request.conditions.len(), "dropping second pass");
        request.second_pass = None;
    }
}

#[derive(Debug)]
struct EvaluatorState {
    pipeline: Pipeline,
    metrics: Box<dyn FirstStageElement>,

    bytes: u64,
    spans_total: u64,
    spans_deduped: u64,

    exemplar_traces: HashSet<Vec<u8>>,
    dedupe_spans: bool,
    seen_spans: HashSet<u64>,
}

impl EvaluatorState {
    /// At most one exemplar per trace, and no more traces than exemplars.
    fn sample_exemplar(&mut self, trace_id: &[u8], max_exemplars: usize) -> bool {
        if self.exemplar_traces.len() >= max_exemplars || trace_id.is_empty() {
            return false;
        }

        self.exemplar_traces.insert(trace_id.to_vec())
    }

    /// Observes the spans of the spanset that start within the request and
    /// returns the number of series now held.
    fn observe(&mut self, spanset: &Spanset, req: &QueryRangeRequest, max_exemplars: usize) -> usize {
        let need_exemplar = max_exemplars > 0 && self.sample_exemplar(&spanset.trace_id, max_exemplars);

        let mut rng = rand::thread_rng();
        let mut valid: u64 = 0;
        let mut exemplar = None;

        for span in &spanset.spans {
            if self.dedupe_spans {
                let mut hasher = DefaultHasher::new();
                spanset.trace_id.hash(&mut hasher);
                span.id().hash(&mut hasher);
                if !self.seen_spans.insert(hasher.finish()) {
                    self.spans_deduped += 1;
                    continue;
                }
            }

            let start = span.start_time_unix_nanos();
            if start < req.start || start >= req.end {
                continue;
            }

            valid += 1;
            self.metrics.observe(span.as_ref());

            // reservoir sampling so every span of a long trace has the same chance
            if need_exemplar && rng.gen_range(0..valid) == 0 {
                exemplar = Some(span);
            }
        }

        self.spans_total += valid;
        if let Some(span) = exemplar {
            self.metrics.observe_exemplar(span.as_ref());
        }

        self.metrics.length()
    }
}

/// Runs the raw stage of a metrics query. [`do_metrics`](Self::do_metrics)
/// may be called concurrently, e.g. once per block, and all calls feed the
/// same series.
#[derive(Debug)]
pub struct MetricsEvaluator {
    request: FetchSpansRequest,
    req: QueryRangeRequest,
    max_exemplars: usize,
    max_series: usize,
    time_overlap_cutoff: f64,
    state: Arc<Mutex<EvaluatorState>>,
}

impl MetricsEvaluator {
    fn lock(&self) -> MutexGuard<'_, EvaluatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Skips spans that were already observed, for sources that may return
    /// the same span more than once.
    pub fn with_dedupe_spans(self, dedupe_spans: bool) -> MetricsEvaluator {
        self.lock().dedupe_spans = dedupe_spans;
        self
    }

    /// The request sent to every fetcher.
    pub fn fetch_request(&self) -> &FetchSpansRequest {
        &self.request
    }

    /// Fetches spans from one source and observes them. The source holds data
    /// between `fetcher_start` and `fetcher_end`; zero if unknown. Stops early
    /// once `max_series` series exist, zero falls back to the configured limit.
    #[instrument(level = tracing::Level::TRACE, skip_all)]
    pub async fn do_metrics(
        &self,
        fetcher: &dyn SpansetFetcher,
        fetcher_start: u64,
        fetcher_end: u64,
        max_series: usize,
    ) -> Result<(), EngineError> {
        let mut request = self.request.clone();
        let max_series = if max_series > 0 {
            max_series
        } else {
            self.max_series
        };

        // the trace level time filter only pays off if the source holds
        // much more than the query needs
        if fetcher_start > 0 && fetcher_end > 0 && fetcher_start != fetcher_end {
            let start = self.req.start.max(fetcher_start);
            let end = self.req.end.min(fetcher_end);
            let overlap =
                end.saturating_sub(start) as f64 / fetcher_end.abs_diff(fetcher_start) as f64;

            if overlap == 0.0 {
                tracing::debug!(fetcher_start, fetcher_end, "source does not overlap the query");
                return Ok(());
            }

            if overlap < self.time_overlap_cutoff {
                request.start_time_unix_nanos = self.req.start;
                request.end_time_unix_nanos = self.req.end;
            }
        }

        let FetchSpansResponse { mut results, bytes } = match fetcher.fetch(request).await {
            Ok(response) => response,
            Err(err) if err.is::<Unsupported>() => {
                tracing::debug!("source does not support the query");
                return Ok(());
            }
            Err(err) => return Err(EngineError::from(err)),
        };

        loop {
            let spanset = match results.next().await {
                Ok(Some(spanset)) => spanset,
                Ok(None) => break,
                Err(err) => {
                    results.close();
                    return Err(EngineError::from(err));
                }
            };

            let series = self.lock().observe(&spanset, &self.req, self.max_exemplars);
            spanset.release();

            if max_series > 0 && series >= max_series {
                tracing::debug!(series, max_series, "series limit reached");
                break;
            }
        }
        results.close();

        self.lock().bytes += bytes();
        Ok(())
    }

    /// Bytes read, spans observed and spans skipped as duplicates.
    pub fn metrics(&self) -> (u64, u64, u64) {
        let state = self.lock();
        (state.bytes, state.spans_total, state.spans_deduped)
    }

    pub fn results(&self) -> SeriesSet {
        self.lock().metrics.result()
    }

    pub fn length(&self) -> usize {
        self.lock().metrics.length()
    }
}

/// Runs the sum or final stage of a metrics query over results from raw
/// evaluators or other frontends.
#[derive(Debug)]
pub struct MetricsFrontendEvaluator {
    mode: AggregateMode,
    metrics: Mutex<Box<dyn FirstStageElement>>,
    second_stage: Option<Box<dyn SecondStageElement>>,
}

impl MetricsFrontendEvaluator {
    fn lock(&self) -> MutexGuard<'_, Box<dyn FirstStageElement>> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn observe_series(&self, series: &[SampledSeries]) {
        self.lock().observe_series(series);
    }

    /// The combined series. The second stage only applies to the final mode,
    /// partial results must stay complete.
    pub fn results(&self) -> SeriesSet {
        let results = self.lock().result();

        match (&self.second_stage, self.mode) {
            (Some(second_stage), AggregateMode::Final) => second_stage.process(results),
            _ => results,
        }
    }

    pub fn length(&self) -> usize {
        self.lock().length()
    }
}

fn check_request(req: &QueryRangeRequest) -> Result<(), EngineError> {
    if req.start == 0 {
        return Err(EngineError::InvalidRequest("start is required".to_owned()));
    }
    if req.end == 0 {
        return Err(EngineError::InvalidRequest("end is required".to_owned()));
    }
    if req.end <= req.start {
        return Err(EngineError::InvalidRequest(format!(
            "end {} must be after start {}",
            req.end, req.start
        )));
    }
    if req.step == 0 {
        return Err(EngineError::InvalidRequest("step is required".to_owned()));
    }

    Ok(())
}

fn not_a_metrics_query(root: &RootExpr) -> EngineError {
    EngineError::InvalidRequest(format!("not a metrics query: {root}"))
}

impl Engine {
    /// Compiles the raw stage of a metrics query. Exemplar limits come from
    /// the configuration, the `exemplars` hint overrides the total.
    #[instrument(level = tracing::Level::TRACE, skip_all)]
    pub fn compile_metrics_query_range(
        &self,
        root: RootExpr,
        req: &QueryRangeRequest,
    ) -> Result<MetricsEvaluator, EngineError> {
        check_request(req)?;

        let CompiledQuery {
            mut root,
            mut request,
        } = self.compile(root)?;

        let Some(mut metrics) = root.metrics_pipeline.take() else {
            return Err(not_a_metrics_query(&root));
        };

        let allow_unsafe = self.config.allow_unsafe_query_hints;
        let max_exemplars = match root.hints.get_int(HINT_EXEMPLARS, allow_unsafe) {
            Some(n) => usize::try_from(n).unwrap_or(0),
            None => self.config.max_exemplars,
        };
        let time_overlap_cutoff = root
            .hints
            .get_float(HINT_TIME_OVERLAP_CUTOFF, allow_unsafe)
            .filter(|cutoff| (0.0..=1.0).contains(cutoff))
            .unwrap_or(self.config.time_overlap_cutoff);

        let req = req
            .clone()
            .with_exemplars(max_exemplars, self.config.exemplars_per_bucket);

        metrics.configure(&self.config);
        metrics.init(&req, AggregateMode::Raw)?;

        let span_start = Attribute::intrinsic(Intrinsic::SpanStartTime);
        if !request.has_attribute(&span_start) {
            request.append_second_pass_condition(Condition::fetch(span_start));
        }

        if max_exemplars > 0 {
            let meta = exemplar_meta_conditions_without(
                &request.second_pass_conditions,
                request.all_conditions,
            );
            for condition in meta {
                request.append_second_pass_condition(condition);
            }
        }

        // a query that matches nothing must still be evaluated, storage
        // cannot tell
        if root.is_noop() {
            request.all_conditions = false;
        }

        let state = Arc::new(Mutex::new(EvaluatorState {
            pipeline: root.pipeline,
            metrics,
            bytes: 0,
            spans_total: 0,
            spans_deduped: 0,
            exemplar_traces: HashSet::new(),
            dedupe_spans: false,
            seen_spans: HashSet::new(),
        }));

        let shared = state.clone();
        request.second_pass = Some(Arc::new(move |spanset: Spanset| {
            let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
            state.pipeline.evaluate(vec![spanset])
        }));

        optimize(&mut request);

        tracing::debug!(?request, max_exemplars, "compiled metrics query");

        Ok(MetricsEvaluator {
            request,
            req,
            max_exemplars,
            max_series: self.config.max_series,
            time_overlap_cutoff,
            state,
        })
    }

    /// Compiles the sum or final stage of a metrics query. The request is
    /// used as is, including its exemplar limits.
    #[instrument(level = tracing::Level::TRACE, skip_all)]
    pub fn compile_metrics_query_range_non_raw(
        &self,
        root: RootExpr,
        req: &QueryRangeRequest,
        mode: AggregateMode,
    ) -> Result<MetricsFrontendEvaluator, EngineError> {
        if mode == AggregateMode::Raw {
            return Err(EngineError::InvalidRequest(
                "raw mode is compiled with compile_metrics_query_range".to_owned(),
            ));
        }
        check_request(req)?;

        let CompiledQuery { mut root, .. } = self.compile(root)?;

        let Some(mut metrics) = root.metrics_pipeline.take() else {
            return Err(not_a_metrics_query(&root));
        };
        metrics.configure(&self.config);
        metrics.init(req, mode)?;

        let mut second_stage = root.metrics_second_stage.take();
        if let Some(second_stage) = &mut second_stage {
            second_stage.init(req);
        }

        Ok(MetricsFrontendEvaluator {
            mode,
            metrics: Mutex::new(metrics),
            second_stage,
        })
    }
}
