//! `compare()`: splits spans into a baseline and a selection by a filter and
//! counts every attribute value in both populations, so the two can be
//! compared value by value.
//!
//! Output series:
//! - `{<attr>=<value>, __meta_type="baseline"}` (and `"selection"`) with the
//!   number of spans carrying that value per bucket,
//! - `{<attr>=nil, __meta_type=.., __meta_error="__too_many_values"}` summing
//!   the values dropped from an attribute that had more than the top N,
//! - `{__meta_type="baseline_total"}` (and `"selection_total"`) counting all
//!   spans of the population. Exemplars ride on these.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Error as FmtError, Formatter};

use super::exemplars::SeriesExemplars;
use super::interval::{interval_count, interval_of, interval_of_ms};
use super::{
    AggregateMode, FirstStageElement, Labels, QueryRangeRequest, SampledSeries, SeriesSet,
    TimeSeries, LABEL_META_ERROR, LABEL_META_TYPE, META_ERROR_TOO_MANY_VALUES,
};
use crate::attribute::{Attribute, Intrinsic};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::filter::SpansetFilter;
use crate::models::{Static, StaticMapKey};
use crate::span::Span;
use crate::storage::{Condition, FetchSpansRequest};

pub const META_TYPE_BASELINE: &str = "baseline";
pub const META_TYPE_SELECTION: &str = "selection";
pub const META_TYPE_BASELINE_TOTAL: &str = "baseline_total";
pub const META_TYPE_SELECTION_TOTAL: &str = "selection_total";

/// Attributes that are unique per span or trace. Comparing them says
/// nothing and only produces series.
const EXCLUDED_INTRINSICS: &[Intrinsic] = &[
    Intrinsic::Duration,
    Intrinsic::TraceDuration,
    Intrinsic::TraceId,
    Intrinsic::TraceStartTime,
    Intrinsic::SpanId,
    Intrinsic::SpanStartTime,
    Intrinsic::ParentId,
    Intrinsic::NestedSetLeft,
    Intrinsic::NestedSetRight,
    Intrinsic::NestedSetParent,
    Intrinsic::EventTimeSinceStart,
    Intrinsic::LinkSpanId,
    Intrinsic::LinkTraceId,
];

fn is_comparable(attribute: &Attribute, value: &Static) -> bool {
    !EXCLUDED_INTRINSICS.contains(&attribute.intrinsic)
        && !matches!(value, Static::Nil | Static::Float(_) | Static::Duration(_))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Population {
    Baseline,
    Selection,
}

impl Population {
    fn meta_type(self) -> &'static str {
        match self {
            Population::Baseline => META_TYPE_BASELINE,
            Population::Selection => META_TYPE_SELECTION,
        }
    }

    fn total_meta_type(self) -> &'static str {
        match self {
            Population::Baseline => META_TYPE_BASELINE_TOTAL,
            Population::Selection => META_TYPE_SELECTION_TOTAL,
        }
    }

    /// The population and whether the series is its total.
    fn from_meta_type(meta_type: &str) -> Option<(Population, bool)> {
        match meta_type {
            META_TYPE_BASELINE => Some((Population::Baseline, false)),
            META_TYPE_SELECTION => Some((Population::Selection, false)),
            META_TYPE_BASELINE_TOTAL => Some((Population::Baseline, true)),
            META_TYPE_SELECTION_TOTAL => Some((Population::Selection, true)),
            _ => None,
        }
    }
}

fn add_into(target: &mut [f64], i: Option<usize>, value: f64) {
    if value.is_nan() {
        return;
    }

    if let Some(slot) = i.and_then(|i| target.get_mut(i)) {
        *slot += value;
    }
}

#[derive(Debug)]
struct ValueCounts {
    value: Static,
    counts: Vec<f64>,
}

#[derive(Debug, Default)]
struct AttributeCounts {
    values: HashMap<StaticMapKey, ValueCounts>,
    /// Counts of values already dropped upstream.
    overflow: Option<Vec<f64>>,
}

impl AttributeCounts {
    fn counts_for(&mut self, value: &Static, len: usize) -> &mut Vec<f64> {
        &mut self
            .values
            .entry(value.map_key())
            .or_insert_with(|| ValueCounts {
                value: value.clone(),
                counts: vec![0.0; len],
            })
            .counts
    }

    fn overflow(&mut self, len: usize) -> &mut Vec<f64> {
        self.overflow.get_or_insert_with(|| vec![0.0; len])
    }

    /// The `limit` values with the highest counts and the per-bucket sum of
    /// everything else, if anything else exists.
    fn top(&self, limit: usize) -> (Vec<&ValueCounts>, Option<Vec<f64>>) {
        let mut ranked: Vec<(f64, &StaticMapKey, &ValueCounts)> = self
            .values
            .iter()
            .map(|(key, counts)| {
                let total = counts.counts.iter().filter(|c| !c.is_nan()).sum();
                (total, key, counts)
            })
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));

        let mut overflow = self.overflow.clone();
        if ranked.len() > limit {
            for (_, _, dropped) in ranked.split_off(limit) {
                let overflow = overflow.get_or_insert_with(|| vec![0.0; dropped.counts.len()]);
                for (sum, count) in overflow.iter_mut().zip(&dropped.counts) {
                    if !count.is_nan() {
                        *sum += count;
                    }
                }
            }
        }

        (ranked.into_iter().map(|(_, _, counts)| counts).collect(), overflow)
    }
}

#[derive(Debug)]
struct PopulationCounts {
    population: Population,
    attributes: BTreeMap<String, AttributeCounts>,
    totals: Vec<f64>,
    exemplars: SeriesExemplars,
}

impl PopulationCounts {
    fn new(population: Population, req: &QueryRangeRequest, len: usize) -> PopulationCounts {
        PopulationCounts {
            population,
            attributes: BTreeMap::new(),
            totals: vec![0.0; len],
            exemplars: SeriesExemplars::new(req),
        }
    }

    fn attribute(&mut self, name: &str) -> &mut AttributeCounts {
        self.attributes.entry(name.to_owned()).or_default()
    }

    /// Series written by [`write_series`](Self::write_series), the total
    /// included.
    fn series_count(&self, limit: usize) -> usize {
        let values: usize = self
            .attributes
            .values()
            .map(|a| {
                let overflows = a.values.len() > limit || a.overflow.is_some();
                a.values.len().min(limit) + usize::from(overflows)
            })
            .sum();

        values + 1
    }

    fn write_series(&self, limit: usize, output: &mut SeriesSet) {
        let meta_type = self.population.meta_type();

        for (name, attribute) in &self.attributes {
            let (top, overflow) = attribute.top(limit);
            for counts in top {
                let labels = Labels::default()
                    .with(name.as_str(), counts.value.clone())
                    .with(LABEL_META_TYPE, meta_type);
                output.insert(TimeSeries::new(labels, counts.counts.clone()));
            }

            if let Some(overflow) = overflow {
                let labels = Labels::default()
                    .with(name.as_str(), Static::Nil)
                    .with(LABEL_META_TYPE, meta_type)
                    .with(LABEL_META_ERROR, META_ERROR_TOO_MANY_VALUES);
                output.insert(TimeSeries::new(labels, overflow));
            }
        }

        let labels = Labels::default().with(LABEL_META_TYPE, self.population.total_meta_type());
        let mut total = TimeSeries::new(labels, self.totals.clone());
        total.exemplars = self.exemplars.exemplars().to_vec();
        output.insert(total);
    }
}

#[derive(Debug)]
struct CompareState {
    mode: AggregateMode,
    start: u64,
    end: u64,
    step: u64,
    len: usize,
    baseline: PopulationCounts,
    selection: PopulationCounts,
}

impl CompareState {
    fn population(&mut self, population: Population) -> &mut PopulationCounts {
        match population {
            Population::Baseline => &mut self.baseline,
            Population::Selection => &mut self.selection,
        }
    }
}

/// `compare({ <selection> }, <top n>, <start>, <end>)`.
#[derive(Debug)]
pub struct MetricsCompare {
    pub filter: SpansetFilter,
    /// Values kept per attribute. Taken from the configuration if unset.
    pub top_n: Option<usize>,
    /// Only spans starting within this window can be selected.
    pub window: Option<(u64, u64)>,
    limit: usize,
    state: Option<CompareState>,
}

impl MetricsCompare {
    pub fn new(filter: SpansetFilter) -> MetricsCompare {
        MetricsCompare {
            filter,
            top_n: None,
            window: None,
            limit: 0,
            state: None,
        }
    }

    pub fn with_top_n(mut self, top_n: usize) -> MetricsCompare {
        self.top_n = Some(top_n);
        self.limit = top_n;
        self
    }

    pub fn with_window(mut self, start: u64, end: u64) -> MetricsCompare {
        self.window = Some((start, end));
        self
    }

    fn population_of(&mut self, span: &dyn Span) -> Population {
        if let Some((start, end)) = self.window {
            let ts = span.start_time_unix_nanos();
            if ts < start || ts >= end {
                return Population::Baseline;
            }
        }

        match self.filter.matches(span) {
            Ok(true) => Population::Selection,
            Ok(false) => Population::Baseline,
            Err(err) => {
                tracing::debug!(?err, "compare selection failed, counting span as baseline");
                Population::Baseline
            }
        }
    }

    fn combine_series(state: &mut CompareState, series: &SampledSeries) {
        let mut labels = series.labels.clone();

        let meta_type = labels.take(LABEL_META_TYPE);
        let Some((population, is_total)) = meta_type
            .as_ref()
            .and_then(Static::as_str)
            .and_then(Population::from_meta_type)
        else {
            tracing::debug!(series = %series.prom_labels, "compare series without a known type");
            return;
        };

        let is_overflow = labels.take(LABEL_META_ERROR).is_some();

        let (start, end, step, len) = (state.start, state.end, state.step, state.len);
        let counts = state.population(population);

        if is_total {
            for sample in &series.samples {
                let i = interval_of_ms(sample.timestamp_ms, start, end, step);
                add_into(&mut counts.totals, i, sample.value);
            }
            for exemplar in &series.exemplars {
                counts.exemplars.add(exemplar);
            }
            return;
        }

        let Some(label) = labels.iter().next() else {
            tracing::debug!(series = %series.prom_labels, "compare series without an attribute");
            return;
        };

        let attribute = counts.attribute(&label.name);
        let target = if is_overflow {
            attribute.overflow(len)
        } else {
            attribute.counts_for(&label.value, len)
        };

        for sample in &series.samples {
            let i = interval_of_ms(sample.timestamp_ms, start, end, step);
            add_into(target, i, sample.value);
        }
    }
}

impl FirstStageElement for MetricsCompare {
    fn extract_conditions(&self, request: &mut FetchSpansRequest) {
        // the selection must not restrict what is fetched, the baseline
        // needs every span
        let mut selection = FetchSpansRequest::default();
        self.filter.expression.extract_boolean_conditions(&mut selection);
        for condition in selection.conditions {
            request.append_second_pass_condition(Condition::fetch(condition.attribute));
        }

        request.second_pass_select_all = true;

        let span_start = Attribute::intrinsic(Intrinsic::SpanStartTime);
        if !request.has_attribute(&span_start) {
            request.append_second_pass_condition(Condition::fetch(span_start));
        }
    }

    fn configure(&mut self, config: &EngineConfig) {
        if self.top_n.is_none() {
            self.limit = config.compare_top_n;
        }
    }

    fn init(&mut self, req: &QueryRangeRequest, mode: AggregateMode) -> Result<(), EngineError> {
        if self.limit == 0 {
            return Err(EngineError::Execution(
                "compare() top n is not configured".to_owned(),
            ));
        }

        let len = interval_count(req.start, req.end, req.step);

        self.state = Some(CompareState {
            mode,
            start: req.start,
            end: req.end,
            step: req.step,
            len,
            baseline: PopulationCounts::new(Population::Baseline, req, len),
            selection: PopulationCounts::new(Population::Selection, req, len),
        });

        Ok(())
    }

    fn observe(&mut self, span: &dyn Span) {
        let population = self.population_of(span);

        let Some(state) = &mut self.state else {
            return;
        };
        if state.mode != AggregateMode::Raw {
            return;
        }

        let Some(i) = interval_of(span.start_time_unix_nanos(), state.start, state.end, state.step)
        else {
            return;
        };

        let len = state.len;
        let counts = state.population(population);
        add_into(&mut counts.totals, Some(i), 1.0);

        span.all_attributes_func(&mut |attribute, value| {
            if is_comparable(attribute, value) {
                let attribute = counts.attribute(&attribute.to_string());
                add_into(attribute.counts_for(value, len), Some(i), 1.0);
            }
        });
    }

    fn observe_exemplar(&mut self, span: &dyn Span) {
        let population = self.population_of(span);

        if let Some(state) = &mut self.state {
            state.population(population).exemplars.observe(span, f64::NAN);
        }
    }

    fn observe_series(&mut self, series: &[SampledSeries]) {
        let Some(state) = &mut self.state else {
            return;
        };
        if state.mode == AggregateMode::Raw {
            return;
        }

        for series in series {
            MetricsCompare::combine_series(state, series);
        }
    }

    fn result(&self) -> SeriesSet {
        let mut output = SeriesSet::new();

        if let Some(state) = &self.state {
            state.baseline.write_series(self.limit, &mut output);
            state.selection.write_series(self.limit, &mut output);
        }

        output
    }

    fn length(&self) -> usize {
        match &self.state {
            Some(state) => {
                state.baseline.series_count(self.limit) + state.selection.series_count(self.limit)
            }
            None => 0,
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        self.filter.validate()?;

        if self.top_n == Some(0) {
            return Err(EngineError::Validation(
                "compare() top n must be greater than 0".to_owned(),
            ));
        }

        match self.window {
            Some((start, end)) if start >= end => Err(EngineError::Validation(format!(
                "compare() window start {start} must be before end {end}"
            ))),
            _ => Ok(()),
        }
    }

    fn fold(&mut self, branch_samples: usize) -> Result<(), EngineError> {
        self.filter = self.filter.clone().fold(branch_samples)?;
        Ok(())
    }
}

impl Display for MetricsCompare {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "compare({}", self.filter)?;
        if let Some(top_n) = self.top_n {
            write!(f, ", {top_n}")?;
        }
        if let Some((start, end)) = self.window {
            write!(f, ", {start}, {end}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::filter::{FieldExpression, Operator};
    use crate::models::Status;
    use crate::span::SpanRef;
    use crate::storage::transient::{MemoryTrace, NewSpan};

    const S: u64 = 1_000_000_000;

    fn errors() -> SpansetFilter {
        SpansetFilter::new(FieldExpression::binary(
            Operator::Equal,
            FieldExpression::attribute(Attribute::new("status")),
            FieldExpression::value(Status::Error),
        ))
    }

    fn spans() -> Vec<SpanRef> {
        MemoryTrace::new(&[1])
            .with_span(
                NewSpan::new(&[1], "get")
                    .start(S)
                    .duration(Duration::from_millis(5))
                    .status(Status::Error)
                    .attribute("region", "eu"),
            )
            .with_span(NewSpan::new(&[2], "get").start(S).attribute("region", "eu"))
            .with_span(NewSpan::new(&[3], "put").start(S).attribute("region", "us"))
            .with_span(NewSpan::new(&[4], "put").start(S).attribute("region", "ap"))
            .build()
            .spans
    }

    fn raw(compare: &mut MetricsCompare, req: &QueryRangeRequest) -> SeriesSet {
        compare.validate().unwrap();
        compare.configure(&EngineConfig::default());
        compare.init(req, AggregateMode::Raw).unwrap();
        for span in spans() {
            compare.observe(span.as_ref());
        }
        compare.result()
    }

    fn first(set: &SeriesSet, labels: Labels) -> f64 {
        set.get(&labels.prom_string())
            .unwrap_or_else(|| panic!("no series {labels} in {:?}", set.keys().collect::<Vec<_>>()))
            .values[0]
    }

    #[test]
    fn splits_populations() {
        let req = QueryRangeRequest::new(S, 2 * S, S);
        let result = raw(&mut MetricsCompare::new(errors()), &req);

        let total = |t: &str| Labels::default().with(LABEL_META_TYPE, t);
        assert_eq!(first(&result, total(META_TYPE_BASELINE_TOTAL)), 3.0);
        assert_eq!(first(&result, total(META_TYPE_SELECTION_TOTAL)), 1.0);

        let region = |r: &str, t: &str| {
            Labels::default().with("span.region", r).with(LABEL_META_TYPE, t)
        };
        assert_eq!(first(&result, region("eu", META_TYPE_SELECTION)), 1.0);
        assert_eq!(first(&result, region("eu", META_TYPE_BASELINE)), 1.0);
        assert_eq!(first(&result, region("us", META_TYPE_BASELINE)), 1.0);

        // unique per span values are not compared
        assert!(!result.keys().any(|k| k.contains("duration")));
    }

    #[test]
    fn window_gates_the_selection() {
        let req = QueryRangeRequest::new(S, 2 * S, S);
        let mut compare = MetricsCompare::new(errors()).with_window(2 * S, 3 * S);
        let result = raw(&mut compare, &req);

        let total = Labels::default().with(LABEL_META_TYPE, META_TYPE_BASELINE_TOTAL);
        assert_eq!(first(&result, total), 4.0);
    }

    #[test]
    fn too_many_values() {
        let req = QueryRangeRequest::new(S, 2 * S, S);
        let mut compare = MetricsCompare::new(errors()).with_top_n(1);
        let result = raw(&mut compare, &req);

        // the error span is not part of the baseline
        let name = |n: &str| {
            Labels::default().with("name", n).with(LABEL_META_TYPE, META_TYPE_BASELINE)
        };
        assert_eq!(first(&result, name("put")), 2.0);
        assert!(result.get(&name("get").prom_string()).is_none());

        let sentinel = Labels::default()
            .with("span.region", Static::Nil)
            .with(LABEL_META_TYPE, META_TYPE_BASELINE)
            .with(LABEL_META_ERROR, META_ERROR_TOO_MANY_VALUES);
        assert_eq!(first(&result, sentinel), 2.0);
    }

    #[test]
    fn combines_shards() {
        let req = QueryRangeRequest::new(S, 2 * S, S);
        let shard = raw(&mut MetricsCompare::new(errors()).with_top_n(1), &req).to_sampled(&req);

        let mut last = MetricsCompare::new(errors()).with_top_n(1);
        last.init(&req, AggregateMode::Final).unwrap();
        last.observe_series(&shard);
        last.observe_series(&shard);

        let result = last.result();
        let sentinel = Labels::default()
            .with("span.region", Static::Nil)
            .with(LABEL_META_TYPE, META_TYPE_BASELINE)
            .with(LABEL_META_ERROR, META_ERROR_TOO_MANY_VALUES);
        assert_eq!(first(&result, sentinel), 4.0);

        let total = Labels::default().with(LABEL_META_TYPE, META_TYPE_SELECTION_TOTAL);
        assert_eq!(first(&result, total), 2.0);
    }

    #[test]
    fn selection_is_only_fetched() {
        let compare = MetricsCompare::new(errors());
        let mut request = FetchSpansRequest::new(0, 0);
        compare.extract_conditions(&mut request);

        assert!(request.conditions.is_empty());
        assert!(request.second_pass_select_all);
        assert!(request.has_attribute(&Attribute::new("status")));
        assert!(request.has_attribute(&Attribute::intrinsic(Intrinsic::SpanStartTime)));
    }

    #[test]
    fn configured_top_n() {
        let req = QueryRangeRequest::new(S, 2 * S, S);

        let mut compare = MetricsCompare::new(errors());
        assert!(matches!(
            compare.init(&req, AggregateMode::Raw),
            Err(EngineError::Execution(_))
        ));

        compare.configure(&EngineConfig {
            compare_top_n: 3,
            ..EngineConfig::default()
        });
        assert_eq!(compare.limit, 3);
        compare.init(&req, AggregateMode::Raw).unwrap();

        let mut explicit = MetricsCompare::new(errors()).with_top_n(5);
        explicit.configure(&EngineConfig::default());
        assert_eq!(explicit.limit, 5);

        assert_eq!(explicit.to_string(), "compare({ status = error }, 5)");
    }
}
