//! Turning matched spans into time series.
//!
//! A metrics query runs in three modes that together form a scatter/gather
//! protocol:
//! - [`AggregateMode::Raw`] observes spans directly, once per data source.
//! - [`AggregateMode::Sum`] merges raw results from many sources into a
//!   partial result that can be merged again.
//! - [`AggregateMode::Final`] runs exactly once and performs what cannot be
//!   distributed, like computing quantiles from histograms.
//!
//! Results travel between modes in the sampled form ([`SampledSeries`]),
//! produced by [`SeriesSet::to_sampled`].

use std::collections::btree_map::{self, BTreeMap};
use std::fmt::{Debug, Display, Error as FmtError, Formatter};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{Static, StaticType};
use crate::span::Span;
use crate::storage::FetchSpansRequest;

mod aggregate;
mod average;
mod combine;
mod compare;
mod exemplars;
mod grouping;
pub mod interval;
mod second_stage;
mod step;

pub use aggregate::{MetricsAggregate, MetricsAggregateOp};
pub use combine::{log2_bucketize, log2_quantile, HistogramBucket};
pub use compare::{
    MetricsCompare, META_TYPE_BASELINE, META_TYPE_BASELINE_TOTAL, META_TYPE_SELECTION,
    META_TYPE_SELECTION_TOTAL,
};
pub use second_stage::{SecondStageOp, TopKBottomK};

pub(crate) use grouping::is_intrinsic_like;

pub const LABEL_NAME: &str = "__name__";
pub const LABEL_META_TYPE: &str = "__meta_type";
pub const LABEL_META_ERROR: &str = "__meta_error";
pub const LABEL_BUCKET: &str = "__bucket";
pub const META_TYPE_COUNT: &str = "__count";
pub const META_ERROR_TOO_MANY_VALUES: &str = "__too_many_values";

/// Upper bound on group-by attributes, the dynamic bucket label included.
pub const MAX_GROUP_BYS: usize = 5;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AggregateMode {
    Raw,
    Sum,
    Final,
}

/// Parameters of a range query. Times are unix nanoseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRangeRequest {
    pub start: u64,
    pub end: u64,
    pub step: u64,
    pub max_exemplars: usize,
    pub exemplars_per_bucket: usize,
}

impl QueryRangeRequest {
    pub fn new(start: u64, end: u64, step: u64) -> QueryRangeRequest {
        let config = EngineConfig::default();

        QueryRangeRequest {
            start,
            end,
            step,
            max_exemplars: config.max_exemplars,
            exemplars_per_bucket: config.exemplars_per_bucket,
        }
    }

    pub fn with_exemplars(mut self, max_exemplars: usize, exemplars_per_bucket: usize) -> QueryRangeRequest {
        self.max_exemplars = max_exemplars;
        self.exemplars_per_bucket = exemplars_per_bucket;
        self
    }

    /// Number of buckets of every series produced for this request.
    pub fn intervals(&self) -> usize {
        interval::interval_count(self.start, self.end, self.step)
    }

    pub(crate) fn step_seconds(&self) -> f64 {
        self.step as f64 / 1_000_000_000.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub name: String,
    pub value: Static,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<Static>) -> Label {
        Label {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered labels of a series. The [`Display`] form is the canonical
/// Prometheus-style key used by [`SeriesSet`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new(labels: Vec<Label>) -> Labels {
        Labels(labels)
    }

    pub fn push(&mut self, label: Label) {
        self.0.push(label);
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Static>) -> Labels {
        self.push(Label::new(name, value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Static> {
        self.0.iter().find(|l| l.name == name).map(|l| &l.value)
    }

    /// Removes the named label, returning its value.
    pub fn take(&mut self, name: &str) -> Option<Static> {
        let i = self.0.iter().position(|l| l.name == name)?;
        Some(self.0.remove(i).value)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Labels sorted by name, values stringified. Nil values and the string
    /// "nil" become `<nil>` and the empty string becomes `<empty>`. A later
    /// label overrides an earlier one of the same name.
    pub fn prom_string(&self) -> String {
        let mut sorted: BTreeMap<&str, String> = BTreeMap::new();

        for label in &self.0 {
            let value = match &label.value {
                Static::Nil => "<nil>".to_owned(),
                Static::String(s) if s == "nil" => "<nil>".to_owned(),
                Static::String(s) if s.is_empty() => "<empty>".to_owned(),
                other => other.encode_to_string(false),
            };
            sorted.insert(&label.name, value);
        }

        let mut out = String::from("{");
        for (i, (name, value)) in sorted.into_iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(name);
            out.push('=');
            out.push_str(&format!("{value:?}"));
        }
        out.push('}');
        out
    }
}

impl Display for Labels {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(&self.prom_string())
    }
}

impl FromIterator<Label> for Labels {
    fn from_iter<I: IntoIterator<Item = Label>>(iter: I) -> Labels {
        Labels(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Exemplar {
    pub labels: Labels,
    pub value: f64,
    pub timestamp_ms: u64,
}

impl Exemplar {
    /// An exemplar describing the span, labelled with all its attributes.
    pub(crate) fn from_span(span: &dyn Span, value: f64) -> Exemplar {
        let mut labels = Labels::default();
        span.all_attributes_func(&mut |attribute, value| {
            labels.push(Label::new(attribute.to_string(), value.clone()));
        });

        Exemplar {
            labels,
            value,
            timestamp_ms: span.start_time_unix_nanos() / 1_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub labels: Labels,
    /// One value per bucket, NaN where there is no value.
    pub values: Vec<f64>,
    pub exemplars: Vec<Exemplar>,
}

impl TimeSeries {
    pub fn new(labels: Labels, values: Vec<f64>) -> TimeSeries {
        TimeSeries {
            labels,
            values,
            exemplars: Vec::new(),
        }
    }
}

/// Series keyed by their canonical label string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesSet(BTreeMap<String, TimeSeries>);

impl SeriesSet {
    pub fn new() -> SeriesSet {
        SeriesSet(BTreeMap::new())
    }

    /// Adds the series under its label key, replacing any series with the
    /// same labels.
    pub fn insert(&mut self, series: TimeSeries) {
        self.0.insert(series.labels.prom_string(), series);
    }

    pub fn insert_with_key(&mut self, key: String, series: TimeSeries) {
        self.0.insert(key, series);
    }

    pub fn get(&self, key: &str) -> Option<&TimeSeries> {
        self.0.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut TimeSeries> {
        self.0.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<TimeSeries> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, TimeSeries> {
        self.0.iter()
    }

    pub fn keys(&self) -> btree_map::Keys<'_, String, TimeSeries> {
        self.0.keys()
    }

    pub fn values(&self) -> btree_map::Values<'_, String, TimeSeries> {
        self.0.values()
    }

    /// Converts to the sampled form exchanged between aggregation modes.
    /// NaN values and series without any sample are left out, as are
    /// exemplars that land outside the range or on a NaN bucket.
    pub fn to_sampled(&self, req: &QueryRangeRequest) -> Vec<SampledSeries> {
        let start = interval::align_start(req.start, req.step);
        let end = interval::align_end(req.end, req.step);

        let mut output = Vec::with_capacity(self.0.len());

        for (key, series) in &self.0 {
            let samples: Vec<Sample> = series
                .values
                .iter()
                .enumerate()
                .filter_map(|(i, value)| {
                    let ts = interval::timestamp_of(i, req.start, req.step);
                    if ts < start || ts > end || value.is_nan() {
                        return None;
                    }

                    Some(Sample {
                        timestamp_ms: (ts / 1_000_000) as i64,
                        value: *value,
                    })
                })
                .collect();

            if samples.is_empty() {
                continue;
            }

            let exemplars = series
                .exemplars
                .iter()
                .filter(|e| {
                    let i = interval::interval_of_ms(e.timestamp_ms as i64, start, end, req.step);
                    matches!(i, Some(i) if series.values.get(i).is_some_and(|v| !v.is_nan()))
                })
                .cloned()
                .collect();

            output.push(SampledSeries {
                prom_labels: key.clone(),
                labels: series.labels.clone(),
                samples,
                exemplars,
            });
        }

        output
    }
}

impl IntoIterator for SeriesSet {
    type Item = (String, TimeSeries);
    type IntoIter = btree_map::IntoIter<String, TimeSeries>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a SeriesSet {
    type Item = (&'a String, &'a TimeSeries);
    type IntoIter = btree_map::Iter<'a, String, TimeSeries>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<TimeSeries> for SeriesSet {
    fn from_iter<I: IntoIterator<Item = TimeSeries>>(iter: I) -> SeriesSet {
        let mut set = SeriesSet::new();
        for series in iter {
            set.insert(series);
        }
        set
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub value: f64,
}

/// A series as exchanged between aggregation modes: only buckets with a
/// value are present, each with its timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledSeries {
    pub prom_labels: String,
    pub labels: Labels,
    pub samples: Vec<Sample>,
    pub exemplars: Vec<Exemplar>,
}

/// Numeric value of an attribute for aggregation, or NaN if the span does
/// not have it or it is not numeric.
pub(crate) fn floatize(value: Option<Static>) -> f64 {
    match value {
        Some(v) if v.static_type() != StaticType::Nil => v.float(),
        _ => f64::NAN,
    }
}

/// The first stage of a metrics query, e.g. `rate() by (resource.service.name)`.
///
/// The same element serves all three modes: it is initialized for one and
/// then fed spans (raw) or series from a previous mode (sum, final).
pub trait FirstStageElement: Display + Debug + Send {
    /// Adds the attributes the stage reads to the fetch request.
    fn extract_conditions(&self, request: &mut FetchSpansRequest);

    /// Applies engine-wide defaults that the query left open.
    fn configure(&mut self, _config: &EngineConfig) {}

    fn init(&mut self, req: &QueryRangeRequest, mode: AggregateMode) -> Result<(), EngineError>;

    fn observe(&mut self, span: &dyn Span);

    fn observe_exemplar(&mut self, span: &dyn Span);

    fn observe_series(&mut self, series: &[SampledSeries]);

    fn result(&self) -> SeriesSet;

    /// Number of series held so far.
    fn length(&self) -> usize;

    fn validate(&self) -> Result<(), EngineError>;

    fn fold(&mut self, _branch_samples: usize) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Post-processing of fully combined results, e.g. `topk(5)`.
pub trait SecondStageElement: Display + Debug + Send {
    fn init(&mut self, req: &QueryRangeRequest);

    fn process(&self, input: SeriesSet) -> SeriesSet;

    fn validate(&self) -> Result<(), EngineError>;
}

/// Merges sampled series from many sources.
pub(crate) trait SeriesCombiner: Debug + Send {
    fn combine(&mut self, input: &[SampledSeries]);

    fn results(&self) -> SeriesSet;

    fn length(&self) -> usize;
}
