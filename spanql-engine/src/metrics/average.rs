//! `avg_over_time`. Means cannot be added across sources, so every mean
//! series travels with a count series carrying the same labels plus
//! `__meta_type="__count"`, and sources are merged by weight.

use std::collections::{BTreeMap, HashMap};

use super::exemplars::{ExemplarBuckets, SeriesExemplars};
use super::grouping::RangeAggregator;
use super::interval::{interval_count, interval_of, interval_of_ms};
use super::step::SpanValue;
use super::{
    Exemplar, Labels, QueryRangeRequest, SampledSeries, SeriesCombiner, SeriesSet, TimeSeries,
    LABEL_META_TYPE, META_TYPE_COUNT,
};
use crate::models::Static;
use crate::span::Span;

/// A running mean. The correction term is accumulated with Kahan-Neumaier
/// compensation so that many small updates do not drift.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub(crate) struct WeightedMean {
    mean: f64,
    compensation: f64,
    weight: f64,
}

impl WeightedMean {
    pub(crate) fn add(&mut self, value: f64, weight: f64) {
        if value.is_nan() || weight.is_nan() || weight <= 0.0 {
            return;
        }

        if self.weight == 0.0 {
            *self = WeightedMean {
                mean: value,
                compensation: 0.0,
                weight,
            };
            return;
        }

        let total = self.weight + weight;
        let delta = weight / total * (value - self.value());

        let sum = self.mean + delta;
        if self.mean.abs() >= delta.abs() {
            self.compensation += (self.mean - sum) + delta;
        } else {
            self.compensation += (delta - sum) + self.mean;
        }

        self.mean = sum;
        self.weight = total;
    }

    /// NaN until something is added.
    pub(crate) fn value(&self) -> f64 {
        if self.weight == 0.0 {
            return f64::NAN;
        }

        self.mean + self.compensation
    }

    pub(crate) fn weight(&self) -> f64 {
        self.weight
    }
}

fn count_labels(labels: &Labels) -> Labels {
    labels.clone().with(LABEL_META_TYPE, META_TYPE_COUNT)
}

fn is_count_series(labels: &Labels) -> bool {
    matches!(labels.get(LABEL_META_TYPE), Some(Static::String(s)) if s == META_TYPE_COUNT)
}

fn weights(means: &[WeightedMean]) -> Vec<f64> {
    means
        .iter()
        .map(|m| if m.weight() > 0.0 { m.weight() } else { f64::NAN })
        .collect()
}

/// Raw mode accumulation for one series.
#[derive(Debug, Clone)]
pub(crate) struct AverageStep {
    value: SpanValue,
    start: u64,
    end: u64,
    step: u64,
    means: Vec<WeightedMean>,
    exemplars: SeriesExemplars,
}

impl AverageStep {
    pub(crate) fn new(req: &QueryRangeRequest, value: SpanValue) -> AverageStep {
        AverageStep {
            value,
            start: req.start,
            end: req.end,
            step: req.step,
            means: vec![WeightedMean::default(); interval_count(req.start, req.end, req.step)],
            exemplars: SeriesExemplars::new(req),
        }
    }
}

impl RangeAggregator for AverageStep {
    fn observe(&mut self, span: &dyn Span) {
        let i = interval_of(span.start_time_unix_nanos(), self.start, self.end, self.step);
        if let Some(mean) = i.and_then(|i| self.means.get_mut(i)) {
            mean.add(self.value.of(span), 1.0);
        }
    }

    fn observe_exemplar(&mut self, span: &dyn Span, value: f64) {
        self.exemplars.observe(span, value);
    }

    fn write_series(&self, labels: Labels, output: &mut SeriesSet) {
        output.insert(TimeSeries::new(count_labels(&labels), weights(&self.means)));

        let mut mean = TimeSeries::new(labels, self.means.iter().map(WeightedMean::value).collect());
        mean.exemplars = self.exemplars.exemplars().to_vec();
        output.insert(mean);
    }
}

#[derive(Debug)]
struct AverageSeries {
    labels: Labels,
    means: Vec<WeightedMean>,
    exemplars: Vec<Exemplar>,
}

/// Merges mean and count series. In the sum mode the counts are emitted
/// again so the result can be merged further; in the final mode only the
/// means are.
#[derive(Debug)]
pub(crate) struct AverageCombiner {
    series: BTreeMap<String, AverageSeries>,
    exemplar_buckets: ExemplarBuckets,
    emit_counts: bool,
    len: usize,
    start: u64,
    end: u64,
    step: u64,
}

impl AverageCombiner {
    pub(crate) fn new(req: &QueryRangeRequest, emit_counts: bool) -> AverageCombiner {
        let len = interval_count(req.start, req.end, req.step);

        AverageCombiner {
            series: BTreeMap::new(),
            exemplar_buckets: ExemplarBuckets::new(
                len,
                req.max_exemplars,
                req.exemplars_per_bucket,
            ),
            emit_counts,
            len,
            start: req.start,
            end: req.end,
            step: req.step,
        }
    }
}

impl SeriesCombiner for AverageCombiner {
    fn combine(&mut self, input: &[SampledSeries]) {
        // count samples by the key of their mean series and timestamp
        let mut counts: HashMap<String, HashMap<i64, f64>> = HashMap::new();
        for series in input.iter().filter(|s| is_count_series(&s.labels)) {
            let mut labels = series.labels.clone();
            labels.take(LABEL_META_TYPE);

            let by_ts = counts.entry(labels.prom_string()).or_default();
            for sample in &series.samples {
                by_ts.insert(sample.timestamp_ms, sample.value);
            }
        }

        for incoming in input.iter().filter(|s| !is_count_series(&s.labels)) {
            let Some(series_counts) = counts.get(&incoming.prom_labels) else {
                tracing::debug!(series = %incoming.prom_labels, "mean series without counts");
                continue;
            };

            let len = self.len;
            let existing = self
                .series
                .entry(incoming.prom_labels.clone())
                .or_insert_with(|| AverageSeries {
                    labels: incoming.labels.clone(),
                    means: vec![WeightedMean::default(); len],
                    exemplars: Vec::new(),
                });

            for sample in &incoming.samples {
                let Some(&weight) = series_counts.get(&sample.timestamp_ms) else {
                    continue;
                };

                let j = interval_of_ms(sample.timestamp_ms, self.start, self.end, self.step);
                if let Some(mean) = j.and_then(|j| existing.means.get_mut(j)) {
                    mean.add(sample.value, weight);
                }
            }

            for exemplar in &incoming.exemplars {
                if self.exemplar_buckets.test_total() {
                    break;
                }

                let j = interval_of_ms(exemplar.timestamp_ms as i64, self.start, self.end, self.step);
                if self.exemplar_buckets.add_and_test(j) {
                    continue;
                }

                existing.exemplars.push(exemplar.clone());
            }
        }
    }

    fn results(&self) -> SeriesSet {
        let mut output = SeriesSet::new();

        for series in self.series.values() {
            if self.emit_counts {
                output.insert(TimeSeries::new(count_labels(&series.labels), weights(&series.means)));
            }

            let mut mean = TimeSeries::new(
                series.labels.clone(),
                series.means.iter().map(WeightedMean::value).collect(),
            );
            mean.exemplars = series.exemplars.clone();
            output.insert(mean);
        }

        output
    }

    fn length(&self) -> usize {
        self.series.len()
    }
}
