//! Combining sampled series from many sources.

use std::collections::BTreeMap;

use super::exemplars::ExemplarBuckets;
use super::interval::{interval_count, interval_of_ms};
use super::{
    Exemplar, Labels, QueryRangeRequest, SampledSeries, SeriesCombiner, SeriesSet, TimeSeries,
    LABEL_BUCKET,
};
use crate::models::Static;

/// How two values for the same bucket are merged.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SimpleOp {
    Sum,
    MinOverTime,
    MaxOverTime,
    SumOverTime,
}

impl SimpleOp {
    pub(crate) fn apply(self, current: f64, value: f64) -> f64 {
        match self {
            SimpleOp::Sum => current + value,
            SimpleOp::MinOverTime => {
                if current.is_nan() || value < current {
                    value
                } else {
                    current
                }
            }
            SimpleOp::MaxOverTime => {
                if current.is_nan() || value > current {
                    value
                } else {
                    current
                }
            }
            SimpleOp::SumOverTime => match (current.is_nan(), value.is_nan()) {
                (true, _) => value,
                (false, true) => current,
                (false, false) => current + value,
            },
        }
    }

    /// Buckets start out as NaN, "no value", unless zero is a meaningful
    /// starting point.
    pub(crate) fn initial(self) -> f64 {
        match self {
            SimpleOp::Sum => 0.0,
            SimpleOp::MinOverTime | SimpleOp::MaxOverTime | SimpleOp::SumOverTime => f64::NAN,
        }
    }
}

/// Merges series with the same labels bucket by bucket.
#[derive(Debug)]
pub(crate) struct SimpleCombiner {
    series: SeriesSet,
    exemplar_buckets: ExemplarBuckets,
    op: SimpleOp,
    len: usize,
    start: u64,
    end: u64,
    step: u64,
}

impl SimpleCombiner {
    pub(crate) fn new(req: &QueryRangeRequest, op: SimpleOp) -> SimpleCombiner {
        let len = interval_count(req.start, req.end, req.step);

        SimpleCombiner {
            series: SeriesSet::new(),
            exemplar_buckets: ExemplarBuckets::new(
                len,
                req.max_exemplars,
                req.exemplars_per_bucket,
            ),
            op,
            len,
            start: req.start,
            end: req.end,
            step: req.step,
        }
    }
}

impl SeriesCombiner for SimpleCombiner {
    fn combine(&mut self, input: &[SampledSeries]) {
        for incoming in input {
            if !self.series.contains_key(&incoming.prom_labels) {
                let values = vec![self.op.initial(); self.len];
                self.series.insert_with_key(
                    incoming.prom_labels.clone(),
                    TimeSeries::new(incoming.labels.clone(), values),
                );
            }

            let Some(existing) = self.series.get_mut(&incoming.prom_labels) else {
                continue;
            };

            for sample in &incoming.samples {
                let j = interval_of_ms(sample.timestamp_ms, self.start, self.end, self.step);
                if let Some(value) = j.and_then(|j| existing.values.get_mut(j)) {
                    *value = self.op.apply(*value, sample.value);
                }
            }

            for exemplar in &incoming.exemplars {
                if self.exemplar_buckets.test_total() {
                    break;
                }

                let j = interval_of_ms(exemplar.timestamp_ms as i64, self.start, self.end, self.step);
                if self.exemplar_buckets.add_and_test(j) {
                    // a later exemplar may still fit another bucket
                    continue;
                }

                existing.exemplars.push(exemplar.clone());
            }
        }
    }

    fn results(&self) -> SeriesSet {
        self.series.clone()
    }

    fn length(&self) -> usize {
        self.series.len()
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct HistogramBucket {
    /// Upper bound of the bucket, a power of two.
    pub max: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Default)]
struct Histogram {
    buckets: Vec<HistogramBucket>,
}

impl Histogram {
    fn record(&mut self, max: f64, count: usize) {
        match self.buckets.iter_mut().find(|b| b.max == max) {
            Some(bucket) => bucket.count += count,
            None => self.buckets.push(HistogramBucket { max, count }),
        }
    }

    fn sorted(&self) -> Vec<HistogramBucket> {
        let mut buckets = self.buckets.clone();
        buckets.sort_by(|a, b| a.max.total_cmp(&b.max));
        buckets
    }
}

#[derive(Debug)]
struct HistogramSeries {
    labels: Labels,
    histograms: Vec<Histogram>,
}

/// Rebuilds histograms from series labelled with `__bucket` and computes
/// quantiles from them. Only meaningful in the final mode.
#[derive(Debug)]
pub(crate) struct HistogramCombiner {
    series: BTreeMap<String, HistogramSeries>,
    quantiles: Vec<f64>,
    exemplars: Vec<Exemplar>,
    exemplar_buckets: ExemplarBuckets,
    len: usize,
    start: u64,
    end: u64,
    step: u64,
}

impl HistogramCombiner {
    pub(crate) fn new(req: &QueryRangeRequest, quantiles: Vec<f64>) -> HistogramCombiner {
        let len = interval_count(req.start, req.end, req.step);

        HistogramCombiner {
            series: BTreeMap::new(),
            quantiles,
            exemplars: Vec::new(),
            exemplar_buckets: ExemplarBuckets::new(
                len,
                req.max_exemplars,
                req.exemplars_per_bucket,
            ),
            len,
            start: req.start,
            end: req.end,
            step: req.step,
        }
    }
}

impl SeriesCombiner for HistogramCombiner {
    fn combine(&mut self, input: &[SampledSeries]) {
        for incoming in input {
            let mut labels = incoming.labels.clone();
            let bucket = match labels.take(LABEL_BUCKET) {
                Some(bucket) if !bucket.is_nil() => bucket.float(),
                _ => {
                    tracing::debug!(series = %incoming.prom_labels, "series without a bucket label");
                    continue;
                }
            };

            let key = labels.prom_string();
            let len = self.len;
            let existing = self.series.entry(key).or_insert_with(|| HistogramSeries {
                labels,
                histograms: vec![Histogram::default(); len],
            });

            for sample in &incoming.samples {
                if sample.value == 0.0 {
                    continue;
                }

                let j = interval_of_ms(sample.timestamp_ms, self.start, self.end, self.step);
                if let Some(histogram) = j.and_then(|j| existing.histograms.get_mut(j)) {
                    histogram.record(bucket, sample.value as usize);
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

                self.exemplars.push(exemplar.clone());
            }
        }
    }

    fn results(&self) -> SeriesSet {
        let mut results = SeriesSet::new();

        for series in self.series.values() {
            for &q in &self.quantiles {
                let labels = series.labels.clone().with("p", Static::Float(q));

                let values = series
                    .histograms
                    .iter()
                    .map(|h| log2_quantile(q, &h.sorted()))
                    .collect();

                let mut output = TimeSeries::new(labels, values);
                output.exemplars = self.exemplars.clone();
                results.insert(output);
            }
        }

        results
    }

    fn length(&self) -> usize {
        self.series.len() * self.quantiles.len()
    }
}

/// Rounds up to the next power of two. Values below 2 have no bucket and
/// yield -1.
pub fn log2_bucketize(v: u64) -> f64 {
    if v < 2 {
        return -1.0;
    }

    2f64.powf((v as f64).log2().ceil())
}

/// Estimates the `p` quantile from power-of-two buckets sorted by `max`.
/// Within a bucket the value is interpolated exponentially between the
/// previous bucket's bound (or half the bucket's own bound) and its own.
///
/// Returns 0 for an invalid `p` or when there are no samples.
pub fn log2_quantile(p: f64, buckets: &[HistogramBucket]) -> f64 {
    if p.is_nan() || !(0.0..=1.0).contains(&p) || buckets.is_empty() {
        return 0.0;
    }

    let total: usize = buckets.iter().map(|b| b.count).sum();
    if total == 0 {
        return 0.0;
    }

    // the lowest sample lies somewhere in the first bucket, its bound is the
    // only value that is certain
    if p == 0.0 {
        return buckets
            .iter()
            .find(|b| b.count > 0)
            .map(|b| b.max)
            .unwrap_or(0.0);
    }

    let target = ((p * total as f64).ceil() as usize).max(1);

    let mut seen = 0;
    let mut index = buckets.len() - 1;
    for (i, bucket) in buckets.iter().enumerate() {
        index = i;
        if seen + bucket.count > target {
            break;
        }

        seen += bucket.count;
        if seen == target {
            return bucket.max;
        }
    }

    let bucket = &buckets[index];
    let fraction = (target - seen) as f64 / bucket.count as f64;

    let max = bucket.max.log2();
    let min = match index {
        0 => max - 1.0,
        i => buckets[i - 1].max.log2(),
    };

    2f64.powf(min + (max - min) * fraction)
}
