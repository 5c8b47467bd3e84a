use super::interval::{interval_count, interval_of_ms};
use super::{Exemplar, QueryRangeRequest};
use crate::span::Span;

/// Bounds the exemplars kept for a series set, both overall and per time
/// bucket.
#[derive(Debug, Clone)]
pub(crate) struct ExemplarBuckets {
    counts: Vec<usize>,
    total: usize,
    max_total: usize,
    max_per_bucket: usize,
}

impl ExemplarBuckets {
    pub(crate) fn new(buckets: usize, max_total: usize, max_per_bucket: usize) -> ExemplarBuckets {
        ExemplarBuckets {
            counts: vec![0; buckets],
            total: 0,
            max_total,
            max_per_bucket,
        }
    }

    /// Whether the overall limit has been reached.
    pub(crate) fn test_total(&self) -> bool {
        self.total >= self.max_total
    }

    /// Counts an exemplar for the bucket. Returns `true` if it must be
    /// rejected instead: the bucket is out of range or either limit is hit.
    pub(crate) fn add_and_test(&mut self, bucket: Option<usize>) -> bool {
        let Some(count) = bucket.and_then(|b| self.counts.get_mut(b)) else {
            return true;
        };

        if self.total >= self.max_total || *count >= self.max_per_bucket {
            return true;
        }

        *count += 1;
        self.total += 1;
        false
    }

    #[cfg(test)]
    fn total(&self) -> usize {
        self.total
    }
}

/// The exemplars of one raw series.
#[derive(Debug, Clone)]
pub(crate) struct SeriesExemplars {
    start: u64,
    end: u64,
    step: u64,
    buckets: ExemplarBuckets,
    exemplars: Vec<Exemplar>,
}

impl SeriesExemplars {
    pub(crate) fn new(req: &QueryRangeRequest) -> SeriesExemplars {
        SeriesExemplars {
            start: req.start,
            end: req.end,
            step: req.step,
            buckets: ExemplarBuckets::new(
                interval_count(req.start, req.end, req.step),
                req.max_exemplars,
                req.exemplars_per_bucket,
            ),
            exemplars: Vec::new(),
        }
    }

    fn admit(&mut self, timestamp_ms: u64) -> bool {
        if self.buckets.test_total() {
            return false;
        }

        let i = interval_of_ms(timestamp_ms as i64, self.start, self.end, self.step);
        !self.buckets.add_and_test(i)
    }

    pub(crate) fn observe(&mut self, span: &dyn Span, value: f64) {
        if self.admit(span.start_time_unix_nanos() / 1_000_000) {
            self.exemplars.push(Exemplar::from_span(span, value));
        }
    }

    /// Keeps an exemplar that was already sampled elsewhere, within the same
    /// limits.
    pub(crate) fn add(&mut self, exemplar: &Exemplar) {
        if self.admit(exemplar.timestamp_ms) {
            self.exemplars.push(exemplar.clone());
        }
    }

    pub(crate) fn exemplars(&self) -> &[Exemplar] {
        &self.exemplars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_per_bucket_and_in_total() {
        let mut buckets = ExemplarBuckets::new(3, 4, 2);

        assert!(!buckets.add_and_test(Some(0)));
        assert!(!buckets.add_and_test(Some(0)));
        assert!(buckets.add_and_test(Some(0)));

        assert!(!buckets.add_and_test(Some(1)));
        assert!(!buckets.test_total());
        assert!(!buckets.add_and_test(Some(2)));
        assert!(buckets.test_total());
        assert!(buckets.add_and_test(Some(2)));

        assert_eq!(buckets.total(), 4);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let mut buckets = ExemplarBuckets::new(2, 10, 2);
        assert!(buckets.add_and_test(None));
        assert!(buckets.add_and_test(Some(2)));
        assert_eq!(buckets.total(), 0);
    }
}
