use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::fmt::{Display, Error as FmtError, Formatter};

use super::interval::interval_count;
use super::{QueryRangeRequest, SecondStageElement, SeriesSet, TimeSeries};
use crate::error::EngineError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SecondStageOp {
    TopK,
    BottomK,
}

impl SecondStageOp {
    pub fn as_str(self) -> &'static str {
        match self {
            SecondStageOp::TopK => "topk",
            SecondStageOp::BottomK => "bottomk",
        }
    }
}

/// A candidate for one bucket. Greater is better; equal values prefer the
/// smaller key so the choice does not depend on iteration order.
#[derive(Debug)]
struct Ranked<'a> {
    score: f64,
    key: &'a str,
}

impl Ord for Ranked<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.key.cmp(self.key))
    }
}

impl PartialOrd for Ranked<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked<'_> {}

/// `topk(n)` / `bottomk(n)`: keeps, per bucket, the `n` series with the
/// largest or smallest values. Other buckets of a kept series are NaN.
#[derive(Debug, Clone)]
pub struct TopKBottomK {
    pub op: SecondStageOp,
    pub limit: usize,
    buckets: usize,
}

impl TopKBottomK {
    pub fn topk(limit: usize) -> TopKBottomK {
        TopKBottomK {
            op: SecondStageOp::TopK,
            limit,
            buckets: 0,
        }
    }

    pub fn bottomk(limit: usize) -> TopKBottomK {
        TopKBottomK {
            op: SecondStageOp::BottomK,
            limit,
            buckets: 0,
        }
    }

    fn score(&self, value: f64) -> f64 {
        match self.op {
            SecondStageOp::TopK => value,
            SecondStageOp::BottomK => -value,
        }
    }

    /// The keys of the selected series at bucket `i`.
    fn select<'a>(&self, input: &'a SeriesSet, i: usize) -> Vec<&'a str> {
        // the weakest candidate sits on top so it can be evicted
        let mut heap = BinaryHeap::with_capacity(self.limit + 1);

        for (key, series) in input {
            let Some(&value) = series.values.get(i) else {
                continue;
            };
            if value.is_nan() {
                continue;
            }

            heap.push(Reverse(Ranked {
                score: self.score(value),
                key: key.as_str(),
            }));
            if heap.len() > self.limit {
                heap.pop();
            }
        }

        heap.into_iter().map(|Reverse(ranked)| ranked.key).collect()
    }
}

impl SecondStageElement for TopKBottomK {
    fn init(&mut self, req: &QueryRangeRequest) {
        self.buckets = interval_count(req.start, req.end, req.step);
    }

    fn process(&self, input: SeriesSet) -> SeriesSet {
        let buckets = input
            .values()
            .map(|s| s.values.len())
            .max()
            .unwrap_or(0)
            .max(self.buckets);

        let mut selected: BTreeMap<&str, TimeSeries> = BTreeMap::new();
        for i in 0..buckets {
            for key in self.select(&input, i) {
                let Some(series) = input.get(key) else {
                    continue;
                };

                let output = selected.entry(key).or_insert_with(|| TimeSeries {
                    labels: series.labels.clone(),
                    values: vec![f64::NAN; series.values.len()],
                    exemplars: series.exemplars.clone(),
                });
                output.values[i] = series.values[i];
            }
        }

        let mut output = SeriesSet::new();
        for (key, series) in selected {
            output.insert_with_key(key.to_owned(), series);
        }

        tracing::debug!(
            op = self.op.as_str(),
            limit = self.limit,
            series = output.len(),
            "selected series"
        );
        output
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.limit == 0 {
            return Err(EngineError::Validation(format!(
                "{}() limit must be greater than 0",
                self.op.as_str()
            )));
        }

        Ok(())
    }
}

impl Display for TopKBottomK {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}({})", self.op.as_str(), self.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Labels;

    const S: u64 = 1_000_000_000;

    fn input(values: &[[f64; 2]]) -> SeriesSet {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| TimeSeries::new(Labels::default().with("i", i as i64), v.to_vec()))
            .collect()
    }

    fn key(i: i64) -> String {
        Labels::default().with("i", i).prom_string()
    }

    #[test]
    fn topk_per_bucket() {
        let req = QueryRangeRequest::new(S, 2 * S, S);
        let mut topk = TopKBottomK::topk(2);
        topk.validate().unwrap();
        topk.init(&req);

        let output = topk.process(input(&[
            [1.0, 10.0],
            [5.0, f64::NAN],
            [3.0, 8.0],
            [9.0, 1.0],
            [2.0, 2.0],
        ]));

        // 9 and 5 win the first bucket, 10 and 8 the second
        assert_eq!(output.len(), 4);
        assert_eq!(output.get(&key(3)).unwrap().values[0], 9.0);
        assert!(output.get(&key(3)).unwrap().values[1].is_nan());
        assert_eq!(output.get(&key(1)).unwrap().values[0], 5.0);
        assert!(output.get(&key(0)).unwrap().values[0].is_nan());
        assert_eq!(output.get(&key(0)).unwrap().values[1], 10.0);
        assert_eq!(output.get(&key(2)).unwrap().values[1], 8.0);
        assert!(output.get(&key(4)).is_none());
    }

    #[test]
    fn bottomk_breaks_ties_by_key() {
        let mut bottomk = TopKBottomK::bottomk(1);
        bottomk.init(&QueryRangeRequest::new(S, S, S));

        let output = bottomk.process(input(&[[4.0, 4.0], [2.0, 2.0], [2.0, 2.0]]));
        assert_eq!(output.len(), 1);
        assert!(output.contains_key(&key(1)));
    }

    #[test]
    fn limit_must_be_positive() {
        assert!(matches!(TopKBottomK::topk(0).validate(), Err(EngineError::Validation(_))));
        assert_eq!(TopKBottomK::bottomk(3).to_string(), "bottomk(3)");
    }
}
