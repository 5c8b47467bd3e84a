//! Per-series accumulation over the time buckets of a request.

use super::combine::SimpleOp;
use super::exemplars::SeriesExemplars;
use super::grouping::RangeAggregator;
use super::interval::{interval_count, interval_of};
use super::{floatize, Labels, QueryRangeRequest, SeriesSet, TimeSeries};
use crate::attribute::{Attribute, Intrinsic};
use crate::models::Static;
use crate::span::Span;

/// The number a span contributes to an aggregation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SpanValue {
    /// The span's own duration, in seconds.
    Duration,
    Attribute(Attribute),
}

impl SpanValue {
    pub(crate) fn for_attribute(attribute: &Attribute) -> SpanValue {
        if attribute.intrinsic == Intrinsic::Duration {
            SpanValue::Duration
        } else {
            SpanValue::Attribute(attribute.clone())
        }
    }

    /// NaN if the span has no numeric value for it. Durations are always in
    /// seconds.
    pub(crate) fn of(&self, span: &dyn Span) -> f64 {
        match self {
            SpanValue::Duration => span.duration_nanos() as f64 / 1e9,
            SpanValue::Attribute(attribute) => match span.attribute_for(attribute) {
                Some(Static::Duration(d)) => d.as_secs_f64(),
                value => floatize(value),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepOp {
    /// Counts spans and scales the count, by `1 / step` for a rate.
    Count { multiplier: f64 },
    Reduce { op: SimpleOp, value: SpanValue },
}

/// One value per time bucket plus the exemplars of the series.
#[derive(Debug, Clone)]
pub(crate) struct StepAggregator {
    op: StepOp,
    start: u64,
    end: u64,
    step: u64,
    values: Vec<f64>,
    exemplars: SeriesExemplars,
}

impl StepAggregator {
    pub(crate) fn new(req: &QueryRangeRequest, op: StepOp) -> StepAggregator {
        let intervals = interval_count(req.start, req.end, req.step);
        let initial = match &op {
            StepOp::Count { .. } => 0.0,
            StepOp::Reduce { .. } => f64::NAN,
        };

        StepAggregator {
            op,
            start: req.start,
            end: req.end,
            step: req.step,
            values: vec![initial; intervals],
            exemplars: SeriesExemplars::new(req),
        }
    }

    pub(crate) fn samples(&self) -> Vec<f64> {
        match self.op {
            StepOp::Count { multiplier } => self.values.iter().map(|v| v * multiplier).collect(),
            StepOp::Reduce { .. } => self.values.clone(),
        }
    }
}

impl RangeAggregator for StepAggregator {
    fn observe(&mut self, span: &dyn Span) {
        let i = interval_of(span.start_time_unix_nanos(), self.start, self.end, self.step);
        let Some(current) = i.and_then(|i| self.values.get_mut(i)) else {
            return;
        };

        *current = match &self.op {
            StepOp::Count { .. } => *current + 1.0,
            StepOp::Reduce { op, value } => op.apply(*current, value.of(span)),
        };
    }

    fn observe_exemplar(&mut self, span: &dyn Span, value: f64) {
        self.exemplars.observe(span, value);
    }

    fn write_series(&self, labels: Labels, output: &mut SeriesSet) {
        let mut series = TimeSeries::new(labels, self.samples());
        series.exemplars = self.exemplars.exemplars().to_vec();
        output.insert(series);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::transient::{MemoryTrace, NewSpan};

    const S: u64 = 1_000_000_000;

    fn spans() -> Vec<crate::span::SpanRef> {
        MemoryTrace::new(&[1])
            .with_span(
                NewSpan::new(&[1], "a")
                    .start(S)
                    .duration(Duration::from_millis(500))
                    .attribute("size", 10_i64),
            )
            .with_span(
                NewSpan::new(&[2], "b")
                    .start(S + 10)
                    .duration(Duration::from_secs(2))
                    .attribute("size", 4_i64),
            )
            .with_span(NewSpan::new(&[3], "c").start(3 * S).attribute("size", "big"))
            .build()
            .spans
    }

    #[test]
    fn counts_and_rates() {
        let req = QueryRangeRequest::new(S, 3 * S, S);

        let mut count = StepAggregator::new(&req, StepOp::Count { multiplier: 1.0 });
        let mut rate = StepAggregator::new(&req, StepOp::Count { multiplier: 0.5 });
        for span in spans() {
            count.observe(span.as_ref());
            rate.observe(span.as_ref());
        }

        assert_eq!(count.samples(), vec![2.0, 0.0, 1.0]);
        assert_eq!(rate.samples(), vec![1.0, 0.0, 0.5]);
    }

    #[test]
    fn reductions() {
        let req = QueryRangeRequest::new(S, 3 * S, S);

        let mut max = StepAggregator::new(
            &req,
            StepOp::Reduce {
                op: SimpleOp::MaxOverTime,
                value: SpanValue::for_attribute(&Attribute::new("duration")),
            },
        );
        let mut sum = StepAggregator::new(
            &req,
            StepOp::Reduce {
                op: SimpleOp::SumOverTime,
                value: SpanValue::Attribute(Attribute::span("size")),
            },
        );
        for span in spans() {
            max.observe(span.as_ref());
            sum.observe(span.as_ref());
        }

        let samples = max.samples();
        assert_eq!(samples[0], 2.0);
        assert!(samples[1].is_nan());
        assert_eq!(samples[2], 0.0);

        let samples = sum.samples();
        assert_eq!(samples[0], 14.0);
        // non numeric values are ignored
        assert!(samples[2].is_nan());
    }

    #[test]
    fn exemplars_carry_span_attributes() {
        let req = QueryRangeRequest::new(S, 3 * S, S).with_exemplars(10, 1);
        let mut count = StepAggregator::new(&req, StepOp::Count { multiplier: 1.0 });

        for span in spans() {
            count.observe_exemplar(span.as_ref(), f64::NAN);
        }

        // the first two spans share a bucket
        let exemplars = count.exemplars.exemplars();
        assert_eq!(exemplars.len(), 2);
        assert_eq!(exemplars[0].timestamp_ms, 1_000);
        assert!(matches!(exemplars[0].labels.get("span.size"), Some(Static::Int(10))));
        assert!(matches!(exemplars[0].labels.get("name"), Some(Static::String(s)) if s == "a"));
    }
}
