use std::fmt::{Display, Error as FmtError, Formatter};

use super::average::{AverageCombiner, AverageStep};
use super::combine::{HistogramCombiner, SimpleCombiner, SimpleOp};
use super::grouping::{new_span_aggregator, DynamicLabel, SpanAggregator};
use super::step::{SpanValue, StepAggregator, StepOp};
use super::{
    AggregateMode, FirstStageElement, QueryRangeRequest, SampledSeries, SeriesCombiner, SeriesSet,
    MAX_GROUP_BYS,
};
use crate::attribute::{Attribute, Intrinsic};
use crate::error::EngineError;
use crate::models::StaticType;
use crate::span::Span;
use crate::storage::{Condition, FetchSpansRequest};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MetricsAggregateOp {
    Rate,
    CountOverTime,
    MinOverTime,
    MaxOverTime,
    SumOverTime,
    AvgOverTime,
    QuantileOverTime,
    HistogramOverTime,
}

impl MetricsAggregateOp {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricsAggregateOp::Rate => "rate",
            MetricsAggregateOp::CountOverTime => "count_over_time",
            MetricsAggregateOp::MinOverTime => "min_over_time",
            MetricsAggregateOp::MaxOverTime => "max_over_time",
            MetricsAggregateOp::SumOverTime => "sum_over_time",
            MetricsAggregateOp::AvgOverTime => "avg_over_time",
            MetricsAggregateOp::QuantileOverTime => "quantile_over_time",
            MetricsAggregateOp::HistogramOverTime => "histogram_over_time",
        }
    }

    fn needs_attribute(self) -> bool {
        !matches!(self, MetricsAggregateOp::Rate | MetricsAggregateOp::CountOverTime)
    }

    /// Histograms spend one group-by slot on the bucket label.
    fn is_bucketed(self) -> bool {
        matches!(
            self,
            MetricsAggregateOp::QuantileOverTime | MetricsAggregateOp::HistogramOverTime
        )
    }

    fn combine_op(self) -> SimpleOp {
        match self {
            MetricsAggregateOp::MinOverTime => SimpleOp::MinOverTime,
            MetricsAggregateOp::MaxOverTime => SimpleOp::MaxOverTime,
            MetricsAggregateOp::SumOverTime => SimpleOp::SumOverTime,
            _ => SimpleOp::Sum,
        }
    }
}

enum AggregateState {
    Uninitialized,
    Raw(Box<dyn SpanAggregator>),
    Combine(Box<dyn SeriesCombiner>),
}

impl std::fmt::Debug for AggregateState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            AggregateState::Uninitialized => f.write_str("Uninitialized"),
            AggregateState::Raw(aggregator) => f.debug_tuple("Raw").field(aggregator).finish(),
            AggregateState::Combine(combiner) => f.debug_tuple("Combine").field(combiner).finish(),
        }
    }
}

/// A metrics function over spans, e.g. `quantile_over_time(duration, 0.9) by (name)`.
#[derive(Debug)]
pub struct MetricsAggregate {
    pub op: MetricsAggregateOp,
    pub attribute: Option<Attribute>,
    pub quantiles: Vec<f64>,
    pub by: Vec<Attribute>,
    state: AggregateState,
}

impl MetricsAggregate {
    fn new(op: MetricsAggregateOp, attribute: Option<Attribute>) -> MetricsAggregate {
        MetricsAggregate {
            op,
            attribute,
            quantiles: Vec::new(),
            by: Vec::new(),
            state: AggregateState::Uninitialized,
        }
    }

    pub fn rate() -> MetricsAggregate {
        MetricsAggregate::new(MetricsAggregateOp::Rate, None)
    }

    pub fn count_over_time() -> MetricsAggregate {
        MetricsAggregate::new(MetricsAggregateOp::CountOverTime, None)
    }

    pub fn min_over_time(attribute: Attribute) -> MetricsAggregate {
        MetricsAggregate::new(MetricsAggregateOp::MinOverTime, Some(attribute))
    }

    pub fn max_over_time(attribute: Attribute) -> MetricsAggregate {
        MetricsAggregate::new(MetricsAggregateOp::MaxOverTime, Some(attribute))
    }

    pub fn sum_over_time(attribute: Attribute) -> MetricsAggregate {
        MetricsAggregate::new(MetricsAggregateOp::SumOverTime, Some(attribute))
    }

    pub fn avg_over_time(attribute: Attribute) -> MetricsAggregate {
        MetricsAggregate::new(MetricsAggregateOp::AvgOverTime, Some(attribute))
    }

    pub fn quantile_over_time(attribute: Attribute, quantiles: Vec<f64>) -> MetricsAggregate {
        MetricsAggregate {
            quantiles,
            ..MetricsAggregate::new(MetricsAggregateOp::QuantileOverTime, Some(attribute))
        }
    }

    pub fn histogram_over_time(attribute: Attribute) -> MetricsAggregate {
        MetricsAggregate::new(MetricsAggregateOp::HistogramOverTime, Some(attribute))
    }

    pub fn by(mut self, by: Vec<Attribute>) -> MetricsAggregate {
        self.by = by;
        self
    }

    fn required_attribute(&self) -> Result<&Attribute, EngineError> {
        self.attribute.as_ref().ok_or_else(|| {
            EngineError::Validation(format!("{}() requires an attribute", self.op.as_str()))
        })
    }

    fn init_raw(&self, req: &QueryRangeRequest) -> Result<Box<dyn SpanAggregator>, EngineError> {
        let name = self.op.as_str();
        let count = || StepAggregator::new(req, StepOp::Count { multiplier: 1.0 });

        match self.op {
            MetricsAggregateOp::Rate => {
                let multiplier = 1.0 / req.step_seconds();
                let template = StepAggregator::new(req, StepOp::Count { multiplier });
                new_span_aggregator(name, template, &self.by, None)
            }
            MetricsAggregateOp::CountOverTime => new_span_aggregator(name, count(), &self.by, None),
            MetricsAggregateOp::MinOverTime
            | MetricsAggregateOp::MaxOverTime
            | MetricsAggregateOp::SumOverTime => {
                let op = StepOp::Reduce {
                    op: self.op.combine_op(),
                    value: SpanValue::for_attribute(self.required_attribute()?),
                };
                new_span_aggregator(name, StepAggregator::new(req, op), &self.by, None)
            }
            MetricsAggregateOp::AvgOverTime => {
                let value = SpanValue::for_attribute(self.required_attribute()?);
                new_span_aggregator(name, AverageStep::new(req, value), &self.by, None)
            }
            MetricsAggregateOp::QuantileOverTime | MetricsAggregateOp::HistogramOverTime => {
                let attribute = self.required_attribute()?;
                let bucket = if attribute.intrinsic == Intrinsic::Duration {
                    DynamicLabel::DurationBucket
                } else {
                    DynamicLabel::AttributeBucket(attribute.clone())
                };
                new_span_aggregator(name, count(), &self.by, Some(bucket))
            }
        }
    }

    fn init_combiner(&self, req: &QueryRangeRequest, mode: AggregateMode) -> Box<dyn SeriesCombiner> {
        match (self.op, mode) {
            (MetricsAggregateOp::AvgOverTime, AggregateMode::Final) => {
                Box::new(AverageCombiner::new(req, false))
            }
            (MetricsAggregateOp::AvgOverTime, _) => Box::new(AverageCombiner::new(req, true)),
            (MetricsAggregateOp::QuantileOverTime, AggregateMode::Final) => {
                Box::new(HistogramCombiner::new(req, self.quantiles.clone()))
            }
            (op, _) => Box::new(SimpleCombiner::new(req, op.combine_op())),
        }
    }

    /// The value an exemplar carries: NaN for counts, the observed value
    /// otherwise.
    fn exemplar_value(&self, span: &dyn Span) -> f64 {
        match (self.op, &self.attribute) {
            (MetricsAggregateOp::Rate | MetricsAggregateOp::CountOverTime, _) | (_, None) => f64::NAN,
            (_, Some(attribute)) => SpanValue::for_attribute(attribute).of(span),
        }
    }
}

impl FirstStageElement for MetricsAggregate {
    fn extract_conditions(&self, request: &mut FetchSpansRequest) {
        for attribute in self.attribute.iter().chain(&self.by) {
            if !request.has_attribute(attribute) {
                request.append_second_pass_condition(Condition::fetch(attribute.clone()));
            }
        }
    }

    fn init(&mut self, req: &QueryRangeRequest, mode: AggregateMode) -> Result<(), EngineError> {
        self.state = match mode {
            AggregateMode::Raw => AggregateState::Raw(self.init_raw(req)?),
            mode => AggregateState::Combine(self.init_combiner(req, mode)),
        };

        Ok(())
    }

    fn observe(&mut self, span: &dyn Span) {
        if let AggregateState::Raw(aggregator) = &mut self.state {
            aggregator.observe(span);
        }
    }

    fn observe_exemplar(&mut self, span: &dyn Span) {
        let value = self.exemplar_value(span);
        if let AggregateState::Raw(aggregator) = &mut self.state {
            aggregator.observe_exemplar(span, value);
        }
    }

    fn observe_series(&mut self, series: &[SampledSeries]) {
        if let AggregateState::Combine(combiner) = &mut self.state {
            combiner.combine(series);
        }
    }

    fn result(&self) -> SeriesSet {
        match &self.state {
            AggregateState::Uninitialized => SeriesSet::new(),
            AggregateState::Raw(aggregator) => aggregator.series(),
            AggregateState::Combine(combiner) => combiner.results(),
        }
    }

    fn length(&self) -> usize {
        match &self.state {
            AggregateState::Uninitialized => 0,
            AggregateState::Raw(aggregator) => aggregator.length(),
            AggregateState::Combine(combiner) => combiner.length(),
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        let max_by = if self.op.is_bucketed() {
            MAX_GROUP_BYS - 1
        } else {
            MAX_GROUP_BYS
        };
        if self.by.len() > max_by {
            return Err(EngineError::Unsupported(format!(
                "{}() by more than {max_by} attributes",
                self.op.as_str()
            )));
        }

        if !self.op.needs_attribute() {
            return Ok(());
        }

        let attribute = self.required_attribute()?;
        let t = attribute.implied_type();
        if !(t.is_numeric() || t == StaticType::Attribute) {
            return Err(EngineError::Validation(format!(
                "{}() requires a numeric attribute, {attribute} is {t}",
                self.op.as_str()
            )));
        }

        if self.op == MetricsAggregateOp::QuantileOverTime {
            if self.quantiles.is_empty() {
                return Err(EngineError::Validation(
                    "quantile_over_time() requires at least one quantile".to_owned(),
                ));
            }

            if let Some(q) = self.quantiles.iter().find(|q| !(0.0..=1.0).contains(*q)) {
                return Err(EngineError::Validation(format!(
                    "quantile must be between 0 and 1: {q}"
                )));
            }
        }

        Ok(())
    }
}

impl Display for MetricsAggregate {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}(", self.op.as_str())?;
        if let Some(attribute) = &self.attribute {
            write!(f, "{attribute}")?;
        }
        for q in &self.quantiles {
            write!(f, ", {q}")?;
        }
        write!(f, ")")?;

        if !self.by.is_empty() {
            write!(f, " by (")?;
            for (i, attribute) in self.by.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{attribute}")?;
            }
            write!(f, ")")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::metrics::{Labels, LABEL_BUCKET, LABEL_META_TYPE, LABEL_NAME, META_TYPE_COUNT};
    use crate::models::Static;
    use crate::span::SpanRef;
    use crate::storage::transient::{MemoryTrace, NewSpan};

    const S: u64 = 1_000_000_000;

    fn spans() -> Vec<SpanRef> {
        MemoryTrace::new(&[1])
            .with_span(
                NewSpan::new(&[1], "a")
                    .start(S)
                    .duration(Duration::from_millis(100))
                    .attribute("bytes", 10_i64),
            )
            .with_span(
                NewSpan::new(&[2], "a")
                    .start(S + 1)
                    .duration(Duration::from_millis(300))
                    .attribute("bytes", 20_i64),
            )
            .with_span(
                NewSpan::new(&[3], "b")
                    .start(2 * S)
                    .duration(Duration::from_secs(3))
                    .attribute("bytes", 30_i64),
            )
            .build()
            .spans
    }

    fn run(mut aggregate: MetricsAggregate, req: &QueryRangeRequest) -> SeriesSet {
        aggregate.validate().unwrap();
        aggregate.init(req, AggregateMode::Raw).unwrap();
        for span in spans() {
            aggregate.observe(span.as_ref());
        }
        aggregate.result()
    }

    fn values(set: &SeriesSet, labels: Labels) -> Vec<f64> {
        set.get(&labels.prom_string()).unwrap().values.clone()
    }

    #[test]
    fn rate_divides_by_step() {
        let req = QueryRangeRequest::new(S, 3 * S, 2 * S);
        let result = run(MetricsAggregate::rate(), &req);

        // buckets start at 0s, 2s and 4s
        assert_eq!(values(&result, Labels::default().with(LABEL_NAME, "rate")), vec![1.0, 0.5, 0.0]);
    }

    #[test]
    fn reductions_group_by_name() {
        let req = QueryRangeRequest::new(S, 2 * S, S);
        let by = vec![Attribute::new("name")];

        let max = run(MetricsAggregate::max_over_time(Attribute::span("bytes")).by(by.clone()), &req);
        let a = Labels::default().with("name", "a");
        assert_eq!(values(&max, a.clone())[0], 20.0);

        let min = run(MetricsAggregate::min_over_time(Attribute::new("duration")).by(by), &req);
        assert!((values(&min, a)[0] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn averages_emit_counts() {
        let req = QueryRangeRequest::new(S, 2 * S, S);
        let result = run(MetricsAggregate::avg_over_time(Attribute::span("bytes")), &req);

        let mean = Labels::default().with(LABEL_NAME, "avg_over_time");
        let count = mean.clone().with(LABEL_META_TYPE, META_TYPE_COUNT);
        assert_eq!(values(&result, mean), vec![15.0, 30.0]);
        assert_eq!(values(&result, count), vec![2.0, 1.0]);
    }

    #[test]
    fn histograms_bucket_durations() {
        let req = QueryRangeRequest::new(S, 2 * S, S);
        let result = run(MetricsAggregate::histogram_over_time(Attribute::new("duration")), &req);

        assert_eq!(result.len(), 3);
        let bucket = |nanos: u64| {
            Labels::default().with(LABEL_BUCKET, Static::Float(nanos.next_power_of_two() as f64 / 1e9))
        };
        assert_eq!(values(&result, bucket(100_000_000)), vec![1.0, 0.0]);
        assert_eq!(values(&result, bucket(3_000_000_000)), vec![0.0, 1.0]);
    }

    #[test]
    fn quantiles_need_the_final_mode() {
        let req = QueryRangeRequest::new(S, 2 * S, S);
        let mut raw = MetricsAggregate::quantile_over_time(Attribute::new("duration"), vec![0.5]);
        raw.init(&req, AggregateMode::Raw).unwrap();
        for span in spans() {
            raw.observe(span.as_ref());
        }

        let sampled = raw.result().to_sampled(&req);

        let mut sum = MetricsAggregate::quantile_over_time(Attribute::new("duration"), vec![0.5]);
        sum.init(&req, AggregateMode::Sum).unwrap();
        sum.observe_series(&sampled);
        let partial = sum.result();
        // buckets pass through the sum mode untouched
        assert_eq!(partial.len(), 3);

        let mut last = MetricsAggregate::quantile_over_time(Attribute::new("duration"), vec![0.5]);
        last.init(&req, AggregateMode::Final).unwrap();
        last.observe_series(&partial.to_sampled(&req));

        let result = last.result();
        assert_eq!(result.len(), 1);
        let p50 = Labels::default().with("p", 0.5);
        // two spans in the first second, the lower one is at most 2^-3s
        assert_eq!(values(&result, p50)[0], 0.134217728);
    }

    #[test]
    fn extracts_attributes_to_the_second_pass() {
        let aggregate = MetricsAggregate::sum_over_time(Attribute::span("bytes"))
            .by(vec![Attribute::resource("service.name"), Attribute::span("bytes")]);

        let mut request = FetchSpansRequest::new(0, 0);
        aggregate.extract_conditions(&mut request);
        assert_eq!(
            request.second_pass_conditions,
            vec![
                Condition::fetch(Attribute::span("bytes")),
                Condition::fetch(Attribute::resource("service.name")),
            ]
        );
    }

    #[test]
    fn validation() {
        let by: Vec<Attribute> = (0..5).map(|i| Attribute::span(&format!("a{i}"))).collect();
        assert!(MetricsAggregate::rate().by(by.clone()).validate().is_ok());
        assert!(matches!(
            MetricsAggregate::histogram_over_time(Attribute::new("duration"))
                .by(by)
                .validate(),
            Err(EngineError::Unsupported(_))
        ));

        assert!(matches!(
            MetricsAggregate::quantile_over_time(Attribute::new("duration"), vec![1.5]).validate(),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            MetricsAggregate::sum_over_time(Attribute::new("name")).validate(),
            Err(EngineError::Validation(_))
        ));
        assert!(MetricsAggregate::sum_over_time(Attribute::span("x")).validate().is_ok());
    }

    #[test]
    fn display() {
        let aggregate =
            MetricsAggregate::quantile_over_time(Attribute::new("duration"), vec![0.5, 0.99])
                .by(vec![Attribute::resource("service.name")]);
        assert_eq!(
            aggregate.to_string(),
            "quantile_over_time(duration, 0.5, 0.99) by (resource.service.name)"
        );
    }
}
