//! The "engine" crate is the execution core of a span query language. It
//! evaluates query pipelines over spansets, pushes conditions down to the
//! storage layer and aggregates spans into time series. It does not parse
//! queries and does not store spans; both are left to the embedding process
//! through [`filter::RootExpr`] and [`storage::SpansetFetcher`].

pub mod attribute;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod hints;
pub mod metrics;
pub mod models;
pub mod span;
pub mod storage;

pub use attribute::{Attribute, AttributeScope, Intrinsic};
pub use config::EngineConfig;
pub use engine::{
    CompiledQuery, Engine, MetricsEvaluator, MetricsFrontendEvaluator, SearchRequest,
    SearchResponse,
};
pub use error::{EngineError, ParseError};
pub use metrics::{AggregateMode, QueryRangeRequest, SeriesSet};
pub use models::{Kind, Static, StaticType, Status};
pub use span::{Span, SpanRef, Spanset};

#[cfg(test)]
mod tests {
    use std::ops::Range;
    use std::time::Duration;

    use futures::executor::block_on;

    use super::*;
    use crate::filter::{FieldExpression, Operator, Pipeline, PipelineElement, RootExpr, SpansetFilter};
    use crate::metrics::interval::interval_of_ms;
    use crate::metrics::{Labels, MetricsAggregate, TopKBottomK, LABEL_NAME};
    use crate::storage::transient::{MemoryTrace, NewSpan, TransientFetcher};

    const S: u64 = 1_000_000_000;

    fn trace(i: u8) -> MemoryTrace {
        let start = S + u64::from(i % 5) * S + u64::from(i);
        let service = if i % 2 == 0 { "api" } else { "db" };

        MemoryTrace::new(&[i])
            .with_span(
                NewSpan::new(&[i, 1], "request")
                    .start(start)
                    .duration(Duration::from_millis(u64::from(i) + 1))
                    .attribute("bytes", i64::from(i) * 10)
                    .resource_attribute("service.name", service),
            )
            .with_span(
                NewSpan::new(&[i, 2], "query")
                    .parent(&[i, 1])
                    .start(start + 1)
                    .duration(Duration::from_millis(1))
                    .attribute("bytes", i64::from(i) + 3)
                    .resource_attribute("service.name", service),
            )
    }

    fn shard(ids: Range<u8>) -> TransientFetcher {
        TransientFetcher::new(ids.map(trace))
    }

    fn raw(engine: &Engine, root: RootExpr, req: &QueryRangeRequest, fetcher: &TransientFetcher) -> SeriesSet {
        let evaluator = engine.compile_metrics_query_range(root, req).unwrap();
        block_on(evaluator.do_metrics(fetcher, 0, 0, 0)).unwrap();
        evaluator.results()
    }

    fn assert_same_values(lhs: &SeriesSet, rhs: &SeriesSet) {
        assert_eq!(lhs.keys().collect::<Vec<_>>(), rhs.keys().collect::<Vec<_>>());

        for (key, series) in lhs {
            let other = rhs.get(key).unwrap();
            assert_eq!(series.values.len(), other.values.len(), "{key}");

            for (a, b) in series.values.iter().zip(&other.values) {
                assert!(
                    (a.is_nan() && b.is_nan()) || (a - b).abs() <= 1e-9 * a.abs().max(1.0),
                    "{key}: {:?} != {:?}",
                    series.values,
                    other.values
                );
            }
        }
    }

    #[test]
    fn scatter_gather_matches_a_single_pass() {
        let engine = Engine::default();
        let req = QueryRangeRequest::new(S, 6 * S, S);

        let by = || vec![Attribute::resource("service.name")];
        let queries: Vec<fn() -> MetricsAggregate> = vec![
            MetricsAggregate::count_over_time,
            MetricsAggregate::rate,
            || MetricsAggregate::sum_over_time(Attribute::span("bytes")),
            || MetricsAggregate::min_over_time(Attribute::span("bytes")),
            || MetricsAggregate::max_over_time(Attribute::new("duration")),
        ];

        for query in queries {
            let root = || RootExpr::new(Pipeline::default()).with_metrics(query().by(by()));

            let sum = engine
                .compile_metrics_query_range_non_raw(root(), &req, AggregateMode::Sum)
                .unwrap();
            for ids in [0..20, 20..40] {
                sum.observe_series(&raw(&engine, root(), &req, &shard(ids)).to_sampled(&req));
            }

            let last = engine
                .compile_metrics_query_range_non_raw(root(), &req, AggregateMode::Final)
                .unwrap();
            last.observe_series(&sum.results().to_sampled(&req));

            let direct = raw(&engine, root(), &req, &shard(0..40));
            assert_eq!(direct.len(), 2);
            assert_same_values(&last.results(), &direct);
        }
    }

    #[test]
    fn averages_reconcile_across_shards() {
        let engine = Engine::default();
        let req = QueryRangeRequest::new(S, 6 * S, S);
        let root = || {
            RootExpr::new(Pipeline::default())
                .with_metrics(MetricsAggregate::avg_over_time(Attribute::span("bytes")))
        };

        let sum = engine
            .compile_metrics_query_range_non_raw(root(), &req, AggregateMode::Sum)
            .unwrap();
        for ids in [0..7, 7..30, 30..40] {
            sum.observe_series(&raw(&engine, root(), &req, &shard(ids)).to_sampled(&req));
        }

        let last = engine
            .compile_metrics_query_range_non_raw(root(), &req, AggregateMode::Final)
            .unwrap();
        last.observe_series(&sum.results().to_sampled(&req));

        let results = last.results();
        // the count series only travels between shards
        assert_eq!(results.len(), 1);

        let mean = Labels::default().with(LABEL_NAME, "avg_over_time").prom_string();
        let values = &results.get(&mean).unwrap().values;
        assert_eq!(values.len(), 6);

        // the last bucket is empty
        for (bucket, value) in values.iter().take(5).enumerate() {
            let bytes: Vec<f64> = (0..40_u8)
                .filter(|i| usize::from(i % 5) == bucket)
                .flat_map(|i| [f64::from(i) * 10.0, f64::from(i) + 3.0])
                .collect();
            let expected = bytes.iter().sum::<f64>() / bytes.len() as f64;

            assert!((value - expected).abs() <= 1e-9 * expected, "bucket {bucket}: {value} != {expected}");
        }
    }

    #[test]
    fn exemplars_stay_bounded() {
        let engine = Engine::default();
        let req = QueryRangeRequest::new(S, 200 * S, S);

        let traces = (0..1000_u32).map(|i| {
            let id = i.to_be_bytes();
            MemoryTrace::new(&id).with_span(
                NewSpan::new(&id, "request")
                    .start(S + u64::from(i % 200) * S)
                    .duration(Duration::from_millis(u64::from(i))),
            )
        });

        let root = RootExpr::new(Pipeline::default())
            .with_metrics(MetricsAggregate::count_over_time().by(vec![Attribute::new("name")]));
        let results = raw(&engine, root, &req, &TransientFetcher::new(traces));

        let config = EngineConfig::default();
        let mut total = 0;
        for series in results.values() {
            let mut per_bucket = vec![0; req.intervals()];
            for exemplar in &series.exemplars {
                let i = interval_of_ms(exemplar.timestamp_ms as i64, req.start, req.end, req.step).unwrap();
                per_bucket[i] += 1;
            }

            assert!(per_bucket.iter().all(|&n| n <= config.exemplars_per_bucket));
            total += series.exemplars.len();
        }

        assert!(total > 0);
        assert!(total <= config.max_exemplars);
    }

    #[test]
    fn quantiles_through_every_mode() {
        let engine = Engine::default();
        let req = QueryRangeRequest::new(S, 2 * S, S);

        let durations = [1_u64, 1, 1, 1_000];
        let traces = durations.iter().enumerate().map(|(i, &ms)| {
            let id = [i as u8];
            MemoryTrace::new(&id).with_span(
                NewSpan::new(&id, "request")
                    .start(S + i as u64)
                    .duration(Duration::from_millis(ms)),
            )
        });

        let root = || {
            RootExpr::new(Pipeline::default())
                .with_metrics(MetricsAggregate::quantile_over_time(Attribute::new("duration"), vec![0.0, 1.0]))
        };
        let partial = raw(&engine, root(), &req, &TransientFetcher::new(traces));

        let last = engine
            .compile_metrics_query_range_non_raw(root(), &req, AggregateMode::Final)
            .unwrap();
        last.observe_series(&partial.to_sampled(&req));
        let results = last.results();

        let quantile = |p: f64| results.get(&Labels::default().with("p", p).prom_string()).unwrap().values[0];

        // the bounds of the smallest and largest non-empty buckets
        let min = (1_u64 << 20) as f64 / 1e9;
        let max = (1_u64 << 30) as f64 / 1e9;
        assert!((quantile(0.0) - min).abs() < 1e-12);
        assert!((quantile(1.0) - max).abs() < 1e-12);
    }

    #[test]
    fn topk_only_applies_to_the_final_mode() {
        let engine = Engine::default();
        let req = QueryRangeRequest::new(S, 5 * S, S);
        let root = || {
            RootExpr::new(Pipeline::default())
                .with_metrics(MetricsAggregate::count_over_time().by(vec![Attribute::new("name")]))
                .with_second_stage(TopKBottomK::topk(1))
        };

        let partial = raw(&engine, root(), &req, &shard(0..10));
        let sampled = partial.to_sampled(&req);

        let sum = engine
            .compile_metrics_query_range_non_raw(root(), &req, AggregateMode::Sum)
            .unwrap();
        sum.observe_series(&sampled);
        assert_eq!(sum.results().len(), 2);

        let last = engine
            .compile_metrics_query_range_non_raw(root(), &req, AggregateMode::Final)
            .unwrap();
        last.observe_series(&sampled);

        // both series count the same spans, the smaller key wins every bucket
        let results = last.results();
        assert_eq!(results.len(), 1);
        assert!(results.contains_key(&Labels::default().with("name", "query").prom_string()));
    }

    #[test]
    fn search_returns_matching_traces() {
        let engine = Engine::default();

        let traces = (0..6_u8).map(|i| {
            let status = if i % 3 == 0 { Status::Error } else { Status::Ok };
            MemoryTrace::new(&[i])
                .with_span(
                    NewSpan::new(&[i, 1], "request")
                        .start(S + u64::from(i))
                        .duration(Duration::from_millis(5))
                        .resource_attribute("service.name", "api"),
                )
                .with_span(
                    NewSpan::new(&[i, 2], "query")
                        .parent(&[i, 1])
                        .start(S + u64::from(i) + 1)
                        .duration(Duration::from_millis(2))
                        .status(status)
                        .attribute("db.system", "postgres"),
                )
        });
        let fetcher = TransientFetcher::new(traces);

        let root = RootExpr::new(Pipeline::new(vec![PipelineElement::Filter(SpansetFilter::new(
            FieldExpression::binary(
                Operator::Equal,
                FieldExpression::attribute(Attribute::new("status")),
                FieldExpression::value(Status::Error),
            ),
        ))]));
        let search = SearchRequest {
            start: 0,
            end: 0,
            limit: 0,
            spans_per_spanset: 0,
        };

        let response = block_on(engine.execute_search(root, &search, &fetcher)).unwrap();

        assert_eq!(response.traces.len(), 2);
        assert_eq!(fetcher.released(), 2);
        assert!(response.inspected_bytes > 0);

        // newest first
        assert_eq!(response.traces[0].trace_id, "03");
        assert_eq!(response.traces[1].trace_id, "00");
        for trace in &response.traces {
            assert_eq!(trace.root_service_name, "api");
            assert_eq!(trace.root_trace_name, "request");
            assert_eq!(trace.span_sets.len(), 1);
            assert_eq!(trace.span_sets[0].matched, 1);
            assert_eq!(trace.span_sets[0].spans[0].name, "query");
        }
    }

    #[test]
    fn empty_queries_do_not_fetch() {
        let engine = Engine::default();
        let fetcher = TransientFetcher::new([trace(1)]);
        let search = SearchRequest {
            start: 0,
            end: 0,
            limit: 10,
            spans_per_spanset: 3,
        };

        let response = block_on(engine.execute_search(RootExpr::default(), &search, &fetcher)).unwrap();
        assert!(response.traces.is_empty());
        assert!(fetcher.requests().is_empty());
    }
}
