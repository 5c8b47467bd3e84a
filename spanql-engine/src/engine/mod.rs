//! Entry points of the engine: compiling queries and running them against a
//! [`SpansetFetcher`](crate::storage::SpansetFetcher).
//!
//! Search queries are executed directly with [`Engine::execute_search`].
//! Metrics queries are compiled into evaluators instead, because they run in
//! several places: a [`MetricsEvaluator`] observes raw spans from any number
//! of fetchers and a [`MetricsFrontendEvaluator`] combines its results.

use tracing::instrument;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::filter::RootExpr;
use crate::storage::FetchSpansRequest;

mod metrics;
mod search;

pub use metrics::{optimize, MetricsEvaluator, MetricsFrontendEvaluator};
pub use search::{
    MetadataCombiner, SearchRequest, SearchResponse, SpanMetadata, SpansetMetadata,
    TraceSearchMetadata, ATTRIBUTE_MATCHED,
};

/// A validated and folded query with the conditions it pushes down.
#[derive(Debug)]
pub struct CompiledQuery {
    pub root: RootExpr,
    pub request: FetchSpansRequest,
}

#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Engine {
        Engine { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates the query, folds its constants and extracts the conditions
    /// for storage. The request has no time range yet.
    #[instrument(level = tracing::Level::TRACE, skip_all)]
    pub fn compile(&self, mut root: RootExpr) -> Result<CompiledQuery, EngineError> {
        root.validate()?;
        root.fold(self.config.branch_samples)?;

        let mut request = FetchSpansRequest::new(0, 0);
        root.extract_conditions(&mut request);

        tracing::debug!(query = %root, ?request, "compiled query");

        Ok(CompiledQuery { root, request })
    }
}
