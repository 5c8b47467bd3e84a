use anyhow::{Context, Error as AnyError};
use serde::Deserialize;

/// Knobs that are fixed for the lifetime of an [`Engine`](crate::Engine).
/// Every field has a default so partial JSON documents are accepted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on exemplars per metrics query. Zero disables them.
    pub max_exemplars: usize,
    pub exemplars_per_bucket: usize,
    /// Fraction of a data source's time range that must overlap the query
    /// before the trace-level time filter is no longer worth pushing down.
    pub time_overlap_cutoff: f64,
    pub allow_unsafe_query_hints: bool,
    pub compare_top_n: usize,
    /// Evaluations sampled before a boolean operator settles its branch order.
    pub branch_samples: usize,
    /// Stop a metrics fetch once this many series exist. Zero is unlimited.
    pub max_series: usize,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            max_exemplars: 100,
            exemplars_per_bucket: 2,
            time_overlap_cutoff: 0.2,
            allow_unsafe_query_hints: false,
            compare_top_n: 10,
            branch_samples: 1000,
            max_series: 0,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<EngineConfig, AnyError> {
        serde_json::from_str(json).context("failed to parse engine config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config = EngineConfig::from_json(r#"{ "max_exemplars": 5 }"#).unwrap();

        assert_eq!(config.max_exemplars, 5);
        assert_eq!(config.exemplars_per_bucket, 2);
        assert_eq!(config.time_overlap_cutoff, 0.2);
        assert_eq!(config.branch_samples, 1000);
    }

    #[test]
    fn invalid_config_is_an_error() {
        let err = EngineConfig::from_json(r#"{ "max_exemplars": "many" }"#).unwrap_err();
        assert!(err.to_string().contains("failed to parse engine config"));
    }
}
