//! Pipeline configuration.

use crate::errors::{StagepipeError, StagepipeResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Options applied when a [`Pipeline`](crate::Pipeline) is constructed.
///
/// Every field has a default, so a config file only needs the fields it overrides:
///
/// ```json
/// { "pool_size": 8, "thread_name": "ingest" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Desired shared pool size before dedicated workers are subtracted.
    /// `None` sizes the pool from `total_parallelism`.
    pub pool_size: Option<usize>,
    /// Parallelism available to the whole pipeline. `None` uses the number of CPUs.
    pub total_parallelism: Option<usize>,
    /// Prefix for every thread the pipeline starts.
    pub thread_name: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            pool_size: None,
            total_parallelism: None,
            thread_name: "stagepipe".to_string(),
        }
    }
}

impl PipelineOptions {
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = Some(pool_size);
        self
    }

    pub fn from_json(json: &str) -> StagepipeResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| StagepipeError::Config(format!("invalid pipeline options: {}", e)))
    }

    pub fn from_file(path: &Path) -> StagepipeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content).map_err(|e| match e {
            StagepipeError::Config(msg) => {
                StagepipeError::Config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Reject values that cannot describe a runnable pipeline.
    pub fn sanitize(&self) -> StagepipeResult<()> {
        if self.pool_size == Some(0) {
            return Err(StagepipeError::Config("pool_size must be at least 1".into()));
        }
        if self.total_parallelism == Some(0) {
            return Err(StagepipeError::Config(
                "total_parallelism must be at least 1".into(),
            ));
        }
        if self.thread_name.trim().is_empty() {
            return Err(StagepipeError::Config("thread_name must not be empty".into()));
        }
        Ok(())
    }

    pub fn total_parallelism(&self) -> usize {
        self.total_parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Shared pool size once `dedicated_workers` threads are reserved for
    /// stateful stages.
    ///
    /// - explicit `pool_size`: `max(1, pool_size - dedicated_workers)`
    /// - otherwise: `max(1, total_parallelism - dedicated_workers - 1)`, leaving
    ///   one thread for the consumer
    pub fn shared_pool_size(&self, dedicated_workers: usize) -> usize {
        match self.pool_size {
            Some(size) => size.saturating_sub(dedicated_workers).max(1),
            None => self
                .total_parallelism()
                .saturating_sub(dedicated_workers + 1)
                .max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_valid() {
        let options = PipelineOptions::default();
        assert!(options.sanitize().is_ok());
        assert_eq!(options.thread_name, "stagepipe");
        assert!(options.total_parallelism() >= 1);
    }

    #[test]
    fn test_shared_pool_size() {
        let options = PipelineOptions {
            total_parallelism: Some(8),
            ..Default::default()
        };
        assert_eq!(options.shared_pool_size(0), 7);
        assert_eq!(options.shared_pool_size(2), 5);
        assert_eq!(options.shared_pool_size(20), 1);

        let explicit = options.with_pool_size(4);
        assert_eq!(explicit.shared_pool_size(1), 3);
        assert_eq!(explicit.shared_pool_size(4), 1);
    }

    #[test]
    fn test_sanitize_rejects_zero_and_empty() {
        assert!(PipelineOptions::default().with_pool_size(0).sanitize().is_err());

        let options = PipelineOptions {
            total_parallelism: Some(0),
            ..Default::default()
        };
        assert!(options.sanitize().is_err());

        let options = PipelineOptions {
            thread_name: "  ".into(),
            ..Default::default()
        };
        assert!(matches!(options.sanitize(), Err(StagepipeError::Config(_))));
    }

    #[test]
    fn test_from_file_partial() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"pool_size": 3}"#).unwrap();

        let options = PipelineOptions::from_file(&path).unwrap();
        assert_eq!(options.pool_size, Some(3));
        assert_eq!(options.thread_name, "stagepipe");
    }

    #[test]
    fn test_from_file_errors() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.json");
        assert!(matches!(
            PipelineOptions::from_file(&missing),
            Err(StagepipeError::Io(_))
        ));

        let bad = temp_dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        let err = PipelineOptions::from_file(&bad).unwrap_err();
        assert!(err.to_string().contains("bad.json"));
    }
}
