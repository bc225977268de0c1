//! Block error taxonomy.

use std::fmt;

use thiserror::Error;

/// Errors returned by block operations.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Transient failure. The message carries the retry sentinel so the
    /// default retry predicate matches it.
    #[error("please retry: {0}")]
    Transient(String),

    /// Missing or invalid input. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// A structural conflict that was detected and corrected, such as a
    /// concurrent membership change.
    #[error("structural conflict: {0}")]
    Structural(String),

    /// The operation has not been built for this block.
    #[error("{operation} is not implemented for block [{block}]")]
    NotImplemented {
        block: String,
        operation: &'static str,
    },

    /// Every failure from a fan-out.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// A stage of a plan failed.
    #[error("{stage}: {source}")]
    Stage {
        stage: String,
        source: Box<BlockError>,
    },

    /// A child task panicked or was aborted.
    #[error("block task failed: {0}")]
    Join(String),

    /// The plan was cancelled before the named stage started.
    #[error("cancelled before [{0}]")]
    Cancelled(String),

    /// Any other failure, with call-site context attached.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl BlockError {
    /// Shorthand for a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true if the error, or the stage it wraps, is a configuration error.
    pub fn is_config(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::Stage { source, .. } => source.is_config(),
            _ => false,
        }
    }
}

/// Collection of errors gathered from concurrently executed blocks.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<BlockError>,
}

impl AggregateError {
    pub fn push(&mut self, err: BlockError) {
        self.errors.push(err);
    }

    pub fn errors(&self) -> &[BlockError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(())` when nothing failed, otherwise the aggregate as an error.
    pub fn into_result(self) -> Result<(), BlockError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(BlockError::Aggregate(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{} error(s): [{}]", self.errors.len(), messages.join("; "))
    }
}

impl std::error::Error for AggregateError {}

impl FromIterator<BlockError> for AggregateError {
    fn from_iter<I: IntoIterator<Item = BlockError>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_display_keeps_every_message() {
        let agg: AggregateError = vec![
            BlockError::transient("etcd not ready"),
            BlockError::config("missing CA [etcd-peer]"),
        ]
        .into_iter()
        .collect();

        let text = agg.to_string();
        assert!(text.starts_with("2 error(s)"));
        assert!(text.contains("etcd not ready"));
        assert!(text.contains("missing CA [etcd-peer]"));
    }

    #[test]
    fn test_empty_aggregate_is_ok() {
        assert!(AggregateError::default().into_result().is_ok());
    }

    #[test]
    fn test_config_detected_through_stage() {
        let err = BlockError::Stage {
            stage: "etcd".to_string(),
            source: Box::new(BlockError::config("no peers")),
        };
        assert!(err.is_config());
        assert!(!BlockError::transient("x").is_config());
    }
}
