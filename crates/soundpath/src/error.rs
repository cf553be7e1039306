//! Error types for the soundpath crate.
//!
//! This module provides a unified error type for scene construction, mesh
//! building and path computation.

use thiserror::Error;

/// Error type for soundpath operations.
#[derive(Debug, Error)]
pub enum SoundPathError {
    /// An input polygon ring is malformed (open, degenerate or self-intersecting).
    #[error("malformed geometry for {kind} #{id}: {reason}")]
    MalformedGeometry {
        /// Kind of input feature ("building", "ground zone", ...).
        kind: &'static str,
        /// Index of the feature in its input list.
        id: usize,
        /// Description of the defect.
        reason: String,
    },

    /// The triangulation of a cell envelope failed.
    #[error("mesh build failed: {message}")]
    MeshBuild {
        /// Description of the failure.
        message: String,
    },

    /// A coordinate lies outside the triangulated domain.
    #[error("position ({x}, {y}) is outside the scene envelope")]
    OutOfDomain {
        /// X ordinate of the query point.
        x: f64,
        /// Y ordinate of the query point.
        y: f64,
    },

    /// An invalid engine configuration was provided.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// Description of the invalid setting.
        message: String,
    },

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O operation on an output sink failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The output sink rejected a record.
    #[error("output sink error: {message}")]
    Sink {
        /// Description of the sink failure.
        message: String,
    },
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SoundPathError>;
