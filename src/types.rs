//! Core identifiers for the claimweave pipeline.
//!
//! This module defines the small vocabulary shared across the crate: which
//! stage of the pipeline a piece of work belongs to ([`StageKind`]) and how
//! the deduplicated tree is ordered ([`SortStrategy`]).
//!
//! # Examples
//!
//! ```rust
//! use claimweave::types::{StageKind, SortStrategy};
//!
//! // Stages execute strictly in declaration order.
//! assert_eq!(StageKind::ALL[0], StageKind::Clustering);
//!
//! // Stage names are stable — they key step analytics and completed results
//! // in the persisted state.
//! assert_eq!(StageKind::SortAndDeduplicate.as_str(), "sort_and_deduplicate");
//!
//! let strategy = SortStrategy::default();
//! assert_eq!(strategy, SortStrategy::NumPeople);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the four pipeline stages, in execution order.
///
/// The string forms returned by [`as_str`](Self::as_str) are part of the
/// persisted state contract: they key `stepAnalytics` and `completedResults`
/// and appear in the validation-failure counter keys. They must never change
/// without a schema-version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Stage 1: derive a topic/subtopic taxonomy from the raw comments.
    Clustering,
    /// Stage 2: extract claims per comment and slot them into the taxonomy.
    Claims,
    /// Stage 3: group near-duplicate claims and order the tree.
    SortAndDeduplicate,
    /// Stage 4: one short natural-language summary per topic.
    Summaries,
}

impl StageKind {
    /// All stages in the order the runner executes them.
    pub const ALL: [StageKind; 4] = [
        StageKind::Clustering,
        StageKind::Claims,
        StageKind::SortAndDeduplicate,
        StageKind::Summaries,
    ];

    /// Stable snake_case name used in persisted keys and analytics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Clustering => "clustering",
            StageKind::Claims => "claims",
            StageKind::SortAndDeduplicate => "sort_and_deduplicate",
            StageKind::Summaries => "summaries",
        }
    }

    /// Parse a stable stage name back into its kind.
    #[must_use]
    pub fn parse(s: &str) -> Option<StageKind> {
        match s {
            "clustering" => Some(StageKind::Clustering),
            "claims" => Some(StageKind::Claims),
            "sort_and_deduplicate" => Some(StageKind::SortAndDeduplicate),
            "summaries" => Some(StageKind::Summaries),
            _ => None,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordering applied to topics and subtopics in the deduplicated tree.
///
/// Both levels sort descending by the selected count; ties keep the order in
/// which the nodes were first emitted (all sorts in the crate are stable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortStrategy {
    /// Order by the number of distinct speakers.
    #[default]
    NumPeople,
    /// Order by the number of claims.
    NumClaims,
}
