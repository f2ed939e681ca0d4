//! Domain model for the topic/claim taxonomy.
//!
//! Stage 1 produces a [`Taxonomy`] (`Vec<Topic>`), stage 2 fills a
//! [`ClaimsTree`] keyed by the taxonomy's exact topic/subtopic names, stage 3
//! reorders it into a [`SortedTree`], and stage 4 attaches a
//! [`TopicSummary`] per topic.
//!
//! Claims only ever attach to topic/subtopic names that exist in the
//! taxonomy; the membership check goes through a [`TaxonomyIndex`] built once
//! per claims-stage invocation rather than scanning topic vectors per claim.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

/// An atomic assertion extracted from one comment, mapped to a
/// `(topic, subtopic)` pair of the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    /// The claim text (possibly rewritten during deduplication).
    pub claim: String,
    /// Supporting quote from the source comment.
    pub quote: String,
    /// Attributed speaker (`"Unknown"` when the comment carried none).
    pub speaker: String,
    pub topic_name: String,
    pub subtopic_name: String,
    /// Id of the comment this claim came from.
    pub comment_id: String,
    /// Near-restatements folded under this claim in stage 3.
    #[serde(default)]
    pub duplicates: Vec<Claim>,
    /// True on claims that were folded under a primary.
    #[serde(default)]
    pub duplicated: bool,
}

impl Claim {
    /// A fresh, non-duplicated claim with no duplicates attached.
    pub fn new(
        claim: impl Into<String>,
        quote: impl Into<String>,
        speaker: impl Into<String>,
        topic_name: impl Into<String>,
        subtopic_name: impl Into<String>,
        comment_id: impl Into<String>,
    ) -> Self {
        Self {
            claim: claim.into(),
            quote: quote.into(),
            speaker: speaker.into(),
            topic_name: topic_name.into(),
            subtopic_name: subtopic_name.into(),
            comment_id: comment_id.into(),
            duplicates: Vec::new(),
            duplicated: false,
        }
    }
}

/// A subtopic within a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtopic {
    pub subtopic_name: String,
    pub subtopic_short_description: String,
    #[serde(default)]
    pub claims: Vec<Claim>,
}

/// A top-level topic of the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub topic_name: String,
    pub topic_short_description: String,
    pub subtopics: Vec<Subtopic>,
}

/// The ordered topic list produced by the clustering stage.
pub type Taxonomy = Vec<Topic>;

/// Membership index over a taxonomy, built once per claims-stage invocation.
///
/// Claims referencing names absent from the index are rejected (counted as
/// unmatched), never inserted under fabricated nodes. Matching is exact:
/// casing and whitespace differences do not match.
#[derive(Debug, Default)]
pub struct TaxonomyIndex {
    subtopics_by_topic: FxHashMap<String, FxHashSet<String>>,
}

impl TaxonomyIndex {
    #[must_use]
    pub fn build(taxonomy: &[Topic]) -> Self {
        let mut subtopics_by_topic: FxHashMap<String, FxHashSet<String>> = FxHashMap::default();
        for topic in taxonomy {
            let entry = subtopics_by_topic
                .entry(topic.topic_name.clone())
                .or_default();
            for subtopic in &topic.subtopics {
                entry.insert(subtopic.subtopic_name.clone());
            }
        }
        Self { subtopics_by_topic }
    }

    /// Exact-match membership test for a `(topic, subtopic)` pair.
    #[must_use]
    pub fn contains(&self, topic_name: &str, subtopic_name: &str) -> bool {
        self.subtopics_by_topic
            .get(topic_name)
            .is_some_and(|subs| subs.contains(subtopic_name))
    }
}

/// Claims collected under one subtopic of the [`ClaimsTree`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtopicClaims {
    pub total: usize,
    #[serde(default)]
    pub claims: Vec<Claim>,
}

/// Claims collected under one topic of the [`ClaimsTree`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicClaims {
    pub total: usize,
    #[serde(default)]
    pub subtopics: FxHashMap<String, SubtopicClaims>,
}

/// Output of the claims stage: claims grouped by the taxonomy's exact
/// topic/subtopic names.
///
/// Insertion order is not observable — the tree is a mapping, ordered later
/// by the sort/deduplicate stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimsTree {
    pub topics: FxHashMap<String, TopicClaims>,
}

impl ClaimsTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a claim under its `(topic, subtopic)` node, creating the node
    /// if this is the first claim for it and keeping totals current.
    ///
    /// The caller is responsible for membership-checking against the
    /// taxonomy first; the tree itself accepts any names it is given.
    pub fn insert(&mut self, claim: Claim) {
        let topic = self.topics.entry(claim.topic_name.clone()).or_default();
        topic.total += 1;
        let subtopic = topic
            .subtopics
            .entry(claim.subtopic_name.clone())
            .or_default();
        subtopic.total += 1;
        subtopic.claims.push(claim);
    }

    /// Fold another tree into this one. Used at batch joins: each comment
    /// task builds a partial tree, and the batch owner merges them
    /// single-writer.
    pub fn merge(&mut self, other: ClaimsTree) {
        for (topic_name, other_topic) in other.topics {
            let topic = self.topics.entry(topic_name).or_default();
            topic.total += other_topic.total;
            for (subtopic_name, other_subtopic) in other_topic.subtopics {
                let subtopic = topic.subtopics.entry(subtopic_name).or_default();
                subtopic.total += other_subtopic.total;
                subtopic.claims.extend(other_subtopic.claims);
            }
        }
    }

    /// Total number of claims in the tree.
    #[must_use]
    pub fn total_claims(&self) -> usize {
        self.topics.values().map(|t| t.total).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// Claim and distinct-speaker counts for a sorted node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeCounts {
    pub claims: usize,
    pub speakers: usize,
}

/// A subtopic after deduplication and ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortedSubtopic {
    pub subtopic_name: String,
    /// Claims ordered by duplicate count, descending.
    pub claims: Vec<Claim>,
    /// Distinct speakers across the subtopic's claims and their duplicates,
    /// in first-seen order.
    pub speakers: Vec<String>,
    pub counts: TreeCounts,
}

/// A topic after deduplication and ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortedTopic {
    pub topic_name: String,
    /// Subtopics ordered by the run's sort strategy, descending.
    pub subtopics: Vec<SortedSubtopic>,
    pub speakers: Vec<String>,
    pub counts: TreeCounts,
}

/// Output of the sort/deduplicate stage.
pub type SortedTree = Vec<SortedTopic>;

/// One topic summary produced by the final stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSummary {
    pub topic_name: String,
    pub summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(id: &str, topic: &str, subtopic: &str) -> Claim {
        Claim::new("text", "quote", "Speaker", topic, subtopic, id)
    }

    #[test]
    fn insert_keeps_totals_current() {
        let mut tree = ClaimsTree::new();
        tree.insert(claim("c1", "Transit", "Buses"));
        tree.insert(claim("c2", "Transit", "Buses"));
        tree.insert(claim("c3", "Transit", "Rail"));

        let topic = &tree.topics["Transit"];
        assert_eq!(topic.total, 3);
        assert_eq!(topic.subtopics["Buses"].total, 2);
        assert_eq!(topic.subtopics["Rail"].total, 1);
        assert_eq!(tree.total_claims(), 3);
    }

    #[test]
    fn merge_folds_partial_trees() {
        let mut left = ClaimsTree::new();
        left.insert(claim("c1", "Transit", "Buses"));

        let mut right = ClaimsTree::new();
        right.insert(claim("c2", "Transit", "Buses"));
        right.insert(claim("c3", "Housing", "Zoning"));

        left.merge(right);
        assert_eq!(left.total_claims(), 3);
        assert_eq!(left.topics["Transit"].subtopics["Buses"].total, 2);
        assert_eq!(left.topics["Housing"].total, 1);
    }

    #[test]
    fn index_is_exact_match_only() {
        let taxonomy = vec![Topic {
            topic_name: "Transit".into(),
            topic_short_description: "Getting around".into(),
            subtopics: vec![Subtopic {
                subtopic_name: "Buses".into(),
                subtopic_short_description: "Bus service".into(),
                claims: vec![],
            }],
        }];
        let index = TaxonomyIndex::build(&taxonomy);
        assert!(index.contains("Transit", "Buses"));
        assert!(!index.contains("transit", "Buses"));
        assert!(!index.contains("Transit", "Buses "));
        assert!(!index.contains("Transit", "Rail"));
    }
}
