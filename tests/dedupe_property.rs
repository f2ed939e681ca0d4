//! Property tests for the deduplicated tree's ordering invariants.

use proptest::prelude::*;

use claimweave::stages::dedupe::order_tree;
use claimweave::taxonomy::{SortedSubtopic, SortedTopic, TreeCounts};
use claimweave::types::SortStrategy;

fn arb_counts() -> impl Strategy<Value = TreeCounts> {
    (0usize..50, 0usize..20).prop_map(|(claims, speakers)| TreeCounts { claims, speakers })
}

fn arb_subtopic() -> impl Strategy<Value = SortedSubtopic> {
    ("[a-z]{1,8}", arb_counts()).prop_map(|(name, counts)| SortedSubtopic {
        subtopic_name: name,
        claims: vec![],
        speakers: vec![],
        counts,
    })
}

fn arb_topic() -> impl Strategy<Value = SortedTopic> {
    (
        "[A-Z][a-z]{1,8}",
        prop::collection::vec(arb_subtopic(), 0..6),
        arb_counts(),
    )
        .prop_map(|(name, subtopics, counts)| SortedTopic {
            topic_name: name,
            subtopics,
            speakers: vec![],
            counts,
        })
}

fn key(counts: &TreeCounts, strategy: SortStrategy) -> usize {
    match strategy {
        SortStrategy::NumPeople => counts.speakers,
        SortStrategy::NumClaims => counts.claims,
    }
}

proptest! {
    /// The strategy count is non-increasing at both tree levels after
    /// ordering, under either strategy.
    #[test]
    fn ordered_counts_are_non_increasing(
        mut tree in prop::collection::vec(arb_topic(), 0..8),
        num_claims in any::<bool>(),
    ) {
        let strategy = if num_claims {
            SortStrategy::NumClaims
        } else {
            SortStrategy::NumPeople
        };
        order_tree(&mut tree, strategy);

        for window in tree.windows(2) {
            prop_assert!(key(&window[0].counts, strategy) >= key(&window[1].counts, strategy));
        }
        for topic in &tree {
            for window in topic.subtopics.windows(2) {
                prop_assert!(key(&window[0].counts, strategy) >= key(&window[1].counts, strategy));
            }
        }
    }

    /// Ordering is a permutation: nothing is added, dropped, or mutated.
    #[test]
    fn ordering_preserves_membership(
        tree in prop::collection::vec(arb_topic(), 0..8),
    ) {
        let mut ordered = tree.clone();
        order_tree(&mut ordered, SortStrategy::NumPeople);

        prop_assert_eq!(ordered.len(), tree.len());
        let mut before: Vec<String> = tree.iter().map(|t| t.topic_name.clone()).collect();
        let mut after: Vec<String> = ordered.iter().map(|t| t.topic_name.clone()).collect();
        before.sort();
        after.sort();
        prop_assert_eq!(before, after);
    }

    /// Ties keep their relative order (the sort is stable).
    #[test]
    fn ties_keep_emission_order(names in prop::collection::vec("[a-z]{1,6}", 2..10)) {
        let mut tree: Vec<SortedTopic> = names
            .iter()
            .map(|name| SortedTopic {
                topic_name: name.clone(),
                subtopics: vec![],
                speakers: vec![],
                counts: TreeCounts { claims: 7, speakers: 3 },
            })
            .collect();
        let expected: Vec<String> = tree.iter().map(|t| t.topic_name.clone()).collect();
        order_tree(&mut tree, SortStrategy::NumClaims);
        let got: Vec<String> = tree.iter().map(|t| t.topic_name.clone()).collect();
        prop_assert_eq!(got, expected);
    }
}
