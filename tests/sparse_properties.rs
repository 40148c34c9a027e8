//! Property-based tests for the sparse matrix primitives used by the sampler.

use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sparse_sage::sparse::{Dim, SparseMatrix};

/// A graph on `n` nodes with up to 60 edges, duplicates allowed.
fn arb_graph() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (1usize..20).prop_flat_map(|n| (Just(n), prop::collection::vec((0..n, 0..n), 0..60)))
}

fn to_matrix(n: usize, edges: &[(usize, usize)]) -> SparseMatrix {
    let (src, dst) = edges.iter().copied().unzip();
    SparseMatrix::from_edges(src, dst, n).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn coalesce_keeps_values_and_removes_duplicates((n, edges) in arb_graph()) {
        let a = to_matrix(n, &edges);
        let c = a.coalesce();

        prop_assert_eq!(a.to_dense(), c.to_dense());
        let coords = c.entries().map(|(r, col, _)| (r, col)).collect::<Vec<_>>();
        let mut sorted = coords.clone();
        sorted.sort_unstable();
        sorted.dedup();
        prop_assert_eq!(coords, sorted);
    }

    #[test]
    fn sampling_with_replacement_draws_fanout_real_edges(
        (n, edges) in arb_graph(),
        fanout in 1usize..6,
        seed in any::<u64>(),
    ) {
        let a = to_matrix(n, &edges);
        let ids = (0..n).step_by(2).collect::<Vec<_>>();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let s = a.sample(Dim::Column, fanout, &ids, true, &mut rng).unwrap();

        prop_assert_eq!(s.shape(), (n, ids.len()));
        let edge_set = edges.iter().copied().collect::<BTreeSet<_>>();
        for (r, line, _) in s.entries() {
            prop_assert!(edge_set.contains(&(r, ids[line])));
        }

        let in_degree = a.column_sums();
        let drawn = s.column_sums();
        for (line, &id) in ids.iter().enumerate() {
            let expected = if in_degree[id] > 0.0 { fanout as f32 } else { 0.0 };
            prop_assert_eq!(drawn[line], expected);
        }
    }

    #[test]
    fn sampling_without_replacement_never_exceeds_degree(
        (n, edges) in arb_graph(),
        fanout in 1usize..6,
        seed in any::<u64>(),
    ) {
        let a = to_matrix(n, &edges);
        let ids = (0..n).collect::<Vec<_>>();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let s = a.sample(Dim::Column, fanout, &ids, false, &mut rng).unwrap();

        let in_degree = a.column_sums();
        for (c, drawn) in s.column_sums().into_iter().enumerate() {
            prop_assert_eq!(drawn, in_degree[c].min(fanout as f32));
        }
    }

    #[test]
    fn compact_puts_leading_ids_first_and_preserves_entries(
        (n, edges) in arb_graph(),
        take in 0usize..5,
    ) {
        let a = to_matrix(n, &edges);
        let leading = (0..n).rev().take(take).collect::<Vec<_>>();
        let (c, mapping) = a.compact(Dim::Row, &leading).unwrap();

        prop_assert_eq!(&mapping[..leading.len()], &leading[..]);
        prop_assert_eq!(c.shape(), (mapping.len(), n));

        let rest = &mapping[leading.len()..];
        prop_assert!(rest.windows(2).all(|w| w[0] < w[1]));

        let mut original = HashMap::new();
        for (r, col, v) in a.entries() {
            *original.entry((r, col)).or_insert(0.0) += v;
        }
        let mut relabeled = HashMap::new();
        for (r, col, v) in c.entries() {
            *relabeled.entry((mapping[r], col)).or_insert(0.0) += v;
        }
        prop_assert_eq!(original, relabeled);
    }
}
