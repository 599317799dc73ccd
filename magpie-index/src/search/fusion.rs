//! Reciprocal rank fusion.
//!
//! Lexical and vector scores are not comparable, so the retriever never
//! mixes raw scores. Each ranked list contributes `1 / (c + rank)` per
//! chunk (1-indexed rank, constant `c` damping the top positions); a chunk
//! absent from a list contributes nothing from it. The constant 60 is the
//! standard value from Cormack, Clarke & Buettcher (SIGIR 2009).
//!
//! Ordering is fully deterministic: descending fused score, then the
//! smaller minimum rank across lists, then ascending chunk id.

use itertools::Itertools;
use std::collections::HashMap;

/// Standard damping constant.
pub const RRF_CONSTANT: u32 = 60;

/// One fused result.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub chunk_id: i64,
    pub score: f64,
    /// Best (smallest) 1-based rank this chunk held in any input list.
    pub min_rank: usize,
}

/// Fuse any number of ranked lists. Input lists are (chunk id, raw score)
/// in rank order; raw scores are ignored, only positions matter.
pub fn reciprocal_rank_fusion(lists: &[&[(i64, f32)]], c: u32) -> Vec<FusedHit> {
    let c = c as f64;
    let mut fused: HashMap<i64, (f64, usize)> = HashMap::new();

    for list in lists {
        for (rank0, (chunk_id, _raw)) in list.iter().enumerate() {
            let rank = rank0 + 1;
            let contribution = 1.0 / (c + rank as f64);
            let entry = fused.entry(*chunk_id).or_insert((0.0, usize::MAX));
            entry.0 += contribution;
            entry.1 = entry.1.min(rank);
        }
    }

    fused
        .into_iter()
        .map(|(chunk_id, (score, min_rank))| FusedHit {
            chunk_id,
            score,
            min_rank,
        })
        .sorted_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.min_rank.cmp(&b.min_rank))
                .then(a.chunk_id.cmp(&b.chunk_id))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fusion_matches_the_worked_example() {
        // Lexical ranks [c1, c2], vector ranks [c2, c3], c = 60:
        //   c1: 1/61, c2: 1/62 + 1/61, c3: 1/62 → order c2, c1, c3.
        let lexical: Vec<(i64, f32)> = vec![(1, 9.0), (2, 4.0)];
        let vector: Vec<(i64, f32)> = vec![(2, 0.97), (3, 0.81)];

        let fused = reciprocal_rank_fusion(&[&lexical, &vector], 60);

        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].chunk_id, 2);
        assert_eq!(fused[1].chunk_id, 1);
        assert_eq!(fused[2].chunk_id, 3);

        let eps = 1e-12;
        assert!((fused[0].score - (1.0 / 62.0 + 1.0 / 61.0)).abs() < eps);
        assert!((fused[1].score - 1.0 / 61.0).abs() < eps);
        assert!((fused[2].score - 1.0 / 62.0).abs() < eps);
    }

    #[test]
    fn empty_lexical_list_reduces_to_vector_order() {
        let lexical: Vec<(i64, f32)> = vec![];
        let vector: Vec<(i64, f32)> = vec![(5, 0.9), (3, 0.8), (9, 0.7)];

        let fused = reciprocal_rank_fusion(&[&lexical, &vector], 60);
        let order: Vec<i64> = fused.iter().map(|h| h.chunk_id).collect();
        assert_eq!(order, vec![5, 3, 9]);
    }

    #[test]
    fn empty_vector_list_reduces_to_lexical_order() {
        let lexical: Vec<(i64, f32)> = vec![(4, 3.0), (8, 2.0)];
        let vector: Vec<(i64, f32)> = vec![];

        let fused = reciprocal_rank_fusion(&[&lexical, &vector], 60);
        let order: Vec<i64> = fused.iter().map(|h| h.chunk_id).collect();
        assert_eq!(order, vec![4, 8]);
    }

    #[test]
    fn both_empty_fuses_to_nothing() {
        let fused = reciprocal_rank_fusion(&[&[], &[]], 60);
        assert!(fused.is_empty());
    }

    #[test]
    fn fusion_is_deterministic() {
        let lexical: Vec<(i64, f32)> = vec![(1, 5.0), (2, 4.0), (3, 3.0)];
        let vector: Vec<(i64, f32)> = vec![(3, 0.9), (2, 0.8), (1, 0.7)];

        let a = reciprocal_rank_fusion(&[&lexical, &vector], 60);
        let b = reciprocal_rank_fusion(&[&lexical, &vector], 60);
        assert_eq!(a, b);
    }

    #[test]
    fn ties_break_by_min_rank_then_chunk_id() {
        // Two chunks each appearing once at the same rank in different
        // lists: identical scores and min ranks, so ids decide.
        let lexical: Vec<(i64, f32)> = vec![(7, 1.0)];
        let vector: Vec<(i64, f32)> = vec![(2, 1.0)];

        let fused = reciprocal_rank_fusion(&[&lexical, &vector], 60);
        assert_eq!(fused[0].chunk_id, 2);
        assert_eq!(fused[1].chunk_id, 7);

        // Symmetric ranks across lists fuse to equal scores; the chunk
        // whose best rank is smaller wins.
        let lexical: Vec<(i64, f32)> = vec![(1, 2.0), (2, 1.0), (3, 0.5)];
        let vector: Vec<(i64, f32)> = vec![(3, 0.9), (2, 0.8)];
        let fused = reciprocal_rank_fusion(&[&lexical, &vector], 60);
        // c2: 1/62 + 1/62, c3: 1/63 + 1/61 — c2 wins on score alone; c1
        // (1/61) beats c3 on score too.
        let order: Vec<i64> = fused.iter().map(|h| h.chunk_id).collect();
        assert_eq!(order[0], 2);
    }

    #[test]
    fn raw_scores_do_not_influence_fusion() {
        let huge: Vec<(i64, f32)> = vec![(1, 1_000_000.0), (2, 0.0001)];
        let tiny: Vec<(i64, f32)> = vec![(1, 0.5), (2, 0.4)];

        let a = reciprocal_rank_fusion(&[&huge], 60);
        let b = reciprocal_rank_fusion(&[&tiny], 60);
        assert_eq!(a[0].chunk_id, b[0].chunk_id);
        assert!((a[0].score - b[0].score).abs() < 1e-12);
    }
}
