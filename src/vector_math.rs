use std::cmp::Ordering;

/// Cosine similarity; `0.0` for empty, mismatched or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;

    if denom <= f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

/// Descending score, then ascending id. Total even with NaN scores.
pub fn by_score_then_id(
    left_score: f32,
    left_id: &str,
    right_score: f32,
    right_id: &str,
) -> Ordering {
    right_score
        .total_cmp(&left_score)
        .then_with(|| left_id.cmp(right_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(left: f32, right: f32) -> bool {
        (left - right).abs() < 1e-5
    }

    #[test]
    fn cosine_is_one_for_identical_vectors() {
        let vec = vec![1.0, 2.0, 3.0, 4.0];
        assert!(approx_eq(cosine_similarity(&vec, &vec), 1.0));
    }

    #[test]
    fn cosine_is_zero_for_orthogonal_or_mismatched_vectors() {
        assert!(approx_eq(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0));
        assert!(approx_eq(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0));
        assert!(approx_eq(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0));
    }

    #[test]
    fn ties_break_by_id() {
        let mut items = vec![(0.5, "b"), (0.9, "z"), (0.5, "a")];
        items.sort_by(|l, r| by_score_then_id(l.0, l.1, r.0, r.1));
        let ids: Vec<&str> = items.iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }
}
