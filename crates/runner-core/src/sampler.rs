//! Token sampling: top-k/top-p nucleus sampling (kept from the batched
//! engine's original sampler) plus the speculative decoding accept/reject
//! rule and residual resampling (§4.7).

use rand::Rng;

/// Samples one token id from `logits` under temperature + top-k + top-p.
pub fn sample_top_k_top_p<R: Rng + ?Sized>(
    rng: &mut R,
    logits: &[f32],
    top_k: usize,
    top_p: f32,
    temperature: f32,
) -> usize {
    if logits.is_empty() {
        return 0;
    }
    let probs = softmax_top_k_top_p(logits, top_k, top_p, temperature);
    sample_from_distribution(rng, &probs)
}

/// Full softmax distribution over `logits` after temperature scaling,
/// restricted to the top-k / top-p candidate set and renormalized. Indices
/// outside the candidate set get probability 0 (not omitted), so the result
/// is always `logits.len()` long and directly usable as `p`/`q` in the
/// speculative accept rule.
pub fn softmax_top_k_top_p(logits: &[f32], top_k: usize, top_p: f32, temperature: f32) -> Vec<f32> {
    if logits.is_empty() {
        return Vec::new();
    }
    let temperature = temperature.max(1e-4);
    let mut pairs: Vec<(usize, f32)> = logits.iter().enumerate().map(|(i, &l)| (i, l / temperature)).collect();
    pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

    let cutoff = if top_k > 0 { pairs.len().min(top_k) } else { pairs.len() };
    let max_logit = pairs[0].1;
    let mut exp_sum = 0.0f32;
    let mut candidates: Vec<(usize, f32)> = Vec::with_capacity(cutoff);
    for &(i, l) in &pairs[..cutoff] {
        let p = (l - max_logit).exp();
        candidates.push((i, p));
        exp_sum += p;
    }
    for c in &mut candidates {
        c.1 /= exp_sum.max(1e-9);
    }
    if top_p < 1.0 {
        let mut acc = 0.0f32;
        let mut keep = 0;
        for &(_, p) in &candidates {
            acc += p;
            keep += 1;
            if acc >= top_p {
                break;
            }
        }
        candidates.truncate(keep.max(1));
        let z: f32 = candidates.iter().map(|c| c.1).sum();
        for c in &mut candidates {
            c.1 /= z.max(1e-9);
        }
    }

    let mut dist = vec![0.0f32; logits.len()];
    for (i, p) in candidates {
        dist[i] = p;
    }
    dist
}

/// Samples an index from a precomputed probability distribution (falls back
/// to the argmax on floating-point rounding that leaves `r` above the
/// cumulative sum).
pub fn sample_from_distribution<R: Rng + ?Sized>(rng: &mut R, probs: &[f32]) -> usize {
    let r: f32 = rng.gen();
    let mut acc = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        acc += p;
        if r <= acc {
            return i;
        }
    }
    probs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// One position's speculative accept/reject decision (§4.7): accepts while
/// `u <= min(1, p_j / q_j)`. `p` and `q` are the target and draft
/// distributions at this position (length vocab, as returned by
/// `softmax_top_k_top_p`); `token` is the draft's proposed token.
pub fn accept_proposed_token<R: Rng + ?Sized>(rng: &mut R, p: &[f32], q: &[f32], token: usize) -> bool {
    let p_j = p.get(token).copied().unwrap_or(0.0);
    let q_j = q.get(token).copied().unwrap_or(0.0);
    if q_j <= 0.0 {
        return p_j > 0.0;
    }
    let threshold = (p_j / q_j).min(1.0);
    let u: f32 = rng.gen();
    u <= threshold
}

/// On the first rejected position, resamples from the residual distribution
/// `normalize(max(0, p - q))` (§4.7) rather than from `p` directly.
pub fn sample_residual<R: Rng + ?Sized>(rng: &mut R, p: &[f32], q: &[f32]) -> usize {
    let mut residual: Vec<f32> = p.iter().zip(q).map(|(&pv, &qv)| (pv - qv).max(0.0)).collect();
    let sum: f32 = residual.iter().sum();
    if sum <= 0.0 {
        // every target mass already covered by the draft: fall back to p.
        return sample_from_distribution(rng, p);
    }
    for r in &mut residual {
        *r /= sum;
    }
    sample_from_distribution(rng, &residual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn greedy_softmax_concentrates_on_argmax_at_low_temperature() {
        let logits = vec![0.0, 5.0, 1.0];
        let dist = softmax_top_k_top_p(&logits, 0, 1.0, 0.05);
        let argmax = dist.iter().enumerate().max_by(|a, b| a.1.partial_cmp(b.1).unwrap()).unwrap().0;
        assert_eq!(argmax, 1);
        assert!(dist[1] > 0.99);
    }

    #[test]
    fn top_k_zeroes_out_excluded_candidates() {
        let logits = vec![5.0, 4.0, 3.0, 2.0, 1.0];
        let dist = softmax_top_k_top_p(&logits, 2, 1.0, 1.0);
        assert_eq!(dist[2], 0.0);
        assert_eq!(dist[3], 0.0);
        assert_eq!(dist[4], 0.0);
        assert!((dist.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn sample_top_k_top_p_is_deterministic_with_a_seeded_rng() {
        let logits = vec![0.1, 0.2, 0.3, 0.4];
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let first = sample_top_k_top_p(&mut a, &logits, 0, 1.0, 1.0);
        let second = sample_top_k_top_p(&mut b, &logits, 0, 1.0, 1.0);
        assert_eq!(first, second);
    }

    #[test]
    fn accept_rule_always_accepts_when_draft_underestimates_target() {
        let mut rng = StdRng::seed_from_u64(1);
        let p = vec![0.0, 1.0];
        let q = vec![0.5, 0.5];
        assert!(accept_proposed_token(&mut rng, &p, &q, 1));
    }

    #[test]
    fn accept_rule_rejects_when_draft_token_has_zero_target_mass() {
        let mut rng = StdRng::seed_from_u64(1);
        let p = vec![1.0, 0.0];
        let q = vec![0.5, 0.5];
        assert!(!accept_proposed_token(&mut rng, &p, &q, 1));
    }

    #[test]
    fn residual_sampling_avoids_the_rejected_token_when_target_disagrees() {
        let mut rng = StdRng::seed_from_u64(7);
        let p = vec![1.0, 0.0, 0.0];
        let q = vec![0.0, 0.5, 0.5];
        for _ in 0..20 {
            let sampled = sample_residual(&mut rng, &p, &q);
            assert_eq!(sampled, 0);
        }
    }

    #[test]
    fn accept_rule_statistically_matches_target_distribution_when_draft_equals_target() {
        // K=0-equivalent sanity check (§8): with q == p the accept rate
        // should be close to 100%.
        let mut rng = StdRng::seed_from_u64(42);
        let p = vec![0.2, 0.3, 0.5];
        let q = p.clone();
        let mut accepted = 0;
        let trials = 2000;
        for _ in 0..trials {
            if accept_proposed_token(&mut rng, &p, &q, 2) {
                accepted += 1;
            }
        }
        assert!(accepted as f32 / trials as f32 > 0.95);
    }
}
