//! Allocation sequences for stratified block randomization.
//!
//! Each arm first receives `floor(n * p_k)` slots. The remaining slots are
//! placed by systematic sampling over the fractional remainders: one uniform
//! offset `u` and the points `u, u + 1, ...` laid over the cumulative
//! remainders. An arm's span is shorter than one, so it gains at most one slot
//! and gains it with probability equal to its remainder. Realized counts
//! differ from `n * p_k` by less than one while the expected count is exactly
//! `n * p_k`.

use rand::{seq::SliceRandom, Rng};

/// Builds a shuffled arm-index sequence of length `n` for `allocation`.
///
/// `allocation` must be non-negative and sum to one; domains guarantee this.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn allocation_sequence<R: Rng + ?Sized>(
    n: usize,
    allocation: &[f64],
    rng: &mut R,
) -> Vec<usize> {
    let targets: Vec<f64> = allocation.iter().map(|p| p * n as f64).collect();
    let mut counts: Vec<usize> = targets.iter().map(|t| t.floor() as usize).collect();
    let assigned: usize = counts.iter().sum();
    let remainders: Vec<f64> = targets
        .iter()
        .zip(&counts)
        .map(|(t, c)| (t - *c as f64).max(0.0))
        .collect();

    let extra = n.saturating_sub(assigned);
    if extra > 0 {
        place_remainders(&mut counts, &remainders, extra, rng);
    }

    let mut sequence: Vec<usize> = counts
        .iter()
        .enumerate()
        .flat_map(|(arm, &count)| std::iter::repeat(arm).take(count))
        .collect();
    sequence.truncate(n);
    sequence.shuffle(rng);
    sequence
}

/// Systematic sampling of `extra` slots, at most one per arm.
#[allow(clippy::cast_precision_loss)]
fn place_remainders<R: Rng + ?Sized>(
    counts: &mut [usize],
    remainders: &[f64],
    extra: usize,
    rng: &mut R,
) {
    let total: f64 = remainders.iter().sum();
    let mut picked = vec![false; counts.len()];
    let mut placed = 0;
    if total > 0.0 {
        // Rescaled so the spans cover exactly `extra` despite rounding.
        let scale = extra as f64 / total;
        let offset: f64 = rng.gen();
        let mut cumulative = 0.0;
        for (arm, remainder) in remainders.iter().enumerate() {
            cumulative += remainder * scale;
            if placed < extra && offset + (placed as f64) < cumulative {
                counts[arm] += 1;
                picked[arm] = true;
                placed += 1;
            }
        }
    }
    // Rounding can leave a slot unplaced; it goes to the largest unpicked remainder.
    while placed < extra {
        let Some(arm) = (0..counts.len())
            .filter(|&arm| !picked[arm])
            .max_by(|&a, &b| remainders[a].total_cmp(&remainders[b]))
        else {
            break;
        };
        counts[arm] += 1;
        picked[arm] = true;
        placed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::seeded_rng;

    fn counts(sequence: &[usize], arms: usize) -> Vec<usize> {
        let mut counts = vec![0; arms];
        for &arm in sequence {
            counts[arm] += 1;
        }
        counts
    }

    #[test]
    fn exact_multiples_are_exact() {
        let mut rng = seeded_rng(1);
        let allocation = [2.0 / 6.0, 1.0 / 6.0, 1.0 / 6.0, 1.0 / 6.0, 1.0 / 6.0];
        let sequence = allocation_sequence(60, &allocation, &mut rng);
        assert_eq!(sequence.len(), 60);
        assert_eq!(counts(&sequence, 5), vec![20, 10, 10, 10, 10]);
    }

    #[test]
    fn counts_stay_within_one_of_target() {
        let mut rng = seeded_rng(2);
        let allocation = [0.5, 0.3, 0.2];
        for n in [0, 1, 2, 7, 13, 101] {
            let sequence = allocation_sequence(n, &allocation, &mut rng);
            assert_eq!(sequence.len(), n);
            for (arm, count) in counts(&sequence, 3).into_iter().enumerate() {
                let target = allocation[arm] * n as f64;
                assert!((count as f64 - target).abs() < 1.0, "n={n} arm={arm}");
            }
        }
    }

    #[test]
    fn remainder_slots_follow_allocation_on_average() {
        let mut rng = seeded_rng(3);
        let allocation = [0.5, 0.25, 0.25];
        let mut totals = [0usize; 3];
        for _ in 0..4_000 {
            for arm in allocation_sequence(1, &allocation, &mut rng) {
                totals[arm] += 1;
            }
        }
        assert!((totals[0] as f64 / 4_000.0 - 0.5).abs() < 0.03);
        assert!((totals[1] as f64 / 4_000.0 - 0.25).abs() < 0.03);
    }

    #[test]
    fn expected_counts_match_targets_with_uneven_remainders() {
        let mut rng = seeded_rng(5);
        let calls = 20_000;
        let mut mean_counts = |n: usize, allocation: &[f64]| -> Vec<f64> {
            let mut totals = vec![0usize; allocation.len()];
            for _ in 0..calls {
                for arm in allocation_sequence(n, allocation, &mut rng) {
                    totals[arm] += 1;
                }
            }
            totals.iter().map(|&t| t as f64 / calls as f64).collect()
        };

        let three = mean_counts(2, &[0.45, 0.45, 0.1]);
        assert!((three[2] - 0.2).abs() < 0.015, "rare arm {}", three[2]);
        assert!((three[0] - 0.9).abs() < 0.015);

        let sixth = 1.0 / 6.0;
        let five = mean_counts(5, &[2.0 * sixth, sixth, sixth, sixth, sixth]);
        assert!((five[0] - 5.0 / 3.0).abs() < 0.02, "control {}", five[0]);
        for count in &five[1..] {
            assert!((count - 5.0 / 6.0).abs() < 0.02);
        }
    }

    #[test]
    fn sequences_are_shuffled() {
        let mut rng = seeded_rng(4);
        let sequence = allocation_sequence(200, &[0.5, 0.5], &mut rng);
        let sorted = {
            let mut s = sequence.clone();
            s.sort_unstable();
            s
        };
        assert_ne!(sequence, sorted);
    }
}
