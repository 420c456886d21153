// Copyright 2026 bingo Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deterministic weighted bucketing of identities into alternatives.

use bingo_common::hasher::stable_hash;
use itertools::Itertools;

/// Pick the alternative of `identity` among `(ordinal, weight)` pairs.
///
/// The pick is a pure function of the hashable name, the weights and the identity. Alternatives are walked from the
/// highest to the lowest weight, ties in ordinal order. Returns `None` if every weight is zero.
pub fn select(hashable_name: &str, identity: &str, weights: &[(u8, u32)]) -> Option<u8> {
    let total = weights.iter().map(|(_, weight)| *weight as u64).sum::<u64>();
    if total == 0 {
        return None;
    }

    let mut remainder = stable_hash(&[hashable_name, identity]) % total;
    for (number, weight) in weights
        .iter()
        .sorted_by(|(a, wa), (b, wb)| wb.cmp(wa).then(a.cmp(b)))
    {
        let weight = *weight as u64;
        if remainder < weight {
            return Some(*number);
        }
        remainder -= weight;
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_deterministic() {
        let weights = [(0, 1), (1, 1), (2, 1)];
        for i in 0..100 {
            let identity = format!("user-{i}");
            let first = select("gorillas", &identity, &weights);
            assert!(first.is_some());
            assert_eq!(first, select("gorillas", &identity, &weights));
        }
        assert_eq!(select("gorillas", "user", &[]), None);
        assert_eq!(select("gorillas", "user", &[(0, 0)]), None);
        assert_eq!(select("gorillas", "user", &[(3, 7)]), Some(3));
    }

    #[test]
    fn test_weight_order_does_not_depend_on_input_order() {
        let forward = [(0, 1), (1, 3), (2, 1)];
        let backward = [(2, 1), (1, 3), (0, 1)];
        for i in 0..200 {
            let identity = format!("user-{i}");
            assert_eq!(
                select("monkeys", &identity, &forward),
                select("monkeys", &identity, &backward)
            );
        }
    }

    fn distribution(weights: &[(u8, u32)], identities: usize) -> HashMap<u8, usize> {
        let mut counts = HashMap::new();
        for i in 0..identities {
            let number = select("distribution", &format!("identity-{i}"), weights).unwrap();
            *counts.entry(number).or_default() += 1;
        }
        counts
    }

    #[test]
    fn test_equal_weights() {
        let counts = distribution(&[(0, 1), (1, 1), (2, 1)], 300);
        for number in 0..3 {
            let count = counts.get(&number).copied().unwrap_or_default();
            assert!((60..=140).contains(&count), "alternative {number}: {count}");
        }
    }

    #[test]
    fn test_weighted_proportionality() {
        let identities = 20_000;
        let weights = [(0, 1), (1, 3), (2, 4)];
        let counts = distribution(&weights, identities);
        for (number, weight) in weights {
            let expected = identities as f64 * weight as f64 / 8.0;
            let actual = counts.get(&number).copied().unwrap_or_default() as f64;
            assert!((actual - expected).abs() / expected < 0.05, "alternative {number}: {actual} vs {expected}");
        }
    }
}
