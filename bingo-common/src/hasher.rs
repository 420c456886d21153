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

use std::hash::Hasher;

use twox_hash::XxHash64;

/// Stable 64-bit hash of the concatenation of the given parts.
///
/// Unlike [`std::collections::hash_map::DefaultHasher`], the result never changes across processes, platforms or
/// releases, so it can be used to bucket users deterministically.
pub fn stable_hash(parts: &[&str]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    for part in parts {
        hasher.write(part.as_bytes());
    }
    hasher.finish()
}

/// Map the given key onto one of `buckets` buckets.
///
/// # Panics
///
/// Panics if `buckets` is zero.
pub fn bucket_of(key: &str, buckets: usize) -> usize {
    assert!(buckets > 0, "bucket count must be positive");
    (stable_hash(&[key]) % buckets as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_hash_concatenates() {
        assert_eq!(stable_hash(&["gorillas", "user-1"]), stable_hash(&["gorillasuser-1"]));
        assert_eq!(stable_hash(&["gorillas", "user-1"]), stable_hash(&["gori", "llasuser", "-1"]));
        assert_ne!(stable_hash(&["gorillas", "user-1"]), stable_hash(&["gorillas", "user-2"]));
    }

    #[test]
    fn test_bucket_of() {
        let mut seen = [0usize; 7];
        for i in 0..7000 {
            let bucket = bucket_of(&format!("user-{i}"), 7);
            seen[bucket] += 1;
        }
        for count in seen {
            assert!((700..1300).contains(&count), "bucket count out of range: {count}");
        }
    }
}
